use cubecl::prelude::*;

use crate::kernels::forward::{
    ForwardKernelConfig, KvLoader, OnlineSoftmax, TileMatmul, UnitRoles, load_query_block,
    store_output_tile,
};

/// Fused attention forward over 16-bit Q, K and V.
///
/// One cube per (query block, query head, batch). `score_scale` is `log2(e) / sqrt(D)`.
#[cube(launch_unchecked)]
#[allow(clippy::too_many_arguments)]
pub fn fused_attention_forward<F: Float + 'static, TM: TileMatmul<F>, L: KvLoader>(
    query: &Tensor<Line<F>>,
    key: &Tensor<Line<F>>,
    value: &Tensor<Line<F>>,
    output: &mut Tensor<Line<F>>,
    score_scale: f32,
    seq_q: u32,
    seq_kv: u32,
    qo_heads: u32,
    kv_heads: u32,
    #[comptime] config: ForwardKernelConfig,
) {
    attention_block::<F, F, TM, L>(
        query,
        key,
        value,
        output,
        score_scale,
        seq_q,
        seq_kv,
        qo_heads,
        kv_heads,
        config,
    );
}

/// Fused attention forward over quantized Q and K.
///
/// The raw `Q·K^T` products are dequantized with `scale_query[batch, qo_head]` and
/// `scale_key[batch, kv_head]`, both read once per cube.
#[cube(launch_unchecked)]
#[allow(clippy::too_many_arguments)]
pub fn fused_attention_forward_quantized<
    F: Float + 'static,
    QK: CubePrimitive,
    TM: TileMatmul<F>,
    L: KvLoader,
>(
    query: &Tensor<Line<QK>>,
    key: &Tensor<Line<QK>>,
    value: &Tensor<Line<F>>,
    scale_query: &Tensor<f32>,
    scale_key: &Tensor<f32>,
    output: &mut Tensor<Line<F>>,
    score_scale: f32,
    seq_q: u32,
    seq_kv: u32,
    qo_heads: u32,
    kv_heads: u32,
    #[comptime] config: ForwardKernelConfig,
) {
    let batch: u32 = CUBE_POS_Z;
    let qo_head: u32 = CUBE_POS_Y;
    let kv_head: u32 = qo_head / (qo_heads / kv_heads);

    let dequant: f32 = scale_query[(batch * qo_heads + qo_head) as usize]
        * scale_key[(batch * kv_heads + kv_head) as usize];

    attention_block::<F, QK, TM, L>(
        query,
        key,
        value,
        output,
        score_scale * dequant,
        seq_q,
        seq_kv,
        qo_heads,
        kv_heads,
        config,
    );
}

/// Body shared by both entry points.
///
/// Every iteration over a K/V tile is split in two phases separated by cube barriers:
/// 1. consumers compute scores against the current key slot while producers fill the
///    other key slot with the next tile;
/// 2. consumers accumulate `P · V` from the current value slot while producers fill the
///    other value slot.
///
/// When [ForwardKernelConfig::values_with_keys] holds, producers issue both slots during
/// phase 1 instead and only wait on the value copy before the phase 2 barrier. Either
/// way a slot is only overwritten after every consumer is done reading it, and only read
/// after the producers waited on its copy.
#[cube]
#[allow(clippy::too_many_arguments)]
fn attention_block<F: Float, QK: CubePrimitive, TM: TileMatmul<F>, L: KvLoader>(
    query: &Tensor<Line<QK>>,
    key: &Tensor<Line<QK>>,
    value: &Tensor<Line<F>>,
    output: &mut Tensor<Line<F>>,
    score_scale: f32,
    seq_q: u32,
    seq_kv: u32,
    qo_heads: u32,
    kv_heads: u32,
    #[comptime] config: ForwardKernelConfig,
) {
    let head_dim = comptime!(config.geometry.head_dim);
    let kv_height = comptime!(config.geometry.kv_height);
    let stages = comptime!(config.geometry.stages);
    let block_rows = comptime!(config.geometry.block_rows());
    let tile_elems = comptime!(config.geometry.kv_tile_elems());
    let values_with_keys = comptime!(config.values_with_keys());

    let batch: u32 = CUBE_POS_Z;
    let qo_head: u32 = CUBE_POS_Y;
    let kv_head: u32 = qo_head / (qo_heads / kv_heads);
    let block_start: u32 = CUBE_POS_X * block_rows;

    let q_head_offset: u32 = (batch * qo_heads + qo_head) * seq_q * head_dim;
    let kv_head_offset: u32 = (batch * kv_heads + kv_head) * seq_kv * head_dim;

    let roles = UnitRoles::new(config.geometry);

    // Q lives here until the last score, then the same space receives O
    let mut qo_arena = SharedMemory::<F>::new(comptime!((block_rows * head_dim) as usize));
    let mut key_slots = SharedMemory::<QK>::new(comptime!((stages * tile_elems) as usize));
    let mut value_slots = SharedMemory::<F>::new(comptime!((stages * tile_elems) as usize));

    let kv_iterations: u32 = kv_iteration_count(block_start, seq_kv, config);
    let key_barrier = L::create_barrier();
    let value_barrier = L::create_barrier();

    if roles.is_producer() {
        let producer_index = roles.producer_index();
        load_query_block::<QK, F>(
            query,
            &mut qo_arena,
            q_head_offset,
            block_start,
            seq_q,
            producer_index,
            config,
        );
        L::load_tile::<QK>(
            key,
            &mut key_slots,
            &key_barrier,
            kv_head_offset,
            0u32,
            seq_kv,
            producer_index,
            config,
        );
        L::load_tile::<F>(
            value,
            &mut value_slots,
            &value_barrier,
            kv_head_offset,
            0u32,
            seq_kv,
            producer_index,
            config,
        );
        L::wait(&key_barrier);
        L::wait(&value_barrier);
    }
    sync_cube();

    let query_row: u32 = roles.consumer_row();
    let query_pos: u32 = block_start + query_row;
    let qo_height = comptime!(config.geometry.qo_height);
    let group_start: u32 = block_start + roles.consumer_group() * qo_height;

    let mut softmax = OnlineSoftmax::new(head_dim);
    let mut scores = Array::<f32>::new(comptime!(kv_height as usize));
    let mut scratch = TM::init_scratch(config);

    let mut kv_tile: u32 = 0u32;
    while kv_tile < kv_iterations {
        let slot_offset: u32 = (kv_tile % stages) * tile_elems;
        let next_tile: u32 = kv_tile + 1u32;
        let has_next: bool = next_tile < kv_iterations;

        if roles.is_producer() {
            if has_next {
                let producer_index = roles.producer_index();
                L::load_tile::<QK>(
                    key,
                    &mut key_slots,
                    &key_barrier,
                    kv_head_offset,
                    next_tile,
                    seq_kv,
                    producer_index,
                    config,
                );
                if comptime!(values_with_keys) {
                    L::load_tile::<F>(
                        value,
                        &mut value_slots,
                        &value_barrier,
                        kv_head_offset,
                        next_tile,
                        seq_kv,
                        producer_index,
                        config,
                    );
                }
            }
            L::wait(&key_barrier);
        } else {
            TM::scores::<QK>(
                &qo_arena,
                &key_slots,
                &mut scores,
                &mut scratch,
                query_row,
                slot_offset,
                score_scale,
                config,
            );
            mask_scores(
                &mut scores,
                query_pos,
                group_start,
                kv_tile * kv_height,
                seq_kv,
                config,
            );
            softmax.update_max(&scores, kv_height);
            softmax.exponentiate::<F>(&mut scores, kv_height);
        }
        // Scores done, next key tile landed
        sync_cube();

        if roles.is_producer() {
            if comptime!(!values_with_keys) {
                if has_next {
                    L::load_tile::<F>(
                        value,
                        &mut value_slots,
                        &value_barrier,
                        kv_head_offset,
                        next_tile,
                        seq_kv,
                        roles.producer_index(),
                        config,
                    );
                }
            }
            L::wait(&value_barrier);
        } else {
            softmax.accumulate_values::<F, TM>(
                &scores,
                &value_slots,
                &mut scratch,
                query_row,
                slot_offset,
                config,
            );
        }
        // Values consumed, next tile fully landed
        sync_cube();

        kv_tile += 1u32;
    }

    if !roles.is_producer() {
        let arena_row: u32 = query_row * head_dim;
        let mut d: u32 = 0u32;
        while d < head_dim {
            qo_arena[(arena_row + d) as usize] = F::cast_from(softmax.finalize(d));
            d += 1u32;
        }
    }
    sync_cube();

    if !roles.is_producer() {
        store_output_tile::<F>(
            &qo_arena,
            output,
            q_head_offset,
            block_start,
            seq_q,
            roles.consumer_group(),
            roles.index_in_group(),
            config,
        );
    }
}

/// Number of K/V tiles the cube streams.
///
/// Uniform across the cube so that every unit reaches the same barriers. Causal cubes
/// stop at the tile holding the key aligned with their last query row.
#[cube]
fn kv_iteration_count(
    block_start: u32,
    seq_kv: u32,
    #[comptime] config: ForwardKernelConfig,
) -> u32 {
    let kv_height = comptime!(config.geometry.kv_height);
    let block_rows = comptime!(config.geometry.block_rows());

    #[expect(clippy::manual_div_ceil, reason = "CubeCL macro doesn't support div_ceil")]
    let num_kv_tiles: u32 = (seq_kv + kv_height - 1u32) / kv_height;
    let mut count: u32 = num_kv_tiles;

    if comptime!(config.causal) {
        let diagonal_tiles: u32 = (block_start + block_rows - 1u32) / kv_height + 1u32;
        count = select(diagonal_tiles < num_kv_tiles, diagonal_tiles, num_kv_tiles);
    }

    count
}

/// Excludes keys past the end of the sequence and, when causal, keys after the query.
///
/// Tiles fully inside the sequence and below the diagonal of the query tile are left
/// untouched.
#[cube]
fn mask_scores(
    scores: &mut Array<f32>,
    query_pos: u32,
    group_start: u32,
    tile_start: u32,
    seq_kv: u32,
    #[comptime] config: ForwardKernelConfig,
) {
    let kv_height = comptime!(config.geometry.kv_height);
    let tile_end: u32 = tile_start + kv_height;

    let mut needs_mask: bool = tile_end > seq_kv;
    if comptime!(config.causal) {
        needs_mask = needs_mask || tile_end > group_start + 1u32;
    }

    if needs_mask {
        let mut j: u32 = 0u32;
        while j < kv_height {
            let key_pos: u32 = tile_start + j;
            let mut masked: bool = key_pos >= seq_kv;
            if comptime!(config.causal) {
                masked = masked || key_pos > query_pos;
            }

            scores[j as usize] = select(masked, f32::min_value(), scores[j as usize]);
            j += 1u32;
        }
    }
}
