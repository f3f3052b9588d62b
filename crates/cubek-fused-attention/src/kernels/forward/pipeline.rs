//! Tile movement between global and shared memory.
//!
//! Loads are issued by the producer units only, cooperatively striding over the tile.
//! Rows past the end of the sequence are zero-filled so consumers never read stale data.

use cubecl::prelude::barrier::Barrier;
use cubecl::prelude::*;

use crate::kernels::forward::ForwardKernelConfig;

/// Copies the query rows of the block into the Q/O arena, converting to the storage type.
#[cube]
#[allow(clippy::too_many_arguments)]
pub fn load_query_block<QK: CubePrimitive, F: Float>(
    query: &Tensor<Line<QK>>,
    arena: &mut SharedMemory<F>,
    head_offset: u32,
    block_start: u32,
    seq_q: u32,
    producer_index: u32,
    #[comptime] config: ForwardKernelConfig,
) {
    let head_dim = comptime!(config.geometry.head_dim);
    let block_elems = comptime!(config.geometry.block_rows() * config.geometry.head_dim);
    let num_producers = comptime!(config.geometry.producer_units());

    let mut load_idx: u32 = producer_index;
    while load_idx < block_elems {
        let row: u32 = load_idx / head_dim;
        let query_pos: u32 = block_start + row;

        if query_pos < seq_q {
            let global_idx: u32 = head_offset + query_pos * head_dim + load_idx % head_dim;
            arena[load_idx as usize] = F::cast_from(query[global_idx as usize][0]);
        } else {
            arena[load_idx as usize] = F::from_int(0);
        }

        load_idx += num_producers;
    }
}

/// Copies K/V tile `tile_index` into its stage slot.
#[cube]
#[allow(clippy::too_many_arguments)]
pub fn load_kv_tile<E: CubePrimitive>(
    source: &Tensor<Line<E>>,
    slots: &mut SharedMemory<E>,
    head_offset: u32,
    tile_index: u32,
    seq_kv: u32,
    producer_index: u32,
    #[comptime] config: ForwardKernelConfig,
) {
    let head_dim = comptime!(config.geometry.head_dim);
    let kv_height = comptime!(config.geometry.kv_height);
    let stages = comptime!(config.geometry.stages);
    let tile_elems = comptime!(config.geometry.kv_tile_elems());
    let num_producers = comptime!(config.geometry.producer_units());

    let slot_offset: u32 = (tile_index % stages) * tile_elems;
    let tile_start: u32 = tile_index * kv_height;

    let mut load_idx: u32 = producer_index;
    while load_idx < tile_elems {
        let kv_pos: u32 = tile_start + load_idx / head_dim;
        let smem_idx: u32 = slot_offset + load_idx;

        if kv_pos < seq_kv {
            let global_idx: u32 = head_offset + kv_pos * head_dim + load_idx % head_dim;
            slots[smem_idx as usize] = source[global_idx as usize][0];
        } else {
            slots[smem_idx as usize] = E::cast_from(0);
        }

        load_idx += num_producers;
    }
}

/// How producers move K/V tiles into their stage slots.
///
/// A tile issued with [KvLoader::load_tile] is only guaranteed to have landed once the
/// producer called [KvLoader::wait] on the same barrier and the cube synchronized.
#[cube]
pub trait KvLoader: Send + Sync + 'static {
    type Barrier: CubeType + Clone;

    fn create_barrier() -> Self::Barrier;

    #[allow(clippy::too_many_arguments)]
    fn load_tile<E: CubePrimitive>(
        source: &Tensor<Line<E>>,
        slots: &mut SharedMemory<E>,
        barrier: &Self::Barrier,
        head_offset: u32,
        tile_index: u32,
        seq_kv: u32,
        producer_index: u32,
        #[comptime] config: ForwardKernelConfig,
    );

    fn wait(barrier: &Self::Barrier);
}

/// Producers copy element by element through registers.
pub struct SyncKvLoader;

/// Producers issue one asynchronous copy per key row and only block on it right before
/// the cube barrier that hands the slot to the consumers.
pub struct AsyncKvLoader;

#[cube]
impl KvLoader for SyncKvLoader {
    type Barrier = ();

    fn create_barrier() -> Self::Barrier {}

    fn load_tile<E: CubePrimitive>(
        source: &Tensor<Line<E>>,
        slots: &mut SharedMemory<E>,
        _barrier: &Self::Barrier,
        head_offset: u32,
        tile_index: u32,
        seq_kv: u32,
        producer_index: u32,
        #[comptime] config: ForwardKernelConfig,
    ) {
        load_kv_tile::<E>(
            source,
            slots,
            head_offset,
            tile_index,
            seq_kv,
            producer_index,
            config,
        );
    }

    fn wait(_barrier: &Self::Barrier) {}
}

#[cube]
impl KvLoader for AsyncKvLoader {
    type Barrier = Barrier;

    fn create_barrier() -> Self::Barrier {
        Barrier::local()
    }

    fn load_tile<E: CubePrimitive>(
        source: &Tensor<Line<E>>,
        slots: &mut SharedMemory<E>,
        barrier: &Self::Barrier,
        head_offset: u32,
        tile_index: u32,
        seq_kv: u32,
        producer_index: u32,
        #[comptime] config: ForwardKernelConfig,
    ) {
        let head_dim = comptime!(config.geometry.head_dim);
        let kv_height = comptime!(config.geometry.kv_height);
        let stages = comptime!(config.geometry.stages);
        let tile_elems = comptime!(config.geometry.kv_tile_elems());
        let num_producers = comptime!(config.geometry.producer_units());

        let slot_offset: u32 = (tile_index % stages) * tile_elems;
        let tile_start: u32 = tile_index * kv_height;

        let mut row: u32 = producer_index;
        while row < kv_height {
            let kv_pos: u32 = tile_start + row;
            let smem_start: u32 = slot_offset + row * head_dim;

            if kv_pos < seq_kv {
                let global_start: u32 = head_offset + kv_pos * head_dim;
                let mut destination = slots
                    .slice_mut(smem_start as usize, (smem_start + head_dim) as usize)
                    .into_lined();
                barrier.memcpy_async(
                    &source.slice(global_start as usize, (global_start + head_dim) as usize),
                    &mut destination,
                );
            } else {
                let mut d: u32 = 0u32;
                while d < head_dim {
                    slots[(smem_start + d) as usize] = E::cast_from(0);
                    d += 1u32;
                }
            }

            row += num_producers;
        }
    }

    fn wait(barrier: &Self::Barrier) {
        barrier.arrive_and_wait();
    }
}

/// Writes one consumer group's output tile from the arena to global memory.
///
/// The whole group cooperates on the store; rows past `seq_q` are skipped.
#[cube]
#[allow(clippy::too_many_arguments)]
pub fn store_output_tile<F: Float>(
    arena: &SharedMemory<F>,
    output: &mut Tensor<Line<F>>,
    head_offset: u32,
    block_start: u32,
    seq_q: u32,
    group: u32,
    index_in_group: u32,
    #[comptime] config: ForwardKernelConfig,
) {
    let head_dim = comptime!(config.geometry.head_dim);
    let qo_height = comptime!(config.geometry.qo_height);
    let tile_elems = comptime!(config.geometry.qo_height * config.geometry.head_dim);

    let arena_offset: u32 = group * tile_elems;
    let tile_start: u32 = block_start + group * qo_height;

    let mut store_idx: u32 = index_in_group;
    while store_idx < tile_elems {
        let query_pos: u32 = tile_start + store_idx / head_dim;

        if query_pos < seq_q {
            let global_idx: u32 = head_offset + query_pos * head_dim + store_idx % head_dim;
            output[global_idx as usize] =
                Line::cast_from(arena[(arena_offset + store_idx) as usize]);
        }

        store_idx += qo_height;
    }
}
