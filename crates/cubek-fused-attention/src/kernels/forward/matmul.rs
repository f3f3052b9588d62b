//! The two products of every K/V tile: `Q · K^T` into per-row scores, then `P · V` into
//! the per-row f32 accumulator.
//!
//! Consumers own one query row each, so both implementations hand results back in the
//! same row-per-unit layout and the online softmax stays oblivious of how they ran.

use cubecl::prelude::*;

use crate::kernels::forward::ForwardKernelConfig;

/// Side of the square cmma fragments.
pub const CMMA_TILE: u32 = 16;

#[cube]
pub trait TileMatmul<F: Float>: Send + Sync + 'static {
    /// Per-cube state kept across K/V tiles
    type Scratch: CubeType;

    fn init_scratch(#[comptime] config: ForwardKernelConfig) -> Self::Scratch;

    /// Scaled dot products of `query_row` against every key of the slot at `slot_offset`.
    #[allow(clippy::too_many_arguments)]
    fn scores<QK: CubePrimitive>(
        qo_arena: &SharedMemory<F>,
        key_slots: &SharedMemory<QK>,
        scores: &mut Array<f32>,
        scratch: &mut Self::Scratch,
        query_row: u32,
        slot_offset: u32,
        score_scale: f32,
        #[comptime] config: ForwardKernelConfig,
    );

    /// Adds `P · V` for the value slot at `slot_offset` to `accumulator`.
    #[allow(clippy::too_many_arguments)]
    fn accumulate_values(
        probabilities: &Array<f32>,
        value_slots: &SharedMemory<F>,
        accumulator: &mut Array<f32>,
        scratch: &mut Self::Scratch,
        query_row: u32,
        slot_offset: u32,
        #[comptime] config: ForwardKernelConfig,
    );
}

/// Every consumer computes its own row with f32 multiply-adds.
pub struct ScalarTileMatmul;

#[cube]
impl<F: Float> TileMatmul<F> for ScalarTileMatmul {
    type Scratch = ();

    fn init_scratch(#[comptime] _config: ForwardKernelConfig) -> Self::Scratch {}

    fn scores<QK: CubePrimitive>(
        qo_arena: &SharedMemory<F>,
        key_slots: &SharedMemory<QK>,
        scores: &mut Array<f32>,
        _scratch: &mut Self::Scratch,
        query_row: u32,
        slot_offset: u32,
        score_scale: f32,
        #[comptime] config: ForwardKernelConfig,
    ) {
        let head_dim = comptime!(config.geometry.head_dim);
        let kv_height = comptime!(config.geometry.kv_height);

        let q_offset: u32 = query_row * head_dim;

        let mut j: u32 = 0u32;
        while j < kv_height {
            let k_offset: u32 = slot_offset + j * head_dim;

            let mut dot: f32 = 0.0f32;
            let mut d: u32 = 0u32;
            while d < head_dim {
                let q: f32 = f32::cast_from(qo_arena[(q_offset + d) as usize]);
                let k: f32 = f32::cast_from(key_slots[(k_offset + d) as usize]);
                dot += q * k;
                d += 1u32;
            }

            scores[j as usize] = dot * score_scale;
            j += 1u32;
        }
    }

    fn accumulate_values(
        probabilities: &Array<f32>,
        value_slots: &SharedMemory<F>,
        accumulator: &mut Array<f32>,
        _scratch: &mut Self::Scratch,
        _query_row: u32,
        slot_offset: u32,
        #[comptime] config: ForwardKernelConfig,
    ) {
        let head_dim = comptime!(config.geometry.head_dim);
        let kv_height = comptime!(config.geometry.kv_height);

        let mut j: u32 = 0u32;
        while j < kv_height {
            let p: f32 = probabilities[j as usize];
            let row_offset: u32 = slot_offset + j * head_dim;

            let mut d: u32 = 0u32;
            while d < head_dim {
                accumulator[d as usize] +=
                    p * f32::cast_from(value_slots[(row_offset + d) as usize]);
                d += 1u32;
            }

            j += 1u32;
        }
    }
}

/// Each plane of consumers runs 16x16x16 cmma fragments over its `plane_dim` rows,
/// accumulating in f32.
///
/// Fragments have a blackbox layout, so results go through the plane's scratch in
/// shared memory before being split back into rows. Keys are converted to `F` in the
/// same scratch, which lets 8-bit keys feed the half precision fragments.
pub struct CmmaTileMatmul;

/// Shared memory owned by one plane of consumers.
#[derive(CubeType)]
pub struct CmmaScratch<F: Float> {
    /// One 16x16 key chunk, column-major, as the B operand of the score product
    keys: SliceMut<F>,
    /// 16 probabilities per row of the plane, the A operand of the value product
    probabilities: SliceMut<F>,
    /// One 16 wide f32 result chunk per row of the plane
    results: SliceMut<f32>,
}

#[cube]
impl<F: Float> TileMatmul<F> for CmmaTileMatmul {
    type Scratch = CmmaScratch<F>;

    fn init_scratch(#[comptime] config: ForwardKernelConfig) -> Self::Scratch {
        let plane_dim = comptime!(config.plane_dim);
        let consumer_units = comptime!(config.geometry.consumer_units());
        let consumer_planes = comptime!(consumer_units / config.plane_dim);
        let last_plane = comptime!(consumer_units / config.plane_dim - 1);
        let chunk_elems = comptime!(CMMA_TILE * CMMA_TILE);
        let row_chunk_elems = comptime!(config.plane_dim * CMMA_TILE);

        let mut keys = SharedMemory::<F>::new(comptime!((consumer_planes * chunk_elems) as usize));
        let mut probabilities =
            SharedMemory::<F>::new(comptime!((consumer_units * CMMA_TILE) as usize));
        let mut results =
            SharedMemory::<f32>::new(comptime!((consumer_units * CMMA_TILE) as usize));

        // Producers never touch the scratch, they alias the last plane
        let plane: u32 = UNIT_POS_X / plane_dim;
        let plane: u32 = select(plane < consumer_planes, plane, last_plane);

        let keys_start: u32 = plane * chunk_elems;
        let rows_start: u32 = plane * row_chunk_elems;

        CmmaScratch::<F> {
            keys: keys.slice_mut(keys_start as usize, (keys_start + chunk_elems) as usize),
            probabilities: probabilities.slice_mut(
                rows_start as usize,
                (rows_start + row_chunk_elems) as usize,
            ),
            results: results.slice_mut(
                rows_start as usize,
                (rows_start + row_chunk_elems) as usize,
            ),
        }
    }

    fn scores<QK: CubePrimitive>(
        qo_arena: &SharedMemory<F>,
        key_slots: &SharedMemory<QK>,
        scores: &mut Array<f32>,
        scratch: &mut Self::Scratch,
        query_row: u32,
        slot_offset: u32,
        score_scale: f32,
        #[comptime] config: ForwardKernelConfig,
    ) {
        let head_dim = comptime!(config.geometry.head_dim);
        let plane_dim = comptime!(config.plane_dim);
        let row_tiles = comptime!(config.plane_dim / CMMA_TILE);
        let key_chunks = comptime!(config.geometry.kv_height / CMMA_TILE);
        let depth_chunks = comptime!(config.geometry.head_dim / CMMA_TILE);
        let chunk_elems = comptime!(CMMA_TILE * CMMA_TILE);
        let a_span = comptime!((CMMA_TILE - 1) * config.geometry.head_dim + CMMA_TILE);

        let lane: u32 = query_row % plane_dim;
        let plane_start: u32 = query_row - lane;

        let mut chunk: u32 = 0u32;
        while chunk < key_chunks {
            let mut row_tile: u32 = 0u32;
            while row_tile < row_tiles {
                let acc = unsafe {
                    cmma::Matrix::<f32>::uninitialized(
                        cmma::MatrixIdent::Accumulator,
                        16usize,
                        16usize,
                        16usize,
                        cmma::MatrixLayout::RowMajor,
                    )
                };
                cmma::fill(&acc, 0.0f32);

                let mut depth: u32 = 0u32;
                while depth < depth_chunks {
                    // Key (chunk * 16 + n, depth * 16 + k) lands at n * 16 + k
                    let key_start: u32 =
                        slot_offset + chunk * CMMA_TILE * head_dim + depth * CMMA_TILE;
                    let mut e: u32 = lane;
                    while e < chunk_elems {
                        let key_idx: u32 =
                            key_start + (e / CMMA_TILE) * head_dim + e % CMMA_TILE;
                        scratch.keys[e as usize] = F::cast_from(key_slots[key_idx as usize]);
                        e += plane_dim;
                    }
                    sync_plane();

                    let lhs = unsafe {
                        cmma::Matrix::<F>::uninitialized(
                            cmma::MatrixIdent::A,
                            16usize,
                            16usize,
                            16usize,
                            cmma::MatrixLayout::RowMajor,
                        )
                    };
                    let rhs = unsafe {
                        cmma::Matrix::<F>::uninitialized(
                            cmma::MatrixIdent::B,
                            16usize,
                            16usize,
                            16usize,
                            cmma::MatrixLayout::ColMajor,
                        )
                    };

                    let a_start: u32 =
                        (plane_start + row_tile * CMMA_TILE) * head_dim + depth * CMMA_TILE;
                    cmma::load(
                        &lhs,
                        &qo_arena.slice(a_start as usize, (a_start + a_span) as usize),
                        head_dim,
                    );
                    cmma::load(&rhs, &scratch.keys.to_slice(), CMMA_TILE);
                    cmma::execute::<F, F, f32, f32>(&lhs, &rhs, &acc, &acc);

                    // The key chunk is rewritten next depth
                    sync_plane();
                    depth += 1u32;
                }

                let out_start: u32 = row_tile * chunk_elems;
                let mut out = scratch
                    .results
                    .slice_mut(out_start as usize, (out_start + chunk_elems) as usize);
                cmma::store(&mut out, &acc, CMMA_TILE, cmma::MatrixLayout::RowMajor);

                row_tile += 1u32;
            }
            sync_plane();

            let row_start: u32 = lane * CMMA_TILE;
            let mut j: u32 = 0u32;
            while j < CMMA_TILE {
                scores[(chunk * CMMA_TILE + j) as usize] =
                    scratch.results[(row_start + j) as usize] * score_scale;
                j += 1u32;
            }
            sync_plane();

            chunk += 1u32;
        }
    }

    fn accumulate_values(
        probabilities: &Array<f32>,
        value_slots: &SharedMemory<F>,
        accumulator: &mut Array<f32>,
        scratch: &mut Self::Scratch,
        query_row: u32,
        slot_offset: u32,
        #[comptime] config: ForwardKernelConfig,
    ) {
        let head_dim = comptime!(config.geometry.head_dim);
        let plane_dim = comptime!(config.plane_dim);
        let row_tiles = comptime!(config.plane_dim / CMMA_TILE);
        let key_chunks = comptime!(config.geometry.kv_height / CMMA_TILE);
        let depth_chunks = comptime!(config.geometry.head_dim / CMMA_TILE);
        let chunk_elems = comptime!(CMMA_TILE * CMMA_TILE);
        let b_span = comptime!((CMMA_TILE - 1) * config.geometry.head_dim + CMMA_TILE);

        let lane: u32 = query_row % plane_dim;
        let row_start: u32 = lane * CMMA_TILE;

        let mut row_tile: u32 = 0u32;
        while row_tile < row_tiles {
            let mut depth: u32 = 0u32;
            while depth < depth_chunks {
                let acc = unsafe {
                    cmma::Matrix::<f32>::uninitialized(
                        cmma::MatrixIdent::Accumulator,
                        16usize,
                        16usize,
                        16usize,
                        cmma::MatrixLayout::RowMajor,
                    )
                };
                cmma::fill(&acc, 0.0f32);

                let mut chunk: u32 = 0u32;
                while chunk < key_chunks {
                    let mut j: u32 = 0u32;
                    while j < CMMA_TILE {
                        scratch.probabilities[(row_start + j) as usize] =
                            F::cast_from(probabilities[(chunk * CMMA_TILE + j) as usize]);
                        j += 1u32;
                    }
                    sync_plane();

                    let lhs = unsafe {
                        cmma::Matrix::<F>::uninitialized(
                            cmma::MatrixIdent::A,
                            16usize,
                            16usize,
                            16usize,
                            cmma::MatrixLayout::RowMajor,
                        )
                    };
                    let rhs = unsafe {
                        cmma::Matrix::<F>::uninitialized(
                            cmma::MatrixIdent::B,
                            16usize,
                            16usize,
                            16usize,
                            cmma::MatrixLayout::RowMajor,
                        )
                    };

                    let a_start: u32 = row_tile * chunk_elems;
                    cmma::load(
                        &lhs,
                        &scratch
                            .probabilities
                            .slice(a_start as usize, (a_start + chunk_elems) as usize),
                        CMMA_TILE,
                    );
                    let b_start: u32 =
                        slot_offset + chunk * CMMA_TILE * head_dim + depth * CMMA_TILE;
                    cmma::load(
                        &rhs,
                        &value_slots.slice(b_start as usize, (b_start + b_span) as usize),
                        head_dim,
                    );
                    cmma::execute::<F, F, f32, f32>(&lhs, &rhs, &acc, &acc);

                    // Probabilities are rewritten next chunk
                    sync_plane();
                    chunk += 1u32;
                }

                let out_start: u32 = row_tile * chunk_elems;
                let mut out = scratch
                    .results
                    .slice_mut(out_start as usize, (out_start + chunk_elems) as usize);
                cmma::store(&mut out, &acc, CMMA_TILE, cmma::MatrixLayout::RowMajor);
                sync_plane();

                if lane / CMMA_TILE == row_tile {
                    let mut d: u32 = 0u32;
                    while d < CMMA_TILE {
                        accumulator[(depth * CMMA_TILE + d) as usize] +=
                            scratch.results[(row_start + d) as usize];
                        d += 1u32;
                    }
                }
                sync_plane();

                depth += 1u32;
            }
            row_tile += 1u32;
        }
    }
}
