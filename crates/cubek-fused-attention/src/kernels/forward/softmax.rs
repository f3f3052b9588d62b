use cubecl::prelude::*;

use crate::kernels::forward::{ForwardKernelConfig, TileMatmul};

/// Running softmax state of one query row.
///
/// Scores arrive already multiplied by `log2(e)`, so every exponential is an `exp2`.
/// The accumulator stays unnormalized until [finalize](OnlineSoftmax::finalize).
#[derive(CubeType)]
pub struct OnlineSoftmax {
    running_max: f32,
    normalizer: f32,
    accumulator: Array<f32>,
    #[cube(comptime)]
    head_dim: u32,
}

#[cube]
impl OnlineSoftmax {
    pub fn new(#[comptime] head_dim: u32) -> OnlineSoftmax {
        let mut accumulator = Array::<f32>::new(comptime!(head_dim as usize));
        let mut d: u32 = 0u32;
        while d < head_dim {
            accumulator[d as usize] = 0.0f32;
            d += 1u32;
        }

        OnlineSoftmax {
            running_max: f32::min_value(),
            normalizer: 0.0f32,
            accumulator,
            head_dim,
        }
    }

    /// Folds a tile of scores into the running max and rescales the accumulated state to
    /// the new max. The factor is 1 when the max did not move.
    pub fn update_max(&mut self, scores: &Array<f32>, #[comptime] kv_height: u32) {
        let mut tile_max: f32 = f32::min_value();
        let mut j: u32 = 0u32;
        while j < kv_height {
            tile_max = f32::max(tile_max, scores[j as usize]);
            j += 1u32;
        }

        let new_max: f32 = f32::max(self.running_max, tile_max);
        let correction: f32 = f32::powf(2.0f32, self.running_max - new_max);

        self.normalizer *= correction;
        let mut d: u32 = 0u32;
        while d < self.head_dim {
            self.accumulator[d as usize] *= correction;
            d += 1u32;
        }

        self.running_max = new_max;
    }

    /// Turns the scores into unnormalized probabilities in place.
    ///
    /// The normalizer accumulates the f32 probabilities, while the values left in
    /// `scores` are rounded through `F` as they will be multiplied with V at that precision.
    pub fn exponentiate<F: Float>(&mut self, scores: &mut Array<f32>, #[comptime] kv_height: u32) {
        let mut row_sum: f32 = 0.0f32;
        let mut j: u32 = 0u32;
        while j < kv_height {
            let p: f32 = f32::powf(2.0f32, scores[j as usize] - self.running_max);
            row_sum += p;
            scores[j as usize] = f32::cast_from(F::cast_from(p));
            j += 1u32;
        }

        self.normalizer += row_sum;
    }

    /// Adds `P · V` for the value tile held in `value_slots` at `slot_offset`.
    pub fn accumulate_values<F: Float, TM: TileMatmul<F>>(
        &mut self,
        probabilities: &Array<f32>,
        value_slots: &SharedMemory<F>,
        scratch: &mut TM::Scratch,
        query_row: u32,
        slot_offset: u32,
        #[comptime] config: ForwardKernelConfig,
    ) {
        TM::accumulate_values(
            probabilities,
            value_slots,
            &mut self.accumulator,
            scratch,
            query_row,
            slot_offset,
            config,
        );
    }

    /// Normalized output value at feature `d`.
    pub fn finalize(&self, d: u32) -> f32 {
        self.accumulator[d as usize] / self.normalizer
    }
}
