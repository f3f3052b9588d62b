//! Symmetric 8-bit quantization of attention inputs.
//!
//! Produces one scale per (batch, head), the layout consumed by the quantized forward
//! pass: `x ≈ q * scale` with `scale = max|x| / max_value`, where `max_value` is 127
//! for integers and 448 for e4m3.

use cubecl::prelude::*;

use crate::definition::QuantizationFormat;

/// Floor applied to scales so all-zero heads quantize without dividing by zero.
pub const MIN_QUANT_SCALE: f32 = 1e-6;

/// Comptime parameters of the per-head quantization kernels.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct QuantizeConfig {
    /// Lines read and written per access
    pub line_size: u32,
    pub format: QuantizationFormat,
}

/// First pass: max absolute value of each head.
///
/// One cube per flattened (batch, head), sized to a single plane so that `plane_max`
/// covers every unit.
#[cube(launch_unchecked)]
pub fn head_abs_max<EI: Numeric>(
    input: &Tensor<Line<EI>>,
    max_vals: &mut Tensor<f32>,
    lines_per_head: u32,
    #[comptime] config: QuantizeConfig,
) {
    let head_idx = CUBE_POS_X;
    let head_offset = head_idx * lines_per_head;

    let mut local_max = 0.0f32;
    let mut line_idx = UNIT_POS_X;
    while line_idx < lines_per_head {
        let line = input[(head_offset + line_idx) as usize];
        #[unroll]
        for j in 0..config.line_size {
            local_max = f32::max(local_max, f32::abs(f32::cast_from(line[j as usize])));
        }
        line_idx += CUBE_DIM_X;
    }

    let head_max = plane_max(local_max);

    if UNIT_POS_X == 0 {
        max_vals[head_idx as usize] = head_max;
    }
}

/// Second pass: quantize each head with its own scale and publish the scales.
///
/// `EO` is the 8-bit storage of `config.format`.
#[cube(launch_unchecked)]
pub fn quantize_head<EI: Numeric, EO: CubePrimitive>(
    input: &Tensor<Line<EI>>,
    output: &mut Tensor<Line<EO>>,
    max_vals: &Tensor<f32>,
    scales: &mut Tensor<f32>,
    lines_per_head: u32,
    #[comptime] config: QuantizeConfig,
) {
    let head_idx = CUBE_POS_X;
    let head_offset = head_idx * lines_per_head;
    let max_value = comptime!(config.format.max_value());
    let min_value = comptime!(-config.format.max_value());

    let scale = f32::max(max_vals[head_idx as usize] / max_value, MIN_QUANT_SCALE);
    let inv_scale = 1.0f32 / scale;

    if UNIT_POS_X == 0 {
        scales[head_idx as usize] = scale;
    }

    let mut line_idx = UNIT_POS_X;
    while line_idx < lines_per_head {
        let in_line = input[(head_offset + line_idx) as usize];
        let mut out_line = Line::<EO>::empty(config.line_size as usize);
        #[unroll]
        for j in 0..config.line_size {
            let scaled = f32::cast_from(in_line[j as usize]) * inv_scale;
            // -128 is never produced
            let clamped = f32::clamp(scaled, min_value, max_value);
            out_line[j as usize] = match comptime!(config.format) {
                QuantizationFormat::Int8 => EO::cast_from(f32::round(clamped)),
                QuantizationFormat::E4M3 => EO::cast_from(clamped),
            };
        }
        output[(head_offset + line_idx) as usize] = out_line;
        line_idx += CUBE_DIM_X;
    }
}
