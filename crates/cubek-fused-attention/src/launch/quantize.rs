use cubecl::ir::{ElemType, FloatKind, StorageType};
use cubecl::prelude::*;
use cubecl::server::LaunchError;
use cubecl::{CubeCount, CubeDim, Runtime, client::ComputeClient, std::tensor::TensorHandle};

use crate::{
    definition::{AttentionSetupError, QuantizationFormat, check_addressable},
    kernels::quantize::{QuantizeConfig, head_abs_max, quantize_head},
    launch::{base::ensure_dtype_available, layout::contiguous_copy},
};

/// An 8-bit tensor with one f32 scale per (batch, head).
pub struct QuantizedTensor<R: Runtime> {
    /// Same shape as the source, in the storage type of the format
    pub values: TensorHandle<R>,
    /// `(batch, heads)`, f32
    pub scales: TensorHandle<R>,
}

/// Quantizes a `(batch, heads, seq, dim)` tensor to `format` with symmetric per-head
/// scales.
///
/// The scales are exactly what the quantized forward pass expects for Q or K. Runs in
/// two passes: the max absolute value of every head, then the quantization itself.
#[allow(clippy::result_large_err)]
pub fn quantize_per_head<R: Runtime>(
    client: &ComputeClient<R>,
    input: &TensorHandle<R>,
    format: QuantizationFormat,
) -> Result<QuantizedTensor<R>, AttentionSetupError> {
    if input.shape.len() != 4 {
        return Err(AttentionSetupError::invalid(
            "Quantized tensor must have 4 dimensions",
        ));
    }
    check_addressable("Quantized", &input.shape)?;
    ensure_dtype_available(client, format.storage_type())?;

    let input_copy = contiguous_copy(client, &input.as_ref(), input.dtype)?;
    let input_ref = input_copy.as_ref().unwrap_or(input).as_ref();

    let f32_dtype = StorageType::Scalar(ElemType::Float(FloatKind::F32));
    let scale_shape = input.shape[..2].to_vec();

    let values = TensorHandle::empty(client, input.shape.clone(), format.storage_type());
    let scales = TensorHandle::empty(client, scale_shape.clone(), f32_dtype);
    let max_vals = TensorHandle::empty(client, scale_shape, f32_dtype);

    let head_dim = input.shape[3];
    let line_size = if head_dim % 4 == 0 { 4 } else { 1 };
    let lines_per_head = (input.shape[2] * head_dim / line_size) as u32;
    let num_heads = (input.shape[0] * input.shape[1]) as u32;

    // A single plane per head so the reduction covers the whole cube
    let plane_size = client.properties().hardware.plane_size_min;
    let launch = QuantizeLaunch {
        cube_count: CubeCount::new_1d(num_heads),
        cube_dim: CubeDim::new_1d(plane_size),
        lines_per_head,
        config: QuantizeConfig {
            line_size: line_size as u32,
            format,
        },
    };

    tracing::debug!(
        shape = ?input.shape,
        dtype = ?input.dtype,
        ?format,
        line_size,
        plane_size,
        "quantizing per head"
    );

    let buffers = QuantizeBuffers {
        input: &input_ref,
        values: &values.as_ref(),
        max_vals: &max_vals.as_ref(),
        scales: &scales.as_ref(),
    };

    let result = match (input.dtype, format) {
        (StorageType::Scalar(ElemType::Float(FloatKind::F16)), QuantizationFormat::Int8) => {
            launch.run::<R, half::f16, i8>(client, &buffers)
        }
        (StorageType::Scalar(ElemType::Float(FloatKind::BF16)), QuantizationFormat::Int8) => {
            launch.run::<R, half::bf16, i8>(client, &buffers)
        }
        (StorageType::Scalar(ElemType::Float(FloatKind::F32)), QuantizationFormat::Int8) => {
            launch.run::<R, f32, i8>(client, &buffers)
        }
        (StorageType::Scalar(ElemType::Float(FloatKind::F16)), QuantizationFormat::E4M3) => {
            launch.run::<R, half::f16, cubecl::e4m3>(client, &buffers)
        }
        (StorageType::Scalar(ElemType::Float(FloatKind::BF16)), QuantizationFormat::E4M3) => {
            launch.run::<R, half::bf16, cubecl::e4m3>(client, &buffers)
        }
        (StorageType::Scalar(ElemType::Float(FloatKind::F32)), QuantizationFormat::E4M3) => {
            launch.run::<R, f32, cubecl::e4m3>(client, &buffers)
        }
        (other, _) => return Err(AttentionSetupError::UnsupportedDtype(other)),
    };
    result.map_err(AttentionSetupError::Execution)?;

    Ok(QuantizedTensor { values, scales })
}

struct QuantizeBuffers<'a, 'b, R: Runtime> {
    input: &'a TensorHandleRef<'b, R>,
    values: &'a TensorHandleRef<'b, R>,
    max_vals: &'a TensorHandleRef<'b, R>,
    scales: &'a TensorHandleRef<'b, R>,
}

struct QuantizeLaunch {
    cube_count: CubeCount,
    cube_dim: CubeDim,
    lines_per_head: u32,
    config: QuantizeConfig,
}

impl QuantizeLaunch {
    fn run<R: Runtime, EI: Numeric, EO: CubePrimitive>(
        &self,
        client: &ComputeClient<R>,
        buffers: &QuantizeBuffers<'_, '_, R>,
    ) -> Result<(), LaunchError> {
        let line_size = self.config.line_size as usize;

        unsafe {
            head_abs_max::launch_unchecked::<EI, R>(
                client,
                self.cube_count.clone(),
                self.cube_dim,
                buffers.input.as_tensor_arg(line_size),
                buffers.max_vals.as_tensor_arg(1),
                ScalarArg::new(self.lines_per_head),
                self.config,
            )?;

            quantize_head::launch_unchecked::<EI, EO, R>(
                client,
                self.cube_count.clone(),
                self.cube_dim,
                buffers.input.as_tensor_arg(line_size),
                buffers.values.as_tensor_arg(line_size),
                buffers.max_vals.as_tensor_arg(1),
                buffers.scales.as_tensor_arg(1),
                ScalarArg::new(self.lines_per_head),
                self.config,
            )
        }
    }
}
