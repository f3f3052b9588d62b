use cubecl::{
    Runtime,
    client::ComputeClient,
    ir::{ElemType, FloatKind, IntKind, StorageType},
    std::tensor::TensorHandle,
};
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{HostData, HostDataVec, StrideSpec};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Distribution {
    /// Uniform in `[low, high)`
    Uniform(f32, f32),
}

enum InputValues {
    Random { seed: u64, distribution: Distribution },
    Zeros,
    Given(Vec<f32>),
}

/// Builder of a device tensor with known host contents.
pub struct TestInput<R: Runtime> {
    client: ComputeClient<R>,
    shape: Vec<usize>,
    dtype: StorageType,
    stride_spec: StrideSpec,
    values: InputValues,
}

impl<R: Runtime> TestInput<R> {
    pub fn random(
        client: ComputeClient<R>,
        shape: Vec<usize>,
        dtype: StorageType,
        seed: u64,
        distribution: Distribution,
        stride_spec: StrideSpec,
    ) -> Self {
        Self {
            client,
            shape,
            dtype,
            stride_spec,
            values: InputValues::Random { seed, distribution },
        }
    }

    pub fn zeros(
        client: ComputeClient<R>,
        shape: Vec<usize>,
        dtype: StorageType,
        stride_spec: StrideSpec,
    ) -> Self {
        Self {
            client,
            shape,
            dtype,
            stride_spec,
            values: InputValues::Zeros,
        }
    }

    /// Explicit values, given in logical row-major order.
    pub fn from_values(
        client: ComputeClient<R>,
        shape: Vec<usize>,
        dtype: StorageType,
        values: Vec<f32>,
        stride_spec: StrideSpec,
    ) -> Self {
        assert_eq!(
            values.len(),
            shape.iter().product::<usize>(),
            "Value count must match the shape"
        );
        Self {
            client,
            shape,
            dtype,
            stride_spec,
            values: InputValues::Given(values),
        }
    }

    /// Uploads the tensor and returns it with its contents, rounded through the dtype
    /// exactly as the device sees them.
    pub fn generate_with_f32_host_data(self) -> (TensorHandle<R>, HostData) {
        let num_elems: usize = self.shape.iter().product();
        let logical: Vec<f32> = match &self.values {
            InputValues::Random { seed, distribution } => {
                let mut rng = StdRng::seed_from_u64(*seed);
                match distribution {
                    Distribution::Uniform(low, high) => {
                        (0..num_elems).map(|_| rng.gen_range(*low..*high)).collect()
                    }
                }
            }
            InputValues::Zeros => vec![0.0; num_elems],
            InputValues::Given(values) => values.clone(),
        };
        let logical: Vec<f32> = logical.iter().map(|v| round_to(*v, self.dtype)).collect();

        let row_major = StrideSpec::RowMajor.compute_strides(&self.shape);
        let strides = self.stride_spec.compute_strides(&self.shape);

        let mut stored = vec![0.0f32; num_elems];
        for (flat, value) in logical.iter().enumerate() {
            let offset: usize = row_major
                .iter()
                .zip(self.shape.iter())
                .zip(strides.iter())
                .map(|((logical_stride, dim), stride)| (flat / logical_stride) % dim * stride)
                .sum();
            stored[offset] = *value;
        }

        let handle = self.client.create_from_slice(&encode(&stored, self.dtype));
        let tensor = TensorHandle::new(handle, self.shape.clone(), strides, self.dtype);

        let host = HostData {
            data: HostDataVec::F32(logical),
            shape: self.shape,
            strides: row_major,
        };

        (tensor, host)
    }

    pub fn generate_without_host_data(self) -> TensorHandle<R> {
        self.generate_with_f32_host_data().0
    }
}

/// Value as stored by a tensor of `dtype`.
pub fn round_to(value: f32, dtype: StorageType) -> f32 {
    match dtype {
        StorageType::Scalar(ElemType::Float(FloatKind::F16)) => {
            half::f16::from_f32(value).to_f32()
        }
        StorageType::Scalar(ElemType::Float(FloatKind::BF16)) => {
            half::bf16::from_f32(value).to_f32()
        }
        StorageType::Scalar(ElemType::Float(FloatKind::E4M3)) => {
            cubecl::e4m3::from_f32(value).to_f32()
        }
        StorageType::Scalar(ElemType::Int(IntKind::I8)) => value.round().clamp(-128.0, 127.0),
        _ => value,
    }
}

fn encode(values: &[f32], dtype: StorageType) -> Vec<u8> {
    match dtype {
        StorageType::Scalar(ElemType::Float(FloatKind::F16)) => {
            let converted: Vec<half::f16> =
                values.iter().map(|v| half::f16::from_f32(*v)).collect();
            bytemuck::cast_slice(&converted).to_vec()
        }
        StorageType::Scalar(ElemType::Float(FloatKind::BF16)) => {
            let converted: Vec<half::bf16> =
                values.iter().map(|v| half::bf16::from_f32(*v)).collect();
            bytemuck::cast_slice(&converted).to_vec()
        }
        StorageType::Scalar(ElemType::Float(FloatKind::E4M3)) => values
            .iter()
            .map(|v| cubecl::e4m3::from_f32(*v).to_bits())
            .collect(),
        StorageType::Scalar(ElemType::Int(IntKind::I8)) => {
            values.iter().map(|v| (*v as i8) as u8).collect()
        }
        StorageType::Scalar(ElemType::Float(FloatKind::F32)) => {
            bytemuck::cast_slice(values).to_vec()
        }
        other => panic!("Unsupported test input dtype {other:?}"),
    }
}
