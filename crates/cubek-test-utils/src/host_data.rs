use cubecl::{
    Runtime,
    client::ComputeClient,
    ir::{ElemType, FloatKind, IntKind, StorageType},
    std::tensor::TensorHandle,
};

/// How logical indices map to memory offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrideSpec {
    RowMajor,
    /// Memory holds the dimensions in this order, e.g. `[0, 2, 1, 3]` stores a
    /// `(batch, heads, seq, dim)` tensor as `(batch, seq, heads, dim)`.
    Permuted(Vec<usize>),
}

impl StrideSpec {
    pub fn compute_strides(&self, shape: &[usize]) -> Vec<usize> {
        match self {
            StrideSpec::RowMajor => row_major_strides(shape),
            StrideSpec::Permuted(order) => {
                let stored_shape: Vec<usize> = order.iter().map(|dim| shape[*dim]).collect();
                let stored_strides = row_major_strides(&stored_shape);

                let mut strides = vec![0; shape.len()];
                for (position, dim) in order.iter().enumerate() {
                    strides[*dim] = stored_strides[position];
                }
                strides
            }
        }
    }
}

fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostDataType {
    F32,
    I8,
}

#[derive(Clone, PartialEq)]
pub enum HostDataVec {
    F32(Vec<f32>),
    I8(Vec<i8>),
}

/// A tensor copied to the host, indexed through its strides.
#[derive(Clone)]
pub struct HostData {
    pub data: HostDataVec,
    pub shape: Vec<usize>,
    pub strides: Vec<usize>,
}

impl HostData {
    /// Reads a device tensor back, widening floats to f32.
    pub fn from_tensor_handle<R: Runtime>(
        client: &ComputeClient<R>,
        handle: &TensorHandle<R>,
        ty: HostDataType,
    ) -> Self {
        let bytes = client.read_one(handle.handle.clone());
        let values = decode_f32(&bytes, handle.dtype);

        let data = match ty {
            HostDataType::F32 => HostDataVec::F32(values),
            HostDataType::I8 => HostDataVec::I8(values.iter().map(|v| *v as i8).collect()),
        };

        HostData {
            data,
            shape: handle.shape.clone(),
            strides: handle.strides.clone(),
        }
    }

    pub fn get_f32(&self, index: &[usize]) -> f32 {
        let offset = self.offset(index);
        match &self.data {
            HostDataVec::F32(values) => values[offset],
            HostDataVec::I8(values) => values[offset] as f32,
        }
    }

    fn offset(&self, index: &[usize]) -> usize {
        index
            .iter()
            .zip(self.strides.iter())
            .map(|(i, stride)| i * stride)
            .sum()
    }

    pub fn num_elems(&self) -> usize {
        self.shape.iter().product()
    }

    /// Every logical index, in row-major order.
    pub fn indices(&self) -> impl Iterator<Item = Vec<usize>> + '_ {
        let logical = row_major_strides(&self.shape);
        (0..self.num_elems()).map(move |flat| {
            logical
                .iter()
                .zip(self.shape.iter())
                .map(|(stride, dim)| (flat / stride) % dim)
                .collect()
        })
    }

    /// Logical values in row-major order, whatever the storage strides.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.indices().map(|index| self.get_f32(&index)).collect()
    }
}

impl core::fmt::Debug for HostData {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let preview: Vec<f32> = self.indices().take(8).map(|i| self.get_f32(&i)).collect();
        f.debug_struct("HostData")
            .field("shape", &self.shape)
            .field("strides", &self.strides)
            .field("first", &preview)
            .finish()
    }
}

/// Widens raw device bytes of `dtype` to f32.
pub fn decode_f32(bytes: &[u8], dtype: StorageType) -> Vec<f32> {
    match dtype {
        StorageType::Scalar(ElemType::Float(FloatKind::F32)) => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        StorageType::Scalar(ElemType::Float(FloatKind::F16)) => bytes
            .chunks_exact(2)
            .map(|c| half::f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        StorageType::Scalar(ElemType::Float(FloatKind::BF16)) => bytes
            .chunks_exact(2)
            .map(|c| half::bf16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        StorageType::Scalar(ElemType::Float(FloatKind::E4M3)) => bytes
            .iter()
            .map(|b| cubecl::e4m3::from_bits(*b).to_f32())
            .collect(),
        StorageType::Scalar(ElemType::Int(IntKind::I8)) => {
            bytes.iter().map(|b| *b as i8 as f32).collect()
        }
        other => panic!("Unsupported host dtype {other:?}"),
    }
}
