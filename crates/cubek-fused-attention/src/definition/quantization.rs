use cubecl::ir::{ElemType, FloatKind, IntKind, StorageType};
use serde::{Deserialize, Serialize};

/// 8-bit encodings accepted for quantized Q and K.
///
/// Both are symmetric with one f32 scale per (batch, head): `x ≈ q * scale` with
/// `scale = max|x| / max_value()`.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuantizationFormat {
    /// Signed integers in `[-127, 127]`
    #[default]
    Int8,
    /// 8-bit floats with 4 exponent and 3 mantissa bits, up to ±448
    E4M3,
}

impl QuantizationFormat {
    pub fn storage_type(&self) -> StorageType {
        match self {
            QuantizationFormat::Int8 => StorageType::Scalar(ElemType::Int(IntKind::I8)),
            QuantizationFormat::E4M3 => StorageType::Scalar(ElemType::Float(FloatKind::E4M3)),
        }
    }

    /// Largest magnitude a quantized value takes.
    pub fn max_value(&self) -> f32 {
        match self {
            QuantizationFormat::Int8 => 127.0,
            QuantizationFormat::E4M3 => 448.0,
        }
    }

    /// The format stored with `dtype`, if any.
    pub fn from_storage_type(dtype: StorageType) -> Option<Self> {
        match dtype {
            StorageType::Scalar(ElemType::Int(IntKind::I8)) => Some(QuantizationFormat::Int8),
            StorageType::Scalar(ElemType::Float(FloatKind::E4M3)) => {
                Some(QuantizationFormat::E4M3)
            }
            _ => None,
        }
    }
}
