use cubecl::ir::{ElemType, FloatKind, StorageType};
use serde::{Deserialize, Serialize};

use crate::definition::{AttentionSetupError, QuantizationFormat, TileGeometry};

/// Options shared by every specialization of the forward pass.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttentionOptions {
    /// Restrict every query to keys at or before its own position.
    pub causal: bool,
}

/// Identifies one of the tensors taking part in the forward pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttentionIdent {
    Query,
    Key,
    Value,
    Out,
    /// Per-(batch, head) dequantization factors of Q.
    ScaleQuery,
    /// Per-(batch, kv head) dequantization factors of K.
    ScaleKey,
}

/// Element types of the global tensors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttentionGlobalTypes {
    pub query: StorageType,
    pub key: StorageType,
    pub value: StorageType,
    pub out: StorageType,
}

impl AttentionGlobalTypes {
    pub fn from_single_dtype(dtype: StorageType) -> Self {
        Self {
            query: dtype,
            key: dtype,
            value: dtype,
            out: dtype,
        }
    }

    /// Q and K in `qk_dtype`, V and O in `dtype`.
    pub fn quantized(qk_dtype: StorageType, dtype: StorageType) -> Self {
        Self {
            query: qk_dtype,
            key: qk_dtype,
            value: dtype,
            out: dtype,
        }
    }

    pub(crate) fn validate(&self, quantized: bool) -> Result<(), AttentionSetupError> {
        if !is_storage_dtype(self.value) {
            return Err(AttentionSetupError::UnsupportedDtype(self.value));
        }
        if self.out != self.value {
            return Err(AttentionSetupError::invalid(
                "Output dtype must match the V tensor dtype",
            ));
        }

        if quantized {
            for dtype in [self.query, self.key] {
                if QuantizationFormat::from_storage_type(dtype).is_none() {
                    return Err(AttentionSetupError::UnsupportedDtype(dtype));
                }
            }
            if self.query != self.key {
                return Err(AttentionSetupError::invalid(
                    "Quantized Q/K tensors must share the same dtype",
                ));
            }
        } else if self.query != self.value || self.key != self.value {
            return Err(AttentionSetupError::invalid(
                "Q/K/V tensors must share the same dtype",
            ));
        }

        Ok(())
    }
}

fn is_storage_dtype(dtype: StorageType) -> bool {
    matches!(
        dtype,
        StorageType::Scalar(ElemType::Float(FloatKind::F16 | FloatKind::BF16))
    )
}

/// Kernels index tensors with 32-bit offsets.
pub(crate) fn check_addressable(name: &str, shape: &[usize]) -> Result<(), AttentionSetupError> {
    let elems = shape
        .iter()
        .try_fold(1usize, |acc, dim| acc.checked_mul(*dim));

    if elems.is_none_or(|elems| elems > u32::MAX as usize) {
        return Err(AttentionSetupError::invalid(format!(
            "{name} tensor must have at most {} elements",
            u32::MAX
        )));
    }

    Ok(())
}

/// Sizes of one forward pass, read off the input shapes.
///
/// Q and O are `(batch, qo_heads, seq_q, head_dim)`, K and V are
/// `(batch, kv_heads, seq_kv, head_dim)`.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttentionProblem {
    pub batch: usize,
    pub qo_heads: usize,
    pub kv_heads: usize,
    pub seq_q: usize,
    pub seq_kv: usize,
    pub head_dim: usize,
    pub options: AttentionOptions,
}

impl AttentionProblem {
    /// Builds the problem from Q, K and V shapes, checking they describe a valid
    /// grouped-query attention.
    pub fn from_shapes(
        query: &[usize],
        key: &[usize],
        value: &[usize],
        options: AttentionOptions,
    ) -> Result<Self, AttentionSetupError> {
        for (name, shape) in [("Q", query), ("K", key), ("V", value)] {
            if shape.len() != 4 {
                return Err(AttentionSetupError::invalid(format!(
                    "{name} tensor must have 4 dimensions"
                )));
            }
        }

        for (name, shape) in [("Q", query), ("K", key), ("V", value)] {
            check_addressable(name, shape)?;
        }

        if query[0] != key[0] || query[0] != value[0] {
            return Err(AttentionSetupError::invalid(
                "Q/K/V batch dimension - idx 0 - must match for all inputs",
            ));
        }
        if key[2] != value[2] {
            return Err(AttentionSetupError::invalid(
                "K/V sequence length dimension - idx 2 - must match for all inputs",
            ));
        }
        if query[3] != key[3] || query[3] != value[3] {
            return Err(AttentionSetupError::invalid(
                "Q/K/V head dimension - idx 3 - must match for all non-vector inputs",
            ));
        }
        if key[1] != value[1] {
            return Err(AttentionSetupError::invalid(
                "KV head dimension - idx 1 - must match for all inputs",
            ));
        }
        if key[1] == 0 || query[1] < key[1] {
            return Err(AttentionSetupError::invalid(
                "QO heads must be greater than or equal to KV heads",
            ));
        }
        if query[1] % key[1] != 0 {
            return Err(AttentionSetupError::invalid(
                "QO heads must be divisible by KV heads",
            ));
        }
        if query[2] == 0 || key[2] == 0 {
            return Err(AttentionSetupError::invalid(
                "Q and K/V sequence lengths must be non-zero",
            ));
        }

        TileGeometry::for_head_dim(query[3])?;

        Ok(Self {
            batch: query[0],
            qo_heads: query[1],
            kv_heads: key[1],
            seq_q: query[2],
            seq_kv: key[2],
            head_dim: query[3],
            options,
        })
    }

    /// Checks the shapes of the quantization scales against the problem.
    pub fn validate_scales(
        &self,
        scale_query: &[usize],
        scale_key: &[usize],
    ) -> Result<(), AttentionSetupError> {
        for (name, shape, heads) in [
            ("Q", scale_query, self.qo_heads),
            ("K", scale_key, self.kv_heads),
        ] {
            if shape.len() != 2 {
                return Err(AttentionSetupError::invalid(format!(
                    "{name} scale tensor must have 2 dimensions"
                )));
            }
            if shape[0] != self.batch {
                return Err(AttentionSetupError::invalid(format!(
                    "{name} scale batch dimension - idx 0 - must match for all inputs"
                )));
            }
            if shape[1] != heads {
                return Err(AttentionSetupError::invalid(format!(
                    "{name} scale head dimension - idx 1 - must match for all inputs"
                )));
            }
        }

        Ok(())
    }

    /// Query heads sharing one K/V head.
    pub fn group_size(&self) -> usize {
        self.qo_heads / self.kv_heads
    }

    pub fn geometry(&self) -> Result<TileGeometry, AttentionSetupError> {
        TileGeometry::for_head_dim(self.head_dim)
    }

    pub fn shape(&self, ident: AttentionIdent) -> Vec<usize> {
        match ident {
            AttentionIdent::Query | AttentionIdent::Out => {
                vec![self.batch, self.qo_heads, self.seq_q, self.head_dim]
            }
            AttentionIdent::Key | AttentionIdent::Value => {
                vec![self.batch, self.kv_heads, self.seq_kv, self.head_dim]
            }
            AttentionIdent::ScaleQuery => vec![self.batch, self.qo_heads],
            AttentionIdent::ScaleKey => vec![self.batch, self.kv_heads],
        }
    }
}
