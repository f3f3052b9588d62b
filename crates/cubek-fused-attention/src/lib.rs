//! Fused scaled dot-product attention forward pass.
//!
//! A single kernel streams K/V tiles through double-buffered shared memory while an
//! online softmax accumulates the output, with causal masking, ragged sequence lengths,
//! grouped-query attention and an 8-bit Q/K variant.

pub mod definition;
/// Device kernels
pub mod kernels;
pub mod launch;
