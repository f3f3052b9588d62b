//! Device kernels of the fused forward pass

pub mod forward;
pub mod quantize;
