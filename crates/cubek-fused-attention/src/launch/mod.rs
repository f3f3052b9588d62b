mod base;
mod layout;
mod quantize;

pub use base::*;
pub use layout::{compute_contiguous_strides, is_contiguous};
pub use quantize::*;
