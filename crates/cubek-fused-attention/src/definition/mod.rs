mod error;
mod geometry;
mod problem;
mod quantization;

pub use error::*;
pub use geometry::*;
pub use problem::*;
pub use quantization::*;
