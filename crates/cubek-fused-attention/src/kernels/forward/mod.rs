//! Fused attention forward kernel.
//!
//! Each cube owns a block of query rows for one (batch, head) and streams the matching
//! K/V head through double-buffered shared memory. Producer units move tiles, either
//! element by element or with asynchronous copies (see [KvLoader]). Consumer units run
//! the online softmax, one query row per unit. The tile products run either
//! per unit or on cmma fragments per plane, see [TileMatmul].
//!
//! Shape conventions (row-major, contiguous):
//! - Q, O: [batch, qo_heads, seq_q, head_dim]
//! - K, V: [batch, kv_heads, seq_kv, head_dim]

mod config;
mod kernel;
mod matmul;
mod pipeline;
mod roles;
mod softmax;

pub use config::*;
pub use kernel::*;
pub use matmul::*;
pub use pipeline::*;
pub use roles::*;
pub use softmax::*;
