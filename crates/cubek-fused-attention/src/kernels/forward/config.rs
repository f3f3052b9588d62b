use crate::definition::TileGeometry;

/// Comptime configuration of the fused forward kernel.
///
/// One kernel is compiled per distinct value, so this only carries what changes the
/// generated code: the tile geometry, whether causal masking is applied, the plane
/// width the tile products are laid out for and how K/V tiles are copied.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct ForwardKernelConfig {
    pub geometry: TileGeometry,
    pub causal: bool,
    /// Units per plane, only read by plane-wide tile products
    pub plane_dim: u32,
    /// Whether producers copy K/V with [AsyncKvLoader](super::AsyncKvLoader)
    pub async_loads: bool,
}

impl ForwardKernelConfig {
    pub fn new(geometry: TileGeometry, causal: bool, plane_dim: u32, async_loads: bool) -> Self {
        Self {
            geometry,
            causal,
            plane_dim,
            async_loads,
        }
    }

    /// Whether the next value tile is issued alongside the next key tile, during the
    /// score phase.
    ///
    /// Asynchronous copies always are, and only block before the value phase ends.
    /// Synchronous producers hold the value tile back when keys are released early.
    pub fn values_with_keys(&self) -> bool {
        self.async_loads || !self.geometry.releases_key_early()
    }
}
