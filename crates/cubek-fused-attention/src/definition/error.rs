use cubecl::{ir::StorageType, server::LaunchError};

/// Errors raised before or while launching the fused forward pass.
#[derive(Debug, thiserror::Error)]
pub enum AttentionSetupError {
    /// Shapes, ranks or dtypes of the inputs are inconsistent.
    #[error("{0}")]
    InvalidInput(String),

    #[error("Head dimension {0} is not supported, expected one of 64, 128 or 256")]
    UnsupportedHeadDim(usize),

    #[error("Unsupported dtype: {0:?}")]
    UnsupportedDtype(StorageType),

    /// The tile geometry needs more shared memory than the device offers.
    #[error("Kernel needs {required} bytes of shared memory, device offers {available}")]
    SharedMemoryExceeded { required: usize, available: usize },

    #[error("Kernel needs {required} units per cube, device offers {available}")]
    CubeDimExceeded { required: u32, available: u32 },

    /// The dtype is valid for the kernel but the device cannot convert it.
    #[error("Device does not support {0:?}")]
    DtypeUnavailable(StorageType),

    /// Accelerated tile products were requested on a device that cannot run them.
    #[error("Accelerated tile products unavailable: {0}")]
    CmmaUnavailable(String),

    /// Asynchronous copies were requested on a device without unit barriers.
    #[error("Asynchronous K/V copies unavailable: no unit-level barriers")]
    AsyncCopyUnavailable,

    #[error("Kernel execution failed: {0:?}")]
    Execution(LaunchError),
}

impl AttentionSetupError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Whether the error comes from the device rather than from the inputs.
    pub fn is_device_limitation(&self) -> bool {
        matches!(
            self,
            Self::SharedMemoryExceeded { .. }
                | Self::CubeDimExceeded { .. }
                | Self::DtypeUnavailable(_)
                | Self::CmmaUnavailable(_)
                | Self::AsyncCopyUnavailable
                | Self::Execution(_)
        )
    }
}
