use cubecl::{
    Runtime, client::ComputeClient, ir::StorageType, prelude::TensorHandleRef,
    std::tensor::TensorHandle,
};

use crate::definition::AttentionSetupError;

/// Compute contiguous strides for a given shape.
pub fn compute_contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Whether the strides describe a dense row-major layout.
///
/// Strides of size-1 dimensions are ignored since they never move the offset.
pub fn is_contiguous(shape: &[usize], strides: &[usize]) -> bool {
    let expected = compute_contiguous_strides(shape);
    shape
        .iter()
        .zip(strides.iter().zip(expected.iter()))
        .all(|(dim, (stride, expected))| *dim == 1 || stride == expected)
}

/// Returns a dense row-major copy of `input`, or `None` when it already is one.
pub(crate) fn contiguous_copy<R: Runtime>(
    client: &ComputeClient<R>,
    input: &TensorHandleRef<R>,
    dtype: StorageType,
) -> Result<Option<TensorHandle<R>>, AttentionSetupError> {
    if is_contiguous(input.shape, input.strides) {
        return Ok(None);
    }

    tracing::trace!(
        shape = ?input.shape,
        strides = ?input.strides,
        "copying input to a contiguous layout"
    );

    cubecl::std::tensor::into_contiguous_ref(client, input, dtype)
        .map(Some)
        .map_err(AttentionSetupError::Execution)
}
