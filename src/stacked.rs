use cubecl_core::prelude::*;
use cubecl_linalg::tensor::TensorHandle;
use cubecl_runtime::server::Handle;

use crate::combine::TakeLeft;
use crate::kernels::elementwise::launch_elementwise_dense_output;
use crate::kernels::scan::launch_lengths_to_offsets;
use crate::JaggedError;

/// Result of a stacked densification: one dense tensor and one derived
/// offsets array per key.
pub struct StackedJaggedToDense<R: Runtime, E: Numeric, I: Int> {
    /// Densified output per key, `[batch, max_lengths[key], inner]` (the
    /// inner dim is dropped by the 1-D variant).
    pub dense_per_key: Vec<TensorHandle<R, E>>,
    /// Derived offsets per key, each of shape `[batch + 1]`, views into one
    /// shared buffer.
    pub offsets_per_key: Vec<TensorHandle<R, I>>,
}

/// Densify `keys` logical jagged tensors multiplexed into one value buffer.
///
/// `values` is the shared `[total, inner]` buffer, `lengths` the
/// `[keys, batch]` segment-length matrix, and `offset_per_key` the host-side
/// partition of the value buffer (length `keys + 1`). Per-key offsets are
/// derived on device with one scan launch; each key then drives its own
/// densification, back-to-back on the same stream since outputs are
/// disjoint.
pub fn stacked_jagged_2d_to_dense<R: Runtime, E: Numeric, I: Int>(
    client: &ComputeClient<R::Server, R::Channel>,
    values: &TensorHandleRef<'_, R>,
    lengths: &TensorHandleRef<'_, R>,
    offset_per_key: &[usize],
    max_lengths: &[usize],
    padding_value: E,
) -> Result<StackedJaggedToDense<R, E, I>, JaggedError> {
    if values.shape.len() != 2 {
        return Err(JaggedError::ShapeMismatch {
            argument: "values rank",
            expected: 2,
            actual: values.shape.len(),
        });
    }

    stacked_to_dense::<R, E, I>(
        client,
        values.handle,
        values.strides,
        values.shape,
        lengths,
        offset_per_key,
        max_lengths,
        padding_value,
        false,
    )
}

/// Single-channel variant of [`stacked_jagged_2d_to_dense`] for a rank-one
/// shared value buffer; per-key outputs have shape `[batch, max_lengths[key]]`.
pub fn stacked_jagged_1d_to_dense<R: Runtime, E: Numeric, I: Int>(
    client: &ComputeClient<R::Server, R::Channel>,
    values: &TensorHandleRef<'_, R>,
    lengths: &TensorHandleRef<'_, R>,
    offset_per_key: &[usize],
    max_lengths: &[usize],
    padding_value: E,
) -> Result<StackedJaggedToDense<R, E, I>, JaggedError> {
    if values.shape.len() != 1 {
        return Err(JaggedError::ShapeMismatch {
            argument: "values rank",
            expected: 1,
            actual: values.shape.len(),
        });
    }

    let shape = [values.shape[0], 1];
    let strides = [values.strides[0], 1];

    stacked_to_dense::<R, E, I>(
        client,
        values.handle,
        &strides,
        &shape,
        lengths,
        offset_per_key,
        max_lengths,
        padding_value,
        true,
    )
}

#[allow(clippy::too_many_arguments)]
fn stacked_to_dense<R: Runtime, E: Numeric, I: Int>(
    client: &ComputeClient<R::Server, R::Channel>,
    values_handle: &Handle,
    values_strides: &[usize],
    values_shape: &[usize],
    lengths: &TensorHandleRef<'_, R>,
    offset_per_key: &[usize],
    max_lengths: &[usize],
    padding_value: E,
    squeeze_inner: bool,
) -> Result<StackedJaggedToDense<R, E, I>, JaggedError> {
    if lengths.shape.len() != 2 {
        return Err(JaggedError::ShapeMismatch {
            argument: "lengths rank",
            expected: 2,
            actual: lengths.shape.len(),
        });
    }
    let keys = lengths.shape[0];
    let batch = lengths.shape[1];
    let inner = values_shape[1];

    check_offset_per_key(offset_per_key, keys, values_shape[0])?;
    if max_lengths.len() != keys {
        return Err(JaggedError::ShapeMismatch {
            argument: "max_lengths",
            expected: keys,
            actual: max_lengths.len(),
        });
    }
    // Byte-offset slicing below requires the shared buffer to be contiguous.
    if values_strides[0] != inner || values_strides[1] != 1 {
        return Err(JaggedError::ShapeMismatch {
            argument: "values outer stride",
            expected: inner,
            actual: values_strides[0],
        });
    }

    if keys == 0 {
        return Ok(StackedJaggedToDense {
            dense_per_key: Vec::new(),
            offsets_per_key: Vec::new(),
        });
    }

    let offsets_all = TensorHandle::<R, I>::empty(client, vec![keys, batch + 1]);
    launch_lengths_to_offsets::<R, I>(client, lengths, &offsets_all.as_ref())?;

    let elem = E::as_elem().size();
    let offsets_elem = I::as_elem().size();

    let mut dense_per_key = Vec::with_capacity(keys);
    let mut offsets_per_key = Vec::with_capacity(keys);

    // Slices are taken by advancing the handle's byte offset; the tensor
    // shapes bound every access, so the tail of the shared buffer can stay
    // attached to each view.
    for key in 0..keys {
        let offsets_start = (key * (batch + 1) * offsets_elem) as u64;
        let offsets = TensorHandle::<R, I>::new_contiguous(
            vec![batch + 1],
            offsets_all.handle.clone().offset_start(offsets_start),
        );

        let rows = offset_per_key[key + 1] - offset_per_key[key];
        let values_start = (offset_per_key[key] * inner * elem) as u64;
        let key_values = TensorHandle::<R, E>::new_contiguous(
            vec![rows, inner],
            values_handle.clone().offset_start(values_start),
        );

        let dense =
            TensorHandle::<R, E>::empty(client, vec![batch, max_lengths[key], inner]);
        launch_elementwise_dense_output::<R, E, I, TakeLeft>(
            client,
            &key_values.as_ref(),
            std::slice::from_ref(&offsets.as_ref()),
            None,
            &dense.as_ref(),
            padding_value,
        )?;

        let dense = if squeeze_inner {
            TensorHandle::new_contiguous(vec![batch, max_lengths[key]], dense.handle)
        } else {
            dense
        };

        dense_per_key.push(dense);
        offsets_per_key.push(offsets);
    }

    Ok(StackedJaggedToDense {
        dense_per_key,
        offsets_per_key,
    })
}

/// Check that a per-key partition covers the shared value buffer without
/// gaps or overlaps.
pub(crate) fn check_offset_per_key(
    offset_per_key: &[usize],
    num_keys: usize,
    total_rows: usize,
) -> Result<(), JaggedError> {
    if offset_per_key.len() != num_keys + 1 {
        return Err(JaggedError::InvalidOffsets {
            reason: format!(
                "offset_per_key must have {} entries for {num_keys} keys, got {}",
                num_keys + 1,
                offset_per_key.len()
            ),
        });
    }
    if offset_per_key[0] != 0 {
        return Err(JaggedError::InvalidOffsets {
            reason: "offset_per_key must start at zero".into(),
        });
    }
    if offset_per_key.windows(2).any(|pair| pair[1] < pair[0]) {
        return Err(JaggedError::InvalidOffsets {
            reason: "offset_per_key must be non-decreasing".into(),
        });
    }
    if offset_per_key[num_keys] != total_rows {
        return Err(JaggedError::InvalidOffsets {
            reason: format!(
                "offset_per_key must end at the value buffer size {total_rows}, got {}",
                offset_per_key[num_keys]
            ),
        });
    }
    Ok(())
}
