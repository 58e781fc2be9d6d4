use cubecl_core::prelude::*;
use cubecl_linalg::tensor::TensorHandle;
use num_traits::ToPrimitive;

use crate::combine::{TakeLeft, TakeRight};
use crate::kernels::elementwise::{
    launch_elementwise_dense_output, launch_elementwise_jagged_output,
};
use crate::ops::{offsets_refs, owned_offsets, read_last_offset, zeros_tensor};
use crate::{JaggedError, MAX_JAGGED_DEPTH};

/// Forward result of [`jagged_to_padded_dense`].
pub struct JaggedToPaddedDense<R: Runtime, E: Numeric, I: Int> {
    /// Densified output of shape `[outer, max_lengths.., inner]`.
    pub output: TensorHandle<R, E>,
    offsets: Vec<TensorHandle<R, I>>,
    total_length: usize,
    inner: usize,
}

/// Densify a jagged tensor, substituting `padding_value` at every dense
/// position with no physical element.
///
/// `max_lengths` gives the dense extent of each nesting depth; segments
/// longer than their extent are truncated.
pub fn jagged_to_padded_dense<R: Runtime, E: Numeric, I: Int>(
    client: &ComputeClient<R::Server, R::Channel>,
    values: &TensorHandleRef<'_, R>,
    offsets: &[TensorHandleRef<'_, R>],
    max_lengths: &[usize],
    padding_value: E,
) -> Result<JaggedToPaddedDense<R, E, I>, JaggedError> {
    let depth = offsets.len();
    if depth == 0 || depth > MAX_JAGGED_DEPTH {
        return Err(JaggedError::UnsupportedDepth { depth });
    }
    if max_lengths.len() != depth {
        return Err(JaggedError::ShapeMismatch {
            argument: "max_lengths",
            expected: depth,
            actual: max_lengths.len(),
        });
    }
    if values.shape.len() != 2 {
        return Err(JaggedError::ShapeMismatch {
            argument: "values rank",
            expected: 2,
            actual: values.shape.len(),
        });
    }
    let outer = outer_size(&offsets[0])?;

    let mut dense_shape = Vec::with_capacity(depth + 2);
    dense_shape.push(outer);
    dense_shape.extend_from_slice(max_lengths);
    dense_shape.push(values.shape[1]);

    let output = TensorHandle::<R, E>::empty(client, dense_shape);
    launch_elementwise_dense_output::<R, E, I, TakeLeft>(
        client,
        values,
        offsets,
        None,
        &output.as_ref(),
        padding_value,
    )?;

    Ok(JaggedToPaddedDense {
        output,
        offsets: owned_offsets(offsets),
        total_length: values.shape[0],
        inner: values.shape[1],
    })
}

impl<R: Runtime, E: Numeric, I: Int> JaggedToPaddedDense<R, E, I> {
    /// Gradient w.r.t. the jagged values: the incoming dense gradient
    /// restricted to the jagged support. Truncated rows receive zero.
    pub fn backward(
        &self,
        client: &ComputeClient<R::Server, R::Channel>,
        grad: &TensorHandleRef<'_, R>,
    ) -> Result<TensorHandle<R, E>, JaggedError> {
        let grad_values = zeros_tensor::<R, E>(client, vec![self.total_length, self.inner]);
        let offsets = offsets_refs(&self.offsets);
        launch_elementwise_jagged_output::<R, E, I, TakeRight>(
            client,
            None,
            &offsets,
            grad,
            &grad_values.as_ref(),
        )?;
        Ok(grad_values)
    }
}

/// Forward result of [`dense_to_jagged`].
pub struct DenseToJagged<R: Runtime, E: Numeric, I: Int> {
    /// Extracted value buffer of shape `[total_length, inner]`.
    pub values: TensorHandle<R, E>,
    /// The offset sequences describing the output, shared with the input.
    pub offsets: Vec<TensorHandle<R, I>>,
    dense_shape: Vec<usize>,
}

/// Extract the jagged support of a dense tensor into a value buffer.
///
/// When `total_length` is not given, it is read back synchronously from the
/// final entry of the innermost offsets array. Positions outside the dense
/// extents stay zero.
pub fn dense_to_jagged<R: Runtime, E: Numeric, I: Int + CubeElement + ToPrimitive>(
    client: &ComputeClient<R::Server, R::Channel>,
    dense: &TensorHandleRef<'_, R>,
    offsets: &[TensorHandleRef<'_, R>],
    total_length: Option<usize>,
) -> Result<DenseToJagged<R, E, I>, JaggedError> {
    let depth = offsets.len();
    if depth == 0 || depth > MAX_JAGGED_DEPTH {
        return Err(JaggedError::UnsupportedDepth { depth });
    }
    if dense.shape.len() != depth + 2 {
        return Err(JaggedError::ShapeMismatch {
            argument: "dense rank",
            expected: depth + 2,
            actual: dense.shape.len(),
        });
    }

    let inner = dense.shape[depth + 1];
    let total = match total_length {
        Some(total) => total,
        None => read_last_offset::<R, I>(client, &offsets[depth - 1])?,
    };

    let values = zeros_tensor::<R, E>(client, vec![total, inner]);
    launch_elementwise_jagged_output::<R, E, I, TakeRight>(
        client,
        None,
        offsets,
        dense,
        &values.as_ref(),
    )?;

    Ok(DenseToJagged {
        values,
        offsets: owned_offsets(offsets),
        dense_shape: dense.shape.to_vec(),
    })
}

impl<R: Runtime, E: Numeric, I: Int> DenseToJagged<R, E, I> {
    /// Gradient w.r.t. the dense input: the incoming jagged gradient
    /// densified back to the original dense shape, zero at masked positions.
    pub fn backward(
        &self,
        client: &ComputeClient<R::Server, R::Channel>,
        grad_values: &TensorHandleRef<'_, R>,
    ) -> Result<TensorHandle<R, E>, JaggedError> {
        let output = TensorHandle::<R, E>::empty(client, self.dense_shape.clone());
        let offsets = offsets_refs(&self.offsets);
        launch_elementwise_dense_output::<R, E, I, TakeLeft>(
            client,
            grad_values,
            &offsets,
            None,
            &output.as_ref(),
            E::from_int(0),
        )?;
        Ok(output)
    }
}

/// Densify a single-channel jagged tensor of depth one.
///
/// Convenience wrapper around the padded-dense kernel for `values` of rank
/// one; returns a `[outer, max_length]` tensor.
pub fn jagged_1d_to_dense<R: Runtime, E: Numeric, I: Int>(
    client: &ComputeClient<R::Server, R::Channel>,
    values: &TensorHandleRef<'_, R>,
    offsets: &TensorHandleRef<'_, R>,
    max_length: usize,
    padding_value: E,
) -> Result<TensorHandle<R, E>, JaggedError> {
    if values.shape.len() != 1 {
        return Err(JaggedError::ShapeMismatch {
            argument: "values rank",
            expected: 1,
            actual: values.shape.len(),
        });
    }
    let outer = outer_size(offsets)?;

    let values_shape = [values.shape[0], 1];
    let values_strides = [values.strides[0], 1];
    let values_2d = unsafe {
        TensorHandleRef::from_raw_parts(
            values.handle,
            &values_strides,
            &values_shape,
            size_of::<E>(),
        )
    };

    let output = TensorHandle::<R, E>::empty(client, vec![outer, max_length]);
    let output_shape = [outer, max_length, 1];
    let output_strides = [output.strides[0], output.strides[1], 1];
    let output_3d = unsafe {
        TensorHandleRef::from_raw_parts(
            &output.handle,
            &output_strides,
            &output_shape,
            size_of::<E>(),
        )
    };

    launch_elementwise_dense_output::<R, E, I, TakeLeft>(
        client,
        &values_2d,
        std::slice::from_ref(offsets),
        None,
        &output_3d,
        padding_value,
    )?;

    Ok(output)
}

pub(crate) fn outer_size<R: Runtime>(
    offsets: &TensorHandleRef<'_, R>,
) -> Result<usize, JaggedError> {
    if offsets.shape.len() != 1 || offsets.shape[0] == 0 {
        return Err(JaggedError::InvalidOffsets {
            reason: "offsets must be a non-empty 1-D tensor".into(),
        });
    }
    Ok(offsets.shape[0] - 1)
}
