use cubecl_core::prelude::*;
use cubecl_linalg::tensor::{into_contiguous, TensorHandle};

use crate::combine::{Add, Mul, TakeLeft, TakeRight};
use crate::config::check_jagged_dense_shape;
use crate::kernels::elementwise::{
    launch_elementwise_dense_output, launch_elementwise_jagged_output,
    launch_jagged_jagged_dense_output,
};
use crate::ops::{offsets_refs, owned_offsets, owned_tensor, zeros_tensor};
use crate::JaggedError;

/// Forward result of [`jagged_dense_add`].
pub struct JaggedDenseAdd<R: Runtime, E: Numeric, I: Int> {
    /// Dense sum of shape equal to the dense operand.
    pub output: TensorHandle<R, E>,
    offsets: Vec<TensorHandle<R, I>>,
    total_length: usize,
    inner: usize,
}

/// Add a jagged tensor to a dense one, producing a dense tensor.
///
/// Masked positions contribute zero from the jagged side, so the output
/// equals the dense operand there.
pub fn jagged_dense_add<R: Runtime, E: Numeric, I: Int>(
    client: &ComputeClient<R::Server, R::Channel>,
    x_values: &TensorHandleRef<'_, R>,
    x_offsets: &[TensorHandleRef<'_, R>],
    y: &TensorHandleRef<'_, R>,
) -> Result<JaggedDenseAdd<R, E, I>, JaggedError> {
    let output = TensorHandle::<R, E>::empty(client, y.shape.to_vec());
    launch_elementwise_dense_output::<R, E, I, Add>(
        client,
        x_values,
        x_offsets,
        Some(y),
        &output.as_ref(),
        E::from_int(0),
    )?;

    Ok(JaggedDenseAdd {
        output,
        offsets: owned_offsets(x_offsets),
        total_length: x_values.shape[0],
        inner: x_values.shape[1],
    })
}

impl<R: Runtime, E: Numeric, I: Int> JaggedDenseAdd<R, E, I> {
    /// Gradients w.r.t. `(x_values, y)`.
    ///
    /// The jagged gradient is the incoming gradient restricted to the jagged
    /// support; the dense gradient is the incoming gradient unchanged,
    /// returned as a view sharing its storage.
    pub fn backward(
        &self,
        client: &ComputeClient<R::Server, R::Channel>,
        grad: &TensorHandleRef<'_, R>,
    ) -> Result<(TensorHandle<R, E>, TensorHandle<R, E>), JaggedError> {
        let grad_x = zeros_tensor::<R, E>(client, vec![self.total_length, self.inner]);
        let offsets = offsets_refs(&self.offsets);
        launch_elementwise_jagged_output::<R, E, I, TakeRight>(
            client,
            None,
            &offsets,
            grad,
            &grad_x.as_ref(),
        )?;

        Ok((grad_x, owned_tensor(grad)))
    }
}

/// Forward result of [`jagged_dense_add_jagged_output`].
pub struct JaggedDenseAddJaggedOutput<R: Runtime, E: Numeric, I: Int> {
    /// Jagged sum sharing the input offsets, shape `[total, inner]`.
    pub values: TensorHandle<R, E>,
    offsets: Vec<TensorHandle<R, I>>,
    y_shape: Vec<usize>,
}

/// Add a dense tensor to a jagged one, keeping the jagged layout.
///
/// The output starts as a copy of `x_values`, so physical elements outside
/// the dense extents still carry `x` rather than garbage.
pub fn jagged_dense_add_jagged_output<R: Runtime, E: Numeric, I: Int>(
    client: &ComputeClient<R::Server, R::Channel>,
    x_values: &TensorHandleRef<'_, R>,
    x_offsets: &[TensorHandleRef<'_, R>],
    y: &TensorHandleRef<'_, R>,
) -> Result<JaggedDenseAddJaggedOutput<R, E, I>, JaggedError> {
    // Validate eagerly: the copy below already enqueues device work.
    let offsets_lens: Vec<usize> = x_offsets.iter().map(|o| o.shape[0]).collect();
    check_jagged_dense_shape(x_values.shape, &offsets_lens, y.shape)?;

    let values = if x_values.shape.iter().product::<usize>() == 0 {
        zeros_tensor::<R, E>(client, x_values.shape.to_vec())
    } else {
        let x_copy = unsafe {
            TensorHandleRef::<R>::from_raw_parts(
                x_values.handle,
                x_values.strides,
                x_values.shape,
                size_of::<E>(),
            )
        };
        into_contiguous::<R, E>(client, x_copy)
    };

    launch_elementwise_jagged_output::<R, E, I, Add>(
        client,
        Some(x_values),
        x_offsets,
        y,
        &values.as_ref(),
    )?;

    Ok(JaggedDenseAddJaggedOutput {
        values,
        offsets: owned_offsets(x_offsets),
        y_shape: y.shape.to_vec(),
    })
}

impl<R: Runtime, E: Numeric, I: Int> JaggedDenseAddJaggedOutput<R, E, I> {
    /// Gradients w.r.t. `(x_values, y)`.
    ///
    /// The jagged gradient passes through unchanged (a view sharing the
    /// incoming storage); the dense gradient is the incoming jagged gradient
    /// densified with zero padding.
    pub fn backward(
        &self,
        client: &ComputeClient<R::Server, R::Channel>,
        grad_values: &TensorHandleRef<'_, R>,
    ) -> Result<(TensorHandle<R, E>, TensorHandle<R, E>), JaggedError> {
        let grad_y = TensorHandle::<R, E>::empty(client, self.y_shape.clone());
        let offsets = offsets_refs(&self.offsets);
        launch_elementwise_dense_output::<R, E, I, TakeLeft>(
            client,
            grad_values,
            &offsets,
            None,
            &grad_y.as_ref(),
            E::from_int(0),
        )?;

        Ok((owned_tensor(grad_values), grad_y))
    }
}

/// Forward result of [`jagged_dense_mul`].
pub struct JaggedDenseMul<R: Runtime, E: Numeric, I: Int> {
    /// Jagged product sharing the input offsets, shape `[total, inner]`.
    pub values: TensorHandle<R, E>,
    offsets: Vec<TensorHandle<R, I>>,
    x_values: TensorHandle<R, E>,
    y: TensorHandle<R, E>,
}

/// Multiply a jagged tensor by a dense one elementwise, keeping the jagged
/// layout. Physical elements outside the dense extents become zero.
pub fn jagged_dense_mul<R: Runtime, E: Numeric, I: Int>(
    client: &ComputeClient<R::Server, R::Channel>,
    x_values: &TensorHandleRef<'_, R>,
    x_offsets: &[TensorHandleRef<'_, R>],
    y: &TensorHandleRef<'_, R>,
) -> Result<JaggedDenseMul<R, E, I>, JaggedError> {
    if x_values.shape.len() != 2 {
        return Err(JaggedError::ShapeMismatch {
            argument: "values rank",
            expected: 2,
            actual: x_values.shape.len(),
        });
    }

    let values = zeros_tensor::<R, E>(client, x_values.shape.to_vec());
    launch_elementwise_jagged_output::<R, E, I, Mul>(
        client,
        Some(x_values),
        x_offsets,
        y,
        &values.as_ref(),
    )?;

    Ok(JaggedDenseMul {
        values,
        offsets: owned_offsets(x_offsets),
        x_values: owned_tensor(x_values),
        y: owned_tensor(y),
    })
}

impl<R: Runtime, E: Numeric, I: Int> JaggedDenseMul<R, E, I> {
    /// Gradients w.r.t. `(x_values, y)`.
    ///
    /// The jagged gradient is the incoming gradient times the dense operand,
    /// scattered into jagged storage; the dense gradient is the incoming
    /// gradient times the jagged operand, densified with zero padding.
    pub fn backward(
        &self,
        client: &ComputeClient<R::Server, R::Channel>,
        grad_values: &TensorHandleRef<'_, R>,
    ) -> Result<(TensorHandle<R, E>, TensorHandle<R, E>), JaggedError> {
        let offsets = offsets_refs(&self.offsets);

        let grad_x = zeros_tensor::<R, E>(client, self.x_values.shape.clone());
        launch_elementwise_jagged_output::<R, E, I, Mul>(
            client,
            Some(grad_values),
            &offsets,
            &self.y.as_ref(),
            &grad_x.as_ref(),
        )?;

        let grad_y = TensorHandle::<R, E>::empty(client, self.y.shape.clone());
        launch_jagged_jagged_dense_output::<R, E, I, Mul>(
            client,
            grad_values,
            &self.x_values.as_ref(),
            &offsets,
            &grad_y.as_ref(),
            E::from_int(0),
        )?;

        Ok((grad_x, grad_y))
    }
}
