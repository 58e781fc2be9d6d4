use cubecl_core::prelude::*;
use cubecl_linalg::tensor::TensorHandle;

use crate::kernels::vecmat::{
    check_vecmat_shape, launch_dense_vec_jagged_matmul, launch_dense_vec_jagged_matmul_transposed,
    launch_dense_vec_jagged_outer_product, JaggedPrecision,
};
use crate::ops::{owned_tensor, zeros_tensor};
use crate::JaggedError;

/// Forward result of [`batched_dense_vec_jagged_2d_mul`].
pub struct BatchedDenseVecJagged2dMul<R: Runtime, P: JaggedPrecision, I: Int> {
    /// Length-weighted sums of shape `[batch, heads, dim]`.
    pub output: TensorHandle<R, P::ES>,
    v: TensorHandle<R, P::ES>,
    a_values: TensorHandle<R, P::ES>,
    a_offsets: TensorHandle<R, I>,
}

/// Batched dense-vector × jagged-matrix product.
///
/// `v` has shape `[batch * heads, max_len]` and `a_values` `[total,
/// heads * dim]` with `a_offsets` of length `batch + 1`. For each `(batch,
/// head)` the output row is the sum over the segment (clamped to `max_len`)
/// of the vector weight times the matrix row; zero-length segments produce
/// zero rows. Accumulation uses [`JaggedPrecision::EA`].
pub fn batched_dense_vec_jagged_2d_mul<R: Runtime, P: JaggedPrecision, I: Int>(
    client: &ComputeClient<R::Server, R::Channel>,
    v: &TensorHandleRef<'_, R>,
    a_values: &TensorHandleRef<'_, R>,
    a_offsets: &TensorHandleRef<'_, R>,
) -> Result<BatchedDenseVecJagged2dMul<R, P, I>, JaggedError> {
    let shape = check_vecmat_shape(v.shape, a_values.shape, a_offsets.shape)?;

    let output =
        TensorHandle::<R, P::ES>::empty(client, vec![shape.batch, shape.heads, shape.dim]);
    launch_dense_vec_jagged_matmul::<R, P, I>(client, v, a_values, a_offsets, &output.as_ref())?;

    Ok(BatchedDenseVecJagged2dMul {
        output,
        v: owned_tensor(v),
        a_values: owned_tensor(a_values),
        a_offsets: owned_tensor(a_offsets),
    })
}

impl<R: Runtime, P: JaggedPrecision, I: Int> BatchedDenseVecJagged2dMul<R, P, I> {
    /// Gradients w.r.t. `(v, a_values)`.
    ///
    /// The vector gradient is the transposed product, exactly zero at
    /// positions past each segment's length; the matrix gradient is the
    /// outer product of the vector and the incoming gradient, scattered into
    /// the segment rows of a zero-initialized buffer.
    pub fn backward(
        &self,
        client: &ComputeClient<R::Server, R::Channel>,
        grad: &TensorHandleRef<'_, R>,
    ) -> Result<(TensorHandle<R, P::ES>, TensorHandle<R, P::ES>), JaggedError> {
        let v_grad = TensorHandle::<R, P::ES>::empty(client, self.v.shape.clone());
        launch_dense_vec_jagged_matmul_transposed::<R, P, I>(
            client,
            grad,
            &self.a_values.as_ref(),
            &self.a_offsets.as_ref(),
            &v_grad.as_ref(),
        )?;

        let a_grad = zeros_tensor::<R, P::ES>(client, self.a_values.shape.clone());
        launch_dense_vec_jagged_outer_product::<R, P, I>(
            client,
            &self.v.as_ref(),
            grad,
            &self.a_offsets.as_ref(),
            &a_grad.as_ref(),
        )?;

        Ok((v_grad, a_grad))
    }
}
