use cubecl_core as cubecl;
use cubecl_core::prelude::*;

use crate::config::JaggedConfig;
use crate::JaggedError;

/// Precision pairing for the batched dense-vector × jagged-matrix product.
///
/// `ES` is the storage element type, `EA` the type the per-unit reductions
/// accumulate in. Narrow floating formats accumulate in f32 to bound
/// rounding error.
pub trait JaggedPrecision: Send + Sync + 'static {
    /// Precision of the stored tensors.
    type ES: Numeric;
    /// Precision used for accumulation.
    type EA: Numeric;
}

impl<ES: Numeric, EA: Numeric> JaggedPrecision for (ES, EA) {
    type ES = ES;
    type EA = EA;
}

impl JaggedPrecision for f32 {
    type ES = f32;
    type EA = f32;
}

impl JaggedPrecision for f64 {
    type ES = f64;
    type EA = f64;
}

impl JaggedPrecision for half::f16 {
    type ES = half::f16;
    type EA = f32;
}

impl JaggedPrecision for half::bf16 {
    type ES = half::bf16;
    type EA = f32;
}

/// Validated sizes of one batched vector × jagged-matrix call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct VecMatShape {
    pub batch: usize,
    pub heads: usize,
    pub dim: usize,
    pub max_len: usize,
    pub total: usize,
}

pub(crate) fn check_vecmat_shape(
    v_shape: &[usize],
    a_shape: &[usize],
    offsets_shape: &[usize],
) -> Result<VecMatShape, JaggedError> {
    if offsets_shape.len() != 1 || offsets_shape[0] == 0 {
        return Err(JaggedError::InvalidOffsets {
            reason: "offsets must be a non-empty 1-D tensor".into(),
        });
    }
    if v_shape.len() != 2 {
        return Err(JaggedError::ShapeMismatch {
            argument: "v rank",
            expected: 2,
            actual: v_shape.len(),
        });
    }
    if a_shape.len() != 2 {
        return Err(JaggedError::ShapeMismatch {
            argument: "a_values rank",
            expected: 2,
            actual: a_shape.len(),
        });
    }

    let batch = offsets_shape[0] - 1;
    let heads = if batch == 0 {
        if v_shape[0] != 0 {
            return Err(JaggedError::ShapeMismatch {
                argument: "v outer size",
                expected: 0,
                actual: v_shape[0],
            });
        }
        0
    } else {
        if v_shape[0] % batch != 0 {
            return Err(JaggedError::ShapeMismatch {
                argument: "v outer size (batch * heads)",
                expected: batch,
                actual: v_shape[0],
            });
        }
        v_shape[0] / batch
    };
    let dim = if heads == 0 {
        0
    } else {
        if a_shape[1] % heads != 0 {
            return Err(JaggedError::ShapeMismatch {
                argument: "a_values inner size (heads * dim)",
                expected: heads,
                actual: a_shape[1],
            });
        }
        a_shape[1] / heads
    };

    Ok(VecMatShape {
        batch,
        heads,
        dim,
        max_len: v_shape[1],
        total: a_shape[0],
    })
}

#[cube(launch_unchecked)]
fn dense_vec_jagged_matmul_kernel<ES: Numeric, EA: Numeric, I: Int>(
    v: &Tensor<ES>,
    a_values: &Tensor<ES>,
    a_offsets: &Tensor<I>,
    output: &mut Tensor<ES>,
    #[comptime] bound_checks: bool,
) {
    let row = CUBE_POS * CUBE_DIM_Y + UNIT_POS_Y;
    let batch_size = output.shape(0);
    let heads = output.shape(1);
    let dim = output.shape(2);

    if bound_checks && row >= batch_size * heads {
        return;
    }

    let batch = row / heads;
    let head = row % heads;
    let max_len = v.shape(1);

    let begin = u32::cast_from(a_offsets[batch]);
    let end = u32::cast_from(a_offsets[batch + 1]);
    let mut length = end - begin;
    if length > max_len {
        length = max_len;
    }

    for d in range_stepped(UNIT_POS_X, dim, CUBE_DIM_X) {
        let mut acc = EA::from_int(0);
        for l in 0..length {
            let vec_val = EA::cast_from(v[row * v.stride(0) + l * v.stride(1)]);
            let mat_val = EA::cast_from(
                a_values[(begin + l) * a_values.stride(0) + (head * dim + d) * a_values.stride(1)],
            );
            acc += vec_val * mat_val;
        }
        output[batch * output.stride(0) + head * output.stride(1) + d * output.stride(2)] =
            ES::cast_from(acc);
    }
}

#[cube(launch_unchecked)]
fn dense_vec_jagged_matmul_transposed_kernel<ES: Numeric, EA: Numeric, I: Int>(
    grad: &Tensor<ES>,
    a_values: &Tensor<ES>,
    a_offsets: &Tensor<I>,
    v_grad: &mut Tensor<ES>,
    #[comptime] bound_checks: bool,
) {
    let row = CUBE_POS * CUBE_DIM_Y + UNIT_POS_Y;
    let heads = grad.shape(1);
    let dim = grad.shape(2);

    if bound_checks && row >= grad.shape(0) * heads {
        return;
    }

    let batch = row / heads;
    let head = row % heads;
    let max_len = v_grad.shape(1);

    let begin = u32::cast_from(a_offsets[batch]);
    let end = u32::cast_from(a_offsets[batch + 1]);
    let mut length = end - begin;
    if length > max_len {
        length = max_len;
    }

    for l in range_stepped(UNIT_POS_X, max_len, CUBE_DIM_X) {
        let mut acc = EA::from_int(0);
        // Positions past the segment keep the explicit zero.
        if l < length {
            for d in 0..dim {
                let grad_val = EA::cast_from(
                    grad[batch * grad.stride(0) + head * grad.stride(1) + d * grad.stride(2)],
                );
                let mat_val = EA::cast_from(
                    a_values
                        [(begin + l) * a_values.stride(0) + (head * dim + d) * a_values.stride(1)],
                );
                acc += grad_val * mat_val;
            }
        }
        v_grad[row * v_grad.stride(0) + l * v_grad.stride(1)] = ES::cast_from(acc);
    }
}

#[cube(launch_unchecked)]
fn dense_vec_jagged_outer_product_kernel<ES: Numeric, I: Int>(
    v: &Tensor<ES>,
    grad: &Tensor<ES>,
    a_offsets: &Tensor<I>,
    a_grad: &mut Tensor<ES>,
    #[comptime] bound_checks: bool,
) {
    let row = CUBE_POS * CUBE_DIM_Y + UNIT_POS_Y;
    let batch_size = grad.shape(0);
    let heads = grad.shape(1);
    let dim = grad.shape(2);
    let max_len = v.shape(1);

    if bound_checks && row >= batch_size * max_len {
        return;
    }

    let batch = row / max_len;
    let l = row % max_len;

    let begin = u32::cast_from(a_offsets[batch]);
    let end = u32::cast_from(a_offsets[batch + 1]);
    let mut length = end - begin;
    if length > max_len {
        length = max_len;
    }

    // Rows past the segment are untouched; the output is zero-initialized.
    if l < length {
        for hd in range_stepped(UNIT_POS_X, heads * dim, CUBE_DIM_X) {
            let head = hd / dim;
            let d = hd % dim;
            let vec_val = v[(batch * heads + head) * v.stride(0) + l * v.stride(1)];
            let grad_val =
                grad[batch * grad.stride(0) + head * grad.stride(1) + d * grad.stride(2)];
            a_grad[(begin + l) * a_grad.stride(0) + hd * a_grad.stride(1)] = vec_val * grad_val;
        }
    }
}

/// Launch the batched dense-vector × jagged-matrix forward kernel.
///
/// `output` must have shape `[batch, heads, dim]`; every position is written,
/// so zero-length segments produce zero rows without prior initialization.
pub fn launch_dense_vec_jagged_matmul<R: Runtime, P: JaggedPrecision, I: Int>(
    client: &ComputeClient<R::Server, R::Channel>,
    v: &TensorHandleRef<'_, R>,
    a_values: &TensorHandleRef<'_, R>,
    a_offsets: &TensorHandleRef<'_, R>,
    output: &TensorHandleRef<'_, R>,
) -> Result<(), JaggedError> {
    let shape = check_vecmat_shape(v.shape, a_values.shape, a_offsets.shape)?;
    check_output_shape(output.shape, &shape)?;

    let rows = shape.batch * shape.heads;
    if rows == 0 || shape.dim == 0 {
        return Ok(());
    }

    let config = JaggedConfig::generate(rows as u32, shape.dim as u32);
    log::debug!("dense-vec x jagged-matrix forward: rows={rows}, {config:?}");

    unsafe {
        dense_vec_jagged_matmul_kernel::launch_unchecked::<P::ES, P::EA, I, R>(
            client,
            config.cube_count,
            config.cube_dim,
            v.as_tensor_arg(1),
            a_values.as_tensor_arg(1),
            a_offsets.as_tensor_arg(1),
            output.as_tensor_arg(1),
            config.bound_checks,
        );
    }

    Ok(())
}

/// Launch the transposed product producing the dense-vector gradient.
///
/// `v_grad` must have shape `[batch * heads, max_len]`; every position is
/// written and positions at or past each segment's length are zeroed.
pub fn launch_dense_vec_jagged_matmul_transposed<R: Runtime, P: JaggedPrecision, I: Int>(
    client: &ComputeClient<R::Server, R::Channel>,
    grad: &TensorHandleRef<'_, R>,
    a_values: &TensorHandleRef<'_, R>,
    a_offsets: &TensorHandleRef<'_, R>,
    v_grad: &TensorHandleRef<'_, R>,
) -> Result<(), JaggedError> {
    let shape = check_vecmat_shape(v_grad.shape, a_values.shape, a_offsets.shape)?;
    check_grad_shape(grad.shape, &shape)?;

    let rows = shape.batch * shape.heads;
    if rows == 0 || shape.max_len == 0 {
        return Ok(());
    }

    let config = JaggedConfig::generate(rows as u32, shape.max_len as u32);
    log::debug!("dense-vec x jagged-matrix transposed: rows={rows}, {config:?}");

    unsafe {
        dense_vec_jagged_matmul_transposed_kernel::launch_unchecked::<P::ES, P::EA, I, R>(
            client,
            config.cube_count,
            config.cube_dim,
            grad.as_tensor_arg(1),
            a_values.as_tensor_arg(1),
            a_offsets.as_tensor_arg(1),
            v_grad.as_tensor_arg(1),
            config.bound_checks,
        );
    }

    Ok(())
}

/// Launch the outer-product scatter producing the jagged-matrix gradient.
///
/// `a_grad` must have shape `[total, heads * dim]` and be zero-initialized:
/// only rows inside a segment (clamped to `max_len`) are written.
pub fn launch_dense_vec_jagged_outer_product<R: Runtime, P: JaggedPrecision, I: Int>(
    client: &ComputeClient<R::Server, R::Channel>,
    v: &TensorHandleRef<'_, R>,
    grad: &TensorHandleRef<'_, R>,
    a_offsets: &TensorHandleRef<'_, R>,
    a_grad: &TensorHandleRef<'_, R>,
) -> Result<(), JaggedError> {
    let shape = check_vecmat_shape(v.shape, a_grad.shape, a_offsets.shape)?;
    check_grad_shape(grad.shape, &shape)?;

    let rows = shape.batch * shape.max_len;
    let columns = shape.heads * shape.dim;
    if rows == 0 || columns == 0 {
        return Ok(());
    }

    let config = JaggedConfig::generate(rows as u32, columns as u32);
    log::debug!("dense-vec x jagged-matrix outer product: rows={rows}, {config:?}");

    unsafe {
        dense_vec_jagged_outer_product_kernel::launch_unchecked::<P::ES, I, R>(
            client,
            config.cube_count,
            config.cube_dim,
            v.as_tensor_arg(1),
            grad.as_tensor_arg(1),
            a_offsets.as_tensor_arg(1),
            a_grad.as_tensor_arg(1),
            config.bound_checks,
        );
    }

    Ok(())
}

fn check_output_shape(output_shape: &[usize], shape: &VecMatShape) -> Result<(), JaggedError> {
    let expected = [shape.batch, shape.heads, shape.dim];
    if output_shape != expected.as_slice() {
        return Err(JaggedError::ShapeMismatch {
            argument: "output rank or size",
            expected: expected.iter().product(),
            actual: output_shape.iter().product(),
        });
    }
    Ok(())
}

fn check_grad_shape(grad_shape: &[usize], shape: &VecMatShape) -> Result<(), JaggedError> {
    let expected = [shape.batch, shape.heads, shape.dim];
    if grad_shape != expected.as_slice() {
        return Err(JaggedError::ShapeMismatch {
            argument: "gradient rank or size",
            expected: expected.iter().product(),
            actual: grad_shape.iter().product(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_heads_and_dim() {
        let shape = check_vecmat_shape(&[6, 4], &[11, 9], &[3]).unwrap();
        assert_eq!(
            shape,
            VecMatShape {
                batch: 2,
                heads: 3,
                dim: 3,
                max_len: 4,
                total: 11,
            }
        );
    }

    #[test]
    fn rejects_non_divisible_head_count() {
        let result = check_vecmat_shape(&[7, 4], &[11, 9], &[3]);
        assert!(matches!(
            result,
            Err(JaggedError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn empty_batch_is_valid() {
        let shape = check_vecmat_shape(&[0, 4], &[0, 6], &[1]).unwrap();
        assert_eq!(shape.batch, 0);
        assert_eq!(shape.heads, 0);
    }
}
