use cubecl_core as cubecl;
use cubecl_core::prelude::*;
use cubecl_std::{CubeOption, CubeOptionArgs};

use crate::combine::JaggedCombinator;
use crate::config::{check_jagged_dense_shape, JaggedConfig};
use crate::walk::{
    decompose_flat_coordinate, dense_row_offset, jagged_folded_size, walk_offset_tree,
};
use crate::JaggedError;

/// Compile-time settings shared by the elementwise kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JaggedParams {
    /// Number of jagged nesting depths, 1..=5.
    pub depth: u32,
    /// Whether the row index must be checked against the iteration space.
    pub bound_checks: bool,
}

#[cube(launch_unchecked)]
fn jagged_dense_elementwise_dense_kernel<E: Numeric, I: Int, C: JaggedCombinator<E>>(
    x_values: &Tensor<E>,
    x_offsets: Sequence<Tensor<I>>,
    y: CubeOption<Tensor<E>>,
    output: &mut Tensor<E>,
    padding_value: E,
    #[comptime] params: JaggedParams,
) {
    let row = CUBE_POS * CUBE_DIM_Y + UNIT_POS_Y;
    let folded = jagged_folded_size(output, params.depth);

    if params.bound_checks && row >= output.shape(0) * folded {
        return;
    }

    let batch = row / folded;
    let flat = row % folded;

    let coords = decompose_flat_coordinate(output, flat, params.depth);
    let walk = walk_offset_tree(&x_offsets, &coords, batch, params.depth);

    let inner = output.shape(params.depth + 1);
    let out_base = dense_row_offset(output, batch, &coords, params.depth);
    let out_stride = output.stride(params.depth + 1);

    match y {
        CubeOption::Some(dense) => {
            let y_base = dense_row_offset(&dense, batch, &coords, params.depth);
            let y_stride = dense.stride(params.depth + 1);

            for ch in range_stepped(UNIT_POS_X, inner, CUBE_DIM_X) {
                let mut x_val = padding_value;
                if !walk.masked {
                    x_val = x_values[walk.offset * x_values.stride(0) + ch * x_values.stride(1)];
                }
                output[out_base + ch * out_stride] =
                    C::combine(x_val, dense[y_base + ch * y_stride]);
            }
        }
        CubeOption::None => {
            for ch in range_stepped(UNIT_POS_X, inner, CUBE_DIM_X) {
                let mut x_val = padding_value;
                if !walk.masked {
                    x_val = x_values[walk.offset * x_values.stride(0) + ch * x_values.stride(1)];
                }
                output[out_base + ch * out_stride] = C::combine(x_val, E::from_int(0));
            }
        }
    }
}

#[cube(launch_unchecked)]
fn jagged_dense_elementwise_jagged_kernel<E: Numeric, I: Int, C: JaggedCombinator<E>>(
    x_values: CubeOption<Tensor<E>>,
    x_offsets: Sequence<Tensor<I>>,
    y: &Tensor<E>,
    output: &mut Tensor<E>,
    #[comptime] params: JaggedParams,
) {
    let row = CUBE_POS * CUBE_DIM_Y + UNIT_POS_Y;
    let folded = jagged_folded_size(y, params.depth);

    if params.bound_checks && row >= y.shape(0) * folded {
        return;
    }

    let batch = row / folded;
    let flat = row % folded;

    let coords = decompose_flat_coordinate(y, flat, params.depth);
    let walk = walk_offset_tree(&x_offsets, &coords, batch, params.depth);

    // Masked positions have no jagged storage behind them: leave the output
    // at its caller-supplied initial value. Rows past the output buffer
    // (a shorter caller-provided total length) are dropped.
    if !walk.masked && walk.offset < output.shape(0) {
        let inner = y.shape(params.depth + 1);
        let y_base = dense_row_offset(y, batch, &coords, params.depth);
        let y_stride = y.stride(params.depth + 1);
        let out_row = walk.offset * output.stride(0);

        match x_values {
            CubeOption::Some(values) => {
                for ch in range_stepped(UNIT_POS_X, inner, CUBE_DIM_X) {
                    let x_val = values[walk.offset * values.stride(0) + ch * values.stride(1)];
                    output[out_row + ch * output.stride(1)] =
                        C::combine(x_val, y[y_base + ch * y_stride]);
                }
            }
            CubeOption::None => {
                for ch in range_stepped(UNIT_POS_X, inner, CUBE_DIM_X) {
                    output[out_row + ch * output.stride(1)] =
                        C::combine(E::from_int(0), y[y_base + ch * y_stride]);
                }
            }
        }
    }
}

#[cube(launch_unchecked)]
fn jagged_jagged_elementwise_dense_kernel<E: Numeric, I: Int, C: JaggedCombinator<E>>(
    x_values: &Tensor<E>,
    y_values: &Tensor<E>,
    offsets: Sequence<Tensor<I>>,
    output: &mut Tensor<E>,
    padding_value: E,
    #[comptime] params: JaggedParams,
) {
    let row = CUBE_POS * CUBE_DIM_Y + UNIT_POS_Y;
    let folded = jagged_folded_size(output, params.depth);

    if params.bound_checks && row >= output.shape(0) * folded {
        return;
    }

    let batch = row / folded;
    let flat = row % folded;

    let coords = decompose_flat_coordinate(output, flat, params.depth);
    let walk = walk_offset_tree(&offsets, &coords, batch, params.depth);

    let inner = output.shape(params.depth + 1);
    let out_base = dense_row_offset(output, batch, &coords, params.depth);
    let out_stride = output.stride(params.depth + 1);

    if walk.masked {
        for ch in range_stepped(UNIT_POS_X, inner, CUBE_DIM_X) {
            output[out_base + ch * out_stride] = padding_value;
        }
    } else {
        // Both operands share the offsets, so one resolved offset addresses
        // both value buffers.
        for ch in range_stepped(UNIT_POS_X, inner, CUBE_DIM_X) {
            let x_val = x_values[walk.offset * x_values.stride(0) + ch * x_values.stride(1)];
            let y_val = y_values[walk.offset * y_values.stride(0) + ch * y_values.stride(1)];
            output[out_base + ch * out_stride] = C::combine(x_val, y_val);
        }
    }
}

/// Launch the (jagged, dense) → dense elementwise kernel.
///
/// Every dense position of `output` is written: positions backed by a jagged
/// element receive `combine(x, y)`, masked positions `combine(padding, y)`.
/// When `y` is `None` the dense-side operand is zero, which only makes sense
/// with combinators ignoring it such as [`TakeLeft`](crate::TakeLeft).
pub fn launch_elementwise_dense_output<R: Runtime, E: Numeric, I: Int, C: JaggedCombinator<E>>(
    client: &ComputeClient<R::Server, R::Channel>,
    x_values: &TensorHandleRef<'_, R>,
    x_offsets: &[TensorHandleRef<'_, R>],
    y: Option<&TensorHandleRef<'_, R>>,
    output: &TensorHandleRef<'_, R>,
    padding_value: E,
) -> Result<(), JaggedError> {
    let offsets_lens: Vec<usize> = x_offsets.iter().map(|o| o.shape[0]).collect();
    let shape = check_jagged_dense_shape(x_values.shape, &offsets_lens, output.shape)?;
    if let Some(y) = y {
        check_same_shape(output.shape, y.shape)?;
    }
    if shape.is_empty() {
        return Ok(());
    }

    let config = JaggedConfig::generate(shape.num_rows() as u32, shape.inner as u32);
    log::debug!(
        "jagged elementwise (dense output): rows={}, inner={}, {config:?}",
        shape.num_rows(),
        shape.inner,
    );

    let offsets_arg = SequenceArg {
        values: x_offsets.iter().map(|o| o.as_tensor_arg(1)).collect(),
    };
    let y_arg = match y {
        Some(y) => CubeOptionArgs::Some(y.as_tensor_arg(1)),
        None => CubeOptionArgs::None,
    };

    unsafe {
        jagged_dense_elementwise_dense_kernel::launch_unchecked::<E, I, C, R>(
            client,
            config.cube_count,
            config.cube_dim,
            x_values.as_tensor_arg(1),
            offsets_arg,
            y_arg,
            output.as_tensor_arg(1),
            ScalarArg::new(padding_value),
            JaggedParams {
                depth: shape.depth as u32,
                bound_checks: config.bound_checks,
            },
        );
    }

    Ok(())
}

/// Launch the (jagged, dense) → jagged elementwise kernel.
///
/// Iterates the dense side of `y` and scatters `combine(x, y)` into `output`
/// at each resolved physical offset. Masked positions write nothing, so the
/// caller decides what untouched rows hold by initializing `output`. When
/// `x_values` is `None` the jagged-side operand is zero, for combinators
/// ignoring it such as [`TakeRight`](crate::TakeRight).
pub fn launch_elementwise_jagged_output<R: Runtime, E: Numeric, I: Int, C: JaggedCombinator<E>>(
    client: &ComputeClient<R::Server, R::Channel>,
    x_values: Option<&TensorHandleRef<'_, R>>,
    x_offsets: &[TensorHandleRef<'_, R>],
    y: &TensorHandleRef<'_, R>,
    output: &TensorHandleRef<'_, R>,
) -> Result<(), JaggedError> {
    let offsets_lens: Vec<usize> = x_offsets.iter().map(|o| o.shape[0]).collect();
    let shape = check_jagged_dense_shape(output.shape, &offsets_lens, y.shape)?;
    if let Some(x_values) = x_values {
        check_same_shape(output.shape, x_values.shape)?;
    }
    if shape.is_empty() {
        return Ok(());
    }

    let config = JaggedConfig::generate(shape.num_rows() as u32, shape.inner as u32);
    log::debug!(
        "jagged elementwise (jagged output): rows={}, inner={}, {config:?}",
        shape.num_rows(),
        shape.inner,
    );

    let offsets_arg = SequenceArg {
        values: x_offsets.iter().map(|o| o.as_tensor_arg(1)).collect(),
    };
    let x_arg = match x_values {
        Some(x) => CubeOptionArgs::Some(x.as_tensor_arg(1)),
        None => CubeOptionArgs::None,
    };

    unsafe {
        jagged_dense_elementwise_jagged_kernel::launch_unchecked::<E, I, C, R>(
            client,
            config.cube_count,
            config.cube_dim,
            x_arg,
            offsets_arg,
            y.as_tensor_arg(1),
            output.as_tensor_arg(1),
            JaggedParams {
                depth: shape.depth as u32,
                bound_checks: config.bound_checks,
            },
        );
    }

    Ok(())
}

/// Launch the (jagged, jagged) → dense elementwise kernel.
///
/// Both operands must share `offsets`. Every dense position of `output` is
/// written: `combine(x, y)` where a physical element exists, `padding_value`
/// elsewhere.
pub fn launch_jagged_jagged_dense_output<R: Runtime, E: Numeric, I: Int, C: JaggedCombinator<E>>(
    client: &ComputeClient<R::Server, R::Channel>,
    x_values: &TensorHandleRef<'_, R>,
    y_values: &TensorHandleRef<'_, R>,
    offsets: &[TensorHandleRef<'_, R>],
    output: &TensorHandleRef<'_, R>,
    padding_value: E,
) -> Result<(), JaggedError> {
    let offsets_lens: Vec<usize> = offsets.iter().map(|o| o.shape[0]).collect();
    let shape = check_jagged_dense_shape(x_values.shape, &offsets_lens, output.shape)?;
    check_same_shape(x_values.shape, y_values.shape)?;
    if shape.is_empty() {
        return Ok(());
    }

    let config = JaggedConfig::generate(shape.num_rows() as u32, shape.inner as u32);
    log::debug!(
        "jagged elementwise (jagged x jagged): rows={}, inner={}, {config:?}",
        shape.num_rows(),
        shape.inner,
    );

    let offsets_arg = SequenceArg {
        values: offsets.iter().map(|o| o.as_tensor_arg(1)).collect(),
    };

    unsafe {
        jagged_jagged_elementwise_dense_kernel::launch_unchecked::<E, I, C, R>(
            client,
            config.cube_count,
            config.cube_dim,
            x_values.as_tensor_arg(1),
            y_values.as_tensor_arg(1),
            offsets_arg,
            output.as_tensor_arg(1),
            ScalarArg::new(padding_value),
            JaggedParams {
                depth: shape.depth as u32,
                bound_checks: config.bound_checks,
            },
        );
    }

    Ok(())
}

fn check_same_shape(expected: &[usize], actual: &[usize]) -> Result<(), JaggedError> {
    if expected.len() != actual.len() {
        return Err(JaggedError::ShapeMismatch {
            argument: "operand rank",
            expected: expected.len(),
            actual: actual.len(),
        });
    }
    for (e, a) in expected.iter().zip(actual.iter()) {
        if e != a {
            return Err(JaggedError::ShapeMismatch {
                argument: "operand shape",
                expected: *e,
                actual: *a,
            });
        }
    }
    Ok(())
}
