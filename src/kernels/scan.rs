use cubecl_core as cubecl;
use cubecl_core::prelude::*;
use cubecl_core::calculate_cube_count_elemwise;

use crate::JaggedError;

#[cube(launch)]
fn lengths_to_offsets_kernel<I: Int>(lengths: &Tensor<I>, offsets: &mut Tensor<I>) {
    let key = ABSOLUTE_POS;

    if key < lengths.shape(0) {
        let batch = lengths.shape(1);
        let base = key * offsets.stride(0);

        let mut running = I::from_int(0);
        offsets[base] = running;
        for b in 0..batch {
            running += lengths[key * lengths.stride(0) + b * lengths.stride(1)];
            offsets[base + (b + 1) * offsets.stride(1)] = running;
        }
    }
}

/// Derive per-key offsets from a `[keys, batch]` lengths matrix.
///
/// `offsets` must have shape `[keys, batch + 1]`; each row receives the
/// inclusive prefix sum of the matching lengths row, preceded by a zero.
/// Keys are scanned in parallel, one unit per key, in a single launch.
pub fn launch_lengths_to_offsets<R: Runtime, I: Int>(
    client: &ComputeClient<R::Server, R::Channel>,
    lengths: &TensorHandleRef<'_, R>,
    offsets: &TensorHandleRef<'_, R>,
) -> Result<(), JaggedError> {
    if lengths.shape.len() != 2 {
        return Err(JaggedError::ShapeMismatch {
            argument: "lengths rank",
            expected: 2,
            actual: lengths.shape.len(),
        });
    }
    if offsets.shape.len() != 2 || offsets.shape[0] != lengths.shape[0] {
        return Err(JaggedError::ShapeMismatch {
            argument: "offsets outer size",
            expected: lengths.shape[0],
            actual: if offsets.shape.is_empty() {
                0
            } else {
                offsets.shape[0]
            },
        });
    }
    if offsets.shape[1] != lengths.shape[1] + 1 {
        return Err(JaggedError::ShapeMismatch {
            argument: "offsets inner size",
            expected: lengths.shape[1] + 1,
            actual: offsets.shape[1],
        });
    }

    let keys = lengths.shape[0];
    if keys == 0 {
        return Ok(());
    }

    let cube_dim = CubeDim::default();
    let cube_count = calculate_cube_count_elemwise(keys, cube_dim);
    log::debug!("lengths to offsets: keys={keys}, batch={}", lengths.shape[1]);

    lengths_to_offsets_kernel::launch::<I, R>(
        client,
        cube_count,
        cube_dim,
        lengths.as_tensor_arg(1),
        offsets.as_tensor_arg(1),
    );

    Ok(())
}
