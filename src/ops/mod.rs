mod arithmetic;
mod padded;
mod vecmat;

pub use arithmetic::*;
pub use padded::*;
pub use vecmat::*;

use cubecl_core::prelude::*;
use cubecl_linalg::tensor::TensorHandle;
use num_traits::ToPrimitive;

use crate::JaggedError;

/// Take a refcounted owned view of a borrowed tensor handle, so a forward
/// result can keep what its backward needs without copying data.
pub(crate) fn owned_tensor<R: Runtime, E: CubePrimitive>(
    tensor: &TensorHandleRef<'_, R>,
) -> TensorHandle<R, E> {
    TensorHandle::new(
        tensor.shape.to_vec(),
        tensor.strides.to_vec(),
        tensor.handle.clone(),
    )
}

pub(crate) fn owned_offsets<R: Runtime, I: CubePrimitive>(
    offsets: &[TensorHandleRef<'_, R>],
) -> Vec<TensorHandle<R, I>> {
    offsets.iter().map(|o| owned_tensor(o)).collect()
}

pub(crate) fn offsets_refs<'a, R: Runtime, I: CubePrimitive>(
    offsets: &'a [TensorHandle<R, I>],
) -> Vec<TensorHandleRef<'a, R>> {
    offsets.iter().map(|o| o.as_ref()).collect()
}

/// Allocate a zero-filled tensor, skipping the fill launch for empty shapes.
pub(crate) fn zeros_tensor<R: Runtime, E: Numeric>(
    client: &ComputeClient<R::Server, R::Channel>,
    shape: Vec<usize>,
) -> TensorHandle<R, E> {
    if shape.iter().product::<usize>() == 0 {
        TensorHandle::empty(client, shape)
    } else {
        TensorHandle::zeros(client, shape)
    }
}

/// Read the final entry of an offsets array back to the host.
///
/// This is a synchronous device read; callers that already know the total
/// length should pass it instead.
pub(crate) fn read_last_offset<R: Runtime, I: Int + CubeElement + ToPrimitive>(
    client: &ComputeClient<R::Server, R::Channel>,
    offsets: &TensorHandleRef<'_, R>,
) -> Result<usize, JaggedError> {
    let len = offsets.shape[0];
    if len == 0 {
        return Err(JaggedError::InvalidOffsets {
            reason: "offsets tensor is empty".into(),
        });
    }

    let elem = I::as_elem().size();
    let start = ((len - 1) * offsets.strides[0] * elem) as u64;
    let handle = offsets.handle.clone().offset_start(start);
    let bytes = client.read_one(handle.binding());
    let value = I::from_bytes(&bytes)[0];

    value.to_usize().ok_or_else(|| JaggedError::InvalidOffsets {
        reason: "last offsets entry is negative".into(),
    })
}
