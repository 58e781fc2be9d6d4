use cubecl_core as cubecl;
use cubecl_core::prelude::*;

/// Outcome of resolving a flattened jagged coordinate against the offsets
/// tree.
///
/// `offset` is the row into the jagged value buffer and is only meaningful
/// when `masked` is false. A masked position is a dense-side coordinate with
/// no physical jagged element behind it (implicit padding).
#[derive(CubeType)]
pub struct WalkResult {
    /// Physical row into the value buffer.
    pub offset: u32,
    /// Whether the coordinate fell outside a segment at some depth.
    pub masked: bool,
}

/// Product of the dense tensor's jagged dimensions (dims `1..=depth`).
#[cube]
pub fn jagged_folded_size<E: CubePrimitive>(dense: &Tensor<E>, #[comptime] depth: u32) -> u32 {
    let mut folded = 1;

    #[unroll]
    for d in 0..depth {
        folded *= dense.shape(d + 1);
    }

    folded
}

/// Split a flattened jagged coordinate into one index per nesting depth.
///
/// Mixed-radix decomposition from the innermost dimension outwards, with the
/// dense tensor's jagged dims as radices. The loop is unrolled at expansion
/// time since `depth` is a compile-time constant.
#[cube]
pub fn decompose_flat_coordinate<E: CubePrimitive>(
    dense: &Tensor<E>,
    flat: u32,
    #[comptime] depth: u32,
) -> Array<u32> {
    let mut coords = Array::<u32>::new(depth);
    let mut remainder = flat;
    let mut dim = comptime![depth - 1];

    #[unroll]
    for _ in 0..depth {
        let extent = dense.shape(dim + 1);
        coords[dim] = remainder % extent;
        remainder /= extent;

        comptime![dim = dim.saturating_sub(1);]
    }

    coords
}

/// Walk the implicit tree of offset arrays, narrowing a running physical
/// offset one depth at a time.
///
/// Starting from the outer batch index, each depth reads its segment bounds
/// `[begin, end)` and either narrows the offset to `begin + coordinate` or
/// marks the position masked when the coordinate falls past the segment
/// length. Once masked, no further offsets row is read: the running offset is
/// stale at that point and indexing with it would be out of range.
#[cube]
pub fn walk_offset_tree<I: Int>(
    offsets: &Sequence<Tensor<I>>,
    coords: &Array<u32>,
    batch: u32,
    #[comptime] depth: u32,
) -> WalkResult {
    let mut offset = batch;
    let mut masked = false;

    #[unroll]
    for d in 0..depth {
        if !masked {
            let begin = u32::cast_from(offsets.index(d)[offset]);
            let end = u32::cast_from(offsets.index(d)[offset + 1]);
            let coordinate = coords[d];

            if coordinate < end - begin {
                offset = begin + coordinate;
            } else {
                masked = true;
            }
        }
    }

    WalkResult { offset, masked }
}

/// Offset of the element `(batch, coords, channel 0)` in a dense tensor,
/// going through strides so arbitrarily strided operands are supported.
#[cube]
pub fn dense_row_offset<E: CubePrimitive>(
    dense: &Tensor<E>,
    batch: u32,
    coords: &Array<u32>,
    #[comptime] depth: u32,
) -> u32 {
    let mut offset = batch * dense.stride(0);

    #[unroll]
    for d in 0..depth {
        offset += coords[d] * dense.stride(d + 1);
    }

    offset
}
