use cubecl_core::{CubeCount, CubeDim};

use crate::JaggedError;

/// Number of units in a plane assumed by the partition planner.
const PLANE_DIM: u32 = 32;

/// Upper bound on units per cube used when shaping launches.
const MAX_UNITS_PER_CUBE: u32 = 256;

/// Validated sizes of one jagged/dense operand pair.
///
/// `folded` is the product of the dense tensor's jagged dimensions, so the
/// dense side is iterated as `outer * folded` rows of `inner` channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct JaggedShape {
    pub depth: usize,
    pub outer: usize,
    pub folded: usize,
    pub inner: usize,
}

impl JaggedShape {
    pub fn num_rows(&self) -> usize {
        self.outer * self.folded
    }

    /// True when the iteration space is empty and no kernel must be launched.
    pub fn is_empty(&self) -> bool {
        self.num_rows() == 0 || self.inner == 0
    }
}

/// Check that a jagged operand, its offset sequences and a dense operand
/// describe the same logical tensor, and extract the iteration sizes.
pub(crate) fn check_jagged_dense_shape(
    values_shape: &[usize],
    offsets_lens: &[usize],
    dense_shape: &[usize],
) -> Result<JaggedShape, JaggedError> {
    let depth = offsets_lens.len();
    if depth == 0 || depth > crate::MAX_JAGGED_DEPTH {
        return Err(JaggedError::UnsupportedDepth { depth });
    }
    if dense_shape.len() != depth + 2 {
        return Err(JaggedError::ShapeMismatch {
            argument: "dense rank",
            expected: depth + 2,
            actual: dense_shape.len(),
        });
    }
    if values_shape.len() != 2 {
        return Err(JaggedError::ShapeMismatch {
            argument: "values rank",
            expected: 2,
            actual: values_shape.len(),
        });
    }

    let outer = dense_shape[0];
    if offsets_lens[0] != outer + 1 {
        return Err(JaggedError::ShapeMismatch {
            argument: "outermost offsets length",
            expected: outer + 1,
            actual: offsets_lens[0],
        });
    }

    let inner = dense_shape[depth + 1];
    if values_shape[1] != inner {
        return Err(JaggedError::ShapeMismatch {
            argument: "values inner size",
            expected: inner,
            actual: values_shape[1],
        });
    }

    let folded = dense_shape[1..=depth].iter().product();

    Ok(JaggedShape {
        depth,
        outer,
        folded,
        inner,
    })
}

/// Launch geometry for one row-parallel jagged kernel.
#[derive(Debug, Clone)]
pub(crate) struct JaggedConfig {
    pub cube_count: CubeCount,
    pub cube_dim: CubeDim,
    pub bound_checks: bool,
}

impl JaggedConfig {
    /// Shape a launch covering `rows` rows of `inner` channels each.
    ///
    /// Channels map to the x axis of the cube, one plane wide when the inner
    /// size fills at least half a plane; rows map to the y axis and the cube
    /// count.
    pub(crate) fn generate(rows: u32, inner: u32) -> JaggedConfig {
        JaggedConfig::new()
            .generate_cube_dim(inner)
            .generate_cube_count(rows)
    }

    fn new() -> Self {
        Self {
            cube_count: CubeCount::new_single(),
            cube_dim: CubeDim::new_single(),
            bound_checks: false,
        }
    }

    fn generate_cube_dim(mut self, inner: u32) -> Self {
        let x = if inner >= PLANE_DIM / 2 {
            PLANE_DIM
        } else {
            inner.max(1)
        };
        self.cube_dim = CubeDim::new_2d(x, MAX_UNITS_PER_CUBE / PLANE_DIM);
        self
    }

    fn generate_cube_count(mut self, rows: u32) -> Self {
        let rows_per_cube = self.cube_dim.y;
        let cube_count = rows.div_ceil(rows_per_cube);

        self.do_bound_checks_if(rows_per_cube * cube_count > rows);
        self.cube_count = CubeCount::new_1d(cube_count);

        self
    }

    fn do_bound_checks_if(&mut self, condition: bool) {
        self.bound_checks = self.bound_checks || condition;
    }
}
