use cubecl_core as cubecl;
use cubecl_core::prelude::*;

/// Binary combinator applied elementwise by the generic jagged kernels.
///
/// The jagged-side operand (or the padding value at masked positions) is
/// always passed as `x`, the dense-side operand as `y`. Implementations are
/// injected as a compile-time generic so trivial combinators inline into the
/// kernel with no call overhead.
#[cube]
pub trait JaggedCombinator<E: Numeric>: Send + Sync + 'static {
    /// Combine the jagged-side and dense-side operands for one position.
    fn combine(x: E, y: E) -> E;
}

/// Elementwise addition.
#[derive(Debug, CubeType, Clone)]
pub struct Add {}

#[cube]
impl<E: Numeric> JaggedCombinator<E> for Add {
    fn combine(x: E, y: E) -> E {
        x + y
    }
}

/// Elementwise multiplication.
#[derive(Debug, CubeType, Clone)]
pub struct Mul {}

#[cube]
impl<E: Numeric> JaggedCombinator<E> for Mul {
    fn combine(x: E, y: E) -> E {
        x * y
    }
}

/// Keep the jagged-side operand, used to densify a jagged tensor.
#[derive(Debug, CubeType, Clone)]
pub struct TakeLeft {}

#[cube]
impl<E: Numeric> JaggedCombinator<E> for TakeLeft {
    fn combine(x: E, _y: E) -> E {
        x
    }
}

/// Keep the dense-side operand, used to scatter dense data into jagged
/// storage.
#[derive(Debug, CubeType, Clone)]
pub struct TakeRight {}

#[cube]
impl<E: Numeric> JaggedCombinator<E> for TakeRight {
    fn combine(_x: E, y: E) -> E {
        y
    }
}
