//! Jagged tensor kernels for CubeCL.
//!
//! A jagged tensor stores ragged nested sequences as a flat `[total, inner]`
//! value buffer plus one ascending offsets array per nesting depth. This
//! crate maps flattened jagged coordinates to physical storage offsets on
//! device (the tree walk) and builds elementwise operators, densification,
//! a batched dense-vector × jagged-matrix product and stacked multi-key
//! utilities on top of it, generic over the element type, the offsets
//! integer type and a compile-time combinator.

mod combine;
mod config;
mod error;
mod kernels;
mod ops;
mod stacked;
mod walk;

pub use combine::*;
pub use error::*;
pub use kernels::elementwise::{
    launch_elementwise_dense_output, launch_elementwise_jagged_output,
    launch_jagged_jagged_dense_output, JaggedParams,
};
pub use kernels::scan::launch_lengths_to_offsets;
pub use kernels::vecmat::{
    launch_dense_vec_jagged_matmul, launch_dense_vec_jagged_matmul_transposed,
    launch_dense_vec_jagged_outer_product, JaggedPrecision,
};
pub use ops::*;
pub use stacked::*;
pub use walk::*;

#[cfg(feature = "export_tests")]
pub mod test;

/// Deepest supported jagged nesting.
///
/// The tree walk is unrolled at kernel expansion time over the depth, so the
/// supported depths form a small closed set; the host boundary rejects
/// anything outside it before any device work is queued.
pub const MAX_JAGGED_DEPTH: usize = 5;
