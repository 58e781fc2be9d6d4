#![allow(missing_docs)]

use cubecl_core::prelude::*;
use cubecl_linalg::tensor::TensorHandle;
use num_traits::ToPrimitive;
use pretty_assertions::assert_eq;
use rand::{
    distributions::{Distribution, Uniform},
    rngs::StdRng,
    SeedableRng,
};

use crate::{
    batched_dense_vec_jagged_2d_mul, dense_to_jagged, jagged_1d_to_dense, jagged_dense_add,
    jagged_dense_add_jagged_output, jagged_dense_mul, jagged_to_padded_dense,
    stacked_jagged_1d_to_dense, stacked_jagged_2d_to_dense,
};

// All random values generated for tests are in the set
// {-2, -2 + E, ..., 2 - E, 2} with E = 1 / PRECISION, so narrow floating
// formats represent them (and their pairwise products) exactly.
const PRECISION: i32 = 4;

// This macro generates all the tests.
#[macro_export]
macro_rules! testgen_jagged {
    // Generate all the tests for a list of types.
    ([$($float:ident), *]) => {
        mod test_jagged {
            use super::*;
            ::paste::paste! {
                $(mod [<$float _ty>] {
                    use super::*;

                    $crate::testgen_jagged!($float);
                })*
            }
        }
    };

    // Generate all the tests for f32.
    () => {
        mod test_jagged {
            use super::*;
            $crate::testgen_jagged!(f32);
        }
    };

    // Generate all the tests for a specific float type.
    ($float:ident) => {
        use cubecl_jagged::test::JaggedTestCase;

        $crate::impl_test_jagged!(
            $float,
            [
                {
                    id: "depth1_small",
                    offsets: vec![vec![0, 2, 2, 5]],
                    max_lengths: vec![3],
                    inner: 4,
                },
                {
                    id: "depth1_truncated",
                    offsets: vec![vec![0, 1, 4]],
                    max_lengths: vec![2],
                    inner: 3,
                },
                {
                    id: "depth1_wide",
                    offsets: vec![vec![0, 3, 7, 7, 12]],
                    max_lengths: vec![5],
                    inner: 33,
                },
                {
                    id: "depth2_nested",
                    offsets: vec![vec![0, 0, 2, 3], vec![0, 1, 3, 4]],
                    max_lengths: vec![2, 2],
                    inner: 2,
                },
                {
                    id: "depth3_deep",
                    offsets: vec![vec![0, 2, 3], vec![0, 1, 3, 4], vec![0, 2, 2, 5, 6]],
                    max_lengths: vec![2, 2, 3],
                    inner: 2,
                },
                {
                    id: "empty_batch",
                    offsets: vec![vec![0]],
                    max_lengths: vec![2],
                    inner: 3,
                }
            ]
        );

        #[test]
        fn vecmat_zero_length_segment() {
            cubecl_jagged::test::test_vecmat::<$float, TestRuntime>(
                &Default::default(),
                1,
                3,
                3,
                &[3, 0],
            );
        }

        #[test]
        fn vecmat_multi_head_truncated() {
            cubecl_jagged::test::test_vecmat::<$float, TestRuntime>(
                &Default::default(),
                2,
                2,
                4,
                &[2, 0, 5, 1],
            );
        }

        #[test]
        fn stacked_2d_matches_per_key() {
            cubecl_jagged::test::test_stacked_2d::<$float, TestRuntime>(&Default::default());
        }

        #[test]
        fn stacked_1d_matches_per_key() {
            cubecl_jagged::test::test_stacked_1d::<$float, TestRuntime>(&Default::default());
        }

        #[test]
        fn jagged_1d_padding() {
            cubecl_jagged::test::test_jagged_1d::<$float, TestRuntime>(&Default::default());
        }

        #[test]
        fn multi_cube_batch() {
            cubecl_jagged::test::test_large_batch::<$float, TestRuntime>(&Default::default());
        }
    };
}

#[macro_export]
macro_rules! impl_test_jagged {
    (
        $float:ident,
        [
            $(
                {
                    id: $id:literal,
                    offsets: $offsets:expr,
                    max_lengths: $max_lengths:expr,
                    inner: $inner:expr,
                }
            ),*
        ]
    ) => {
        ::paste::paste! {
            $(
                #[test]
                pub fn [< round_trip_ $id >]() {
                    let test = JaggedTestCase {
                        offsets: $offsets,
                        max_lengths: $max_lengths,
                        inner: $inner,
                    };
                    test.test_round_trip::<$float, TestRuntime>(&Default::default());
                }

                #[test]
                pub fn [< padding_value_ $id >]() {
                    let test = JaggedTestCase {
                        offsets: $offsets,
                        max_lengths: $max_lengths,
                        inner: $inner,
                    };
                    test.test_padding::<$float, TestRuntime>(&Default::default());
                }

                #[test]
                pub fn [< add_ $id >]() {
                    let test = JaggedTestCase {
                        offsets: $offsets,
                        max_lengths: $max_lengths,
                        inner: $inner,
                    };
                    test.test_add::<$float, TestRuntime>(&Default::default());
                }

                #[test]
                pub fn [< add_jagged_output_ $id >]() {
                    let test = JaggedTestCase {
                        offsets: $offsets,
                        max_lengths: $max_lengths,
                        inner: $inner,
                    };
                    test.test_add_jagged_output::<$float, TestRuntime>(&Default::default());
                }

                #[test]
                pub fn [< mul_ $id >]() {
                    let test = JaggedTestCase {
                        offsets: $offsets,
                        max_lengths: $max_lengths,
                        inner: $inner,
                    };
                    test.test_mul::<$float, TestRuntime>(&Default::default());
                }

                #[test]
                pub fn [< mul_gradients_ $id >]() {
                    let test = JaggedTestCase {
                        offsets: $offsets,
                        max_lengths: $max_lengths,
                        inner: $inner,
                    };
                    test.test_mul_gradients::<$float, TestRuntime>(&Default::default());
                }
            )*
        }
    };
}

/// One jagged tensor description used by the generated tests.
///
/// `offsets` are host-side offset sequences, one per nesting depth;
/// `max_lengths` the dense extents the tensor is padded to.
#[derive(Debug)]
pub struct JaggedTestCase {
    pub offsets: Vec<Vec<i32>>,
    pub max_lengths: Vec<usize>,
    pub inner: usize,
}

impl JaggedTestCase {
    fn depth(&self) -> usize {
        self.offsets.len()
    }

    fn outer(&self) -> usize {
        self.offsets[0].len() - 1
    }

    fn folded(&self) -> usize {
        self.max_lengths.iter().product()
    }

    fn total_values(&self) -> usize {
        *self.offsets[self.depth() - 1].last().unwrap() as usize
    }

    fn dense_shape(&self) -> Vec<usize> {
        let mut shape = Vec::with_capacity(self.depth() + 2);
        shape.push(self.outer());
        shape.extend_from_slice(&self.max_lengths);
        shape.push(self.inner);
        shape
    }

    fn dense_len(&self) -> usize {
        self.dense_shape().iter().product()
    }

    // Host-side counterpart of the device tree walk.
    fn host_walk(&self, batch: usize, flat: usize) -> Option<usize> {
        let depth = self.depth();
        let mut coords = vec![0_usize; depth];
        let mut remainder = flat;
        for d in (0..depth).rev() {
            coords[d] = remainder % self.max_lengths[d];
            remainder /= self.max_lengths[d];
        }

        let mut offset = batch;
        for d in 0..depth {
            let begin = self.offsets[d][offset] as usize;
            let end = self.offsets[d][offset + 1] as usize;
            if coords[d] >= end - begin {
                return None;
            }
            offset = begin + coords[d];
        }
        Some(offset)
    }

    pub fn host_padded(&self, values: &[f32], padding: f32) -> Vec<f32> {
        let folded = self.folded();
        let mut out = vec![padding; self.dense_len()];
        for batch in 0..self.outer() {
            for flat in 0..folded {
                if let Some(offset) = self.host_walk(batch, flat) {
                    for ch in 0..self.inner {
                        out[(batch * folded + flat) * self.inner + ch] =
                            values[offset * self.inner + ch];
                    }
                }
            }
        }
        out
    }

    pub fn host_dense_to_jagged(&self, dense: &[f32]) -> Vec<f32> {
        let folded = self.folded();
        let mut out = vec![0.0; self.total_values() * self.inner];
        for batch in 0..self.outer() {
            for flat in 0..folded {
                if let Some(offset) = self.host_walk(batch, flat) {
                    for ch in 0..self.inner {
                        out[offset * self.inner + ch] =
                            dense[(batch * folded + flat) * self.inner + ch];
                    }
                }
            }
        }
        out
    }

    fn host_add_jagged(&self, values: &[f32], dense: &[f32]) -> Vec<f32> {
        let folded = self.folded();
        let mut out = values.to_vec();
        for batch in 0..self.outer() {
            for flat in 0..folded {
                if let Some(offset) = self.host_walk(batch, flat) {
                    for ch in 0..self.inner {
                        out[offset * self.inner + ch] = values[offset * self.inner + ch]
                            + dense[(batch * folded + flat) * self.inner + ch];
                    }
                }
            }
        }
        out
    }

    fn host_mul_jagged(&self, values: &[f32], dense: &[f32]) -> Vec<f32> {
        let folded = self.folded();
        let mut out = vec![0.0; self.total_values() * self.inner];
        for batch in 0..self.outer() {
            for flat in 0..folded {
                if let Some(offset) = self.host_walk(batch, flat) {
                    for ch in 0..self.inner {
                        out[offset * self.inner + ch] = values[offset * self.inner + ch]
                            * dense[(batch * folded + flat) * self.inner + ch];
                    }
                }
            }
        }
        out
    }

    fn offsets_tensors<R: Runtime>(
        &self,
        client: &ComputeClient<R::Server, R::Channel>,
    ) -> Vec<TensorHandle<R, i32>> {
        self.offsets
            .iter()
            .map(|offsets| create_offsets::<R>(client, offsets))
            .collect()
    }

    pub fn test_round_trip<F, R>(&self, device: &R::Device)
    where
        F: Float + CubeElement + ToPrimitive,
        R: Runtime,
    {
        let client = R::client(device);
        let values_host = random_values(self.total_values() * self.inner, 12);
        let values =
            create_tensor::<F, R>(&client, &values_host, vec![self.total_values(), self.inner]);
        let offsets = self.offsets_tensors::<R>(&client);
        let offsets_refs: Vec<_> = offsets.iter().map(|o| o.as_ref()).collect();

        let padded = jagged_to_padded_dense::<R, F, i32>(
            &client,
            &values.as_ref(),
            &offsets_refs,
            &self.max_lengths,
            F::new(0.0),
        )
        .unwrap();

        // No explicit total length: it is read back from the offsets.
        let extracted =
            dense_to_jagged::<R, F, i32>(&client, &padded.output.as_ref(), &offsets_refs, None)
                .unwrap();
        assert_eq!(extracted.offsets.len(), self.depth());

        let actual = read_tensor(&client, &extracted.values);
        let expected = self.host_dense_to_jagged(&self.host_padded(&values_host, 0.0));
        assert_approx_equal(&actual, &expected, tolerance::<F>());
    }

    pub fn test_padding<F, R>(&self, device: &R::Device)
    where
        F: Float + CubeElement + ToPrimitive,
        R: Runtime,
    {
        let client = R::client(device);
        let values_host = random_values(self.total_values() * self.inner, 13);
        let values =
            create_tensor::<F, R>(&client, &values_host, vec![self.total_values(), self.inner]);
        let offsets = self.offsets_tensors::<R>(&client);
        let offsets_refs: Vec<_> = offsets.iter().map(|o| o.as_ref()).collect();

        // A sentinel padding value no input element can collide with, so
        // every masked position is visible in the comparison.
        let padding = 7.5;
        let padded = jagged_to_padded_dense::<R, F, i32>(
            &client,
            &values.as_ref(),
            &offsets_refs,
            &self.max_lengths,
            F::new(padding),
        )
        .unwrap();

        let actual = read_tensor(&client, &padded.output);
        let expected = self.host_padded(&values_host, padding);
        assert_approx_equal(&actual, &expected, tolerance::<F>());

        // Backward restricts the incoming dense gradient to the support.
        let grad_host = random_values(self.dense_len(), 14);
        let grad = create_tensor::<F, R>(&client, &grad_host, self.dense_shape());
        let grad_values = padded.backward(&client, &grad.as_ref()).unwrap();
        let actual = read_tensor(&client, &grad_values);
        let expected = self.host_dense_to_jagged(&grad_host);
        assert_approx_equal(&actual, &expected, tolerance::<F>());
    }

    pub fn test_add<F, R>(&self, device: &R::Device)
    where
        F: Float + CubeElement + ToPrimitive,
        R: Runtime,
    {
        let client = R::client(device);
        let values_host = random_values(self.total_values() * self.inner, 15);
        let y_host = random_values(self.dense_len(), 16);
        let values =
            create_tensor::<F, R>(&client, &values_host, vec![self.total_values(), self.inner]);
        let y = create_tensor::<F, R>(&client, &y_host, self.dense_shape());
        let offsets = self.offsets_tensors::<R>(&client);
        let offsets_refs: Vec<_> = offsets.iter().map(|o| o.as_ref()).collect();

        let op = jagged_dense_add::<R, F, i32>(&client, &values.as_ref(), &offsets_refs, &y.as_ref())
            .unwrap();

        let actual = read_tensor(&client, &op.output);
        let padded = self.host_padded(&values_host, 0.0);
        let expected: Vec<f32> = padded.iter().zip(y_host.iter()).map(|(x, y)| x + y).collect();
        assert_approx_equal(&actual, &expected, tolerance::<F>());

        let grad_host = random_values(self.dense_len(), 17);
        let grad = create_tensor::<F, R>(&client, &grad_host, self.dense_shape());
        let (grad_x, grad_y) = op.backward(&client, &grad.as_ref()).unwrap();

        // The jagged gradient is the dense gradient restricted to the
        // support; the dense gradient passes through unchanged.
        let actual = read_tensor(&client, &grad_x);
        let expected = self.host_dense_to_jagged(&grad_host);
        assert_approx_equal(&actual, &expected, tolerance::<F>());

        let actual = read_tensor(&client, &grad_y);
        assert_approx_equal(&actual, &grad_host, tolerance::<F>());
    }

    pub fn test_add_jagged_output<F, R>(&self, device: &R::Device)
    where
        F: Float + CubeElement + ToPrimitive,
        R: Runtime,
    {
        let client = R::client(device);
        let values_host = random_values(self.total_values() * self.inner, 18);
        let y_host = random_values(self.dense_len(), 19);
        let values =
            create_tensor::<F, R>(&client, &values_host, vec![self.total_values(), self.inner]);
        let y = create_tensor::<F, R>(&client, &y_host, self.dense_shape());
        let offsets = self.offsets_tensors::<R>(&client);
        let offsets_refs: Vec<_> = offsets.iter().map(|o| o.as_ref()).collect();

        let op = jagged_dense_add_jagged_output::<R, F, i32>(
            &client,
            &values.as_ref(),
            &offsets_refs,
            &y.as_ref(),
        )
        .unwrap();

        let actual = read_tensor(&client, &op.values);
        let expected = self.host_add_jagged(&values_host, &y_host);
        assert_approx_equal(&actual, &expected, tolerance::<F>());

        let grad_host = random_values(self.total_values() * self.inner, 20);
        let grad =
            create_tensor::<F, R>(&client, &grad_host, vec![self.total_values(), self.inner]);
        let (grad_x, grad_y) = op.backward(&client, &grad.as_ref()).unwrap();

        let actual = read_tensor(&client, &grad_x);
        assert_approx_equal(&actual, &grad_host, tolerance::<F>());

        let actual = read_tensor(&client, &grad_y);
        let expected = self.host_padded(&grad_host, 0.0);
        assert_approx_equal(&actual, &expected, tolerance::<F>());
    }

    pub fn test_mul<F, R>(&self, device: &R::Device)
    where
        F: Float + CubeElement + ToPrimitive,
        R: Runtime,
    {
        let client = R::client(device);
        let values_host = random_values(self.total_values() * self.inner, 21);
        let y_host = random_values(self.dense_len(), 22);
        let values =
            create_tensor::<F, R>(&client, &values_host, vec![self.total_values(), self.inner]);
        let y = create_tensor::<F, R>(&client, &y_host, self.dense_shape());
        let offsets = self.offsets_tensors::<R>(&client);
        let offsets_refs: Vec<_> = offsets.iter().map(|o| o.as_ref()).collect();

        let op = jagged_dense_mul::<R, F, i32>(&client, &values.as_ref(), &offsets_refs, &y.as_ref())
            .unwrap();

        let actual = read_tensor(&client, &op.values);
        let expected = self.host_mul_jagged(&values_host, &y_host);
        assert_approx_equal(&actual, &expected, tolerance::<F>());
    }

    /// Finite-difference check of the multiplication backward pass.
    ///
    /// The loss is a random linear functional of the output, so the central
    /// difference of this bilinear operator is exact up to rounding. Large
    /// cases skip themselves: the check launches two forwards per input
    /// coordinate.
    pub fn test_mul_gradients<F, R>(&self, device: &R::Device)
    where
        F: Float + CubeElement + ToPrimitive,
        R: Runtime,
    {
        let total = self.total_values() * self.inner;
        let dense_len = self.dense_len();
        if total == 0 || dense_len == 0 || total > 32 || dense_len > 64 {
            return;
        }

        let client = R::client(device);
        let x_host = random_values(total, 31);
        let y_host = random_values(dense_len, 37);
        let weights = random_values(total, 41);

        let offsets = self.offsets_tensors::<R>(&client);
        let offsets_refs: Vec<_> = offsets.iter().map(|o| o.as_ref()).collect();

        let eval = |x_host: &[f32], y_host: &[f32]| -> f32 {
            let x = create_tensor::<F, R>(&client, x_host, vec![self.total_values(), self.inner]);
            let y = create_tensor::<F, R>(&client, y_host, self.dense_shape());
            let op =
                jagged_dense_mul::<R, F, i32>(&client, &x.as_ref(), &offsets_refs, &y.as_ref())
                    .unwrap();
            let out = read_tensor(&client, &op.values);
            out.iter().zip(weights.iter()).map(|(o, w)| o * w).sum()
        };

        let x = create_tensor::<F, R>(&client, &x_host, vec![self.total_values(), self.inner]);
        let y = create_tensor::<F, R>(&client, &y_host, self.dense_shape());
        let op = jagged_dense_mul::<R, F, i32>(&client, &x.as_ref(), &offsets_refs, &y.as_ref())
            .unwrap();
        let grad =
            create_tensor::<F, R>(&client, &weights, vec![self.total_values(), self.inner]);
        let (grad_x, grad_y) = op.backward(&client, &grad.as_ref()).unwrap();
        let grad_x = read_tensor(&client, &grad_x);
        let grad_y = read_tensor(&client, &grad_y);

        // Exactly representable in every supported float, so the central
        // difference stays on the value grid.
        let eps = 0.25;
        let tol = if size_of::<F>() == 2 { 5e-2 } else { 1e-4 };

        for i in 0..total {
            let mut plus = x_host.clone();
            plus[i] += eps;
            let mut minus = x_host.clone();
            minus[i] -= eps;
            let numeric = (eval(&plus, &y_host) - eval(&minus, &y_host)) / (2.0 * eps);
            let analytic = grad_x[i];
            assert!(
                (numeric - analytic).abs() <= tol,
                "grad_x[{i}]: numeric={numeric}, analytic={analytic}"
            );
        }

        for j in 0..dense_len {
            let mut plus = y_host.clone();
            plus[j] += eps;
            let mut minus = y_host.clone();
            minus[j] -= eps;
            let numeric = (eval(&x_host, &plus) - eval(&x_host, &minus)) / (2.0 * eps);
            let analytic = grad_y[j];
            assert!(
                (numeric - analytic).abs() <= tol,
                "grad_y[{j}]: numeric={numeric}, analytic={analytic}"
            );
        }
    }
}

/// Batched dense-vector × jagged-matrix forward and backward against host
/// references, including exact zeros for empty and truncated segments.
pub fn test_vecmat<F, R>(
    device: &R::Device,
    heads: usize,
    dim: usize,
    max_len: usize,
    lengths: &[usize],
) where
    F: Float + CubeElement + ToPrimitive,
    R: Runtime,
{
    let batch = lengths.len();
    let mut offsets_host = vec![0_i32];
    for length in lengths {
        offsets_host.push(offsets_host.last().unwrap() + *length as i32);
    }
    let total = *offsets_host.last().unwrap() as usize;

    let client = R::client(device);
    let v_host = random_values(batch * heads * max_len, 51);
    let a_host = random_values(total * heads * dim, 52);

    let v = create_tensor::<F, R>(&client, &v_host, vec![batch * heads, max_len]);
    let a = create_tensor::<F, R>(&client, &a_host, vec![total, heads * dim]);
    let offsets = create_offsets::<R>(&client, &offsets_host);

    let op = batched_dense_vec_jagged_2d_mul::<R, (F, f32), i32>(
        &client,
        &v.as_ref(),
        &a.as_ref(),
        &offsets.as_ref(),
    )
    .unwrap();

    let actual = read_tensor(&client, &op.output);
    let mut expected = vec![0.0_f32; batch * heads * dim];
    for b in 0..batch {
        let begin = offsets_host[b] as usize;
        let length = lengths[b].min(max_len);
        for h in 0..heads {
            for d in 0..dim {
                let mut acc = 0.0;
                for l in 0..length {
                    acc += v_host[(b * heads + h) * max_len + l]
                        * a_host[(begin + l) * heads * dim + h * dim + d];
                }
                expected[(b * heads + h) * dim + d] = acc;
            }
        }
    }
    assert_approx_equal(&actual, &expected, tolerance::<F>());

    // Zero-length segments must produce exactly zero rows.
    for b in 0..batch {
        if lengths[b] == 0 {
            for h in 0..heads {
                for d in 0..dim {
                    assert_eq!(actual[(b * heads + h) * dim + d], 0.0);
                }
            }
        }
    }

    let grad_host = random_values(batch * heads * dim, 53);
    let grad = create_tensor::<F, R>(&client, &grad_host, vec![batch, heads, dim]);
    let (v_grad, a_grad) = op.backward(&client, &grad.as_ref()).unwrap();

    let actual = read_tensor(&client, &v_grad);
    let mut expected = vec![0.0_f32; batch * heads * max_len];
    for b in 0..batch {
        let begin = offsets_host[b] as usize;
        let length = lengths[b].min(max_len);
        for h in 0..heads {
            for l in 0..length {
                let mut acc = 0.0;
                for d in 0..dim {
                    acc += grad_host[(b * heads + h) * dim + d]
                        * a_host[(begin + l) * heads * dim + h * dim + d];
                }
                expected[(b * heads + h) * max_len + l] = acc;
            }
        }
    }
    assert_approx_equal(&actual, &expected, tolerance::<F>());

    // Gradient positions at or past each segment's length are exactly zero.
    for b in 0..batch {
        let length = lengths[b].min(max_len);
        for h in 0..heads {
            for l in length..max_len {
                assert_eq!(actual[(b * heads + h) * max_len + l], 0.0);
            }
        }
    }

    let actual = read_tensor(&client, &a_grad);
    let mut expected = vec![0.0_f32; total * heads * dim];
    for b in 0..batch {
        let begin = offsets_host[b] as usize;
        let length = lengths[b].min(max_len);
        for l in 0..length {
            for h in 0..heads {
                for d in 0..dim {
                    expected[(begin + l) * heads * dim + h * dim + d] = v_host
                        [(b * heads + h) * max_len + l]
                        * grad_host[(b * heads + h) * dim + d];
                }
            }
        }
    }
    assert_approx_equal(&actual, &expected, tolerance::<F>());
}

/// Stacked 2-D densification equals running the single-tensor operator on
/// every key's slice, and the derived offsets match a host prefix sum.
pub fn test_stacked_2d<F, R>(device: &R::Device)
where
    F: Float + CubeElement + ToPrimitive,
    R: Runtime,
{
    let lengths: [[usize; 4]; 3] = [[1, 0, 2, 3], [0, 0, 0, 0], [2, 2, 1, 0]];
    let max_lengths = [3, 1, 2];
    let inner = 3;
    let padding = 0.25;

    let keys = lengths.len();
    let batch = lengths[0].len();

    let mut offset_per_key = vec![0_usize];
    for row in &lengths {
        offset_per_key.push(offset_per_key.last().unwrap() + row.iter().sum::<usize>());
    }
    let total = *offset_per_key.last().unwrap();

    let client = R::client(device);
    let values_host = random_values(total * inner, 61);
    let lengths_host: Vec<i32> = lengths
        .iter()
        .flat_map(|row| row.iter().map(|l| *l as i32))
        .collect();

    let values = create_tensor::<F, R>(&client, &values_host, vec![total, inner]);
    let lengths_tensor = {
        let handle = client.create(i32::as_bytes(&lengths_host));
        TensorHandle::<R, i32>::new_contiguous(vec![keys, batch], handle)
    };

    let stacked = stacked_jagged_2d_to_dense::<R, F, i32>(
        &client,
        &values.as_ref(),
        &lengths_tensor.as_ref(),
        &offset_per_key,
        &max_lengths,
        F::new(padding),
    )
    .unwrap();

    assert_eq!(stacked.dense_per_key.len(), keys);
    assert_eq!(stacked.offsets_per_key.len(), keys);

    for key in 0..keys {
        let mut key_offsets = vec![0_i32];
        for length in lengths[key] {
            key_offsets.push(key_offsets.last().unwrap() + length as i32);
        }

        let actual_offsets = read_offsets(&client, &stacked.offsets_per_key[key]);
        assert_eq!(actual_offsets, key_offsets);

        let case = JaggedTestCase {
            offsets: vec![key_offsets],
            max_lengths: vec![max_lengths[key]],
            inner,
        };
        let key_values =
            &values_host[offset_per_key[key] * inner..offset_per_key[key + 1] * inner];
        let expected = case.host_padded(key_values, padding);
        let actual = read_tensor(&client, &stacked.dense_per_key[key]);
        assert_approx_equal(&actual, &expected, tolerance::<F>());
    }
}

/// Single-channel stacked variant over a rank-one shared buffer.
pub fn test_stacked_1d<F, R>(device: &R::Device)
where
    F: Float + CubeElement + ToPrimitive,
    R: Runtime,
{
    let lengths: [[usize; 3]; 2] = [[2, 0, 3], [1, 4, 0]];
    let max_lengths = [3, 2];
    let padding = -1.5;

    let keys = lengths.len();
    let batch = lengths[0].len();

    let mut offset_per_key = vec![0_usize];
    for row in &lengths {
        offset_per_key.push(offset_per_key.last().unwrap() + row.iter().sum::<usize>());
    }
    let total = *offset_per_key.last().unwrap();

    let client = R::client(device);
    let values_host = random_values(total, 62);
    let lengths_host: Vec<i32> = lengths
        .iter()
        .flat_map(|row| row.iter().map(|l| *l as i32))
        .collect();

    let values = create_tensor::<F, R>(&client, &values_host, vec![total]);
    let lengths_tensor = {
        let handle = client.create(i32::as_bytes(&lengths_host));
        TensorHandle::<R, i32>::new_contiguous(vec![keys, batch], handle)
    };

    let stacked = stacked_jagged_1d_to_dense::<R, F, i32>(
        &client,
        &values.as_ref(),
        &lengths_tensor.as_ref(),
        &offset_per_key,
        &max_lengths,
        F::new(padding),
    )
    .unwrap();

    for key in 0..keys {
        let mut key_offsets = vec![0_i32];
        for length in lengths[key] {
            key_offsets.push(key_offsets.last().unwrap() + length as i32);
        }

        let case = JaggedTestCase {
            offsets: vec![key_offsets],
            max_lengths: vec![max_lengths[key]],
            inner: 1,
        };
        let key_values = &values_host[offset_per_key[key]..offset_per_key[key + 1]];
        let expected = case.host_padded(key_values, padding);

        assert_eq!(
            stacked.dense_per_key[key].shape,
            vec![batch, max_lengths[key]]
        );
        let actual = read_tensor(&client, &stacked.dense_per_key[key]);
        assert_approx_equal(&actual, &expected, tolerance::<F>());
    }
}

/// The single-channel convenience wrapper matches the host reference.
pub fn test_jagged_1d<F, R>(device: &R::Device)
where
    F: Float + CubeElement + ToPrimitive,
    R: Runtime,
{
    let offsets_host = vec![0_i32, 2, 2, 5];
    let max_length = 3;
    let padding = 9.0;

    let client = R::client(device);
    let values_host = random_values(5, 63);
    let values = create_tensor::<F, R>(&client, &values_host, vec![5]);
    let offsets = create_offsets::<R>(&client, &offsets_host);

    let output = jagged_1d_to_dense::<R, F, i32>(
        &client,
        &values.as_ref(),
        &offsets.as_ref(),
        max_length,
        F::new(padding),
    )
    .unwrap();

    let case = JaggedTestCase {
        offsets: vec![offsets_host],
        max_lengths: vec![max_length],
        inner: 1,
    };
    let actual = read_tensor(&client, &output);
    let expected = case.host_padded(&values_host, padding);
    assert_approx_equal(&actual, &expected, tolerance::<F>());
}

/// A batch large enough to span many cubes, exercising the grid sizing and
/// the trailing-cube bound checks.
pub fn test_large_batch<F, R>(device: &R::Device)
where
    F: Float + CubeElement + ToPrimitive,
    R: Runtime,
{
    let batch = 300;
    let mut offsets = vec![0_i32];
    for index in 0..batch {
        offsets.push(offsets.last().unwrap() + (index % 7) as i32);
    }

    let case = JaggedTestCase {
        offsets: vec![offsets],
        max_lengths: vec![5],
        inner: 17,
    };
    case.test_padding::<F, R>(device);
}

fn random_values(count: usize, seed: u64) -> Vec<f32> {
    let distribution = Uniform::new_inclusive(-2 * PRECISION, 2 * PRECISION);
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| distribution.sample(&mut rng) as f32 / PRECISION as f32)
        .collect()
}

pub fn create_tensor<F, R>(
    client: &ComputeClient<R::Server, R::Channel>,
    data: &[f32],
    shape: Vec<usize>,
) -> TensorHandle<R, F>
where
    F: Float + CubeElement,
    R: Runtime,
{
    let converted: Vec<F> = data.iter().map(|value| F::new(*value)).collect();
    let handle = if converted.is_empty() {
        client.empty(size_of::<F>())
    } else {
        client.create(F::as_bytes(&converted))
    };
    TensorHandle::new_contiguous(shape, handle)
}

pub fn create_offsets<R: Runtime>(
    client: &ComputeClient<R::Server, R::Channel>,
    offsets: &[i32],
) -> TensorHandle<R, i32> {
    let handle = client.create(i32::as_bytes(offsets));
    TensorHandle::new_contiguous(vec![offsets.len()], handle)
}

pub fn read_tensor<F, R>(
    client: &ComputeClient<R::Server, R::Channel>,
    tensor: &TensorHandle<R, F>,
) -> Vec<f32>
where
    F: Float + CubeElement + ToPrimitive,
    R: Runtime,
{
    let numel: usize = tensor.shape.iter().product();
    if numel == 0 {
        return Vec::new();
    }
    let bytes = client.read_one(tensor.handle.clone().binding());
    F::from_bytes(&bytes)
        .iter()
        .take(numel)
        .map(|value| value.to_f32().unwrap_or(f32::NAN))
        .collect()
}

pub fn read_offsets<R: Runtime>(
    client: &ComputeClient<R::Server, R::Channel>,
    tensor: &TensorHandle<R, i32>,
) -> Vec<i32> {
    let numel: usize = tensor.shape.iter().product();
    let bytes = client.read_one(tensor.handle.clone().binding());
    i32::from_bytes(&bytes)
        .iter()
        .take(numel)
        .copied()
        .collect()
}

pub fn assert_approx_equal(actual: &[f32], expected: &[f32], epsilon: f32) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "actual and expected lengths differ"
    );
    for (i, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
        let diff = (a - e).abs();
        assert!(
            diff <= epsilon,
            "Values differ more than epsilon: index={i} actual={a}, expected={e}, difference={diff}, epsilon={epsilon}"
        );
    }
}

fn tolerance<F: CubeElement>() -> f32 {
    if size_of::<F>() == 2 {
        2e-2
    } else {
        1e-5
    }
}
