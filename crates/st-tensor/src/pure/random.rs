// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Random tensor constructors.
//!
//! Every sampler comes in two flavours: a `seed: Option<u64>` variant that
//! resolves its RNG through [`spiral_config::determinism`], and a `_with_rng`
//! variant that draws from a caller-owned generator so that a whole model can
//! be built from a single reproducible stream.

use super::{validate_shape, PureResult, Tensor, TensorError};
use nalgebra::DMatrix;
use ndarray::{ArrayD, IxDyn};
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;
use spiral_config::determinism;

fn seedable_rng(seed: Option<u64>, label: &str) -> StdRng {
    determinism::rng_from_optional(seed, label)
}

impl Tensor {
    /// Samples `N(mean, std²)` into a tensor of the given shape.
    pub fn random_normal(
        shape: &[usize],
        mean: f32,
        std: f32,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        let mut rng = seedable_rng(seed, "st-tensor/tensor/normal");
        Self::random_normal_with_rng(shape, mean, std, &mut rng)
    }

    pub fn random_normal_with_rng<R: Rng + ?Sized>(
        shape: &[usize],
        mean: f32,
        std: f32,
        rng: &mut R,
    ) -> PureResult<Self> {
        validate_shape(shape)?;
        if !(std > 0.0) || !std.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "random_normal_std",
            });
        }
        let data = ArrayD::from_shape_simple_fn(IxDyn(shape), || {
            let sample: f64 = StandardNormal.sample(&mut *rng);
            mean + std * sample as f32
        });
        Self::from_array(data)
    }

    /// Samples the uniform distribution on `[min, max)`.
    ///
    /// When `seed` is provided the RNG becomes deterministic which makes tests
    /// reproducible. Otherwise the determinism config (or host entropy) decides.
    pub fn random_uniform(
        shape: &[usize],
        min: f32,
        max: f32,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        let mut rng = seedable_rng(seed, "st-tensor/tensor/uniform");
        Self::random_uniform_with_rng(shape, min, max, &mut rng)
    }

    pub fn random_uniform_with_rng<R: Rng + ?Sized>(
        shape: &[usize],
        min: f32,
        max: f32,
        rng: &mut R,
    ) -> PureResult<Self> {
        validate_shape(shape)?;
        if !(min < max) {
            return Err(TensorError::InvalidValue {
                label: "random_uniform_bounds",
            });
        }
        let distribution = Uniform::new(min, max);
        let data = ArrayD::from_shape_simple_fn(IxDyn(shape), || distribution.sample(&mut *rng));
        Self::from_array(data)
    }

    /// Samples a (semi-)orthogonal tensor.
    ///
    /// The tensor is viewed as a `shape[0] × rest` matrix. A Gaussian matrix is
    /// QR-factorised along its longer side and the columns of `Q` are flipped
    /// by the sign of `diag(R)`, so the rows come out orthonormal when
    /// `shape[0] <= rest` and the columns otherwise. The result is multiplied
    /// by `gain`.
    pub fn random_orthogonal(shape: &[usize], gain: f32, seed: Option<u64>) -> PureResult<Self> {
        let mut rng = seedable_rng(seed, "st-tensor/tensor/orthogonal");
        Self::random_orthogonal_with_rng(shape, gain, &mut rng)
    }

    pub fn random_orthogonal_with_rng<R: Rng + ?Sized>(
        shape: &[usize],
        gain: f32,
        rng: &mut R,
    ) -> PureResult<Self> {
        validate_shape(shape)?;
        if shape.len() < 2 {
            return Err(TensorError::RankMismatch {
                expected: 2,
                got: shape.len(),
            });
        }
        let rows = shape[0];
        let cols: usize = shape[1..].iter().product();
        let wide = rows < cols;
        let (long, short) = if wide { (cols, rows) } else { (rows, cols) };
        let gaussian = DMatrix::<f64>::from_fn(long, short, |_, _| StandardNormal.sample(&mut *rng));
        let qr = gaussian.qr();
        let mut q = qr.q();
        let r = qr.r();
        for (j, mut column) in q.column_iter_mut().enumerate() {
            let diag = r[(j, j)];
            if !diag.is_finite() || diag.abs() <= f64::EPSILON {
                return Err(TensorError::NonFiniteValue {
                    label: "random_orthogonal",
                    value: diag as f32,
                });
            }
            column *= diag.signum();
        }
        let basis = if wide { q.transpose() } else { q };
        let data = (0..rows)
            .flat_map(|i| (0..cols).map(move |j| (i, j)))
            .map(|(i, j)| gain * basis[(i, j)] as f32)
            .collect();
        Self::from_vec(shape, data)
    }
}
