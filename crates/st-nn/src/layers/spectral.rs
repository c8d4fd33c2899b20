// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Spectral normalisation by power iteration.
//!
//! A weight is viewed as an `out × rest` matrix `W`. For every tracked
//! singular value the layer keeps a left-vector estimate `u`; one power step
//! computes `v = normalize(uW)` and `u' = normalize(vWᵀ)`, Gram-Schmidt
//! orthogonalised against the vectors of the higher singular values, and
//! `σ = vWᵀu'ᵀ`. The normalised weight is `W / σ₀`.
//!
//! Forward passes run the configured iterations from the stored estimates
//! without writing them back; [`SpectralNorm::refresh`] persists them.
//!
//! The backward pass treats `u` and `v` as constants, so `∂σ/∂W = u vᵀ`.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::distributions::Distribution;
use rand::Rng;
use rand_distr::StandardNormal;
use st_tensor::{PureResult, Tensor, TensorError};

#[derive(Clone, Debug, PartialEq)]
pub struct SpectralNorm {
    num_svs: usize,
    num_itrs: usize,
    eps: f32,
    us: Vec<Array1<f32>>,
}

/// Result of one round of power iteration.
#[derive(Clone, Debug)]
pub struct SpectralEstimate {
    pub singular_values: Vec<f32>,
    us: Vec<Array1<f32>>,
    vs: Vec<Array1<f32>>,
}

fn matrix_view(weight: &Tensor) -> PureResult<ArrayView2<'_, f32>> {
    let rows = *weight.shape().first().ok_or(TensorError::EmptyInput("spectral_norm"))?;
    let cols = weight.len() / rows;
    weight
        .data()
        .view()
        .into_shape((rows, cols))
        .map_err(|_| TensorError::InvalidDimensions {
            shape: weight.shape().to_vec(),
        })
}

fn gram_schmidt(mut x: Array1<f32>, basis: &[Array1<f32>]) -> Array1<f32> {
    for y in basis {
        let denom = y.dot(y);
        if denom > 0.0 {
            let coeff = x.dot(y) / denom;
            x.scaled_add(-coeff, y);
        }
    }
    x
}

fn normalize(mut x: Array1<f32>, eps: f32) -> Array1<f32> {
    let norm = x.dot(&x).sqrt().max(eps);
    x.mapv_inplace(|v| v / norm);
    x
}

impl SpectralNorm {
    /// Creates the state for a weight with `out_features` rows; the `u`
    /// estimates start as standard normal draws.
    pub fn new<R: Rng + ?Sized>(
        out_features: usize,
        num_svs: usize,
        num_itrs: usize,
        eps: f32,
        rng: &mut R,
    ) -> PureResult<Self> {
        if out_features == 0 {
            return Err(TensorError::InvalidDimensions {
                shape: vec![out_features],
            });
        }
        if num_svs == 0 || num_svs > out_features {
            return Err(TensorError::InvalidValue {
                label: "spectral_num_svs",
            });
        }
        if num_itrs == 0 {
            return Err(TensorError::InvalidValue {
                label: "spectral_num_itrs",
            });
        }
        if !(eps > 0.0) {
            return Err(TensorError::InvalidValue {
                label: "spectral_eps",
            });
        }
        let us = (0..num_svs)
            .map(|_| {
                Array1::from_shape_simple_fn(out_features, || {
                    let sample: f64 = StandardNormal.sample(&mut *rng);
                    sample as f32
                })
            })
            .collect();
        Ok(Self {
            num_svs,
            num_itrs,
            eps,
            us,
        })
    }

    pub fn num_svs(&self) -> usize {
        self.num_svs
    }

    pub fn num_itrs(&self) -> usize {
        self.num_itrs
    }

    /// Runs `num_itrs` power steps starting from the stored estimates.
    pub fn estimate(&self, weight: &Tensor) -> PureResult<SpectralEstimate> {
        let w = matrix_view(weight)?;
        if w.nrows() != self.us[0].len() {
            return Err(TensorError::ShapeMismatch {
                left: weight.shape().to_vec(),
                right: vec![self.us[0].len()],
            });
        }
        let mut us = self.us.clone();
        let mut vs: Vec<Array1<f32>> = Vec::new();
        let mut singular_values = vec![0.0; self.num_svs];
        for _ in 0..self.num_itrs {
            let mut next_us: Vec<Array1<f32>> = Vec::with_capacity(self.num_svs);
            let mut next_vs: Vec<Array1<f32>> = Vec::with_capacity(self.num_svs);
            for (index, u) in us.iter().enumerate() {
                let v = normalize(gram_schmidt(u.dot(&w), &next_vs), self.eps);
                let u_next = normalize(gram_schmidt(w.dot(&v), &next_us), self.eps);
                singular_values[index] = w.dot(&v).dot(&u_next);
                next_vs.push(v);
                next_us.push(u_next);
            }
            us = next_us;
            vs = next_vs;
        }
        Ok(SpectralEstimate {
            singular_values,
            us,
            vs,
        })
    }

    /// Returns `weight / σ₀`, keeping the weight's tracking flag.
    pub fn normalise(&self, weight: &Tensor) -> PureResult<Tensor> {
        let estimate = self.estimate(weight)?;
        let sigma = estimate.singular_values[0];
        if !sigma.is_finite() {
            return Err(TensorError::NonFiniteValue {
                label: "spectral_sigma",
                value: sigma,
            });
        }
        Ok(weight.scale(1.0 / sigma.max(self.eps)))
    }

    /// Maps a gradient taken with respect to the normalised weight back onto
    /// the raw weight: `(G - <G, W/σ> u vᵀ) / σ`.
    pub fn backward(&self, weight: &Tensor, grad_normalised: &Tensor) -> PureResult<Tensor> {
        if grad_normalised.shape() != weight.shape() {
            return Err(TensorError::ShapeMismatch {
                left: weight.shape().to_vec(),
                right: grad_normalised.shape().to_vec(),
            });
        }
        let estimate = self.estimate(weight)?;
        let sigma = estimate.singular_values[0];
        if !sigma.is_finite() {
            return Err(TensorError::NonFiniteValue {
                label: "spectral_sigma",
                value: sigma,
            });
        }
        if sigma <= self.eps {
            // σ is clamped to a constant here.
            return Ok(grad_normalised.scale(1.0 / self.eps).detach());
        }
        let w = matrix_view(weight)?;
        let g = matrix_view(grad_normalised)?;
        let (u, v) = match (estimate.us.first(), estimate.vs.first()) {
            (Some(u), Some(v)) => (u.view(), v.view()),
            _ => return Err(TensorError::EmptyInput("spectral_backward")),
        };
        let projection = (&g * &w).sum() / sigma;
        let outer: Array2<f32> = u.insert_axis(Axis(1)).dot(&v.insert_axis(Axis(0)));
        let grad = (&g - &(outer * projection)) / sigma;
        Tensor::from_vec(weight.shape(), grad.iter().copied().collect())
    }

    /// Writes the refined `u` estimates back.
    pub fn refresh(&mut self, weight: &Tensor) -> PureResult<Vec<f32>> {
        let estimate = self.estimate(weight)?;
        self.us = estimate.us;
        Ok(estimate.singular_values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn diagonal() -> Tensor {
        Tensor::from_vec(&[3, 3], vec![3.0, 0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 0.5]).unwrap()
    }

    #[test]
    fn refreshed_estimates_converge_to_singular_values() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut sn = SpectralNorm::new(3, 2, 1, 1e-8, &mut rng).unwrap();
        let weight = diagonal();
        let mut svs = Vec::new();
        for _ in 0..50 {
            svs = sn.refresh(&weight).unwrap();
        }
        assert_abs_diff_eq!(svs[0], 3.0, epsilon = 1e-3);
        assert_abs_diff_eq!(svs[1], 2.0, epsilon = 1e-2);
        let normalised = sn.normalise(&weight).unwrap();
        assert_abs_diff_eq!(normalised.max_value(), 1.0, epsilon = 1e-3);
    }

    #[test]
    fn forward_estimate_does_not_mutate_state() {
        let mut rng = StdRng::seed_from_u64(2);
        let sn = SpectralNorm::new(3, 1, 4, 1e-8, &mut rng).unwrap();
        let before = sn.clone();
        let _ = sn.normalise(&diagonal()).unwrap();
        assert_eq!(sn, before);
    }

    #[test]
    fn conv_shaped_weights_are_flattened() {
        let mut rng = StdRng::seed_from_u64(3);
        let weight = Tensor::random_normal_with_rng(&[4, 2, 3, 3], 0.0, 1.0, &mut rng).unwrap();
        let mut sn = SpectralNorm::new(4, 1, 1, 1e-8, &mut rng).unwrap();
        for _ in 0..500 {
            sn.refresh(&weight).unwrap();
        }
        let normalised = sn.normalise(&weight).unwrap();
        let mut check = SpectralNorm::new(4, 1, 1, 1e-8, &mut rng).unwrap();
        let mut sigma = 0.0;
        for _ in 0..500 {
            sigma = check.refresh(&normalised).unwrap()[0];
        }
        assert_abs_diff_eq!(sigma, 1.0, epsilon = 1e-3);
    }

    #[test]
    fn weight_gradient_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(5);
        let weight = Tensor::random_normal_with_rng(&[3, 4], 0.0, 1.0, &mut rng).unwrap();
        let upstream = Tensor::random_normal_with_rng(&[3, 4], 0.0, 1.0, &mut rng).unwrap();
        let mut sn = SpectralNorm::new(3, 1, 1, 1e-8, &mut rng).unwrap();
        for _ in 0..200 {
            sn.refresh(&weight).unwrap();
        }
        let analytic = sn.backward(&weight, &upstream).unwrap().to_vec();
        let loss = |w: &Tensor| sn.normalise(w).unwrap().mul(&upstream).unwrap().sum_all();
        let h = 1e-2;
        for index in 0..weight.len() {
            let shifted = |delta: f32| {
                let mut values = weight.to_vec();
                values[index] += delta;
                Tensor::from_vec(&[3, 4], values).unwrap()
            };
            let numeric = (loss(&shifted(h)) - loss(&shifted(-h))) / (2.0 * h);
            assert_abs_diff_eq!(analytic[index], numeric, epsilon = 5e-2);
        }
    }

    #[test]
    fn rejects_invalid_settings() {
        let mut rng = StdRng::seed_from_u64(4);
        assert!(SpectralNorm::new(2, 3, 1, 1e-8, &mut rng).is_err());
        assert!(SpectralNorm::new(2, 1, 0, 1e-8, &mut rng).is_err());
        assert!(SpectralNorm::new(0, 1, 1, 1e-8, &mut rng).is_err());
    }
}
