// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Feature normalisation over `(batch, channels, height, width)` tensors.
//!
//! Statistics always come from the current batch; there are no running
//! averages, so a forward pass never mutates the layer.

use super::{validate_positive, Embedding, Linear};
use crate::module::{ConditionalModule, Module, ParamRole, Parameter, Parameterized};
use serde::{Deserialize, Serialize};
use st_tensor::{PureResult, Tensor, TensorError};
use std::fmt;
use std::str::FromStr;

const GROUP_NORM_GROUPS: usize = 16;

/// Which axes the normalisation statistics are pooled over.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormStyle {
    /// Per channel over batch and space.
    #[default]
    Bn,
    /// Per sample and channel over space.
    In,
    /// Per sample over channels and space.
    Ln,
    /// Per sample over channel groups (up to 16 groups) and space.
    Gn,
    /// No normalisation; only the conditional affine transform is applied.
    Nonorm,
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

fn mean_over(x: &Tensor, axes: &[usize]) -> PureResult<Tensor> {
    let mut mean = x.clone();
    for &axis in axes {
        mean = mean.mean_axis_keepdim(axis)?;
    }
    Ok(mean)
}

/// Returns the standardised tensor and the broadcastable `1 / sqrt(var + eps)`.
fn standardize_parts(x: &Tensor, axes: &[usize], eps: f32) -> PureResult<(Tensor, Tensor)> {
    let centered = x.add_broadcast(&mean_over(x, axes)?.scale(-1.0))?;
    let var = mean_over(&centered.mul(&centered)?, axes)?;
    let inv_std = var.map(|v| 1.0 / (v + eps).sqrt());
    Ok((centered.mul_broadcast(&inv_std)?, inv_std))
}

fn standardize(x: &Tensor, axes: &[usize], eps: f32) -> PureResult<Tensor> {
    standardize_parts(x, axes, eps).map(|(normalized, _)| normalized)
}

/// `dx = (dy - mean(dy) - y * mean(dy * y)) / sqrt(var + eps)` over `axes`.
fn standardize_backward(
    x: &Tensor,
    axes: &[usize],
    eps: f32,
    grad_output: &Tensor,
) -> PureResult<Tensor> {
    let (normalized, inv_std) = standardize_parts(x, axes, eps)?;
    let mean_grad = mean_over(grad_output, axes)?;
    let mean_projection = mean_over(&grad_output.mul(&normalized)?, axes)?;
    grad_output
        .add_broadcast(&mean_grad.scale(-1.0))?
        .sub(&normalized.mul_broadcast(&mean_projection)?)?
        .mul_broadcast(&inv_std)
}

impl NormStyle {
    pub fn normalize(self, input: &Tensor, eps: f32) -> PureResult<Tensor> {
        let (batch, channels, height, width) = input.dims4()?;
        match self {
            NormStyle::Bn => standardize(input, &[0, 2, 3], eps),
            NormStyle::In => standardize(input, &[2, 3], eps),
            NormStyle::Ln => standardize(input, &[1, 2, 3], eps),
            NormStyle::Gn => {
                let groups = gcd(channels, GROUP_NORM_GROUPS);
                let grouped = input.reshape(&[batch, groups, channels / groups * height * width])?;
                standardize(&grouped, &[2], eps)?.reshape(&[batch, channels, height, width])
            }
            NormStyle::Nonorm => Ok(input.clone()),
        }
    }

    /// Gradient of [`NormStyle::normalize`] with respect to `input`.
    pub fn normalize_backward(
        self,
        input: &Tensor,
        eps: f32,
        grad_output: &Tensor,
    ) -> PureResult<Tensor> {
        let (batch, channels, height, width) = input.dims4()?;
        if grad_output.shape() != input.shape() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape().to_vec(),
                right: grad_output.shape().to_vec(),
            });
        }
        match self {
            NormStyle::Bn => standardize_backward(input, &[0, 2, 3], eps, grad_output),
            NormStyle::In => standardize_backward(input, &[2, 3], eps, grad_output),
            NormStyle::Ln => standardize_backward(input, &[1, 2, 3], eps, grad_output),
            NormStyle::Gn => {
                let groups = gcd(channels, GROUP_NORM_GROUPS);
                let grouped = [batch, groups, channels / groups * height * width];
                standardize_backward(
                    &input.reshape(&grouped)?,
                    &[2],
                    eps,
                    &grad_output.reshape(&grouped)?,
                )?
                .reshape(&[batch, channels, height, width])
            }
            NormStyle::Nonorm => Ok(grad_output.clone()),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NormStyle::Bn => "bn",
            NormStyle::In => "in",
            NormStyle::Ln => "ln",
            NormStyle::Gn => "gn",
            NormStyle::Nonorm => "nonorm",
        }
    }
}

impl fmt::Display for NormStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NormStyle {
    type Err = TensorError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        match token.trim().to_ascii_lowercase().as_str() {
            "bn" => Ok(NormStyle::Bn),
            "in" => Ok(NormStyle::In),
            "ln" => Ok(NormStyle::Ln),
            "gn" => Ok(NormStyle::Gn),
            "nonorm" => Ok(NormStyle::Nonorm),
            _ => Err(TensorError::InvalidValue { label: "norm_style" }),
        }
    }
}

/// Batch normalisation with a learned per-channel gain (init 1) and bias (init 0).
#[derive(Clone, Debug)]
pub struct BatchNorm2d {
    gain: Parameter,
    bias: Parameter,
    eps: f32,
}

impl BatchNorm2d {
    pub fn new(name: impl Into<String>, channels: usize, eps: f32) -> PureResult<Self> {
        validate_positive(channels, "batch_norm_channels")?;
        let name = name.into();
        Ok(Self {
            gain: Parameter::new(
                format!("{name}::gain"),
                Tensor::full(&[channels], 1.0)?,
                ParamRole::Affine,
            ),
            bias: Parameter::new(
                format!("{name}::bias"),
                Tensor::zeros(&[channels])?,
                ParamRole::Affine,
            ),
            eps,
        })
    }

    pub fn channels(&self) -> usize {
        self.gain.numel()
    }
}

impl Module for BatchNorm2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let channels = self.channels();
        let gain = self.gain.value().reshape(&[1, channels, 1, 1])?;
        let bias = self.bias.value().reshape(&[1, channels, 1, 1])?;
        NormStyle::Bn
            .normalize(input, self.eps)?
            .mul_broadcast(&gain)?
            .add_broadcast(&bias)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let channels = self.channels();
        let per_channel = [1, channels, 1, 1];
        let normalized = NormStyle::Bn.normalize(input, self.eps)?;
        let grad_gain = grad_output
            .mul(&normalized)?
            .sum_to_shape(&per_channel)?
            .reshape(&[channels])?;
        let grad_bias = grad_output.sum_to_shape(&per_channel)?.reshape(&[channels])?;
        let gain = self.gain.value().reshape(&per_channel)?;
        let grad_normalized = grad_output.mul_broadcast(&gain)?;
        self.gain.accumulate_euclidean(&grad_gain)?;
        self.bias.accumulate_euclidean(&grad_bias)?;
        NormStyle::Bn.normalize_backward(input, self.eps, &grad_normalized)
    }
}

impl Parameterized for BatchNorm2d {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.gain)?;
        visitor(&self.bias)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.gain)?;
        visitor(&mut self.bias)
    }
}

/// Maps a conditioning vector to per-channel values.
///
/// Dense conditioning (shared embedding, optionally concatenated with a latent
/// chunk) uses a bias-free [`Linear`]; raw one-hot class vectors use an
/// [`Embedding`] table.
#[derive(Clone, Debug)]
pub enum ConditionProjection {
    Linear(Linear),
    Embedding(Embedding),
}

impl ConditionProjection {
    pub fn project(&self, condition: &Tensor) -> PureResult<Tensor> {
        match self {
            ConditionProjection::Linear(layer) => layer.forward(condition),
            ConditionProjection::Embedding(table) => table.forward(condition),
        }
    }

    /// Accumulates into the projection and returns the condition gradient.
    pub fn project_backward(&mut self, condition: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        match self {
            ConditionProjection::Linear(layer) => layer.backward(condition, grad_output),
            ConditionProjection::Embedding(table) => table.backward(condition, grad_output),
        }
    }

    pub fn output_dim(&self) -> usize {
        match self {
            ConditionProjection::Linear(layer) => layer.output_dim(),
            ConditionProjection::Embedding(table) => table.embed_dim(),
        }
    }
}

impl Parameterized for ConditionProjection {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        match self {
            ConditionProjection::Linear(layer) => layer.visit_parameters(visitor),
            ConditionProjection::Embedding(table) => table.visit_parameters(visitor),
        }
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        match self {
            ConditionProjection::Linear(layer) => layer.visit_parameters_mut(visitor),
            ConditionProjection::Embedding(table) => table.visit_parameters_mut(visitor),
        }
    }

    fn refresh_spectral_state(&mut self) -> PureResult<()> {
        match self {
            ConditionProjection::Linear(layer) => layer.refresh_spectral_state(),
            ConditionProjection::Embedding(table) => table.refresh_spectral_state(),
        }
    }
}

/// Class-conditional batch normalisation: `norm(x) * (1 + P_g(c)) + P_b(c)`.
#[derive(Clone, Debug)]
pub struct ConditionalBatchNorm2d {
    channels: usize,
    style: NormStyle,
    eps: f32,
    gain: ConditionProjection,
    bias: ConditionProjection,
}

impl ConditionalBatchNorm2d {
    pub fn new(
        channels: usize,
        style: NormStyle,
        eps: f32,
        gain: ConditionProjection,
        bias: ConditionProjection,
    ) -> PureResult<Self> {
        validate_positive(channels, "ccbn_channels")?;
        for projection in [&gain, &bias] {
            if projection.output_dim() != channels {
                return Err(TensorError::ShapeMismatch {
                    left: vec![channels],
                    right: vec![projection.output_dim()],
                });
            }
        }
        Ok(Self {
            channels,
            style,
            eps,
            gain,
            bias,
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn style(&self) -> NormStyle {
        self.style
    }
}

impl ConditionalBatchNorm2d {
    fn check_channels(&self, input: &Tensor) -> PureResult<usize> {
        let (batch, channels, _, _) = input.dims4()?;
        if channels != self.channels {
            return Err(TensorError::ShapeMismatch {
                left: input.shape().to_vec(),
                right: vec![batch, self.channels],
            });
        }
        Ok(batch)
    }
}

impl ConditionalModule for ConditionalBatchNorm2d {
    fn forward_conditioned(&self, input: &Tensor, condition: &Tensor) -> PureResult<Tensor> {
        let batch = self.check_channels(input)?;
        let channels = self.channels;
        let gain = self
            .gain
            .project(condition)?
            .add_scalar(1.0)
            .reshape(&[batch, channels, 1, 1])?;
        let bias = self
            .bias
            .project(condition)?
            .reshape(&[batch, channels, 1, 1])?;
        self.style
            .normalize(input, self.eps)?
            .mul_broadcast(&gain)?
            .add_broadcast(&bias)
    }

    fn backward_conditioned(
        &mut self,
        input: &Tensor,
        condition: &Tensor,
        grad_output: &Tensor,
    ) -> PureResult<(Tensor, Tensor)> {
        let batch = self.check_channels(input)?;
        let per_sample = [batch, self.channels, 1, 1];
        let normalized = self.style.normalize(input, self.eps)?;
        let gain = self
            .gain
            .project(condition)?
            .add_scalar(1.0)
            .reshape(&per_sample)?;

        let grad_gain = grad_output
            .mul(&normalized)?
            .sum_to_shape(&per_sample)?
            .reshape(&[batch, self.channels])?;
        let grad_bias = grad_output
            .sum_to_shape(&per_sample)?
            .reshape(&[batch, self.channels])?;
        let grad_condition = self
            .gain
            .project_backward(condition, &grad_gain)?
            .add(&self.bias.project_backward(condition, &grad_bias)?)?;
        let grad_input =
            self.style
                .normalize_backward(input, self.eps, &grad_output.mul_broadcast(&gain)?)?;
        Ok((grad_input, grad_condition))
    }
}

impl Parameterized for ConditionalBatchNorm2d {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.gain.visit_parameters(visitor)?;
        self.bias.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.gain.visit_parameters_mut(visitor)?;
        self.bias.visit_parameters_mut(visitor)
    }

    fn refresh_spectral_state(&mut self) -> PureResult<()> {
        self.gain.refresh_spectral_state()?;
        self.bias.refresh_spectral_state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sample(shape: &[usize], seed: u64) -> Tensor {
        Tensor::random_normal(shape, 1.5, 2.0, Some(seed)).unwrap()
    }

    #[test]
    fn batch_norm_zeroes_channel_means() {
        let bn = BatchNorm2d::new("bn", 3, 1e-5).unwrap();
        let out = bn.forward(&sample(&[4, 3, 5, 5], 1)).unwrap();
        let means = out
            .mean_axis_keepdim(0)
            .unwrap()
            .mean_axis_keepdim(2)
            .unwrap()
            .mean_axis_keepdim(3)
            .unwrap();
        for value in means.to_vec() {
            assert_abs_diff_eq!(value, 0.0, epsilon = 1e-4);
        }
        let var = out.squared_l2_norm() / out.len() as f32;
        assert_abs_diff_eq!(var, 1.0, epsilon = 1e-3);
    }

    #[test]
    fn every_style_preserves_shape() {
        let input = sample(&[2, 8, 4, 4], 2);
        for style in [
            NormStyle::Bn,
            NormStyle::In,
            NormStyle::Ln,
            NormStyle::Gn,
            NormStyle::Nonorm,
        ] {
            let out = style.normalize(&input, 1e-5).unwrap();
            assert_eq!(out.shape(), input.shape(), "{style}");
        }
        assert_eq!(
            NormStyle::Nonorm.normalize(&input, 1e-5).unwrap(),
            input
        );
        assert_eq!("GN".parse::<NormStyle>().unwrap(), NormStyle::Gn);
        assert!("batch".parse::<NormStyle>().is_err());
    }

    #[test]
    fn conditional_gain_starts_from_one() {
        let mut rng = StdRng::seed_from_u64(3);
        let zero_table = |name: &str, rng: &mut StdRng| {
            let mut table = Embedding::new(name, 2, 3, None, rng).unwrap();
            table
                .visit_parameters_mut(&mut |p| {
                    let zeros = Tensor::zeros(p.value().shape())?;
                    *p.value_mut() = zeros.with_requires_grad(true);
                    Ok(())
                })
                .unwrap();
            ConditionProjection::Embedding(table)
        };
        let gain = zero_table("gain", &mut rng);
        let bias = zero_table("bias", &mut rng);
        let ccbn = ConditionalBatchNorm2d::new(3, NormStyle::Bn, 1e-5, gain, bias).unwrap();
        let input = sample(&[2, 3, 4, 4], 4);
        let cond = Tensor::one_hot(&[0, 1], 2).unwrap();
        let out = ccbn.forward_conditioned(&input, &cond).unwrap();
        let plain = NormStyle::Bn.normalize(&input, 1e-5).unwrap();
        for (a, b) in out.to_vec().iter().zip(plain.to_vec()) {
            assert_abs_diff_eq!(*a, b, epsilon = 1e-6);
        }
        assert_eq!(ccbn.parameter_count(), 12);
    }

    fn finite_difference(f: impl Fn(&Tensor) -> f32, x: &Tensor, index: usize) -> f32 {
        let h = 1e-2;
        let shifted = |delta: f32| {
            let mut values = x.to_vec();
            values[index] += delta;
            f(&Tensor::from_vec(x.shape(), values).unwrap())
        };
        (shifted(h) - shifted(-h)) / (2.0 * h)
    }

    #[test]
    fn every_style_backward_matches_finite_differences() {
        let input = sample(&[2, 4, 2, 2], 6);
        let upstream = Tensor::random_normal(&[2, 4, 2, 2], 0.0, 1.0, Some(7)).unwrap();
        for style in [
            NormStyle::Bn,
            NormStyle::In,
            NormStyle::Ln,
            NormStyle::Gn,
            NormStyle::Nonorm,
        ] {
            let analytic = style.normalize_backward(&input, 1e-5, &upstream).unwrap().to_vec();
            let loss = |x: &Tensor| style.normalize(x, 1e-5).unwrap().mul(&upstream).unwrap().sum_all();
            for index in [0, 5, 13, 30] {
                let numeric = finite_difference(loss, &input, index);
                assert!(
                    (analytic[index] - numeric).abs() < 2e-2,
                    "{style} at {index}: {} vs {numeric}",
                    analytic[index]
                );
            }
        }
    }

    #[test]
    fn conditional_backward_reaches_projections_and_condition() {
        let mut rng = StdRng::seed_from_u64(8);
        let gain = ConditionProjection::Linear(Linear::new("g", 5, 3, false, None, &mut rng).unwrap());
        let bias = ConditionProjection::Linear(Linear::new("b", 5, 3, false, None, &mut rng).unwrap());
        let mut ccbn = ConditionalBatchNorm2d::new(3, NormStyle::Bn, 1e-5, gain, bias).unwrap();
        let input = sample(&[2, 3, 2, 2], 9);
        let cond = Tensor::random_normal(&[2, 5], 0.0, 1.0, Some(10)).unwrap();
        let upstream = Tensor::random_normal(&[2, 3, 2, 2], 0.0, 1.0, Some(11)).unwrap();
        let (grad_in, grad_cond) = ccbn.backward_conditioned(&input, &cond, &upstream).unwrap();
        assert_eq!(grad_in.shape(), input.shape());

        let snapshot = ccbn.clone();
        let loss = |c: &Tensor| {
            snapshot
                .forward_conditioned(&input, c)
                .unwrap()
                .mul(&upstream)
                .unwrap()
                .sum_all()
        };
        for index in 0..cond.len() {
            let numeric = finite_difference(loss, &cond, index);
            assert!((grad_cond.to_vec()[index] - numeric).abs() < 2e-2);
        }
        let mut touched = 0;
        ccbn.visit_parameters(&mut |p| {
            touched += usize::from(p.gradient().is_some());
            Ok(())
        })
        .unwrap();
        assert_eq!(touched, 2);
    }

    #[test]
    fn batch_norm_backward_fills_affine_gradients() {
        let mut bn = BatchNorm2d::new("bn", 2, 1e-5).unwrap();
        let input = sample(&[3, 2, 2, 2], 12);
        let upstream = Tensor::full(&[3, 2, 2, 2], 1.0).unwrap();
        let grad_in = bn.backward(&input, &upstream).unwrap();
        // A constant upstream gradient is removed by the mean subtraction.
        assert!(grad_in.to_vec().iter().all(|v| v.abs() < 1e-4));
        assert_eq!(bn.bias.gradient().unwrap().to_vec(), vec![12.0, 12.0]);
        assert!(bn.gain.gradient().unwrap().to_vec().iter().all(|v| v.abs() < 1e-3));
    }

    #[test]
    fn conditional_projection_must_match_channels() {
        let mut rng = StdRng::seed_from_u64(5);
        let gain = ConditionProjection::Linear(Linear::new("g", 4, 3, false, None, &mut rng).unwrap());
        let bias = ConditionProjection::Linear(Linear::new("b", 4, 2, false, None, &mut rng).unwrap());
        assert!(ConditionalBatchNorm2d::new(3, NormStyle::Bn, 1e-5, gain, bias).is_err());
    }
}
