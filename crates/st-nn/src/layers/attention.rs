// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::{Conv2d, LayerFactory};
use crate::module::{Module, ParamRole, Parameter, Parameterized};
use st_tensor::{PureResult, Tensor, TensorError};

/// Self-attention over spatial positions (SAGAN/BigGAN layout).
///
/// Queries `θ` and keys `φ` are 1×1 projections to `channels / 8`, values `g`
/// to `channels / 2`; keys and values are 2×2 max-pooled. The attended values
/// are projected back by `o` and blended into the input through a learned
/// scalar `γ` that starts at zero, so a freshly built block is the identity.
#[derive(Clone, Debug)]
pub struct Attention {
    channels: usize,
    theta: Conv2d,
    phi: Conv2d,
    g: Conv2d,
    o: Conv2d,
    gamma: Parameter,
}

impl Attention {
    /// Narrowest input that still leaves one key channel.
    pub const MIN_CHANNELS: usize = 8;

    pub fn new(name: &str, channels: usize, factory: &LayerFactory) -> PureResult<Self> {
        if channels < Self::MIN_CHANNELS {
            return Err(TensorError::InvalidValue {
                label: "attention_channels",
            });
        }
        let key_channels = channels / 8;
        let value_channels = channels / 2;
        Ok(Self {
            channels,
            theta: factory.conv_with(&format!("{name}.theta"), channels, key_channels, 1, 0, false)?,
            phi: factory.conv_with(&format!("{name}.phi"), channels, key_channels, 1, 0, false)?,
            g: factory.conv_with(&format!("{name}.g"), channels, value_channels, 1, 0, false)?,
            o: factory.conv_with(&format!("{name}.o"), value_channels, channels, 1, 0, false)?,
            gamma: Parameter::new(format!("{name}::gamma"), Tensor::zeros(&[1])?, ParamRole::Affine),
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn gamma(&self) -> &Parameter {
        &self.gamma
    }
}

/// Intermediates of one attention pass, kept for the backward pass.
struct AttentionTrace {
    theta: Tensor,
    phi_full: Tensor,
    phi: Tensor,
    g_full: Tensor,
    g: Tensor,
    beta: Tensor,
    attended: Tensor,
    o: Tensor,
}

impl Attention {
    fn trace(&self, input: &Tensor) -> PureResult<AttentionTrace> {
        let (batch, channels, height, width) = input.dims4()?;
        if channels != self.channels {
            return Err(TensorError::ShapeMismatch {
                left: input.shape().to_vec(),
                right: vec![batch, self.channels, height, width],
            });
        }
        let key_channels = self.theta.out_channels();
        let value_channels = self.g.out_channels();

        let theta = self
            .theta
            .forward(input)?
            .reshape(&[batch, key_channels, height * width])?;
        let phi_full = self.phi.forward(input)?;
        let phi = phi_full.max_pool2d(2)?;
        let pooled = phi.shape()[2] * phi.shape()[3];
        let phi = phi.reshape(&[batch, key_channels, pooled])?;
        let g_full = self.g.forward(input)?;
        let g = g_full
            .max_pool2d(2)?
            .reshape(&[batch, value_channels, pooled])?;

        // [batch, positions, pooled positions]
        let beta = theta.transpose_last2()?.bmm(&phi)?.softmax_last();
        let attended = g
            .bmm(&beta.transpose_last2()?)?
            .reshape(&[batch, value_channels, height, width])?;
        let o = self.o.forward(&attended)?;
        Ok(AttentionTrace {
            theta,
            phi_full,
            phi,
            g_full,
            g,
            beta,
            attended,
            o,
        })
    }
}

impl Module for Attention {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let trace = self.trace(input)?;
        trace.o.mul_broadcast(self.gamma.value())?.add(input)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let trace = self.trace(input)?;
        let (batch, _, height, width) = input.dims4()?;
        if grad_output.shape() != input.shape() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape().to_vec(),
                right: grad_output.shape().to_vec(),
            });
        }
        let key_channels = self.theta.out_channels();
        let value_channels = self.g.out_channels();

        let grad_gamma = Tensor::from_vec(&[1], vec![grad_output.mul(&trace.o)?.sum_all()])?;
        let grad_o = grad_output.mul_broadcast(self.gamma.value())?;
        let grad_attended = self
            .o
            .backward(&trace.attended, &grad_o)?
            .reshape(&[batch, value_channels, height * width])?;

        let grad_g = grad_attended.bmm(&trace.beta)?;
        let grad_beta = grad_attended.transpose_last2()?.bmm(&trace.g)?;
        let grad_scores = trace.beta.softmax_last_backward(&grad_beta)?;
        let grad_theta = trace
            .phi
            .bmm(&grad_scores.transpose_last2()?)?
            .reshape(&[batch, key_channels, height, width])?;
        let grad_phi = trace
            .theta
            .bmm(&grad_scores)?
            .reshape(&[batch, key_channels, height / 2, width / 2])?;
        let grad_g = grad_g.reshape(&[batch, value_channels, height / 2, width / 2])?;

        let grad_phi = trace.phi_full.max_pool2d_backward(2, &grad_phi)?;
        let grad_g = trace.g_full.max_pool2d_backward(2, &grad_g)?;
        let from_theta = self.theta.backward(input, &grad_theta)?;
        let from_phi = self.phi.backward(input, &grad_phi)?;
        let from_g = self.g.backward(input, &grad_g)?;
        self.gamma.accumulate_euclidean(&grad_gamma)?;
        grad_output.add(&from_theta)?.add(&from_phi)?.add(&from_g)
    }
}

impl Parameterized for Attention {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.theta.visit_parameters(visitor)?;
        self.phi.visit_parameters(visitor)?;
        self.g.visit_parameters(visitor)?;
        self.o.visit_parameters(visitor)?;
        visitor(&self.gamma)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.theta.visit_parameters_mut(visitor)?;
        self.phi.visit_parameters_mut(visitor)?;
        self.g.visit_parameters_mut(visitor)?;
        self.o.visit_parameters_mut(visitor)?;
        visitor(&mut self.gamma)
    }

    fn refresh_spectral_state(&mut self) -> PureResult<()> {
        self.theta.refresh_spectral_state()?;
        self.phi.refresh_spectral_state()?;
        self.g.refresh_spectral_state()?;
        self.o.refresh_spectral_state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::Parameterization;

    fn factory() -> LayerFactory {
        LayerFactory::seeded(Parameterization::spectral(1, 1), 3, 17).unwrap()
    }

    #[test]
    fn fresh_attention_is_identity() {
        let attn = Attention::new("attn", 16, &factory()).unwrap();
        let input = Tensor::random_normal(&[2, 16, 4, 4], 0.0, 1.0, Some(1)).unwrap();
        let out = attn.forward(&input).unwrap();
        assert_eq!(out.shape(), input.shape());
        for (a, b) in out.to_vec().iter().zip(input.to_vec()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn nonzero_gamma_mixes_positions() {
        let mut attn = Attention::new("attn", 8, &factory()).unwrap();
        attn.gamma.value_mut().data_mut().fill(1.0);
        let input = Tensor::random_normal(&[1, 8, 4, 4], 0.0, 1.0, Some(2)).unwrap();
        let out = attn.forward(&input).unwrap();
        assert_ne!(out.to_vec(), input.to_vec());
        // θ, φ: 8→1, g: 8→4, o: 4→8, no biases, plus γ.
        assert_eq!(attn.parameter_count(), 8 + 8 + 32 + 32 + 1);
    }

    #[test]
    fn backward_matches_finite_differences() {
        let mut attn = Attention::new("attn", 8, &factory()).unwrap();
        attn.gamma.value_mut().data_mut().fill(0.7);
        let input = Tensor::random_normal(&[1, 8, 4, 4], 0.0, 1.0, Some(5)).unwrap();
        let upstream = Tensor::random_normal(&[1, 8, 4, 4], 0.0, 1.0, Some(6)).unwrap();
        let snapshot = attn.clone();
        let grad_in = attn.backward(&input, &upstream).unwrap().to_vec();

        let loss = |x: &Tensor| snapshot.forward(x).unwrap().mul(&upstream).unwrap().sum_all();
        let h = 1e-2;
        for index in [0, 9, 40, 77, 127] {
            let shifted = |delta: f32| {
                let mut values = input.to_vec();
                values[index] += delta;
                loss(&Tensor::from_vec(input.shape(), values).unwrap())
            };
            let numeric = (shifted(h) - shifted(-h)) / (2.0 * h);
            assert!(
                (grad_in[index] - numeric).abs() < 5e-2,
                "input {index}: {} vs {numeric}",
                grad_in[index]
            );
        }
        let mut with_grad = 0;
        attn.visit_parameters(&mut |p| {
            with_grad += usize::from(p.gradient().is_some());
            Ok(())
        })
        .unwrap();
        assert_eq!(with_grad, 5);
    }

    #[test]
    fn narrow_channels_are_rejected() {
        assert!(Attention::new("attn", 4, &factory()).is_err());
    }
}
