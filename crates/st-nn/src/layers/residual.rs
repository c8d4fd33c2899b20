// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::{Activation, ConditionalBatchNorm2d, Conv2d, LayerFactory, Upsample};
use crate::module::{ConditionalModule, Module, Parameter, Parameterized};
use st_tensor::{PureResult, Tensor};

/// Class-conditional residual block of the generator.
///
/// Main path: `cbn → act → upsample → conv1 → cbn → act → conv2`. The
/// shortcut is upsampled too and goes through a learnable 1×1 convolution
/// whenever the channel count changes or the block upsamples.
#[derive(Clone, Debug)]
pub struct GBlock {
    in_channels: usize,
    out_channels: usize,
    bn1: ConditionalBatchNorm2d,
    conv1: Conv2d,
    bn2: ConditionalBatchNorm2d,
    conv2: Conv2d,
    shortcut: Option<Conv2d>,
    activation: Activation,
    upsample: Option<Upsample>,
}

impl GBlock {
    /// `norm` builds a conditional norm for the given name and channel count.
    pub fn new<N>(
        name: &str,
        in_channels: usize,
        out_channels: usize,
        factory: &LayerFactory,
        norm: N,
        activation: Activation,
        upsample: Option<Upsample>,
    ) -> PureResult<Self>
    where
        N: Fn(&str, usize) -> PureResult<ConditionalBatchNorm2d>,
    {
        let learnable_sc = in_channels != out_channels || upsample.is_some();
        let shortcut = if learnable_sc {
            Some(factory.conv_with(
                &format!("{name}.conv_sc"),
                in_channels,
                out_channels,
                1,
                0,
                true,
            )?)
        } else {
            None
        };
        Ok(Self {
            in_channels,
            out_channels,
            bn1: norm(&format!("{name}.bn1"), in_channels)?,
            conv1: factory.conv(&format!("{name}.conv1"), in_channels, out_channels)?,
            bn2: norm(&format!("{name}.bn2"), out_channels)?,
            conv2: factory.conv(&format!("{name}.conv2"), out_channels, out_channels)?,
            shortcut,
            activation,
            upsample,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn has_learnable_shortcut(&self) -> bool {
        self.shortcut.is_some()
    }

    pub fn upsamples(&self) -> bool {
        self.upsample.is_some()
    }
}

impl ConditionalModule for GBlock {
    fn forward_conditioned(&self, input: &Tensor, condition: &Tensor) -> PureResult<Tensor> {
        let mut h = self
            .activation
            .apply(&self.bn1.forward_conditioned(input, condition)?);
        let mut x = input.clone();
        if let Some(upsample) = &self.upsample {
            h = upsample.forward(&h)?;
            x = upsample.forward(&x)?;
        }
        h = self.conv1.forward(&h)?;
        h = self
            .activation
            .apply(&self.bn2.forward_conditioned(&h, condition)?);
        h = self.conv2.forward(&h)?;
        if let Some(shortcut) = &self.shortcut {
            x = shortcut.forward(&x)?;
        }
        h.add(&x)
    }

    fn backward_conditioned(
        &mut self,
        input: &Tensor,
        condition: &Tensor,
        grad_output: &Tensor,
    ) -> PureResult<(Tensor, Tensor)> {
        let pre1 = self.bn1.forward_conditioned(input, condition)?;
        let mut h1 = self.activation.apply(&pre1);
        let mut x = input.clone();
        if let Some(upsample) = &self.upsample {
            h1 = upsample.forward(&h1)?;
            x = upsample.forward(&x)?;
        }
        let c1 = self.conv1.forward(&h1)?;
        let pre2 = self.bn2.forward_conditioned(&c1, condition)?;
        let h2 = self.activation.apply(&pre2);

        let grad = self.conv2.backward(&h2, grad_output)?;
        let grad = self.activation.apply_backward(&pre2, &grad)?;
        let (grad, grad_cond2) = self.bn2.backward_conditioned(&c1, condition, &grad)?;
        let mut grad = self.conv1.backward(&h1, &grad)?;
        let mut grad_skip = match &mut self.shortcut {
            Some(shortcut) => shortcut.backward(&x, grad_output)?,
            None => grad_output.clone(),
        };
        if let Some(upsample) = &self.upsample {
            grad = grad.upsample_nearest2d_backward(upsample.factor())?;
            grad_skip = grad_skip.upsample_nearest2d_backward(upsample.factor())?;
        }
        let grad = self.activation.apply_backward(&pre1, &grad)?;
        let (grad, grad_cond1) = self.bn1.backward_conditioned(input, condition, &grad)?;
        Ok((grad.add(&grad_skip)?, grad_cond1.add(&grad_cond2)?))
    }
}

impl Parameterized for GBlock {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.bn1.visit_parameters(visitor)?;
        self.conv1.visit_parameters(visitor)?;
        self.bn2.visit_parameters(visitor)?;
        self.conv2.visit_parameters(visitor)?;
        self.shortcut.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.bn1.visit_parameters_mut(visitor)?;
        self.conv1.visit_parameters_mut(visitor)?;
        self.bn2.visit_parameters_mut(visitor)?;
        self.conv2.visit_parameters_mut(visitor)?;
        self.shortcut.visit_parameters_mut(visitor)
    }

    fn refresh_spectral_state(&mut self) -> PureResult<()> {
        self.bn1.refresh_spectral_state()?;
        self.conv1.refresh_spectral_state()?;
        self.bn2.refresh_spectral_state()?;
        self.conv2.refresh_spectral_state()?;
        self.shortcut.refresh_spectral_state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{ConditionProjection, NormStyle, Parameterization};

    fn build(in_channels: usize, out_channels: usize, upsample: bool) -> GBlock {
        let factory = LayerFactory::seeded(Parameterization::spectral(1, 1), 3, 5).unwrap();
        let norm = |name: &str, channels: usize| {
            let gain = factory.linear(&format!("{name}.gain"), 6, channels, false)?;
            let bias = factory.linear(&format!("{name}.bias"), 6, channels, false)?;
            ConditionalBatchNorm2d::new(
                channels,
                NormStyle::Bn,
                1e-5,
                ConditionProjection::Linear(gain),
                ConditionProjection::Linear(bias),
            )
        };
        let up = if upsample {
            Some(Upsample::new(2).unwrap())
        } else {
            None
        };
        GBlock::new("block", in_channels, out_channels, &factory, norm, Activation::Relu, up)
            .unwrap()
    }

    #[test]
    fn upsampling_block_doubles_resolution() {
        let block = build(8, 4, true);
        assert!(block.has_learnable_shortcut());
        let x = Tensor::random_normal(&[2, 8, 4, 4], 0.0, 1.0, Some(3)).unwrap();
        let y = Tensor::random_normal(&[2, 6], 0.0, 1.0, Some(4)).unwrap();
        let out = block.forward_conditioned(&x, &y).unwrap();
        assert_eq!(out.shape(), &[2, 4, 8, 8]);
    }

    #[test]
    fn shortcut_follows_channels_and_upsampling() {
        assert!(!build(4, 4, false).has_learnable_shortcut());
        assert!(build(4, 8, false).has_learnable_shortcut());
        assert!(build(4, 4, true).has_learnable_shortcut());
    }

    #[test]
    fn backward_returns_input_and_condition_gradients() {
        let mut block = build(4, 8, true);
        let x = Tensor::random_normal(&[2, 4, 2, 2], 0.0, 1.0, Some(5)).unwrap();
        let y = Tensor::random_normal(&[2, 6], 0.0, 1.0, Some(6)).unwrap();
        let upstream = Tensor::random_normal(&[2, 8, 4, 4], 0.0, 1.0, Some(7)).unwrap();
        let snapshot = block.clone();
        let (grad_x, grad_y) = block.backward_conditioned(&x, &y, &upstream).unwrap();
        assert_eq!(grad_x.shape(), x.shape());
        assert_eq!(grad_y.shape(), y.shape());

        let loss = |x: &Tensor| {
            snapshot
                .forward_conditioned(x, &y)
                .unwrap()
                .mul(&upstream)
                .unwrap()
                .sum_all()
        };
        let h = 1e-3;
        for index in [0, 6, 19, 31] {
            let shifted = |delta: f32| {
                let mut values = x.to_vec();
                values[index] += delta;
                loss(&Tensor::from_vec(x.shape(), values).unwrap())
            };
            let numeric = (shifted(h) - shifted(-h)) / (2.0 * h);
            let analytic = grad_x.to_vec()[index];
            assert!((analytic - numeric).abs() < 5e-2, "{index}: {analytic} vs {numeric}");
        }
        block
            .visit_parameters(&mut |p| {
                assert!(p.gradient().is_some(), "{} has no gradient", p.name());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn parameter_names_are_module_qualified() {
        let block = build(4, 4, false);
        let names: Vec<String> = block.state_dict().unwrap().into_keys().collect();
        assert!(names.iter().any(|n| n == "block.conv1::weight"));
        assert!(names.iter().any(|n| n == "block.bn2.gain::weight"));
        assert!(!names.iter().any(|n| n.starts_with("block.conv_sc")));
    }
}
