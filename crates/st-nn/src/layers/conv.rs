// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::spectral::SpectralNorm;
use super::{stateless_parameters, validate_positive};
use crate::module::{Module, ParamRole, Parameter, Parameterized};
use rand::Rng;
use st_tensor::{PureResult, Tensor, TensorError};

/// Stride-one 2-D convolution over `(batch, channels, height, width)` tensors,
/// optionally spectrally normalised.
#[derive(Clone, Debug)]
pub struct Conv2d {
    weight: Parameter,
    bias: Option<Parameter>,
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    padding: usize,
    spectral: Option<SpectralNorm>,
}

impl Conv2d {
    /// Builds the layer with PyTorch-style defaults: weight and bias uniform
    /// in `±1/sqrt(fan_in)`.
    #[allow(clippy::too_many_arguments)]
    pub fn new<R: Rng + ?Sized>(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        padding: usize,
        bias: bool,
        spectral: Option<SpectralNorm>,
        rng: &mut R,
    ) -> PureResult<Self> {
        validate_positive(in_channels, "conv_in_channels")?;
        validate_positive(out_channels, "conv_out_channels")?;
        validate_positive(kernel, "conv_kernel")?;
        let name = name.into();
        let bound = 1.0 / ((in_channels * kernel * kernel) as f32).sqrt();
        let weight = Tensor::random_uniform_with_rng(
            &[out_channels, in_channels, kernel, kernel],
            -bound,
            bound,
            rng,
        )?;
        let bias = if bias {
            let value = Tensor::random_uniform_with_rng(&[out_channels], -bound, bound, rng)?;
            Some(Parameter::new(format!("{name}::bias"), value, ParamRole::Bias))
        } else {
            None
        };
        Ok(Self {
            weight: Parameter::new(format!("{name}::weight"), weight, ParamRole::Weight),
            bias,
            in_channels,
            out_channels,
            kernel,
            padding,
            spectral,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn kernel(&self) -> usize {
        self.kernel
    }

    pub fn padding(&self) -> usize {
        self.padding
    }

    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Parameter> {
        self.bias.as_ref()
    }

    pub fn spectral(&self) -> Option<&SpectralNorm> {
        self.spectral.as_ref()
    }

    /// Kernel actually applied in the forward pass.
    pub fn effective_weight(&self) -> PureResult<Tensor> {
        match &self.spectral {
            Some(sn) => sn.normalise(self.weight.value()),
            None => Ok(self.weight.value().clone()),
        }
    }
}

impl Module for Conv2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let weight = self.effective_weight()?;
        input.conv2d(&weight, self.bias.as_ref().map(Parameter::value), self.padding)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let weight = self.effective_weight()?;
        let grads = input.conv2d_backward(&weight, self.padding, grad_output)?;
        let grad_w = match &self.spectral {
            Some(sn) => sn.backward(self.weight.value(), &grads.weight)?,
            None => grads.weight,
        };
        self.weight.accumulate_euclidean(&grad_w)?;
        if let Some(bias) = &mut self.bias {
            bias.accumulate_euclidean(&grads.bias)?;
        }
        Ok(grads.input)
    }
}

fn expect_input_shape(grad: Tensor, input: &Tensor) -> PureResult<Tensor> {
    if grad.shape() != input.shape() {
        return Err(TensorError::ShapeMismatch {
            left: input.shape().to_vec(),
            right: grad.shape().to_vec(),
        });
    }
    Ok(grad)
}

impl Parameterized for Conv2d {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)?;
        if let Some(bias) = &self.bias {
            visitor(bias)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)?;
        if let Some(bias) = &mut self.bias {
            visitor(bias)?;
        }
        Ok(())
    }

    fn refresh_spectral_state(&mut self) -> PureResult<()> {
        if let Some(sn) = &mut self.spectral {
            sn.refresh(self.weight.value())?;
        }
        Ok(())
    }
}

/// Non-overlapping average pooling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AvgPool2d {
    kernel: usize,
}

impl AvgPool2d {
    pub fn new(kernel: usize) -> PureResult<Self> {
        validate_positive(kernel, "avg_pool_kernel")?;
        Ok(Self { kernel })
    }
}

impl Module for AvgPool2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        input.avg_pool2d(self.kernel)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        input.avg_pool2d_backward(self.kernel, grad_output)
    }
}

/// Non-overlapping max pooling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MaxPool2d {
    kernel: usize,
}

impl MaxPool2d {
    pub fn new(kernel: usize) -> PureResult<Self> {
        validate_positive(kernel, "max_pool_kernel")?;
        Ok(Self { kernel })
    }
}

impl Module for MaxPool2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        input.max_pool2d(self.kernel)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        input.max_pool2d_backward(self.kernel, grad_output)
    }
}

/// Nearest-neighbour upsampling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Upsample {
    factor: usize,
}

impl Upsample {
    pub fn new(factor: usize) -> PureResult<Self> {
        validate_positive(factor, "upsample_factor")?;
        Ok(Self { factor })
    }

    pub fn factor(&self) -> usize {
        self.factor
    }
}

impl Module for Upsample {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        input.upsample_nearest2d(self.factor)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        expect_input_shape(grad_output.upsample_nearest2d_backward(self.factor)?, input)
    }
}

stateless_parameters!(AvgPool2d, MaxPool2d, Upsample);

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn conv_preserves_spatial_size_with_same_padding() {
        let mut rng = StdRng::seed_from_u64(0);
        let conv = Conv2d::new("c", 3, 5, 3, 1, true, None, &mut rng).unwrap();
        let input = Tensor::random_normal_with_rng(&[2, 3, 8, 8], 0.0, 1.0, &mut rng).unwrap();
        let out = conv.forward(&input).unwrap();
        assert_eq!(out.shape(), &[2, 5, 8, 8]);
        assert!(out.requires_grad());
        assert_eq!(conv.parameter_count(), 5 * 3 * 9 + 5);
    }

    #[test]
    fn spectral_conv_divides_by_sigma() {
        let mut rng = StdRng::seed_from_u64(1);
        let sn = SpectralNorm::new(4, 1, 1, 1e-8, &mut rng).unwrap();
        let mut conv = Conv2d::new("sn", 2, 4, 1, 0, false, Some(sn), &mut rng).unwrap();
        for _ in 0..200 {
            conv.refresh_spectral_state().unwrap();
        }
        let effective = conv.effective_weight().unwrap();
        let matrix = effective.reshape(&[4, 2]).unwrap();
        let gram = matrix.transpose().unwrap().matmul(&matrix).unwrap().to_vec();
        // Largest eigenvalue of WᵀW for a 2×2 Gram matrix.
        let (a, b, d) = (gram[0], gram[1], gram[3]);
        let top = 0.5 * (a + d) + (0.25 * (a - d).powi(2) + b * b).sqrt();
        assert!((top - 1.0).abs() < 1e-3, "top eigenvalue {top}");
        assert!(conv.bias().is_none());
    }

    #[test]
    fn spectral_conv_backward_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(2);
        let sn = SpectralNorm::new(3, 1, 1, 1e-8, &mut rng).unwrap();
        let mut conv = Conv2d::new("sn", 2, 3, 3, 1, true, Some(sn), &mut rng).unwrap();
        for _ in 0..100 {
            conv.refresh_spectral_state().unwrap();
        }
        let input = Tensor::random_normal_with_rng(&[1, 2, 3, 3], 0.0, 1.0, &mut rng).unwrap();
        let upstream = Tensor::random_normal_with_rng(&[1, 3, 3, 3], 0.0, 1.0, &mut rng).unwrap();
        let grad_in = conv.backward(&input, &upstream).unwrap();
        assert_eq!(grad_in.shape(), input.shape());

        let loss = |layer: &Conv2d| layer.forward(&input).unwrap().mul(&upstream).unwrap().sum_all();
        let analytic = conv.weight().gradient().unwrap().to_vec();
        let h = 1e-2;
        for index in [0, 4, 17, 40, 53] {
            let shifted = |delta: f32| {
                let mut layer = conv.clone();
                let mut values = layer.weight().value().to_vec();
                values[index] += delta;
                let value = Tensor::from_vec(layer.weight().value().shape(), values).unwrap();
                layer.weight.load_value(&value).unwrap();
                loss(&layer)
            };
            let numeric = (shifted(h) - shifted(-h)) / (2.0 * h);
            assert!(
                (analytic[index] - numeric).abs() < 5e-2,
                "weight {index}: {} vs {numeric}",
                analytic[index]
            );
        }
        assert!(conv.bias().unwrap().gradient().is_some());
    }

    #[test]
    fn pool_and_upsample_layers_are_parameter_free() {
        let input = Tensor::full(&[1, 2, 4, 4], 1.0).unwrap();
        let down = AvgPool2d::new(2).unwrap().forward(&input).unwrap();
        assert_eq!(down.shape(), &[1, 2, 2, 2]);
        let up = Upsample::new(2).unwrap().forward(&down).unwrap();
        assert_eq!(up, input);
        assert_eq!(MaxPool2d::new(2).unwrap().parameter_count(), 0);
        assert!(Upsample::new(0).is_err());
    }
}
