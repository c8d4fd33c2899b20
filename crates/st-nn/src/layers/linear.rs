// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::spectral::SpectralNorm;
use super::validate_positive;
use crate::module::{Module, ParamRole, Parameter, Parameterized};
use rand::Rng;
use st_tensor::{PureResult, Tensor, TensorError};

/// Fully-connected layer. The weight is stored `[output_dim, input_dim]`.
#[derive(Clone, Debug)]
pub struct Linear {
    weight: Parameter,
    bias: Option<Parameter>,
    spectral: Option<SpectralNorm>,
}

impl Linear {
    pub fn new<R: Rng + ?Sized>(
        name: impl Into<String>,
        input_dim: usize,
        output_dim: usize,
        bias: bool,
        spectral: Option<SpectralNorm>,
        rng: &mut R,
    ) -> PureResult<Self> {
        validate_positive(input_dim, "linear_input_dim")?;
        validate_positive(output_dim, "linear_output_dim")?;
        let name = name.into();
        let bound = 1.0 / (input_dim as f32).sqrt();
        let weight = Tensor::random_uniform_with_rng(&[output_dim, input_dim], -bound, bound, rng)?;
        let bias = if bias {
            let value = Tensor::random_uniform_with_rng(&[output_dim], -bound, bound, rng)?;
            Some(Parameter::new(format!("{name}::bias"), value, ParamRole::Bias))
        } else {
            None
        };
        Ok(Self {
            weight: Parameter::new(format!("{name}::weight"), weight, ParamRole::Weight),
            bias,
            spectral,
        })
    }

    /// Returns a reference to the weight parameter.
    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Parameter> {
        self.bias.as_ref()
    }

    pub fn input_dim(&self) -> usize {
        self.weight.value().shape()[1]
    }

    pub fn output_dim(&self) -> usize {
        self.weight.value().shape()[0]
    }

    pub fn effective_weight(&self) -> PureResult<Tensor> {
        match &self.spectral {
            Some(sn) => sn.normalise(self.weight.value()),
            None => Ok(self.weight.value().clone()),
        }
    }

    fn raw_weight_gradient(&self, grad_effective: Tensor) -> PureResult<Tensor> {
        match &self.spectral {
            Some(sn) => sn.backward(self.weight.value(), &grad_effective),
            None => Ok(grad_effective),
        }
    }
}

impl Module for Linear {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let (_, features) = input.dims2()?;
        if features != self.input_dim() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape().to_vec(),
                right: self.weight.value().shape().to_vec(),
            });
        }
        let out = input.matmul(&self.effective_weight()?.transpose()?)?;
        match &self.bias {
            Some(bias) => out.add_broadcast(bias.value()),
            None => Ok(out),
        }
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let (rows, _) = input.dims2()?;
        let (grad_rows, outputs) = grad_output.dims2()?;
        if rows != grad_rows || outputs != self.output_dim() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape().to_vec(),
                right: grad_output.shape().to_vec(),
            });
        }
        let weight = self.effective_weight()?;
        let grad_w = self.raw_weight_gradient(grad_output.transpose()?.matmul(input)?)?;
        self.weight.accumulate_euclidean(&grad_w)?;
        if let Some(bias) = &mut self.bias {
            bias.accumulate_euclidean(&grad_output.sum_axis(0, false)?)?;
        }
        grad_output.matmul(&weight)
    }
}

impl Parameterized for Linear {
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
