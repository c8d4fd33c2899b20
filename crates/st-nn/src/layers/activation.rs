// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::stateless_parameters;
use crate::module::Module;
use serde::{Deserialize, Serialize};
use st_tensor::{PureResult, Tensor, TensorError};
use std::fmt;
use std::str::FromStr;

const LEAKY_SLOPE: f32 = 0.2;

/// Pointwise nonlinearity shared by the residual blocks and output heads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    #[serde(alias = "ir", alias = "inplace_relu")]
    Relu,
    /// Leaky ReLU with slope 0.2.
    #[serde(alias = "lrelu")]
    LeakyRelu,
}

impl Activation {
    pub fn apply(self, input: &Tensor) -> Tensor {
        match self {
            Activation::Relu => input.relu(),
            Activation::LeakyRelu => input.leaky_relu(LEAKY_SLOPE),
        }
    }

    /// Gradient through the nonlinearity at `input`.
    pub fn apply_backward(self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let slope = match self {
            Activation::Relu => 0.0,
            Activation::LeakyRelu => LEAKY_SLOPE,
        };
        grad_output.mul(&input.map(|v| if v > 0.0 { 1.0 } else { slope }))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Activation::Relu => "relu",
            Activation::LeakyRelu => "leaky_relu",
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Activation {
    type Err = TensorError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        match token.trim().to_ascii_lowercase().as_str() {
            "relu" | "ir" | "inplace_relu" => Ok(Activation::Relu),
            "leaky_relu" | "lrelu" => Ok(Activation::LeakyRelu),
            _ => Err(TensorError::InvalidValue { label: "activation" }),
        }
    }
}

impl Module for Activation {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        Ok(self.apply(input))
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        self.apply_backward(input, grad_output)
    }
}

stateless_parameters!(Activation);
