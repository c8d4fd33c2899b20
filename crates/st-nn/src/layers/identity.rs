// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::stateless_parameters;
use crate::module::Module;
use st_tensor::{PureResult, Tensor};

/// Stateless identity layer that forwards its input unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct Identity;

impl Identity {
    /// Creates a new identity layer.
    pub fn new() -> Self {
        Self
    }
}

impl Module for Identity {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        Ok(input.clone())
    }

    fn backward(&mut self, _input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        Ok(grad_output.clone())
    }
}

stateless_parameters!(Identity);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Parameterized;

    #[test]
    fn identity_forward_is_noop() {
        let layer = Identity::new();
        let input = Tensor::from_vec(&[2, 3], vec![0.5, -1.0, 2.0, 3.5, 0.0, -0.25])
            .unwrap()
            .with_requires_grad(true);
        let output = layer.forward(&input).unwrap();
        assert_eq!(output, input);
        assert_eq!(layer.parameter_count(), 0);
    }
}
