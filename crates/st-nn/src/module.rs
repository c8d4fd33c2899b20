// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use st_tensor::{PureResult, Tensor, TensorError};
use std::collections::HashMap;

/// Role a parameter plays inside its owning layer.
///
/// Roles are fixed when the layer is constructed and decide how the
/// initialisation pass treats the tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ParamRole {
    /// Convolution or dense kernel.
    Weight,
    /// Additive bias of a convolution or dense layer.
    Bias,
    /// Rows of a class-embedding table.
    EmbeddingWeight,
    /// Learned gain/offset/scalar owned by normalisation or attention layers.
    Affine,
}

impl ParamRole {
    /// Whether the parameter belongs to a layer managed by the init pass
    /// (convolution, dense or embedding).
    pub fn is_init_managed(self) -> bool {
        !matches!(self, ParamRole::Affine)
    }
}

/// Trainable tensor with a stable, module-qualified name.
#[derive(Clone, Debug, PartialEq)]
pub struct Parameter {
    name: String,
    value: Tensor,
    role: ParamRole,
    gradient: Option<Tensor>,
}

impl Parameter {
    /// Creates a new trainable parameter; the value starts tracking gradients.
    pub fn new(name: impl Into<String>, value: Tensor, role: ParamRole) -> Self {
        Self {
            name: name.into(),
            value: value.with_requires_grad(true),
            role,
            gradient: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the owning module (everything before the last `::`).
    pub fn owner(&self) -> &str {
        self.name
            .rsplit_once("::")
            .map(|(owner, _)| owner)
            .unwrap_or("")
    }

    pub fn role(&self) -> ParamRole {
        self.role
    }

    pub fn value(&self) -> &Tensor {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut Tensor {
        &mut self.value
    }

    /// Number of scalar elements.
    pub fn numel(&self) -> usize {
        self.value.len()
    }

    pub fn set_requires_grad(&mut self, flag: bool) {
        self.value.set_requires_grad(flag);
    }

    /// Gradient accumulated by backward passes since the last reset. `None`
    /// until the first accumulation.
    pub fn gradient(&self) -> Option<&Tensor> {
        self.gradient.as_ref()
    }

    /// Adds `update` to the gradient buffer. Frozen parameters (tracking
    /// disabled) ignore the update.
    pub fn accumulate_euclidean(&mut self, update: &Tensor) -> PureResult<()> {
        if update.shape() != self.value.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.value.shape().to_vec(),
                right: update.shape().to_vec(),
            });
        }
        if !self.value.requires_grad() {
            return Ok(());
        }
        self.gradient = Some(match self.gradient.take() {
            Some(existing) => existing.add(update)?.detach(),
            None => update.detach(),
        });
        Ok(())
    }

    /// Zeroes the gradient buffer, keeping its allocation.
    pub fn zero_gradient(&mut self) {
        if let Some(grad) = self.gradient.as_mut() {
            grad.data_mut().fill(0.0);
        }
    }

    /// Replaces the stored value, keeping shape and tracking flag.
    pub fn load_value(&mut self, value: &Tensor) -> PureResult<()> {
        if value.shape() != self.value.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.value.shape().to_vec(),
                right: value.shape().to_vec(),
            });
        }
        let tracking = self.value.requires_grad();
        self.value = value.clone().with_requires_grad(tracking);
        Ok(())
    }
}

/// Anything that owns parameters.
pub trait Parameterized {
    /// Visits immutable parameters.
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Visits mutable parameters.
    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Persists refined spectral-norm estimates. Layers without spectral
    /// state keep the default no-op.
    fn refresh_spectral_state(&mut self) -> PureResult<()> {
        Ok(())
    }

    /// Total scalar count across every parameter.
    fn parameter_count(&self) -> usize {
        let mut total = 0usize;
        let _ = self.visit_parameters(&mut |param| {
            total += param.numel();
            Ok(())
        });
        total
    }

    /// Clears the gradient buffers of every parameter.
    fn zero_accumulators(&mut self) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            param.zero_gradient();
            Ok(())
        })
    }

    /// Toggles gradient tracking on every parameter.
    fn set_requires_grad(&mut self, flag: bool) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            param.set_requires_grad(flag);
            Ok(())
        })
    }

    /// Captures a copy of every parameter tensor keyed by its canonical name.
    fn state_dict(&self) -> PureResult<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        self.visit_parameters(&mut |param| {
            state.insert(param.name().to_string(), param.value().clone());
            Ok(())
        })?;
        Ok(state)
    }

    /// Restores parameters from a state dictionary produced by [`Parameterized::state_dict`].
    fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            let Some(value) = state.get(param.name()) else {
                return Err(TensorError::MissingParameter {
                    name: param.name().to_string(),
                });
            };
            param.load_value(value)
        })
    }
}

/// Unconditioned tensor transform.
pub trait Module: Parameterized {
    /// Runs a forward pass.
    fn forward(&self, input: &Tensor) -> PureResult<Tensor>;

    /// Propagates a gradient backwards. Implementations recompute what they
    /// need from `input`, accumulate into their parameters and return the
    /// gradient with respect to `input`.
    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor>;
}

/// Tensor transform that also consumes a dense `[batch, cond_dim]` conditioning vector.
pub trait ConditionalModule: Parameterized {
    fn forward_conditioned(&self, input: &Tensor, condition: &Tensor) -> PureResult<Tensor>;

    /// Like [`Module::backward`]; returns the gradients with respect to
    /// `input` and `condition`.
    fn backward_conditioned(
        &mut self,
        input: &Tensor,
        condition: &Tensor,
        grad_output: &Tensor,
    ) -> PureResult<(Tensor, Tensor)>;
}

impl<T: Parameterized + ?Sized> Parameterized for Box<T> {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        (**self).visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        (**self).visit_parameters_mut(visitor)
    }

    fn refresh_spectral_state(&mut self) -> PureResult<()> {
        (**self).refresh_spectral_state()
    }
}

impl<T: Parameterized> Parameterized for Option<T> {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        match self {
            Some(inner) => inner.visit_parameters(visitor),
            None => Ok(()),
        }
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        match self {
            Some(inner) => inner.visit_parameters_mut(visitor),
            None => Ok(()),
        }
    }

    fn refresh_spectral_state(&mut self) -> PureResult<()> {
        match self {
            Some(inner) => inner.refresh_spectral_state(),
            None => Ok(()),
        }
    }
}
