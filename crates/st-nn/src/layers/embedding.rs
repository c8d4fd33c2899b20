// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::spectral::SpectralNorm;
use super::validate_positive;
use crate::module::{Module, ParamRole, Parameter, Parameterized};
use rand::Rng;
use st_tensor::{PureResult, Tensor, TensorError};

/// Class-embedding table shaped `[num_embeddings, embed_dim]`.
///
/// Lookups go through a one-hot product so that the result inherits the
/// table's gradient tracking; a dense `[batch, num_embeddings]` input (for
/// example a one-hot class matrix) is projected the same way by
/// [`Module::forward`].
#[derive(Clone, Debug)]
pub struct Embedding {
    weight: Parameter,
    num_embeddings: usize,
    embed_dim: usize,
    spectral: Option<SpectralNorm>,
}

impl Embedding {
    /// Rows start as standard normal draws.
    pub fn new<R: Rng + ?Sized>(
        name: impl Into<String>,
        num_embeddings: usize,
        embed_dim: usize,
        spectral: Option<SpectralNorm>,
        rng: &mut R,
    ) -> PureResult<Self> {
        validate_positive(num_embeddings, "embedding_rows")?;
        validate_positive(embed_dim, "embedding_dim")?;
        let name = name.into();
        let weight = Tensor::random_normal_with_rng(&[num_embeddings, embed_dim], 0.0, 1.0, rng)?;
        Ok(Self {
            weight: Parameter::new(format!("{name}::weight"), weight, ParamRole::EmbeddingWeight),
            num_embeddings,
            embed_dim,
            spectral,
        })
    }

    pub fn num_embeddings(&self) -> usize {
        self.num_embeddings
    }

    pub fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    pub fn effective_weight(&self) -> PureResult<Tensor> {
        match &self.spectral {
            Some(sn) => sn.normalise(self.weight.value()),
            None => Ok(self.weight.value().clone()),
        }
    }

    /// Rows for `labels`, shaped `[labels.len(), embed_dim]`.
    pub fn lookup(&self, labels: &[usize]) -> PureResult<Tensor> {
        let one_hot = Tensor::one_hot(labels, self.num_embeddings)?;
        self.forward(&one_hot)
    }

    /// Accumulates the gradient of rows fetched by [`Embedding::lookup`].
    pub fn lookup_backward(&mut self, labels: &[usize], grad_output: &Tensor) -> PureResult<()> {
        let one_hot = Tensor::one_hot(labels, self.num_embeddings)?;
        self.backward(&one_hot, grad_output).map(|_| ())
    }
}

impl Module for Embedding {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        input.matmul(&self.effective_weight()?)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let (rows, _) = input.dims2()?;
        let (grad_rows, dim) = grad_output.dims2()?;
        if rows != grad_rows || dim != self.embed_dim {
            return Err(TensorError::ShapeMismatch {
                left: input.shape().to_vec(),
                right: grad_output.shape().to_vec(),
            });
        }
        let weight = self.effective_weight()?;
        let grad_effective = input.transpose()?.matmul(grad_output)?;
        let grad_w = match &self.spectral {
            Some(sn) => sn.backward(self.weight.value(), &grad_effective)?,
            None => grad_effective,
        };
        self.weight.accumulate_euclidean(&grad_w)?;
        grad_output.matmul(&weight.transpose()?)
    }
}

impl Parameterized for Embedding {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)
    }

    fn refresh_spectral_state(&mut self) -> PureResult<()> {
        if let Some(sn) = &mut self.spectral {
            sn.refresh(self.weight.value())?;
        }
        Ok(())
    }
}
