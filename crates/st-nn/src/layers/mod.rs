// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use st_tensor::{PureResult, TensorError};

pub(crate) fn validate_positive(value: usize, label: &'static str) -> PureResult<()> {
    if value == 0 {
        return Err(TensorError::InvalidValue { label });
    }
    Ok(())
}

/// Implements [`crate::Parameterized`] for layers without parameters.
macro_rules! stateless_parameters {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $crate::module::Parameterized for $ty {
                fn visit_parameters(
                    &self,
                    _visitor: &mut dyn FnMut(&$crate::module::Parameter) -> st_tensor::PureResult<()>,
                ) -> st_tensor::PureResult<()> {
                    Ok(())
                }

                fn visit_parameters_mut(
                    &mut self,
                    _visitor: &mut dyn FnMut(&mut $crate::module::Parameter) -> st_tensor::PureResult<()>,
                ) -> st_tensor::PureResult<()> {
                    Ok(())
                }
            }
        )+
    };
}
pub(crate) use stateless_parameters;

pub mod activation;
pub mod attention;
pub mod conv;
pub mod embedding;
pub mod factory;
pub mod identity;
pub mod linear;
pub mod normalization;
pub mod residual;
pub mod spectral;

pub use activation::Activation;
pub use attention::Attention;
pub use conv::{AvgPool2d, Conv2d, MaxPool2d, Upsample};
pub use embedding::Embedding;
pub use factory::{LayerFactory, Parameterization};
pub use identity::Identity;
pub use linear::Linear;
pub use normalization::{BatchNorm2d, ConditionProjection, ConditionalBatchNorm2d, NormStyle};
pub use residual::GBlock;
pub use spectral::SpectralNorm;
