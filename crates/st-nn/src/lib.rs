// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Neural building blocks for SpiralTorch's GAN stack.
//!
//! Layers expose their weights through the visitor-based [`Parameterized`]
//! trait so that initialisation, state dicts and spectral refreshes all walk
//! the same tree. Every weight-carrying layer is produced by a
//! [`LayerFactory`], which decides between spectral and plain weights.

pub mod init;
pub mod layers;
pub mod module;

pub use init::{initialize, InitPolicy, InitReport};
pub use layers::{
    Activation, Attention, AvgPool2d, BatchNorm2d, ConditionProjection, ConditionalBatchNorm2d,
    Conv2d, Embedding, GBlock, Identity, LayerFactory, Linear, MaxPool2d, NormStyle,
    Parameterization, SpectralNorm, Upsample,
};
pub use module::{ConditionalModule, Module, ParamRole, Parameter, Parameterized};

pub use st_tensor::{GradMode, PureResult, Tensor, TensorError};
