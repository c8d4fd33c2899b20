// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Class-conditional GAN architectures on top of `st-nn`.
//!
//! [`arch`] turns a target resolution and width multiplier into a stage
//! layout, [`Generator`] and [`Discriminator`] assemble residual networks
//! from it, and [`GanPair`] runs both in the fused or split `G_D` regime.
//!
//! ```no_run
//! use st_gan::{GanConfig, GanPair, GdFlags, GdInputs};
//! use st_tensor::Tensor;
//!
//! let pair = GanPair::from_config(&GanConfig::default())?;
//! let z = Tensor::random_normal(&[4, pair.generator().dim_z()], 0.0, 1.0, Some(0))?;
//! let scores = pair.forward(GdInputs::fake(&z, &[1, 2, 3, 4]), GdFlags::default())?;
//! println!("{:?}", scores.fake().shape());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod arch;
pub mod config;
pub mod discriminator;
pub mod error;
pub mod generator;
pub mod joint;
pub mod report;

pub use arch::{
    discriminator_layout, generator_layout, AttentionSet, LayoutDescriptor, StageSpec,
    SUPPORTED_RESOLUTIONS,
};
pub use config::{DiscriminatorConfig, GanConfig, GeneratorConfig, OptimizerSettings, WeightParam};
pub use discriminator::{DBlock, Discriminator};
pub use error::{ConfigurationError, GanError, GanResult};
pub use generator::{Generator, LatentGradients, LatentPartition, Stage};
pub use joint::{GanPair, GdFlags, GdInputs, GdOutput};
pub use report::BuildReport;
