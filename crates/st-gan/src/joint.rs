// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Joint generator/discriminator pass (`G_D`).
//!
//! By default real and fake batches are fused into one discriminator call and
//! split back at the fake batch size; `split_d` scores them separately.

use crate::config::GanConfig;
use crate::discriminator::Discriminator;
use crate::error::GanResult;
use crate::generator::Generator;
use st_nn::{GradMode, PureResult, Tensor, TensorError};

/// Inputs of one joint pass. Real images and labels are optional.
#[derive(Clone, Copy, Debug)]
pub struct GdInputs<'a> {
    pub z: &'a Tensor,
    pub gy: &'a [usize],
    pub x: Option<&'a Tensor>,
    pub dy: Option<&'a [usize]>,
}

impl<'a> GdInputs<'a> {
    pub fn fake(z: &'a Tensor, gy: &'a [usize]) -> Self {
        Self {
            z,
            gy,
            x: None,
            dy: None,
        }
    }

    pub fn with_real(mut self, x: &'a Tensor, dy: &'a [usize]) -> Self {
        self.x = Some(x);
        self.dy = Some(dy);
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GdFlags {
    /// Track gradients through the generator call.
    pub train_g: bool,
    /// Also return the generated images when no real batch is scored.
    pub return_g_z: bool,
    /// Score fake and real batches in two discriminator calls.
    pub split_d: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum GdOutput {
    Fake(Tensor),
    FakeWithImages { fake: Tensor, images: Tensor },
    FakeReal { fake: Tensor, real: Tensor },
}

impl GdOutput {
    pub fn fake(&self) -> &Tensor {
        match self {
            GdOutput::Fake(fake)
            | GdOutput::FakeWithImages { fake, .. }
            | GdOutput::FakeReal { fake, .. } => fake,
        }
    }

    pub fn real(&self) -> Option<&Tensor> {
        match self {
            GdOutput::FakeReal { real, .. } => Some(real),
            _ => None,
        }
    }

    pub fn images(&self) -> Option<&Tensor> {
        match self {
            GdOutput::FakeWithImages { images, .. } => Some(images),
            _ => None,
        }
    }
}

/// Owns both networks of an adversarial pair.
#[derive(Clone, Debug)]
pub struct GanPair {
    generator: Generator,
    discriminator: Discriminator,
}

impl GanPair {
    pub fn new(generator: Generator, discriminator: Discriminator) -> Self {
        Self {
            generator,
            discriminator,
        }
    }

    pub fn from_config(config: &GanConfig) -> GanResult<Self> {
        Ok(Self::new(
            Generator::new(&config.generator)?,
            Discriminator::new(&config.discriminator)?,
        ))
    }

    pub fn generator(&self) -> &Generator {
        &self.generator
    }

    pub fn discriminator(&self) -> &Discriminator {
        &self.discriminator
    }

    pub fn generator_mut(&mut self) -> &mut Generator {
        &mut self.generator
    }

    pub fn discriminator_mut(&mut self) -> &mut Discriminator {
        &mut self.discriminator
    }

    pub fn into_parts(self) -> (Generator, Discriminator) {
        (self.generator, self.discriminator)
    }

    pub fn forward(&self, inputs: GdInputs<'_>, flags: GdFlags) -> PureResult<GdOutput> {
        let y = self.generator.shared(inputs.gy)?;
        let g_z = self
            .generator
            .forward(inputs.z, &y, GradMode::from(flags.train_g))?;
        tracing::debug!(
            split_d = flags.split_d,
            real = inputs.x.is_some(),
            train_g = flags.train_g,
            "G_D forward"
        );

        if flags.split_d {
            let fake = self.discriminator.forward(&g_z, Some(inputs.gy))?;
            return Ok(match inputs.x {
                Some(x) => GdOutput::FakeReal {
                    fake,
                    real: self.discriminator.forward(x, inputs.dy)?,
                },
                None => Self::fake_only(fake, g_z, flags),
            });
        }

        let Some(x) = inputs.x else {
            if inputs.dy.is_some() {
                return Err(TensorError::InvalidValue {
                    label: "real_labels_without_images",
                });
            }
            let fake = self.discriminator.forward(&g_z, Some(inputs.gy))?;
            return Ok(Self::fake_only(fake, g_z, flags));
        };
        let dy = inputs.dy.ok_or(TensorError::InvalidValue {
            label: "real_images_without_labels",
        })?;
        let fake_batch = g_z.shape()[0];
        let real_batch = x.shape()[0];
        let fused = Tensor::concat(&[&g_z, x], 0)?;
        let labels: Vec<usize> = inputs.gy.iter().chain(dy).copied().collect();
        let scores = self.discriminator.forward(&fused, Some(&labels))?;
        let mut parts = scores.split(&[fake_batch, real_batch], 0)?.into_iter();
        match (parts.next(), parts.next()) {
            (Some(fake), Some(real)) => Ok(GdOutput::FakeReal { fake, real }),
            _ => Err(TensorError::EmptyInput("fused_scores")),
        }
    }

    fn fake_only(fake: Tensor, images: Tensor, flags: GdFlags) -> GdOutput {
        if flags.return_g_z {
            GdOutput::FakeWithImages { fake, images }
        } else {
            GdOutput::Fake(fake)
        }
    }
}
