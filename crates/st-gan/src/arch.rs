// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Per-resolution stage tables for the generator and discriminator.
//!
//! Both networks are a chain of residual stages whose channel widths are
//! fixed multiples of a base width `ch`. The tables below are the only place
//! where those multiples live; everything else derives from the
//! [`LayoutDescriptor`] they produce.

use crate::error::ConfigurationError;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

pub const SUPPORTED_RESOLUTIONS: [usize; 4] = [32, 64, 128, 256];

/// Spatial size the generator table starts from.
pub const TABLE_BOTTOM_WIDTH: usize = 4;

/// Channel count of the images fed to the discriminator.
pub const IMAGE_CHANNELS: usize = 3;

/// One resolution-level unit of a network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct StageSpec {
    pub in_channels: usize,
    pub out_channels: usize,
    /// Upsampling for the generator, downsampling for the discriminator.
    pub spatial_resize: bool,
    pub resolution_after: usize,
    pub has_attention: bool,
}

/// Resolutions that receive a self-attention block, parsed from strings such
/// as `"64_128"`. The empty string and `"0"` tokens select nothing; an empty
/// token inside a non-empty string is malformed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AttentionSet(BTreeSet<usize>);

impl AttentionSet {
    pub fn parse(spec: &str) -> Result<Self, ConfigurationError> {
        let mut set = BTreeSet::new();
        if spec.trim().is_empty() {
            return Ok(Self(set));
        }
        for token in spec.split('_') {
            let token = token.trim();
            let value: usize =
                token
                    .parse()
                    .map_err(|_| ConfigurationError::MalformedAttention {
                        spec: spec.to_string(),
                        token: token.to_string(),
                    })?;
            if value != 0 {
                set.insert(value);
            }
        }
        Ok(Self(set))
    }

    pub fn contains(&self, resolution: usize) -> bool {
        self.0.contains(&resolution)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().copied()
    }
}

impl FromStr for AttentionSet {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for AttentionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tokens: Vec<String> = self.0.iter().map(|r| r.to_string()).collect();
        f.write_str(&tokens.join("_"))
    }
}

/// Ordered stage list for one network at one target resolution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LayoutDescriptor {
    resolution: usize,
    stages: Vec<StageSpec>,
}

impl LayoutDescriptor {
    pub fn resolution(&self) -> usize {
        self.resolution
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, StageSpec> {
        self.stages.iter()
    }

    /// Resolutions after the stages that carry attention, in stage order.
    pub fn attention_resolutions(&self) -> Vec<usize> {
        self.stages
            .iter()
            .filter(|stage| stage.has_attention)
            .map(|stage| stage.resolution_after)
            .collect()
    }

    pub fn final_channels(&self) -> usize {
        self.stages.last().map_or(0, |stage| stage.out_channels)
    }

    /// Rejects attention stages narrower than `min_channels`.
    pub fn check_attention_width(&self, min_channels: usize) -> Result<(), ConfigurationError> {
        let narrow = self
            .stages
            .iter()
            .enumerate()
            .find(|(_, stage)| stage.has_attention && stage.out_channels < min_channels);
        match narrow {
            Some((index, stage)) => Err(ConfigurationError::invalid(
                "attention",
                format!(
                    "stage {index} at resolution {} has {} channels; attention needs at least {min_channels}",
                    stage.resolution_after, stage.out_channels
                ),
            )),
            None => Ok(()),
        }
    }
}

impl<'a> IntoIterator for &'a LayoutDescriptor {
    type Item = &'a StageSpec;
    type IntoIter = std::slice::Iter<'a, StageSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.stages.iter()
    }
}

fn validate_width(ch: usize) -> Result<(), ConfigurationError> {
    if ch == 0 {
        return Err(ConfigurationError::invalid("ch", "width multiplier must be positive"));
    }
    Ok(())
}

/// `(in, out)` multipliers of the generator stages.
fn generator_table(resolution: usize) -> Option<(&'static [usize], &'static [usize])> {
    match resolution {
        256 => Some((&[16, 16, 8, 8, 4, 2][..], &[16, 8, 8, 4, 2, 1][..])),
        128 => Some((&[16, 16, 8, 4, 2][..], &[16, 8, 4, 2, 1][..])),
        64 => Some((&[16, 16, 8, 4][..], &[16, 8, 4, 2][..])),
        32 => Some((&[4, 4, 4][..], &[4, 4, 4][..])),
        _ => None,
    }
}

/// Stage columns of one discriminator table.
struct DiscriminatorTable {
    /// The first input is the image itself, so its multiplier is unused.
    ins: &'static [usize],
    outs: &'static [usize],
    downsample: &'static [bool],
    /// Resolution labels attention placement is keyed on. They follow the
    /// spatial size except at 32, where every stage is labelled 16.
    resolutions: &'static [usize],
}

fn discriminator_table(resolution: usize) -> Option<DiscriminatorTable> {
    let table = match resolution {
        256 => DiscriminatorTable {
            ins: &[0, 1, 2, 4, 8, 8, 16],
            outs: &[1, 2, 4, 8, 8, 16, 16],
            downsample: &[true, true, true, true, true, true, false],
            resolutions: &[128, 64, 32, 16, 8, 4, 4],
        },
        128 => DiscriminatorTable {
            ins: &[0, 1, 2, 4, 8, 16],
            outs: &[1, 2, 4, 8, 16, 16],
            downsample: &[true, true, true, true, true, false],
            resolutions: &[64, 32, 16, 8, 4, 4],
        },
        64 => DiscriminatorTable {
            ins: &[0, 1, 2, 4, 8],
            outs: &[1, 2, 4, 8, 16],
            downsample: &[true, true, true, true, false],
            resolutions: &[32, 16, 8, 4, 4],
        },
        32 => DiscriminatorTable {
            ins: &[0, 4, 4, 4],
            outs: &[4, 4, 4, 4],
            downsample: &[true, true, false, false],
            resolutions: &[16, 16, 16, 16],
        },
        _ => return None,
    };
    Some(table)
}

/// Generator stages: every stage upsamples ×2 starting from the table's bottom
/// width of 4.
pub fn generator_layout(
    ch: usize,
    attention: &AttentionSet,
    resolution: usize,
) -> Result<LayoutDescriptor, ConfigurationError> {
    validate_width(ch)?;
    let (ins, outs) = generator_table(resolution)
        .ok_or(ConfigurationError::UnsupportedResolution { resolution })?;
    let mut size = TABLE_BOTTOM_WIDTH;
    let stages = ins
        .iter()
        .zip(outs)
        .map(|(&i, &o)| {
            size *= 2;
            StageSpec {
                in_channels: ch * i,
                out_channels: ch * o,
                spatial_resize: true,
                resolution_after: size,
                has_attention: attention.contains(size),
            }
        })
        .collect();
    Ok(LayoutDescriptor { resolution, stages })
}

/// Discriminator stages: the first consumes RGB images, resize stages halve
/// the spatial size and tail stages keep it. `resolution_after` carries the
/// table label, which is what attention placement matches against.
pub fn discriminator_layout(
    ch: usize,
    attention: &AttentionSet,
    resolution: usize,
) -> Result<LayoutDescriptor, ConfigurationError> {
    validate_width(ch)?;
    let table = discriminator_table(resolution)
        .ok_or(ConfigurationError::UnsupportedResolution { resolution })?;
    let stages = table
        .ins
        .iter()
        .zip(table.outs)
        .zip(table.downsample)
        .zip(table.resolutions)
        .enumerate()
        .map(|(index, (((&i, &o), &down), &label))| StageSpec {
            in_channels: if index == 0 { IMAGE_CHANNELS } else { ch * i },
            out_channels: ch * o,
            spatial_resize: down,
            resolution_after: label,
            has_attention: attention.contains(label),
        })
        .collect();
    Ok(LayoutDescriptor { resolution, stages })
}
