// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! One-shot weight initialisation driven by [`ParamRole`].
//!
//! `Weight` tensors follow the configured policy, `EmbeddingWeight` tensors are
//! always drawn from `N(0, 0.02)`, biases and affine parameters keep their
//! construction values. An unrecognised policy token is reported and leaves
//! kernel weights untouched; it is never an error.

use crate::module::{ParamRole, Parameterized};
use rand::Rng;
use serde::Serialize;
use st_tensor::{PureResult, Tensor};
use std::fmt;

const N02_STD: f32 = 0.02;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InitPolicy {
    Orthogonal,
    Normal02,
    XavierUniform,
    /// Token that matched no policy; kept verbatim for reporting.
    Unrecognized(String),
}

impl InitPolicy {
    /// Parses `ortho`, `N02`, `glorot` or `xavier`; anything else is kept as
    /// [`InitPolicy::Unrecognized`].
    pub fn parse(token: &str) -> Self {
        match token {
            "ortho" => InitPolicy::Orthogonal,
            "N02" => InitPolicy::Normal02,
            "glorot" | "xavier" => InitPolicy::XavierUniform,
            other => InitPolicy::Unrecognized(other.to_string()),
        }
    }

    pub fn token(&self) -> &str {
        match self {
            InitPolicy::Orthogonal => "ortho",
            InitPolicy::Normal02 => "N02",
            InitPolicy::XavierUniform => "xavier",
            InitPolicy::Unrecognized(token) => token,
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, InitPolicy::Unrecognized(_))
    }

    fn sample<R: Rng + ?Sized>(&self, shape: &[usize], rng: &mut R) -> PureResult<Option<Tensor>> {
        match self {
            InitPolicy::Orthogonal => Tensor::random_orthogonal_with_rng(shape, 1.0, rng).map(Some),
            InitPolicy::Normal02 => Tensor::random_normal_with_rng(shape, 0.0, N02_STD, rng).map(Some),
            InitPolicy::XavierUniform => {
                let (fan_in, fan_out) = fans(shape);
                let bound = (6.0 / (fan_in + fan_out) as f32).sqrt();
                Tensor::random_uniform_with_rng(shape, -bound, bound, rng).map(Some)
            }
            InitPolicy::Unrecognized(_) => Ok(None),
        }
    }
}

impl fmt::Display for InitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// `(fan_in, fan_out)` for `[out, in, k...]` weights.
fn fans(shape: &[usize]) -> (usize, usize) {
    let receptive: usize = shape.iter().skip(2).product();
    let fan_out = shape.first().copied().unwrap_or(1) * receptive;
    let fan_in = shape.get(1).copied().unwrap_or(1) * receptive;
    (fan_in, fan_out)
}

/// Outcome of an initialisation pass.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InitReport {
    pub policy: String,
    /// Scalars in conv/linear/embedding weights and their biases.
    pub param_count: usize,
    /// Tensors that received fresh values.
    pub initialised: usize,
    /// Kernel weights left at their construction values.
    pub skipped: usize,
}

/// Runs the initialisation pass over every parameter of `module`.
pub fn initialize<M, R>(
    module: &mut M,
    policy: &InitPolicy,
    rng: &mut R,
    network: &str,
) -> PureResult<InitReport>
where
    M: Parameterized + ?Sized,
    R: Rng + ?Sized,
{
    let mut report = InitReport {
        policy: policy.token().to_string(),
        param_count: 0,
        initialised: 0,
        skipped: 0,
    };
    module.visit_parameters_mut(&mut |param| {
        let role = param.role();
        if role.is_init_managed() {
            report.param_count += param.numel();
        }
        let fresh = match role {
            ParamRole::Weight => {
                let sampled = policy.sample(param.value().shape(), &mut *rng)?;
                if sampled.is_none() {
                    tracing::warn!(
                        network,
                        parameter = param.name(),
                        policy = policy.token(),
                        "init style not recognized; keeping default weights"
                    );
                    report.skipped += 1;
                }
                sampled
            }
            ParamRole::EmbeddingWeight => Some(Tensor::random_normal_with_rng(
                param.value().shape(),
                0.0,
                N02_STD,
                &mut *rng,
            )?),
            ParamRole::Bias | ParamRole::Affine => None,
        };
        if let Some(value) = fresh {
            param.load_value(&value)?;
            report.initialised += 1;
        }
        Ok(())
    })?;
    tracing::info!(
        network,
        param_count = report.param_count,
        policy = %report.policy,
        "param count for initialized parameters"
    );
    Ok(report)
}
