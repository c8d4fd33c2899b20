// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Process-wide seeding policy for model construction and sampling.
//!
//! Deterministic mode is switched on with `SPIRAL_DETERMINISTIC=1`; the base
//! seed comes from `SPIRAL_DETERMINISTIC_SEED` (default 42). Component seeds are
//! derived by hashing a label together with the base seed so that, for
//! instance, the generator and discriminator of a pair draw from independent
//! but reproducible streams.

use rand::{rngs::StdRng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

pub const ENABLE_VAR: &str = "SPIRAL_DETERMINISTIC";
pub const SEED_VAR: &str = "SPIRAL_DETERMINISTIC_SEED";
const DEFAULT_SEED: u64 = 42;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeterminismConfig {
    /// Whether deterministic execution is enabled globally.
    pub enabled: bool,
    /// Base seed used to derive per-component seeds.
    pub base_seed: u64,
}

impl Default for DeterminismConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_seed: DEFAULT_SEED,
        }
    }
}

fn parse_flag(raw: &str) -> bool {
    !matches!(
        raw.trim(),
        "" | "0" | "false" | "False" | "FALSE" | "off" | "OFF"
    )
}

impl DeterminismConfig {
    /// Deterministic configuration pinned to `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            enabled: true,
            base_seed: seed,
        }
    }

    /// Builds a configuration snapshot from environment variables.
    pub fn from_env() -> Self {
        let enabled = std::env::var(ENABLE_VAR)
            .map(|v| parse_flag(&v))
            .unwrap_or(false);
        let base_seed = std::env::var(SEED_VAR)
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_SEED);
        Self { enabled, base_seed }
    }

    /// Derives a deterministic seed for a given component label.
    pub fn seed_for<L: Hash>(&self, label: L) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.base_seed.hash(&mut hasher);
        label.hash(&mut hasher);
        hasher.finish()
    }

    /// RNG for `label`, or host entropy when determinism is off.
    pub fn rng_for(&self, label: &str) -> StdRng {
        if self.enabled {
            StdRng::seed_from_u64(self.seed_for(label))
        } else {
            StdRng::from_entropy()
        }
    }
}

static CONFIG: OnceLock<DeterminismConfig> = OnceLock::new();

/// Returns the lazily initialised process configuration.
pub fn config() -> &'static DeterminismConfig {
    CONFIG.get_or_init(DeterminismConfig::from_env)
}

/// Installs `cfg` unless a configuration was already resolved; returns the
/// configuration that is in effect.
pub fn configure(cfg: DeterminismConfig) -> &'static DeterminismConfig {
    CONFIG.get_or_init(|| cfg)
}

pub fn rng_from_label(label: &str) -> StdRng {
    config().rng_for(label)
}

/// Returns a RNG seeded from an optional explicit seed, respecting the
/// process configuration when the seed is not provided.
pub fn rng_from_optional(seed: Option<u64>, label: &str) -> StdRng {
    match seed {
        Some(value) => StdRng::seed_from_u64(value),
        None => rng_from_label(label),
    }
}

/// Mixes an explicit seed with a label, for callers that own several streams.
pub fn derive_seed(seed: u64, label: &str) -> u64 {
    DeterminismConfig::with_seed(seed).seed_for(label)
}
