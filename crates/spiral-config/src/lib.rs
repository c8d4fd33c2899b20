// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Shared runtime configuration: seeding policy and tracing setup.

pub mod determinism;
pub mod tracing;

pub use determinism::{rng_from_optional, DeterminismConfig};
pub use tracing::{init_tracing, InitError};
