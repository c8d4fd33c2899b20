// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::arch::LayoutDescriptor;
use serde::Serialize;
use st_nn::InitReport;

/// Construction diagnostics returned alongside a built network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    pub network: &'static str,
    pub stages: usize,
    pub attention_resolutions: Vec<usize>,
    pub init: InitReport,
}

impl BuildReport {
    pub(crate) fn new(network: &'static str, layout: &LayoutDescriptor, init: InitReport) -> Self {
        Self {
            network,
            stages: layout.len(),
            attention_resolutions: layout.attention_resolutions(),
            init,
        }
    }

    pub fn param_count(&self) -> usize {
        self.init.param_count
    }
}
