// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use st_tensor::TensorError;
use std::path::PathBuf;

/// Structurally invalid construction arguments. Always fatal: no partially
/// built network is handed out.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("unsupported resolution {resolution}; expected one of 32, 64, 128, 256")]
    UnsupportedResolution { resolution: usize },
    #[error("malformed attention token {token:?} in {spec:?}")]
    MalformedAttention { spec: String, token: String },
    #[error("invalid argument `{name}`: {reason}")]
    InvalidArgument { name: &'static str, reason: String },
}

impl ConfigurationError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        ConfigurationError::InvalidArgument {
            name,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GanError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse TOML {path:?}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to parse JSON {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported config format for {path:?}; expected a .toml or .json file")]
    UnsupportedFormat { path: PathBuf },
}

pub type GanResult<T> = Result<T, GanError>;
