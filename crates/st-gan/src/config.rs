// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Serde-backed construction knobs for both networks.
//!
//! Every field has a default, so a config file only needs to name what it
//! changes. Files are read as TOML or JSON depending on their extension.

use crate::error::{ConfigurationError, GanError, GanResult};
use serde::{Deserialize, Serialize};
use st_nn::layers::factory::DEFAULT_SN_EPS;
use st_nn::{Activation, NormStyle, Parameterization};
use std::fs;
use std::path::Path;

/// Adam hyperparameters carried for an external optimizer.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerSettings {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
}

impl OptimizerSettings {
    pub fn adam(lr: f32) -> Self {
        Self {
            lr,
            beta1: 0.0,
            beta2: 0.999,
        }
    }
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self::adam(2e-4)
    }
}

/// How convolution, linear and embedding weights are parameterised.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeightParam {
    #[default]
    #[serde(rename = "SN", alias = "sn")]
    Spectral,
    #[serde(rename = "plain")]
    Plain,
}

impl WeightParam {
    pub fn resolve(self, num_svs: usize, num_itrs: usize, eps: f32) -> Parameterization {
        match self {
            WeightParam::Spectral => Parameterization::Spectral {
                num_svs,
                num_itrs,
                eps,
            },
            WeightParam::Plain => Parameterization::Plain,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub ch: usize,
    pub dim_z: usize,
    pub bottom_width: usize,
    pub resolution: usize,
    pub kernel_size: usize,
    /// Underscore-separated resolutions, e.g. `"64"` or `"32_64"`.
    pub attention: String,
    pub n_classes: usize,
    pub num_svs: usize,
    pub num_sv_itrs: usize,
    pub shared: bool,
    /// Width of the shared class embedding; `None` or `0` means `dim_z`.
    pub shared_dim: Option<usize>,
    pub hier: bool,
    pub activation: Activation,
    pub optimizer: OptimizerSettings,
    /// `ortho`, `N02`, `glorot`/`xavier`; other tokens skip initialisation.
    pub init: String,
    pub param: WeightParam,
    pub norm_style: NormStyle,
    pub sn_eps: f32,
    pub bn_eps: f32,
    pub seed: Option<u64>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            ch: 64,
            dim_z: 128,
            bottom_width: 4,
            resolution: 128,
            kernel_size: 3,
            attention: "64".to_string(),
            n_classes: 1000,
            num_svs: 1,
            num_sv_itrs: 1,
            shared: true,
            shared_dim: None,
            hier: false,
            activation: Activation::Relu,
            optimizer: OptimizerSettings::adam(5e-5),
            init: "ortho".to_string(),
            param: WeightParam::Spectral,
            norm_style: NormStyle::Bn,
            sn_eps: DEFAULT_SN_EPS,
            bn_eps: 1e-5,
            seed: None,
        }
    }
}

impl GeneratorConfig {
    pub fn parameterization(&self) -> Parameterization {
        self.param.resolve(self.num_svs, self.num_sv_itrs, self.sn_eps)
    }

    pub fn shared_dim(&self) -> usize {
        self.shared_dim.filter(|&dim| dim > 0).unwrap_or(self.dim_z)
    }

    /// Checks the scalar knobs; layout-dependent checks happen at build time.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        positive("ch", self.ch)?;
        positive("dim_z", self.dim_z)?;
        positive("bottom_width", self.bottom_width)?;
        positive("n_classes", self.n_classes)?;
        odd_kernel(self.kernel_size)?;
        spectral_settings(self.param, self.num_svs, self.num_sv_itrs, self.sn_eps)?;
        if !(self.bn_eps > 0.0) {
            return Err(ConfigurationError::invalid("bn_eps", "must be positive"));
        }
        if self.hier && !self.shared {
            return Err(ConfigurationError::invalid(
                "hier",
                "hierarchical latents require shared embeddings",
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscriminatorConfig {
    pub ch: usize,
    pub resolution: usize,
    pub kernel_size: usize,
    pub attention: String,
    pub n_classes: usize,
    pub num_svs: usize,
    pub num_sv_itrs: usize,
    pub output_dim: usize,
    pub activation: Activation,
    pub optimizer: OptimizerSettings,
    pub init: String,
    pub param: WeightParam,
    pub sn_eps: f32,
    pub seed: Option<u64>,
}

impl Default for DiscriminatorConfig {
    fn default() -> Self {
        Self {
            ch: 64,
            resolution: 128,
            kernel_size: 3,
            attention: "64".to_string(),
            n_classes: 1000,
            num_svs: 1,
            num_sv_itrs: 1,
            output_dim: 1,
            activation: Activation::Relu,
            optimizer: OptimizerSettings::adam(2e-4),
            init: "ortho".to_string(),
            param: WeightParam::Spectral,
            sn_eps: DEFAULT_SN_EPS,
            seed: None,
        }
    }
}

impl DiscriminatorConfig {
    pub fn parameterization(&self) -> Parameterization {
        self.param.resolve(self.num_svs, self.num_sv_itrs, self.sn_eps)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        positive("ch", self.ch)?;
        positive("n_classes", self.n_classes)?;
        positive("output_dim", self.output_dim)?;
        odd_kernel(self.kernel_size)?;
        spectral_settings(self.param, self.num_svs, self.num_sv_itrs, self.sn_eps)
    }
}

fn positive(name: &'static str, value: usize) -> Result<(), ConfigurationError> {
    if value == 0 {
        return Err(ConfigurationError::invalid(name, "must be positive"));
    }
    Ok(())
}

fn odd_kernel(kernel_size: usize) -> Result<(), ConfigurationError> {
    if kernel_size % 2 == 0 {
        return Err(ConfigurationError::invalid(
            "kernel_size",
            format!("expected an odd kernel, got {kernel_size}"),
        ));
    }
    Ok(())
}

fn spectral_settings(
    param: WeightParam,
    num_svs: usize,
    num_itrs: usize,
    eps: f32,
) -> Result<(), ConfigurationError> {
    if param == WeightParam::Spectral {
        positive("num_svs", num_svs)?;
        positive("num_sv_itrs", num_itrs)?;
        if !(eps > 0.0) {
            return Err(ConfigurationError::invalid("sn_eps", "must be positive"));
        }
    }
    Ok(())
}

/// Both halves of an adversarial pair.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GanConfig {
    pub generator: GeneratorConfig,
    pub discriminator: DiscriminatorConfig,
}

impl GanConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Loads a `.toml` or `.json` file.
    pub fn load(path: impl AsRef<Path>) -> GanResult<Self> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        let read = || {
            fs::read_to_string(path).map_err(|source| GanError::Io {
                path: path.to_path_buf(),
                source,
            })
        };
        match extension.as_deref() {
            Some("toml") => Self::from_toml_str(&read()?).map_err(|source| GanError::Toml {
                path: path.to_path_buf(),
                source,
            }),
            Some("json") => Self::from_json_str(&read()?).map_err(|source| GanError::Json {
                path: path.to_path_buf(),
                source,
            }),
            _ => Err(GanError::UnsupportedFormat {
                path: path.to_path_buf(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_reference_hyperparameters() {
        let g = GeneratorConfig::default();
        assert_eq!((g.ch, g.dim_z, g.resolution), (64, 128, 128));
        assert_eq!(g.optimizer.lr, 5e-5);
        assert_eq!(g.shared_dim(), 128);
        assert!(g.parameterization().is_spectral());
        let d = DiscriminatorConfig::default();
        assert_eq!(d.optimizer, OptimizerSettings::adam(2e-4));
        assert_eq!(d.output_dim, 1);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = GanConfig::from_toml_str(
            r#"
            [generator]
            ch = 8
            param = "plain"
            norm_style = "gn"
            activation = "lrelu"
            shared_dim = 0

            [discriminator]
            attention = ""
            "#,
        )
        .unwrap();
        assert_eq!(cfg.generator.ch, 8);
        assert_eq!(cfg.generator.param, WeightParam::Plain);
        assert_eq!(cfg.generator.norm_style, NormStyle::Gn);
        assert_eq!(cfg.generator.activation, Activation::LeakyRelu);
        assert_eq!(cfg.generator.shared_dim(), 128);
        assert_eq!(cfg.generator.init, "ortho");
        assert_eq!(cfg.discriminator.attention, "");
        assert_eq!(cfg.discriminator.ch, 64);
    }

    #[test]
    fn unknown_tokens_fail_to_parse() {
        assert!(GanConfig::from_json_str(r#"{"generator":{"param":"weightnorm"}}"#).is_err());
        assert!(GanConfig::from_json_str(r#"{"generator":{"norm_style":"sync"}}"#).is_err());
    }

    #[test]
    fn validation_catches_structural_errors() {
        let even = GeneratorConfig {
            kernel_size: 4,
            ..GeneratorConfig::default()
        };
        assert!(matches!(
            even.validate(),
            Err(ConfigurationError::InvalidArgument { name: "kernel_size", .. })
        ));
        let hier = GeneratorConfig {
            hier: true,
            shared: false,
            ..GeneratorConfig::default()
        };
        assert!(matches!(
            hier.validate(),
            Err(ConfigurationError::InvalidArgument { name: "hier", .. })
        ));
        let plain = DiscriminatorConfig {
            param: WeightParam::Plain,
            num_svs: 0,
            ..DiscriminatorConfig::default()
        };
        assert!(plain.validate().is_ok());
    }

    #[test]
    fn load_dispatches_on_extension() {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("pair.json");
        fs::write(&json, r#"{"discriminator":{"output_dim":4}}"#).unwrap();
        assert_eq!(GanConfig::load(&json).unwrap().discriminator.output_dim, 4);
        let yaml = dir.path().join("pair.yaml");
        fs::write(&yaml, "generator: {}").unwrap();
        assert!(matches!(
            GanConfig::load(&yaml),
            Err(GanError::UnsupportedFormat { .. })
        ));
        assert!(matches!(
            GanConfig::load(dir.path().join("missing.toml")),
            Err(GanError::Io { .. })
        ));
    }
}
