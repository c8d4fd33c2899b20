// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use st_gan::{
    ConfigurationError, Discriminator, DiscriminatorConfig, GanError, Generator, GeneratorConfig,
    WeightParam,
};
use st_nn::{GradMode, NormStyle, Parameterized};
use st_tensor::Tensor;

fn config_64() -> GeneratorConfig {
    GeneratorConfig {
        ch: 8,
        dim_z: 16,
        resolution: 64,
        attention: String::new(),
        n_classes: 10,
        seed: Some(2024),
        ..GeneratorConfig::default()
    }
}

#[test]
fn generator_64_end_to_end() {
    let g = Generator::new(&config_64()).unwrap();
    assert_eq!(g.stages().len(), 4);
    let z = Tensor::random_normal(&[2, g.dim_z()], 0.0, 1.0, Some(9)).unwrap();
    let y = g.shared(&[3, 7]).unwrap();
    let images = g.forward(&z, &y, GradMode::Disabled).unwrap();
    assert_eq!(images.shape(), &[2, 3, 64, 64]);
    assert!(images.data().iter().all(|v| v.is_finite() && (-1.0..=1.0).contains(v)));
}

#[test]
fn same_seed_same_weights() {
    let a = Generator::new(&config_64()).unwrap();
    let b = Generator::new(&config_64()).unwrap();
    assert_eq!(a.state_dict().unwrap(), b.state_dict().unwrap());
    assert_eq!(a.param_count(), b.param_count());
}

#[test]
fn forward_is_pure() {
    let config = GeneratorConfig {
        resolution: 32,
        ..config_64()
    };
    let g = Generator::new(&config).unwrap();
    let z = Tensor::random_normal(&[2, g.dim_z()], 0.0, 1.0, Some(1)).unwrap();
    let y = g.shared(&[0, 1]).unwrap();
    let first = g.forward(&z, &y, GradMode::Enabled).unwrap();
    let second = g.forward(&z, &y, GradMode::Enabled).unwrap();
    assert_eq!(first, second);
}

#[test]
fn attention_is_placed_after_matching_stage() {
    let config = GeneratorConfig {
        attention: "32".into(),
        ..config_64()
    };
    let g = Generator::new(&config).unwrap();
    let flags: Vec<bool> = g.stages().iter().map(|s| s.attention().is_some()).collect();
    assert_eq!(flags, vec![false, false, true, false]);
    assert_eq!(g.report().unwrap().attention_resolutions, vec![32]);
}

#[test]
fn every_norm_style_and_plain_weights_build() {
    for style in [NormStyle::Bn, NormStyle::In, NormStyle::Ln, NormStyle::Gn, NormStyle::Nonorm] {
        let config = GeneratorConfig {
            resolution: 32,
            norm_style: style,
            param: WeightParam::Plain,
            kernel_size: 5,
            ..config_64()
        };
        let g = Generator::new(&config).unwrap();
        let z = Tensor::random_normal(&[2, 16], 0.0, 1.0, Some(5)).unwrap();
        let y = g.shared(&[1, 1]).unwrap();
        let out = g.forward(&z, &y, GradMode::Disabled).unwrap();
        assert_eq!(out.shape(), &[2, 3, 32, 32], "style {style}");
    }
}

#[test]
fn unknown_init_policy_is_not_fatal() {
    let config = GeneratorConfig {
        resolution: 32,
        init: "kaiming".into(),
        ..config_64()
    };
    let g = Generator::new(&config).unwrap();
    let report = g.report().unwrap();
    assert_eq!(report.init.policy, "kaiming");
    assert!(report.init.skipped > 0);
    assert!(g.param_count() > 0);
}

#[test]
fn construction_errors_surface_as_configuration_errors() {
    let bad = GeneratorConfig {
        resolution: 96,
        ..config_64()
    };
    assert!(matches!(
        Generator::new(&bad),
        Err(GanError::Configuration(ConfigurationError::UnsupportedResolution { resolution: 96 }))
    ));
    let bad = GeneratorConfig {
        attention: "64_big".into(),
        ..config_64()
    };
    assert!(matches!(
        Generator::new(&bad),
        Err(GanError::Configuration(ConfigurationError::MalformedAttention { .. }))
    ));
}

#[test]
fn narrow_attention_stages_are_configuration_errors() {
    let narrow = GeneratorConfig {
        ch: 1,
        attention: "64".into(),
        ..config_64()
    };
    assert!(matches!(
        Generator::new(&narrow),
        Err(GanError::Configuration(ConfigurationError::InvalidArgument { name: "attention", .. }))
    ));
    let narrow_d = DiscriminatorConfig {
        ch: 1,
        resolution: 64,
        attention: "32".into(),
        n_classes: 4,
        seed: Some(1),
        ..DiscriminatorConfig::default()
    };
    assert!(matches!(
        Discriminator::new(&narrow_d),
        Err(GanError::Configuration(ConfigurationError::InvalidArgument { name: "attention", .. }))
    ));
}

#[test]
fn spectral_refresh_keeps_outputs_finite() {
    let config = GeneratorConfig {
        resolution: 32,
        ..config_64()
    };
    let mut g = Generator::new(&config).unwrap();
    g.refresh_spectral_state().unwrap();
    let z = Tensor::random_normal(&[1, 16], 0.0, 1.0, Some(3)).unwrap();
    let y = g.shared(&[4]).unwrap();
    let out = g.forward(&z, &y, GradMode::Disabled).unwrap();
    assert!(out.data().iter().all(|v| v.is_finite()));
}
