// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use approx::assert_abs_diff_eq;
use proptest::prelude::*;
use st_gan::{
    DiscriminatorConfig, GanConfig, GanPair, GdFlags, GdInputs, GdOutput, GeneratorConfig,
};
use st_nn::{GradMode, Parameterized};
use st_tensor::Tensor;

const CLASSES: usize = 4;

fn pair() -> GanPair {
    let config = GanConfig {
        generator: GeneratorConfig {
            ch: 1,
            dim_z: 8,
            resolution: 32,
            attention: String::new(),
            n_classes: CLASSES,
            seed: Some(10),
            ..GeneratorConfig::default()
        },
        discriminator: DiscriminatorConfig {
            ch: 1,
            resolution: 32,
            attention: String::new(),
            n_classes: CLASSES,
            seed: Some(20),
            ..DiscriminatorConfig::default()
        },
    };
    GanPair::from_config(&config).unwrap()
}

fn labels(n: usize, offset: usize) -> Vec<usize> {
    (0..n).map(|i| (i + offset) % CLASSES).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(6))]

    #[test]
    fn fused_split_sizes_match_branches(fake in 1usize..4, real in 1usize..4) {
        let pair = pair();
        let z = Tensor::random_normal(&[fake, 8], 0.0, 1.0, Some(1)).unwrap();
        let x = Tensor::random_uniform(&[real, 3, 32, 32], -1.0, 1.0, Some(2)).unwrap();
        let (gy, dy) = (labels(fake, 0), labels(real, 1));
        let out = pair
            .forward(GdInputs::fake(&z, &gy).with_real(&x, &dy), GdFlags::default())
            .unwrap();
        prop_assert_eq!(out.fake().shape()[0], fake);
        prop_assert_eq!(out.real().unwrap().shape()[0], real);
    }
}

#[test]
fn split_and_fused_scores_agree() {
    let pair = pair();
    let z = Tensor::random_normal(&[3, 8], 0.0, 1.0, Some(4)).unwrap();
    let x = Tensor::random_uniform(&[2, 3, 32, 32], -1.0, 1.0, Some(5)).unwrap();
    let (gy, dy) = (labels(3, 0), labels(2, 2));
    let inputs = GdInputs::fake(&z, &gy).with_real(&x, &dy);
    let fused = pair.forward(inputs, GdFlags::default()).unwrap();
    let split = pair
        .forward(
            inputs,
            GdFlags {
                split_d: true,
                ..GdFlags::default()
            },
        )
        .unwrap();
    for (a, b) in [
        (fused.fake(), split.fake()),
        (fused.real().unwrap(), split.real().unwrap()),
    ] {
        assert_eq!(a.shape(), b.shape());
        for (u, v) in a.to_vec().iter().zip(b.to_vec()) {
            assert_abs_diff_eq!(*u, v, epsilon = 1e-4);
        }
    }
}

#[test]
fn train_g_false_detaches_even_tracked_latents() {
    let pair = pair();
    let z = Tensor::random_normal(&[2, 8], 0.0, 1.0, Some(6))
        .unwrap()
        .with_requires_grad(true);
    let gy = labels(2, 0);
    let flags = GdFlags {
        return_g_z: true,
        ..GdFlags::default()
    };
    let out = pair.forward(GdInputs::fake(&z, &gy), flags).unwrap();
    let GdOutput::FakeWithImages { images, fake } = out else {
        panic!("expected generated images");
    };
    assert!(!images.requires_grad());
    // The discriminator call is outside the generator scope.
    assert!(fake.requires_grad());
}

#[test]
fn train_g_true_tracks_even_untracked_latents() {
    let pair = pair();
    let z = Tensor::random_normal(&[2, 8], 0.0, 1.0, Some(7)).unwrap();
    let gy = labels(2, 1);
    let flags = GdFlags {
        train_g: true,
        return_g_z: true,
        split_d: true,
    };
    let out = pair.forward(GdInputs::fake(&z, &gy), flags).unwrap();
    assert!(out.images().unwrap().requires_grad());
}

#[test]
fn score_gradients_flow_from_discriminator_into_generator() {
    let mut pair = pair();
    let z = Tensor::random_normal(&[2, 8], 0.0, 1.0, Some(8)).unwrap();
    let gy = labels(2, 3);
    let y = pair.generator().shared(&gy).unwrap();
    let images = pair.generator().forward(&z, &y, GradMode::Enabled).unwrap();
    let upstream = Tensor::full(&[2, 1], -1.0).unwrap();

    let grad_images = pair
        .discriminator_mut()
        .backward(&images, Some(&gy), &upstream)
        .unwrap();
    assert_eq!(grad_images.shape(), images.shape());
    let grads = pair
        .generator_mut()
        .backward(&z, &y, &grad_images, GradMode::Enabled)
        .unwrap()
        .unwrap();
    pair.generator_mut().shared_backward(&gy, &grads.y).unwrap();

    let mut missing = 0;
    pair.generator()
        .visit_parameters(&mut |p| {
            missing += usize::from(p.gradient().is_none());
            Ok(())
        })
        .unwrap();
    assert_eq!(missing, 0);
    assert!(grads.z.data().iter().all(|v| v.is_finite()));
}
