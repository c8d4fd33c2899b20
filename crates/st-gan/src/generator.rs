// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Class-conditional residual generator.
//!
//! A latent vector is projected to a `bottom_width × bottom_width` map, then
//! every stage of the [`LayoutDescriptor`] doubles the spatial size through a
//! [`GBlock`] conditioned on the class vector (and, in hierarchical mode, on a
//! dedicated latent chunk). An output head maps the last stage to RGB in
//! `[-1, 1]`.

use crate::arch::{generator_layout, AttentionSet, LayoutDescriptor, IMAGE_CHANNELS};
use crate::config::{GeneratorConfig, OptimizerSettings};
use crate::error::{ConfigurationError, GanResult};
use crate::report::BuildReport;
use spiral_config::determinism;
use st_nn::{
    initialize, Activation, Attention, BatchNorm2d, ConditionProjection, ConditionalBatchNorm2d,
    ConditionalModule, Conv2d, Embedding, GBlock, GradMode, Identity, InitPolicy, LayerFactory,
    Linear, Module, Parameter, Parameterized, PureResult, Tensor, TensorError, Upsample,
};

/// Residual block plus the optional self-attention that follows it.
#[derive(Clone, Debug)]
pub struct Stage {
    block: GBlock,
    attention: Option<Attention>,
}

impl Stage {
    pub fn block(&self) -> &GBlock {
        &self.block
    }

    pub fn attention(&self) -> Option<&Attention> {
        self.attention.as_ref()
    }

    fn forward(&self, input: &Tensor, condition: &Tensor) -> PureResult<Tensor> {
        let h = self.block.forward_conditioned(input, condition)?;
        match &self.attention {
            Some(attention) => attention.forward(&h),
            None => Ok(h),
        }
    }

    fn backward(
        &mut self,
        input: &Tensor,
        condition: &Tensor,
        grad_output: &Tensor,
    ) -> PureResult<(Tensor, Tensor)> {
        let grad = match &mut self.attention {
            Some(attention) => {
                let h = self.block.forward_conditioned(input, condition)?;
                attention.backward(&h, grad_output)?
            }
            None => grad_output.clone(),
        };
        self.block.backward_conditioned(input, condition, &grad)
    }
}

impl Parameterized for Stage {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.block.visit_parameters(visitor)?;
        self.attention.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.block.visit_parameters_mut(visitor)?;
        self.attention.visit_parameters_mut(visitor)
    }

    fn refresh_spectral_state(&mut self) -> PureResult<()> {
        self.block.refresh_spectral_state()?;
        self.attention.refresh_spectral_state()
    }
}

/// Source of the class-conditioning vector.
#[derive(Clone, Debug)]
enum ClassConditioning {
    /// Learned table shared by every conditional norm.
    Shared(Embedding),
    /// Raw one-hot class vectors.
    Passthrough { identity: Identity, n_classes: usize },
}

impl ClassConditioning {
    fn encode(&self, labels: &[usize]) -> PureResult<Tensor> {
        match self {
            ClassConditioning::Shared(table) => table.lookup(labels),
            ClassConditioning::Passthrough {
                identity,
                n_classes,
            } => identity.forward(&Tensor::one_hot(labels, *n_classes)?),
        }
    }

    fn encode_backward(&mut self, labels: &[usize], grad: &Tensor) -> PureResult<()> {
        match self {
            ClassConditioning::Shared(table) => table.lookup_backward(labels, grad),
            ClassConditioning::Passthrough { .. } => Ok(()),
        }
    }

    fn width(&self) -> usize {
        match self {
            ClassConditioning::Shared(table) => table.embed_dim(),
            ClassConditioning::Passthrough { n_classes, .. } => *n_classes,
        }
    }
}

/// How the latent vector is divided across the projection and the stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LatentPartition {
    pub num_slots: usize,
    /// Zero when hierarchical latents are off.
    pub z_chunk_size: usize,
    /// Authoritative latent width; may be below the requested one.
    pub dim_z: usize,
}

impl LatentPartition {
    /// Hierarchical partitions give every stage plus the projection an equal
    /// chunk, truncating `dim_z` to a multiple of the slot count.
    pub fn new(dim_z: usize, stage_count: usize, hier: bool) -> Self {
        if hier {
            let num_slots = stage_count + 1;
            let z_chunk_size = dim_z / num_slots;
            Self {
                num_slots,
                z_chunk_size,
                dim_z: z_chunk_size * num_slots,
            }
        } else {
            Self {
                num_slots: 1,
                z_chunk_size: 0,
                dim_z,
            }
        }
    }

    pub fn is_hierarchical(&self) -> bool {
        self.z_chunk_size > 0
    }

    /// Width of the slice fed to the initial projection.
    pub fn head_size(&self) -> usize {
        self.dim_z / self.num_slots
    }
}

/// Gradients of a generator pass with respect to its inputs.
#[derive(Clone, Debug, PartialEq)]
pub struct LatentGradients {
    /// `[batch, dim_z]`
    pub z: Tensor,
    /// `[batch, cond_width]`, the conditioning vector from [`Generator::shared`].
    pub y: Tensor,
}

#[derive(Clone, Debug)]
pub struct Generator {
    layout: LayoutDescriptor,
    partition: LatentPartition,
    bottom_width: usize,
    conditioning: ClassConditioning,
    linear: Linear,
    stages: Vec<Stage>,
    output_norm: BatchNorm2d,
    output_conv: Conv2d,
    activation: Activation,
    optimizer: OptimizerSettings,
    report: Option<BuildReport>,
}

impl Generator {
    /// Builds and initialises a generator. Initialisation draws from the same
    /// seeded stream as construction, so equal configs give equal weights.
    pub fn new(config: &GeneratorConfig) -> GanResult<Self> {
        config.validate()?;
        let attention = AttentionSet::parse(&config.attention)?;
        let layout = generator_layout(config.ch, &attention, config.resolution)?;
        layout.check_attention_width(Attention::MIN_CHANNELS)?;
        let partition = LatentPartition::new(config.dim_z, layout.len(), config.hier);
        if config.hier && partition.z_chunk_size == 0 {
            return Err(ConfigurationError::invalid(
                "dim_z",
                format!(
                    "{} latent dims cannot feed {} hierarchical slots",
                    config.dim_z, partition.num_slots
                ),
            )
            .into());
        }
        if partition.dim_z != config.dim_z {
            tracing::debug!(
                requested = config.dim_z,
                dim_z = partition.dim_z,
                "truncated hierarchical latent size"
            );
        }

        let rng = determinism::rng_from_optional(config.seed, "st-gan/generator");
        let factory = LayerFactory::new(config.parameterization(), config.kernel_size, rng)?;

        let conditioning = if config.shared {
            ClassConditioning::Shared(factory.embedding("shared", config.n_classes, config.shared_dim())?)
        } else {
            ClassConditioning::Passthrough {
                identity: Identity::new(),
                n_classes: config.n_classes,
            }
        };
        let cond_dim = if config.shared {
            config.shared_dim() + partition.z_chunk_size
        } else {
            config.n_classes
        };
        let norm = |name: &str, channels: usize| -> PureResult<ConditionalBatchNorm2d> {
            let (gain, bias) = if config.shared {
                (
                    ConditionProjection::Linear(factory.linear(
                        &format!("{name}.gain"),
                        cond_dim,
                        channels,
                        false,
                    )?),
                    ConditionProjection::Linear(factory.linear(
                        &format!("{name}.bias"),
                        cond_dim,
                        channels,
                        false,
                    )?),
                )
            } else {
                (
                    ConditionProjection::Embedding(factory.embedding(
                        &format!("{name}.gain"),
                        cond_dim,
                        channels,
                    )?),
                    ConditionProjection::Embedding(factory.embedding(
                        &format!("{name}.bias"),
                        cond_dim,
                        channels,
                    )?),
                )
            };
            ConditionalBatchNorm2d::new(channels, config.norm_style, config.bn_eps, gain, bias)
        };

        let first_channels = layout.stages()[0].in_channels;
        let linear = factory.linear(
            "linear",
            partition.head_size(),
            first_channels * config.bottom_width * config.bottom_width,
            true,
        )?;

        let mut stages = Vec::with_capacity(layout.len());
        for (index, spec) in layout.iter().enumerate() {
            let upsample = if spec.spatial_resize {
                Some(Upsample::new(2)?)
            } else {
                None
            };
            let block = GBlock::new(
                &format!("blocks.{index}"),
                spec.in_channels,
                spec.out_channels,
                &factory,
                &norm,
                config.activation,
                upsample,
            )?;
            let attention = if spec.has_attention {
                tracing::info!(
                    network = "G",
                    stage = index,
                    resolution = spec.resolution_after,
                    "adding attention layer"
                );
                Some(Attention::new(
                    &format!("blocks.{index}.attention"),
                    spec.out_channels,
                    &factory,
                )?)
            } else {
                None
            };
            stages.push(Stage { block, attention });
        }

        let output_norm = BatchNorm2d::new("output.bn", layout.final_channels(), config.bn_eps)?;
        let output_conv = factory.conv("output.conv", layout.final_channels(), IMAGE_CHANNELS)?;

        let mut rng = factory.into_rng();
        let mut generator = Self {
            layout,
            partition,
            bottom_width: config.bottom_width,
            conditioning,
            linear,
            stages,
            output_norm,
            output_conv,
            activation: config.activation,
            optimizer: config.optimizer,
            report: None,
        };
        let init = initialize(
            &mut generator,
            &InitPolicy::parse(&config.init),
            &mut rng,
            "G",
        )?;
        generator.report = Some(BuildReport::new("G", &generator.layout, init));
        Ok(generator)
    }

    /// Conditioning vector for class labels: the shared embedding rows, or
    /// the one-hot vectors when embeddings are not shared.
    pub fn shared(&self, labels: &[usize]) -> PureResult<Tensor> {
        self.conditioning.encode(labels)
    }

    /// Authoritative latent width expected by [`Generator::forward`].
    pub fn dim_z(&self) -> usize {
        self.partition.dim_z
    }

    pub fn partition(&self) -> LatentPartition {
        self.partition
    }

    pub fn layout(&self) -> &LayoutDescriptor {
        &self.layout
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn output_resolution(&self) -> usize {
        self.layout
            .iter()
            .fold(self.bottom_width, |size, spec| if spec.spatial_resize { size * 2 } else { size })
    }

    pub fn optimizer_settings(&self) -> OptimizerSettings {
        self.optimizer
    }

    pub fn report(&self) -> Option<&BuildReport> {
        self.report.as_ref()
    }

    /// Element count of the init-managed parameters.
    pub fn param_count(&self) -> usize {
        self.report.as_ref().map_or(0, BuildReport::param_count)
    }

    /// Accumulates the gradient of [`Generator::shared`] into the shared
    /// embedding. One-hot conditioning has nothing to update.
    pub fn shared_backward(&mut self, labels: &[usize], grad_y: &Tensor) -> PureResult<()> {
        self.conditioning.encode_backward(labels, grad_y)
    }

    /// Validates the inputs and returns the projection's latent slice plus
    /// the per-stage conditions (empty unless hierarchical).
    fn split_latent(&self, z: &Tensor, y: &Tensor) -> PureResult<(Tensor, Vec<Tensor>)> {
        let (batch, width) = z.dims2()?;
        if width != self.partition.dim_z {
            return Err(TensorError::ShapeMismatch {
                left: z.shape().to_vec(),
                right: vec![batch, self.partition.dim_z],
            });
        }
        let (rows, cond_width) = y.dims2()?;
        if rows != batch || cond_width != self.conditioning.width() {
            return Err(TensorError::ShapeMismatch {
                left: y.shape().to_vec(),
                right: vec![batch, self.conditioning.width()],
            });
        }

        if !self.partition.is_hierarchical() {
            return Ok((z.clone(), Vec::new()));
        }
        let sizes = vec![self.partition.z_chunk_size; self.partition.num_slots];
        let mut chunks = z.split(&sizes, 1)?.into_iter();
        let head = chunks.next().ok_or(TensorError::EmptyInput("latent"))?;
        let conditions = chunks
            .map(|chunk| Tensor::concat(&[y, &chunk], 1))
            .collect::<PureResult<Vec<_>>>()?;
        Ok((head, conditions))
    }

    fn bottom_shape(&self, batch: usize) -> [usize; 4] {
        let channels = self.layout.stages()[0].in_channels;
        [batch, channels, self.bottom_width, self.bottom_width]
    }

    /// Generates `[batch, 3, res, res]` images from `z: [batch, dim_z]` and a
    /// conditioning vector produced by [`Generator::shared`].
    ///
    /// `mode` scopes gradient tracking of the result to this call only.
    pub fn forward(&self, z: &Tensor, y: &Tensor, mode: GradMode) -> PureResult<Tensor> {
        let (head, conditions) = self.split_latent(z, y)?;
        let mut h = self
            .linear
            .forward(&head)?
            .reshape(&self.bottom_shape(head.shape()[0]))?;
        for (index, stage) in self.stages.iter().enumerate() {
            let condition = conditions.get(index).unwrap_or(y);
            h = stage.forward(&h, condition)?;
        }
        let h = self.activation.apply(&self.output_norm.forward(&h)?);
        let image = self.output_conv.forward(&h)?.tanh();
        Ok(mode.scope(image))
    }

    /// Back-propagates `grad_output` (shaped like the generated images)
    /// through the pass [`Generator::forward`] would run for the same inputs,
    /// accumulating every parameter gradient. Pass the returned `y` gradient
    /// to [`Generator::shared_backward`] to reach the shared embedding.
    ///
    /// Under [`GradMode::Disabled`] nothing is tracked: no parameter is
    /// touched and `None` is returned.
    pub fn backward(
        &mut self,
        z: &Tensor,
        y: &Tensor,
        grad_output: &Tensor,
        mode: GradMode,
    ) -> PureResult<Option<LatentGradients>> {
        if !mode.is_enabled() {
            tracing::debug!("generator backward skipped: gradients disabled");
            return Ok(None);
        }
        let (head, conditions) = self.split_latent(z, y)?;
        let bottom = self.bottom_shape(head.shape()[0]);
        let mut inputs = Vec::with_capacity(self.stages.len());
        let mut h = self.linear.forward(&head)?.reshape(&bottom)?;
        for (index, stage) in self.stages.iter().enumerate() {
            let condition = conditions.get(index).unwrap_or(y);
            let next = stage.forward(&h, condition)?;
            inputs.push(h);
            h = next;
        }
        let normalized = self.output_norm.forward(&h)?;
        let activated = self.activation.apply(&normalized);
        let image = self.output_conv.forward(&activated)?.tanh();
        if grad_output.shape() != image.shape() {
            return Err(TensorError::ShapeMismatch {
                left: image.shape().to_vec(),
                right: grad_output.shape().to_vec(),
            });
        }

        let grad = grad_output.mul(&image.map(|v| 1.0 - v * v))?;
        let grad = self.output_conv.backward(&activated, &grad)?;
        let grad = self.activation.apply_backward(&normalized, &grad)?;
        let mut grad = self.output_norm.backward(&h, &grad)?;

        let hierarchical = self.partition.is_hierarchical();
        let split = [self.conditioning.width(), self.partition.z_chunk_size];
        let mut grad_y = Tensor::zeros(y.shape())?;
        let mut grad_chunks = Vec::with_capacity(conditions.len());
        for (index, stage) in self.stages.iter_mut().enumerate().rev() {
            let condition = conditions.get(index).unwrap_or(y);
            let (grad_input, grad_condition) = stage.backward(&inputs[index], condition, &grad)?;
            grad = grad_input;
            if hierarchical {
                let mut parts = grad_condition.split(&split, 1)?.into_iter();
                let (Some(class_part), Some(chunk_part)) = (parts.next(), parts.next()) else {
                    return Err(TensorError::EmptyInput("condition_gradient"));
                };
                grad_y = grad_y.add(&class_part)?;
                grad_chunks.push(chunk_part);
            } else {
                grad_y = grad_y.add(&grad_condition)?;
            }
        }

        let flat = grad.reshape(&[bottom[0], bottom[1] * bottom[2] * bottom[3]])?;
        let grad_head = self.linear.backward(&head, &flat)?;
        let grad_z = if hierarchical {
            grad_chunks.reverse();
            let pieces: Vec<&Tensor> = std::iter::once(&grad_head).chain(&grad_chunks).collect();
            Tensor::concat(&pieces, 1)?
        } else {
            grad_head
        };
        Ok(Some(LatentGradients {
            z: grad_z.detach(),
            y: grad_y.detach(),
        }))
    }
}

impl Parameterized for Generator {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        if let ClassConditioning::Shared(table) = &self.conditioning {
            table.visit_parameters(visitor)?;
        }
        self.linear.visit_parameters(visitor)?;
        for stage in &self.stages {
            stage.visit_parameters(visitor)?;
        }
        self.output_norm.visit_parameters(visitor)?;
        self.output_conv.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        if let ClassConditioning::Shared(table) = &mut self.conditioning {
            table.visit_parameters_mut(visitor)?;
        }
        self.linear.visit_parameters_mut(visitor)?;
        for stage in &mut self.stages {
            stage.visit_parameters_mut(visitor)?;
        }
        self.output_norm.visit_parameters_mut(visitor)?;
        self.output_conv.visit_parameters_mut(visitor)
    }

    fn refresh_spectral_state(&mut self) -> PureResult<()> {
        if let ClassConditioning::Shared(table) = &mut self.conditioning {
            table.refresh_spectral_state()?;
        }
        self.linear.refresh_spectral_state()?;
        for stage in &mut self.stages {
            stage.refresh_spectral_state()?;
        }
        self.output_conv.refresh_spectral_state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WeightParam;

    fn small(resolution: usize) -> GeneratorConfig {
        GeneratorConfig {
            ch: 2,
            dim_z: 12,
            resolution,
            attention: String::new(),
            n_classes: 5,
            seed: Some(7),
            ..GeneratorConfig::default()
        }
    }

    #[test]
    fn latent_partition_truncates() {
        assert_eq!(LatentPartition::new(120, 4, true).dim_z, 120);
        let odd = LatentPartition::new(121, 4, true);
        assert_eq!((odd.num_slots, odd.z_chunk_size, odd.dim_z), (5, 24, 120));
        let flat = LatentPartition::new(121, 4, false);
        assert_eq!((flat.num_slots, flat.z_chunk_size, flat.head_size()), (1, 0, 121));
    }

    #[test]
    fn forward_produces_bounded_images() {
        let g = Generator::new(&small(32)).unwrap();
        let z = Tensor::random_normal(&[2, g.dim_z()], 0.0, 1.0, Some(1)).unwrap();
        let y = g.shared(&[0, 4]).unwrap();
        let out = g.forward(&z, &y, GradMode::Enabled).unwrap();
        assert_eq!(out.shape(), &[2, 3, 32, 32]);
        assert!(out.max_value() <= 1.0 && out.min_value() >= -1.0);
        assert_eq!(g.output_resolution(), 32);
    }

    #[test]
    fn hierarchical_stages_receive_latent_chunks() {
        let config = GeneratorConfig {
            hier: true,
            dim_z: 13,
            shared_dim: Some(6),
            ..small(32)
        };
        let g = Generator::new(&config).unwrap();
        // Three stages plus the projection share 13 dims as 4 × 3.
        assert_eq!(g.dim_z(), 12);
        assert_eq!(g.partition().z_chunk_size, 3);
        let z = Tensor::random_normal(&[3, 12], 0.0, 1.0, Some(2)).unwrap();
        let y = g.shared(&[1, 2, 3]).unwrap();
        assert_eq!(y.shape(), &[3, 6]);
        assert_eq!(g.forward(&z, &y, GradMode::Disabled).unwrap().shape(), &[3, 3, 32, 32]);
        let wrong = Tensor::random_normal(&[3, 13], 0.0, 1.0, Some(2)).unwrap();
        assert!(g.forward(&wrong, &y, GradMode::Disabled).is_err());
    }

    #[test]
    fn passthrough_conditioning_uses_one_hot_vectors() {
        let config = GeneratorConfig {
            shared: false,
            param: WeightParam::Plain,
            ..small(32)
        };
        let g = Generator::new(&config).unwrap();
        let y = g.shared(&[3]).unwrap();
        assert_eq!(y.to_vec(), vec![0.0, 0.0, 0.0, 1.0, 0.0]);
        let z = Tensor::zeros(&[1, 12]).unwrap();
        assert_eq!(g.forward(&z, &y, GradMode::Enabled).unwrap().shape(), &[1, 3, 32, 32]);
        assert!(g.shared(&[5]).is_err());
    }

    #[test]
    fn hierarchy_needs_enough_latent_dims() {
        let config = GeneratorConfig {
            hier: true,
            dim_z: 3,
            ..small(32)
        };
        assert!(Generator::new(&config).is_err());
    }

    #[test]
    fn grad_mode_scopes_the_output() {
        let g = Generator::new(&small(32)).unwrap();
        let z = Tensor::zeros(&[1, 12]).unwrap().with_requires_grad(true);
        let y = g.shared(&[0]).unwrap();
        assert!(!g.forward(&z, &y, GradMode::Disabled).unwrap().requires_grad());
        assert!(g.forward(&z.detach(), &y, GradMode::Enabled).unwrap().requires_grad());
    }

    fn gradient_count(g: &Generator) -> (usize, usize) {
        let (mut with, mut total) = (0, 0);
        g.visit_parameters(&mut |p| {
            total += 1;
            with += usize::from(p.gradient().is_some());
            Ok(())
        })
        .unwrap();
        (with, total)
    }

    #[test]
    fn enabled_backward_reaches_every_parameter() {
        let config = GeneratorConfig {
            attention: "16".into(),
            ..small(32)
        };
        let mut g = Generator::new(&config).unwrap();
        let z = Tensor::random_normal(&[2, g.dim_z()], 0.0, 1.0, Some(3)).unwrap();
        let labels = [1, 3];
        let y = g.shared(&labels).unwrap();
        let upstream = Tensor::random_normal(&[2, 3, 32, 32], 0.0, 1.0, Some(4)).unwrap();
        let grads = g
            .backward(&z, &y, &upstream, GradMode::Enabled)
            .unwrap()
            .unwrap();
        assert_eq!(grads.z.shape(), z.shape());
        assert_eq!(grads.y.shape(), y.shape());
        assert!(grads.z.squared_l2_norm() > 0.0);
        let (with, total) = gradient_count(&g);
        // Only the shared table is still waiting for its gradient.
        assert_eq!(with, total - 1);
        g.shared_backward(&labels, &grads.y).unwrap();
        assert_eq!(gradient_count(&g), (total, total));

        g.zero_accumulators().unwrap();
        g.visit_parameters(&mut |p| {
            assert_eq!(p.gradient().map(Tensor::sum_all), Some(0.0));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn disabled_backward_leaves_no_parameter_gradient() {
        let mut g = Generator::new(&small(32)).unwrap();
        let z = Tensor::random_normal(&[2, g.dim_z()], 0.0, 1.0, Some(5)).unwrap();
        let y = g.shared(&[0, 2]).unwrap();
        let upstream = Tensor::full(&[2, 3, 32, 32], 1.0).unwrap();
        assert!(g
            .backward(&z, &y, &upstream, GradMode::Disabled)
            .unwrap()
            .is_none());
        assert_eq!(gradient_count(&g).0, 0);
    }

    #[test]
    fn latent_gradient_is_linear_in_the_upstream_gradient() {
        let config = GeneratorConfig {
            hier: true,
            shared_dim: Some(4),
            ..small(32)
        };
        let mut g = Generator::new(&config).unwrap();
        let z = Tensor::random_normal(&[2, g.dim_z()], 0.0, 1.0, Some(6)).unwrap();
        let y = g.shared(&[4, 0]).unwrap();
        let upstream = Tensor::random_normal(&[2, 3, 32, 32], 0.0, 1.0, Some(7)).unwrap();
        let once = g
            .backward(&z, &y, &upstream, GradMode::Enabled)
            .unwrap()
            .unwrap();
        let twice = g
            .backward(&z, &y, &upstream.scale(2.0), GradMode::Enabled)
            .unwrap()
            .unwrap();
        assert_eq!(once.z.shape(), &[2, 12]);
        for (a, b) in once.z.to_vec().iter().zip(twice.z.to_vec()) {
            assert!((2.0 * a - b).abs() <= 1e-4 * (1.0 + b.abs()));
        }
        assert!(g
            .backward(&z, &y, &Tensor::zeros(&[2, 3, 16, 16]).unwrap(), GradMode::Enabled)
            .is_err());
    }

    #[test]
    fn report_counts_managed_parameters() {
        let g = Generator::new(&small(32)).unwrap();
        let report = g.report().unwrap();
        assert_eq!(report.network, "G");
        assert_eq!(report.stages, 3);
        assert!(report.attention_resolutions.is_empty());
        let mut affine = 0;
        g.visit_parameters(&mut |p| {
            if !p.role().is_init_managed() {
                affine += p.numel();
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(g.param_count() + affine, g.parameter_count());
        assert_eq!(g.optimizer_settings(), OptimizerSettings::adam(5e-5));
    }
}
