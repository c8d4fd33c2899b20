// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Projection discriminator built from downsampling residual blocks.

use crate::arch::{discriminator_layout, AttentionSet, LayoutDescriptor};
use crate::config::{DiscriminatorConfig, OptimizerSettings};
use crate::error::GanResult;
use crate::report::BuildReport;
use spiral_config::determinism;
use st_nn::{
    initialize, Activation, Attention, AvgPool2d, Conv2d, Embedding, InitPolicy, LayerFactory,
    Linear, Module, Parameter, Parameterized, PureResult, Tensor, TensorError,
};

/// Residual block of the discriminator.
///
/// `h = conv2(act(conv1(pre(x))))`, average-pooled after both convolutions
/// when the block downsamples. The shortcut is a learnable 1×1 convolution
/// whenever the channel count changes or the block downsamples; preactivated
/// blocks convolve before pooling the shortcut, the stem block pools first.
#[derive(Clone, Debug)]
pub struct DBlock {
    in_channels: usize,
    out_channels: usize,
    preactivation: bool,
    activation: Activation,
    conv1: Conv2d,
    conv2: Conv2d,
    shortcut: Option<Conv2d>,
    downsample: Option<AvgPool2d>,
}

impl DBlock {
    pub fn new(
        name: &str,
        in_channels: usize,
        out_channels: usize,
        factory: &LayerFactory,
        activation: Activation,
        preactivation: bool,
        downsample: bool,
    ) -> PureResult<Self> {
        let hidden = if preactivation { in_channels } else { out_channels };
        let shortcut = if in_channels != out_channels || downsample {
            Some(factory.conv_with(&format!("{name}.conv_sc"), in_channels, out_channels, 1, 0, true)?)
        } else {
            None
        };
        Ok(Self {
            in_channels,
            out_channels,
            preactivation,
            activation,
            conv1: factory.conv(&format!("{name}.conv1"), in_channels, hidden)?,
            conv2: factory.conv(&format!("{name}.conv2"), hidden, out_channels)?,
            shortcut,
            downsample: if downsample { Some(AvgPool2d::new(2)?) } else { None },
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn hidden_channels(&self) -> usize {
        self.conv1.out_channels()
    }

    pub fn has_learnable_shortcut(&self) -> bool {
        self.shortcut.is_some()
    }

    pub fn downsamples(&self) -> bool {
        self.downsample.is_some()
    }

    fn pool(&self, x: Tensor) -> PureResult<Tensor> {
        match &self.downsample {
            Some(pool) => pool.forward(&x),
            None => Ok(x),
        }
    }

    fn project(&self, x: Tensor) -> PureResult<Tensor> {
        match &self.shortcut {
            Some(conv) => conv.forward(&x),
            None => Ok(x),
        }
    }

    fn shortcut(&self, x: &Tensor) -> PureResult<Tensor> {
        if self.preactivation {
            self.pool(self.project(x.clone())?)
        } else {
            self.project(self.pool(x.clone())?)
        }
    }
}

impl Module for DBlock {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let h = if self.preactivation {
            self.activation.apply(input)
        } else {
            input.clone()
        };
        let h = self.conv1.forward(&h)?;
        let h = self.conv2.forward(&self.activation.apply(&h))?;
        self.pool(h)?.add(&self.shortcut(input)?)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let pre = if self.preactivation {
            self.activation.apply(input)
        } else {
            input.clone()
        };
        let c1 = self.conv1.forward(&pre)?;
        let a1 = self.activation.apply(&c1);
        let c2 = self.conv2.forward(&a1)?;

        let grad = match &mut self.downsample {
            Some(pool) => pool.backward(&c2, grad_output)?,
            None => grad_output.clone(),
        };
        let grad = self.conv2.backward(&a1, &grad)?;
        let grad = self.activation.apply_backward(&c1, &grad)?;
        let mut grad_main = self.conv1.backward(&pre, &grad)?;
        if self.preactivation {
            grad_main = self.activation.apply_backward(input, &grad_main)?;
        }

        let grad_skip = if self.preactivation {
            let projected = self.project(input.clone())?;
            let grad = match &mut self.downsample {
                Some(pool) => pool.backward(&projected, grad_output)?,
                None => grad_output.clone(),
            };
            match &mut self.shortcut {
                Some(conv) => conv.backward(input, &grad)?,
                None => grad,
            }
        } else {
            let pooled = self.pool(input.clone())?;
            let grad = match &mut self.shortcut {
                Some(conv) => conv.backward(&pooled, grad_output)?,
                None => grad_output.clone(),
            };
            match &mut self.downsample {
                Some(pool) => pool.backward(input, &grad)?,
                None => grad,
            }
        };
        grad_main.add(&grad_skip)
    }
}

impl Parameterized for DBlock {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.conv1.visit_parameters(visitor)?;
        self.conv2.visit_parameters(visitor)?;
        self.shortcut.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.conv1.visit_parameters_mut(visitor)?;
        self.conv2.visit_parameters_mut(visitor)?;
        self.shortcut.visit_parameters_mut(visitor)
    }

    fn refresh_spectral_state(&mut self) -> PureResult<()> {
        self.conv1.refresh_spectral_state()?;
        self.conv2.refresh_spectral_state()?;
        self.shortcut.refresh_spectral_state()
    }
}

#[derive(Clone, Debug)]
struct DStage {
    block: DBlock,
    attention: Option<Attention>,
}

#[derive(Clone, Debug)]
pub struct Discriminator {
    layout: LayoutDescriptor,
    stages: Vec<DStage>,
    activation: Activation,
    linear: Linear,
    embed: Embedding,
    optimizer: OptimizerSettings,
    report: Option<BuildReport>,
}

impl Discriminator {
    pub fn new(config: &DiscriminatorConfig) -> GanResult<Self> {
        config.validate()?;
        let attention = AttentionSet::parse(&config.attention)?;
        let layout = discriminator_layout(config.ch, &attention, config.resolution)?;
        layout.check_attention_width(Attention::MIN_CHANNELS)?;
        let rng = determinism::rng_from_optional(config.seed, "st-gan/discriminator");
        let factory = LayerFactory::new(config.parameterization(), config.kernel_size, rng)?;

        let mut stages = Vec::with_capacity(layout.len());
        for (index, spec) in layout.iter().enumerate() {
            let block = DBlock::new(
                &format!("blocks.{index}"),
                spec.in_channels,
                spec.out_channels,
                &factory,
                config.activation,
                index > 0,
                spec.spatial_resize,
            )?;
            let attention = if spec.has_attention {
                tracing::info!(
                    network = "D",
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
            stages.push(DStage { block, attention });
        }
        let features = layout.final_channels();
        let linear = factory.linear("linear", features, config.output_dim, true)?;
        let embed = factory.embedding("embed", config.n_classes, features)?;

        let mut rng = factory.into_rng();
        let mut discriminator = Self {
            layout,
            stages,
            activation: config.activation,
            linear,
            embed,
            optimizer: config.optimizer,
            report: None,
        };
        let init = initialize(
            &mut discriminator,
            &InitPolicy::parse(&config.init),
            &mut rng,
            "D",
        )?;
        discriminator.report = Some(BuildReport::new("D", &discriminator.layout, init));
        Ok(discriminator)
    }

    pub fn layout(&self) -> &LayoutDescriptor {
        &self.layout
    }

    pub fn blocks(&self) -> impl Iterator<Item = &DBlock> + '_ {
        self.stages.iter().map(|stage| &stage.block)
    }

    pub fn output_dim(&self) -> usize {
        self.linear.output_dim()
    }

    pub fn optimizer_settings(&self) -> OptimizerSettings {
        self.optimizer
    }

    pub fn report(&self) -> Option<&BuildReport> {
        self.report.as_ref()
    }

    pub fn param_count(&self) -> usize {
        self.report.as_ref().map_or(0, BuildReport::param_count)
    }

    /// Pooled features `[batch, channels]` after the final activation.
    pub fn features(&self, x: &Tensor) -> PureResult<Tensor> {
        let mut h = x.clone();
        for stage in &self.stages {
            h = stage.block.forward(&h)?;
            if let Some(attention) = &stage.attention {
                h = attention.forward(&h)?;
            }
        }
        self.activation.apply(&h).sum_spatial()
    }

    /// Back-propagates the score gradient `[batch, output_dim]` through the
    /// pass [`Discriminator::forward`] would run for the same inputs,
    /// accumulating every parameter gradient, and returns the gradient with
    /// respect to `x`.
    pub fn backward(
        &mut self,
        x: &Tensor,
        y: Option<&[usize]>,
        grad_output: &Tensor,
    ) -> PureResult<Tensor> {
        let mut block_inputs = Vec::with_capacity(self.stages.len());
        let mut attention_inputs = Vec::with_capacity(self.stages.len());
        let mut h = x.clone();
        for stage in &self.stages {
            let next = stage.block.forward(&h)?;
            block_inputs.push(h);
            h = match &stage.attention {
                Some(attention) => {
                    let attended = attention.forward(&next)?;
                    attention_inputs.push(Some(next));
                    attended
                }
                None => {
                    attention_inputs.push(None);
                    next
                }
            };
        }
        let (batch, channels, height, width) = h.dims4()?;
        let features = self.activation.apply(&h).sum_spatial()?;
        if grad_output.shape() != [batch, self.output_dim()] {
            return Err(TensorError::ShapeMismatch {
                left: vec![batch, self.output_dim()],
                right: grad_output.shape().to_vec(),
            });
        }

        let mut grad_features = self.linear.backward(&features, grad_output)?;
        if let Some(labels) = y {
            if labels.len() != batch {
                return Err(TensorError::ShapeMismatch {
                    left: vec![labels.len()],
                    right: vec![batch],
                });
            }
            // The projection term is added to every output column.
            let grad_projection = grad_output.sum_axis(1, true)?;
            let rows = self.embed.lookup(labels)?;
            grad_features = grad_features.add(&rows.mul_broadcast(&grad_projection)?)?;
            self.embed
                .lookup_backward(labels, &features.mul_broadcast(&grad_projection)?)?;
        }

        let spread = Tensor::zeros(&[batch, channels, height, width])?
            .add_broadcast(&grad_features.reshape(&[batch, channels, 1, 1])?)?;
        let mut grad = self.activation.apply_backward(&h, &spread)?;
        for (index, stage) in self.stages.iter_mut().enumerate().rev() {
            if let (Some(attention), Some(input)) = (&mut stage.attention, &attention_inputs[index]) {
                grad = attention.backward(input, &grad)?;
            }
            grad = stage.block.backward(&block_inputs[index], &grad)?;
        }
        Ok(grad.detach())
    }

    /// Scores `x: [batch, 3, res, res]` as `[batch, output_dim]`. With labels,
    /// the projection term `<embed[y], h>` is added to every output column.
    pub fn forward(&self, x: &Tensor, y: Option<&[usize]>) -> PureResult<Tensor> {
        let h = self.features(x)?;
        let out = self.linear.forward(&h)?;
        let Some(labels) = y else {
            return Ok(out);
        };
        if labels.len() != h.shape()[0] {
            return Err(TensorError::ShapeMismatch {
                left: vec![labels.len()],
                right: vec![h.shape()[0]],
            });
        }
        let projection = self.embed.lookup(labels)?.mul(&h)?.sum_axis(1, true)?;
        out.add_broadcast(&projection)
    }
}

impl Parameterized for Discriminator {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for stage in &self.stages {
            stage.block.visit_parameters(visitor)?;
            stage.attention.visit_parameters(visitor)?;
        }
        self.linear.visit_parameters(visitor)?;
        self.embed.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for stage in &mut self.stages {
            stage.block.visit_parameters_mut(visitor)?;
            stage.attention.visit_parameters_mut(visitor)?;
        }
        self.linear.visit_parameters_mut(visitor)?;
        self.embed.visit_parameters_mut(visitor)
    }

    fn refresh_spectral_state(&mut self) -> PureResult<()> {
        for stage in &mut self.stages {
            stage.block.refresh_spectral_state()?;
            stage.attention.refresh_spectral_state()?;
        }
        self.linear.refresh_spectral_state()?;
        self.embed.refresh_spectral_state()
    }
}
