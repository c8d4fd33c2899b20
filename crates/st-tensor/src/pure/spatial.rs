// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Spatial operators over `[batch, channels, height, width]` tensors.

use super::{PureResult, Tensor, TensorError};
use ndarray::{Array2, Array4, ArrayView4, Axis, Ix4};

fn view4(tensor: &Tensor) -> PureResult<ArrayView4<'_, f32>> {
    tensor
        .data()
        .view()
        .into_dimensionality::<Ix4>()
        .map_err(|_| TensorError::RankMismatch {
            expected: 4,
            got: tensor.ndim(),
        })
}

/// Gradients produced by [`Tensor::conv2d_backward`].
#[derive(Clone, Debug)]
pub struct Conv2dGradients {
    pub input: Tensor,
    pub weight: Tensor,
    pub bias: Tensor,
}

/// Unfolds every receptive field into one row of a
/// `[batch * oh * ow, channels * kh * kw]` matrix.
fn im2col(
    input: &ArrayView4<'_, f32>,
    kh: usize,
    kw: usize,
    padding: usize,
    (oh, ow): (usize, usize),
) -> Array2<f32> {
    let (batch, channels, height, width) = input.dim();
    let pad = padding as isize;
    let mut columns = Array2::<f32>::zeros((batch * oh * ow, channels * kh * kw));
    for b in 0..batch {
        for y in 0..oh {
            for x in 0..ow {
                let mut row = columns.row_mut((b * oh + y) * ow + x);
                let mut col = 0usize;
                for c in 0..channels {
                    for ky in 0..kh {
                        let iy = (y + ky) as isize - pad;
                        for kx in 0..kw {
                            let ix = (x + kx) as isize - pad;
                            if iy >= 0 && ix >= 0 && (iy as usize) < height && (ix as usize) < width
                            {
                                row[col] = input[[b, c, iy as usize, ix as usize]];
                            }
                            col += 1;
                        }
                    }
                }
            }
        }
    }
    columns
}

/// Scatters column gradients back onto the padded input grid.
fn col2im(
    columns: &Array2<f32>,
    (batch, channels, height, width): (usize, usize, usize, usize),
    kh: usize,
    kw: usize,
    padding: usize,
    (oh, ow): (usize, usize),
) -> Array4<f32> {
    let pad = padding as isize;
    let mut grid = Array4::<f32>::zeros((batch, channels, height, width));
    for b in 0..batch {
        for y in 0..oh {
            for x in 0..ow {
                let row = columns.row((b * oh + y) * ow + x);
                let mut col = 0usize;
                for c in 0..channels {
                    for ky in 0..kh {
                        let iy = (y + ky) as isize - pad;
                        for kx in 0..kw {
                            let ix = (x + kx) as isize - pad;
                            if iy >= 0 && ix >= 0 && (iy as usize) < height && (ix as usize) < width
                            {
                                grid[[b, c, iy as usize, ix as usize]] += row[col];
                            }
                            col += 1;
                        }
                    }
                }
            }
        }
    }
    grid
}

fn kernel_matrix(weight: &Tensor, out_channels: usize, span: usize) -> PureResult<Array2<f32>> {
    weight
        .data()
        .as_standard_layout()
        .into_owned()
        .into_shape((out_channels, span))
        .map_err(|_| TensorError::InvalidDimensions {
            shape: weight.shape().to_vec(),
        })
}

fn pool_extent(height: usize, width: usize, kernel: usize) -> PureResult<(usize, usize)> {
    if kernel == 0 || height < kernel || width < kernel {
        return Err(TensorError::InvalidDimensions {
            shape: vec![height, width, kernel],
        });
    }
    Ok((height / kernel, width / kernel))
}

fn expect_shape(tensor: &Tensor, shape: &[usize]) -> PureResult<()> {
    if tensor.shape() != shape {
        return Err(TensorError::ShapeMismatch {
            left: tensor.shape().to_vec(),
            right: shape.to_vec(),
        });
    }
    Ok(())
}

/// Output extent of a stride-one convolution.
pub fn conv_output_extent(size: usize, kernel: usize, padding: usize) -> PureResult<usize> {
    let padded = size + 2 * padding;
    if kernel == 0 || padded < kernel {
        return Err(TensorError::InvalidDimensions {
            shape: vec![padded, kernel],
        });
    }
    Ok(padded - kernel + 1)
}

impl Tensor {
    /// Stride-one 2-D convolution lowered to a single matrix product (im2col).
    ///
    /// `weight` is shaped `[out, in, kh, kw]`, `bias` (when present) `[out]`.
    pub fn conv2d(&self, weight: &Tensor, bias: Option<&Tensor>, padding: usize) -> PureResult<Tensor> {
        let input = view4(self)?;
        let kernel = view4(weight)?;
        let (batch, channels, height, width) = input.dim();
        let (out_channels, in_channels, kh, kw) = kernel.dim();
        if in_channels != channels {
            return Err(TensorError::ShapeMismatch {
                left: self.shape().to_vec(),
                right: weight.shape().to_vec(),
            });
        }
        if let Some(bias) = bias {
            if bias.shape() != [out_channels] {
                return Err(TensorError::ShapeMismatch {
                    left: bias.shape().to_vec(),
                    right: vec![out_channels],
                });
            }
        }
        let oh = conv_output_extent(height, kh, padding)?;
        let ow = conv_output_extent(width, kw, padding)?;
        let columns = im2col(&input, kh, kw, padding, (oh, ow));
        let kernel_rows = kernel_matrix(weight, out_channels, channels * kh * kw)?;
        let mut product = columns.dot(&kernel_rows.t());
        if let Some(bias) = bias {
            let bias = bias
                .data()
                .view()
                .into_dimensionality::<ndarray::Ix1>()
                .map_err(|_| TensorError::RankMismatch {
                    expected: 1,
                    got: bias.ndim(),
                })?;
            product += &bias;
        }
        let output = product
            .into_shape((batch, oh, ow, out_channels))
            .map_err(|_| TensorError::InvalidDimensions {
                shape: vec![batch, oh, ow, out_channels],
            })?
            .permuted_axes([0, 3, 1, 2])
            .as_standard_layout()
            .into_owned()
            .into_dyn();
        let mut operands = vec![weight];
        if let Some(bias) = bias {
            operands.push(bias);
        }
        Ok(self.derive(output, &operands))
    }

    /// Non-overlapping average pooling with a square window.
    pub fn avg_pool2d(&self, kernel: usize) -> PureResult<Tensor> {
        let input = view4(self)?;
        let (batch, channels, height, width) = input.dim();
        let (oh, ow) = pool_extent(height, width, kernel)?;
        let norm = 1.0 / (kernel * kernel) as f32;
        let output = Array4::from_shape_fn((batch, channels, oh, ow), |(b, c, y, x)| {
            let mut acc = 0.0f32;
            for ky in 0..kernel {
                for kx in 0..kernel {
                    acc += input[[b, c, y * kernel + ky, x * kernel + kx]];
                }
            }
            acc * norm
        });
        Ok(self.derive(output.into_dyn(), &[]))
    }

    /// Non-overlapping max pooling with a square window.
    pub fn max_pool2d(&self, kernel: usize) -> PureResult<Tensor> {
        let input = view4(self)?;
        let (batch, channels, height, width) = input.dim();
        let (oh, ow) = pool_extent(height, width, kernel)?;
        let output = Array4::from_shape_fn((batch, channels, oh, ow), |(b, c, y, x)| {
            let mut best = f32::NEG_INFINITY;
            for ky in 0..kernel {
                for kx in 0..kernel {
                    best = best.max(input[[b, c, y * kernel + ky, x * kernel + kx]]);
                }
            }
            best
        });
        Ok(self.derive(output.into_dyn(), &[]))
    }

    /// Nearest-neighbour upsampling by an integer factor.
    pub fn upsample_nearest2d(&self, factor: usize) -> PureResult<Tensor> {
        if factor == 0 {
            return Err(TensorError::InvalidValue {
                label: "upsample_factor",
            });
        }
        let input = view4(self)?;
        let (batch, channels, height, width) = input.dim();
        let output = Array4::from_shape_fn(
            (batch, channels, height * factor, width * factor),
            |(b, c, y, x)| input[[b, c, y / factor, x / factor]],
        );
        Ok(self.derive(output.into_dyn(), &[]))
    }

    /// Gradients of [`Tensor::conv2d`] with respect to its input (`self`),
    /// weight and bias, given the upstream gradient `[batch, out, oh, ow]`.
    pub fn conv2d_backward(
        &self,
        weight: &Tensor,
        padding: usize,
        grad_output: &Tensor,
    ) -> PureResult<Conv2dGradients> {
        let input = view4(self)?;
        let kernel = view4(weight)?;
        let (batch, channels, height, width) = input.dim();
        let (out_channels, in_channels, kh, kw) = kernel.dim();
        if in_channels != channels {
            return Err(TensorError::ShapeMismatch {
                left: self.shape().to_vec(),
                right: weight.shape().to_vec(),
            });
        }
        let oh = conv_output_extent(height, kh, padding)?;
        let ow = conv_output_extent(width, kw, padding)?;
        expect_shape(grad_output, &[batch, out_channels, oh, ow])?;
        let span = channels * kh * kw;

        // [batch * oh * ow, out], rows ordered like the im2col rows.
        let grad = view4(grad_output)?
            .permuted_axes([0, 2, 3, 1])
            .as_standard_layout()
            .into_owned()
            .into_shape((batch * oh * ow, out_channels))
            .map_err(|_| TensorError::InvalidDimensions {
                shape: grad_output.shape().to_vec(),
            })?;
        let columns = im2col(&input, kh, kw, padding, (oh, ow));
        let grad_weight = grad
            .t()
            .dot(&columns)
            .into_shape((out_channels, in_channels, kh, kw))
            .map_err(|_| TensorError::InvalidDimensions {
                shape: weight.shape().to_vec(),
            })?;
        let grad_bias = grad.sum_axis(Axis(0));
        let grad_columns = grad.dot(&kernel_matrix(weight, out_channels, span)?);
        let grad_input = col2im(
            &grad_columns,
            (batch, channels, height, width),
            kh,
            kw,
            padding,
            (oh, ow),
        );
        Ok(Conv2dGradients {
            input: Tensor::from_array(grad_input.into_dyn())?,
            weight: Tensor::from_array(grad_weight.into_dyn())?,
            bias: Tensor::from_array(grad_bias.into_dyn())?,
        })
    }

    /// Gradient of [`Tensor::avg_pool2d`]: each window shares its output
    /// gradient evenly; cropped border rows and columns receive zero.
    pub fn avg_pool2d_backward(&self, kernel: usize, grad_output: &Tensor) -> PureResult<Tensor> {
        let (batch, channels, height, width) = self.dims4()?;
        let (oh, ow) = pool_extent(height, width, kernel)?;
        expect_shape(grad_output, &[batch, channels, oh, ow])?;
        let grad = view4(grad_output)?;
        let norm = 1.0 / (kernel * kernel) as f32;
        let output = Array4::from_shape_fn((batch, channels, height, width), |(b, c, y, x)| {
            let (py, px) = (y / kernel, x / kernel);
            if py < oh && px < ow {
                grad[[b, c, py, px]] * norm
            } else {
                0.0
            }
        });
        Tensor::from_array(output.into_dyn())
    }

    /// Gradient of [`Tensor::max_pool2d`], routed to the first maximum of
    /// every window.
    pub fn max_pool2d_backward(&self, kernel: usize, grad_output: &Tensor) -> PureResult<Tensor> {
        let input = view4(self)?;
        let (batch, channels, height, width) = input.dim();
        let (oh, ow) = pool_extent(height, width, kernel)?;
        expect_shape(grad_output, &[batch, channels, oh, ow])?;
        let grad = view4(grad_output)?;
        let mut output = Array4::<f32>::zeros((batch, channels, height, width));
        for ((b, c, py, px), &upstream) in grad.indexed_iter() {
            let mut best = (f32::NEG_INFINITY, 0usize, 0usize);
            for ky in 0..kernel {
                for kx in 0..kernel {
                    let value = input[[b, c, py * kernel + ky, px * kernel + kx]];
                    if value > best.0 {
                        best = (value, ky, kx);
                    }
                }
            }
            output[[b, c, py * kernel + best.1, px * kernel + best.2]] += upstream;
        }
        Tensor::from_array(output.into_dyn())
    }

    /// Gradient of [`Tensor::upsample_nearest2d`], called on the upstream
    /// gradient: every input pixel collects its `factor × factor` block.
    pub fn upsample_nearest2d_backward(&self, factor: usize) -> PureResult<Tensor> {
        let (_, _, height, width) = self.dims4()?;
        if factor == 0 || height % factor != 0 || width % factor != 0 {
            return Err(TensorError::InvalidDimensions {
                shape: vec![height, width, factor],
            });
        }
        Ok(self.avg_pool2d(factor)?.scale((factor * factor) as f32).detach())
    }

    /// Global sum over the spatial axes: `[b, c, h, w] -> [b, c]`.
    pub fn sum_spatial(&self) -> PureResult<Tensor> {
        self.expect_rank(4)?;
        self.sum_axis(3, false)?.sum_axis(2, false)
    }
}
