// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Layer constructors shared by a whole network.
//!
//! A [`LayerFactory`] fixes the weight parameterisation (spectral or plain),
//! the default kernel size and the random stream every layer is drawn from,
//! so the blocks of a network only name their channel counts.

use super::{Conv2d, Embedding, Linear, SpectralNorm};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use st_tensor::{PureResult, TensorError};
use std::cell::RefCell;

pub const DEFAULT_SN_EPS: f32 = 1e-8;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Parameterization {
    /// Weights divided by a power-iteration estimate of their top singular value.
    Spectral {
        num_svs: usize,
        num_itrs: usize,
        eps: f32,
    },
    Plain,
}

impl Parameterization {
    pub fn spectral(num_svs: usize, num_itrs: usize) -> Self {
        Parameterization::Spectral {
            num_svs,
            num_itrs,
            eps: DEFAULT_SN_EPS,
        }
    }

    pub fn is_spectral(&self) -> bool {
        matches!(self, Parameterization::Spectral { .. })
    }
}

#[derive(Debug)]
pub struct LayerFactory {
    param: Parameterization,
    kernel_size: usize,
    rng: RefCell<StdRng>,
}

impl LayerFactory {
    /// `kernel_size` must be odd so that `padding = kernel_size / 2` keeps the
    /// spatial size.
    pub fn new(param: Parameterization, kernel_size: usize, rng: StdRng) -> PureResult<Self> {
        if kernel_size == 0 || kernel_size % 2 == 0 {
            return Err(TensorError::InvalidValue {
                label: "kernel_size",
            });
        }
        if let Parameterization::Spectral {
            num_svs,
            num_itrs,
            eps,
        } = param
        {
            if num_svs == 0 || num_itrs == 0 || !(eps > 0.0) {
                return Err(TensorError::InvalidValue {
                    label: "spectral_settings",
                });
            }
        }
        Ok(Self {
            param,
            kernel_size,
            rng: RefCell::new(rng),
        })
    }

    pub fn seeded(param: Parameterization, kernel_size: usize, seed: u64) -> PureResult<Self> {
        Self::new(param, kernel_size, StdRng::seed_from_u64(seed))
    }

    pub fn parameterization(&self) -> Parameterization {
        self.param
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    /// Hands the underlying stream to a caller (for example the init pass).
    pub fn into_rng(self) -> StdRng {
        self.rng.into_inner()
    }

    fn spectral(&self, rows: usize) -> PureResult<Option<SpectralNorm>> {
        match self.param {
            Parameterization::Spectral {
                num_svs,
                num_itrs,
                eps,
            } => {
                let mut rng = self.rng.borrow_mut();
                // Narrow layers track as many singular values as they have rows.
                SpectralNorm::new(rows, num_svs.min(rows), num_itrs, eps, &mut *rng).map(Some)
            }
            Parameterization::Plain => Ok(None),
        }
    }

    /// Convolution with the factory kernel, same padding and a bias.
    pub fn conv(&self, name: &str, in_channels: usize, out_channels: usize) -> PureResult<Conv2d> {
        self.conv_with(
            name,
            in_channels,
            out_channels,
            self.kernel_size,
            self.kernel_size / 2,
            true,
        )
    }

    pub fn conv_with(
        &self,
        name: &str,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        padding: usize,
        bias: bool,
    ) -> PureResult<Conv2d> {
        let spectral = self.spectral(out_channels)?;
        let mut rng = self.rng.borrow_mut();
        Conv2d::new(
            name,
            in_channels,
            out_channels,
            kernel,
            padding,
            bias,
            spectral,
            &mut *rng,
        )
    }

    pub fn linear(
        &self,
        name: &str,
        input_dim: usize,
        output_dim: usize,
        bias: bool,
    ) -> PureResult<Linear> {
        let spectral = self.spectral(output_dim)?;
        let mut rng = self.rng.borrow_mut();
        Linear::new(name, input_dim, output_dim, bias, spectral, &mut *rng)
    }

    pub fn embedding(
        &self,
        name: &str,
        num_embeddings: usize,
        embed_dim: usize,
    ) -> PureResult<Embedding> {
        let spectral = self.spectral(num_embeddings)?;
        let mut rng = self.rng.borrow_mut();
        Embedding::new(name, num_embeddings, embed_dim, spectral, &mut *rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Module, Parameterized};
    use st_tensor::Tensor;

    #[test]
    fn same_seed_builds_identical_layers() {
        let a = LayerFactory::seeded(Parameterization::spectral(1, 1), 3, 9).unwrap();
        let b = LayerFactory::seeded(Parameterization::spectral(1, 1), 3, 9).unwrap();
        let ca = a.conv("c", 2, 4).unwrap();
        let cb = b.conv("c", 2, 4).unwrap();
        assert_eq!(ca.state_dict().unwrap(), cb.state_dict().unwrap());
        assert_eq!(ca.kernel(), 3);
        assert_eq!(ca.padding(), 1);
        assert!(ca.spectral().is_some());
    }

    #[test]
    fn plain_layers_skip_spectral_state() {
        let f = LayerFactory::seeded(Parameterization::Plain, 5, 1).unwrap();
        let conv = f.conv("c", 1, 2).unwrap();
        assert!(conv.spectral().is_none());
        assert_eq!(conv.padding(), 2);
        let x = Tensor::full(&[1, 1, 6, 6], 1.0).unwrap();
        assert_eq!(conv.forward(&x).unwrap().shape(), &[1, 2, 6, 6]);
        let fc = f.linear("fc", 3, 2, false).unwrap();
        assert!(fc.bias().is_none());
    }

    #[test]
    fn even_kernels_and_bad_spectral_settings_fail() {
        assert!(LayerFactory::seeded(Parameterization::Plain, 4, 0).is_err());
        let bad = Parameterization::Spectral {
            num_svs: 1,
            num_itrs: 0,
            eps: 1e-8,
        };
        assert!(LayerFactory::seeded(bad, 3, 0).is_err());
    }

    #[test]
    fn parameterization_serde_is_tagged() {
        let json = serde_json::to_string(&Parameterization::Plain).unwrap();
        assert_eq!(json, r#"{"kind":"plain"}"#);
        let back: Parameterization =
            serde_json::from_str(r#"{"kind":"spectral","num_svs":2,"num_itrs":1,"eps":1e-6}"#)
                .unwrap();
        assert_eq!(
            back,
            Parameterization::Spectral {
                num_svs: 2,
                num_itrs: 1,
                eps: 1e-6
            }
        );
    }
}
