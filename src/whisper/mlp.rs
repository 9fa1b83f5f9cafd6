// SPDX-License-Identifier: MIT OR Apache-2.0

//! Position-wise feed-forward sublayer: `fc2(act(fc1(x)))`.

use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::config::Activation;
use crate::error::Result;

/// Two-layer feed-forward network with biases on both projections.
pub struct Mlp {
    /// `[d_model → ffn_dim]`.
    fc1: Linear,
    /// `[ffn_dim → d_model]`.
    fc2: Linear,
    /// Activation between the projections.
    activation: Activation,
}

impl Mlp {
    /// Load `fc1` / `fc2` from the layer-level [`VarBuilder`].
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Model`](crate::DecodeError::Model) if weight
    /// loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(
        d_model: usize,
        ffn_dim: usize,
        activation: Activation,
        vb: VarBuilder<'_>,
    ) -> Result<Self> {
        Ok(Self {
            fc1: candle_nn::linear(d_model, ffn_dim, vb.pp("fc1"))?,
            fc2: candle_nn::linear(ffn_dim, d_model, vb.pp("fc2"))?,
            activation,
        })
    }

    /// # Shapes
    /// - `x`: `[batch, seq, d_model]`
    /// - returns: `[batch, seq, d_model]`
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Model`](crate::DecodeError::Model) on tensor
    /// operation failures.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.fc1.forward(x)?;
        let h = apply_activation(&h, self.activation)?;
        Ok(self.fc2.forward(&h)?)
    }
}

/// Apply an [`Activation`] element-wise.
///
/// # Errors
///
/// Returns [`DecodeError::Model`](crate::DecodeError::Model) on tensor
/// operation failures.
pub fn apply_activation(x: &Tensor, activation: Activation) -> Result<Tensor> {
    Ok(match activation {
        Activation::Gelu => x.gelu_erf()?,
        Activation::GeluApprox => x.gelu()?,
        Activation::Relu => x.relu()?,
    })
}
