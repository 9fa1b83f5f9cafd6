// SPDX-License-Identifier: MIT OR Apache-2.0

//! Multi-head attention shared by every Whisper attention sublayer.
//!
//! One [`Attention`] type covers the three uses:
//! - encoder self-attention (bidirectional, uncached),
//! - decoder self-attention (causal, cached through a [`KvCacheEntry`]),
//! - decoder cross-attention (bidirectional over encoder states, uncached).
//!
//! Keys and values are projected straight into the cache layout
//! `[batch, heads, head_dim, len]`, so a cached sublayer writes its new
//! positions and then attends over the whole preallocated buffer, with the
//! mask hiding every slot at or beyond the new cursor.

use candle_core::{DType, Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::cache::KvCacheEntry;
use crate::error::{DecodeError, Result};
use crate::util::masks::{Causality, build_attention_mask, mask_to_bias};

// ---------------------------------------------------------------------------
// Attention
// ---------------------------------------------------------------------------

/// Multi-head scaled dot-product attention with Whisper's projection layout.
///
/// `k_proj` carries no bias; `q_proj`, `v_proj` and `out_proj` do.
pub struct Attention {
    /// Query projection.
    q_proj: Linear,
    /// Key projection (no bias).
    k_proj: Linear,
    /// Value projection.
    v_proj: Linear,
    /// Output projection.
    out_proj: Linear,
    /// Embedding width.
    embed_dim: usize,
    /// Number of heads.
    num_heads: usize,
    /// Width of one head.
    head_dim: usize,
    /// `1 / sqrt(head_dim)`.
    scale: f64,
    /// Whether queries may only see earlier positions.
    causal: bool,
}

impl Attention {
    /// Load attention weights from a [`VarBuilder`].
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Config`] if `embed_dim` is not divisible by
    /// `num_heads`, or [`DecodeError::Model`] if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(
        embed_dim: usize,
        num_heads: usize,
        causal: bool,
        vb: VarBuilder<'_>,
    ) -> Result<Self> {
        if num_heads == 0 || embed_dim % num_heads != 0 {
            return Err(DecodeError::Config(format!(
                "embed_dim must be divisible by num_heads (got embed_dim: {embed_dim} \
                 and num_heads: {num_heads})"
            )));
        }
        let head_dim = embed_dim / num_heads;

        let q_proj = candle_nn::linear(embed_dim, embed_dim, vb.pp("q_proj"))?;
        let k_proj = candle_nn::linear_no_bias(embed_dim, embed_dim, vb.pp("k_proj"))?;
        let v_proj = candle_nn::linear(embed_dim, embed_dim, vb.pp("v_proj"))?;
        let out_proj = candle_nn::linear(embed_dim, embed_dim, vb.pp("out_proj"))?;

        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let scale = 1.0 / (head_dim as f64).sqrt();

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            out_proj,
            embed_dim,
            num_heads,
            head_dim,
            scale,
            causal,
        })
    }

    /// Number of heads.
    pub const fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Width of one head.
    pub const fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Attention forward pass; see [`forward_with_weights`](Self::forward_with_weights).
    ///
    /// # Errors
    ///
    /// Same as [`forward_with_weights`](Self::forward_with_weights).
    pub fn forward(
        &self,
        hidden: &Tensor,
        key_value_states: Option<&Tensor>,
        padding: Option<&Tensor>,
        cache: Option<&mut KvCacheEntry>,
    ) -> Result<Tensor> {
        self.forward_with_weights(hidden, key_value_states, padding, cache)
            .map(|(output, _)| output)
    }

    /// Attention forward pass that also returns the attention weights.
    ///
    /// With a cache, the new keys/values are written first (one position
    /// appends, several positions prefill) and the queries attend over the
    /// full buffer; the weights then span `max_len` key positions and are
    /// exactly zero beyond the new cursor.
    ///
    /// # Shapes
    /// - `hidden`: `[batch, q_len, embed_dim]`
    /// - `key_value_states`: `[batch, kv_len, embed_dim]` (cross-attention)
    /// - `padding`: `[batch, key_len]`, nonzero = valid
    /// - returns: `([batch, q_len, embed_dim], [batch, heads, q_len, key_len])`
    ///
    /// # Errors
    ///
    /// - [`DecodeError::ShapeMismatch`] if an input is not rank 3 or its
    ///   width differs from `embed_dim`.
    /// - [`DecodeError::CacheMisuse`] if a cache is passed to non-causal
    ///   attention, or by the cache write itself.
    /// - [`DecodeError::Model`] on tensor operation failures.
    pub fn forward_with_weights(
        &self,
        hidden: &Tensor,
        key_value_states: Option<&Tensor>,
        padding: Option<&Tensor>,
        cache: Option<&mut KvCacheEntry>,
    ) -> Result<(Tensor, Tensor)> {
        let (batch, q_len) = self.check_input("hidden", hidden)?;
        let kv_source = key_value_states.unwrap_or(hidden);
        let (kv_batch, kv_len) = self.check_input("key_value_states", kv_source)?;
        if kv_batch != batch {
            return Err(DecodeError::ShapeMismatch(format!(
                "key_value_states batch {kv_batch} differs from hidden batch {batch}"
            )));
        }

        // [batch, q_len, embed] → [batch, heads, q_len, head_dim]
        let q = self
            .q_proj
            .forward(hidden)?
            .reshape((batch, q_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        // [batch, kv_len, embed] → [batch, heads, head_dim, kv_len]
        let k = self.split_kv(&self.k_proj.forward(kv_source)?, batch, kv_len)?;
        let v = self.split_kv(&self.v_proj.forward(kv_source)?, batch, kv_len)?;

        let (output, weights) = match cache {
            Some(cache) => {
                if !self.causal || key_value_states.is_some() {
                    return Err(DecodeError::CacheMisuse(
                        "KV cache supplied to a non-causal attention sublayer".into(),
                    ));
                }
                let cursor = cache.write(&k, &v)?;
                let (keys, values) = cache.buffers();
                let mask = build_attention_mask(
                    q_len,
                    cache.max_len(),
                    padding,
                    Causality::CausalCached { cursor },
                    hidden.device(),
                )?;
                scaled_dot_product_attention(&q, keys, values, mask.as_ref(), self.scale)?
            }
            None => {
                let causality = if self.causal {
                    Causality::Causal
                } else {
                    Causality::Bidirectional
                };
                let mask = build_attention_mask(q_len, kv_len, padding, causality, hidden.device())?;
                scaled_dot_product_attention(&q, &k, &v, mask.as_ref(), self.scale)?
            }
        };

        // [batch, heads, q_len, head_dim] → [batch, q_len, embed]
        let output = output
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, q_len, self.embed_dim))?;
        Ok((self.out_proj.forward(&output)?, weights))
    }

    /// Reshape a key/value projection into the cache layout.
    ///
    /// # Shapes
    /// - `x`: `[batch, len, embed_dim]`
    /// - returns: `[batch, heads, head_dim, len]`
    fn split_kv(&self, x: &Tensor, batch: usize, len: usize) -> Result<Tensor> {
        // CONTIGUOUS: the cache write and the score matmul both need a dense layout
        Ok(x.reshape((batch, len, self.num_heads, self.head_dim))?
            .permute((0, 2, 3, 1))?
            .contiguous()?)
    }

    /// Validate a `[batch, len, embed_dim]` input; returns `(batch, len)`.
    fn check_input(&self, name: &str, x: &Tensor) -> Result<(usize, usize)> {
        match x.dims() {
            &[batch, len, width] if width == self.embed_dim => Ok((batch, len)),
            dims => Err(DecodeError::ShapeMismatch(format!(
                "{name}: expected [batch, len, {}], got {dims:?}",
                self.embed_dim
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Scaled dot-product attention
// ---------------------------------------------------------------------------

/// `softmax(q · k / sqrt(d) + bias) · v` with keys in cache layout.
///
/// Masked positions receive the F32 minimum before a max-subtracted
/// softmax, so their weights underflow to exactly zero.
///
/// # Shapes
/// - `q`: `[batch, heads, q_len, head_dim]`
/// - `keys`, `values`: `[batch, heads, head_dim, key_len]`
/// - `mask`: broadcastable to `[batch, 1, q_len, key_len]`
/// - returns: `(output [batch, heads, q_len, head_dim], weights [batch, heads, q_len, key_len])`
///
/// # Errors
///
/// Returns [`DecodeError::Model`] on tensor operation failures.
pub fn scaled_dot_product_attention(
    q: &Tensor,
    keys: &Tensor,
    values: &Tensor,
    mask: Option<&Tensor>,
    scale: f64,
) -> Result<(Tensor, Tensor)> {
    let original_dtype = q.dtype();

    // CONTIGUOUS: transpose produces non-unit strides; matmul requires contiguous layout
    let scores = (q.contiguous()?.matmul(keys)? * scale)?;

    // PROMOTE: softmax over F16/BF16 can produce NaN; compute in F32
    let mut scores = scores.to_dtype(DType::F32)?;
    if let Some(mask) = mask {
        scores = scores.broadcast_add(&mask_to_bias(mask, DType::F32)?)?;
    }
    let weights = candle_nn::ops::softmax_last_dim(&scores)?.to_dtype(original_dtype)?;

    let values_t = values.transpose(2, 3)?.contiguous()?;
    let output = weights.matmul(&values_t)?;
    Ok((output, weights))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
