// SPDX-License-Identifier: MIT OR Apache-2.0

//! Attention mask construction.
//!
//! Masks are boolean `u8` tensors (`1` = attend, `0` = blocked) shaped
//! `[batch, 1, query_len, key_len]` (batch is `1` when no padding is
//! involved; it broadcasts).  [`mask_to_bias`] converts a mask into the
//! additive bias consumed by attention: `0.0` where attention is allowed
//! and the dtype's minimum finite value elsewhere, so a fully blocked row
//! still produces a finite softmax instead of `NaN`.
//!
//! Three causal regimes are supported through [`Causality`]:
//!
//! - **Bidirectional** (encoder self-attention, decoder cross-attention):
//!   only the padding mask applies.
//! - **Causal without cache**: query `i` sees key `j` iff `j <= i`.
//! - **Causal against a cache** with cursor `c`: the new queries occupy
//!   absolute positions `c..c + query_len`; query `i` sees key `j` iff
//!   `j <= c + i`, and no key at or beyond `c + query_len` is ever visible
//!   (those slots hold stale zeros).

use candle_core::{DType, Device, Tensor};

use crate::error::{DecodeError, Result};

// ---------------------------------------------------------------------------
// Causality
// ---------------------------------------------------------------------------

/// Positional constraint applied on top of the padding mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Causality {
    /// No positional constraint (cross-attention, encoder).
    Bidirectional,
    /// Causal mask over a sequence processed in one pass, no cache.
    Causal,
    /// Causal mask against a KV cache whose cursor was `cursor` before the
    /// current queries were written.
    CausalCached {
        /// Number of positions already in the cache before this call.
        cursor: usize,
    },
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Build the combined attention mask for one attention call.
///
/// Returns `None` when nothing is masked (bidirectional without padding),
/// meaning "all positions valid".
///
/// # Shapes
/// - `padding`: `[batch, key_len]`, nonzero = valid key
/// - returns: `[batch, 1, query_len, key_len]` (`batch = 1` without padding)
///
/// # Errors
///
/// Returns [`DecodeError::ShapeMismatch`] if `padding` is not
/// `[batch, key_len]`, and [`DecodeError::Config`] if a cached causal mask
/// would address positions beyond `key_len`.
pub fn build_attention_mask(
    query_len: usize,
    key_len: usize,
    padding: Option<&Tensor>,
    causality: Causality,
    device: &Device,
) -> Result<Option<Tensor>> {
    let positional = match causality {
        Causality::Bidirectional => None,
        Causality::Causal => Some(causal_mask(query_len, key_len, 0, device)?),
        Causality::CausalCached { cursor } => {
            let filled = cursor + query_len;
            if filled > key_len {
                return Err(DecodeError::Config(format!(
                    "cached mask covers {filled} positions but key length is {key_len}"
                )));
            }
            let causal = causal_mask(query_len, key_len, cursor, device)?;
            let written = filled_mask(query_len, key_len, filled, device)?;
            Some(causal.mul(&written)?)
        }
    };

    let padding = padding
        .map(|p| padding_mask(p, query_len, key_len))
        .transpose()?;

    match (positional, padding) {
        (None, None) => Ok(None),
        (Some(mask), None) | (None, Some(mask)) => Ok(Some(mask)),
        (Some(positional), Some(padding)) => Ok(Some(padding.broadcast_mul(&positional)?)),
    }
}

/// Causal mask where query `i` sees key `j` iff `j <= offset + i`.
///
/// With `offset = 0` and `key_len = query_len` this is the classic lower
/// triangle; with `offset = cursor` it is the same triangle shifted so it
/// lines up with absolute cache positions, leaving all earlier (already
/// cached) keys visible.
///
/// # Shapes
/// - returns: `[1, 1, query_len, key_len]`, dtype `u8`
///
/// # Errors
///
/// Returns [`DecodeError::Model`] on tensor creation failure.
pub fn causal_mask(
    query_len: usize,
    key_len: usize,
    offset: usize,
    device: &Device,
) -> Result<Tensor> {
    let data: Vec<u8> = (0..query_len)
        .flat_map(|i| (0..key_len).map(move |j| u8::from(j <= offset + i)))
        .collect();
    Ok(Tensor::from_vec(data, (1, 1, query_len, key_len), device)?)
}

/// Mask exposing only the first `filled` key positions.
///
/// # Shapes
/// - returns: `[1, 1, query_len, key_len]`, dtype `u8`
///
/// # Errors
///
/// Returns [`DecodeError::Model`] on tensor creation failure.
pub fn filled_mask(
    query_len: usize,
    key_len: usize,
    filled: usize,
    device: &Device,
) -> Result<Tensor> {
    let row: Vec<u8> = (0..key_len).map(|j| u8::from(j < filled)).collect();
    let data: Vec<u8> = (0..query_len).flat_map(|_| row.iter().copied()).collect();
    Ok(Tensor::from_vec(data, (1, 1, query_len, key_len), device)?)
}

/// Expand a `[batch, key_len]` padding indicator into a boolean mask.
///
/// Any nonzero entry marks a valid key.
///
/// # Shapes
/// - `padding`: `[batch, key_len]`
/// - returns: `[batch, 1, query_len, key_len]`, dtype `u8`
///
/// # Errors
///
/// Returns [`DecodeError::ShapeMismatch`] if `padding` is not rank 2 with
/// `key_len` columns.
pub fn padding_mask(padding: &Tensor, query_len: usize, key_len: usize) -> Result<Tensor> {
    let (batch, padded_len) = padding.dims2().map_err(|_| {
        DecodeError::ShapeMismatch(format!(
            "padding mask: expected [batch, {key_len}], got {:?}",
            padding.dims()
        ))
    })?;
    if padded_len != key_len {
        return Err(DecodeError::ShapeMismatch(format!(
            "padding mask: expected key length {key_len}, got {padded_len}"
        )));
    }

    let rows = padding.to_dtype(DType::F32)?.to_vec2::<f32>()?;
    let mut data = Vec::with_capacity(batch * query_len * key_len);
    for row in &rows {
        for _ in 0..query_len {
            data.extend(row.iter().map(|&v| u8::from(v != 0.0)));
        }
    }
    Ok(Tensor::from_vec(
        data,
        (batch, 1, query_len, key_len),
        padding.device(),
    )?)
}

// ---------------------------------------------------------------------------
// Bias conversion
// ---------------------------------------------------------------------------

/// Smallest finite value representable in `dtype`.
///
/// Masked scores receive exactly this bias so their post-softmax weight
/// underflows to zero without producing `-inf - -inf = NaN` on fully
/// masked rows.
#[must_use]
pub fn dtype_min(dtype: DType) -> f64 {
    match dtype {
        DType::F16 => -65_504.0,
        DType::BF16 => -3.389_531_389_251_535_5e38,
        DType::F64 => f64::MIN,
        _ => f64::from(f32::MIN),
    }
}

/// Convert a boolean mask into an additive attention bias.
///
/// # Shapes
/// - `mask`: any shape, `1` = allowed
/// - returns: same shape in `dtype`; `0.0` where allowed, [`dtype_min`]
///   elsewhere
///
/// # Errors
///
/// Returns [`DecodeError::Model`] on tensor operation failures.
pub fn mask_to_bias(mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let min = dtype_min(dtype);
    if dtype == DType::F64 {
        return Ok(mask.to_dtype(DType::F64)?.affine(-min, min)?);
    }
    // PROMOTE: build the bias in F32 so `1 * -min + min` cancels exactly,
    // then narrow to the compute dtype (the constants are exact there).
    let bias = mask.to_dtype(DType::F32)?.affine(-min, min)?;
    Ok(bias.to_dtype(dtype)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
