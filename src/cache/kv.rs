// SPDX-License-Identifier: MIT OR Apache-2.0

//! Preallocated key/value cache for incremental decoder self-attention.
//!
//! Each decoder layer owns one [`KvCacheEntry`].  The entry is allocated
//! once per generation call with a fixed capacity `max_len` and written in
//! place: a prompt is loaded in one [`prefill`](KvCacheEntry::prefill),
//! every later token with [`append_step`](KvCacheEntry::append_step).
//! Positions are absolute, so the write cursor doubles as the position of
//! the next token and as the boundary the mask builder uses to hide stale
//! slots.
//!
//! ## Memory Layout
//!
//! - keys: `[batch, heads, head_dim, max_len]`
//! - values: `[batch, heads, head_dim, max_len]`
//!
//! Keys stored this way are already transposed for `q · kᵀ`, so the
//! attention block multiplies against the buffer directly.
//!
//! ## Memory Estimation
//!
//! For whisper-large (32 decoder layers, 20 heads, `head_dim` 64, F16) with
//! `max_len = 448`: `32 * 2 * 20 * 64 * 448 * 2` bytes ≈ 73 MB per batch row.

use std::fmt;

use candle_core::{DType, Device, Tensor};

use crate::error::{DecodeError, Result};

/// Axis of the cache buffers that indexes absolute position.
const POSITION_DIM: usize = 3;

// ---------------------------------------------------------------------------
// CacheState
// ---------------------------------------------------------------------------

/// Lifecycle of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Nothing written yet; a prefill is still allowed.
    Empty,
    /// A multi-position prefill has been written.
    Prefilled,
    /// At least one single-step append has been written.
    Decoding,
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty"),
            Self::Prefilled => write!(f, "prefilled"),
            Self::Decoding => write!(f, "decoding"),
        }
    }
}

// ---------------------------------------------------------------------------
// KvCacheEntry
// ---------------------------------------------------------------------------

/// Key/value store for one decoder self-attention sublayer.
///
/// Positions `>= cursor` hold zeros and must be masked by the caller.
///
/// Not `Clone`: the buffers are mutated in place, so a shallow clone would
/// alias the same storage.
#[derive(Debug)]
pub struct KvCacheEntry {
    /// Keys: `[batch, heads, head_dim, max_len]`.
    keys: Tensor,
    /// Values: `[batch, heads, head_dim, max_len]`.
    values: Tensor,
    /// Number of positions written so far.
    cursor: usize,
    /// Capacity in positions.
    max_len: usize,
    /// Lifecycle flag.
    state: CacheState,
}

impl KvCacheEntry {
    /// Allocate a zero-filled entry.
    ///
    /// # Shapes
    /// - keys / values: `[batch, num_heads, head_dim, max_len]`
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Model`] if allocation fails.
    pub fn new(
        batch: usize,
        num_heads: usize,
        head_dim: usize,
        max_len: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let shape = (batch, num_heads, head_dim, max_len);
        Ok(Self {
            keys: Tensor::zeros(shape, dtype, device)?,
            values: Tensor::zeros(shape, dtype, device)?,
            cursor: 0,
            max_len,
            state: CacheState::Empty,
        })
    }

    /// Write the first `N` positions in one pass and set `cursor = N`.
    ///
    /// # Shapes
    /// - `keys`, `values`: `[batch, heads, head_dim, N]`
    ///
    /// # Errors
    ///
    /// - [`DecodeError::CacheMisuse`] if anything was already written.
    /// - [`DecodeError::Config`] if `N > max_len`.
    /// - [`DecodeError::ShapeMismatch`] if the leading dimensions disagree
    ///   with the cache or `N == 0`.
    pub fn prefill(&mut self, keys: &Tensor, values: &Tensor) -> Result<()> {
        if self.state != CacheState::Empty || self.cursor != 0 {
            return Err(DecodeError::CacheMisuse(format!(
                "prefill after steps already written (cursor = {}, state = {})",
                self.cursor, self.state
            )));
        }
        let n = self.check_update(keys, values)?;
        if n == 0 {
            return Err(DecodeError::ShapeMismatch(
                "prefill requires at least one position".into(),
            ));
        }
        if n > self.max_len {
            return Err(DecodeError::Config(format!(
                "prompt of {n} positions exceeds cache capacity {}",
                self.max_len
            )));
        }
        self.write_at(keys, values, 0)?;
        self.cursor = n;
        self.state = CacheState::Prefilled;
        Ok(())
    }

    /// Write one position at `cursor` and advance the cursor by one.
    ///
    /// # Shapes
    /// - `key`, `value`: `[batch, heads, head_dim, 1]`
    ///
    /// # Errors
    ///
    /// - [`DecodeError::CacheMisuse`] if `cursor >= max_len`.
    /// - [`DecodeError::ShapeMismatch`] if the update is not exactly one
    ///   position or its leading dimensions disagree with the cache.
    pub fn append_step(&mut self, key: &Tensor, value: &Tensor) -> Result<()> {
        let n = self.check_update(key, value)?;
        if n != 1 {
            return Err(DecodeError::ShapeMismatch(format!(
                "append_step expects exactly 1 position, got {n}"
            )));
        }
        if self.cursor >= self.max_len {
            return Err(DecodeError::CacheMisuse(format!(
                "append_step at cursor {} exceeds capacity {}",
                self.cursor, self.max_len
            )));
        }
        self.write_at(key, value, self.cursor)?;
        self.cursor += 1;
        self.state = CacheState::Decoding;
        Ok(())
    }

    /// Route an update of `N` positions: one position appends, several
    /// positions prefill.
    ///
    /// Returns the cursor *before* the write, i.e. the absolute position of
    /// the first written slot.
    ///
    /// # Errors
    ///
    /// Propagates the errors of [`prefill`](Self::prefill) and
    /// [`append_step`](Self::append_step).
    pub fn write(&mut self, keys: &Tensor, values: &Tensor) -> Result<usize> {
        let start = self.cursor;
        if keys.dim(POSITION_DIM)? == 1 {
            self.append_step(keys, values)?;
        } else {
            self.prefill(keys, values)?;
        }
        Ok(start)
    }

    /// Logical contents: positions `[0, cursor)`.
    ///
    /// # Shapes
    /// - returns: `(keys, values)`, each `[batch, heads, head_dim, cursor]`
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Model`] on tensor operation failures.
    pub fn read(&self) -> Result<(Tensor, Tensor)> {
        Ok((
            self.keys.narrow(POSITION_DIM, 0, self.cursor)?,
            self.values.narrow(POSITION_DIM, 0, self.cursor)?,
        ))
    }

    /// Full preallocated buffers, including unwritten slots.
    ///
    /// Callers must mask every position `>= cursor`.
    pub const fn buffers(&self) -> (&Tensor, &Tensor) {
        (&self.keys, &self.values)
    }

    /// Number of positions written.
    pub const fn cursor(&self) -> usize {
        self.cursor
    }

    /// Capacity in positions.
    pub const fn max_len(&self) -> usize {
        self.max_len
    }

    /// Positions still available.
    pub const fn remaining(&self) -> usize {
        self.max_len.saturating_sub(self.cursor)
    }

    /// Current lifecycle state.
    pub const fn state(&self) -> CacheState {
        self.state
    }

    /// Whether nothing has been written yet.
    pub const fn is_empty(&self) -> bool {
        self.cursor == 0
    }

    /// Bytes held by both buffers.
    pub fn memory_usage(&self) -> usize {
        (self.keys.elem_count() + self.values.elem_count()) * self.keys.dtype().size_in_bytes()
    }

    /// Validate an update against the buffer layout; returns its length.
    fn check_update(&self, keys: &Tensor, values: &Tensor) -> Result<usize> {
        if keys.dims() != values.dims() {
            return Err(DecodeError::ShapeMismatch(format!(
                "keys {:?} and values {:?} must have the same shape",
                keys.dims(),
                values.dims()
            )));
        }
        let (batch, heads, head_dim, _) = self.keys.dims4()?;
        let (b, h, d, n) = keys.dims4().map_err(|_| {
            DecodeError::ShapeMismatch(format!(
                "cache update: expected [batch, heads, head_dim, n], got {:?}",
                keys.dims()
            ))
        })?;
        if (b, h, d) != (batch, heads, head_dim) {
            return Err(DecodeError::ShapeMismatch(format!(
                "cache update: expected [{batch}, {heads}, {head_dim}, n], got [{b}, {h}, {d}, {n}]"
            )));
        }
        Ok(n)
    }

    /// In-place bounded write starting at absolute position `offset`.
    fn write_at(&self, keys: &Tensor, values: &Tensor, offset: usize) -> Result<()> {
        // CONTIGUOUS: slice_set copies raw blocks and needs a contiguous source
        self.keys
            .slice_set(&keys.contiguous()?, POSITION_DIM, offset)?;
        self.values
            .slice_set(&values.contiguous()?, POSITION_DIM, offset)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DecoderKvCache
// ---------------------------------------------------------------------------

/// One [`KvCacheEntry`] per decoder layer, owned by a single generation call.
#[derive(Debug)]
pub struct DecoderKvCache {
    /// Per-layer entries.
    layers: Vec<KvCacheEntry>,
    /// Shared capacity.
    max_len: usize,
}

impl DecoderKvCache {
    /// Allocate a cache for `n_layers` decoder layers.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Model`] if allocation fails.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        n_layers: usize,
        batch: usize,
        num_heads: usize,
        head_dim: usize,
        max_len: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let layers = (0..n_layers)
            .map(|_| KvCacheEntry::new(batch, num_heads, head_dim, max_len, dtype, device))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers, max_len })
    }

    /// Number of layers in the cache.
    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    /// Shared capacity in positions.
    pub const fn max_len(&self) -> usize {
        self.max_len
    }

    /// Write cursor (positions written), read from the first layer.
    pub fn cursor(&self) -> usize {
        self.layers.first().map_or(0, KvCacheEntry::cursor)
    }

    /// Positions still available.
    pub fn remaining(&self) -> usize {
        self.max_len.saturating_sub(self.cursor())
    }

    /// Whether no layer has been written.
    pub fn is_empty(&self) -> bool {
        self.layers.iter().all(KvCacheEntry::is_empty)
    }

    /// Whether every layer has advanced to the same cursor.
    ///
    /// A partial decoder pass (an error halfway through the layer stack)
    /// leaves the cache inconsistent; such a cache must be discarded.
    pub fn is_consistent(&self) -> bool {
        let cursor = self.cursor();
        self.layers.iter().all(|l| l.cursor() == cursor)
    }

    /// Entry for a specific layer.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::CacheMisuse`] if `layer` is out of range.
    pub fn layer(&self, layer: usize) -> Result<&KvCacheEntry> {
        let n_layers = self.layers.len();
        self.layers.get(layer).ok_or_else(|| {
            DecodeError::CacheMisuse(format!(
                "layer {layer} out of range for KV cache with {n_layers} layers"
            ))
        })
    }

    /// Mutable entry for a specific layer.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::CacheMisuse`] if `layer` is out of range.
    pub fn layer_mut(&mut self, layer: usize) -> Result<&mut KvCacheEntry> {
        let n_layers = self.layers.len();
        self.layers.get_mut(layer).ok_or_else(|| {
            DecodeError::CacheMisuse(format!(
                "layer {layer} out of range for KV cache with {n_layers} layers"
            ))
        })
    }

    /// Logical contents of one layer: positions `[0, cursor)`.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::CacheMisuse`] if `layer` is out of range.
    pub fn read(&self, layer: usize) -> Result<(Tensor, Tensor)> {
        self.layer(layer)?.read()
    }

    /// Bytes held by all layers.
    pub fn memory_usage(&self) -> usize {
        self.layers.iter().map(KvCacheEntry::memory_usage).sum()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    /// Deterministic `[1, 2, 3, n]` block whose values encode their position.
    fn block(start: usize, n: usize) -> Tensor {
        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let data: Vec<f32> = (0..6)
            .flat_map(|row| (start..start + n).map(move |p| (row * 100 + p + 1) as f32))
            .collect();
        Tensor::from_vec(data, (1, 2, 3, n), &Device::Cpu).unwrap()
    }

    fn entry(max_len: usize) -> KvCacheEntry {
        KvCacheEntry::new(1, 2, 3, max_len, DType::F32, &Device::Cpu).unwrap()
    }

    fn to_vec(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn new_entry_is_empty() {
        let cache = entry(8);
        assert_eq!(cache.cursor(), 0);
        assert_eq!(cache.remaining(), 8);
        assert_eq!(cache.state(), CacheState::Empty);
        assert!(cache.is_empty());
        assert_eq!(cache.memory_usage(), 2 * 2 * 3 * 8 * 4);
    }

    #[test]
    fn prefill_sets_cursor_and_read_returns_prefix() {
        let mut cache = entry(8);
        cache.prefill(&block(0, 3), &block(0, 3)).unwrap();
        assert_eq!(cache.cursor(), 3);
        assert_eq!(cache.state(), CacheState::Prefilled);

        let (k, v) = cache.read().unwrap();
        assert_eq!(k.dims(), &[1, 2, 3, 3]);
        assert_eq!(to_vec(&k), to_vec(&block(0, 3)));
        assert_eq!(to_vec(&v), to_vec(&block(0, 3)));
    }

    #[test]
    fn unwritten_slots_stay_zero() {
        let mut cache = entry(4);
        cache.append_step(&block(0, 1), &block(0, 1)).unwrap();
        let (keys, _) = cache.buffers();
        let tail = keys.narrow(3, 1, 3).unwrap();
        assert!(to_vec(&tail).iter().all(|&x| x == 0.0));
    }

    #[test]
    fn append_after_prefill_advances_by_one() {
        let mut cache = entry(8);
        cache.prefill(&block(0, 2), &block(0, 2)).unwrap();
        cache.append_step(&block(2, 1), &block(2, 1)).unwrap();
        assert_eq!(cache.cursor(), 3);
        assert_eq!(cache.state(), CacheState::Decoding);
    }

    #[test]
    fn prefill_plus_steps_matches_single_prefill() {
        let mut stepped = entry(6);
        stepped.prefill(&block(0, 2), &block(0, 2)).unwrap();
        for p in 2..5 {
            stepped.append_step(&block(p, 1), &block(p, 1)).unwrap();
        }

        let mut bulk = entry(6);
        bulk.prefill(&block(0, 5), &block(0, 5)).unwrap();

        assert_eq!(stepped.cursor(), bulk.cursor());
        let (sk, sv) = stepped.read().unwrap();
        let (bk, bv) = bulk.read().unwrap();
        assert_eq!(to_vec(&sk), to_vec(&bk));
        assert_eq!(to_vec(&sv), to_vec(&bv));
    }

    #[test]
    fn append_beyond_capacity_is_cache_misuse() {
        let mut cache = entry(2);
        cache.prefill(&block(0, 2), &block(0, 2)).unwrap();
        let err = cache.append_step(&block(2, 1), &block(2, 1)).unwrap_err();
        assert!(matches!(err, DecodeError::CacheMisuse(_)));
        assert_eq!(cache.cursor(), 2);
    }

    #[test]
    fn prefill_after_step_is_cache_misuse() {
        let mut cache = entry(8);
        cache.append_step(&block(0, 1), &block(0, 1)).unwrap();
        let err = cache.prefill(&block(1, 2), &block(1, 2)).unwrap_err();
        assert!(matches!(err, DecodeError::CacheMisuse(_)));
    }

    #[test]
    fn second_prefill_is_cache_misuse() {
        let mut cache = entry(8);
        cache.prefill(&block(0, 2), &block(0, 2)).unwrap();
        let err = cache.write(&block(2, 2), &block(2, 2)).unwrap_err();
        assert!(matches!(err, DecodeError::CacheMisuse(_)));
    }

    #[test]
    fn oversized_prefill_is_config_error() {
        let mut cache = entry(2);
        let err = cache.prefill(&block(0, 3), &block(0, 3)).unwrap_err();
        assert!(matches!(err, DecodeError::Config(_)));
    }

    #[test]
    fn mismatched_heads_is_shape_mismatch() {
        let mut cache = KvCacheEntry::new(1, 4, 3, 8, DType::F32, &Device::Cpu).unwrap();
        let err = cache.append_step(&block(0, 1), &block(0, 1)).unwrap_err();
        assert!(matches!(err, DecodeError::ShapeMismatch(_)));
    }

    #[test]
    fn write_routes_by_length() {
        let mut cache = entry(8);
        assert_eq!(cache.write(&block(0, 3), &block(0, 3)).unwrap(), 0);
        assert_eq!(cache.state(), CacheState::Prefilled);
        assert_eq!(cache.write(&block(3, 1), &block(3, 1)).unwrap(), 3);
        assert_eq!(cache.state(), CacheState::Decoding);
        assert_eq!(cache.cursor(), 4);
    }

    #[test]
    fn decoder_cache_layers() {
        let mut cache = DecoderKvCache::new(3, 1, 2, 3, 5, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(cache.n_layers(), 3);
        assert!(cache.is_empty());
        assert!(cache.layer_mut(3).is_err());

        for layer in 0..3 {
            cache
                .layer_mut(layer)
                .unwrap()
                .append_step(&block(0, 1), &block(0, 1))
                .unwrap();
        }
        assert_eq!(cache.cursor(), 1);
        assert_eq!(cache.remaining(), 4);
        assert!(cache.is_consistent());

        cache
            .layer_mut(0)
            .unwrap()
            .append_step(&block(1, 1), &block(1, 1))
            .unwrap();
        assert!(!cache.is_consistent());
    }
}
