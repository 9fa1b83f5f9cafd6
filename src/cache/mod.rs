// SPDX-License-Identifier: MIT OR Apache-2.0

//! Key/value caching for incremental decoding.
//!
//! - [`KvCacheEntry`]: preallocated per-layer key/value store with a write
//!   cursor.
//! - [`DecoderKvCache`]: one entry per decoder layer, owned by a single
//!   generation call.

mod kv;

pub use kv::{CacheState, DecoderKvCache, KvCacheEntry};
