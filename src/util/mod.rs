// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared utilities: attention masks.

pub mod masks;
