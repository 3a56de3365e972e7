// SPDX-License-Identifier: MIT OR Apache-2.0

//! Caching for autoregressive forward passes.
//!
//! - [`KvCache`]: per-layer key/value history.

mod kv;

pub use kv::KvCache;
