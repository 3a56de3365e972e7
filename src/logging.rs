// SPDX-License-Identifier: MIT OR Apache-2.0

//! Diagnostic output for the command-line programs.
//!
//! Logs go to stderr so stdout carries only results.  Verbosity follows
//! `RUST_LOG` (e.g. `RUST_LOG=candle_probe=debug`), defaulting to `info`.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset or invalid.
const DEFAULT_FILTER: &str = "info";

/// Install the global `tracing` subscriber.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    // Err only means a subscriber is already installed.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
