// SPDX-License-Identifier: Apache-2.0

//! Structured logging setup, matching `tsffs_module/src/fuzzer/mod.rs`'s
//! use of `tracing`: an env-filter-driven subscriber defaulting to `info`.

use tracing_subscriber::{fmt, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();
}
