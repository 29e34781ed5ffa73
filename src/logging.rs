//! # Logging and Verbosity Control
//!
//! The library emits all diagnostics through `tracing`; an embedding
//! application that already installs a subscriber needs nothing from this
//! module. `init_logging` is an opt-in convenience for binaries and tests.
//!
//! Runtime verbosity follows the file named by `RMR_VCTL_FILE`: the file's
//! single integer (0..=2) is re-read by the route table collector on each
//! cycle so chattiness can be raised on a live process without restarting.

use std::fs;
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Install a plain formatting subscriber honouring `RUST_LOG`.
///
/// Falls back to `info` when `RUST_LOG` is unset. Safe to call more than
/// once; later calls are ignored.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Read the verbosity level from a control file.
///
/// The file is expected to hold one small integer; anything unreadable
/// yields 0 (quiet). Only the first few bytes are examined, matching the
/// original behaviour of polling a live control file.
pub(crate) fn read_vlevel(path: &Path) -> i32 {
    match fs::read_to_string(path) {
        Ok(text) => {
            let head: String = text.chars().take(10).collect();
            head.trim().parse().unwrap_or(0)
        }
        Err(_) => 0,
    }
}
