//! Logging prelude module for convenient access to tracing macros.
//!
//! # Usage
//!
//! ```ignore
//! use crate::logging::*;
//!
//! info!("This is an info message");
//! warn!("This is a warning");
//! ```

pub use tracing::{debug, error, info, trace, warn};

/// Initialize the tracing subscriber with environment filter support.
///
/// Logs go to stderr so that stdout stays free for the wire protocol when
/// running as `--server`. The default level is INFO, or DEBUG when the
/// `--debug` flag was given; `RUST_LOG` overrides both:
///
/// ```bash
/// RUST_LOG=treesync=trace sync
/// RUST_LOG=treesync::scan=debug sync
/// ```
pub fn init_tracing(debug: bool) {
	let default = if debug { "debug" } else { "info" };
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
		)
		.with_writer(std::io::stderr)
		.init();
}

// vim: ts=4
