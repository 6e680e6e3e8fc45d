//! Development-time tracing for debugging the agent.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Dev diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted, not part of the run's product output.
//!
//! - **Run log (`io/run_log`)**: Product artifacts in `<runs_dir>/<run_id>/`.
//!   Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "warn";
/// Filter for `--verbose`: run progress from this crate, warnings from the rest.
pub const VERBOSE_FILTER: &str = "warn,agent=info";

/// Initialize tracing subscriber for development logging.
///
/// Reads `RUST_LOG` env var. Falls back to [`VERBOSE_FILTER`] when `verbose`
/// is set and to [`DEFAULT_FILTER`] otherwise.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=agent=debug agent run --workdir theme
/// ```
pub fn init(verbose: bool) {
    let fallback = if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
