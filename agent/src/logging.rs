//! Process-wide tracing setup.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_DIRECTIVE: &str = "run_agent=info,tower_http=info";

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`, falling back to `default_directive`. Output goes to
/// stderr in compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=run_agent=debug run-agent poll
/// ```
pub fn init(default_directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
