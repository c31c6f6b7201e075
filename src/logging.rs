//! Structured logging setup for the CLI

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const DEFAULT_LOG_FILTER: &str = "dpo_from_scratch_rs=info";

/// Installs a global fmt subscriber
///
/// `RUST_LOG` takes precedence over `default_filter`. Calling this twice is an
/// error from `tracing_subscriber`, reported rather than panicking.
pub fn init_tracing(default_filter: &str) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false),
        )
        .try_init()?;
    tracing::debug!(filter = default_filter, "logging initialized");
    Ok(())
}
