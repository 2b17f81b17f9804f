use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

use crate::util::env::env_opt;

/// Library and CLI at info; HTTP and pool internals only when they go wrong.
pub const DEFAULT_FILTER: &str = "pos_sync_engine=info,pos_sync=info,sqlx=warn,reqwest=warn,hyper=warn";

/// Crate-specific override, consulted when `RUST_LOG` is unset.
pub const LOG_ENV: &str = "POS_SYNC_LOG";

/// `RUST_LOG`, then `POS_SYNC_LOG`, then `default_filter`.
fn filter_directives(default_filter: &str) -> String {
    env_opt("RUST_LOG")
        .or_else(|| env_opt(LOG_ENV))
        .unwrap_or_else(|| default_filter.to_string())
}

/// Install the global fmt subscriber. Concurrent connection runs are told
/// apart by the `run_id` span field, so thread ids stay off.
pub fn init_tracing(default_filter: &str) -> Result<(), anyhow::Error> {
    let directives = filter_directives(default_filter);
    let filter = EnvFilter::try_new(&directives)
        .or_else(|_| EnvFilter::try_new(default_filter))
        .map_err(|e| anyhow::anyhow!("invalid log filter {directives:?}: {e}"))?;

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}
