use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

use crate::util::env::env_opt;

/// Dependencies that log every statement or connection at `info` and drown out page progress.
const QUIET_TARGETS: &[&str] = &["sqlx", "hyper", "reqwest", "wiremock"];

/// Filter used when neither `KEYFORGE_LOG` nor `RUST_LOG` is set: `level` for the sync itself,
/// `warn` for the chatty dependencies.
pub fn default_directives(level: &str) -> String {
    let mut directives = vec![level.to_string()];
    directives.extend(QUIET_TARGETS.iter().map(|target| format!("{target}=warn")));
    directives.join(",")
}

/// Install the global fmt subscriber. `KEYFORGE_LOG` wins over `RUST_LOG`, which wins over
/// [`default_directives`]`(level)`.
pub fn init_tracing(level: &str) -> Result<(), anyhow::Error> {
    let directives = env_opt("KEYFORGE_LOG")
        .or_else(|| env_opt("RUST_LOG"))
        .unwrap_or_else(|| default_directives(level));
    let filter = EnvFilter::try_new(&directives)
        .map_err(|e| anyhow::anyhow!("invalid log filter {directives:?}: {e}"))?;

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}
