use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_FILTER: &str = "info,agent_memory=info";

/// Install the global fmt subscriber. `RUST_LOG` overrides the default filter;
/// a second call is a no-op.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_level(true)
        .compact()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
