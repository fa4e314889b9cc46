use anyhow::Result;
use tracing::{Subscriber, subscriber};
use tracing_subscriber::EnvFilter;

/// Installs the default tracing subscriber as the global one.
///
/// Intended for embedders and test binaries; the library itself never touches the global
/// subscriber.
pub fn setup_logging() -> Result<()> {
    subscriber::set_global_default(subscriber())?;

    Ok(())
}

pub fn subscriber() -> impl Subscriber + core::fmt::Debug {
    use tracing_subscriber::fmt::format::FmtSpan;

    tracing_subscriber::fmt()
        .compact()
        .with_level(true)
        .with_file(true)
        .with_line_number(true)
        .with_target(true)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .finish()
}
