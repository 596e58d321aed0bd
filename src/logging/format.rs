//! Log output: one JSON object per line (ndjson) for ingestion, or plain text for consoles.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::EnvFilter;

pub struct StructuredLogger;

impl StructuredLogger {
    /// Install the global subscriber on stdout. `RUST_LOG` overrides `default_level`.
    /// Fails if a subscriber is already installed.
    pub fn init(json: bool, default_level: &str) -> Result<(), TryInitError> {
        let filter = Self::filter(default_level);
        if json {
            let fmt = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_events(FmtSpan::NONE)
                .with_writer(std::io::stdout);
            tracing_subscriber::registry().with(filter).with(fmt).try_init()
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stdout))
                .try_init()
        }
    }

    fn filter(default_level: &str) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(default_level))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_an_error() {
        let _ = StructuredLogger::init(true, "debug");
        assert!(StructuredLogger::init(false, "info").is_err());
    }
}
