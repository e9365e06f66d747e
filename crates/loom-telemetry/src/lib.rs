//! Tracing setup: env-filtered fmt output, with warn+ records optionally
//! mirrored into a per-install SQLite file for post-hoc debugging.

mod sink;

pub use sink::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};

use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default filter directive; `RUST_LOG` overrides it.
    pub default_filter: String,
    /// Where to persist warn+ records. `None` disables the SQLite sink.
    pub log_db_path: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            default_filter: "info".into(),
            log_db_path: None,
        }
    }
}

/// Install the global subscriber. Returns the sink handle when SQLite
/// mirroring is enabled, for querying persisted records. Idempotent: a
/// second call is a no-op.
pub fn init(config: &TelemetryConfig) -> Option<Arc<SqliteLogSink>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_filter.clone()));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    let sink = config.log_db_path.as_deref().and_then(|path| {
        match SqliteLogSink::new(path) {
            Ok(sink) => Some(Arc::new(sink)),
            Err(e) => {
                eprintln!("log sink unavailable ({e}), continuing without it");
                None
            }
        }
    });

    let registry = tracing_subscriber::registry().with(filter).with(fmt_layer);
    match &sink {
        Some(sink) => {
            let _ = registry.with(SqliteLogLayer::new(Arc::clone(sink))).try_init();
        }
        None => {
            let _ = registry.try_init();
        }
    }
    sink
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_without_sink() {
        let config = TelemetryConfig::default();
        assert!(init(&config).is_none());
        // Second init must not panic.
        assert!(init(&config).is_none());
    }
}
