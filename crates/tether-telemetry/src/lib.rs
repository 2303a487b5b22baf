mod logging;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use tether_settings::TetherSettings;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by `RUST_LOG`.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "tether_plugins" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines on stderr instead of the compact human format.
    pub json: bool,
    /// Whether to persist warn+ logs to SQLite.
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self::from_settings(&TetherSettings::default())
    }
}

impl TelemetryConfig {
    /// Unparseable level strings fall back to INFO (or are dropped for modules).
    pub fn from_settings(settings: &TetherSettings) -> Self {
        let logging = &settings.logging;
        Self {
            log_level: Level::from_str(&logging.level).unwrap_or(Level::INFO),
            module_levels: logging
                .modules
                .iter()
                .filter_map(|(module, level)| {
                    Level::from_str(level).ok().map(|l| (module.clone(), l))
                })
                .collect(),
            json: logging.json,
            log_to_sqlite: logging.persist,
            log_db_path: settings.log_database_path(),
        }
    }

    fn filter_directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{module}={}", level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Keeps the persisted log sink reachable for the life of the process.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
}

impl TelemetryGuard {
    /// Access the log sink for querying persisted logs.
    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_filter(env_filter)
            .boxed()
    };

    let (sqlite_layer, sqlite_sink) = if config.log_to_sqlite {
        match SqliteLogSink::new(&config.log_db_path) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                (Some(SqliteLogLayer::new(Arc::clone(&sink))), Some(sink))
            }
            Err(e) => {
                eprintln!("tether-telemetry: failed to open log DB: {e}");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    let _ = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sqlite_layer)
        .try_init();

    TelemetryGuard {
        log_sink: sqlite_sink,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_from_settings() {
        let mut settings = TetherSettings::default();
        settings.logging.level = "debug".into();
        settings.logging.json = true;
        settings
            .logging
            .modules
            .insert("tether_plugins".into(), "trace".into());
        settings
            .logging
            .modules
            .insert("noisy".into(), "loud".into());

        let config = TelemetryConfig::from_settings(&settings);
        assert_eq!(config.log_level, Level::DEBUG);
        assert!(config.json);
        assert_eq!(
            config.module_levels,
            vec![("tether_plugins".to_string(), Level::TRACE)]
        );
        assert_eq!(config.filter_directives(), "debug,tether_plugins=trace");
    }

    #[test]
    fn bad_level_falls_back_to_info() {
        let mut settings = TetherSettings::default();
        settings.logging.level = "chatty".into();
        assert_eq!(TelemetryConfig::from_settings(&settings).log_level, Level::INFO);
    }
}
