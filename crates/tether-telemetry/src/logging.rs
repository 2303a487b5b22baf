//! Warn+ log persistence behind `tether logs`.
//!
//! Each persisted event is correlated to a session and a plugin through its own
//! `session_id` / `plugin_id` fields, falling back to the nearest enclosing span
//! that carries them.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{span, Level};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
CREATE TABLE IF NOT EXISTS logs (
    timestamp  TEXT NOT NULL,
    level      TEXT NOT NULL,
    target     TEXT NOT NULL,
    message    TEXT NOT NULL,
    fields     TEXT,
    session_id TEXT,
    plugin_id  TEXT
);
CREATE INDEX IF NOT EXISTS idx_logs_session ON logs(session_id);
CREATE INDEX IF NOT EXISTS idx_logs_plugin ON logs(plugin_id);
";

const SELECT: &str = "
SELECT timestamp, level, target, message, fields, session_id, plugin_id FROM logs
WHERE (?1 IS NULL OR level = ?1)
  AND (?2 IS NULL OR session_id = ?2)
  AND (?3 IS NULL OR plugin_id = ?3)
ORDER BY rowid DESC
LIMIT ?4
";

const DEFAULT_LIMIT: u32 = 100;

/// One persisted event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    /// Remaining structured fields as a JSON object.
    pub fields: Option<String>,
    pub session_id: Option<String>,
    pub plugin_id: Option<String>,
}

impl LogRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            timestamp: row.get(0)?,
            level: row.get(1)?,
            target: row.get(2)?,
            message: row.get(3)?,
            fields: row.get(4)?,
            session_id: row.get(5)?,
            plugin_id: row.get(6)?,
        })
    }
}

/// Filters for [`SqliteLogSink::query`]. Unset filters match everything.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    /// Case-insensitive level name.
    pub level: Option<String>,
    pub session_id: Option<String>,
    pub plugin_id: Option<String>,
    /// Defaults to 100.
    pub limit: Option<u32>,
}

pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        Self::init(Connection::open(db_path)?)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Write failures are dropped: the layer cannot log about itself.
    fn append(&self, record: &LogRecord) {
        let _ = self.conn.lock().execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, session_id, plugin_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.timestamp,
                record.level,
                record.target,
                record.message,
                record.fields,
                record.session_id,
                record.plugin_id,
            ],
        );
    }

    /// Matching records, newest first.
    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(SELECT)?;
        let rows = stmt.query_map(
            params![
                q.level.as_deref().map(str::to_uppercase),
                q.session_id,
                q.plugin_id,
                q.limit.unwrap_or(DEFAULT_LIMIT),
            ],
            LogRecord::from_row,
        )?;
        let records = rows.collect::<Result<Vec<_>, _>>();
        records
    }
}

/// Session and plugin an event belongs to. Also stored on spans.
#[derive(Clone, Debug, Default)]
struct Correlation {
    session_id: Option<String>,
    plugin_id: Option<String>,
}

impl Correlation {
    /// `false` when `name` is not a correlation field.
    fn absorb(&mut self, name: &str, text: String) -> bool {
        match name {
            "session_id" => self.session_id = Some(text),
            "plugin_id" => self.plugin_id = Some(text),
            _ => return false,
        }
        true
    }

    /// Fill the gaps from an enclosing span. Own values win.
    fn inherit(&mut self, outer: &Correlation) {
        if self.session_id.is_none() {
            self.session_id.clone_from(&outer.session_id);
        }
        if self.plugin_id.is_none() {
            self.plugin_id.clone_from(&outer.plugin_id);
        }
    }

    fn is_empty(&self) -> bool {
        self.session_id.is_none() && self.plugin_id.is_none()
    }

    fn is_complete(&self) -> bool {
        self.session_id.is_some() && self.plugin_id.is_some()
    }
}

#[derive(Default)]
struct Collected {
    message: String,
    correlation: Correlation,
    extra: Map<String, Value>,
}

impl Collected {
    fn put(&mut self, field: &Field, value: Value) {
        let name = field.name();
        let text = match &value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if name == "message" {
            self.message = text;
        } else if !self.correlation.absorb(name, text) {
            self.extra.insert(name.to_string(), value);
        }
    }
}

impl Visit for Collected {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let text = format!("{value:?}");
        self.put(field, Value::String(text.trim_matches('"').to_string()));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value.into());
    }
}

/// Persists WARN and ERROR events to a [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut collected = Collected::default();
        attrs.record(&mut collected);
        if collected.correlation.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(collected.correlation);
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() > Level::WARN {
            return;
        }
        let mut collected = Collected::default();
        event.record(&mut collected);

        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if collected.correlation.is_complete() {
                    break;
                }
                if let Some(outer) = span.extensions().get::<Correlation>() {
                    collected.correlation.inherit(outer);
                }
            }
        }

        let Collected {
            message,
            correlation,
            extra,
        } = collected;
        self.sink.append(&LogRecord {
            timestamp: Utc::now().to_rfc3339(),
            level: metadata.level().as_str().to_string(),
            target: metadata.target().to_string(),
            message,
            fields: (!extra.is_empty())
                .then(|| serde_json::to_string(&extra).ok())
                .flatten(),
            session_id: correlation.session_id,
            plugin_id: correlation.plugin_id,
        });
    }
}
