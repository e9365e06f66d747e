//! SQLite sink for warn+ tracing events. Session-tagged so a single
//! session's failures can be pulled without grepping stdout.

use std::path::Path;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub session_id: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    pub session_id: Option<String>,
    pub limit: Option<u32>,
}

pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS session_logs (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 level TEXT NOT NULL,
                 target TEXT NOT NULL,
                 message TEXT NOT NULL,
                 session_id TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_session_logs_session ON session_logs(session_id);
             CREATE INDEX IF NOT EXISTS idx_session_logs_level ON session_logs(level);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, level: &str, target: &str, message: &str, session_id: Option<&str>) {
        let conn = self.conn.lock();
        let _ = conn.execute(
            "INSERT INTO session_logs (timestamp, level, target, message, session_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![Utc::now().to_rfc3339(), level, target, message, session_id],
        );
    }

    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT id, timestamp, level, target, message, session_id
             FROM session_logs WHERE 1=1",
        );
        let mut params: Vec<String> = Vec::new();

        if let Some(level) = &q.level {
            params.push(level.clone());
            sql.push_str(&format!(" AND level = ?{}", params.len()));
        }
        if let Some(session_id) = &q.session_id {
            params.push(session_id.clone());
            sql.push_str(&format!(" AND session_id = ?{}", params.len()));
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", q.limit.unwrap_or(100)));

        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p as &dyn rusqlite::types::ToSql).collect();
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                session_id: row.get(5)?,
            })
        })?;
        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM session_logs", [], |row| row.get(0))
    }
}

/// Extracts the message and an optional `session_id` field from an event.
#[derive(Default)]
struct EventVisitor {
    message: Option<String>,
    session_id: Option<String>,
}

impl Visit for EventVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{value:?}");
        match field.name() {
            "message" => self.message = Some(rendered),
            "session_id" => self.session_id = Some(rendered.trim_matches('"').to_string()),
            _ => {}
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = Some(value.to_string()),
            "session_id" => self.session_id = Some(value.to_string()),
            _ => {}
        }
    }
}

/// tracing layer that mirrors warn+ events into the sink.
pub struct SqliteLogLayer {
    sink: std::sync::Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: std::sync::Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);

        self.sink.insert(
            &level.to_string().to_uppercase(),
            event.metadata().target(),
            &visitor.message.unwrap_or_default(),
            visitor.session_id.as_deref(),
        );
    }
}
