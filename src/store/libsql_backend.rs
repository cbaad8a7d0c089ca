//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::types::{ForwardRule, InboundMessage};
use crate::store::migrations;
use crate::store::traits::{Database, Diagnostic};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// Writes that span several statements take `write_lock` so that
/// concurrent single-statement writes never land inside another
/// caller's transaction.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        Ok(Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_messages(
        &self,
        sql: &str,
        context: &str,
    ) -> Result<Vec<InboundMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, ())
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?;

        let mut messages = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => match row_to_message(&row) {
                    Ok(msg) => messages.push(msg),
                    Err(e) => tracing::warn!("Skipping {context} row: {e}"),
                },
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("{context}: {e}"))),
            }
        }
        Ok(messages)
    }

    async fn count(&self, sql: &str, context: &str) -> Result<usize, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, ())
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("{context} row parse: {e}")))?;
                Ok(count.max(0) as usize)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("{context}: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

const MESSAGE_COLUMNS: &str = "sender, body, received_at_millis, sim_slot_id";

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Map a libsql Row to an InboundMessage. Column order matches MESSAGE_COLUMNS.
fn row_to_message(row: &libsql::Row) -> Result<InboundMessage, libsql::Error> {
    Ok(InboundMessage {
        sender: row.get(0)?,
        body: row.get(1)?,
        received_at_millis: row.get(2)?,
        sim_slot_id: row.get::<String>(3).ok(),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Dedup ledger ────────────────────────────────────────────────

    async fn claim_fingerprint(&self, fingerprint: &str) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO forwarded (fingerprint, claimed_at) VALUES (?1, ?2)",
                params![fingerprint, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_fingerprint: {e}")))?;

        debug!(fingerprint, inserted, "Fingerprint claim");
        Ok(inserted == 1)
    }

    async fn is_fingerprint_claimed(&self, fingerprint: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM forwarded WHERE fingerprint = ?1",
                params![fingerprint],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("is_fingerprint_claimed: {e}")))?;

        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(DatabaseError::Query(format!("is_fingerprint_claimed: {e}"))),
        }
    }

    async fn clear_fingerprints(&self) -> Result<usize, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let removed = self
            .conn()
            .execute("DELETE FROM forwarded", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("clear_fingerprints: {e}")))?;
        Ok(removed as usize)
    }

    async fn count_fingerprints(&self) -> Result<usize, DatabaseError> {
        self.count("SELECT COUNT(*) FROM forwarded", "count_fingerprints")
            .await
    }

    // ── Inbox ───────────────────────────────────────────────────────

    async fn append_inbound(&self, message: &InboundMessage) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO inbox (sender, body, received_at_millis, sim_slot_id, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    message.sender.as_str(),
                    message.body.as_str(),
                    message.received_at_millis,
                    opt_text(message.sim_slot_id.as_deref()),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_inbound: {e}")))?;
        Ok(())
    }

    async fn list_inbound(&self) -> Result<Vec<InboundMessage>, DatabaseError> {
        self.query_messages(
            &format!("SELECT {MESSAGE_COLUMNS} FROM inbox ORDER BY received_at_millis DESC, id DESC"),
            "list_inbound",
        )
        .await
    }

    // ── Message cache ───────────────────────────────────────────────

    async fn replace_message_cache(&self, messages: &[InboundMessage]) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("replace_message_cache begin: {e}")))?;

        tx.execute("DELETE FROM message_cache", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("replace_message_cache clear: {e}")))?;

        for message in messages {
            tx.execute(
                "INSERT INTO message_cache (sender, body, received_at_millis, sim_slot_id)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    message.sender.as_str(),
                    message.body.as_str(),
                    message.received_at_millis,
                    opt_text(message.sim_slot_id.as_deref()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("replace_message_cache insert: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("replace_message_cache commit: {e}")))?;

        debug!(count = messages.len(), "Message cache replaced");
        Ok(())
    }

    async fn list_message_cache(&self) -> Result<Vec<InboundMessage>, DatabaseError> {
        self.query_messages(
            &format!("SELECT {MESSAGE_COLUMNS} FROM message_cache ORDER BY id ASC"),
            "list_message_cache",
        )
        .await
    }

    // ── Rule cache ──────────────────────────────────────────────────

    async fn save_rules(&self, rules: &[ForwardRule]) -> Result<(), DatabaseError> {
        let payload = serde_json::to_string(rules)
            .map_err(|e| DatabaseError::Serialization(format!("save_rules: {e}")))?;

        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT INTO rule_cache (id, payload, fetched_at) VALUES (1, ?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET payload = excluded.payload, fetched_at = excluded.fetched_at",
                params![payload, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_rules: {e}")))?;
        Ok(())
    }

    async fn load_rules(&self) -> Result<Vec<ForwardRule>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT payload FROM rule_cache WHERE id = 1", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("load_rules: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let payload: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("load_rules row parse: {e}")))?;
                serde_json::from_str(&payload)
                    .map_err(|e| DatabaseError::Serialization(format!("load_rules: {e}")))
            }
            Ok(None) => Ok(Vec::new()),
            Err(e) => Err(DatabaseError::Query(format!("load_rules: {e}"))),
        }
    }

    // ── Diagnostics ─────────────────────────────────────────────────

    async fn record_diagnostic(&self, source: &str, detail: &str) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT INTO diagnostics (id, source, detail, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    Uuid::new_v4().to_string(),
                    source,
                    detail,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_diagnostic: {e}")))?;
        Ok(())
    }

    async fn recent_diagnostics(&self, limit: usize) -> Result<Vec<Diagnostic>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, source, detail, created_at FROM diagnostics
                 ORDER BY created_at DESC LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_diagnostics: {e}")))?;

        let mut diagnostics = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let parsed = (|| -> Result<Diagnostic, libsql::Error> {
                let created: String = row.get(3)?;
                Ok(Diagnostic {
                    id: row.get(0)?,
                    source: row.get(1)?,
                    detail: row.get(2)?,
                    created_at: parse_datetime(&created),
                })
            })();
            match parsed {
                Ok(d) => diagnostics.push(d),
                Err(e) => tracing::warn!("Skipping diagnostic row: {e}"),
            }
        }
        Ok(diagnostics)
    }
}
