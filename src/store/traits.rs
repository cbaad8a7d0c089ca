//! `Database` trait: the single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::pipeline::types::{ForwardRule, InboundMessage};

/// A diagnostic entry surfaced for operators (e.g. a malformed rule payload).
#[derive(Debug, Clone, serde::Serialize)]
pub struct Diagnostic {
    pub id: String,
    pub source: String,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

/// Backend-agnostic database trait covering the ledger, inbox, cache, and rules.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Dedup ledger ────────────────────────────────────────────────

    /// Insert a fingerprint if absent. Returns `true` only when this call created it.
    async fn claim_fingerprint(&self, fingerprint: &str) -> Result<bool, DatabaseError>;

    async fn is_fingerprint_claimed(&self, fingerprint: &str) -> Result<bool, DatabaseError>;

    /// Remove every claimed fingerprint. Returns the number removed.
    async fn clear_fingerprints(&self) -> Result<usize, DatabaseError>;

    async fn count_fingerprints(&self) -> Result<usize, DatabaseError>;

    // ── Inbox (authoritative message history) ───────────────────────

    /// Record an observed message. Exact duplicates are ignored.
    async fn append_inbound(&self, message: &InboundMessage) -> Result<(), DatabaseError>;

    /// Every message ever recorded, newest first.
    async fn list_inbound(&self) -> Result<Vec<InboundMessage>, DatabaseError>;

    // ── Message cache ───────────────────────────────────────────────

    /// Overwrite the local cache with `messages` in a single transaction.
    async fn replace_message_cache(&self, messages: &[InboundMessage]) -> Result<(), DatabaseError>;

    async fn list_message_cache(&self) -> Result<Vec<InboundMessage>, DatabaseError>;

    // ── Rule cache ──────────────────────────────────────────────────

    /// Persist the last successfully fetched rule list.
    async fn save_rules(&self, rules: &[ForwardRule]) -> Result<(), DatabaseError>;

    /// Load the cached rule list (empty if never fetched).
    async fn load_rules(&self) -> Result<Vec<ForwardRule>, DatabaseError>;

    // ── Diagnostics ─────────────────────────────────────────────────

    async fn record_diagnostic(&self, source: &str, detail: &str) -> Result<(), DatabaseError>;

    /// Most recent diagnostics, newest first.
    async fn recent_diagnostics(&self, limit: usize) -> Result<Vec<Diagnostic>, DatabaseError>;
}
