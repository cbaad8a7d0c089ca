//! Dedup ledger: the single source of truth for "has this message been relayed".
//!
//! A fingerprint present in the ledger means dispatch was *submitted*, not
//! that it was delivered. Callers claim before any network call so a crash
//! mid-dispatch can never lead to a second relay.

use std::sync::Arc;

use tracing::{error, warn};

use crate::dedup::Fingerprint;
use crate::error::DatabaseError;
use crate::store::Database;

/// Persistent set of claimed fingerprints.
///
/// Concurrency is owned by the backing store: a claim is one
/// `INSERT OR IGNORE`, so exactly one of several racing callers wins.
#[derive(Clone)]
pub struct DedupLedger {
    db: Arc<dyn Database>,
}

impl DedupLedger {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Whether the fingerprint has been claimed.
    ///
    /// A storage failure answers `true`: skipping a message is recoverable,
    /// relaying it twice is not.
    pub async fn is_claimed(&self, fingerprint: &Fingerprint) -> bool {
        match self.db.is_fingerprint_claimed(fingerprint.as_str()).await {
            Ok(claimed) => claimed,
            Err(e) => {
                error!(fingerprint = %fingerprint, error = %e, "Ledger lookup failed, treating as claimed");
                true
            }
        }
    }

    /// Claim a fingerprint. Idempotent.
    ///
    /// Returns `true` only for the caller that created the entry. Repeat
    /// claims and storage failures return `false`.
    pub async fn claim(&self, fingerprint: &Fingerprint) -> bool {
        match self.db.claim_fingerprint(fingerprint.as_str()).await {
            Ok(true) => true,
            Ok(false) => false,
            Err(e) => {
                error!(fingerprint = %fingerprint, error = %e, "Ledger claim failed");
                false
            }
        }
    }

    /// Administrative reset. Only reachable from an explicit operator action.
    pub async fn clear_all(&self) -> Result<usize, DatabaseError> {
        let cleared = self.db.clear_fingerprints().await?;
        warn!(cleared, "Dedup ledger cleared");
        Ok(cleared)
    }

    pub async fn count(&self) -> usize {
        self.db.count_fingerprints().await.unwrap_or_else(|e| {
            warn!(error = %e, "Ledger count unavailable");
            0
        })
    }
}
