//! Reconciliation scanner: re-reads the full message history on a timer and
//! relays anything the ledger has not claimed yet.
//!
//! Repairs missed or dropped live events. Claim-before-dispatch makes an
//! overlap with the live path harmless: whichever side claims first relays,
//! the other skips.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::dedup::DedupLedger;
use crate::error::ScanError;
use crate::pipeline::processor::RelayProcessor;
use crate::pipeline::types::InboundMessage;
use crate::remote::RuleStore;
use crate::store::Database;

/// The authoritative local message history.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Every message ever observed, not just new ones.
    async fn read_all(&self) -> Result<Vec<InboundMessage>, ScanError>;
}

/// History backed by the database inbox the live intake appends to.
pub struct DatabaseInbox {
    db: Arc<dyn Database>,
}

impl DatabaseInbox {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MessageSource for DatabaseInbox {
    async fn read_all(&self) -> Result<Vec<InboundMessage>, ScanError> {
        self.db
            .list_inbound()
            .await
            .map_err(|e| ScanError::HistoryRead(e.to_string()))
    }
}

/// Counters from one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub scanned: usize,
    pub unclaimed: usize,
    pub dispatched: usize,
}

pub struct ReconciliationScanner {
    source: Arc<dyn MessageSource>,
    db: Arc<dyn Database>,
    ledger: DedupLedger,
    rules: Arc<RuleStore>,
    processor: Arc<RelayProcessor>,
}

impl ReconciliationScanner {
    pub fn new(
        source: Arc<dyn MessageSource>,
        db: Arc<dyn Database>,
        ledger: DedupLedger,
        rules: Arc<RuleStore>,
        processor: Arc<RelayProcessor>,
    ) -> Self {
        Self {
            source,
            db,
            ledger,
            rules,
            processor,
        }
    }

    /// One reconciliation pass.
    ///
    /// A history read or cache write failure aborts the pass before any
    /// dispatch. With no rules loaded the cache is still refreshed.
    pub async fn scan_once(&self) -> Result<ScanSummary, ScanError> {
        let history = self.source.read_all().await?;

        self.db
            .replace_message_cache(&history)
            .await
            .map_err(|e| ScanError::CacheWrite(e.to_string()))?;

        let mut summary = ScanSummary {
            scanned: history.len(),
            ..Default::default()
        };

        if self.rules.is_empty() {
            debug!(scanned = summary.scanned, "No rules loaded, cache refreshed only");
            return Ok(summary);
        }

        for message in &history {
            if self.ledger.is_claimed(&message.fingerprint()).await {
                continue;
            }
            summary.unclaimed += 1;

            summary.dispatched += self
                .processor
                .process(message)
                .await
                .iter()
                .filter(|o| !o.is_skipped())
                .count();
        }

        if summary.dispatched > 0 {
            info!(
                scanned = summary.scanned,
                unclaimed = summary.unclaimed,
                dispatched = summary.dispatched,
                "Reconciliation relayed missed messages"
            );
        }
        Ok(summary)
    }
}

/// Spawn the reconciliation loop.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop scanning.
pub fn spawn_scanner(
    scanner: Arc<ReconciliationScanner>,
    every: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(every_secs = every.as_secs(), "Reconciliation scanner started");

        let mut tick = tokio::time::interval(every);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Reconciliation scanner shutting down");
                return;
            }

            match scanner.scan_once().await {
                Ok(summary) => debug!(?summary, "Scan complete"),
                Err(e) => error!(error = %e, "Scan skipped"),
            }
        }
    });

    (handle, shutdown_flag)
}
