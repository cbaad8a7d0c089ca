//! Delivery status tracker: correlates transport completions back to the
//! dispatch attempt that produced them.
//!
//! State per attempt is `Pending -> {Confirmed, Failed}`. Multipart sends
//! confirm on the first successful part; later callbacks for the same
//! fingerprint find nothing and are dropped. Correlation state lives only in
//! memory and is lost on restart.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::channels::sms::{self, DeliveryReport};
use crate::dedup::Fingerprint;
use crate::pipeline::types::{AttemptState, DispatchAttempt, RelayChannel};
use crate::remote::{DispatchReport, ReportingSink};

/// Sending half of the completion channel, handed to the transport side.
pub type DeliverySender = mpsc::UnboundedSender<DeliveryReport>;

pub type DeliveryReceiver = mpsc::UnboundedReceiver<DeliveryReport>;

/// Create the typed completion channel.
pub fn delivery_channel() -> (DeliverySender, DeliveryReceiver) {
    mpsc::unbounded_channel()
}

/// An in-flight attempt and the correlation ids that point at it.
struct AttemptContext {
    attempt: DispatchAttempt,
    correlation_ids: Vec<String>,
}

#[derive(Default)]
struct Inner {
    attempts: HashMap<Fingerprint, AttemptContext>,
    correlations: HashMap<String, Fingerprint>,
}

impl Inner {
    /// Remove an attempt and every correlation id that points at it.
    fn forget(&mut self, fingerprint: &Fingerprint) -> Option<DispatchAttempt> {
        let ctx = self.attempts.remove(fingerprint)?;
        for id in &ctx.correlation_ids {
            self.correlations.remove(id);
        }
        Some(ctx.attempt)
    }
}

/// Process-scoped store of in-flight SMS attempts.
pub struct DeliveryTracker {
    inner: Mutex<Inner>,
    sink: Arc<dyn ReportingSink>,
}

impl DeliveryTracker {
    pub fn new(sink: Arc<dyn ReportingSink>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            sink,
        }
    }

    /// Start tracking an attempt before it is submitted.
    pub async fn register(&self, attempt: DispatchAttempt, correlation_ids: Vec<String>) {
        let mut inner = self.inner.lock().await;
        let fingerprint = attempt.fingerprint.clone();

        for id in &correlation_ids {
            inner.correlations.insert(id.clone(), fingerprint.clone());
        }
        debug!(fingerprint = %fingerprint, parts = correlation_ids.len(), "Tracking dispatch attempt");
        inner.attempts.insert(
            fingerprint,
            AttemptContext {
                attempt,
                correlation_ids,
            },
        );
    }

    /// Apply one completion report.
    ///
    /// Returns the attempt's state after the report, or `None` when the report
    /// could not be correlated.
    pub async fn handle_report(&self, report: DeliveryReport) -> Option<AttemptState> {
        let Some(correlation_id) = report.correlation_id.as_deref().filter(|id| !id.is_empty())
        else {
            warn!(result_code = report.result_code, "Delivery report without correlation id, dropped");
            return None;
        };

        let success = sms::is_success(report.result_code);

        let finished = {
            let mut inner = self.inner.lock().await;

            let Some(fingerprint) = inner.correlations.remove(correlation_id) else {
                warn!(correlation_id, result_code = report.result_code, "Unmatched delivery report, dropped");
                return None;
            };

            let Some(ctx) = inner.attempts.get_mut(&fingerprint) else {
                warn!(correlation_id, "Delivery report for a forgotten attempt, dropped");
                return None;
            };

            let attempt = &mut ctx.attempt;
            if success {
                attempt.parts_confirmed += 1;
                attempt.state = AttemptState::Confirmed;
            } else {
                attempt.parts_failed += 1;
                debug!(
                    correlation_id,
                    reason = sms::describe(report.result_code),
                    failed = attempt.parts_failed,
                    of = attempt.part_count,
                    "Relay part failed"
                );
                if attempt.parts_failed >= attempt.part_count {
                    attempt.state = AttemptState::Failed;
                }
            }

            if attempt.state.is_terminal() {
                inner.forget(&fingerprint)
            } else {
                return Some(AttemptState::Pending);
            }
        };

        let attempt = finished?;
        self.report_terminal(&attempt).await;
        Some(attempt.state)
    }

    /// Mark an attempt failed because its submission never went through.
    pub async fn fail(&self, fingerprint: &Fingerprint, reason: &str) -> bool {
        let attempt = {
            let mut inner = self.inner.lock().await;
            inner.forget(fingerprint)
        };

        match attempt {
            Some(mut attempt) => {
                attempt.state = AttemptState::Failed;
                warn!(fingerprint = %fingerprint, reason, "Relay SMS attempt failed");
                self.report_terminal(&attempt).await;
                true
            }
            None => false,
        }
    }

    /// Consume the completion channel until every sender is dropped.
    pub async fn run(self: Arc<Self>, mut receiver: DeliveryReceiver) {
        info!("Delivery tracker started");
        while let Some(report) = receiver.recv().await {
            self.handle_report(report).await;
        }
        info!("Delivery channel closed, tracker stopping");
    }

    /// Drop all in-flight state. Unconfirmed attempts are never reported.
    pub async fn discard_in_flight(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let discarded = inner.attempts.len();
        inner.attempts.clear();
        inner.correlations.clear();
        if discarded > 0 {
            warn!(discarded, "Discarding in-flight dispatch attempts");
        }
        discarded
    }

    pub async fn in_flight(&self) -> usize {
        self.inner.lock().await.attempts.len()
    }

    async fn report_terminal(&self, attempt: &DispatchAttempt) {
        let confirmed = attempt.state == AttemptState::Confirmed;
        info!(
            fingerprint = %attempt.fingerprint,
            rule_id = %attempt.rule.id,
            state = ?attempt.state,
            parts = attempt.part_count,
            "Relay SMS resolved"
        );
        self.sink
            .report(DispatchReport::now(
                &attempt.rule,
                &attempt.message,
                RelayChannel::Sms,
                confirmed,
            ))
            .await;
    }
}
