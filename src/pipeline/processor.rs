//! Relay processor: routes an observed message to the dispatch coordinator.
//!
//! Shared by the live intake and the reconciliation scanner so both paths
//! resolve, match and dispatch identically. The live entry point
//! [`RelayProcessor::accept`] records the observation and hands the work to a
//! bounded background task so the caller never waits on the network.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::dedup::DedupLedger;
use crate::error::DatabaseError;
use crate::pipeline::dispatch::DispatchCoordinator;
use crate::pipeline::rules::RuleMatcher;
use crate::pipeline::types::{DispatchOutcome, InboundMessage};
use crate::remote::RuleStore;
use crate::sim::SimIdentityResolver;
use crate::store::Database;

/// Upper bound on a live-path worker when none is configured.
const DEFAULT_LIVE_TIMEOUT: Duration = Duration::from_secs(60);

pub struct RelayProcessor {
    db: Arc<dyn Database>,
    ledger: DedupLedger,
    resolver: SimIdentityResolver,
    matcher: RuleMatcher,
    rules: Arc<RuleStore>,
    coordinator: Arc<DispatchCoordinator>,
    live_timeout: Duration,
}

impl RelayProcessor {
    pub fn new(
        db: Arc<dyn Database>,
        ledger: DedupLedger,
        resolver: SimIdentityResolver,
        matcher: RuleMatcher,
        rules: Arc<RuleStore>,
        coordinator: Arc<DispatchCoordinator>,
    ) -> Self {
        Self {
            db,
            ledger,
            resolver,
            matcher,
            rules,
            coordinator,
            live_timeout: DEFAULT_LIVE_TIMEOUT,
        }
    }

    pub fn with_live_timeout(mut self, timeout: Duration) -> Self {
        self.live_timeout = timeout;
        self
    }

    /// Live path: record the observation, then process it in the background.
    ///
    /// Returns as soon as the message is recorded. The spawned worker is
    /// bounded by the live timeout. If it is cut short, any claim it already
    /// made still prevents a second relay, and an SMS attempt it registered is
    /// reported as failed instead of lingering in the tracker.
    pub async fn accept(self: &Arc<Self>, message: InboundMessage) -> Result<(), DatabaseError> {
        self.db.append_inbound(&message).await?;

        let processor = Arc::clone(self);
        let timeout = self.live_timeout;
        tokio::spawn(async move {
            let fingerprint = message.fingerprint();
            match tokio::time::timeout(timeout, processor.process(&message)).await {
                Ok(outcomes) => debug!(
                    fingerprint = %fingerprint,
                    dispatched = outcomes.iter().filter(|o| !o.is_skipped()).count(),
                    "Live message processed"
                ),
                Err(_) => {
                    warn!(
                        fingerprint = %fingerprint,
                        timeout_ms = timeout.as_millis() as u64,
                        "Live worker timed out"
                    );
                    processor
                        .coordinator
                        .abandon(&fingerprint, "live worker timed out")
                        .await;
                }
            }
        });

        Ok(())
    }

    /// Resolve, match and dispatch one message.
    ///
    /// Returns one outcome per selected rule. An empty list means nothing was
    /// dispatched and nothing was claimed.
    pub async fn process(&self, message: &InboundMessage) -> Vec<DispatchOutcome> {
        let fingerprint = message.fingerprint();

        if self.ledger.is_claimed(&fingerprint).await {
            debug!(fingerprint = %fingerprint, "Message already relayed");
            return vec![DispatchOutcome::Skipped { fingerprint }];
        }

        let resolved = self.resolver.resolve_phone_number(message.sim_slot_id.as_deref());
        if resolved.is_empty() {
            info!(
                fingerprint = %fingerprint,
                slot = ?message.sim_slot_id,
                "No own number configured for this SIM, skipping"
            );
            return Vec::new();
        }

        let rules = self.rules.snapshot();
        let selected = self.matcher.select(&resolved, &rules);
        if selected.is_empty() {
            debug!(fingerprint = %fingerprint, resolved = %resolved, "No rule matches");
            return Vec::new();
        }

        let mut outcomes = Vec::with_capacity(selected.len());
        for rule in &selected {
            outcomes.push(self.coordinator.dispatch(message, rule).await);
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::dedup::fingerprint;
    use crate::pipeline::test_support::{Relay, StubSms, rule, wait_for_reports};

    #[tokio::test]
    async fn matched_message_is_dispatched() {
        let relay = Relay::new("138xxxx", "", vec![rule("1", "138xxxx")]).await;
        let message = InboundMessage::new("10086", "余额不足", 1000, Some("1"));

        let outcomes = relay.processor.process(&message).await;
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].is_skipped());
        assert_eq!(relay.sms.requests()[0].parts[0].text, "1,billing,10086,余额不足");
        assert!(relay.ledger.is_claimed(&fingerprint("10086", "余额不足", 1000)).await);
    }

    #[tokio::test]
    async fn unresolved_identity_skips_without_claiming() {
        let relay = Relay::new("", "", vec![rule("1", "138xxxx")]).await;
        let message = InboundMessage::new("10086", "hi", 1000, Some("9"));

        assert!(relay.processor.process(&message).await.is_empty());
        assert!(!relay.ledger.is_claimed(&message.fingerprint()).await);
        assert!(relay.sms.requests().is_empty());
    }

    #[tokio::test]
    async fn unmatched_message_is_not_claimed() {
        let relay = Relay::new("138xxxx", "186zzzz", vec![rule("1", "138xxxx")]).await;
        let message = InboundMessage::new("10086", "hi", 1000, Some("2"));

        assert!(relay.processor.process(&message).await.is_empty());
        assert!(!relay.ledger.is_claimed(&message.fingerprint()).await);
    }

    #[tokio::test]
    async fn only_first_matching_rule_is_applied() {
        let relay = Relay::new(
            "138xxxx",
            "",
            vec![rule("1", "138xxxx"), rule("2", "138xxxx")],
        )
        .await;
        let message = InboundMessage::new("10086", "hi", 1000, Some("1"));

        let outcomes = relay.processor.process(&message).await;
        assert_eq!(outcomes.len(), 1);
        let requests = relay.sms.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].parts[0].text.starts_with("1,"));
    }

    #[tokio::test]
    async fn claimed_message_reports_skipped() {
        let relay = Relay::new("138xxxx", "", vec![rule("1", "138xxxx")]).await;
        let message = InboundMessage::new("10086", "hi", 1000, Some("1"));

        relay.processor.process(&message).await;
        let again = relay.processor.process(&message).await;
        assert_eq!(again.len(), 1);
        assert!(again[0].is_skipped());
    }

    #[tokio::test]
    async fn accept_records_then_dispatches_in_background() {
        let relay = Relay::new("138xxxx", "", vec![rule("1", "138xxxx")]).await;
        let message = InboundMessage::new("10086", "余额不足", 1000, Some("1"));

        relay.processor.accept(message.clone()).await.unwrap();
        assert_eq!(relay.db.list_inbound().await.unwrap(), vec![message.clone()]);

        wait_for_reports(&relay.sink, 1).await;
        for _ in 0..200 {
            if !relay.sms.requests().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(relay.ledger.is_claimed(&message.fingerprint()).await);
        assert_eq!(relay.sms.requests().len(), 1);
    }

    #[tokio::test]
    async fn timed_out_live_worker_reports_failure_and_releases_attempt() {
        let relay = Relay::with_sms(
            "138xxxx",
            "",
            vec![rule("1", "138xxxx")],
            StubSms::slow(Duration::from_secs(5)),
        )
        .await;
        let processor = Arc::new(
            RelayProcessor::new(
                Arc::clone(&relay.db),
                relay.ledger.clone(),
                SimIdentityResolver::new("1", "2", "138xxxx", ""),
                RuleMatcher::default(),
                Arc::clone(&relay.rules),
                Arc::clone(&relay.coordinator),
            )
            .with_live_timeout(Duration::from_millis(100)),
        );
        let message = InboundMessage::new("10086", "余额不足", 1000, Some("1"));

        processor.accept(message.clone()).await.unwrap();

        // Email report plus the failed SMS report.
        wait_for_reports(&relay.sink, 2).await;
        let sms_reports: Vec<_> = relay
            .sink
            .reports()
            .into_iter()
            .filter(|r| r.report_type == "sms")
            .collect();
        assert_eq!(sms_reports.len(), 1);
        assert_eq!(sms_reports[0].forward_status, -1);
        assert_eq!(relay.tracker.in_flight().await, 0);
        assert!(relay.ledger.is_claimed(&message.fingerprint()).await);
        assert_eq!(relay.sms.requests().len(), 1);
    }
}
