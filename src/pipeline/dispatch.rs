//! Dispatch coordinator: claims a fingerprint, then submits the relay SMS and
//! the audit email for one (message, rule) pair.
//!
//! The claim happens before any network call. A crash or submission failure
//! after the claim under-delivers rather than double-delivers; failed
//! attempts surface through the reporting sink for manual recovery.

use std::sync::Arc;

use chrono::Local;
use tracing::{debug, error, info, warn};

use crate::channels::email::{EmailTransport, audit_subject};
use crate::channels::sms::{SmsRequest, SmsTransport};
use crate::dedup::{DedupLedger, Fingerprint};
use crate::error::TransportError;
use crate::pipeline::tracker::DeliveryTracker;
use crate::pipeline::types::{
    AttemptState, DispatchAttempt, DispatchOutcome, ForwardRule, InboundMessage, RelayChannel,
};
use crate::remote::{DispatchReport, ReportingSink};

/// Relay body: rule id, remark, original sender, original body.
pub fn relay_body(rule: &ForwardRule, message: &InboundMessage) -> String {
    format!("{},{},{},{}", rule.id, rule.remark, message.sender, message.body)
}

pub struct DispatchCoordinator {
    ledger: DedupLedger,
    sms: Arc<dyn SmsTransport>,
    email: Arc<dyn EmailTransport>,
    tracker: Arc<DeliveryTracker>,
    sink: Arc<dyn ReportingSink>,
    fallback_email: Option<String>,
}

impl DispatchCoordinator {
    pub fn new(
        ledger: DedupLedger,
        sms: Arc<dyn SmsTransport>,
        email: Arc<dyn EmailTransport>,
        tracker: Arc<DeliveryTracker>,
        sink: Arc<dyn ReportingSink>,
    ) -> Self {
        Self {
            ledger,
            sms,
            email,
            tracker,
            sink,
            fallback_email: None,
        }
    }

    /// Address used for rules that carry no email.
    pub fn with_fallback_email(mut self, address: Option<String>) -> Self {
        self.fallback_email = address.filter(|a| !a.trim().is_empty());
        self
    }

    /// Relay one message under one rule, at most once per fingerprint.
    ///
    /// Returns after both submissions have been started. SMS completion is
    /// observed later by the tracker; the email runs on its own task.
    pub async fn dispatch(&self, message: &InboundMessage, rule: &ForwardRule) -> DispatchOutcome {
        let fingerprint = message.fingerprint();

        if self.ledger.is_claimed(&fingerprint).await {
            debug!(fingerprint = %fingerprint, "Already claimed, skipping");
            return DispatchOutcome::Skipped { fingerprint };
        }

        if !self.ledger.claim(&fingerprint).await {
            debug!(fingerprint = %fingerprint, "Lost claim race, skipping");
            return DispatchOutcome::Skipped { fingerprint };
        }

        info!(
            fingerprint = %fingerprint,
            rule_id = %rule.id,
            sender = %message.sender,
            "Fingerprint claimed, dispatching relay"
        );

        self.spawn_email(message, rule);

        let body = relay_body(rule, message);
        let request = SmsRequest::build(
            &fingerprint,
            &rule.operator_phone,
            message.sim_slot_id.as_deref(),
            &body,
        );
        let sms_parts = request.parts.len();

        let attempt = DispatchAttempt::new(
            fingerprint.clone(),
            rule.clone(),
            message.clone(),
            RelayChannel::Sms,
            sms_parts,
        );
        self.tracker.register(attempt, request.correlation_ids()).await;

        let sms = if rule.operator_phone.trim().is_empty() {
            let reason = TransportError::MissingDestination {
                channel: RelayChannel::Sms.label().to_string(),
                rule_id: rule.id.clone(),
            };
            self.tracker.fail(&fingerprint, &reason.to_string()).await;
            AttemptState::Failed
        } else {
            match self.sms.submit(&request).await {
                Ok(()) => {
                    debug!(fingerprint = %fingerprint, parts = sms_parts, transport = self.sms.name(), "Relay SMS pending");
                    AttemptState::Pending
                }
                Err(e) => {
                    self.tracker.fail(&fingerprint, &e.to_string()).await;
                    AttemptState::Failed
                }
            }
        };

        DispatchOutcome::Submitted {
            fingerprint,
            sms_parts,
            sms,
        }
    }

    /// Send the audit email on its own task and report the result.
    /// Resolve a registered SMS attempt as failed when its worker is cut short.
    ///
    /// Returns `false` if nothing was registered for the fingerprint or the
    /// attempt already reached a terminal state.
    pub async fn abandon(&self, fingerprint: &Fingerprint, reason: &str) -> bool {
        self.tracker.fail(fingerprint, reason).await
    }

    fn spawn_email(&self, message: &InboundMessage, rule: &ForwardRule) {
        let email = Arc::clone(&self.email);
        let sink = Arc::clone(&self.sink);
        let message = message.clone();
        let rule = rule.clone();

        let to = Some(rule.email_address.trim().to_string())
            .filter(|a| !a.is_empty())
            .or_else(|| self.fallback_email.clone());

        tokio::spawn(async move {
            let sent = match to {
                Some(to) => {
                    let subject = audit_subject(Local::now(), &message, &rule);
                    match email.send(&to, &subject, &message.body).await {
                        Ok(()) => {
                            debug!(to = %to, rule_id = %rule.id, state = ?AttemptState::Sent, "Relay email sent");
                            true
                        }
                        Err(e) => {
                            error!(to = %to, rule_id = %rule.id, error = %e, "Relay email failed");
                            false
                        }
                    }
                }
                None => {
                    let reason = TransportError::MissingDestination {
                        channel: RelayChannel::Email.label().to_string(),
                        rule_id: rule.id.clone(),
                    };
                    warn!(error = %reason, "Relay email skipped, no fallback address configured");
                    false
                }
            };

            sink.report(DispatchReport::now(&rule, &message, RelayChannel::Email, sent))
                .await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::dedup::fingerprint;
    use crate::pipeline::test_support::{Relay, StubSms, rule, wait_for_reports};

    #[tokio::test]
    async fn relays_sms_and_email_then_claims() {
        let relay = Relay::new("138xxxx", "", vec![]).await;
        let message = InboundMessage::new("10086", "余额不足", 1000, Some("1"));

        let outcome = relay.coordinator.dispatch(&message, &rule("7", "138xxxx")).await;
        assert!(!outcome.is_skipped());
        assert!(matches!(
            outcome,
            DispatchOutcome::Submitted { sms_parts: 1, sms: AttemptState::Pending, .. }
        ));

        let requests = relay.sms.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].destination, "139yyyy");
        assert_eq!(requests[0].sim_slot_id.as_deref(), Some("1"));
        assert_eq!(requests[0].parts[0].text, "7,billing,10086,余额不足");

        wait_for_reports(&relay.sink, 1).await;
        let sent = relay.email.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "a@b.com");
        assert!(sent[0].1.ends_with("【短信内容审核】10086,7,billing"));
        assert_eq!(sent[0].2, "余额不足");

        assert!(relay.ledger.is_claimed(&fingerprint("10086", "余额不足", 1000)).await);
        assert_eq!(relay.tracker.in_flight().await, 1);
    }

    #[tokio::test]
    async fn second_dispatch_is_skipped() {
        let relay = Relay::new("138xxxx", "", vec![]).await;
        let message = InboundMessage::new("10086", "余额不足", 1000, Some("1"));

        relay.coordinator.dispatch(&message, &rule("7", "138xxxx")).await;
        let again = relay.coordinator.dispatch(&message, &rule("7", "138xxxx")).await;

        assert!(again.is_skipped());
        assert_eq!(relay.sms.requests().len(), 1);
    }

    #[tokio::test]
    async fn same_bucket_observation_is_skipped() {
        let relay = Relay::new("138xxxx", "", vec![]).await;
        let live = InboundMessage::new("10086", "hi", 3_100, Some("1"));
        let stored = InboundMessage::new("10086", "hi", 5_900, None);

        relay.coordinator.dispatch(&live, &rule("7", "138xxxx")).await;
        assert!(relay.coordinator.dispatch(&stored, &rule("7", "138xxxx")).await.is_skipped());
    }

    #[tokio::test]
    async fn concurrent_dispatches_submit_once() {
        let relay = Relay::new("138xxxx", "", vec![]).await;
        let message = InboundMessage::new("95555", "code 1234", 42_000, Some("1"));
        let r = rule("7", "138xxxx");

        let (a, b) = tokio::join!(
            relay.coordinator.dispatch(&message, &r),
            relay.coordinator.dispatch(&message, &r)
        );

        assert_eq!([a.is_skipped(), b.is_skipped()].iter().filter(|s| **s).count(), 1);
        assert_eq!(relay.sms.requests().len(), 1);
    }

    #[tokio::test]
    async fn long_body_is_split_into_parts() {
        let relay = Relay::new("138xxxx", "", vec![]).await;
        let body = "x".repeat(140 - "7,billing,10086,".chars().count());
        let message = InboundMessage::new("10086", &body, 1000, None);

        let outcome = relay.coordinator.dispatch(&message, &rule("7", "138xxxx")).await;
        assert!(matches!(outcome, DispatchOutcome::Submitted { sms_parts: 2, .. }));
        assert_eq!(relay.sms.requests()[0].parts.len(), 2);
    }

    #[tokio::test]
    async fn submission_failure_keeps_claim_and_reports_failed() {
        let relay = Relay::with_sms("138xxxx", "", vec![], StubSms::failing()).await;
        let message = InboundMessage::new("10086", "x", 1000, None);

        let outcome = relay.coordinator.dispatch(&message, &rule("7", "138xxxx")).await;
        assert!(matches!(outcome, DispatchOutcome::Submitted { sms: AttemptState::Failed, .. }));
        assert!(relay.ledger.is_claimed(&message.fingerprint()).await);
        assert_eq!(relay.tracker.in_flight().await, 0);

        wait_for_reports(&relay.sink, 2).await;
        let reports = relay.sink.reports();
        let sms = reports.iter().find(|r| r.report_type == "sms").unwrap();
        assert_eq!(sms.forward_status, -1);
    }

    #[tokio::test]
    async fn missing_operator_phone_fails_without_submitting() {
        let relay = Relay::new("138xxxx", "", vec![]).await;
        let mut r = rule("7", "138xxxx");
        r.operator_phone.clear();

        let outcome = relay
            .coordinator
            .dispatch(&InboundMessage::new("a", "b", 0, None), &r)
            .await;
        assert!(matches!(outcome, DispatchOutcome::Submitted { sms: AttemptState::Failed, .. }));
        assert!(relay.sms.requests().is_empty());
        assert_eq!(relay.tracker.in_flight().await, 0);

        wait_for_reports(&relay.sink, 2).await;
        let reports = relay.sink.reports();
        let sms = reports.iter().find(|r| r.report_type == "sms").unwrap();
        assert_eq!(sms.forward_status, -1);
        assert_eq!(sms.id, 7);
    }

    #[tokio::test]
    async fn empty_email_uses_fallback() {
        let relay = Relay::new("138xxxx", "", vec![]).await;
        let coordinator = DispatchCoordinator::new(
            relay.ledger.clone(),
            relay.sms.clone(),
            relay.email.clone(),
            Arc::clone(&relay.tracker),
            relay.sink.clone(),
        )
        .with_fallback_email(Some("ops@relay.test".into()));
        let mut r = rule("7", "138xxxx");
        r.email_address.clear();

        coordinator.dispatch(&InboundMessage::new("a", "b", 0, None), &r).await;
        wait_for_reports(&relay.sink, 1).await;
        assert_eq!(relay.email.sent()[0].0, "ops@relay.test");
    }

    #[tokio::test]
    async fn empty_email_without_fallback_reports_failed() {
        let relay = Relay::new("138xxxx", "", vec![]).await;
        let mut r = rule("7", "138xxxx");
        r.email_address.clear();

        relay
            .coordinator
            .dispatch(&InboundMessage::new("a", "b", 0, None), &r)
            .await;
        wait_for_reports(&relay.sink, 1).await;

        assert!(relay.email.sent().is_empty());
        let reports = relay.sink.reports();
        assert_eq!(reports[0].report_type, "email");
        assert_eq!(reports[0].forward_status, -1);
    }
}
