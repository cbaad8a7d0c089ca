//! Recording stubs and a fully wired relay for pipeline tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::channels::email::EmailTransport;
use crate::channels::sms::{SmsRequest, SmsTransport};
use crate::dedup::DedupLedger;
use crate::error::TransportError;
use crate::pipeline::dispatch::DispatchCoordinator;
use crate::pipeline::processor::RelayProcessor;
use crate::pipeline::rules::RuleMatcher;
use crate::pipeline::tracker::DeliveryTracker;
use crate::pipeline::types::ForwardRule;
use crate::remote::{DispatchReport, ReportingSink, RuleStore};
use crate::sim::SimIdentityResolver;
use crate::store::{Database, LibSqlBackend};

#[derive(Default)]
pub struct StubSms {
    pub requests: Mutex<Vec<SmsRequest>>,
    pub fail: bool,
    /// Held after recording the request, before answering.
    pub delay: Option<Duration>,
}

impl StubSms {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn requests(&self) -> Vec<SmsRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl SmsTransport for StubSms {
    fn name(&self) -> &str {
        "stub"
    }

    async fn submit(&self, request: &SmsRequest) -> Result<(), TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(TransportError::Submission {
                channel: "sms".into(),
                reason: "stub failure".into(),
            });
        }
        Ok(())
    }
}

/// (to, subject, body) per send.
#[derive(Default)]
pub struct StubEmail {
    pub sent: Mutex<Vec<(String, String, String)>>,
}

impl StubEmail {
    pub fn sent(&self) -> Vec<(String, String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl EmailTransport for StubEmail {
    fn name(&self) -> &str {
        "stub"
    }

    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), TransportError> {
        self.sent
            .lock()
            .unwrap()
            .push((to.into(), subject.into(), body.into()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub reports: Mutex<Vec<DispatchReport>>,
}

impl RecordingSink {
    pub fn reports(&self) -> Vec<DispatchReport> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReportingSink for RecordingSink {
    async fn report(&self, report: DispatchReport) {
        self.reports.lock().unwrap().push(report);
    }
}

/// Poll until the sink has seen `count` reports. Email reports arrive from a spawned task.
pub async fn wait_for_reports(sink: &RecordingSink, count: usize) {
    for _ in 0..200 {
        if sink.reports.lock().unwrap().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {count} reports, got {}", sink.reports().len());
}

pub fn rule(id: &str, owner: &str) -> ForwardRule {
    ForwardRule {
        id: id.into(),
        owner_phone: owner.into(),
        operator_phone: "139yyyy".into(),
        email_address: "a@b.com".into(),
        remark: "billing".into(),
    }
}

/// Every pipeline component wired over an in-memory database.
pub struct Relay {
    pub db: Arc<dyn Database>,
    pub ledger: DedupLedger,
    pub sms: Arc<StubSms>,
    pub email: Arc<StubEmail>,
    pub sink: Arc<RecordingSink>,
    pub tracker: Arc<DeliveryTracker>,
    pub rules: Arc<RuleStore>,
    pub coordinator: Arc<DispatchCoordinator>,
    pub processor: Arc<RelayProcessor>,
}

impl Relay {
    pub async fn new(phone_1: &str, phone_2: &str, rules: Vec<ForwardRule>) -> Self {
        Self::with_sms(phone_1, phone_2, rules, StubSms::default()).await
    }

    pub async fn with_sms(phone_1: &str, phone_2: &str, rules: Vec<ForwardRule>, sms: StubSms) -> Self {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let ledger = DedupLedger::new(Arc::clone(&db));
        let sms = Arc::new(sms);
        let email = Arc::new(StubEmail::default());
        let sink = Arc::new(RecordingSink::default());
        let tracker = Arc::new(DeliveryTracker::new(sink.clone()));

        let store = Arc::new(RuleStore::new(Arc::clone(&db)));
        store.replace(rules);

        let coordinator = Arc::new(DispatchCoordinator::new(
            ledger.clone(),
            sms.clone(),
            email.clone(),
            Arc::clone(&tracker),
            sink.clone(),
        ));
        let processor = Arc::new(RelayProcessor::new(
            Arc::clone(&db),
            ledger.clone(),
            SimIdentityResolver::new("1", "2", phone_1, phone_2),
            RuleMatcher::default(),
            Arc::clone(&store),
            Arc::clone(&coordinator),
        ));

        Self {
            db,
            ledger,
            sms,
            email,
            sink,
            tracker,
            rules: store,
            coordinator,
            processor,
        }
    }
}
