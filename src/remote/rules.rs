//! Rule store: the current forwarding-rule snapshot, refreshed from the
//! configuration service and cached in the database.
//!
//! Readers take a cheap `Arc` clone of the snapshot. A refresh swaps the whole
//! list at once, so a matcher never sees a half-updated rule set.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::RuleStoreError;
use crate::pipeline::types::ForwardRule;
use crate::store::Database;

/// Battery level reported when the sysfs file is unreadable.
pub const UNKNOWN_BATTERY: i32 = -1;

// ── Parsing ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(untagged)]
enum RulePayload {
    Bare(Vec<ForwardRule>),
    Enveloped { data: Vec<ForwardRule> },
}

/// Parse a rule payload and keep only rules owned by one of `own_numbers`.
///
/// Accepts a bare JSON array or the service's `{"data": [...]}` envelope.
pub fn parse_rules(payload: &str, own_numbers: &[String]) -> Result<Vec<ForwardRule>, RuleStoreError> {
    let rules = match serde_json::from_str::<RulePayload>(payload) {
        Ok(RulePayload::Bare(rules)) | Ok(RulePayload::Enveloped { data: rules }) => rules,
        Err(e) => return Err(RuleStoreError::ConfigParse(e.to_string())),
    };

    let total = rules.len();
    let kept: Vec<ForwardRule> = rules
        .into_iter()
        .filter(|r| own_numbers.iter().any(|n| *n == r.owner_phone))
        .collect();

    debug!(total, kept = kept.len(), "Parsed rule payload");
    Ok(kept)
}

/// Read the battery percentage from a sysfs-style file.
pub fn read_battery_percent(path: &Path) -> i32 {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(UNKNOWN_BATTERY)
}

// ── Source ──────────────────────────────────────────────────────────

/// Where fresh rule lists come from.
#[async_trait]
pub trait RuleSource: Send + Sync {
    async fn fetch(&self, own_numbers: &[String], battery: i32) -> Result<Vec<ForwardRule>, RuleStoreError>;
}

/// The remote configuration service.
pub struct HttpRuleSource {
    url: String,
    token: Option<SecretString>,
    client: reqwest::Client,
}

impl HttpRuleSource {
    pub fn new(url: String, token: Option<SecretString>, timeout: Duration) -> Result<Self, RuleStoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RuleStoreError::TransientNetwork(format!("HTTP client init failed: {e}")))?;

        Ok(Self { url, token, client })
    }
}

#[async_trait]
impl RuleSource for HttpRuleSource {
    async fn fetch(&self, own_numbers: &[String], battery: i32) -> Result<Vec<ForwardRule>, RuleStoreError> {
        let phones = own_numbers.join(",");
        let battery = battery.to_string();

        let mut builder = self
            .client
            .get(&self.url)
            .query(&[("phones", phones.as_str()), ("battery", battery.as_str())]);
        if let Some(token) = &self.token {
            builder = builder.header("Authorization", token.expose_secret());
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| RuleStoreError::TransientNetwork(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(RuleStoreError::Http {
                status: resp.status().as_u16(),
            });
        }

        let body = resp
            .text()
            .await
            .map_err(|e| RuleStoreError::TransientNetwork(e.to_string()))?;

        parse_rules(&body, own_numbers)
    }
}

// ── Store ───────────────────────────────────────────────────────────

/// Read-mostly holder of the current rule snapshot.
pub struct RuleStore {
    snapshot: RwLock<Arc<Vec<ForwardRule>>>,
    db: Arc<dyn Database>,
}

impl RuleStore {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Vec::new())),
            db,
        }
    }

    /// Current rules in service order.
    pub fn snapshot(&self) -> Arc<Vec<ForwardRule>> {
        match self.snapshot.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Swap in a new rule list wholesale.
    pub fn replace(&self, rules: Vec<ForwardRule>) {
        let rules = Arc::new(rules);
        match self.snapshot.write() {
            Ok(mut guard) => *guard = rules,
            Err(poisoned) => *poisoned.into_inner() = rules,
        }
    }

    /// Seed the snapshot from the database cache. Returns the number of rules loaded.
    pub async fn load_cached(&self) -> usize {
        match self.db.load_rules().await {
            Ok(rules) => {
                let count = rules.len();
                self.replace(rules);
                info!(count, "Loaded cached forwarding rules");
                count
            }
            Err(e) => {
                warn!(error = %e, "Failed to load cached rules, starting empty");
                0
            }
        }
    }

    /// Fetch a fresh list and swap it in.
    ///
    /// On any error the last-known-good snapshot stays in place. A malformed
    /// payload also leaves a diagnostic record for the operator.
    pub async fn refresh(
        &self,
        source: &dyn RuleSource,
        own_numbers: &[String],
        battery: i32,
    ) -> Result<usize, RuleStoreError> {
        let rules = match source.fetch(own_numbers, battery).await {
            Ok(rules) => rules,
            Err(e) => {
                if let RuleStoreError::ConfigParse(detail) = &e {
                    if let Err(db_err) = self.db.record_diagnostic("rule_store", detail).await {
                        error!(error = %db_err, "Failed to record rule parse diagnostic");
                    }
                }
                return Err(e);
            }
        };

        if let Err(e) = self.db.save_rules(&rules).await {
            warn!(error = %e, "Failed to cache fetched rules");
        }

        let count = rules.len();
        self.replace(rules);
        Ok(count)
    }
}

/// Spawn a background task that refreshes rules on a fixed interval.
///
/// The first refresh runs immediately. Returns a `JoinHandle` and a shutdown
/// flag; set the flag to stop the loop.
pub fn spawn_rule_refresher(
    store: Arc<RuleStore>,
    source: Arc<dyn RuleSource>,
    own_numbers: Vec<String>,
    battery_path: PathBuf,
    every: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(every_secs = every.as_secs(), "Rule refresher started");

        let mut tick = tokio::time::interval(every);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Rule refresher shutting down");
                return;
            }

            let battery = read_battery_percent(&battery_path);
            match store.refresh(source.as_ref(), &own_numbers, battery).await {
                Ok(count) => debug!(count, battery, "Rules refreshed"),
                Err(RuleStoreError::ConfigParse(detail)) => {
                    error!(detail = %detail, "Malformed rule payload, keeping last-known-good rules");
                }
                Err(e) => warn!(error = %e, "Rule refresh failed, retrying next tick"),
            }
        }
    });

    (handle, shutdown_flag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::store::LibSqlBackend;

    fn own() -> Vec<String> {
        vec!["138xxxx".to_string(), "186zzzz".to_string()]
    }

    struct StubSource {
        responses: Mutex<Vec<Result<Vec<ForwardRule>, RuleStoreError>>>,
    }

    impl StubSource {
        fn new(responses: Vec<Result<Vec<ForwardRule>, RuleStoreError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl RuleSource for StubSource {
        async fn fetch(&self, _own: &[String], _battery: i32) -> Result<Vec<ForwardRule>, RuleStoreError> {
            self.responses.lock().unwrap().remove(0)
        }
    }

    fn rule(id: &str, owner: &str) -> ForwardRule {
        ForwardRule {
            id: id.into(),
            owner_phone: owner.into(),
            ..Default::default()
        }
    }

    async fn store() -> (RuleStore, Arc<dyn Database>) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        (RuleStore::new(Arc::clone(&db)), db)
    }

    #[test]
    fn parses_bare_array() {
        let payload = r#"[{"id":"1","workPhone":"138xxxx","operatePhone":"139","email":"a@b.com","remark":"x"}]"#;
        let rules = parse_rules(payload, &own()).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].operator_phone, "139");
    }

    #[test]
    fn parses_data_envelope_with_numeric_ids() {
        let payload = r#"{"code":200,"data":[{"id":5,"workPhone":"186zzzz"},{"id":6,"workPhone":"000"}]}"#;
        let rules = parse_rules(payload, &own()).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, "5");
    }

    #[test]
    fn malformed_payload_is_config_parse_error() {
        let err = parse_rules("<html>oops</html>", &own()).unwrap_err();
        assert!(matches!(err, RuleStoreError::ConfigParse(_)));
    }

    #[test]
    fn unreadable_battery_is_unknown() {
        assert_eq!(read_battery_percent(Path::new("/nonexistent/capacity")), UNKNOWN_BATTERY);
    }

    #[test]
    fn battery_read_trims_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capacity");
        std::fs::write(&path, "87\n").unwrap();
        assert_eq!(read_battery_percent(&path), 87);
    }

    #[tokio::test]
    async fn refresh_swaps_snapshot_and_caches() {
        let (store, db) = store().await;
        let source = StubSource::new(vec![Ok(vec![rule("1", "138xxxx")])]);

        let count = store.refresh(&source, &own(), 50).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(store.snapshot()[0].id, "1");
        assert_eq!(db.load_rules().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn parse_failure_keeps_last_known_good_and_records_diagnostic() {
        let (store, db) = store().await;
        let source = StubSource::new(vec![
            Ok(vec![rule("1", "138xxxx")]),
            Err(RuleStoreError::ConfigParse("expected value".into())),
        ]);

        store.refresh(&source, &own(), 50).await.unwrap();
        let err = store.refresh(&source, &own(), 50).await.unwrap_err();

        assert!(matches!(err, RuleStoreError::ConfigParse(_)));
        assert_eq!(store.len(), 1);
        let diags = db.recent_diagnostics(10).await.unwrap();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].source, "rule_store");
    }

    #[tokio::test]
    async fn network_failure_keeps_snapshot_without_diagnostic() {
        let (store, db) = store().await;
        store.replace(vec![rule("9", "186zzzz")]);
        let source = StubSource::new(vec![Err(RuleStoreError::TransientNetwork("timeout".into()))]);

        assert!(store.refresh(&source, &own(), 50).await.is_err());
        assert_eq!(store.snapshot()[0].id, "9");
        assert!(db.recent_diagnostics(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn load_cached_seeds_snapshot() {
        let (store, db) = store().await;
        db.save_rules(&[rule("3", "138xxxx"), rule("4", "186zzzz")]).await.unwrap();

        assert_eq!(store.load_cached().await, 2);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn refresher_stops_on_shutdown_flag() {
        let (store, _db) = store().await;
        let source: Arc<dyn RuleSource> = Arc::new(StubSource::new(
            (0..8).map(|_| Ok(vec![rule("1", "138xxxx")])).collect(),
        ));

        let (handle, shutdown) = spawn_rule_refresher(
            Arc::new(store),
            source,
            own(),
            PathBuf::from("/nonexistent"),
            Duration::from_millis(20),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.store(true, Ordering::Relaxed);

        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }
}
