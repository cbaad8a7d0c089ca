use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sms_relay::channels::email::{EmailTransport, SmtpEmailTransport, UnavailableEmail};
use sms_relay::channels::sms::{HttpSmsGateway, SmsTransport, UnavailableSms};
use sms_relay::config::{RelayConfig, SmtpConfig};
use sms_relay::dedup::DedupLedger;
use sms_relay::intake::{IntakeState, intake_routes};
use sms_relay::logging;
use sms_relay::pipeline::{
    DatabaseInbox, DeliveryTracker, DispatchCoordinator, MatchPolicy, ReconciliationScanner,
    RelayProcessor, RuleMatcher, delivery_channel, spawn_scanner,
};
use sms_relay::remote::{
    HttpReportSink, HttpRuleSource, LogReportSink, ReportingSink, RuleStore, spawn_rule_refresher,
};
use sms_relay::sim::SimIdentityResolver;
use sms_relay::store::{Database, LibSqlBackend};
use tracing_subscriber::util::SubscriberInitExt;

/// Timeout for every outbound HTTP call.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let config = RelayConfig::from_env();
    config.validate()?;

    // Initialize tracing: stderr, plus a rolling file when a log dir is configured.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let (subscriber, _log_guard) = logging::subscriber(filter, config.log_dir.as_deref())
        .context("Failed to set up log directory")?;
    subscriber.init();

    eprintln!("📨 SMS Relay v{}", env!("CARGO_PKG_VERSION"));

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Identity + rules ─────────────────────────────────────────────────
    let resolver = SimIdentityResolver::from_config(&config);
    let own_numbers = resolver.configured_numbers();
    if own_numbers.is_empty() {
        tracing::warn!("No own phone numbers configured; no message can match a rule");
    }
    eprintln!("   Own numbers: {}", own_numbers.join(", "));

    let rules = Arc::new(RuleStore::new(Arc::clone(&db)));
    rules.load_cached().await;

    // ── Reporting + transports ───────────────────────────────────────────
    let sink: Arc<dyn ReportingSink> = match &config.report_url {
        Some(url) => Arc::new(HttpReportSink::new(url.clone(), config.api_token.clone(), HTTP_TIMEOUT)?),
        None => {
            eprintln!("   Reporting: log only");
            Arc::new(LogReportSink)
        }
    };

    let sms: Arc<dyn SmsTransport> = match &config.gateway_url {
        Some(url) => Arc::new(HttpSmsGateway::new(url.clone(), config.api_token.clone(), HTTP_TIMEOUT)?),
        None => {
            eprintln!("   SMS gateway: not configured, relay SMS will be reported failed");
            Arc::new(UnavailableSms)
        }
    };

    let email: Arc<dyn EmailTransport> = match SmtpConfig::from_env() {
        Some(smtp) => {
            eprintln!("   SMTP: {}:{}", smtp.host, smtp.port);
            Arc::new(SmtpEmailTransport::new(smtp))
        }
        None => {
            eprintln!("   SMTP: not configured, relay email will be reported failed");
            Arc::new(UnavailableEmail)
        }
    };

    // ── Pipeline ─────────────────────────────────────────────────────────
    let ledger = DedupLedger::new(Arc::clone(&db));
    let tracker = Arc::new(DeliveryTracker::new(Arc::clone(&sink)));
    let (deliveries, delivery_rx) = delivery_channel();
    let tracker_handle = tokio::spawn(Arc::clone(&tracker).run(delivery_rx));

    let coordinator = Arc::new(
        DispatchCoordinator::new(
            ledger.clone(),
            sms,
            email,
            Arc::clone(&tracker),
            Arc::clone(&sink),
        )
        .with_fallback_email(config.fallback_email.clone()),
    );

    let processor = Arc::new(
        RelayProcessor::new(
            Arc::clone(&db),
            ledger.clone(),
            resolver,
            RuleMatcher::new(MatchPolicy::FirstMatch),
            Arc::clone(&rules),
            coordinator,
        )
        .with_live_timeout(config.live_worker_timeout),
    );

    // ── Background loops ─────────────────────────────────────────────────
    let refresher = match &config.rules_url {
        Some(url) => {
            let source = Arc::new(HttpRuleSource::new(url.clone(), config.api_token.clone(), HTTP_TIMEOUT)?);
            eprintln!("   Rules: {} (every {}s)", url, config.rule_refresh_interval.as_secs());
            Some(spawn_rule_refresher(
                Arc::clone(&rules),
                source,
                own_numbers,
                config.battery_path.clone(),
                config.rule_refresh_interval,
            ))
        }
        None => {
            eprintln!("   Rules: cached only ({} loaded)", rules.len());
            None
        }
    };

    let scanner = Arc::new(ReconciliationScanner::new(
        Arc::new(DatabaseInbox::new(Arc::clone(&db))),
        Arc::clone(&db),
        ledger.clone(),
        Arc::clone(&rules),
        Arc::clone(&processor),
    ));
    let (scanner_handle, scanner_shutdown) = spawn_scanner(scanner, config.scan_interval);
    eprintln!("   Reconciliation: every {}s", config.scan_interval.as_secs());

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = intake_routes(IntakeState {
        db: Arc::clone(&db),
        ledger,
        rules,
        processor,
        tracker: Arc::clone(&tracker),
        deliveries,
    });

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.http_port))?;
    eprintln!("   HTTP: http://0.0.0.0:{}\n", config.http_port);
    tracing::info!(port = config.http_port, "Relay HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
        .context("HTTP server failed")?;

    // ── Shutdown ─────────────────────────────────────────────────────────
    tracing::info!("Shutting down");
    scanner_shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
    if let Some((handle, shutdown)) = refresher {
        shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
        handle.abort();
    }
    scanner_handle.abort();
    tracker.discard_in_flight().await;
    tracker_handle.abort();

    Ok(())
}
