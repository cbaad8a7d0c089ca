//! HTTP surface: live interception intake, transport callbacks, and operator endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::channels::sms::DeliveryReport;
use crate::dedup::DedupLedger;
use crate::pipeline::tracker::DeliverySender;
use crate::pipeline::types::InboundMessage;
use crate::pipeline::{DeliveryTracker, RelayProcessor};
use crate::remote::RuleStore;
use crate::store::Database;

/// Number of diagnostics returned by `GET /api/diagnostics`.
const DIAGNOSTICS_LIMIT: usize = 50;

/// Shared state for the intake routes.
#[derive(Clone)]
pub struct IntakeState {
    pub db: Arc<dyn Database>,
    pub ledger: DedupLedger,
    pub rules: Arc<RuleStore>,
    pub processor: Arc<RelayProcessor>,
    pub tracker: Arc<DeliveryTracker>,
    pub deliveries: DeliverySender,
}

/// GET /health
async fn health(State(state): State<IntakeState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "claimed": state.ledger.count().await,
        "inFlight": state.tracker.in_flight().await,
        "rules": state.rules.len(),
    }))
}

/// POST /api/sms/inbound
///
/// Records the message and returns 202 before any dispatch work starts.
async fn inbound(
    State(state): State<IntakeState>,
    Json(message): Json<InboundMessage>,
) -> impl IntoResponse {
    let fingerprint = message.fingerprint();
    match state.processor.accept(message).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"fingerprint": fingerprint})),
        )
            .into_response(),
        Err(e) => {
            error!(fingerprint = %fingerprint, error = %e, "Failed to record inbound message");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "failed to record message"})),
            )
                .into_response()
        }
    }
}

/// POST /api/sms/status
///
/// Transport completion callback, forwarded to the delivery tracker.
async fn delivery_status(
    State(state): State<IntakeState>,
    Json(report): Json<DeliveryReport>,
) -> impl IntoResponse {
    if state.deliveries.send(report).is_err() {
        warn!("Delivery tracker is not running, report dropped");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::ACCEPTED
}

/// POST /api/ledger/clear
async fn clear_ledger(State(state): State<IntakeState>) -> impl IntoResponse {
    match state.ledger.clear_all().await {
        Ok(cleared) => Json(serde_json::json!({"cleared": cleared})).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

/// GET /api/messages
///
/// The local message cache as of the last reconciliation pass.
async fn messages(State(state): State<IntakeState>) -> impl IntoResponse {
    match state.db.list_message_cache().await {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

/// GET /api/diagnostics
async fn diagnostics(State(state): State<IntakeState>) -> impl IntoResponse {
    match state.db.recent_diagnostics(DIAGNOSTICS_LIMIT).await {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

/// Build the relay's HTTP routes.
pub fn intake_routes(state: IntakeState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/sms/inbound", post(inbound))
        .route("/api/sms/status", post(delivery_status))
        .route("/api/ledger/clear", post(clear_ledger))
        .route("/api/messages", get(messages))
        .route("/api/diagnostics", get(diagnostics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
