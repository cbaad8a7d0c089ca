//! SMS transport: segmenting, correlation ids, and the completion-report shape.
//!
//! The core never sends a PDU itself. It builds an [`SmsRequest`] and hands it
//! to an [`SmsTransport`]; completions come back as [`DeliveryReport`]s on the
//! tracker's channel.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dedup::Fingerprint;
use crate::error::TransportError;

/// Single-segment threshold in characters. Longer bodies go out as a multipart send.
pub const SEGMENT_CHARS: usize = 70;

/// Platform send-result codes.
pub mod result_code {
    pub const OK: i32 = -1;
    pub const GENERIC_FAILURE: i32 = 1;
    pub const RADIO_OFF: i32 = 2;
    pub const NULL_PDU: i32 = 3;
    pub const NO_SERVICE: i32 = 4;
    /// Sent, but the device has no default SMS app to record it.
    pub const NO_DEFAULT_SMS_APP: i32 = 32;
}

/// Whether a result code counts as a successful submission.
pub fn is_success(code: i32) -> bool {
    matches!(code, result_code::OK | result_code::NO_DEFAULT_SMS_APP)
}

/// Human-readable label for a result code, for logs.
pub fn describe(code: i32) -> &'static str {
    match code {
        result_code::OK => "ok",
        result_code::NO_DEFAULT_SMS_APP => "ok (no default sms app)",
        result_code::GENERIC_FAILURE => "generic failure",
        result_code::RADIO_OFF => "radio off",
        result_code::NULL_PDU => "null pdu",
        result_code::NO_SERVICE => "no service",
        _ => "unknown",
    }
}

/// Correlation id for one part of the relay of `fingerprint`.
pub fn correlation_id(fingerprint: &Fingerprint, index: usize) -> String {
    format!("{fingerprint}#{index}")
}

/// Replace characters the carrier gateway mangles with their full-width forms.
pub fn escape_special(body: &str) -> String {
    body.chars()
        .map(|c| match c {
            '%' => '％',
            '+' => '＋',
            '-' => '－',
            other => other,
        })
        .collect()
}

/// Split a body into ordered segments of at most `max_chars` characters.
///
/// Counts `char`s, not bytes, so multi-byte text is never cut mid-character.
pub fn split_segments(body: &str, max_chars: usize) -> Vec<String> {
    if body.chars().count() <= max_chars || max_chars == 0 {
        return vec![body.to_string()];
    }

    let chars: Vec<char> = body.chars().collect();
    chars
        .chunks(max_chars)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

// ── Request / completion types ──────────────────────────────────────

/// One ordered segment of a relay send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SmsPart {
    pub correlation_id: String,
    pub index: usize,
    pub text: String,
}

/// A relay send handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SmsRequest {
    pub destination: String,
    /// Slot the original message arrived on; the relay leaves from the same SIM.
    pub sim_slot_id: Option<String>,
    pub parts: Vec<SmsPart>,
}

impl SmsRequest {
    /// Escape, split, and tag a relay body with per-part correlation ids.
    pub fn build(
        fingerprint: &Fingerprint,
        destination: &str,
        sim_slot_id: Option<&str>,
        body: &str,
    ) -> Self {
        let parts = split_segments(&escape_special(body), SEGMENT_CHARS)
            .into_iter()
            .enumerate()
            .map(|(index, text)| SmsPart {
                correlation_id: correlation_id(fingerprint, index),
                index,
                text,
            })
            .collect();

        Self {
            destination: destination.to_string(),
            sim_slot_id: sim_slot_id.map(String::from),
            parts,
        }
    }

    pub fn is_multipart(&self) -> bool {
        self.parts.len() > 1
    }

    pub fn correlation_ids(&self) -> Vec<String> {
        self.parts.iter().map(|p| p.correlation_id.clone()).collect()
    }
}

/// Asynchronous completion of one submitted part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReport {
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub result_code: i32,
}

impl DeliveryReport {
    pub fn new(correlation_id: impl Into<String>, result_code: i32) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            result_code,
        }
    }

    pub fn is_success(&self) -> bool {
        is_success(self.result_code)
    }
}

// ── Transport trait ─────────────────────────────────────────────────

/// Message transport capability.
///
/// `submit` returns once the request is accepted. Per-part outcomes arrive
/// later as [`DeliveryReport`]s keyed by each part's correlation id.
#[async_trait]
pub trait SmsTransport: Send + Sync {
    fn name(&self) -> &str;

    async fn submit(&self, request: &SmsRequest) -> Result<(), TransportError>;
}

/// HTTP gateway adapter.
///
/// POSTs the request as JSON. The gateway calls back with delivery reports on
/// `POST /api/sms/status`.
pub struct HttpSmsGateway {
    url: String,
    token: Option<SecretString>,
    client: reqwest::Client,
}

impl HttpSmsGateway {
    pub fn new(url: String, token: Option<SecretString>, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Unavailable {
                channel: "sms".into(),
                reason: format!("HTTP client init failed: {e}"),
            })?;

        Ok(Self { url, token, client })
    }
}

#[async_trait]
impl SmsTransport for HttpSmsGateway {
    fn name(&self) -> &str {
        "http-gateway"
    }

    async fn submit(&self, request: &SmsRequest) -> Result<(), TransportError> {
        let mut builder = self.client.post(&self.url).json(request);
        if let Some(token) = &self.token {
            builder = builder.header("Authorization", token.expose_secret());
        }

        let resp = builder.send().await.map_err(|e| TransportError::Submission {
            channel: "sms".into(),
            reason: e.to_string(),
        })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Submission {
                channel: "sms".into(),
                reason: format!("gateway returned {status}: {body}"),
            });
        }

        info!(
            destination = %request.destination,
            parts = request.parts.len(),
            "Relay SMS submitted to gateway"
        );
        Ok(())
    }
}

/// Stand-in used when no gateway is configured. Every submission fails.
pub struct UnavailableSms;

#[async_trait]
impl SmsTransport for UnavailableSms {
    fn name(&self) -> &str {
        "unavailable"
    }

    async fn submit(&self, request: &SmsRequest) -> Result<(), TransportError> {
        debug!(destination = %request.destination, "No SMS gateway configured");
        Err(TransportError::Unavailable {
            channel: "sms".into(),
            reason: "no gateway configured".into(),
        })
    }
}
