//! Shared types for the relay pipeline.

use serde::{Deserialize, Serialize};

use crate::dedup::Fingerprint;

// ── Inbound message ─────────────────────────────────────────────────

/// A short message observed on the device.
///
/// Produced by the live intake or by a history scan; never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    /// Originating phone number.
    pub sender: String,
    /// Message body.
    pub body: String,
    /// Receive timestamp in epoch milliseconds.
    pub received_at_millis: i64,
    /// SIM slot/subscription identifier the platform attached, if any.
    #[serde(default)]
    pub sim_slot_id: Option<String>,
}

impl InboundMessage {
    pub fn new(sender: &str, body: &str, received_at_millis: i64, sim_slot_id: Option<&str>) -> Self {
        Self {
            sender: sender.to_string(),
            body: body.to_string(),
            received_at_millis,
            sim_slot_id: sim_slot_id.map(String::from),
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self)
    }
}

// ── Forward rule ────────────────────────────────────────────────────

/// A forwarding rule as served by the configuration service.
///
/// All fields are free-form strings on the wire; numeric values are
/// stringified and missing ones default to empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRule {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: String,
    /// Own number this rule applies to.
    #[serde(rename = "workPhone", default, deserialize_with = "lenient_string")]
    pub owner_phone: String,
    /// Relay SMS destination.
    #[serde(rename = "operatePhone", default, deserialize_with = "lenient_string")]
    pub operator_phone: String,
    #[serde(rename = "email", default, deserialize_with = "lenient_string")]
    pub email_address: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub remark: String,
}

impl ForwardRule {
    /// Numeric rule id as used by the reporting service. Non-numeric ids report as 0.
    pub fn numeric_id(&self) -> i64 {
        self.id.trim().parse().unwrap_or(0)
    }
}

/// Accept strings, numbers, booleans, or null for a string field.
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    })
}

// ── Dispatch attempt ────────────────────────────────────────────────

/// Relay channel of a dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayChannel {
    Sms,
    Email,
}

impl RelayChannel {
    /// Value of `reportType` in audit records.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Sms => "sms",
            Self::Email => "email",
        }
    }
}

/// Lifecycle of a dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    /// Submitted, waiting for the transport's completion.
    Pending,
    /// Handed to a fire-and-forget transport.
    Sent,
    Confirmed,
    Failed,
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed)
    }
}

/// One channel send for a matched (message, rule) pair.
#[derive(Debug, Clone)]
pub struct DispatchAttempt {
    pub fingerprint: Fingerprint,
    pub rule: ForwardRule,
    pub message: InboundMessage,
    pub channel: RelayChannel,
    pub state: AttemptState,
    pub part_count: usize,
    pub parts_confirmed: usize,
    pub parts_failed: usize,
}

impl DispatchAttempt {
    pub fn new(
        fingerprint: Fingerprint,
        rule: ForwardRule,
        message: InboundMessage,
        channel: RelayChannel,
        part_count: usize,
    ) -> Self {
        Self {
            fingerprint,
            rule,
            message,
            channel,
            state: AttemptState::Pending,
            part_count,
            parts_confirmed: 0,
            parts_failed: 0,
        }
    }
}

/// Result of handing a (message, rule) pair to the dispatch coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The fingerprint was already claimed; nothing was submitted.
    Skipped { fingerprint: Fingerprint },
    /// Relay SMS and email were submitted.
    Submitted {
        fingerprint: Fingerprint,
        /// Number of SMS segments submitted.
        sms_parts: usize,
        /// SMS attempt state right after submission.
        sms: AttemptState,
    },
}

impl DispatchOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        match self {
            Self::Skipped { fingerprint } | Self::Submitted { fingerprint, .. } => fingerprint,
        }
    }
}
