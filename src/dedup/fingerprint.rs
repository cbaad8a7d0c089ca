//! Stable identity for an observed message.
//!
//! The live intake and the history store stamp the same physical message with
//! slightly different clocks, so the timestamp is bucketed before it becomes
//! part of the key.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::pipeline::types::InboundMessage;

/// Timestamp bucket width in milliseconds.
pub const BUCKET_MILLIS: i64 = 3_000;

/// Deterministic dedup key: `sender|body|bucketed_timestamp`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(message: &InboundMessage) -> Self {
        fingerprint(&message.sender, &message.body, message.received_at_millis)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Derive the fingerprint of a message. Pure; no salt, no machine-local state.
pub fn fingerprint(sender: &str, body: &str, timestamp_millis: i64) -> Fingerprint {
    Fingerprint(format!("{sender}|{body}|{}", normalize(timestamp_millis)))
}

/// Floor a timestamp to the start of its bucket.
fn normalize(timestamp_millis: i64) -> i64 {
    timestamp_millis.div_euclid(BUCKET_MILLIS) * BUCKET_MILLIS
}
