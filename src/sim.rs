//! SIM identity resolution. Maps a slot identifier to the locally configured number.

use tracing::debug;

use crate::config::RelayConfig;

/// Resolves the own-number a message was received on.
#[derive(Debug, Clone, Default)]
pub struct SimIdentityResolver {
    slot_1_id: String,
    slot_2_id: String,
    phone_number_1: String,
    phone_number_2: String,
}

impl SimIdentityResolver {
    pub fn new(
        slot_1_id: impl Into<String>,
        slot_2_id: impl Into<String>,
        phone_number_1: impl Into<String>,
        phone_number_2: impl Into<String>,
    ) -> Self {
        Self {
            slot_1_id: slot_1_id.into(),
            slot_2_id: slot_2_id.into(),
            phone_number_1: phone_number_1.into(),
            phone_number_2: phone_number_2.into(),
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(
            config.slot_1_id.clone(),
            config.slot_2_id.clone(),
            config.phone_number_1.clone(),
            config.phone_number_2.clone(),
        )
    }

    /// Map a slot id to its configured phone number.
    ///
    /// Known slot ids map exactly. Unknown or absent ids fall back to the
    /// first configured number, then the second. Returns an empty string when
    /// nothing is configured; callers treat that as "no rule can match".
    pub fn resolve_phone_number(&self, sim_slot_id: Option<&str>) -> String {
        let resolved = match sim_slot_id.map(str::trim) {
            Some(slot) if slot == self.slot_1_id => self.phone_number_1.clone(),
            Some(slot) if slot == self.slot_2_id => self.phone_number_2.clone(),
            _ => self.fallback_number().to_string(),
        };

        debug!(slot = ?sim_slot_id, resolved = %resolved, "Resolved SIM identity");
        resolved
    }

    /// Configured own numbers in slot order, skipping empty ones.
    pub fn configured_numbers(&self) -> Vec<String> {
        [&self.phone_number_1, &self.phone_number_2]
            .into_iter()
            .filter(|n| !n.is_empty())
            .cloned()
            .collect()
    }

    fn fallback_number(&self) -> &str {
        if self.phone_number_1.is_empty() {
            &self.phone_number_2
        } else {
            &self.phone_number_1
        }
    }
}
