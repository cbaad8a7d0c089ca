//! Configuration types, built from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Relay daemon configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Path to the libSQL database file.
    pub db_path: PathBuf,
    /// Port for the intake/admin HTTP server.
    pub http_port: u16,
    /// Phone number of the first SIM.
    pub phone_number_1: String,
    /// Phone number of the second SIM.
    pub phone_number_2: String,
    /// Slot identifier the platform reports for the first SIM.
    pub slot_1_id: String,
    /// Slot identifier the platform reports for the second SIM.
    pub slot_2_id: String,
    /// Forwarding-rule endpoint. Rule refresh is disabled when unset.
    pub rules_url: Option<String>,
    /// Audit report endpoint. Reports are only logged when unset.
    pub report_url: Option<String>,
    /// Value of the `Authorization` header sent to the rule and report endpoints.
    pub api_token: Option<SecretString>,
    /// SMS gateway endpoint. Relay submissions fail when unset.
    pub gateway_url: Option<String>,
    /// Address used when a rule has no email configured.
    pub fallback_email: Option<String>,
    /// Sysfs file holding the battery percentage.
    pub battery_path: PathBuf,
    /// Directory for rolling log files. File logging is off when unset.
    pub log_dir: Option<PathBuf>,
    pub rule_refresh_interval: Duration,
    pub scan_interval: Duration,
    /// Upper bound on how long a live-path worker may run.
    pub live_worker_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/sms-relay.db"),
            http_port: 8088,
            phone_number_1: String::new(),
            phone_number_2: String::new(),
            slot_1_id: "1".to_string(),
            slot_2_id: "2".to_string(),
            rules_url: None,
            report_url: None,
            api_token: None,
            gateway_url: None,
            fallback_email: None,
            battery_path: PathBuf::from("/sys/class/power_supply/battery/capacity"),
            log_dir: None,
            rule_refresh_interval: Duration::from_secs(60),
            scan_interval: Duration::from_secs(30),
            live_worker_timeout: Duration::from_secs(60),
        }
    }
}

impl RelayConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            db_path: env_opt("SMS_RELAY_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            http_port: env_parse("SMS_RELAY_HTTP_PORT").unwrap_or(defaults.http_port),
            phone_number_1: env_opt("SMS_RELAY_PHONE_1").unwrap_or_default(),
            phone_number_2: env_opt("SMS_RELAY_PHONE_2").unwrap_or_default(),
            slot_1_id: env_opt("SMS_RELAY_SLOT_1_ID").unwrap_or(defaults.slot_1_id),
            slot_2_id: env_opt("SMS_RELAY_SLOT_2_ID").unwrap_or(defaults.slot_2_id),
            rules_url: env_opt("SMS_RELAY_RULES_URL"),
            report_url: env_opt("SMS_RELAY_REPORT_URL"),
            api_token: env_opt("SMS_RELAY_API_TOKEN").map(SecretString::from),
            gateway_url: env_opt("SMS_RELAY_GATEWAY_URL"),
            fallback_email: env_opt("SMS_RELAY_FALLBACK_EMAIL"),
            battery_path: env_opt("SMS_RELAY_BATTERY_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.battery_path),
            log_dir: env_opt("SMS_RELAY_LOG_DIR").map(PathBuf::from),
            rule_refresh_interval: env_parse("SMS_RELAY_RULE_REFRESH_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.rule_refresh_interval),
            scan_interval: env_parse("SMS_RELAY_SCAN_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.scan_interval),
            live_worker_timeout: env_parse("SMS_RELAY_LIVE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.live_worker_timeout),
        }
    }

    /// Reject values the daemon cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("SMS_RELAY_RULE_REFRESH_SECS", self.rule_refresh_interval),
            ("SMS_RELAY_SCAN_INTERVAL_SECS", self.scan_interval),
            ("SMS_RELAY_LIVE_TIMEOUT_SECS", self.live_worker_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }

        if self.slot_1_id == self.slot_2_id {
            return Err(ConfigError::InvalidValue {
                key: "SMS_RELAY_SLOT_2_ID".to_string(),
                message: format!("must differ from slot 1 id \"{}\"", self.slot_1_id),
            });
        }
        Ok(())
    }
}

/// SMTP settings for the email relay. `None` when `SMTP_HOST` is unset.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl SmtpConfig {
    pub fn from_env() -> Option<Self> {
        let host = env_opt("SMTP_HOST")?;
        let username = env_opt("SMTP_USERNAME").unwrap_or_default();
        let from_address = env_opt("SMTP_FROM_ADDRESS").unwrap_or_else(|| username.clone());

        Some(Self {
            host,
            port: env_parse("SMTP_PORT").unwrap_or(465),
            username,
            password: SecretString::from(env_opt("SMTP_PASSWORD").unwrap_or_default()),
            from_address,
        })
    }
}

/// Read a non-empty, trimmed environment variable.
fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_opt(key).and_then(|s| s.parse().ok())
}
