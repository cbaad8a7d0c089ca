//! Reporting sink: fire-and-forget audit records of each dispatch outcome.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::ReportError;
use crate::pipeline::types::{ForwardRule, InboundMessage, RelayChannel};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Audit record posted once per channel per dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    /// Rule id; 0 when the rule id is not numeric.
    pub id: i64,
    pub work_phone: String,
    pub sms_sender: String,
    pub sms_receive_time: String,
    pub sms_content: String,
    pub forward_time: String,
    /// `1` for success, `-1` for failure.
    pub forward_status: i8,
    pub report_type: String,
}

impl DispatchReport {
    pub fn new(
        rule: &ForwardRule,
        message: &InboundMessage,
        channel: RelayChannel,
        success: bool,
        forwarded_at: DateTime<Local>,
    ) -> Self {
        let received = Local
            .timestamp_millis_opt(message.received_at_millis)
            .single()
            .map(|t| t.format(TIME_FORMAT).to_string())
            .unwrap_or_default();

        Self {
            id: rule.numeric_id(),
            work_phone: rule.owner_phone.clone(),
            sms_sender: message.sender.clone(),
            sms_receive_time: received,
            sms_content: message.body.clone(),
            forward_time: forwarded_at.format(TIME_FORMAT).to_string(),
            forward_status: if success { 1 } else { -1 },
            report_type: channel.label().to_string(),
        }
    }

    /// Record for an outcome observed now.
    pub fn now(rule: &ForwardRule, message: &InboundMessage, channel: RelayChannel, success: bool) -> Self {
        Self::new(rule, message, channel, success, Local::now())
    }

    pub fn is_success(&self) -> bool {
        self.forward_status > 0
    }
}

/// Receives audit records. Failures stay inside the sink.
#[async_trait]
pub trait ReportingSink: Send + Sync {
    async fn report(&self, report: DispatchReport);
}

/// Posts records as JSON to the reporting service.
pub struct HttpReportSink {
    url: String,
    token: Option<SecretString>,
    client: reqwest::Client,
}

impl HttpReportSink {
    pub fn new(url: String, token: Option<SecretString>, timeout: Duration) -> Result<Self, ReportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ReportError::TransientNetwork(format!("HTTP client init failed: {e}")))?;

        Ok(Self { url, token, client })
    }

    async fn post(&self, report: &DispatchReport) -> Result<(), ReportError> {
        let mut builder = self.client.post(&self.url).json(report);
        if let Some(token) = &self.token {
            builder = builder.header("Authorization", token.expose_secret());
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| ReportError::TransientNetwork(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(ReportError::Rejected {
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ReportingSink for HttpReportSink {
    async fn report(&self, report: DispatchReport) {
        match self.post(&report).await {
            Ok(()) => debug!(
                rule_id = report.id,
                report_type = %report.report_type,
                status = report.forward_status,
                "Dispatch report posted"
            ),
            Err(e) => warn!(
                rule_id = report.id,
                report_type = %report.report_type,
                error = %e,
                "Dispatch report failed"
            ),
        }
    }
}

/// Log-only sink, used when no reporting endpoint is configured.
pub struct LogReportSink;

#[async_trait]
impl ReportingSink for LogReportSink {
    async fn report(&self, report: DispatchReport) {
        info!(
            rule_id = report.id,
            sender = %report.sms_sender,
            report_type = %report.report_type,
            status = report.forward_status,
            "Dispatch outcome"
        );
    }
}
