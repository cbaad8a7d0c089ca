//! Email relay channel: SMTP via lettre for outbound audit mail.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;

use crate::config::SmtpConfig;
use crate::error::TransportError;
use crate::pipeline::types::{ForwardRule, InboundMessage};

/// Email transport capability.
///
/// Synchronous from the core's point of view; callers invoke it off the hot path.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), TransportError>;
}

/// Subject line of a relay email: date, then the audit tag, then sender, rule id and remark.
pub fn audit_subject(now: DateTime<Local>, message: &InboundMessage, rule: &ForwardRule) -> String {
    format!(
        "{}【短信内容审核】{},{},{}",
        now.format("%Y年%m月%d日"),
        message.sender,
        rule.id,
        rule.remark
    )
}

// ── SMTP ────────────────────────────────────────────────────────────

/// SMTP transport. Each send opens its own connection on a blocking thread.
pub struct SmtpEmailTransport {
    config: SmtpConfig,
}

impl SmtpEmailTransport {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl EmailTransport for SmtpEmailTransport {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), TransportError> {
        let config = self.config.clone();
        let to = to.to_string();
        let subject = subject.to_string();
        let body = body.to_string();

        tokio::task::spawn_blocking(move || send_email(&config, &to, &subject, &body))
            .await
            .map_err(|e| TransportError::Submission {
                channel: "email".into(),
                reason: format!("SMTP task panicked: {e}"),
            })?
    }
}

/// Send an email via SMTP.
fn send_email(config: &SmtpConfig, to: &str, subject: &str, body: &str) -> Result<(), TransportError> {
    let email = Message::builder()
        .from(
            config
                .from_address
                .parse()
                .map_err(|e| submission_error(format!("Invalid from address: {e}")))?,
        )
        .to(to
            .parse()
            .map_err(|e| submission_error(format!("Invalid to address: {e}")))?)
        .subject(subject)
        .body(body.to_string())
        .map_err(|e| submission_error(format!("Failed to build email: {e}")))?;

    let creds = Credentials::new(
        config.username.clone(),
        config.password.expose_secret().to_string(),
    );

    let transport = SmtpTransport::relay(&config.host)
        .map_err(|e| submission_error(format!("SMTP relay error: {e}")))?
        .port(config.port)
        .credentials(creds)
        .build();

    transport
        .send(&email)
        .map_err(|e| submission_error(format!("SMTP send failed: {e}")))?;

    tracing::info!(to, "Relay email sent");
    Ok(())
}

fn submission_error(reason: String) -> TransportError {
    TransportError::Submission {
        channel: "email".into(),
        reason,
    }
}

/// Stand-in used when SMTP is not configured. Every send fails.
pub struct UnavailableEmail;

#[async_trait]
impl EmailTransport for UnavailableEmail {
    fn name(&self) -> &str {
        "unavailable"
    }

    async fn send(&self, _to: &str, _subject: &str, _body: &str) -> Result<(), TransportError> {
        Err(TransportError::Unavailable {
            channel: "email".into(),
            reason: "SMTP_HOST not set".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use secrecy::SecretString;

    #[test]
    fn subject_carries_date_sender_rule_and_remark() {
        let now = Local.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap();
        let message = InboundMessage::new("10086", "余额不足", 1000, Some("1"));
        let rule = ForwardRule {
            id: "7".into(),
            remark: "billing".into(),
            ..Default::default()
        };

        assert_eq!(
            audit_subject(now, &message, &rule),
            "2024年03月05日【短信内容审核】10086,7,billing"
        );
    }

    #[test]
    fn invalid_recipient_is_a_submission_error() {
        let config = SmtpConfig {
            host: "localhost".into(),
            port: 465,
            username: "relay@example.com".into(),
            password: SecretString::from("secret"),
            from_address: "relay@example.com".into(),
        };

        let err = send_email(&config, "not an address", "s", "b").unwrap_err();
        match err {
            TransportError::Submission { channel, reason } => {
                assert_eq!(channel, "email");
                assert!(reason.contains("Invalid to address"));
            }
            other => panic!("Expected Submission, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unavailable_transport_fails() {
        let err = UnavailableEmail.send("a@b.com", "s", "b").await.unwrap_err();
        assert!(matches!(err, TransportError::Unavailable { .. }));
    }
}
