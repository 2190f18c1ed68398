//! Email channel over SMTP.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ChannelDispatcher, DeliveryOutcome};
use crate::notification::{Channel, Notification};
use crate::utils::http_client::install_rustls_provider;
use crate::{Error, Result};

static EMAIL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").unwrap()
});

/// Implicit-TLS SMTP port; every other port uses STARTTLS when TLS is on.
const SMTPS_PORT: u16 = 465;

/// SMTP configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailConfig {
    /// SMTP server host.
    pub smtp_host: String,
    /// SMTP server port.
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    /// Use TLS.
    #[serde(default = "default_use_tls")]
    pub use_tls: bool,
    /// Sender address.
    pub from_address: String,
    /// Sender display name.
    #[serde(default)]
    pub from_name: Option<String>,
    /// SMTP command timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Immediate resends after a transient SMTP error, within one attempt.
    #[serde(default = "default_transient_retries")]
    pub transient_retries: u32,
}

fn default_smtp_port() -> u16 {
    587
}

fn default_use_tls() -> bool {
    true
}

fn default_timeout() -> u64 {
    30
}

fn default_transient_retries() -> u32 {
    1
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_host: "localhost".to_string(),
            smtp_port: default_smtp_port(),
            smtp_username: None,
            smtp_password: None,
            use_tls: default_use_tls(),
            from_address: String::new(),
            from_name: None,
            timeout_secs: default_timeout(),
            transient_retries: default_transient_retries(),
        }
    }
}

impl EmailConfig {
    /// Copy with the password hidden, for logging.
    pub fn masked(&self) -> Self {
        Self {
            smtp_password: self.smtp_password.as_ref().map(|_| "********".to_string()),
            ..self.clone()
        }
    }
}

/// Error from a mail transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MailError {
    /// Worth resending (4xx reply, timeout, connection trouble).
    #[error("transient SMTP error: {0}")]
    Transient(String),
    /// Resending will not help (5xx reply, rejected address).
    #[error("permanent SMTP error: {0}")]
    Permanent(String),
}

impl From<lettre::transport::smtp::Error> for MailError {
    fn from(e: lettre::transport::smtp::Error) -> Self {
        if e.is_permanent() {
            Self::Permanent(e.to_string())
        } else {
            Self::Transient(e.to_string())
        }
    }
}

/// Sends a built message.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, message: Message) -> std::result::Result<(), MailError>;
}

/// [`MailTransport`] backed by an async SMTP connection pool.
pub struct SmtpMailTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailTransport {
    pub fn new(config: &EmailConfig) -> Result<Self> {
        let mut builder = if config.use_tls {
            install_rustls_provider();
            let builder = if config.smtp_port == SMTPS_PORT {
                AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
            } else {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            };
            builder.map_err(|e| Error::config(format!("SMTP relay configuration error: {}", e)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
        };

        builder = builder
            .port(config.smtp_port)
            .timeout(Some(Duration::from_secs(config.timeout_secs)));

        if let Some(username) = &config.smtp_username {
            builder = builder.credentials(Credentials::new(
                username.clone(),
                config.smtp_password.clone().unwrap_or_default(),
            ));
        }

        Ok(Self {
            mailer: builder.build(),
        })
    }
}

#[async_trait]
impl MailTransport for SmtpMailTransport {
    async fn send(&self, message: Message) -> std::result::Result<(), MailError> {
        self.mailer.send(message).await?;
        Ok(())
    }
}

/// Email dispatcher.
///
/// Subject comes from `fields.subject` (falling back to the template name),
/// the plain-text body from `fields.body` (falling back to a listing of the
/// fields), and an optional HTML alternative from `fields.html`. Recipients
/// that do not look like addresses are skipped; a notification with no usable
/// recipient fails.
pub struct EmailDispatcher {
    config: EmailConfig,
    from: Mailbox,
    transport: Arc<dyn MailTransport>,
}

impl EmailDispatcher {
    /// Create a dispatcher with an SMTP transport.
    pub fn new(config: EmailConfig) -> Result<Self> {
        let transport = Arc::new(SmtpMailTransport::new(&config)?);
        Self::with_transport(config, transport)
    }

    /// Create a dispatcher with a custom transport.
    pub fn with_transport(config: EmailConfig, transport: Arc<dyn MailTransport>) -> Result<Self> {
        let address: Address = config
            .from_address
            .parse()
            .map_err(|e| Error::config(format!("invalid from address: {}", e)))?;
        let from = Mailbox::new(config.from_name.clone(), address);

        Ok(Self {
            config,
            from,
            transport,
        })
    }

    /// Recipients that pass address validation.
    fn valid_recipients<'a>(&self, notification: &'a Notification) -> Vec<&'a str> {
        notification
            .payload()
            .recipients
            .iter()
            .map(|r| r.trim())
            .filter(|r| {
                let ok = EMAIL_PATTERN.is_match(r);
                if !ok {
                    warn!(notification_id = %notification.id(), recipient = %r, "Skipping invalid email recipient");
                }
                ok
            })
            .collect()
    }

    fn build_subject(notification: &Notification) -> String {
        let payload = notification.payload();
        payload
            .field_str("subject")
            .map(str::to_string)
            .unwrap_or_else(|| payload.template.clone())
    }

    fn build_body_text(notification: &Notification) -> String {
        let payload = notification.payload();
        if let Some(body) = payload.field_str("body") {
            return body.to_string();
        }

        let mut body = payload.template.clone();
        body.push('\n');
        for (key, value) in &payload.fields {
            let rendered = value
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| value.to_string());
            body.push_str(&format!("\n{}: {}", key, rendered));
        }
        body
    }

    fn build_message(&self, notification: &Notification) -> std::result::Result<Message, String> {
        let recipients = self.valid_recipients(notification);
        if recipients.is_empty() {
            return Err("no valid email recipients".to_string());
        }

        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(Self::build_subject(notification));

        for recipient in recipients {
            let mailbox: Mailbox = recipient
                .parse()
                .map_err(|e| format!("invalid recipient address {}: {}", recipient, e))?;
            builder = builder.to(mailbox);
        }

        let text = Self::build_body_text(notification);
        let message = match notification.payload().field_str("html") {
            Some(html) => builder.multipart(MultiPart::alternative_plain_html(text, html.to_string())),
            None => builder.header(ContentType::TEXT_PLAIN).body(text),
        };

        message.map_err(|e| format!("failed to build email: {}", e))
    }
}

#[async_trait]
impl ChannelDispatcher for EmailDispatcher {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn deliver(&self, notification: &Notification) -> DeliveryOutcome {
        let message = match self.build_message(notification) {
            Ok(message) => message,
            Err(e) => return DeliveryOutcome::failed(e),
        };

        let mut attempt = 0;
        loop {
            match self.transport.send(message.clone()).await {
                Ok(()) => {
                    debug!(notification_id = %notification.id(), attempt, "Email sent");
                    return DeliveryOutcome::ok();
                }
                Err(MailError::Transient(e)) if attempt < self.config.transient_retries => {
                    attempt += 1;
                    debug!(
                        notification_id = %notification.id(),
                        attempt,
                        error = %e,
                        "Transient SMTP error, resending"
                    );
                }
                Err(e) => return DeliveryOutcome::failed(e.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::notification::{NotificationPayload, NotificationRequest, Priority};

    fn config() -> EmailConfig {
        EmailConfig {
            from_address: "noreply@example.com".to_string(),
            from_name: Some("Dispatch".to_string()),
            ..Default::default()
        }
    }

    fn email(payload: NotificationPayload) -> Notification {
        Notification::new(
            NotificationRequest::new(Channel::Email, Priority::High, payload),
            Utc::now(),
        )
    }

    #[test]
    fn test_email_config_default() {
        let config = EmailConfig::default();
        assert_eq!(config.smtp_port, 587);
        assert!(config.use_tls);
        assert_eq!(config.transient_retries, 1);
    }

    #[test]
    fn test_masked_hides_password() {
        let config = EmailConfig {
            smtp_password: Some("hunter2".to_string()),
            ..config()
        };
        assert_eq!(config.masked().smtp_password.as_deref(), Some("********"));
        assert_eq!(EmailConfig::default().masked().smtp_password, None);
    }

    #[test]
    fn test_plain_transport_builds_without_connecting() {
        let config = EmailConfig {
            use_tls: false,
            smtp_port: 2525,
            smtp_username: Some("user".to_string()),
            smtp_password: Some("pass".to_string()),
            ..config()
        };
        assert!(SmtpMailTransport::new(&config).is_ok());
    }

    #[test]
    fn test_invalid_from_address_rejected() {
        let config = EmailConfig {
            from_address: "not an address".to_string(),
            ..config()
        };
        let transport = Arc::new(MockMailTransport::new());
        assert!(matches!(
            EmailDispatcher::with_transport(config, transport),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_subject_and_body_fallbacks() {
        let n = email(
            NotificationPayload::new("task_assigned")
                .recipient("a@example.com")
                .field("task", "Write docs"),
        );
        assert_eq!(EmailDispatcher::build_subject(&n), "task_assigned");
        let body = EmailDispatcher::build_body_text(&n);
        assert!(body.starts_with("task_assigned"));
        assert!(body.contains("task: Write docs"));

        let n = email(
            NotificationPayload::new("t")
                .field("subject", "Hello")
                .field("body", "World"),
        );
        assert_eq!(EmailDispatcher::build_subject(&n), "Hello");
        assert_eq!(EmailDispatcher::build_body_text(&n), "World");
    }

    #[tokio::test]
    async fn test_deliver_sends_to_valid_recipients_only() {
        let mut transport = MockMailTransport::new();
        transport
            .expect_send()
            .withf(|m: &Message| {
                let to: Vec<String> = m.envelope().to().iter().map(|a| a.to_string()).collect();
                to == vec!["good@example.com".to_string()]
            })
            .times(1)
            .returning(|_| Ok(()));

        let dispatcher = EmailDispatcher::with_transport(config(), Arc::new(transport)).unwrap();
        let n = email(
            NotificationPayload::new("welcome")
                .recipient("good@example.com")
                .recipient("not-an-email"),
        );

        assert_eq!(dispatcher.deliver(&n).await, DeliveryOutcome::ok());
    }

    #[tokio::test]
    async fn test_deliver_fails_without_valid_recipients() {
        let mut transport = MockMailTransport::new();
        transport.expect_send().never();

        let dispatcher = EmailDispatcher::with_transport(config(), Arc::new(transport)).unwrap();
        let outcome = dispatcher
            .deliver(&email(NotificationPayload::new("welcome").recipient("nope")))
            .await;

        assert!(!outcome.success);
        assert_eq!(
            outcome.error_message.as_deref(),
            Some("no valid email recipients")
        );
    }

    #[tokio::test]
    async fn test_transient_error_is_resent_once() {
        let mut transport = MockMailTransport::new();
        let mut calls = 0;
        transport.expect_send().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(MailError::Transient("421 try again later".to_string()))
            } else {
                Ok(())
            }
        });

        let dispatcher = EmailDispatcher::with_transport(config(), Arc::new(transport)).unwrap();
        let outcome = dispatcher
            .deliver(&email(NotificationPayload::new("t").recipient("a@example.com")))
            .await;

        assert!(outcome.success);
    }

    #[tokio::test]
    async fn test_persistent_transient_error_fails_after_budget() {
        let mut transport = MockMailTransport::new();
        transport
            .expect_send()
            .times(2)
            .returning(|_| Err(MailError::Transient("421 busy".to_string())));

        let dispatcher = EmailDispatcher::with_transport(config(), Arc::new(transport)).unwrap();
        let outcome = dispatcher
            .deliver(&email(NotificationPayload::new("t").recipient("a@example.com")))
            .await;

        assert!(!outcome.success);
        assert!(outcome.error_message.unwrap().contains("421 busy"));
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_resent() {
        let mut transport = MockMailTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_| Err(MailError::Permanent("550 no such user".to_string())));

        let dispatcher = EmailDispatcher::with_transport(config(), Arc::new(transport)).unwrap();
        let outcome = dispatcher
            .deliver(&email(NotificationPayload::new("t").recipient("a@example.com")))
            .await;

        assert!(!outcome.success);
        assert!(outcome.error_message.unwrap().contains("550"));
    }
}
