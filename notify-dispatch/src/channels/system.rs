//! System channel: operator-facing alerts.
//!
//! Posts to an ops webhook when one is configured, otherwise emits a
//! structured log event whose level follows the notification priority.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, header::HeaderMap};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{ChannelDispatcher, DeliveryOutcome};
use crate::notification::{Channel, Notification, Priority};
use crate::utils::http_client::build_client;
use crate::{Error, Result};

/// Ops webhook configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Webhook URL.
    pub url: String,
    /// HTTP method (default: POST).
    #[serde(default = "default_method")]
    pub method: String,
    /// Custom headers.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    pub auth: Option<WebhookAuth>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_timeout() -> u64 {
    10
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: default_method(),
            headers: Vec::new(),
            auth: None,
            timeout_secs: default_timeout(),
        }
    }
}

/// Webhook authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WebhookAuth {
    Bearer { token: String },
    Basic { username: String, password: String },
    Header { name: String, value: String },
}

impl WebhookAuth {
    fn masked(&self) -> Self {
        let hidden = "********".to_string();
        match self {
            Self::Bearer { .. } => Self::Bearer { token: hidden },
            Self::Basic { username, .. } => Self::Basic {
                username: username.clone(),
                password: hidden,
            },
            Self::Header { name, .. } => Self::Header {
                name: name.clone(),
                value: hidden,
            },
        }
    }
}

/// System channel configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Ops webhook. Without one, system notifications go to the log.
    pub webhook: Option<WebhookConfig>,
}

impl SystemConfig {
    /// Copy with webhook credentials hidden, for logging.
    pub fn masked(&self) -> Self {
        Self {
            webhook: self.webhook.as_ref().map(|w| WebhookConfig {
                auth: w.auth.as_ref().map(WebhookAuth::masked),
                ..w.clone()
            }),
        }
    }
}

struct WebhookTarget {
    config: WebhookConfig,
    client: Client,
}

/// System dispatcher.
pub struct SystemDispatcher {
    webhook: Option<WebhookTarget>,
}

impl SystemDispatcher {
    pub fn new(config: SystemConfig) -> Result<Self> {
        let webhook = match config.webhook {
            Some(webhook) => {
                Url::parse(&webhook.url).map_err(|e| {
                    Error::config(format!("invalid system webhook url {}: {}", webhook.url, e))
                })?;
                let client = build_client(Duration::from_secs(webhook.timeout_secs))?;
                Some(WebhookTarget {
                    config: webhook,
                    client,
                })
            }
            None => None,
        };

        Ok(Self { webhook })
    }

    fn build_headers(config: &WebhookConfig) -> HeaderMap {
        let mut headers = HeaderMap::new();

        for (name, value) in &config.headers {
            if let (Ok(name), Ok(value)) = (
                name.parse::<reqwest::header::HeaderName>(),
                value.parse::<reqwest::header::HeaderValue>(),
            ) {
                headers.insert(name, value);
            }
        }

        match &config.auth {
            Some(WebhookAuth::Bearer { token }) => {
                if let Ok(value) = format!("Bearer {}", token).parse() {
                    headers.insert(reqwest::header::AUTHORIZATION, value);
                }
            }
            Some(WebhookAuth::Header { name, value }) => {
                if let (Ok(name), Ok(value)) = (
                    name.parse::<reqwest::header::HeaderName>(),
                    value.parse::<reqwest::header::HeaderValue>(),
                ) {
                    headers.insert(name, value);
                }
            }
            // Applied on the request builder.
            Some(WebhookAuth::Basic { .. }) | None => {}
        }

        headers
    }

    fn build_payload(notification: &Notification) -> serde_json::Value {
        let payload = notification.payload();
        json!({
            "notification_id": notification.id(),
            "correlation_id": notification.metadata().get("correlation_id"),
            "priority": notification.priority(),
            "template": payload.template,
            "recipients": payload.recipients,
            "fields": payload.fields,
            "created_at": notification.created_at().to_rfc3339(),
            "retry_count": notification.retry_count(),
        })
    }

    async fn post(target: &WebhookTarget, notification: &Notification) -> DeliveryOutcome {
        let config = &target.config;
        let mut request = match config.method.to_uppercase().as_str() {
            "PUT" => target.client.put(&config.url),
            _ => target.client.post(&config.url),
        };

        request = request
            .headers(Self::build_headers(config))
            .json(&Self::build_payload(notification));

        if let Some(WebhookAuth::Basic { username, password }) = &config.auth {
            request = request.basic_auth(username, Some(password));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return DeliveryOutcome::failed(format!("Webhook request failed: {}", e)),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(notification_id = %notification.id(), %status, "System webhook rejected notification");
            return DeliveryOutcome::failed(format!("Webhook failed: {} - {}", status, body));
        }

        debug!(notification_id = %notification.id(), "System webhook notification sent");
        DeliveryOutcome::ok()
    }

    fn log(notification: &Notification) {
        let payload = notification.payload();
        let id = notification.id();
        let template = payload.template.as_str();
        let fields = serde_json::Value::Object(payload.fields.clone());

        match notification.priority() {
            Priority::Urgent => error!(notification_id = %id, template, %fields, "System notification"),
            Priority::High => warn!(notification_id = %id, template, %fields, "System notification"),
            Priority::Medium | Priority::Low => {
                info!(notification_id = %id, template, %fields, "System notification")
            }
        }
    }
}

#[async_trait]
impl ChannelDispatcher for SystemDispatcher {
    fn channel(&self) -> Channel {
        Channel::System
    }

    async fn deliver(&self, notification: &Notification) -> DeliveryOutcome {
        match &self.webhook {
            Some(target) => Self::post(target, notification).await,
            None => {
                Self::log(notification);
                DeliveryOutcome::ok()
            }
        }
    }
}
