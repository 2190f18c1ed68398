//! Channel dispatchers.
//!
//! One dispatcher per [`Channel`]:
//! - Email (SMTP via `lettre`)
//! - In-app (bounded per-recipient inboxes with live push)
//! - System (ops webhook, or a structured log event)

mod email;
mod in_app;
mod system;

pub use email::{EmailConfig, EmailDispatcher, MailError, MailTransport, SmtpMailTransport};
pub use in_app::{InAppConfig, InAppDispatcher, InAppMessage};
pub use system::{SystemConfig, SystemDispatcher, WebhookAuth, WebhookConfig};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::Result;
use crate::notification::{Channel, Notification};

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub success: bool,
    pub error_message: Option<String>,
}

impl DeliveryOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(message.into()),
        }
    }
}

/// Delivers notifications for one channel.
///
/// Delivery problems are reported through [`DeliveryOutcome`], never by
/// panicking or erroring; the engine bounds each call with a timeout.
#[async_trait]
pub trait ChannelDispatcher: Send + Sync {
    /// The channel this dispatcher serves.
    fn channel(&self) -> Channel;

    /// Attempt delivery once.
    async fn deliver(&self, notification: &Notification) -> DeliveryOutcome;
}

/// Channel configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    /// SMTP settings. Without them email notifications fail with a delivery error.
    pub email: Option<EmailConfig>,
    pub in_app: InAppConfig,
    pub system: SystemConfig,
}

/// Maps each channel to its dispatcher.
#[derive(Clone, Default)]
pub struct DispatcherRegistry {
    dispatchers: HashMap<Channel, Arc<dyn ChannelDispatcher>>,
}

impl DispatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the standard dispatchers from configuration.
    pub fn from_config(config: &ChannelsConfig) -> Result<Self> {
        let mut registry = Self::new()
            .with(Arc::new(InAppDispatcher::new(config.in_app.clone())))
            .with(Arc::new(SystemDispatcher::new(config.system.clone())?));

        match &config.email {
            Some(email) => {
                registry.register(Arc::new(EmailDispatcher::new(email.clone())?));
            }
            None => info!("No SMTP configuration, email channel disabled"),
        }

        Ok(registry)
    }

    /// Register a dispatcher, replacing any previous one for the same channel.
    pub fn register(&mut self, dispatcher: Arc<dyn ChannelDispatcher>) {
        self.dispatchers.insert(dispatcher.channel(), dispatcher);
    }

    pub fn with(mut self, dispatcher: Arc<dyn ChannelDispatcher>) -> Self {
        self.register(dispatcher);
        self
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn ChannelDispatcher>> {
        self.dispatchers.get(&channel).cloned()
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.dispatchers.keys().copied().collect()
    }
}

impl std::fmt::Debug for DispatcherRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherRegistry")
            .field("channels", &self.channels())
            .finish()
    }
}
