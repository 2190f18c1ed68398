//! In-app channel: bounded per-recipient inboxes with live push.

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::debug;

use super::{ChannelDispatcher, DeliveryOutcome};
use crate::notification::{Channel, Notification, NotificationId, Priority};

/// In-app channel configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InAppConfig {
    /// Unread messages kept per recipient.
    pub inbox_capacity: usize,
    /// Live push buffer; slow subscribers lag and skip.
    pub broadcast_capacity: usize,
}

impl Default for InAppConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 100,
            broadcast_capacity: 256,
        }
    }
}

/// A message delivered to a user's inbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InAppMessage {
    pub notification_id: NotificationId,
    pub recipient: String,
    pub priority: Priority,
    pub template: String,
    pub fields: Map<String, Value>,
    pub correlation_id: Option<String>,
    pub delivered_at: DateTime<Utc>,
}

/// In-app dispatcher.
///
/// Delivery is all-or-nothing across recipients: if any recipient's inbox is
/// full, nothing is delivered and the attempt fails.
pub struct InAppDispatcher {
    config: InAppConfig,
    inboxes: DashMap<String, VecDeque<InAppMessage>>,
    live_tx: broadcast::Sender<InAppMessage>,
}

impl InAppDispatcher {
    pub fn new(config: InAppConfig) -> Self {
        let (live_tx, _) = broadcast::channel(config.broadcast_capacity.max(1));
        Self {
            config,
            inboxes: DashMap::new(),
            live_tx,
        }
    }

    /// Live feed of delivered messages.
    pub fn subscribe(&self) -> broadcast::Receiver<InAppMessage> {
        self.live_tx.subscribe()
    }

    /// Unread messages for `recipient`, oldest first.
    pub fn inbox(&self, recipient: &str) -> Vec<InAppMessage> {
        self.inboxes
            .get(recipient)
            .map(|inbox| inbox.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Take and clear the unread messages for `recipient`.
    pub fn drain(&self, recipient: &str) -> Vec<InAppMessage> {
        self.inboxes
            .get_mut(recipient)
            .map(|mut inbox| inbox.drain(..).collect())
            .unwrap_or_default()
    }

    fn is_full(&self, recipient: &str) -> bool {
        self.inboxes
            .get(recipient)
            .is_some_and(|inbox| inbox.len() >= self.config.inbox_capacity)
    }
}

#[async_trait]
impl ChannelDispatcher for InAppDispatcher {
    fn channel(&self) -> Channel {
        Channel::InApp
    }

    async fn deliver(&self, notification: &Notification) -> DeliveryOutcome {
        let payload = notification.payload();
        let recipients: Vec<&str> = payload
            .recipients
            .iter()
            .map(|r| r.trim())
            .filter(|r| !r.is_empty())
            .collect();

        if recipients.is_empty() {
            return DeliveryOutcome::failed("no in-app recipients");
        }

        if let Some(full) = recipients.iter().find(|r| self.is_full(r)) {
            return DeliveryOutcome::failed(format!("inbox full for recipient {}", full));
        }

        let delivered_at = Utc::now();
        for recipient in recipients {
            let message = InAppMessage {
                notification_id: notification.id(),
                recipient: recipient.to_string(),
                priority: notification.priority(),
                template: payload.template.clone(),
                fields: payload.fields.clone(),
                correlation_id: notification.metadata().get("correlation_id").cloned(),
                delivered_at,
            };

            self.inboxes
                .entry(recipient.to_string())
                .or_default()
                .push_back(message.clone());

            // No live subscribers is fine; the inbox keeps the message.
            let _ = self.live_tx.send(message);
        }

        debug!(notification_id = %notification.id(), "In-app notification delivered");
        DeliveryOutcome::ok()
    }
}
