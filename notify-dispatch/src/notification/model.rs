//! Notification data model and status state machine.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{Display, EnumIter, EnumString};
use uuid::Uuid;

use super::events::StatusTransition;
use crate::dispatch::RetryPolicy;
use crate::{Error, Result};

/// Unique notification identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(Uuid);

impl NotificationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NotificationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NotificationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for NotificationId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::validation(format!("invalid notification id {}: {}", s, e)))
    }
}

/// Delivery channel.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Channel {
    Email,
    InApp,
    System,
}

/// Scheduling class. Ordered from lowest to highest.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Priority {
    /// Informational.
    Low,
    /// Standard notifications.
    Medium,
    /// Important events.
    High,
    /// Requires immediate attention.
    Urgent,
}

impl Priority {
    /// Priorities in dispatch order, highest first.
    pub const DISPATCH_ORDER: [Priority; 4] = [
        Priority::Urgent,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];
}

/// Notification status.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotificationStatus {
    /// Waiting to be delivered (queued, scheduled, or in flight).
    Pending,
    /// Delivered by its channel.
    Sent,
    /// Last attempt failed. Retryable until the retry policy is exhausted.
    Failed,
    /// Abandoned. No further transitions.
    Cancelled,
}

impl NotificationStatus {
    /// Statuses reachable from `self` in one transition.
    pub fn allowed_transitions(self) -> &'static [NotificationStatus] {
        use NotificationStatus::*;
        match self {
            Pending => &[Sent, Failed, Cancelled],
            Failed => &[Pending, Cancelled],
            // Delivery later reported as bounced.
            Sent => &[Failed],
            Cancelled => &[],
        }
    }

    pub fn can_transition_to(self, to: NotificationStatus) -> bool {
        self.allowed_transitions().contains(&to)
    }
}

/// Why a notification ended up cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CancelReason {
    /// Cancelled by a caller.
    Requested,
    /// Still undelivered when the engine shut down.
    Shutdown,
}

/// One recorded delivery failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    /// `retry_count` at the moment of the failure, before it was incremented.
    pub retry_count: u32,
}

/// Delivery content. Inert to the engine; interpreted by channel dispatchers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    /// Template name.
    pub template: String,
    /// Recipient addresses or user ids, depending on the channel.
    #[serde(default)]
    pub recipients: Vec<String>,
    /// Structured template fields.
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl NotificationPayload {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            ..Default::default()
        }
    }

    pub fn recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipients.push(recipient.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// String value of a field, if present and a string.
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }
}

/// A request to dispatch a notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub channel: Channel,
    pub priority: Priority,
    pub payload: NotificationPayload,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl NotificationRequest {
    pub fn new(channel: Channel, priority: Priority, payload: NotificationPayload) -> Self {
        Self {
            channel,
            priority,
            payload,
            scheduled_for: None,
            metadata: HashMap::new(),
        }
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// The unit of work. Status only changes through [`Notification::transition`].
#[derive(Debug, Clone)]
pub struct Notification {
    id: NotificationId,
    channel: Channel,
    priority: Priority,
    payload: NotificationPayload,
    status: NotificationStatus,
    retry_count: u32,
    error_history: Vec<ErrorRecord>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    scheduled_for: Option<DateTime<Utc>>,
    cancel_reason: Option<CancelReason>,
    metadata: HashMap<String, String>,
}

impl Notification {
    /// Create a pending notification from a request.
    pub fn new(request: NotificationRequest, now: DateTime<Utc>) -> Self {
        let NotificationRequest {
            channel,
            priority,
            payload,
            scheduled_for,
            mut metadata,
        } = request;

        metadata
            .entry("correlation_id".to_string())
            .or_insert_with(|| Uuid::new_v4().to_string());

        Self {
            id: NotificationId::new(),
            channel,
            priority,
            payload,
            status: NotificationStatus::Pending,
            retry_count: 0,
            error_history: Vec::new(),
            created_at: now,
            updated_at: now,
            scheduled_for,
            cancel_reason: None,
            metadata,
        }
    }

    pub fn id(&self) -> NotificationId {
        self.id
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn payload(&self) -> &NotificationPayload {
        &self.payload
    }

    pub fn status(&self) -> NotificationStatus {
        self.status
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn error_history(&self) -> &[ErrorRecord] {
        &self.error_history
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn scheduled_for(&self) -> Option<DateTime<Utc>> {
        self.scheduled_for
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.cancel_reason
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Move to `to`.
    ///
    /// A transition to `Failed` must carry a non-empty `error`; it is recorded in
    /// the error history and `retry_count` is incremented afterwards. On error the
    /// notification is left unchanged.
    pub fn transition(
        &mut self,
        to: NotificationStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<StatusTransition> {
        let from = self.status;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition { from, to });
        }

        let failure = if to == NotificationStatus::Failed {
            match error.map(str::trim) {
                Some(message) if !message.is_empty() => Some(message.to_string()),
                _ => {
                    return Err(Error::validation(
                        "a transition to failed requires an error message",
                    ));
                }
            }
        } else {
            None
        };

        self.status = to;
        self.updated_at = now;

        if let Some(message) = &failure {
            self.error_history.push(ErrorRecord {
                timestamp: now,
                message: message.clone(),
                retry_count: self.retry_count,
            });
            self.retry_count += 1;
        }

        Ok(StatusTransition {
            id: self.id,
            channel: self.channel,
            priority: self.priority,
            from,
            to,
            at: now,
            error: failure,
        })
    }

    /// Cancel with a recorded reason.
    pub fn cancel(&mut self, reason: CancelReason, now: DateTime<Utc>) -> Result<StatusTransition> {
        let transition = self.transition(NotificationStatus::Cancelled, None, now)?;
        self.cancel_reason = Some(reason);
        Ok(transition)
    }

    /// Timestamp of the most recent failure.
    pub fn last_failure_at(&self) -> Option<DateTime<Utc>> {
        self.error_history.iter().map(|e| e.timestamp).max()
    }

    /// When this notification becomes retry-eligible, if it ever will.
    pub fn next_retry_at(&self, policy: &RetryPolicy) -> Option<DateTime<Utc>> {
        if self.status != NotificationStatus::Failed {
            return None;
        }
        policy.next_eligible_at(
            self.last_failure_at().unwrap_or(self.created_at),
            self.retry_count,
        )
    }

    /// Whether the notification may go back to `Pending` now.
    pub fn can_retry(&self, policy: &RetryPolicy, now: DateTime<Utc>) -> bool {
        self.next_retry_at(policy).is_some_and(|at| now >= at)
    }

    /// No automatic transition will ever happen again.
    pub fn is_terminal(&self, policy: &RetryPolicy) -> bool {
        match self.status {
            NotificationStatus::Sent | NotificationStatus::Cancelled => true,
            NotificationStatus::Failed => policy.is_exhausted(self.retry_count),
            NotificationStatus::Pending => false,
        }
    }

    /// Read-only copy for callers outside the engine.
    pub fn snapshot(&self) -> NotificationSnapshot {
        NotificationSnapshot {
            id: self.id,
            channel: self.channel,
            priority: self.priority,
            payload: self.payload.clone(),
            status: self.status,
            retry_count: self.retry_count,
            error_history: self.error_history.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            scheduled_for: self.scheduled_for,
            cancel_reason: self.cancel_reason,
            metadata: self.metadata.clone(),
        }
    }
}

/// Point-in-time view of a notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationSnapshot {
    pub id: NotificationId,
    pub channel: Channel,
    pub priority: Priority,
    pub payload: NotificationPayload,
    pub status: NotificationStatus,
    pub retry_count: u32,
    pub error_history: Vec<ErrorRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub cancel_reason: Option<CancelReason>,
    pub metadata: HashMap<String, String>,
}
