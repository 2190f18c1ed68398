//! Status transition events.
//!
//! Every status change produces a [`StatusTransition`]. The engine broadcasts
//! it to in-process subscribers and forwards it to an optional
//! [`TransitionSink`] (persistence, audit) through a bounded queue drained by a
//! background task, so a slow or failing sink never stalls dispatch.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::model::{Channel, NotificationId, NotificationStatus, Priority};
use crate::Result;

/// A single status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub id: NotificationId,
    pub channel: Channel,
    pub priority: Priority,
    pub from: NotificationStatus,
    pub to: NotificationStatus,
    pub at: DateTime<Utc>,
    /// Failure message when `to` is `Failed`.
    pub error: Option<String>,
}

/// External observer of status transitions, typically a persistence adapter.
#[async_trait]
pub trait TransitionSink: Send + Sync {
    /// Record a transition. Errors are logged and otherwise ignored.
    async fn record(&self, transition: &StatusTransition) -> Result<()>;
}

/// Bounded, non-blocking forwarder in front of a [`TransitionSink`].
pub(crate) struct SinkForwarder {
    tx: mpsc::Sender<StatusTransition>,
    handle: JoinHandle<()>,
}

impl SinkForwarder {
    /// Spawn the forwarding task. Must be called inside a Tokio runtime.
    pub(crate) fn spawn(sink: Arc<dyn TransitionSink>, buffer: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<StatusTransition>(buffer.max(1));

        let handle = tokio::spawn(async move {
            while let Some(transition) = rx.recv().await {
                if let Err(e) = sink.record(&transition).await {
                    warn!(
                        notification_id = %transition.id,
                        from = %transition.from,
                        to = %transition.to,
                        error = %e,
                        "Transition sink failed"
                    );
                }
            }
            debug!("Transition sink forwarder stopped");
        });

        Self { tx, handle }
    }

    /// Queue a transition without waiting. Drops it when the buffer is full.
    pub(crate) fn forward(&self, transition: StatusTransition) {
        if let Err(e) = self.tx.try_send(transition) {
            match e {
                mpsc::error::TrySendError::Full(t) => warn!(
                    notification_id = %t.id,
                    to = %t.to,
                    "Transition sink buffer full, dropping transition"
                ),
                mpsc::error::TrySendError::Closed(t) => debug!(
                    notification_id = %t.id,
                    "Transition sink closed, dropping transition"
                ),
            }
        }
    }

    /// Stop accepting transitions and wait for the queue to drain.
    pub(crate) async fn close(self) {
        let Self { tx, handle } = self;
        drop(tx);
        if let Err(e) = handle.await {
            warn!(error = %e, "Transition sink forwarder task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::Error;

    struct RecordingSink {
        seen: Mutex<Vec<StatusTransition>>,
    }

    #[async_trait]
    impl TransitionSink for RecordingSink {
        async fn record(&self, transition: &StatusTransition) -> Result<()> {
            self.seen.lock().push(transition.clone());
            Ok(())
        }
    }

    struct FailingSink {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TransitionSink for FailingSink {
        async fn record(&self, _transition: &StatusTransition) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Other("storage offline".to_string()))
        }
    }

    fn transition(to: NotificationStatus) -> StatusTransition {
        StatusTransition {
            id: NotificationId::new(),
            channel: Channel::Email,
            priority: Priority::High,
            from: NotificationStatus::Pending,
            to,
            at: Utc::now(),
            error: None,
        }
    }

    #[tokio::test]
    async fn forwards_in_order() {
        let sink = Arc::new(RecordingSink {
            seen: Mutex::new(Vec::new()),
        });
        let forwarder = SinkForwarder::spawn(sink.clone(), 16);

        forwarder.forward(transition(NotificationStatus::Sent));
        forwarder.forward(transition(NotificationStatus::Cancelled));
        forwarder.close().await;

        let seen = sink.seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].to, NotificationStatus::Sent);
        assert_eq!(seen[1].to, NotificationStatus::Cancelled);
    }

    #[tokio::test]
    async fn sink_errors_are_swallowed() {
        let sink = Arc::new(FailingSink {
            calls: AtomicUsize::new(0),
        });
        let forwarder = SinkForwarder::spawn(sink.clone(), 4);

        forwarder.forward(transition(NotificationStatus::Sent));
        forwarder.forward(transition(NotificationStatus::Failed));
        forwarder.close().await;

        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
    }
}
