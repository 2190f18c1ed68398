//! Dispatch engine.
//!
//! Owns the notification records and drives them through their lifecycle:
//!
//! 1. [`DispatchEngine::submit`] stores the record and enqueues its id, or
//!    defers it until `scheduled_for`.
//! 2. Each [`DispatchEngine::tick`] promotes due deferred items, takes the
//!    highest-priority ready item whose channel has rate-limit headroom, and
//!    attempts delivery with a timeout.
//! 3. A failed attempt moves the record to `Failed`; if the retry policy allows
//!    another attempt the id waits in the deferred heap until its backoff has
//!    elapsed, then goes back to `Pending` and into its queue.
//!
//! A single worker ([`DispatchEngine::run_loop`]) calls `tick` until shutdown.
//! Every status change is broadcast to subscribers and forwarded to the
//! optional [`TransitionSink`].
//!
//! Lock order: the scheduler lock may be taken before a record entry, never
//! the other way round. `submit`, `report_bounce` and the start of `shutdown`
//! check `accepting` under the scheduler lock. No lock is held across an `.await` except the tick
//! lock, which serializes ticks.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::rate_limiter::{ChannelUsage, RateLimiter, RateLimiterConfig};
use super::retry::RetryPolicy;
use super::scheduler::{DeferKind, PriorityScheduler, QueueCapacities, QueueDepths};
use crate::channels::{ChannelDispatcher, DeliveryOutcome, DispatcherRegistry};
use crate::clock::{SharedClock, SystemClock, add_std, elapsed_between};
use crate::notification::events::SinkForwarder;
use crate::notification::{
    CancelReason, Channel, Notification, NotificationId, NotificationRequest,
    NotificationSnapshot, NotificationStatus, Priority, StatusTransition, TransitionSink,
};
use crate::{Error, Result};

/// Engine tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    pub rate_limits: RateLimiterConfig,
    pub queue_capacities: QueueCapacities,
    /// Upper bound on one delivery attempt.
    pub delivery_timeout: Duration,
    /// Longest the loop sleeps while idle.
    pub poll_interval: Duration,
    /// Capacity of the transition broadcast and of the sink buffer.
    pub transition_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            rate_limits: RateLimiterConfig::default(),
            queue_capacities: QueueCapacities::default(),
            delivery_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
            transition_buffer: 1024,
        }
    }
}

/// Dispatch loop lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    NotStarted,
    Running,
    Stopped,
}

/// What one [`DispatchEngine::tick`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing ready.
    Idle,
    /// Delivered.
    Sent(NotificationId),
    /// Attempt failed; retry-eligible at `retry_at`.
    Failed {
        id: NotificationId,
        retry_at: DateTime<Utc>,
    },
    /// Attempt failed and the retry policy is exhausted.
    Exhausted(NotificationId),
    /// Every ready item belongs to a channel over its limit. `id` was requeued.
    RateLimited { id: NotificationId, channel: Channel },
    /// Dequeued an item that was no longer pending (cancelled or pruned).
    Skipped(NotificationId),
}

impl TickOutcome {
    /// Whether the loop should wait before ticking again.
    pub fn should_idle(&self) -> bool {
        matches!(self, Self::Idle | Self::RateLimited { .. })
    }
}

/// Result of [`DispatchEngine::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Notifications cancelled because they were still undelivered.
    pub cancelled: Vec<NotificationId>,
    /// Whether the in-flight delivery finished within the drain timeout.
    pub drained: bool,
}

/// Records by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub sent: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Lifetime totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchTotals {
    pub submitted: u64,
    pub delivered: u64,
    pub failed_attempts: u64,
    pub retries: u64,
    pub exhausted: u64,
    pub rate_limited: u64,
    pub cancelled: u64,
    pub bounced: u64,
}

/// Engine statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchStats {
    pub loop_state: LoopState,
    pub queues: QueueDepths,
    pub statuses: StatusCounts,
    pub totals: DispatchTotals,
    pub rate_limits: HashMap<Channel, ChannelUsage>,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    delivered: AtomicU64,
    failed_attempts: AtomicU64,
    retries: AtomicU64,
    exhausted: AtomicU64,
    rate_limited: AtomicU64,
    cancelled: AtomicU64,
    bounced: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DispatchTotals {
        DispatchTotals {
            submitted: self.submitted.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            bounced: self.bounced.load(Ordering::Relaxed),
        }
    }
}

/// Builder for [`DispatchEngine`].
pub struct EngineBuilder {
    config: EngineConfig,
    clock: Option<SharedClock>,
    dispatchers: DispatcherRegistry,
    sink: Option<Arc<dyn TransitionSink>>,
}

impl EngineBuilder {
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn dispatchers(mut self, dispatchers: DispatcherRegistry) -> Self {
        self.dispatchers = dispatchers;
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn ChannelDispatcher>) -> Self {
        self.dispatchers.register(dispatcher);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn TransitionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Build the engine. With a sink configured this must run inside a Tokio runtime.
    pub fn build(self) -> Arc<DispatchEngine> {
        let clock = self.clock.unwrap_or_else(SystemClock::shared);
        let buffer = self.config.transition_buffer.max(1);
        let (events_tx, _) = broadcast::channel(buffer);
        let (state_tx, _) = watch::channel(LoopState::NotStarted);
        let sink = self.sink.map(|sink| SinkForwarder::spawn(sink, buffer));

        Arc::new(DispatchEngine {
            limiter: RateLimiter::new(self.config.rate_limits.clone(), clock.clone()),
            scheduler: Mutex::new(PriorityScheduler::new(self.config.queue_capacities)),
            records: DashMap::new(),
            dispatchers: self.dispatchers,
            config: self.config,
            clock,
            accepting: AtomicBool::new(true),
            stop_token: CancellationToken::new(),
            abort_token: CancellationToken::new(),
            wakeup: Notify::new(),
            tick_lock: tokio::sync::Mutex::new(()),
            state_tx,
            events_tx,
            sink: Mutex::new(sink),
            counters: Counters::default(),
        })
    }
}

/// Priority-ordered, rate-limited notification dispatcher.
pub struct DispatchEngine {
    config: EngineConfig,
    clock: SharedClock,
    dispatchers: DispatcherRegistry,
    limiter: RateLimiter,
    records: DashMap<NotificationId, Notification>,
    scheduler: Mutex<PriorityScheduler>,
    accepting: AtomicBool,
    /// Stops the loop after the current tick.
    stop_token: CancellationToken,
    /// Abandons the in-flight delivery.
    abort_token: CancellationToken,
    wakeup: Notify,
    tick_lock: tokio::sync::Mutex<()>,
    state_tx: watch::Sender<LoopState>,
    events_tx: broadcast::Sender<StatusTransition>,
    sink: Mutex<Option<SinkForwarder>>,
    counters: Counters,
}

impl DispatchEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            clock: None,
            dispatchers: DispatcherRegistry::new(),
            sink: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Accept a notification for delivery.
    ///
    /// Returns as soon as the notification is queued (or deferred until its
    /// `scheduled_for` time). A full priority queue is reported as
    /// [`Error::QueueFull`] and nothing is kept.
    pub fn submit(&self, request: NotificationRequest) -> Result<NotificationId> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let now = self.clock.now();
        if let Some(scheduled_for) = request.scheduled_for
            && scheduled_for < now
        {
            return Err(Error::InvalidSchedule { scheduled_for, now });
        }

        let notification = Notification::new(request, now);
        let id = notification.id();
        let channel = notification.channel();
        let priority = notification.priority();
        let deferred_until = notification.scheduled_for().filter(|at| *at > now);

        // Queue and record change together under the scheduler lock, so a
        // concurrent shutdown either sees both or neither.
        let queued = {
            let mut scheduler = self.scheduler.lock();
            if !self.accepting.load(Ordering::SeqCst) {
                Err(Error::ShuttingDown)
            } else {
                let queued = match deferred_until {
                    Some(at) => {
                        scheduler.defer(id, priority, at, DeferKind::Scheduled);
                        Ok(())
                    }
                    None => scheduler.enqueue(id, priority),
                };
                if queued.is_ok() {
                    self.records.insert(id, notification);
                }
                queued
            }
        };

        if let Err(e) = queued {
            if e.is_backpressure() {
                warn!(%channel, %priority, "Rejected notification: {}", e);
            }
            return Err(e);
        }

        Counters::bump(&self.counters.submitted);
        debug!(
            notification_id = %id,
            %channel,
            %priority,
            scheduled_for = ?deferred_until,
            "Notification submitted"
        );
        self.wakeup.notify_one();
        Ok(id)
    }

    pub fn query(&self, id: NotificationId) -> Option<NotificationSnapshot> {
        self.records.get(&id).map(|n| n.snapshot())
    }

    /// Cancel a pending or retry-waiting notification.
    pub fn cancel(&self, id: NotificationId) -> Result<NotificationSnapshot> {
        self.scheduler.lock().remove(id);

        let now = self.clock.now();
        let (transition, snapshot) = {
            let mut record = self
                .records
                .get_mut(&id)
                .ok_or_else(|| Error::not_found("notification", id.to_string()))?;
            let transition = record.cancel(CancelReason::Requested, now)?;
            (transition, record.snapshot())
        };

        Counters::bump(&self.counters.cancelled);
        info!(notification_id = %id, "Notification cancelled");
        self.publish(transition);
        Ok(snapshot)
    }

    /// Record that a delivered notification later bounced.
    ///
    /// The notification moves to `Failed` and is retried like any failed
    /// attempt unless the retry policy is exhausted.
    pub fn report_bounce(&self, id: NotificationId, message: &str) -> Result<NotificationSnapshot> {
        let now = self.clock.now();
        let (transition, snapshot, retry_at) = {
            let mut scheduler = self.scheduler.lock();
            if !self.accepting.load(Ordering::SeqCst) {
                return Err(Error::ShuttingDown);
            }

            let mut record = self
                .records
                .get_mut(&id)
                .ok_or_else(|| Error::not_found("notification", id.to_string()))?;
            if record.status() != NotificationStatus::Sent {
                return Err(Error::InvalidTransition {
                    from: record.status(),
                    to: NotificationStatus::Failed,
                });
            }
            let transition = record.transition(NotificationStatus::Failed, Some(message), now)?;
            let retry_at = record.next_retry_at(&self.config.retry);
            if let Some(at) = retry_at {
                scheduler.defer(id, record.priority(), at, DeferKind::Retry);
            }
            (transition, record.snapshot(), retry_at)
        };

        Counters::bump(&self.counters.bounced);
        match retry_at {
            Some(at) => {
                info!(notification_id = %id, retry_at = %at, "Bounced notification scheduled for retry");
            }
            None => {
                Counters::bump(&self.counters.exhausted);
                warn!(notification_id = %id, "Bounced notification has no retries left");
            }
        }
        self.publish(transition);
        self.wakeup.notify_one();
        Ok(snapshot)
    }

    /// Live feed of status transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusTransition> {
        self.events_tx.subscribe()
    }

    pub fn loop_state(&self) -> LoopState {
        *self.state_tx.borrow()
    }

    pub fn stats(&self) -> DispatchStats {
        let mut statuses = StatusCounts::default();
        for record in self.records.iter() {
            match record.status() {
                NotificationStatus::Pending => statuses.pending += 1,
                NotificationStatus::Sent => statuses.sent += 1,
                NotificationStatus::Failed => statuses.failed += 1,
                NotificationStatus::Cancelled => statuses.cancelled += 1,
            }
        }

        DispatchStats {
            loop_state: self.loop_state(),
            queues: self.scheduler.lock().depths(),
            statuses,
            totals: self.counters.snapshot(),
            rate_limits: self.limiter.snapshot(),
        }
    }

    /// Drop terminal records last updated at least `retention` ago.
    pub fn prune_terminal(&self, retention: Duration) -> usize {
        let now = self.clock.now();
        let policy = self.config.retry;
        let mut pruned = 0;
        self.records.retain(|_, n| {
            let expired =
                n.is_terminal(&policy) && elapsed_between(n.updated_at(), now) >= retention;
            if expired {
                pruned += 1;
            }
            !expired
        });

        if pruned > 0 {
            debug!(count = pruned, "Pruned terminal notifications");
        }
        pruned
    }

    /// Run one dispatch step.
    pub async fn tick(&self) -> TickOutcome {
        let _tick = self.tick_lock.lock().await;
        let now = self.clock.now();
        self.promote_due(now);

        let mut blocked: Vec<Channel> = Vec::new();
        let mut rate_limited = None;

        loop {
            let next = {
                let mut scheduler = self.scheduler.lock();
                scheduler.dequeue_matching(|id| {
                    self.records
                        .get(&id)
                        .is_none_or(|n| !blocked.contains(&n.channel()))
                })
            };
            let Some((id, priority)) = next else {
                break;
            };

            let Some(notification) = self.records.get(&id).map(|n| n.clone()) else {
                debug!(notification_id = %id, "Dropping queued id without a record");
                continue;
            };
            if notification.status() != NotificationStatus::Pending {
                debug!(notification_id = %id, status = %notification.status(), "Skipping non-pending notification");
                return TickOutcome::Skipped(id);
            }

            let channel = notification.channel();
            if !self.limiter.try_acquire(channel) {
                self.scheduler.lock().requeue(id, priority);
                Counters::bump(&self.counters.rate_limited);
                debug!(notification_id = %id, %channel, "Rate limited, requeued");
                blocked.push(channel);
                rate_limited = Some(TickOutcome::RateLimited { id, channel });
                continue;
            }

            let outcome = self.attempt(&notification).await;
            return self.apply_outcome(id, priority, outcome);
        }

        rate_limited.unwrap_or(TickOutcome::Idle)
    }

    /// Tick until [`shutdown`](Self::shutdown) is called.
    pub async fn run_loop(&self) {
        if self.stop_token.is_cancelled() {
            return;
        }

        self.state_tx.send_replace(LoopState::Running);
        info!("Dispatch loop started");

        while !self.stop_token.is_cancelled() {
            match self.tick().await {
                TickOutcome::Idle => self.idle(self.idle_wait()).await,
                TickOutcome::RateLimited { .. } => {
                    let wait = self
                        .limiter
                        .time_until_reset()
                        .min(self.config.poll_interval);
                    self.idle(wait).await;
                }
                _ => {}
            }
        }

        self.state_tx.send_replace(LoopState::Stopped);
        info!("Dispatch loop stopped");
    }

    /// Stop accepting work, let the in-flight delivery finish (up to
    /// `drain_timeout`, after which it is abandoned as a failure), and cancel
    /// everything still undelivered.
    pub async fn shutdown(&self, drain_timeout: Duration) -> ShutdownReport {
        {
            let _scheduler = self.scheduler.lock();
            self.accepting.store(false, Ordering::SeqCst);
        }
        info!(
            drain_timeout_secs = drain_timeout.as_secs_f64(),
            "Shutting down dispatch engine"
        );
        self.stop_token.cancel();

        let mut state_rx = self.state_tx.subscribe();
        let drain = async {
            if *state_rx.borrow() == LoopState::Running {
                let _ = state_rx.wait_for(|s| *s == LoopState::Stopped).await;
            }
            self.tick_lock.lock().await
        };

        let (tick_guard, drained) = match tokio::time::timeout(drain_timeout, drain).await {
            Ok(guard) => (guard, true),
            Err(_) => {
                warn!("In-flight delivery did not finish before the drain timeout, aborting it");
                self.abort_token.cancel();
                (self.tick_lock.lock().await, false)
            }
        };

        self.scheduler.lock().drain_all();

        let now = self.clock.now();
        let policy = self.config.retry;
        let mut cancelled = Vec::new();
        let mut transitions = Vec::new();
        for mut entry in self.records.iter_mut() {
            let notification = entry.value_mut();
            let open = match notification.status() {
                NotificationStatus::Pending => true,
                NotificationStatus::Failed => !notification.is_terminal(&policy),
                NotificationStatus::Sent | NotificationStatus::Cancelled => false,
            };
            if !open {
                continue;
            }
            match notification.cancel(CancelReason::Shutdown, now) {
                Ok(transition) => {
                    cancelled.push(notification.id());
                    transitions.push(transition);
                }
                Err(e) => warn!(notification_id = %notification.id(), error = %e, "Failed to cancel notification"),
            }
        }
        drop(tick_guard);

        for transition in transitions {
            Counters::bump(&self.counters.cancelled);
            self.publish(transition);
        }

        self.state_tx.send_replace(LoopState::Stopped);

        let forwarder = self.sink.lock().take();
        if let Some(forwarder) = forwarder {
            forwarder.close().await;
        }

        info!(
            cancelled = cancelled.len(),
            drained, "Dispatch engine shut down"
        );
        ShutdownReport { cancelled, drained }
    }

    /// Move due deferred items into their queues.
    fn promote_due(&self, now: DateTime<Utc>) {
        let due = self.scheduler.lock().pop_due(now);

        for item in due {
            match item.kind {
                DeferKind::Scheduled => {
                    self.make_ready(item.id, item.priority, item.kind, now);
                }
                DeferKind::Retry => {
                    let eligibility = match self.records.get(&item.id) {
                        Some(n) if n.status() == NotificationStatus::Failed => {
                            if n.can_retry(&self.config.retry, now) {
                                Ok(())
                            } else {
                                Err(n.next_retry_at(&self.config.retry))
                            }
                        }
                        // Cancelled or pruned while waiting.
                        _ => continue,
                    };

                    match eligibility {
                        Ok(()) => {}
                        Err(Some(at)) => {
                            self.scheduler
                                .lock()
                                .defer(item.id, item.priority, at, DeferKind::Retry);
                            continue;
                        }
                        Err(None) => continue,
                    }

                    if !self.make_ready(item.id, item.priority, item.kind, now) {
                        continue;
                    }

                    let transition = self
                        .records
                        .get_mut(&item.id)
                        .and_then(|mut n| n.transition(NotificationStatus::Pending, None, now).ok());
                    if let Some(transition) = transition {
                        Counters::bump(&self.counters.retries);
                        debug!(
                            notification_id = %item.id,
                            retry_count = self.records.get(&item.id).map(|n| n.retry_count()),
                            "Retrying notification"
                        );
                        self.publish(transition);
                    }
                }
            }
        }
    }

    /// Enqueue a promoted item; if its queue is full, try again one poll interval later.
    fn make_ready(
        &self,
        id: NotificationId,
        priority: Priority,
        kind: DeferKind,
        now: DateTime<Utc>,
    ) -> bool {
        let result = self.scheduler.lock().enqueue(id, priority);
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(notification_id = %id, error = %e, "Queue full, postponing promotion");
                self.scheduler
                    .lock()
                    .defer(id, priority, add_std(now, self.config.poll_interval), kind);
                false
            }
        }
    }

    /// One bounded, panic-isolated delivery attempt.
    async fn attempt(&self, notification: &Notification) -> DeliveryOutcome {
        let channel = notification.channel();
        let Some(dispatcher) = self.dispatchers.get(channel) else {
            return DeliveryOutcome::failed(format!("no dispatcher registered for channel {}", channel));
        };

        let timeout = self.config.delivery_timeout;
        let delivery = AssertUnwindSafe(dispatcher.deliver(notification)).catch_unwind();

        tokio::select! {
            biased;
            _ = self.abort_token.cancelled() => {
                DeliveryOutcome::failed("delivery aborted by shutdown")
            }
            result = tokio::time::timeout(timeout, delivery) => match result {
                Ok(Ok(outcome)) => normalize(outcome),
                Ok(Err(panic)) => {
                    let message = panic_message(panic.as_ref());
                    warn!(notification_id = %notification.id(), %channel, panic = %message, "Dispatcher panicked");
                    DeliveryOutcome::failed(format!("dispatcher panicked: {}", message))
                }
                Err(_) => DeliveryOutcome::failed(format!(
                    "delivery timed out after {}ms",
                    timeout.as_millis()
                )),
            }
        }
    }

    fn apply_outcome(
        &self,
        id: NotificationId,
        priority: Priority,
        outcome: DeliveryOutcome,
    ) -> TickOutcome {
        let now = self.clock.now();
        let policy = self.config.retry;

        if outcome.success {
            let result = self
                .records
                .get_mut(&id)
                .map(|mut n| n.transition(NotificationStatus::Sent, None, now));
            return match result {
                Some(Ok(transition)) => {
                    Counters::bump(&self.counters.delivered);
                    info!(notification_id = %id, channel = %transition.channel, "Notification sent");
                    self.publish(transition);
                    TickOutcome::Sent(id)
                }
                Some(Err(e)) => {
                    debug!(notification_id = %id, error = %e, "Delivered notification changed state in flight");
                    TickOutcome::Skipped(id)
                }
                None => TickOutcome::Skipped(id),
            };
        }

        let message = outcome
            .error_message
            .unwrap_or_else(|| "delivery failed".to_string());
        let result = self.records.get_mut(&id).map(|mut n| {
            n.transition(NotificationStatus::Failed, Some(&message), now)
                .map(|t| (t, n.retry_count(), n.next_retry_at(&policy)))
        });

        let (transition, retry_count, retry_at) = match result {
            Some(Ok(applied)) => applied,
            Some(Err(e)) => {
                debug!(notification_id = %id, error = %e, "Failed notification changed state in flight");
                return TickOutcome::Skipped(id);
            }
            None => return TickOutcome::Skipped(id),
        };

        Counters::bump(&self.counters.failed_attempts);
        self.publish(transition);

        match retry_at {
            Some(at) => {
                warn!(
                    notification_id = %id,
                    retry_count,
                    retry_at = %at,
                    error = %message,
                    "Delivery failed, will retry"
                );
                self.scheduler.lock().defer(id, priority, at, DeferKind::Retry);
                TickOutcome::Failed { id, retry_at: at }
            }
            None => {
                Counters::bump(&self.counters.exhausted);
                warn!(
                    notification_id = %id,
                    retry_count,
                    error = %message,
                    "Delivery failed, retries exhausted"
                );
                TickOutcome::Exhausted(id)
            }
        }
    }

    fn publish(&self, transition: StatusTransition) {
        debug!(
            notification_id = %transition.id,
            from = %transition.from,
            to = %transition.to,
            "Status transition"
        );
        if let Some(forwarder) = self.sink.lock().as_ref() {
            forwarder.forward(transition.clone());
        }
        // No subscribers is fine.
        let _ = self.events_tx.send(transition);
    }

    fn idle_wait(&self) -> Duration {
        let poll = self.config.poll_interval;
        let next_due = self.scheduler.lock().next_due();
        match next_due {
            Some(due) => elapsed_between(self.clock.now(), due)
                .min(poll)
                .max(Duration::from_millis(1)),
            None => poll,
        }
    }

    async fn idle(&self, wait: Duration) {
        tokio::select! {
            _ = self.stop_token.cancelled() => {}
            _ = self.wakeup.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

fn normalize(outcome: DeliveryOutcome) -> DeliveryOutcome {
    if outcome.success {
        return outcome;
    }
    match outcome.error_message.as_deref().map(str::trim) {
        Some(message) if !message.is_empty() => outcome,
        _ => DeliveryOutcome::failed("delivery failed"),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
