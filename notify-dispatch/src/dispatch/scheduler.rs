//! Priority scheduler.
//!
//! Four bounded FIFO queues, one per [`Priority`], drained in strict priority
//! order: each dequeue takes one item from the first non-empty queue, scanning
//! from `Urgent` down. A sustained burst of urgent work therefore starves the
//! lower queues; that is accepted.
//!
//! Items that are not ready yet (scheduled for later, or backing off after a
//! failure) wait in a min-heap keyed by due time and are handed back by
//! [`PriorityScheduler::pop_due`] once due. The scheduler only holds ids; the
//! notification records live in the engine.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::notification::{NotificationId, Priority};
use crate::{Error, Result};

/// Per-priority queue capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCapacities {
    pub urgent: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl Default for QueueCapacities {
    fn default() -> Self {
        Self {
            urgent: 1000,
            high: 2000,
            medium: 5000,
            low: 10000,
        }
    }
}

impl QueueCapacities {
    pub fn get(&self, priority: Priority) -> usize {
        match priority {
            Priority::Urgent => self.urgent,
            Priority::High => self.high,
            Priority::Medium => self.medium,
            Priority::Low => self.low,
        }
    }
}

/// Why an item is waiting in the deferred heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferKind {
    /// Held until its `scheduled_for` time.
    Scheduled,
    /// Backing off after a failed attempt.
    Retry,
}

/// An item waiting for its due time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deferred {
    pub id: NotificationId,
    pub priority: Priority,
    pub due: DateTime<Utc>,
    pub kind: DeferKind,
    seq: u64,
}

impl Ord for Deferred {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for min-heap behavior; ties keep insertion order.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Deferred {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Queue depths by priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepths {
    pub urgent: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub deferred: usize,
}

#[derive(Debug)]
struct BoundedQueue {
    items: VecDeque<NotificationId>,
    capacity: usize,
}

/// Strict-priority scheduler over bounded FIFOs.
#[derive(Debug)]
pub struct PriorityScheduler {
    queues: HashMap<Priority, BoundedQueue>,
    deferred: BinaryHeap<Deferred>,
    next_seq: u64,
}

impl PriorityScheduler {
    pub fn new(capacities: QueueCapacities) -> Self {
        let queues = Priority::DISPATCH_ORDER
            .iter()
            .map(|p| {
                let capacity = capacities.get(*p);
                (
                    *p,
                    BoundedQueue {
                        items: VecDeque::with_capacity(capacity.min(1024)),
                        capacity,
                    },
                )
            })
            .collect();

        Self {
            queues,
            deferred: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Append to the queue for `priority`.
    ///
    /// Fails with [`Error::QueueFull`] when that queue is at capacity; the queue
    /// is left unchanged.
    pub fn enqueue(&mut self, id: NotificationId, priority: Priority) -> Result<()> {
        let queue = self.queue_mut(priority);
        if queue.items.len() >= queue.capacity {
            return Err(Error::QueueFull {
                priority,
                capacity: queue.capacity,
            });
        }
        queue.items.push_back(id);
        Ok(())
    }

    /// Put back an item that was just dequeued but could not be attempted.
    ///
    /// Never fails: the slot it was dequeued from is still free.
    pub fn requeue(&mut self, id: NotificationId, priority: Priority) {
        self.queue_mut(priority).items.push_back(id);
    }

    /// Take the next item in strict priority order.
    pub fn dequeue(&mut self) -> Option<(NotificationId, Priority)> {
        self.dequeue_matching(|_| true)
    }

    /// Take the first item, in strict priority order, that `accept` admits.
    ///
    /// Items passed over keep their positions.
    pub fn dequeue_matching<F>(&mut self, mut accept: F) -> Option<(NotificationId, Priority)>
    where
        F: FnMut(NotificationId) -> bool,
    {
        for priority in Priority::DISPATCH_ORDER {
            let queue = self.queue_mut(priority);
            if let Some(pos) = queue.items.iter().position(|id| accept(*id))
                && let Some(id) = queue.items.remove(pos)
            {
                return Some((id, priority));
            }
        }
        None
    }

    /// Hold an item until `due`.
    pub fn defer(
        &mut self,
        id: NotificationId,
        priority: Priority,
        due: DateTime<Utc>,
        kind: DeferKind,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.deferred.push(Deferred {
            id,
            priority,
            due,
            kind,
            seq,
        });
    }

    /// Remove and return every deferred item due at or before `now`, earliest first.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<Deferred> {
        let mut due = Vec::new();
        while self.deferred.peek().is_some_and(|d| d.due <= now) {
            if let Some(item) = self.deferred.pop() {
                due.push(item);
            }
        }
        due
    }

    /// Due time of the earliest deferred item.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.deferred.peek().map(|d| d.due)
    }

    /// Remove `id` wherever it is waiting. Returns whether it was found.
    pub fn remove(&mut self, id: NotificationId) -> bool {
        for queue in self.queues.values_mut() {
            if let Some(pos) = queue.items.iter().position(|x| *x == id) {
                queue.items.remove(pos);
                return true;
            }
        }

        let before = self.deferred.len();
        self.deferred.retain(|d| d.id != id);
        self.deferred.len() != before
    }

    /// Empty every queue and the deferred heap, returning all ids.
    pub fn drain_all(&mut self) -> Vec<NotificationId> {
        let mut ids = Vec::with_capacity(self.len());
        for priority in Priority::DISPATCH_ORDER {
            ids.extend(self.queue_mut(priority).items.drain(..));
        }
        ids.extend(self.deferred.drain().map(|d| d.id));
        ids
    }

    /// Items ready for dispatch (excludes deferred).
    pub fn ready_len(&self) -> usize {
        self.queues.values().map(|q| q.items.len()).sum()
    }

    /// All waiting items, ready or deferred.
    pub fn len(&self) -> usize {
        self.ready_len() + self.deferred.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn depths(&self) -> QueueDepths {
        let depth = |p: Priority| self.queues.get(&p).map_or(0, |q| q.items.len());
        QueueDepths {
            urgent: depth(Priority::Urgent),
            high: depth(Priority::High),
            medium: depth(Priority::Medium),
            low: depth(Priority::Low),
            deferred: self.deferred.len(),
        }
    }

    fn queue_mut(&mut self, priority: Priority) -> &mut BoundedQueue {
        self.queues
            .entry(priority)
            .or_insert_with(|| BoundedQueue {
                items: VecDeque::new(),
                capacity: 0,
            })
    }
}

impl Default for PriorityScheduler {
    fn default() -> Self {
        Self::new(QueueCapacities::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_priority_order() {
        let mut scheduler = PriorityScheduler::default();
        let low = NotificationId::new();
        let urgent = NotificationId::new();
        let medium = NotificationId::new();

        scheduler.enqueue(low, Priority::Low).unwrap();
        scheduler.enqueue(urgent, Priority::Urgent).unwrap();
        scheduler.enqueue(medium, Priority::Medium).unwrap();

        assert_eq!(scheduler.dequeue(), Some((urgent, Priority::Urgent)));
        assert_eq!(scheduler.dequeue(), Some((medium, Priority::Medium)));
        assert_eq!(scheduler.dequeue(), Some((low, Priority::Low)));
        assert_eq!(scheduler.dequeue(), None);
    }

    #[test]
    fn test_fifo_within_priority() {
        let mut scheduler = PriorityScheduler::default();
        let ids: Vec<_> = (0..5).map(|_| NotificationId::new()).collect();
        for id in &ids {
            scheduler.enqueue(*id, Priority::High).unwrap();
        }
        let out: Vec<_> = std::iter::from_fn(|| scheduler.dequeue().map(|(id, _)| id)).collect();
        assert_eq!(out, ids);
    }

    #[test]
    fn test_enqueue_full_leaves_queue_unchanged() {
        let mut scheduler = PriorityScheduler::new(QueueCapacities {
            urgent: 2,
            ..Default::default()
        });
        let a = NotificationId::new();
        let b = NotificationId::new();
        scheduler.enqueue(a, Priority::Urgent).unwrap();
        scheduler.enqueue(b, Priority::Urgent).unwrap();

        let err = scheduler
            .enqueue(NotificationId::new(), Priority::Urgent)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::QueueFull {
                priority: Priority::Urgent,
                capacity: 2
            }
        ));
        assert_eq!(scheduler.depths().urgent, 2);
        assert_eq!(scheduler.dequeue(), Some((a, Priority::Urgent)));
        assert_eq!(scheduler.dequeue(), Some((b, Priority::Urgent)));

        // Other priorities are unaffected.
        scheduler.enqueue(NotificationId::new(), Priority::Low).unwrap();
    }

    #[test]
    fn test_dequeue_matching_skips_without_reordering() {
        let mut scheduler = PriorityScheduler::default();
        let blocked = NotificationId::new();
        let urgent = NotificationId::new();
        let low = NotificationId::new();
        scheduler.enqueue(blocked, Priority::Urgent).unwrap();
        scheduler.enqueue(urgent, Priority::Urgent).unwrap();
        scheduler.enqueue(low, Priority::Low).unwrap();

        assert_eq!(
            scheduler.dequeue_matching(|id| id != blocked),
            Some((urgent, Priority::Urgent))
        );
        assert_eq!(
            scheduler.dequeue_matching(|id| id != blocked),
            Some((low, Priority::Low))
        );
        assert_eq!(scheduler.dequeue_matching(|id| id != blocked), None);
        assert_eq!(scheduler.dequeue(), Some((blocked, Priority::Urgent)));
    }

    #[test]
    fn test_requeue_goes_to_back_of_same_queue() {
        let mut scheduler = PriorityScheduler::new(QueueCapacities {
            high: 2,
            ..Default::default()
        });
        let a = NotificationId::new();
        let b = NotificationId::new();
        scheduler.enqueue(a, Priority::High).unwrap();
        scheduler.enqueue(b, Priority::High).unwrap();

        let (first, priority) = scheduler.dequeue().unwrap();
        scheduler.requeue(first, priority);

        assert_eq!(scheduler.dequeue(), Some((b, Priority::High)));
        assert_eq!(scheduler.dequeue(), Some((a, Priority::High)));
    }

    #[test]
    fn test_deferred_pop_due_in_time_order() {
        let mut scheduler = PriorityScheduler::default();
        let t0 = Utc::now();
        let late = NotificationId::new();
        let early = NotificationId::new();
        scheduler.defer(
            late,
            Priority::Low,
            t0 + chrono::Duration::seconds(20),
            DeferKind::Retry,
        );
        scheduler.defer(
            early,
            Priority::Urgent,
            t0 + chrono::Duration::seconds(10),
            DeferKind::Scheduled,
        );

        assert!(scheduler.pop_due(t0).is_empty());
        assert_eq!(scheduler.next_due(), Some(t0 + chrono::Duration::seconds(10)));
        assert_eq!(scheduler.ready_len(), 0);
        assert_eq!(scheduler.len(), 2);

        let due = scheduler.pop_due(t0 + chrono::Duration::seconds(30));
        let ids: Vec<_> = due.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![early, late]);
        assert_eq!(due[0].kind, DeferKind::Scheduled);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_remove_from_queue_and_heap() {
        let mut scheduler = PriorityScheduler::default();
        let queued = NotificationId::new();
        let deferred = NotificationId::new();
        scheduler.enqueue(queued, Priority::Medium).unwrap();
        scheduler.defer(deferred, Priority::Medium, Utc::now(), DeferKind::Retry);

        assert!(scheduler.remove(queued));
        assert!(scheduler.remove(deferred));
        assert!(!scheduler.remove(NotificationId::new()));
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_drain_all() {
        let mut scheduler = PriorityScheduler::default();
        scheduler.enqueue(NotificationId::new(), Priority::Low).unwrap();
        scheduler.enqueue(NotificationId::new(), Priority::Urgent).unwrap();
        scheduler.defer(
            NotificationId::new(),
            Priority::High,
            Utc::now(),
            DeferKind::Scheduled,
        );

        assert_eq!(scheduler.drain_all().len(), 3);
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.depths(), QueueDepths::default());
    }
}
