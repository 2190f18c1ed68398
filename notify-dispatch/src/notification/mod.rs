//! Notification data model.
//!
//! - [`Notification`]: the unit of work and its status state machine
//! - [`StatusTransition`]: emitted on every status change
//! - [`TransitionSink`]: optional external observer (persistence, audit)

pub mod events;
pub mod model;

pub use events::{StatusTransition, TransitionSink};
pub use model::{
    CancelReason, Channel, ErrorRecord, Notification, NotificationId, NotificationPayload,
    NotificationRequest, NotificationSnapshot, NotificationStatus, Priority,
};
