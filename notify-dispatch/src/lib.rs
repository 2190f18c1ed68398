//! notify-dispatch library crate.
//!
//! Priority-ordered, rate-limited notification dispatch with retry and
//! scheduled delivery. [`dispatch::DispatchEngine`] is the entry point.

pub mod channels;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod notification;
pub mod utils;

pub use error::{Error, Result};
