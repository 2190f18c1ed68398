//! Per-channel admission control.
//!
//! Implements a fixed-window counter per channel. Windows are aligned to the
//! Unix epoch of the injected clock (`window = floor(now_ms / window_ms)`), so
//! every channel rolls over at the same wall-clock boundaries. The limiter
//! never blocks: a denied caller decides for itself what to do next.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::clock::SharedClock;
use crate::notification::Channel;

/// Configuration for the channel rate limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Window length.
    pub window: Duration,
    /// Maximum admissions per window, by channel.
    pub limits: HashMap<Channel, u32>,
    /// Limit applied to channels without an explicit entry.
    pub default_limit: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            limits: HashMap::from([
                (Channel::Email, 100),
                (Channel::InApp, 1000),
                (Channel::System, 500),
            ]),
            default_limit: 100,
        }
    }
}

impl RateLimiterConfig {
    pub fn with_limit(mut self, channel: Channel, limit: u32) -> Self {
        self.limits.insert(channel, limit);
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    fn limit_for(&self, channel: Channel) -> u32 {
        self.limits
            .get(&channel)
            .copied()
            .unwrap_or(self.default_limit)
    }
}

/// Counter for one channel in one window.
#[derive(Debug, Clone, Copy)]
struct FixedWindow {
    /// Index of the window the counter belongs to.
    index: i64,
    /// Admissions in that window.
    count: u32,
    /// Maximum admissions per window.
    limit: u32,
}

impl FixedWindow {
    fn roll(&mut self, index: i64) {
        if index != self.index {
            self.index = index;
            self.count = 0;
        }
    }

    fn try_acquire(&mut self, index: i64) -> bool {
        self.roll(index);
        if self.count < self.limit {
            self.count += 1;
            true
        } else {
            false
        }
    }
}

/// Usage of one channel in the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelUsage {
    pub used: u32,
    pub limit: u32,
}

/// Fixed-window rate limiter keyed by channel.
#[derive(Debug)]
pub struct RateLimiter {
    windows: Mutex<HashMap<Channel, FixedWindow>>,
    config: RateLimiterConfig,
    clock: SharedClock,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig, clock: SharedClock) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Admit one attempt on `channel` if the current window has room.
    pub fn try_acquire(&self, channel: Channel) -> bool {
        let index = self.current_index();
        let mut windows = self.windows.lock();
        let window = self.get_or_create(&mut windows, channel, index);
        let admitted = window.try_acquire(index);
        if !admitted {
            trace!(channel = %channel, used = window.count, limit = window.limit, "rate limited");
        }
        admitted
    }

    /// Admissions left for `channel` in the current window.
    pub fn remaining(&self, channel: Channel) -> u32 {
        let index = self.current_index();
        let mut windows = self.windows.lock();
        let window = self.get_or_create(&mut windows, channel, index);
        window.roll(index);
        window.limit.saturating_sub(window.count)
    }

    /// Time until the current window ends.
    pub fn time_until_reset(&self) -> Duration {
        let window_ms = self.window_ms();
        let now_ms = self.clock.now().timestamp_millis();
        let into_window = now_ms.rem_euclid(window_ms);
        Duration::from_millis((window_ms - into_window) as u64)
    }

    /// Current-window usage for every channel seen so far.
    pub fn snapshot(&self) -> HashMap<Channel, ChannelUsage> {
        let index = self.current_index();
        self.windows
            .lock()
            .iter()
            .map(|(channel, w)| {
                let used = if w.index == index { w.count } else { 0 };
                (
                    *channel,
                    ChannelUsage {
                        used,
                        limit: w.limit,
                    },
                )
            })
            .collect()
    }

    fn window_ms(&self) -> i64 {
        (self.config.window.as_millis() as i64).max(1)
    }

    fn current_index(&self) -> i64 {
        self.clock
            .now()
            .timestamp_millis()
            .div_euclid(self.window_ms())
    }

    fn get_or_create<'a>(
        &self,
        windows: &'a mut HashMap<Channel, FixedWindow>,
        channel: Channel,
        index: i64,
    ) -> &'a mut FixedWindow {
        match windows.entry(channel) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(FixedWindow {
                index,
                count: 0,
                limit: self.config.limit_for(channel),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::clock::ManualClock;

    fn aligned_clock() -> Arc<ManualClock> {
        // Exactly on a minute boundary.
        ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap())
    }

    #[test]
    fn test_admits_exactly_limit_per_window() {
        let clock = aligned_clock();
        let limiter = RateLimiter::new(
            RateLimiterConfig::default().with_limit(Channel::Email, 3),
            clock.clone(),
        );

        for _ in 0..3 {
            assert!(limiter.try_acquire(Channel::Email));
        }
        assert!(!limiter.try_acquire(Channel::Email));
        assert_eq!(limiter.remaining(Channel::Email), 0);

        // Denial leaves the counter unchanged.
        clock.advance(Duration::from_secs(59));
        assert!(!limiter.try_acquire(Channel::Email));

        // Rollover.
        clock.advance(Duration::from_secs(1));
        assert_eq!(limiter.remaining(Channel::Email), 3);
        assert!(limiter.try_acquire(Channel::Email));
    }

    #[test]
    fn test_channels_are_independent() {
        let limiter = RateLimiter::new(
            RateLimiterConfig::default()
                .with_limit(Channel::Email, 1)
                .with_limit(Channel::InApp, 1),
            aligned_clock(),
        );

        assert!(limiter.try_acquire(Channel::Email));
        assert!(!limiter.try_acquire(Channel::Email));
        assert!(limiter.try_acquire(Channel::InApp));
    }

    #[test]
    fn test_default_limits() {
        let limiter = RateLimiter::new(RateLimiterConfig::default(), aligned_clock());
        assert_eq!(limiter.remaining(Channel::Email), 100);
        assert_eq!(limiter.remaining(Channel::InApp), 1000);
        assert_eq!(limiter.remaining(Channel::System), 500);
    }

    #[test]
    fn test_window_is_wall_clock_aligned() {
        let clock = aligned_clock();
        clock.advance(Duration::from_secs(45));
        let limiter = RateLimiter::new(
            RateLimiterConfig::default().with_limit(Channel::System, 1),
            clock.clone(),
        );

        assert!(limiter.try_acquire(Channel::System));
        assert_eq!(limiter.time_until_reset(), Duration::from_secs(15));

        // The window started at :00, so it ends 15s later, not 60s later.
        clock.advance(Duration::from_secs(15));
        assert!(limiter.try_acquire(Channel::System));
    }

    #[test]
    fn test_snapshot_reports_current_window_only() {
        let clock = aligned_clock();
        let limiter = RateLimiter::new(RateLimiterConfig::default(), clock.clone());
        limiter.try_acquire(Channel::Email);
        limiter.try_acquire(Channel::Email);

        let usage = limiter.snapshot()[&Channel::Email];
        assert_eq!(usage, ChannelUsage { used: 2, limit: 100 });

        clock.advance(Duration::from_secs(60));
        assert_eq!(limiter.snapshot()[&Channel::Email].used, 0);
    }
}
