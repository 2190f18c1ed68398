//! Service configuration.
//!
//! Resolution order, later wins:
//! 1. Built-in defaults
//! 2. JSON file named by `NOTIFY_DISPATCH_CONFIG`
//! 3. `NOTIFY_*` environment variables (a `.env` file is loaded first)

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channels::{ChannelsConfig, EmailConfig, WebhookAuth, WebhookConfig};
use crate::dispatch::{EngineConfig, QueueCapacities, RateLimiterConfig, RetryPolicy};
use crate::notification::Channel;
use crate::{Error, Result};

/// Environment variable naming the JSON config file.
pub const CONFIG_PATH_ENV: &str = "NOTIFY_DISPATCH_CONFIG";

/// Per-channel admissions per rate-limit window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelLimits {
    pub email: u32,
    pub in_app: u32,
    pub system: u32,
}

impl Default for ChannelLimits {
    fn default() -> Self {
        Self {
            email: 100,
            in_app: 1000,
            system: 500,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Failed attempts before a notification is permanently failed.
    pub max_retry_attempts: u32,
    /// Base of the exponential backoff.
    pub retry_base_delay_secs: u64,
    pub rate_limit_window_secs: u64,
    pub rate_limits: ChannelLimits,
    pub queue_capacities: QueueCapacities,
    /// Upper bound on a single delivery attempt.
    pub delivery_timeout_secs: u64,
    /// How long shutdown waits for an in-flight delivery.
    pub drain_timeout_secs: u64,
    /// Idle wake-up interval of the dispatch loop.
    pub poll_interval_ms: u64,
    /// Buffered transitions awaiting the transition sink.
    pub transition_buffer: usize,
    pub log_dir: String,
    /// `EnvFilter` directive; falls back to `RUST_LOG`, then the built-in default.
    pub log_filter: Option<String>,
    pub channels: ChannelsConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            retry_base_delay_secs: 300,
            rate_limit_window_secs: 60,
            rate_limits: ChannelLimits::default(),
            queue_capacities: QueueCapacities::default(),
            delivery_timeout_secs: 30,
            drain_timeout_secs: 30,
            poll_interval_ms: 250,
            transition_buffer: 1024,
            log_dir: "logs".to_string(),
            log_filter: None,
            channels: ChannelsConfig::default(),
        }
    }
}

impl DispatchConfig {
    /// Load from `.env`, the optional config file, and the process environment.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` as the environment.
    pub fn load_with<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(CONFIG_PATH_ENV).filter(|p| !p.trim().is_empty()) {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON config file. Missing keys take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read config file {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    fn apply_env_overrides<F>(&mut self, lookup: &F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_parsed(lookup, "NOTIFY_MAX_RETRY_ATTEMPTS", &mut self.max_retry_attempts)?;
        override_parsed(lookup, "NOTIFY_RETRY_BASE_DELAY_SECS", &mut self.retry_base_delay_secs)?;
        override_parsed(lookup, "NOTIFY_RATE_LIMIT_WINDOW_SECS", &mut self.rate_limit_window_secs)?;
        override_parsed(lookup, "NOTIFY_RATE_LIMIT_EMAIL", &mut self.rate_limits.email)?;
        override_parsed(lookup, "NOTIFY_RATE_LIMIT_IN_APP", &mut self.rate_limits.in_app)?;
        override_parsed(lookup, "NOTIFY_RATE_LIMIT_SYSTEM", &mut self.rate_limits.system)?;
        override_parsed(lookup, "NOTIFY_QUEUE_CAPACITY_URGENT", &mut self.queue_capacities.urgent)?;
        override_parsed(lookup, "NOTIFY_QUEUE_CAPACITY_HIGH", &mut self.queue_capacities.high)?;
        override_parsed(lookup, "NOTIFY_QUEUE_CAPACITY_MEDIUM", &mut self.queue_capacities.medium)?;
        override_parsed(lookup, "NOTIFY_QUEUE_CAPACITY_LOW", &mut self.queue_capacities.low)?;
        override_parsed(lookup, "NOTIFY_DELIVERY_TIMEOUT_SECS", &mut self.delivery_timeout_secs)?;
        override_parsed(lookup, "NOTIFY_DRAIN_TIMEOUT_SECS", &mut self.drain_timeout_secs)?;
        override_parsed(lookup, "NOTIFY_POLL_INTERVAL_MS", &mut self.poll_interval_ms)?;
        override_parsed(lookup, "NOTIFY_TRANSITION_BUFFER", &mut self.transition_buffer)?;
        override_parsed(lookup, "NOTIFY_LOG_DIR", &mut self.log_dir)?;
        if let Some(filter) = non_empty(lookup, "NOTIFY_LOG_FILTER") {
            self.log_filter = Some(filter);
        }

        if let Some(host) = non_empty(lookup, "NOTIFY_SMTP_HOST") {
            self.channels.email.get_or_insert_with(EmailConfig::default).smtp_host = host;
        }
        if let Some(email) = self.channels.email.as_mut() {
            override_parsed(lookup, "NOTIFY_SMTP_PORT", &mut email.smtp_port)?;
            override_parsed(lookup, "NOTIFY_SMTP_USE_TLS", &mut email.use_tls)?;
            override_parsed(lookup, "NOTIFY_SMTP_FROM", &mut email.from_address)?;
            if let Some(username) = non_empty(lookup, "NOTIFY_SMTP_USERNAME") {
                email.smtp_username = Some(username);
            }
            if let Some(password) = non_empty(lookup, "NOTIFY_SMTP_PASSWORD") {
                email.smtp_password = Some(password);
            }
        }

        if let Some(url) = non_empty(lookup, "NOTIFY_SYSTEM_WEBHOOK_URL") {
            self.channels.system.webhook.get_or_insert_with(WebhookConfig::default).url = url;
        }
        if let Some(webhook) = self.channels.system.webhook.as_mut()
            && let Some(token) = non_empty(lookup, "NOTIFY_SYSTEM_WEBHOOK_TOKEN")
        {
            webhook.auth = Some(WebhookAuth::Bearer { token });
        }

        Ok(())
    }

    /// Check bounds.
    pub fn validate(&self) -> Result<()> {
        if !(1..=10).contains(&self.max_retry_attempts) {
            return Err(Error::config(format!(
                "max_retry_attempts must be between 1 and 10, got {}",
                self.max_retry_attempts
            )));
        }
        if !(1..=3600).contains(&self.retry_base_delay_secs) {
            return Err(Error::config(format!(
                "retry_base_delay_secs must be between 1 and 3600, got {}",
                self.retry_base_delay_secs
            )));
        }

        let nonzero = [
            ("rate_limit_window_secs", self.rate_limit_window_secs),
            ("rate_limits.email", self.rate_limits.email as u64),
            ("rate_limits.in_app", self.rate_limits.in_app as u64),
            ("rate_limits.system", self.rate_limits.system as u64),
            ("queue_capacities.urgent", self.queue_capacities.urgent as u64),
            ("queue_capacities.high", self.queue_capacities.high as u64),
            ("queue_capacities.medium", self.queue_capacities.medium as u64),
            ("queue_capacities.low", self.queue_capacities.low as u64),
            ("delivery_timeout_secs", self.delivery_timeout_secs),
            ("poll_interval_ms", self.poll_interval_ms),
            ("transition_buffer", self.transition_buffer as u64),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(Error::config(format!("{} must be greater than zero", name)));
        }

        if let Some(email) = &self.channels.email {
            if email.smtp_host.trim().is_empty() {
                return Err(Error::config("smtp_host must not be empty"));
            }
            if email.smtp_port == 0 {
                return Err(Error::config("smtp_port must be between 1 and 65535"));
            }
            if email.from_address.trim().is_empty() {
                return Err(Error::config("from_address is required when SMTP is configured"));
            }
        }

        Ok(())
    }

    /// Copy with secrets hidden, for logging.
    pub fn masked(&self) -> Self {
        let mut masked = self.clone();
        masked.channels.email = self.channels.email.as_ref().map(EmailConfig::masked);
        masked.channels.system = self.channels.system.masked();
        masked
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_secs(self.retry_base_delay_secs),
            self.max_retry_attempts,
        )
    }

    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig::default()
            .with_window(Duration::from_secs(self.rate_limit_window_secs))
            .with_limit(Channel::Email, self.rate_limits.email)
            .with_limit(Channel::InApp, self.rate_limits.in_app)
            .with_limit(Channel::System, self.rate_limits.system)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            retry: self.retry_policy(),
            rate_limits: self.rate_limiter_config(),
            queue_capacities: self.queue_capacities,
            delivery_timeout: Duration::from_secs(self.delivery_timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            transition_buffer: self.transition_buffer,
        }
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).filter(|v| !v.trim().is_empty())
}

fn override_parsed<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = non_empty(lookup, key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("invalid value for {}: {} ({})", key, raw, e)))?;
    }
    Ok(())
}
