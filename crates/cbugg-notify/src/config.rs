//! Pipeline configuration.

use std::time::Duration;

use cbugg_core::defaults;

/// Configuration for the notification pipeline and the janitor.
#[derive(Debug, Clone)]
pub struct NotifyConfig {
    /// Quiet window before a bug's change burst is mailed.
    pub notification_delay_ms: u64,
    /// Buffer of each typed channel feeding the dispatch loop.
    pub channel_capacity: usize,
    /// Outbound buffer per live subscriber.
    pub live_buffer: usize,
    /// Live events retained for late joiners.
    pub recent_capacity: usize,
    /// Prefix for links in rendered messages.
    pub base_url: String,
    /// Sender address; also the identity the janitor acts as.
    pub mail_from: String,
    pub janitor_interval_secs: u64,
    pub inbox_max_age_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            notification_delay_ms: defaults::NOTIFICATION_DELAY_MS,
            channel_capacity: defaults::NOTIFY_CHANNEL_CAPACITY,
            live_buffer: defaults::LIVE_SUBSCRIBER_BUFFER,
            recent_capacity: defaults::RECENT_CHANGES_CAPACITY,
            base_url: defaults::BASE_URL.to_string(),
            mail_from: String::new(),
            janitor_interval_secs: defaults::JANITOR_INTERVAL_SECS,
            inbox_max_age_secs: defaults::INBOX_MAX_AGE_SECS,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse::<T>().ok())
}

impl NotifyConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `NOTIFICATION_DELAY_MS` | `10000` | Debounce quiet window |
    /// | `NOTIFY_CHANNEL_CAPACITY` | `100` | Typed channel buffer |
    /// | `LIVE_SUBSCRIBER_BUFFER` | `256` | Per-subscriber buffer before eviction |
    /// | `RECENT_CHANGES_CAPACITY` | `100` | Recent-change ring size |
    /// | `CBUGG_BASE_URL` | `http://localhost:8066` | Link prefix in messages |
    /// | `CBUGG_MAIL_FROM` | (empty) | Sender and janitor identity |
    /// | `JANITOR_INTERVAL_SECS` | `3600` | Janitor sweep interval |
    /// | `INBOX_MAX_AGE_SECS` | `3600` | Inbox age before triage |
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            notification_delay_ms: env_parse("NOTIFICATION_DELAY_MS")
                .unwrap_or(base.notification_delay_ms),
            channel_capacity: env_parse::<usize>("NOTIFY_CHANNEL_CAPACITY")
                .unwrap_or(base.channel_capacity)
                .max(1),
            live_buffer: env_parse::<usize>("LIVE_SUBSCRIBER_BUFFER")
                .unwrap_or(base.live_buffer)
                .max(1),
            recent_capacity: env_parse("RECENT_CHANGES_CAPACITY").unwrap_or(base.recent_capacity),
            base_url: std::env::var("CBUGG_BASE_URL").unwrap_or(base.base_url),
            mail_from: std::env::var("CBUGG_MAIL_FROM").unwrap_or(base.mail_from),
            janitor_interval_secs: env_parse::<u64>("JANITOR_INTERVAL_SECS")
                .unwrap_or(base.janitor_interval_secs)
                .max(1),
            inbox_max_age_secs: env_parse("INBOX_MAX_AGE_SECS").unwrap_or(base.inbox_max_age_secs),
        }
    }

    pub fn with_notification_delay(mut self, ms: u64) -> Self {
        self.notification_delay_ms = ms;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn with_live_buffer(mut self, capacity: usize) -> Self {
        self.live_buffer = capacity.max(1);
        self
    }

    pub fn with_recent_capacity(mut self, capacity: usize) -> Self {
        self.recent_capacity = capacity;
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_mail_from(mut self, address: impl Into<String>) -> Self {
        self.mail_from = address.into();
        self
    }

    pub fn with_janitor_interval(mut self, secs: u64) -> Self {
        self.janitor_interval_secs = secs.max(1);
        self
    }

    pub fn with_inbox_max_age(mut self, secs: u64) -> Self {
        self.inbox_max_age_secs = secs;
        self
    }

    pub fn notification_delay(&self) -> Duration {
        Duration::from_millis(self.notification_delay_ms)
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.janitor_interval_secs)
    }

    /// Whether outbound mail can actually be addressed.
    pub fn mail_configured(&self) -> bool {
        !self.mail_from.is_empty()
    }
}
