//! Configuration for the sync client.

use std::time::Duration;

use crate::resolver::ConflictPolicy;

/// Default WebSocket base URL.
pub const DEFAULT_ENDPOINT: &str = "wss://ws.vaidikwisdomseries.com";
/// Default storage key prefix.
pub const DEFAULT_NAMESPACE: &str = "vedic";

/// Logical channel selected by the connection path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    LiveTeaching,
    Meditation,
    Community,
    Notifications,
    General,
}

impl Channel {
    /// Maps a purpose name to a channel. Unknown purposes use `General`.
    pub fn from_purpose(purpose: &str) -> Self {
        match purpose {
            "live-teaching" => Channel::LiveTeaching,
            "meditation" | "meditation-sessions" => Channel::Meditation,
            "community" | "community-chat" => Channel::Community,
            "notifications" => Channel::Notifications,
            _ => Channel::General,
        }
    }

    /// URL path of the channel.
    pub fn path(&self) -> &'static str {
        match self {
            Channel::LiveTeaching => "/live-teaching",
            Channel::Meditation => "/meditation-sessions",
            Channel::Community => "/community-chat",
            Channel::Notifications => "/notifications",
            Channel::General => "/general",
        }
    }

    pub fn purpose(&self) -> &'static str {
        match self {
            Channel::LiveTeaching => "live-teaching",
            Channel::Meditation => "meditation",
            Channel::Community => "community",
            Channel::Notifications => "notifications",
            Channel::General => "general",
        }
    }
}

/// Reconnect backoff settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Attempts allowed before giving up.
    pub max_attempts: u32,
}

impl ReconnectConfig {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before reconnect attempt `attempt` (1-based):
    /// `min(base_delay * 2^(attempt - 1), max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 10,
        }
    }
}

/// Configuration for a [`SyncClient`](crate::client::SyncClient).
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL, e.g. "wss://ws.example.com". `http(s)` is rewritten to `ws(s)`.
    pub endpoint: String,
    pub channel: Channel,
    /// Appended as the `auth` query parameter when present.
    pub auth_token: Option<String>,
    /// Prefix for every storage key owned by the client.
    pub namespace: String,
    pub reconnect: ReconnectConfig,
    pub heartbeat_interval: Duration,
    /// Fail the connection when nothing has been received for this long.
    /// `None` disables liveness enforcement.
    pub heartbeat_timeout: Option<Duration>,
    pub sync_interval: Duration,
    pub conflict_policy: ConflictPolicy,
    /// Attached to locally created events.
    pub user_id: Option<String>,
    /// Entities requested by a full sync request.
    pub sync_entities: Vec<String>,
}

impl SyncConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            channel: Channel::General,
            auth_token: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            reconnect: ReconnectConfig::default(),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: None,
            sync_interval: Duration::from_secs(300),
            conflict_policy: ConflictPolicy::Merge,
            user_id: None,
            sync_entities: ["offering", "testimonial", "teacher", "content"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Storage key for the given suffix, e.g. `vedic_pending_changes`.
    pub fn storage_key(&self, suffix: &str) -> String {
        format!("{}_{}", self.namespace, suffix)
    }

    /// Builds the WebSocket URL for the configured channel.
    pub fn channel_url(&self) -> String {
        // Convert http(s) to ws(s) if needed
        let base_url = if let Some(rest) = self.endpoint.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else if let Some(rest) = self.endpoint.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if !self.endpoint.starts_with("ws://") && !self.endpoint.starts_with("wss://") {
            format!("wss://{}", self.endpoint)
        } else {
            self.endpoint.clone()
        };

        let mut url = format!("{}{}", base_url.trim_end_matches('/'), self.channel.path());
        if let Some(token) = &self.auth_token {
            url.push_str("?auth=");
            url.push_str(&urlencoding::encode(token));
        }
        url
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new(DEFAULT_ENDPOINT)
    }
}
