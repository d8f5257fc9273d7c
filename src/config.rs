//! Configuration for the notification client

use std::time::Duration;

/// Store key the bearer token is kept under
pub const DEFAULT_TOKEN_KEY: &str = "authToken";

/// Configuration for connecting to the notification broker
#[derive(Debug, Clone)]
pub struct NotifyConfig {
    /// Broker URL (e.g., "wss://api.example.com/ws")
    pub url: String,

    /// STOMP virtual host; derived from the URL when unset
    pub host: Option<String>,

    /// Key the bearer token is read from in the credential store
    pub token_key: String,

    /// Maximum consecutive connect attempts before refusing further ones
    pub max_attempts: u32,

    /// How long a connect attempt may wait for the broker's acknowledgment
    pub connect_timeout: Duration,

    /// Fixed delay between transport reconnect attempts after a drop
    pub reconnect_delay: Duration,

    /// Interval the client promises to send heart-beats at (zero disables)
    pub heartbeat_outgoing: Duration,

    /// Interval the client wants to receive heart-beats at (zero disables)
    pub heartbeat_incoming: Duration,

    /// Largest inbound frame accepted, in bytes
    pub max_frame_size: usize,
}

impl NotifyConfig {
    /// Create a new configuration with the given broker URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            host: None,
            token_key: DEFAULT_TOKEN_KEY.to_string(),
            max_attempts: 3,
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
            heartbeat_outgoing: Duration::from_secs(10),
            heartbeat_incoming: Duration::from_secs(10),
            max_frame_size: 1024 * 1024,
        }
    }

    /// Build a configuration from `EDUNOTIFY_*` environment variables.
    ///
    /// Returns `None` when `EDUNOTIFY_URL` is not set. Unparsable optional
    /// values keep their defaults.
    pub fn from_env() -> Option<Self> {
        let mut config = Self::new(std::env::var("EDUNOTIFY_URL").ok()?);

        if let Ok(key) = std::env::var("EDUNOTIFY_TOKEN_KEY") {
            config.token_key = key;
        }
        if let Some(max) = env_parse::<u32>("EDUNOTIFY_MAX_ATTEMPTS") {
            config.max_attempts = max;
        }
        if let Some(secs) = env_parse::<u64>("EDUNOTIFY_CONNECT_TIMEOUT_SECS") {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("EDUNOTIFY_RECONNECT_DELAY_SECS") {
            config.reconnect_delay = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse::<u64>("EDUNOTIFY_HEARTBEAT_MS") {
            config.heartbeat_outgoing = Duration::from_millis(ms);
            config.heartbeat_incoming = Duration::from_millis(ms);
        }

        Some(config)
    }

    /// Set the STOMP virtual host
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the credential store key
    pub fn token_key(mut self, key: impl Into<String>) -> Self {
        self.token_key = key.into();
        self
    }

    /// Set the maximum number of consecutive connect attempts
    pub fn max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    /// Set the connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the transport reconnect delay
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set both heart-beat intervals
    pub fn heartbeat(mut self, outgoing: Duration, incoming: Duration) -> Self {
        self.heartbeat_outgoing = outgoing;
        self.heartbeat_incoming = incoming;
        self
    }

    /// Set the inbound frame size limit
    pub fn max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    /// Virtual host sent in the CONNECT frame
    pub fn effective_host(&self) -> String {
        if let Some(host) = &self.host {
            return host.clone();
        }

        let rest = self
            .url
            .split_once("://")
            .map_or(self.url.as_str(), |(_, rest)| rest);
        let authority = rest.split('/').next().unwrap_or(rest);
        let host = authority.rsplit('@').next().unwrap_or(authority);

        match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name.to_string(),
            _ => host.to_string(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}
