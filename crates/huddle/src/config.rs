use std::env;
use std::time::Duration;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_DECISION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RECONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HuddleConfig {
    /// Window for the target to acknowledge a connect request.
    pub request_timeout: Duration,
    /// Window for the target to decide once it acknowledged.
    pub decision_timeout: Duration,
    /// A link that never reaches Connected fails after this long.
    pub negotiation_timeout: Duration,
    /// Time allowed for an ICE restart after a connected link drops.
    pub reconnect_timeout: Duration,
    /// Round-trip budget for a single relay call over the WebSocket.
    pub call_timeout: Duration,
    pub ice_servers: Vec<String>,
    pub relay_url: Option<String>,
}

impl HuddleConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let ice_servers = env::var("HUDDLE_ICE_SERVERS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|servers| !servers.is_empty())
            .unwrap_or(defaults.ice_servers);

        Self {
            request_timeout: secs_from_env("HUDDLE_REQUEST_TIMEOUT_SECS")
                .unwrap_or(defaults.request_timeout),
            decision_timeout: secs_from_env("HUDDLE_DECISION_TIMEOUT_SECS")
                .unwrap_or(defaults.decision_timeout),
            negotiation_timeout: secs_from_env("HUDDLE_NEGOTIATION_TIMEOUT_SECS")
                .unwrap_or(defaults.negotiation_timeout),
            reconnect_timeout: secs_from_env("HUDDLE_RECONNECT_TIMEOUT_SECS")
                .unwrap_or(defaults.reconnect_timeout),
            call_timeout: secs_from_env("HUDDLE_CALL_TIMEOUT_SECS")
                .unwrap_or(defaults.call_timeout),
            ice_servers,
            relay_url: env::var("HUDDLE_RELAY_URL").ok().filter(|s| !s.is_empty()),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_decision_timeout(mut self, timeout: Duration) -> Self {
        self.decision_timeout = timeout;
        self
    }

    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    pub fn with_reconnect_timeout(mut self, timeout: Duration) -> Self {
        self.reconnect_timeout = timeout;
        self
    }
}

impl Default for HuddleConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            decision_timeout: DEFAULT_DECISION_TIMEOUT,
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            reconnect_timeout: DEFAULT_RECONNECT_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            relay_url: None,
        }
    }
}

// Zero is treated as unset.
fn secs_from_env(key: &str) -> Option<Duration> {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}
