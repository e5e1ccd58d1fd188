use std::env;
use std::time::Duration;

use huddle::HuddleConfig;

#[derive(Debug, Clone)]
pub struct RoadConfig {
    pub port: u16,
    pub bind: String,
    /// Timeouts used by the broker hosted on this relay.
    pub huddle: HuddleConfig,
    /// When set, connect requests may target endpoints that never said hello.
    pub accept_unknown: bool,
}

impl RoadConfig {
    pub fn from_env() -> Self {
        Self {
            port: env::var("HUDDLE_ROAD_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            bind: env::var("HUDDLE_ROAD_BIND").unwrap_or_else(|_| "0.0.0.0".to_string()),
            huddle: HuddleConfig::from_env(),
            accept_unknown: env::var("HUDDLE_ROAD_ACCEPT_UNKNOWN")
                .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.huddle.request_timeout = timeout;
        self
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

impl Default for RoadConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            bind: "0.0.0.0".to_string(),
            huddle: HuddleConfig::default(),
            accept_unknown: false,
        }
    }
}
