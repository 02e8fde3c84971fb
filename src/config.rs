//! Broker configuration
//!
//! Defaults suit a local deployment; every field can be overridden from the
//! environment with a `HUDDLE_` variable.

use std::time::Duration;

use tracing::warn;

pub const DEFAULT_PORT: u16 = 8000;

/// Runtime settings for the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Host to bind to
    pub host: String,

    /// HTTP/WebSocket port
    pub port: u16,

    /// Maximum peers per room, `None` for unrestricted
    pub room_capacity: Option<usize>,

    /// Messages buffered per peer before it is considered stalled
    pub outbound_buffer: usize,

    /// Capacity of the broadcaster's inbound queue
    pub inbound_queue: usize,

    /// Interval between WebSocket pings
    pub heartbeat_interval: Duration,

    /// How long a created room may wait for its first peer
    pub unclaimed_room_ttl: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            room_capacity: None,
            outbound_buffer: 64,
            inbound_queue: 1024,
            heartbeat_interval: Duration::from_secs(30),
            unclaimed_room_ttl: Duration::from_secs(300),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from any key lookup, starting from defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(host) = lookup("HUDDLE_HOST") {
            config.host = host;
        }
        if let Some(port) = parse(&lookup, "HUDDLE_PORT") {
            config.port = port;
        }
        if let Some(capacity) = parse::<usize>(&lookup, "HUDDLE_ROOM_CAPACITY") {
            config.room_capacity = (capacity > 0).then_some(capacity);
        }
        if let Some(buffer) = parse(&lookup, "HUDDLE_OUTBOUND_BUFFER") {
            config.outbound_buffer = buffer;
        }
        if let Some(queue) = parse(&lookup, "HUDDLE_INBOUND_QUEUE") {
            config.inbound_queue = queue;
        }
        if let Some(secs) = parse(&lookup, "HUDDLE_HEARTBEAT_SECS") {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(&lookup, "HUDDLE_ROOM_TTL_SECS") {
            config.unclaimed_room_ttl = Duration::from_secs(secs);
        }

        config
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {}={:?}: not a valid value", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let config = BrokerConfig::from_lookup(lookup(&[]));
        assert_eq!(config, BrokerConfig::default());
        assert_eq!(config.bind_addr(), "0.0.0.0:8000");
        assert_eq!(config.room_capacity, None);
    }

    #[test]
    fn overrides_from_env() {
        let config = BrokerConfig::from_lookup(lookup(&[
            ("HUDDLE_HOST", "127.0.0.1"),
            ("HUDDLE_PORT", "9100"),
            ("HUDDLE_ROOM_CAPACITY", "2"),
            ("HUDDLE_OUTBOUND_BUFFER", "8"),
            ("HUDDLE_HEARTBEAT_SECS", "5"),
        ]));
        assert_eq!(config.bind_addr(), "127.0.0.1:9100");
        assert_eq!(config.room_capacity, Some(2));
        assert_eq!(config.outbound_buffer, 8);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.inbound_queue, 1024);
    }

    #[test]
    fn zero_capacity_means_unrestricted() {
        let config = BrokerConfig::from_lookup(lookup(&[("HUDDLE_ROOM_CAPACITY", "0")]));
        assert_eq!(config.room_capacity, None);
    }

    #[test]
    fn invalid_values_keep_defaults() {
        let config = BrokerConfig::from_lookup(lookup(&[
            ("HUDDLE_PORT", "eighty"),
            ("HUDDLE_ROOM_TTL_SECS", "-1"),
        ]));
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.unclaimed_room_ttl, Duration::from_secs(300));
    }
}
