//! Server and client configuration.
//!
//! The server reads overrides from `TANDEM_*` environment variables; bad
//! values are logged and the default kept.

use std::str::FromStr;
use std::time::Duration;
use tandem_core::DEFAULT_LOCK_TTL_MS;

use crate::presence::PRESENCE_INTERVAL;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind (e.g., "0.0.0.0:9090").
    pub bind_addr: String,
    /// Default participant cap for new sessions.
    pub max_participants: usize,
    /// Broadcast channel capacity per session.
    pub broadcast_capacity: usize,
    /// Heartbeat interval in seconds. Lock expiry and compaction run on it.
    pub heartbeat_secs: u64,
    /// Upper bound on the lock time-to-live a session may ask for.
    pub lock_ttl: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_participants: 50,
            broadcast_capacity: 256,
            heartbeat_secs: 30,
            lock_ttl: Duration::from_millis(DEFAULT_LOCK_TTL_MS),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `TANDEM_BIND_ADDR`, `TANDEM_MAX_PARTICIPANTS`,
    /// `TANDEM_BROADCAST_CAPACITY`, `TANDEM_HEARTBEAT_SECS` and
    /// `TANDEM_LOCK_TTL_SECS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup("TANDEM_BIND_ADDR") {
            config.bind_addr = addr;
        }
        parse_into(&lookup, "TANDEM_MAX_PARTICIPANTS", &mut config.max_participants);
        parse_into(&lookup, "TANDEM_BROADCAST_CAPACITY", &mut config.broadcast_capacity);
        parse_into(&lookup, "TANDEM_HEARTBEAT_SECS", &mut config.heartbeat_secs);
        let mut ttl_secs = config.lock_ttl.as_secs();
        parse_into(&lookup, "TANDEM_LOCK_TTL_SECS", &mut ttl_secs);
        config.lock_ttl = Duration::from_secs(ttl_secs);
        config
    }
}

fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => log::warn!("Ignoring invalid {key}={raw:?}"),
    }
}

/// Exponential reconnect backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Give up after this many consecutive failures.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl BackoffPolicy {
    /// Delay before attempt `attempt` (1-based): base · 2^(attempt-1),
    /// capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .map_or(self.max, |d| d.min(self.max))
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server URL (e.g., "ws://127.0.0.1:9090").
    pub url: String,
    pub backoff: BackoffPolicy,
    pub heartbeat: Duration,
    /// Heartbeats without any traffic before the link counts as dead.
    pub missed_heartbeats: u32,
    pub request_timeout: Duration,
    /// Unacknowledged operations kept while offline.
    pub queue_capacity: usize,
    pub presence_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090".to_string(),
            backoff: BackoffPolicy::default(),
            heartbeat: Duration::from_secs(5),
            missed_heartbeats: 3,
            request_timeout: Duration::from_secs(10),
            queue_capacity: 10_000,
            presence_interval: PRESENCE_INTERVAL,
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_participants, 50);
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.heartbeat_secs, 30);
        assert_eq!(config.lock_ttl, Duration::from_secs(30));
    }

    #[test]
    fn test_server_config_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("TANDEM_BIND_ADDR", "0.0.0.0:7000"),
            ("TANDEM_MAX_PARTICIPANTS", "8"),
            ("TANDEM_HEARTBEAT_SECS", "not-a-number"),
            ("TANDEM_LOCK_TTL_SECS", " 5 "),
        ]);
        let config = ServerConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.max_participants, 8);
        assert_eq!(config.heartbeat_secs, 30);
        assert_eq!(config.lock_ttl, Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(5), Duration::from_secs(16));
        assert_eq!(policy.delay(6), Duration::from_secs(30));
        assert_eq!(policy.delay(60), Duration::from_secs(30));
        assert!(!policy.exhausted(10));
        assert!(policy.exhausted(11));
    }
}
