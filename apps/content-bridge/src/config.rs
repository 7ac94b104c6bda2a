use std::env;
use std::time::Duration;

/// Content bridge configuration.
///
/// Defaults mirror what the background worker expects; every field can be
/// overridden through a `BRIDGE_*` environment variable.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    /// Lower bound on the first backoff step, giving a cold-started
    /// background time to register its port listener.
    pub reconnect_min_delay: Duration,
    pub heartbeat_interval: Duration,
    pub health_check_interval: Duration,
    pub recovery_safety_timeout: Duration,
    pub max_recovery_attempts: u32,
    pub recovery_retry_delay: Duration,
    /// Pause between reopening the channel during recovery and rebuilding
    /// the UI on top of it.
    pub recovery_settle_delay: Duration,
    pub dedup_window: Duration,
    pub flap_window: Duration,
    pub outbound_queue_cap: usize,
    /// Host the content script is meant to run on; other pages stay idle.
    pub target_host: String,
    pub notice_duration: Duration,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_millis(1_000),
            reconnect_min_delay: Duration::from_millis(2_000),
            heartbeat_interval: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(10),
            recovery_safety_timeout: Duration::from_secs(30),
            max_recovery_attempts: 3,
            recovery_retry_delay: Duration::from_millis(2_000),
            recovery_settle_delay: Duration::from_millis(500),
            dedup_window: Duration::from_secs(5),
            flap_window: Duration::from_secs(1),
            outbound_queue_cap: 100,
            target_host: "leetcode.com".to_string(),
            notice_duration: Duration::from_secs(5),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let millis = |key: &str, fallback: Duration| {
            lookup(key)
                .and_then(|val| val.trim().parse::<u64>().ok())
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        };
        let count = |key: &str, fallback: u32| {
            lookup(key)
                .and_then(|val| val.trim().parse::<u32>().ok())
                .unwrap_or(fallback)
        };

        Self {
            max_reconnect_attempts: count(
                "BRIDGE_MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            ),
            reconnect_base_delay: millis("BRIDGE_RECONNECT_BASE_MS", defaults.reconnect_base_delay),
            reconnect_min_delay: millis("BRIDGE_RECONNECT_FLOOR_MS", defaults.reconnect_min_delay),
            heartbeat_interval: millis("BRIDGE_HEARTBEAT_MS", defaults.heartbeat_interval),
            health_check_interval: millis(
                "BRIDGE_HEALTH_CHECK_MS",
                defaults.health_check_interval,
            ),
            recovery_safety_timeout: millis(
                "BRIDGE_RECOVERY_TIMEOUT_MS",
                defaults.recovery_safety_timeout,
            ),
            max_recovery_attempts: count(
                "BRIDGE_MAX_RECOVERY_ATTEMPTS",
                defaults.max_recovery_attempts,
            ),
            recovery_retry_delay: millis("BRIDGE_RECOVERY_RETRY_MS", defaults.recovery_retry_delay),
            recovery_settle_delay: millis(
                "BRIDGE_RECOVERY_SETTLE_MS",
                defaults.recovery_settle_delay,
            ),
            dedup_window: millis("BRIDGE_DEDUP_WINDOW_MS", defaults.dedup_window),
            flap_window: millis("BRIDGE_FLAP_WINDOW_MS", defaults.flap_window),
            outbound_queue_cap: lookup("BRIDGE_QUEUE_CAP")
                .and_then(|val| val.trim().parse::<usize>().ok())
                .filter(|cap| *cap > 0)
                .unwrap_or(defaults.outbound_queue_cap),
            target_host: lookup("BRIDGE_TARGET_HOST")
                .map(|host| host.trim().to_ascii_lowercase())
                .filter(|host| !host.is_empty())
                .unwrap_or(defaults.target_host),
            notice_duration: millis("BRIDGE_NOTICE_MS", defaults.notice_duration),
            log_level: lookup("BRIDGE_LOG").unwrap_or(defaults.log_level),
        }
    }

    /// Whether `host` is the target site or one of its subdomains.
    pub fn is_target_host(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        host == self.target_host || host.ends_with(&format!(".{}", self.target_host))
    }
}
