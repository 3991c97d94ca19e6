use std::env;
use std::time::Duration;

pub const DEFAULT_LOG_CAPACITY: usize = 15;
pub const DEFAULT_OFFLINE_PROMPT: &str = "ghost@offline:~$ ";

/// Session tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Entries kept by the operator log.
    pub log_capacity: usize,
    /// Outbound connect deadline; `None` waits for the transport to give up.
    pub connect_timeout: Option<Duration>,
    /// Compose inactivity before a debounced `Typing(false)`.
    pub typing_idle: Duration,
    /// Safety clear for a remote typing indicator.
    pub typing_timeout: Duration,
    pub effect_duration: Duration,
    pub offline_prompt: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            log_capacity: DEFAULT_LOG_CAPACITY,
            connect_timeout: Some(Duration::from_secs(15)),
            typing_idle: Duration::from_secs(3),
            typing_timeout: Duration::from_secs(5),
            effect_duration: Duration::from_secs(3),
            offline_prompt: DEFAULT_OFFLINE_PROMPT.to_string(),
        }
    }
}

impl SessionConfig {
    /// Defaults overridden by `GHOST_*` environment variables. Unparseable
    /// values fall back to the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let connect_timeout = match env_u64("GHOST_CONNECT_TIMEOUT_MS") {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => defaults.connect_timeout,
        };
        Self {
            log_capacity: env::var("GHOST_LOG_CAPACITY")
                .ok()
                .and_then(|val| val.parse().ok())
                .unwrap_or(defaults.log_capacity),
            connect_timeout,
            typing_idle: env_millis("GHOST_TYPING_IDLE_MS").unwrap_or(defaults.typing_idle),
            typing_timeout: env_millis("GHOST_TYPING_TIMEOUT_MS").unwrap_or(defaults.typing_timeout),
            effect_duration: env_millis("GHOST_EFFECT_MS").unwrap_or(defaults.effect_duration),
            offline_prompt: env::var("GHOST_OFFLINE_PROMPT").unwrap_or(defaults.offline_prompt),
        }
    }

    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_typing(mut self, idle: Duration, timeout: Duration) -> Self {
        self.typing_idle = idle;
        self.typing_timeout = timeout;
        self
    }

    pub fn with_effect_duration(mut self, duration: Duration) -> Self {
        self.effect_duration = duration;
        self
    }

    pub fn with_offline_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.offline_prompt = prompt.into();
        self
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|val| val.trim().parse().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_u64(key).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const KEYS: [&str; 6] = [
        "GHOST_LOG_CAPACITY",
        "GHOST_CONNECT_TIMEOUT_MS",
        "GHOST_TYPING_IDLE_MS",
        "GHOST_TYPING_TIMEOUT_MS",
        "GHOST_EFFECT_MS",
        "GHOST_OFFLINE_PROMPT",
    ];

    fn clear_env() {
        for key in KEYS {
            unsafe {
                env::remove_var(key);
            }
        }
    }

    #[test]
    fn defaults_match_session_behaviour() {
        let config = SessionConfig::default();
        assert_eq!(config.log_capacity, 15);
        assert_eq!(config.typing_idle, Duration::from_secs(3));
        assert_eq!(config.typing_timeout, Duration::from_secs(5));
        assert_eq!(config.effect_duration, Duration::from_secs(3));
        assert_eq!(config.offline_prompt, "ghost@offline:~$ ");
    }

    #[test]
    fn from_env_without_overrides_is_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        assert_eq!(SessionConfig::from_env(), SessionConfig::default());
    }

    #[test]
    fn from_env_reads_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("GHOST_LOG_CAPACITY", "40");
            env::set_var("GHOST_CONNECT_TIMEOUT_MS", "0");
            env::set_var("GHOST_TYPING_IDLE_MS", "1500");
            env::set_var("GHOST_EFFECT_MS", "not-a-number");
            env::set_var("GHOST_OFFLINE_PROMPT", "> ");
        }
        let config = SessionConfig::from_env();
        clear_env();

        assert_eq!(config.log_capacity, 40);
        assert_eq!(config.connect_timeout, None);
        assert_eq!(config.typing_idle, Duration::from_millis(1500));
        assert_eq!(config.typing_timeout, Duration::from_secs(5));
        assert_eq!(config.effect_duration, Duration::from_secs(3));
        assert_eq!(config.offline_prompt, "> ");
    }
}
