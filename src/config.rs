//! Runtime configuration, loaded from the environment once at start-up.

use std::time::Duration;

/// All tunables the substrate needs to run, collected in one place the way
/// `LlmConfig::from_env` collects provider credentials — every field has a
/// sane default so the binary starts with zero environment configured,
/// except where that would be actively unsafe (the LLM backend endpoint).
#[derive(Debug, Clone)]
pub struct Config {
    pub persistence_root: std::path::PathBuf,
    pub bind_port: u16,

    pub session_timeout_seconds: u64,
    pub context_stale_threshold_seconds: u64,
    pub chat_log_excerpt_chars: usize,
    pub chat_summary_recent_count: usize,

    pub max_sub_agents: usize,
    pub max_retries: u32,

    pub file_tracker_inline_threshold: usize,

    pub event_bus_ping_interval_seconds: u64,
    pub event_bus_missed_pong_limit: u32,

    pub scheduler_tick_seconds: u64,

    pub llm_backend_endpoint: Option<String>,

    pub default_quota_bytes: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            persistence_root: std::env::var("AGENT_HOST_DATA_DIR")
                .map(std::path::PathBuf::from)
                .unwrap_or_else(|_| default_persistence_root()),
            bind_port: env_parsed("AGENT_HOST_PORT", 8000),

            session_timeout_seconds: env_parsed("AGENT_HOST_SESSION_TIMEOUT_SECONDS", 3600),
            context_stale_threshold_seconds: env_parsed(
                "AGENT_HOST_CONTEXT_STALE_THRESHOLD_SECONDS",
                600,
            ),
            chat_log_excerpt_chars: env_parsed("AGENT_HOST_CHAT_LOG_EXCERPT_CHARS", 8000),
            chat_summary_recent_count: env_parsed("AGENT_HOST_CHAT_SUMMARY_RECENT_COUNT", 3),

            max_sub_agents: env_parsed("AGENT_HOST_MAX_SUB_AGENTS", 10),
            max_retries: env_parsed("AGENT_HOST_MAX_RETRIES", 10),

            file_tracker_inline_threshold: env_parsed(
                "AGENT_HOST_FILE_TRACKER_INLINE_THRESHOLD",
                5,
            ),

            event_bus_ping_interval_seconds: env_parsed(
                "AGENT_HOST_EVENT_BUS_PING_INTERVAL_SECONDS",
                30,
            ),
            event_bus_missed_pong_limit: env_parsed("AGENT_HOST_EVENT_BUS_MISSED_PONG_LIMIT", 2),

            scheduler_tick_seconds: env_parsed("AGENT_HOST_SCHEDULER_TICK_SECONDS", 30),

            llm_backend_endpoint: std::env::var("AGENT_HOST_LLM_BACKEND_ENDPOINT").ok(),

            default_quota_bytes: env_parsed("AGENT_HOST_DEFAULT_QUOTA_BYTES", 1024 * 1024 * 1024),
        }
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_seconds)
    }

    pub fn context_stale_threshold(&self) -> Duration {
        Duration::from_secs(self.context_stale_threshold_seconds)
    }

    pub fn event_bus_ping_interval(&self) -> Duration {
        Duration::from_secs(self.event_bus_ping_interval_seconds)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_seconds)
    }
}

fn default_persistence_root() -> std::path::PathBuf {
    std::env::var("HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::path::PathBuf::from("."))
        .join(".agent-host")
        .join("data")
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
