//! Server configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `REVHTTP_LONG_POLL_MIN_TIMEOUT_MS`,
//!    `REVHTTP_LONG_POLL_MAX_TIMEOUT_MS`, `REVHTTP_SESSION_IDLE_TIMEOUT_MS`
//! 2. **Config file** — path passed to [`ServerConfig::load`], or
//!    `revhttp.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct:
//!
//! ```toml
//! long_poll_min_timeout_ms = 0
//! long_poll_max_timeout_ms = 120000   # 2 minutes
//! session_idle_timeout_ms = 600000    # 10 minutes
//! max_envelope_bytes = 2097152        # 2 MB
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Tunables for the reverse server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Floor for the long-poll timeout in milliseconds (default 0). Polls
    /// asking for less are clamped up with an `X-Warning`.
    #[serde(default = "default_long_poll_min_timeout_ms")]
    pub long_poll_min_timeout_ms: u64,
    /// Ceiling for the long-poll timeout in milliseconds (default 120 000).
    /// Polls asking for more are clamped down with an `X-Warning`.
    #[serde(default = "default_long_poll_max_timeout_ms")]
    pub long_poll_max_timeout_ms: u64,
    /// A session that goes this long without a poll is closed and evicted
    /// (default 600 000 — 10 minutes).
    #[serde(default = "default_session_idle_timeout_ms")]
    pub session_idle_timeout_ms: u64,
    /// Maximum poll body size in bytes accepted for a response envelope
    /// (default 2 MB).
    #[serde(default = "default_max_envelope_bytes")]
    pub max_envelope_bytes: usize,
}

fn default_long_poll_min_timeout_ms() -> u64 {
    0
}
fn default_long_poll_max_timeout_ms() -> u64 {
    120_000 // 2 minutes
}
fn default_session_idle_timeout_ms() -> u64 {
    600_000 // 10 minutes
}
fn default_max_envelope_bytes() -> usize {
    2 * 1024 * 1024 // 2 MB
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            long_poll_min_timeout_ms: default_long_poll_min_timeout_ms(),
            long_poll_max_timeout_ms: default_long_poll_max_timeout_ms(),
            session_idle_timeout_ms: default_session_idle_timeout_ms(),
            max_envelope_bytes: default_max_envelope_bytes(),
        }
    }
}

impl ServerConfig {
    pub fn long_poll_min_timeout(&self) -> Duration {
        Duration::from_millis(self.long_poll_min_timeout_ms)
    }

    pub fn long_poll_max_timeout(&self) -> Duration {
        Duration::from_millis(self.long_poll_max_timeout_ms)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.session_idle_timeout_ms)
    }

    /// Load configuration with the precedence chain: env vars > file >
    /// defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `revhttp.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("revhttp.toml").exists() {
            let content =
                std::fs::read_to_string("revhttp.toml").expect("Failed to read revhttp.toml");
            toml::from_str(&content).expect("Failed to parse revhttp.toml")
        } else {
            Self::default()
        };

        // Env var overrides
        if let Some(ms) = env_ms("REVHTTP_LONG_POLL_MIN_TIMEOUT_MS") {
            config.long_poll_min_timeout_ms = ms;
        }
        if let Some(ms) = env_ms("REVHTTP_LONG_POLL_MAX_TIMEOUT_MS") {
            config.long_poll_max_timeout_ms = ms;
        }
        if let Some(ms) = env_ms("REVHTTP_SESSION_IDLE_TIMEOUT_MS") {
            config.session_idle_timeout_ms = ms;
        }

        config
    }
}

fn env_ms(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
