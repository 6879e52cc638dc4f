//! Environment-driven daemon configuration.
//!
//! Read once at startup; every knob has an `SMX_*` environment variable and
//! a builder-style override for tests.

use std::env;
use std::time::Duration;

use tracing::warn;

use smx_core::SessionMode;

/// Default listener address.
pub const DEFAULT_BIND: &str = "127.0.0.1";

/// Default listener port.
pub const DEFAULT_PORT: u16 = 7791;

const DEFAULT_HELPER_BIN: &str = "vt";
const DEFAULT_HELPER_COLS: u16 = 120;
const DEFAULT_HELPER_ROWS: u16 = 40;
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 2000;
const DEFAULT_VIEW_TIMEOUT_MS: u64 = 5000;
const DEFAULT_MAX_SESSIONS: usize = 100;
const FALLBACK_SHELL: &str = "/bin/sh";

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Listener host (`SMX_BIND`).
    pub bind: String,

    /// Listener port (`SMX_PORT`).
    pub port: u16,

    /// Output mode for every session (`SMX_MODE`: `direct` or `rendered`).
    pub mode: SessionMode,

    /// Binary used when `newSession` omits one (`SMX_SHELL`, then `$SHELL`,
    /// then `/bin/sh`).
    pub default_shell: String,

    /// Renderer helper binary for rendered mode (`SMX_HELPER`).
    pub helper_bin: String,

    /// Helper virtual screen size (`SMX_HELPER_COLS` / `SMX_HELPER_ROWS`).
    pub helper_cols: u16,
    pub helper_rows: u16,

    /// Output relay tick (`SMX_FLUSH_INTERVAL_MS`).
    pub flush_interval: Duration,

    /// View request timeout (`SMX_VIEW_TIMEOUT_MS`).
    pub view_timeout: Duration,

    /// Registry capacity (`SMX_MAX_SESSIONS`).
    pub max_sessions: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        let mode = match env::var("SMX_MODE") {
            Ok(raw) => SessionMode::parse(&raw).unwrap_or_else(|| {
                warn!(value = %raw, "unrecognized SMX_MODE, using direct");
                SessionMode::Direct
            }),
            Err(_) => SessionMode::Direct,
        };

        Self {
            bind: env::var("SMX_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string()),
            port: env::var("SMX_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            mode,
            default_shell: env::var("SMX_SHELL")
                .or_else(|_| env::var("SHELL"))
                .unwrap_or_else(|_| FALLBACK_SHELL.to_string()),
            helper_bin: env::var("SMX_HELPER").unwrap_or_else(|_| DEFAULT_HELPER_BIN.to_string()),
            helper_cols: env::var("SMX_HELPER_COLS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_HELPER_COLS),
            helper_rows: env::var("SMX_HELPER_ROWS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_HELPER_ROWS),
            flush_interval: Duration::from_millis(
                env::var("SMX_FLUSH_INTERVAL_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_FLUSH_INTERVAL_MS),
            ),
            view_timeout: Duration::from_millis(
                env::var("SMX_VIEW_TIMEOUT_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_VIEW_TIMEOUT_MS),
            ),
            max_sessions: env::var("SMX_MAX_SESSIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_SESSIONS),
        }
    }

    /// The address handed to the TCP listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn with_mode(mut self, mode: SessionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_default_shell(mut self, shell: impl Into<String>) -> Self {
        self.default_shell = shell.into();
        self
    }

    pub fn with_helper_bin(mut self, helper: impl Into<String>) -> Self {
        self.helper_bin = helper.into();
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_view_timeout(mut self, timeout: Duration) -> Self {
        self.view_timeout = timeout;
        self
    }

    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }
}
