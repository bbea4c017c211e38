use crate::terminal::output::{DEFAULT_BATCH_CHARS, DEFAULT_SCROLLBACK_CHARS, DEFAULT_THROTTLE};
use crate::terminal::registry::{clamp_max_sessions, DEFAULT_MAX_SESSIONS};
use crate::terminal::resize::{DEFAULT_MIN_INTERVAL, DEFAULT_SETTLE};
use crate::terminal::termination::DEFAULT_KILL_GRACE;
use crate::terminal::{OutputSettings, ResizeSettings, SessionSettings};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_MAX_INPUT_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub max_sessions: usize,
    pub scrollback_chars: usize,
    pub output_throttle: Duration,
    pub output_batch_chars: usize,
    pub resize_min_interval: Duration,
    pub resize_settle: Duration,
    pub kill_grace: Duration,
    pub max_input_bytes: usize,
    pub terminal_enabled: bool,
    pub terminal_password: Option<String>,
    pub api_key: Option<String>,
    /// Working directories must live under one of these; empty allows any.
    pub allowed_roots: Vec<PathBuf>,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env::var("TIDEPOOL_HOST").unwrap_or(defaults.host),
            port: parsed("TIDEPOOL_PORT").unwrap_or(defaults.port),
            max_sessions: clamp_max_sessions(
                parsed("TIDEPOOL_MAX_SESSIONS").unwrap_or(defaults.max_sessions),
            ),
            scrollback_chars: parsed("TIDEPOOL_SCROLLBACK_CHARS")
                .filter(|chars| *chars > 0)
                .unwrap_or(defaults.scrollback_chars),
            output_throttle: parsed_millis("TIDEPOOL_OUTPUT_THROTTLE_MS")
                .filter(|throttle| !throttle.is_zero())
                .unwrap_or(defaults.output_throttle),
            output_batch_chars: parsed("TIDEPOOL_OUTPUT_BATCH_CHARS")
                .filter(|chars| *chars > 0)
                .unwrap_or(defaults.output_batch_chars),
            resize_min_interval: parsed_millis("TIDEPOOL_RESIZE_MIN_INTERVAL_MS")
                .unwrap_or(defaults.resize_min_interval),
            resize_settle: parsed_millis("TIDEPOOL_RESIZE_SETTLE_MS")
                .unwrap_or(defaults.resize_settle),
            kill_grace: parsed_millis("TIDEPOOL_KILL_GRACE_MS").unwrap_or(defaults.kill_grace),
            max_input_bytes: parsed("TIDEPOOL_MAX_INPUT_BYTES")
                .filter(|bytes| *bytes > 0)
                .unwrap_or(defaults.max_input_bytes),
            terminal_enabled: env::var("TIDEPOOL_TERMINAL_ENABLED")
                .map(|value| truthy(&value))
                .unwrap_or(defaults.terminal_enabled),
            terminal_password: non_empty("TIDEPOOL_TERMINAL_PASSWORD"),
            api_key: non_empty("TIDEPOOL_API_KEY"),
            allowed_roots: env::var_os("TIDEPOOL_ALLOWED_ROOTS")
                .map(|roots| env::split_paths(&roots).collect())
                .unwrap_or_default(),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            output: OutputSettings {
                scrollback_limit: self.scrollback_chars,
                throttle: self.output_throttle,
                batch_size: self.output_batch_chars,
            },
            resize: ResizeSettings {
                min_interval: self.resize_min_interval,
                settle: self.resize_settle,
            },
        }
    }

    pub fn password_required(&self) -> bool {
        self.terminal_password.is_some()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3008,
            max_sessions: DEFAULT_MAX_SESSIONS,
            scrollback_chars: DEFAULT_SCROLLBACK_CHARS,
            output_throttle: DEFAULT_THROTTLE,
            output_batch_chars: DEFAULT_BATCH_CHARS,
            resize_min_interval: DEFAULT_MIN_INTERVAL,
            resize_settle: DEFAULT_SETTLE,
            kill_grace: DEFAULT_KILL_GRACE,
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
            terminal_enabled: true,
            terminal_password: None,
            api_key: None,
            allowed_roots: Vec::new(),
        }
    }
}

fn parsed<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

fn parsed_millis(key: &str) -> Option<Duration> {
    parsed::<u64>(key).map(Duration::from_millis)
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}

/// `1`/`true`/`yes`/`on` are true; anything else is false.
fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
