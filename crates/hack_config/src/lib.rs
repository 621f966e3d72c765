//! Process-wide settings, read once from the environment.
//!
//! | variable                | default                 |
//! |-------------------------|-------------------------|
//! | `HACK_COMPILE_URL`      | `http://localhost:5000` |
//! | `HACK_GATE_ADDR`        | `0.0.0.0:3000`          |
//! | `HACK_STEPS_PER_TICK`   | `1000`                  |
//! | `HACK_MAX_SESSIONS`     | `64`                    |
//! | `HACK_SESSION_TTL_SECS` | `3600`                  |

use lazy_static::lazy_static;
use std::str::FromStr;

pub const DEFAULT_COMPILE_URL: &str = "http://localhost:5000";
pub const DEFAULT_GATE_ADDR: &str = "0.0.0.0:3000";
pub const DEFAULT_STEPS_PER_TICK: u64 = 1000;
pub const DEFAULT_MAX_SESSIONS: usize = 64;
pub const DEFAULT_SESSION_TTL_SECS: u64 = 3600;

lazy_static! {
    /// Base URL of the compile service (`POST {url}/compile`).
    pub static ref COMPILE_URL: String = env_string("HACK_COMPILE_URL", DEFAULT_COMPILE_URL);
    pub static ref GATE_ADDR: String = env_string("HACK_GATE_ADDR", DEFAULT_GATE_ADDR);
    /// Instructions executed per host tick while running.
    pub static ref STEPS_PER_TICK: u64 = env_parse("HACK_STEPS_PER_TICK", DEFAULT_STEPS_PER_TICK);
    pub static ref MAX_SESSIONS: usize = env_parse("HACK_MAX_SESSIONS", DEFAULT_MAX_SESSIONS);
    pub static ref SESSION_TTL_SECS: u64 = env_parse("HACK_SESSION_TTL_SECS", DEFAULT_SESSION_TTL_SECS);
}

/// Non-empty value of `key`, or `default`.
pub fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Parsed value of `key`; unset or unparsable falls back to `default`.
pub fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
