//! Configuration loading and defaults.
//!
//! Resolved in order of precedence (highest wins), mirroring the teacher's
//! `Config::load` chain in spirit: environment variables, then the TOML file,
//! then compiled defaults.
//!
//! ```toml
//! [ports]
//! daemon_start = 19999
//! daemon_end = 19999
//! session_start = 20000
//! session_end = 21000
//! max_attempts = 50
//!
//! [paths]
//! data_dir = "/var/lib/silc"
//! log_dir = "/var/lib/silc/logs"
//!
//! [tokens]
//! length = 32
//! require_token = true
//!
//! [sessions]
//! default_timeout = 30
//! max_buffer_bytes = 65536
//! idle_timeout = 1800
//! gc_interval = 60
//!
//! [logging]
//! max_log_lines = 10000
//! log_level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ports: PortsConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub tokens: TokensConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Pass-through only: silc never terminates TLS itself (see the crate's
/// non-goals). A reverse proxy in front of the management/session ports is
/// expected to handle termination; these fields only let that proxy's cert
/// paths be documented in one place.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsConfig {
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortsConfig {
    #[serde(default = "default_daemon_port")]
    pub daemon_start: u16,
    #[serde(default = "default_daemon_port")]
    pub daemon_end: u16,
    #[serde(default = "default_session_start")]
    pub session_start: u16,
    #[serde(default = "default_session_end")]
    pub session_end: u16,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokensConfig {
    #[serde(default = "default_token_length")]
    pub length: usize,
    #[serde(default = "default_require_token")]
    pub require_token: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionsConfig {
    #[serde(default = "default_timeout")]
    pub default_timeout: u64,
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: usize,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    #[serde(default = "default_gc_interval")]
    pub gc_interval: u64,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_max_log_lines")]
    pub max_log_lines: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_daemon_port() -> u16 {
    19999
}
fn default_session_start() -> u16 {
    20000
}
fn default_session_end() -> u16 {
    21000
}
fn default_max_attempts() -> u32 {
    50
}
fn default_data_dir() -> String {
    "/var/lib/silc".to_string()
}
fn default_log_dir() -> String {
    "/var/lib/silc/logs".to_string()
}
fn default_token_length() -> usize {
    32
}
fn default_require_token() -> bool {
    true
}
fn default_timeout() -> u64 {
    30
}
fn default_max_buffer_bytes() -> usize {
    64 * 1024
}
fn default_idle_timeout() -> u64 {
    1800
}
fn default_gc_interval() -> u64 {
    60
}
fn default_max_sessions() -> usize {
    100
}
fn default_max_log_lines() -> usize {
    10_000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            daemon_start: default_daemon_port(),
            daemon_end: default_daemon_port(),
            session_start: default_session_start(),
            session_end: default_session_end(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_dir: default_log_dir(),
        }
    }
}

impl Default for TokensConfig {
    fn default() -> Self {
        Self {
            length: default_token_length(),
            require_token: default_require_token(),
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            default_timeout: default_timeout(),
            max_buffer_bytes: default_max_buffer_bytes(),
            idle_timeout: default_idle_timeout(),
            gc_interval: default_gc_interval(),
            max_sessions: default_max_sessions(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            max_log_lines: default_max_log_lines(),
            log_level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ports: PortsConfig::default(),
            paths: PathsConfig::default(),
            tls: TlsConfig::default(),
            tokens: TokensConfig::default(),
            sessions: SessionsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure, matching the
    /// teacher's fail-fast startup behavior). Otherwise looks for
    /// `silc.toml` in the current directory, falling back to compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("failed to read config file {p}: {e}"));
            toml::from_str(&content).unwrap_or_else(|e| panic!("failed to parse config file {p}: {e}"))
        } else if Path::new("silc.toml").exists() {
            let content = std::fs::read_to_string("silc.toml").expect("failed to read silc.toml");
            toml::from_str(&content).expect("failed to parse silc.toml")
        } else {
            Config::default()
        };

        if let Ok(v) = std::env::var("SILC_DAEMON_PORT") {
            if let Ok(p) = v.parse() {
                config.ports.daemon_start = p;
                config.ports.daemon_end = p;
            }
        }
        if let Ok(v) = std::env::var("SILC_DATA_DIR") {
            config.paths.data_dir = v;
        }
        if let Ok(v) = std::env::var("SILC_LOG_DIR") {
            config.paths.log_dir = v;
        }
        if let Ok(v) = std::env::var("SILC_REQUIRE_TOKEN") {
            config.tokens.require_token = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("SILC_IDLE_TIMEOUT") {
            if let Ok(secs) = v.parse() {
                config.sessions.idle_timeout = secs;
            }
        }
        if let Ok(v) = std::env::var("SILC_LOG_LEVEL") {
            config.logging.log_level = v;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        let config = Config::default();
        assert_eq!(config.ports.daemon_start, 19999);
        assert_eq!(config.sessions.idle_timeout, 1800);
        assert_eq!(config.sessions.max_buffer_bytes, 64 * 1024);
    }
}
