//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use dlan_core::{Credential, SessionConfig, DEFAULT_CORE_PORT};

/// Remote controller configuration. File: ~/.config/dlan/remote.toml or /etc/dlan/remote.toml.
/// Env overrides: DLAN_CORE_ADDRESS, DLAN_CORE_PORT, DLAN_CORE_PASSWORD, DLAN_CORE_EXECUTABLE,
/// DLAN_RETRY_DELAY_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Core host name or address (default localhost).
    #[serde(default = "default_core_address")]
    pub core_address: String,
    /// Core GUI port (default 59485).
    #[serde(default = "default_core_port")]
    pub core_port: u16,
    /// Password for remote cores. Local cores need none.
    #[serde(default)]
    pub password: Option<String>,
    /// Core executable started when connecting to a local core that is not running.
    #[serde(default)]
    pub core_executable: Option<PathBuf>,
    /// Delay before resolving again after every address failed.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Timeout of a single TCP connection attempt.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_core_address() -> String {
    "localhost".to_string()
}
fn default_core_port() -> u16 {
    DEFAULT_CORE_PORT
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_connect_timeout_ms() -> u64 {
    5000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            core_address: default_core_address(),
            core_port: default_core_port(),
            password: None,
            core_executable: None,
            retry_delay_ms: default_retry_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Config {
    pub fn credential(&self) -> Credential {
        match &self.password {
            Some(p) if !p.is_empty() => Credential::from_password(p),
            _ => Credential::none(),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Apply environment overrides. Unparsable values are ignored.
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(s) = var("DLAN_CORE_ADDRESS") {
            self.core_address = s;
        }
        if let Some(s) = var("DLAN_CORE_PORT") {
            if let Ok(p) = s.parse::<u16>() {
                self.core_port = p;
            }
        }
        if let Some(s) = var("DLAN_CORE_PASSWORD") {
            self.password = Some(s);
        }
        if let Some(s) = var("DLAN_CORE_EXECUTABLE") {
            self.core_executable = Some(PathBuf::from(s));
        }
        if let Some(s) = var("DLAN_RETRY_DELAY_MS") {
            if let Ok(ms) = s.parse::<u64>() {
                self.retry_delay_ms = ms;
            }
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|k| std::env::var(k).ok());
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/dlan/remote.toml"));
    }
    out.push(PathBuf::from("/etc/dlan/remote.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), error = %e, "invalid config file"),
                },
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "unreadable config file"),
            }
            break;
        }
    }
    None
}
