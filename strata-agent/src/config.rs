//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use strata_core::Endpoint;

/// Agent configuration. File: ~/.config/strata/agent.toml or /etc/strata/agent.toml (or `--config`).
/// Env overrides: STRATA_LISTEN_PORT, STRATA_DOMAIN_HOST, STRATA_DOMAIN_PORT, STRATA_DATA_SEND_INTERVAL_MS,
/// STRATA_CHECK_IN_INTERVAL_MS, STRATA_SILENCE_TIMEOUT_MS, STRATA_PING_INTERVAL_MS, STRATA_LOCAL_ADDRESS.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// UDP port this agent listens on (default 55441).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Domain authority hostname (default 127.0.0.1).
    #[serde(default = "default_domain_host")]
    pub domain_host: String,
    /// Domain authority UDP port (default 40102).
    #[serde(default = "default_domain_port")]
    pub domain_port: u16,
    /// Bot tick / avatar send interval (default 15 ms).
    #[serde(default = "default_data_send_interval_ms")]
    pub data_send_interval_ms: u64,
    #[serde(default = "default_check_in_interval_ms")]
    pub check_in_interval_ms: u64,
    /// Nodes silent for longer than this are dropped (default 2000 ms).
    #[serde(default = "default_silence_timeout_ms")]
    pub silence_timeout_ms: u64,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// Local endpoint to report at check-in, as `a.b.c.d:port`. Unset: scan interfaces.
    #[serde(default)]
    pub local_address: Option<Endpoint>,
}

fn default_listen_port() -> u16 {
    55441
}
fn default_domain_host() -> String {
    "127.0.0.1".to_string()
}
fn default_domain_port() -> u16 {
    40102
}
fn default_data_send_interval_ms() -> u64 {
    15
}
fn default_check_in_interval_ms() -> u64 {
    1000
}
fn default_silence_timeout_ms() -> u64 {
    2000
}
fn default_ping_interval_ms() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            domain_host: default_domain_host(),
            domain_port: default_domain_port(),
            data_send_interval_ms: default_data_send_interval_ms(),
            check_in_interval_ms: default_check_in_interval_ms(),
            silence_timeout_ms: default_silence_timeout_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            local_address: None,
        }
    }
}

impl Config {
    pub fn data_send_interval(&self) -> Duration {
        Duration::from_millis(self.data_send_interval_ms)
    }

    pub fn check_in_interval(&self) -> Duration {
        Duration::from_millis(self.check_in_interval_ms)
    }

    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
}

/// Load config: default, then config file (explicit path, else the first one present), then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let base = match explicit {
        Some(path) => read_file(path)?,
        None => load_file().unwrap_or_default(),
    };
    Ok(apply_env(base, |key| std::env::var(key).ok()))
}

/// Apply `STRATA_*` overrides looked up through `var`. Unparsable values are ignored.
pub fn apply_env(mut c: Config, var: impl Fn(&str) -> Option<String>) -> Config {
    fn parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
        var(key).and_then(|s| s.trim().parse().ok())
    }
    if let Some(p) = parsed(&var, "STRATA_LISTEN_PORT") {
        c.listen_port = p;
    }
    if let Some(h) = var("STRATA_DOMAIN_HOST").filter(|h| !h.trim().is_empty()) {
        c.domain_host = h.trim().to_string();
    }
    if let Some(p) = parsed(&var, "STRATA_DOMAIN_PORT") {
        c.domain_port = p;
    }
    if let Some(ms) = parsed(&var, "STRATA_DATA_SEND_INTERVAL_MS") {
        c.data_send_interval_ms = ms;
    }
    if let Some(ms) = parsed(&var, "STRATA_CHECK_IN_INTERVAL_MS") {
        c.check_in_interval_ms = ms;
    }
    if let Some(ms) = parsed(&var, "STRATA_SILENCE_TIMEOUT_MS") {
        c.silence_timeout_ms = ms;
    }
    if let Some(ms) = parsed(&var, "STRATA_PING_INTERVAL_MS") {
        c.ping_interval_ms = ms;
    }
    if let Some(e) = parsed(&var, "STRATA_LOCAL_ADDRESS") {
        c.local_address = Some(e);
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/strata/agent.toml"));
    }
    out.push(PathBuf::from("/etc/strata/agent.toml"));
    out
}

fn read_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match read_file(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), "ignoring config file");
            None
        }
    }
}
