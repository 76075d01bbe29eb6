//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/shkshare/config.toml or /etc/shkshare/config.toml.
/// Env overrides: SHKSHARE_DISPLAY_NAME, SHKSHARE_NICKNAME, SHKSHARE_PROFILE_URL,
/// SHKSHARE_DISCOVERY_PORT, SHKSHARE_TRANSPORT_PORT, SHKSHARE_LOG.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name shown to nearby devices (default: host name).
    #[serde(default = "default_display_name")]
    pub display_name: String,
    /// Nickname sent in our profile.
    #[serde(default = "default_nickname")]
    pub nickname: String,
    #[serde(default)]
    pub profile_url: Option<String>,
    /// Badge names listed in our profile.
    #[serde(default)]
    pub badges: Vec<String>,
    #[serde(default = "default_service_type")]
    pub service_type: String,
    /// Discovery UDP port (default 45680).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Channel TCP port (default 45681).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    #[serde(default = "default_burst_secs")]
    pub burst_secs: u64,
    #[serde(default = "default_invite_timeout_secs")]
    pub invite_timeout_secs: u64,
    /// Register every new peer under its own nickname instead of waiting for a user.
    #[serde(default = "default_auto_register")]
    pub auto_register: bool,
    /// Where the user uuid, friends and album live (default ~/.local/share/shkshare).
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Default log filter; RUST_LOG wins when set.
    #[serde(default = "default_log")]
    pub log: String,
}

fn default_display_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "shkshare-linux".to_string())
}
fn default_nickname() -> String {
    std::env::var("USER").unwrap_or_else(|_| "shkshare".to_string())
}
fn default_service_type() -> String {
    shk_core::protocol::DEFAULT_SERVICE_TYPE.to_string()
}
fn default_discovery_port() -> u16 {
    45680
}
fn default_transport_port() -> u16 {
    45681
}
fn default_burst_secs() -> u64 {
    shk_core::config::DEFAULT_BURST_DURATION.as_secs()
}
fn default_invite_timeout_secs() -> u64 {
    shk_core::config::DEFAULT_INVITE_TIMEOUT.as_secs()
}
fn default_auto_register() -> bool {
    true
}
fn default_log() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            display_name: default_display_name(),
            nickname: default_nickname(),
            profile_url: None,
            badges: Vec::new(),
            service_type: default_service_type(),
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            burst_secs: default_burst_secs(),
            invite_timeout_secs: default_invite_timeout_secs(),
            auto_register: default_auto_register(),
            data_dir: None,
            log: default_log(),
        }
    }
}

impl Config {
    /// Tunables for the session manager.
    pub fn core(&self) -> shk_core::Config {
        shk_core::Config {
            service_type: self.service_type.clone(),
            invite_timeout: Duration::from_secs(self.invite_timeout_secs),
            burst_duration: Duration::from_secs(self.burst_secs),
            ..shk_core::Config::default()
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        if let Some(xdg) = std::env::var_os("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("shkshare");
        }
        match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(".local/share/shkshare"),
            None => PathBuf::from("/var/lib/shkshare"),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> anyhow::Result<Config> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(path) => load_file(&path)?,
        None => Config::default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/shkshare/config.toml"));
    }
    out.push(PathBuf::from("/etc/shkshare/config.toml"));
    out
}

fn load_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}

fn apply_env(c: &mut Config, get: impl Fn(&str) -> Option<String>) {
    if let Some(s) = get("SHKSHARE_DISPLAY_NAME") {
        c.display_name = s;
    }
    if let Some(s) = get("SHKSHARE_NICKNAME") {
        c.nickname = s;
    }
    if let Some(s) = get("SHKSHARE_PROFILE_URL") {
        c.profile_url = Some(s).filter(|s| !s.is_empty());
    }
    if let Some(p) = get("SHKSHARE_DISCOVERY_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.discovery_port = p;
    }
    if let Some(p) = get("SHKSHARE_TRANSPORT_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.transport_port = p;
    }
    if let Some(s) = get("SHKSHARE_LOG") {
        c.log = s;
    }
}
