use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";
pub const DEFAULT_LISTEN_ADDR: &str = ":8081";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteKind {
    Tcp,
    Udp,
    Http,
    Https,
}

impl RouteKind {
    /// Routes that own a local listener socket.
    pub fn is_network(self) -> bool {
        matches!(self, RouteKind::Tcp | RouteKind::Udp)
    }

    /// Routes demultiplexed by Host header on the admin listener.
    pub fn is_http(self) -> bool {
        matches!(self, RouteKind::Http | RouteKind::Https)
    }

    /// Dial protocol string handed to the overlay client.
    pub fn protocol(self) -> &'static str {
        match self {
            RouteKind::Udp => "udp",
            _ => "tcp",
        }
    }
}

impl fmt::Display for RouteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RouteKind::Tcp => "tcp",
            RouteKind::Udp => "udp",
            RouteKind::Http => "http",
            RouteKind::Https => "https",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RouteKind,
    #[serde(default, skip_serializing_if = "port_is_unset")]
    pub port: u16,
    #[serde(default)]
    pub machine: Machine,
}

fn default_enabled() -> bool {
    true
}

fn port_is_unset(port: &u16) -> bool {
    *port == 0
}

impl RouteConfig {
    /// Route-local invariants; cross-route uniqueness lives in the registry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if self.kind.is_network() && self.port == 0 {
            return Err(ConfigError::MissingPort {
                name: self.name.clone(),
            });
        }
        if !self.kind.is_network() && self.port != 0 {
            return Err(ConfigError::UnexpectedPort {
                name: self.name.clone(),
            });
        }
        if self.machine.address.trim().is_empty() || self.machine.port == 0 {
            return Err(ConfigError::MissingMachine {
                name: self.name.clone(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("route name must not be empty")]
    EmptyName,
    #[error("route {name:?}: tcp/udp routes require a listen port")]
    MissingPort { name: String },
    #[error("route {name:?}: http routes must not set a listen port")]
    UnexpectedPort { name: String },
    #[error("route {name:?}: machine address and port are required")]
    MissingMachine { name: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailscaleConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub hostname: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubernetesConfig {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub ingress_name: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub ingress_class: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tailscale: TailscaleConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes: Option<KubernetesConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tailscale: TailscaleConfig::default(),
            dashboard: DashboardConfig::default(),
            kubernetes: None,
            logging: LoggingConfig::default(),
            listen_addr: default_listen_addr(),
            routes: Vec::new(),
        }
    }
}

/// Where the config file lives and how it is (re)written.
///
/// Every registry mutation rewrites the whole file; the registry's serialized
/// writer discipline makes the whole-file replace safe.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> anyhow::Result<Config> {
        let data = fs::read_to_string(&self.path)
            .with_context(|| format!("config: read {}", self.path.display()))?;
        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("config: parse {}", self.path.display()))?;
        Ok(cfg)
    }

    pub fn save(&self, cfg: &Config) -> anyhow::Result<()> {
        let data = serde_yaml::to_string(cfg).context("config: serialize")?;
        fs::write(&self.path, data)
            .with_context(|| format!("config: write {}", self.path.display()))?;
        Ok(())
    }
}

/// Flag value wins (clap already folds CONFIG_PATH into it); otherwise the
/// well-known default next to the process.
pub fn resolve_config_path(flag: Option<PathBuf>) -> PathBuf {
    match flag {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => PathBuf::from(DEFAULT_CONFIG_PATH),
    }
}
