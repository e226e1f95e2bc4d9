use crate::proxy::ProxySettings;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} io error: {1}")]
    Io(String, std::io::Error),
    #[error("{0} deserialization error: {1}")]
    Serde(String, serde_yaml::Error),
    #[error("Env variable error: {0}")]
    Env(#[from] std::env::VarError),
    #[error("Internal error: {0}")]
    Internal(&'static str),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    /// Use the local resolver proxy for DoH even where the OS has a
    /// native managed-profile mechanism.
    #[serde(default)]
    pub prefer_proxy: bool,
    #[serde(default)]
    pub proxy: RawProxyConfig,
    #[serde(default)]
    pub profile: RawProfileConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawProxyConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: Ipv4Addr,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_proxy_binary")]
    pub binary_path: PathBuf,
    #[serde(default = "default_proxy_template")]
    pub template_path: PathBuf,
    #[serde(default = "default_startup_timeout_sec")]
    pub startup_timeout_sec: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawProfileConfig {
    #[serde(default = "default_identifier_prefix")]
    pub identifier_prefix: String,
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/var/run/dnsctl.sock")
}

fn default_listen_addr() -> Ipv4Addr {
    Ipv4Addr::LOCALHOST
}

// networksetup/resolvectl hand the backend a bare IP, so the proxy must
// answer on the standard DNS port; the engine runs as root and may bind
// it.
fn default_listen_port() -> u16 {
    53
}

fn default_proxy_binary() -> PathBuf {
    PathBuf::from("/usr/local/libexec/dnsctl/dnscrypt-proxy")
}

fn default_proxy_template() -> PathBuf {
    PathBuf::from("/usr/local/libexec/dnsctl/dnscrypt-proxy.toml")
}

fn default_startup_timeout_sec() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_grace_period_ms() -> u64 {
    2000
}

fn default_identifier_prefix() -> String {
    "org.dnsctl.profile".to_string()
}

impl Default for RawConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty config must parse")
    }
}

impl Default for RawProxyConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty proxy config must parse")
    }
}

impl Default for RawProfileConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty profile config must parse")
    }
}

impl RawConfig {
    pub fn proxy_settings(&self) -> ProxySettings {
        ProxySettings {
            listen_addr: self.proxy.listen_addr,
            listen_port: self.proxy.listen_port,
            binary_path: self.proxy.binary_path.clone(),
            template_path: self.proxy.template_path.clone(),
            startup_timeout: Duration::from_secs(self.proxy.startup_timeout_sec),
            poll_interval: Duration::from_millis(self.proxy.poll_interval_ms),
            grace_period: Duration::from_millis(self.proxy.grace_period_ms),
        }
    }
}

/// Resolve the configuration file path: explicit flag, or
/// `$HOME/.config/dnsctl/config.yml`.
pub fn parse_config_path(explicit: &Option<PathBuf>) -> Result<PathBuf, ConfigError> {
    match explicit {
        Some(p) => Ok(p.clone()),
        None => {
            let home = std::env::var("HOME")?;
            Ok(PathBuf::from(home).join(".config/dnsctl/config.yml"))
        }
    }
}

/// Load the configuration, falling back to defaults when the file does
/// not exist.
pub fn load_config(path: &Path) -> Result<RawConfig, ConfigError> {
    if !path.exists() {
        return Ok(serde_yaml::from_str("{}")
            .map_err(|e| ConfigError::Serde(path.to_string_lossy().to_string(), e))?);
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(path.to_string_lossy().to_string(), e))?;
    serde_yaml::from_str(&content)
        .map_err(|e| ConfigError::Serde(path.to_string_lossy().to_string(), e))
}
