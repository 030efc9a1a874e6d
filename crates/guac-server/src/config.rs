//! Gateway configuration: TOML file + CLI overrides.

use crate::logging::LogLevel;
use guac_core::settings::{builtin_allow_list, builtin_defaults, deep_merge, AllowList, DefaultSettings};
use guac_core::token::parse_key;
use guac_core::{CipherAlgorithm, ConnectionType, GuacError, GuacResult};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub daemon: DaemonSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub crypt: CryptSection,
    /// `[defaults.<type>]` tables, merged over the built-in defaults.
    #[serde(default)]
    pub defaults: HashMap<String, Map<String, Value>>,
    /// `[allow_unencrypted]` lists, replacing the built-in ones per type.
    #[serde(default)]
    pub allow_unencrypted: HashMap<String, Vec<String>>,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

/// `[daemon]` section: where guacd listens.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonSection {
    #[serde(default = "default_daemon_host")]
    pub host: String,
    #[serde(default = "default_daemon_port")]
    pub port: u16,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            host: default_daemon_host(),
            port: default_daemon_port(),
        }
    }
}

/// `[client]` section: per-session behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_max_inactivity_ms")]
    pub max_inactivity_ms: u64,
    #[serde(default)]
    pub log_level: LogLevel,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            max_inactivity_ms: default_max_inactivity_ms(),
            log_level: LogLevel::default(),
        }
    }
}

/// `[crypt]` section: token cipher.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CryptSection {
    #[serde(default)]
    pub cipher: CipherAlgorithm,
    pub key: Option<String>,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_daemon_host() -> String {
    "127.0.0.1".to_string()
}
fn default_daemon_port() -> u16 {
    4822
}
fn default_max_inactivity_ms() -> u64 {
    10_000
}

/// Address of the guacd daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonTarget {
    pub host: String,
    pub port: u16,
}

impl DaemonTarget {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Values given on the command line; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub daemon_host: Option<String>,
    pub daemon_port: Option<u16>,
    pub max_inactivity_ms: Option<u64>,
    pub log_level: Option<LogLevel>,
}

/// Resolved gateway configuration (file + CLI overrides + built-in tables).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub daemon: DaemonTarget,
    /// Browser-side inactivity threshold; `None` disables the check.
    pub max_inactivity: Option<Duration>,
    pub log_level: LogLevel,
    pub cipher: CipherAlgorithm,
    /// Token key; the gateway refuses to start without one.
    pub key: Option<Vec<u8>>,
    pub defaults: DefaultSettings,
    pub allow_list: AllowList,
}

impl GatewayConfig {
    /// Load config from a TOML file (if it exists), then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> GuacResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| GuacError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::from_file(file_config, overrides)
    }

    /// Resolve a parsed config file plus overrides.
    pub fn from_file(file: ConfigFile, overrides: ConfigOverrides) -> GuacResult<Self> {
        let bind = overrides.bind.unwrap_or(file.server.bind);
        let port = overrides.port.unwrap_or(file.server.port);
        let bind_addr: SocketAddr = format!("{bind}:{port}")
            .parse()
            .map_err(|e| GuacError::Config(format!("invalid bind address {bind}:{port}: {e}")))?;

        let max_inactivity_ms = overrides
            .max_inactivity_ms
            .unwrap_or(file.client.max_inactivity_ms);

        let key = file.crypt.key.as_deref().map(parse_key).transpose()?;

        let mut defaults = builtin_defaults();
        for (name, table) in &file.defaults {
            let connection_type = parse_type(name)?;
            deep_merge(defaults.entry(connection_type).or_default(), table);
        }

        let mut allow_list = builtin_allow_list();
        for (name, keys) in file.allow_unencrypted {
            allow_list.insert(parse_type(&name)?, keys);
        }

        Ok(Self {
            bind_addr,
            daemon: DaemonTarget {
                host: overrides.daemon_host.unwrap_or(file.daemon.host),
                port: overrides.daemon_port.unwrap_or(file.daemon.port),
            },
            max_inactivity: (max_inactivity_ms > 0).then(|| Duration::from_millis(max_inactivity_ms)),
            log_level: overrides.log_level.unwrap_or(file.client.log_level),
            cipher: file.crypt.cipher,
            key,
            defaults,
            allow_list,
        })
    }
}

fn parse_type(name: &str) -> GuacResult<ConnectionType> {
    name.parse().map_err(GuacError::Config)
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
