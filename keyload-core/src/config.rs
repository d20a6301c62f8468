use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// JSON document holding configured keys.  Defaults to
    /// `$XDG_DATA_HOME/keyload/keys.json`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Socket served by `keyloadd`.  Defaults to
    /// `$XDG_RUNTIME_DIR/keyload/agent.sock`.
    #[serde(default)]
    pub socket: Option<PathBuf>,
    /// Make the CLI talk to the agent named by `$SSH_AUTH_SOCK` instead.
    #[serde(default)]
    pub use_ssh_auth_sock: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive, overridden by `RUST_LOG`.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Config {
    /// Resolved path of the key store file.
    pub fn store_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| data_dir().join("keyload").join("keys.json"))
    }

    /// Resolved path of the agent socket the CLI should talk to.
    ///
    /// Returns `None` only when `use_ssh_auth_sock` is set and
    /// `SSH_AUTH_SOCK` is not.
    pub fn agent_socket(&self) -> Option<PathBuf> {
        if self.agent.use_ssh_auth_sock {
            return std::env::var_os("SSH_AUTH_SOCK").map(PathBuf::from);
        }
        Some(self.daemon_socket())
    }

    /// Socket path `keyloadd` binds.
    pub fn daemon_socket(&self) -> PathBuf {
        self.agent
            .socket
            .clone()
            .unwrap_or_else(|| runtime_dir().join("keyload").join("agent.sock"))
    }
}

pub fn default_config_path() -> PathBuf {
    xdg_dir("XDG_CONFIG_HOME", ".config")
        .join("keyload")
        .join("config.toml")
}

/// Read `path`, falling back to defaults when it does not exist.
pub fn load(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let config: Config =
        toml::from_str(&content).with_context(|| format!("parse config {}", path.display()))?;
    Ok(config)
}

/// Warn when the config file at `path` is readable by group or others.
///
/// Kept apart from [`load`] so callers can run it once logging is set up
/// from the loaded config.
pub fn check_permissions(path: &Path) {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        return;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        match std::fs::metadata(path) {
            Ok(meta) => {
                let mode = meta.mode();
                if mode & 0o077 != 0 {
                    tracing::warn!(
                        path = %path.display(),
                        mode = format!("{:o}", mode & 0o777),
                        "config file is readable by group or others, recommend: chmod 600 {}",
                        path.display()
                    );
                }
            }
            Err(e) => {
                tracing::warn!("could not check config file permissions: {e}");
            }
        }
    }
}

fn data_dir() -> PathBuf {
    xdg_dir("XDG_DATA_HOME", ".local/share")
}

fn runtime_dir() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
}

fn xdg_dir(var: &str, home_fallback: &str) -> PathBuf {
    std::env::var_os(var)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(home_fallback)))
        .unwrap_or_else(|| PathBuf::from("."))
}
