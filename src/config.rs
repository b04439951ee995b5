use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Panel file manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// JSON file holding the panel's site records
    #[serde(default = "default_sites_file")]
    pub sites_file: PathBuf,

    /// Principals allowed to act on every site
    #[serde(default = "default_super_admins")]
    pub super_admins: Vec<String>,

    /// Header carrying the principal authenticated by the fronting auth layer
    #[serde(default = "default_principal_header")]
    pub principal_header: String,

    /// Maximum size of a single uploaded file (in bytes)
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: u64,

    /// Live log streaming
    #[serde(default)]
    pub logs: LogConfig,
}

/// Settings for the log follower process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Binary that follows a unit's journal
    #[serde(default = "default_follower_binary")]
    pub follower_binary: String,

    /// Run the follower through `sudo -n`
    #[serde(default)]
    pub use_sudo: bool,

    /// Recent lines to replay before following
    #[serde(default = "default_backlog_lines")]
    pub backlog_lines: u32,

    /// Suffix every streamable service identifier must end in
    #[serde(default = "default_service_suffix")]
    pub service_suffix: String,

    /// Time a follower gets to exit after SIGTERM before it is killed
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,

    /// Cap on captured follower stderr
    #[serde(default = "default_stderr_limit_bytes")]
    pub stderr_limit_bytes: usize,
}

fn default_sites_file() -> PathBuf {
    PathBuf::from("sites_data.json")
}

fn default_super_admins() -> Vec<String> {
    vec!["admin".to_string()]
}

fn default_principal_header() -> String {
    "x-panel-user".to_string()
}

fn default_max_upload_size() -> u64 {
    100 * 1024 * 1024 // 100 MB
}

fn default_follower_binary() -> String {
    "journalctl".to_string()
}

fn default_backlog_lines() -> u32 {
    100
}

fn default_service_suffix() -> String {
    ".service".to_string()
}

fn default_kill_grace_ms() -> u64 {
    2000
}

fn default_stderr_limit_bytes() -> usize {
    64 * 1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sites_file: default_sites_file(),
            super_admins: default_super_admins(),
            principal_header: default_principal_header(),
            max_upload_size: default_max_upload_size(),
            logs: LogConfig::default(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            follower_binary: default_follower_binary(),
            use_sudo: false,
            backlog_lines: default_backlog_lines(),
            service_suffix: default_service_suffix(),
            kill_grace_ms: default_kill_grace_ms(),
            stderr_limit_bytes: default_stderr_limit_bytes(),
        }
    }
}

impl Config {
    /// Load config from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl LogConfig {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}
