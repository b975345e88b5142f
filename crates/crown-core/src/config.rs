//! Configuration parsing for the crown daemon.
//!
//! `key=value` lines from `.crown/config` or an explicit `--config` file.
//! Precedence: CLI flags > `--config` file > `.crown/config` > defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
}

/// Evaluation and landing configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Judging service
    /// Base URL of the centralized judging service.
    pub judge_base_url: String,
    pub judge_path: String,
    pub summarize_path: String,
    /// Header used to forward the caller's auth context.
    pub auth_header_name: String,
    pub judge_timeout_sec: u64,

    // Remote execution
    pub diff_timeout_sec: u64,
    pub git_timeout_sec: u64,
    pub pr_timeout_sec: u64,
    /// Working directory inside workers; `None` uses each worker's own root.
    pub worker_workspace_dir: Option<String>,
    pub git_remote: String,

    // Stalled evaluations
    pub stall_timeout_sec: u64,
    pub stall_check_interval_sec: u64,

    /// Value of `auto_pr_enabled` for teams without stored settings.
    pub auto_pr_default: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            judge_base_url: "http://127.0.0.1:9779".to_string(),
            judge_path: "/api/crown/evaluate".to_string(),
            summarize_path: "/api/crown/summarize".to_string(),
            auth_header_name: "authorization".to_string(),
            judge_timeout_sec: 120,
            diff_timeout_sec: 30,
            git_timeout_sec: 60,
            pr_timeout_sec: 60,
            worker_workspace_dir: None,
            git_remote: "origin".to_string(),
            stall_timeout_sec: 900,
            stall_check_interval_sec: 60,
            auto_pr_default: false,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load `.crown/config` under `workspace_root` if present, else defaults.
    pub fn discover(workspace_root: &Path) -> Result<Self, ConfigError> {
        let path = Self::workspace_config_path(workspace_root);
        if path.exists() {
            Self::from_file(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn workspace_config_path(workspace_root: &Path) -> PathBuf {
        workspace_root.join(".crown").join("config")
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "judge_base_url" => self.judge_base_url = value.trim_end_matches('/').to_string(),
            "judge_path" => self.judge_path = value.to_string(),
            "summarize_path" => self.summarize_path = value.to_string(),
            "auth_header_name" => self.auth_header_name = value.to_string(),
            "judge_timeout_sec" => self.judge_timeout_sec = Self::parse_int(key, value)?,
            "diff_timeout_sec" => self.diff_timeout_sec = Self::parse_int(key, value)?,
            "git_timeout_sec" => self.git_timeout_sec = Self::parse_int(key, value)?,
            "pr_timeout_sec" => self.pr_timeout_sec = Self::parse_int(key, value)?,
            "worker_workspace_dir" => {
                self.worker_workspace_dir = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "git_remote" => self.git_remote = value.to_string(),
            "stall_timeout_sec" => self.stall_timeout_sec = Self::parse_int(key, value)?,
            "stall_check_interval_sec" => {
                self.stall_check_interval_sec = Self::parse_int(key, value)?;
            }
            "auto_pr_default" => self.auto_pr_default = Self::parse_bool(key, value)?,
            _ => {
                // Unknown keys warn but don't fail.
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    fn parse_int(key: &str, value: &str) -> Result<u64, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    pub fn judge_timeout(&self) -> Duration {
        Duration::from_secs(self.judge_timeout_sec)
    }

    pub fn diff_timeout(&self) -> Duration {
        Duration::from_secs(self.diff_timeout_sec)
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_sec)
    }

    pub fn pr_timeout(&self) -> Duration {
        Duration::from_secs(self.pr_timeout_sec)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_sec)
    }

    pub fn stall_check_interval(&self) -> Duration {
        Duration::from_secs(self.stall_check_interval_sec.max(1))
    }
}
