use crate::error::{DocklogError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Maximum number of containers a single session may follow
pub const MAX_SOURCES: usize = 8;

/// Daemon address used when neither the CLI, the config file nor `DOCKER_HOST` set one
pub const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";

/// Environment variable selecting the daemon address
pub const DOCKER_HOST_ENV: &str = "DOCKER_HOST";

/// Session configuration shared by the multiplexer, the docker adapter and the sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Number of historical lines to fetch per container
    #[serde(default = "default_tail")]
    pub tail: usize,

    /// Keep streaming new lines after the initial tail
    #[serde(default = "default_follow")]
    pub follow: bool,

    /// Prefix every rendered line with its timestamp
    #[serde(default)]
    pub timestamps: bool,

    /// Daemon address (overrides `DOCKER_HOST`)
    #[serde(default)]
    pub host: Option<String>,

    /// Path or name of the docker client binary
    #[serde(default = "default_docker_binary")]
    pub docker_binary: PathBuf,

    /// Capacity of the fan-in and output queues
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// How long a source may hold a partial line before it is reported as slow (in milliseconds)
    #[serde(default = "default_partial_line_timeout")]
    pub partial_line_timeout_ms: u64,
}

// Default value functions for serde
fn default_tail() -> usize {
    10
}

fn default_follow() -> bool {
    true
}

fn default_docker_binary() -> PathBuf {
    PathBuf::from("docker")
}

fn default_channel_capacity() -> usize {
    256
}

fn default_partial_line_timeout() -> u64 {
    5000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tail: default_tail(),
            follow: default_follow(),
            timestamps: false,
            host: None,
            docker_binary: default_docker_binary(),
            channel_capacity: default_channel_capacity(),
            partial_line_timeout_ms: default_partial_line_timeout(),
        }
    }
}

impl SessionConfig {
    /// Load session defaults from a file (supports TOML and JSON)
    pub fn from_file(path: &Path) -> Result<SessionConfig> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            DocklogError::InvalidConfig(format!("Failed to read config file: {}", e))
        })?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        let mut config = match extension {
            "toml" => Self::parse_toml(&contents)?,
            "json" => Self::parse_json(&contents)?,
            _ => {
                return Err(DocklogError::InvalidConfig(format!(
                    "Unsupported file format: {}. Use .toml or .json",
                    extension
                )))
            }
        };

        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    fn parse_toml(contents: &str) -> Result<SessionConfig> {
        toml::from_str(contents)
            .map_err(|e| DocklogError::InvalidConfig(format!("Failed to parse TOML: {}", e)))
    }

    fn parse_json(contents: &str) -> Result<SessionConfig> {
        serde_json::from_str(contents)
            .map_err(|e| DocklogError::InvalidConfig(format!("Failed to parse JSON: {}", e)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(DocklogError::ConfigurationError(
                "channel_capacity must be at least 1".to_string(),
            ));
        }

        if self.partial_line_timeout_ms == 0 {
            return Err(DocklogError::ConfigurationError(
                "partial_line_timeout_ms must be at least 1".to_string(),
            ));
        }

        if self.docker_binary.as_os_str().is_empty() {
            return Err(DocklogError::ConfigurationError(
                "docker_binary must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Check the requested container list against the session cap
    pub fn validate_sources(identities: &[String]) -> Result<()> {
        if identities.is_empty() {
            return Err(DocklogError::ConfigurationError(
                "at least one container must be given".to_string(),
            ));
        }

        if identities.len() > MAX_SOURCES {
            return Err(DocklogError::ConfigurationError(format!(
                "too many container arguments: {}. Max {}",
                identities.len(),
                MAX_SOURCES
            )));
        }

        if let Some(blank) = identities.iter().position(|id| id.trim().is_empty()) {
            return Err(DocklogError::ConfigurationError(format!(
                "container argument {} is empty",
                blank + 1
            )));
        }

        Ok(())
    }

    /// Resolve the daemon address: explicit host, then `DOCKER_HOST`, then the local socket
    pub fn daemon_host(&self) -> String {
        self.host
            .clone()
            .or_else(|| std::env::var(DOCKER_HOST_ENV).ok())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| DEFAULT_DOCKER_HOST.to_string())
    }

    /// Partial line timeout as Duration
    pub fn partial_line_timeout(&self) -> Duration {
        Duration::from_millis(self.partial_line_timeout_ms)
    }

    fn expand_env_vars(&mut self) {
        if let Some(ref host) = self.host {
            self.host = Some(Self::expand_env_in_string(host));
        }

        let binary = self.docker_binary.to_string_lossy();
        self.docker_binary = PathBuf::from(Self::expand_env_in_string(&binary));
    }

    /// Expand `$VAR` and `${VAR}` references
    fn expand_env_in_string(s: &str) -> String {
        let mut result = s.to_string();

        for (key, value) in std::env::vars() {
            result = result.replace(&format!("${{{}}}", key), &value);
            result = result.replace(&format!("${}", key), &value);
        }

        result
    }
}
