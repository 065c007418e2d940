//! Configuration file handling

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use super::paths::{config_path, default_working_dir};
use super::Result;

/// Main configuration structure
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Test runner binary settings
    #[serde(default)]
    pub tool: ToolConfig,

    /// Run lifecycle settings
    #[serde(default)]
    pub run: RunConfig,

    /// Abandoned-process cleanup settings
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

/// Test runner binary settings
#[derive(Debug, Deserialize, Clone)]
pub struct ToolConfig {
    /// Binary name searched for on PATH
    #[serde(default = "default_tool_name")]
    pub name: String,

    /// Explicit path, checked before any search
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            name: default_tool_name(),
            path: None,
        }
    }
}

fn default_tool_name() -> String {
    "xcodebuild".to_string()
}

/// Run lifecycle settings
#[derive(Debug, Deserialize)]
pub struct RunConfig {
    /// Where run artifacts are written
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// How long to wait for the first sign of life from the tool
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            working_dir: None,
            liveness_timeout_secs: default_liveness_timeout(),
        }
    }
}

fn default_liveness_timeout() -> u64 {
    120
}

/// Abandoned-process cleanup settings
#[derive(Debug, Deserialize)]
pub struct CleanupConfig {
    /// Time between SIGTERM and SIGKILL
    #[serde(default = "default_terminate_grace")]
    pub terminate_grace_ms: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            terminate_grace_ms: default_terminate_grace(),
        }
    }
}

fn default_terminate_grace() -> u64 {
    2000
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        if let Some(path) = config_path() {
            if path.exists() {
                let content = std::fs::read_to_string(&path).map_err(|e| {
                    super::Error::FileRead {
                        path: path.display().to_string(),
                        error: e.to_string(),
                    }
                })?;
                return Self::parse(&content);
            }
        }
        Ok(Self::default())
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| super::Error::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.run.liveness_timeout_secs == 0 {
            return Err(super::Error::Config(
                "run.liveness_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Working directory for run artifacts
    pub fn working_dir(&self) -> PathBuf {
        self.run
            .working_dir
            .clone()
            .unwrap_or_else(default_working_dir)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.run.liveness_timeout_secs)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.cleanup.terminate_grace_ms)
    }
}
