//! Test runner binary discovery

use std::path::PathBuf;

use async_trait::async_trait;

use crate::common::config::ToolConfig;
use crate::common::{Error, Result};

/// Resolves the absolute path of the test runner binary
#[async_trait]
pub trait ToolLocator: Send + Sync {
    async fn locate(&self) -> Result<PathBuf>;
}

/// Finds `xcodebuild`
///
/// Search order: configured path, `$DEVELOPER_DIR/usr/bin/<name>`, then
/// `PATH`.
#[derive(Debug, Clone)]
pub struct XcodebuildLocator {
    name: String,
    configured: Option<PathBuf>,
    developer_dir: Option<PathBuf>,
}

impl XcodebuildLocator {
    pub fn new(config: &ToolConfig) -> Self {
        Self {
            name: config.name.clone(),
            configured: config.path.clone(),
            developer_dir: std::env::var_os("DEVELOPER_DIR").map(PathBuf::from),
        }
    }

    /// Override the developer directory instead of reading `DEVELOPER_DIR`
    pub fn with_developer_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.developer_dir = dir;
        self
    }

    fn search(&self) -> std::result::Result<PathBuf, Vec<String>> {
        let mut searched = Vec::new();

        if let Some(path) = &self.configured {
            if path.is_file() {
                return Ok(path.clone());
            }
            searched.push(path.display().to_string());
        }

        if let Some(dir) = &self.developer_dir {
            let candidate = dir.join("usr").join("bin").join(&self.name);
            if candidate.is_file() {
                return Ok(candidate);
            }
            searched.push(candidate.display().to_string());
        }

        match which::which(&self.name) {
            Ok(path) => Ok(path),
            Err(_) => {
                searched.push("PATH".to_string());
                Err(searched)
            }
        }
    }
}

#[async_trait]
impl ToolLocator for XcodebuildLocator {
    async fn locate(&self) -> Result<PathBuf> {
        let path = self
            .search()
            .map_err(|searched| Error::tool_not_found(&self.name, &searched))?;
        tracing::debug!(tool = %self.name, path = %path.display(), "Resolved test runner");
        Ok(path)
    }
}
