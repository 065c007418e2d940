//! Launch configuration and the on-disk run artifact
//!
//! A [`LaunchConfiguration`] describes what to test. Before each run it is
//! materialised into a file in the coordinator's working directory and
//! the tool is pointed at that file.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::common::{Error, Result};

/// Version stamped into every generated artifact
const ARTIFACT_FORMAT_VERSION: u32 = 1;

/// What to run: the test bundle and how to launch it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchConfiguration {
    /// Path to the `.xctest` bundle
    pub test_bundle: PathBuf,

    /// Application hosting the tests, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_host: Option<PathBuf>,

    /// Application driven by UI tests, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_application: Option<PathBuf>,

    /// Launch arguments for the process under test
    #[serde(default)]
    pub arguments: Vec<String>,

    /// Environment for the process under test
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    /// Only run these tests (`Class` or `Class/method`); empty runs all
    #[serde(default)]
    pub tests_to_run: Vec<String>,

    /// Skip these tests
    #[serde(default)]
    pub tests_to_skip: Vec<String>,
}

impl LaunchConfiguration {
    pub fn new(test_bundle: impl Into<PathBuf>) -> Self {
        Self {
            test_bundle: test_bundle.into(),
            test_host: None,
            target_application: None,
            arguments: Vec::new(),
            environment: BTreeMap::new(),
            tests_to_run: Vec::new(),
            tests_to_skip: Vec::new(),
        }
    }

    /// Load a launch configuration from a `.toml` or `.json` file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(serde_json::from_str(&content)?),
            _ => toml::from_str(&content).map_err(|e| Error::ConfigParse(e.to_string())),
        }
    }
}

impl fmt::Display for LaunchConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "test bundle {}", self.test_bundle.display())
    }
}

/// Writes a launch configuration to disk for the tool to consume
#[async_trait]
pub trait RunConfigBuilder: Send + Sync {
    /// Write `configuration` into `working_dir`, returning the file path
    async fn write(
        &self,
        configuration: &LaunchConfiguration,
        working_dir: &Path,
    ) -> Result<PathBuf>;
}

/// Default builder producing `run-*.xctestrun.json` artifacts
#[derive(Debug, Default, Clone, Copy)]
pub struct XctestrunWriter;

#[derive(Serialize)]
struct XctestrunArtifact<'a> {
    format_version: u32,
    test_target: &'a LaunchConfiguration,
}

#[async_trait]
impl RunConfigBuilder for XctestrunWriter {
    async fn write(
        &self,
        configuration: &LaunchConfiguration,
        working_dir: &Path,
    ) -> Result<PathBuf> {
        if configuration.test_bundle.as_os_str().is_empty() {
            return Err(Error::ConfigurationWrite(
                "test bundle path is empty".to_string(),
            ));
        }

        let artifact = XctestrunArtifact {
            format_version: ARTIFACT_FORMAT_VERSION,
            test_target: configuration,
        };
        let body = serde_json::to_vec_pretty(&artifact)
            .map_err(|e| Error::ConfigurationWrite(format!("{}: {}", configuration, e)))?;
        let dir = working_dir.to_path_buf();

        tokio::task::spawn_blocking(move || write_artifact(&dir, &body))
            .await
            .map_err(|e| Error::Internal(format!("Artifact writer task failed: {}", e)))?
    }
}

fn write_artifact(dir: &Path, body: &[u8]) -> Result<PathBuf> {
    let describe = |e: &dyn fmt::Display| {
        Error::ConfigurationWrite(format!("cannot write to {}: {}", dir.display(), e))
    };

    let mut file = tempfile::Builder::new()
        .prefix("run-")
        .suffix(".xctestrun.json")
        .tempfile_in(dir)
        .map_err(|e| describe(&e))?;
    file.write_all(body).map_err(|e| describe(&e))?;
    file.flush().map_err(|e| describe(&e))?;

    let (_, path) = file.keep().map_err(|e| describe(&e))?;
    Ok(path)
}
