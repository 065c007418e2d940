//! Configuration and working directory paths
//!
//! Unix/macOS: config under the platform config dir, run artifacts under
//! the platform data dir with a `/tmp` fallback keyed by uid.

use std::io;
use std::path::{Path, PathBuf};

/// Name used for config and data directories
const APP_NAME: &str = "xctest-runner";

/// Get the configuration directory path
///
/// Uses the directories crate for platform-appropriate locations:
/// - Linux: `~/.config/xctest-runner/`
/// - macOS: `~/Library/Application Support/xctest-runner/`
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the configuration file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Default directory for generated run artifacts
#[cfg(unix)]
pub fn default_working_dir() -> PathBuf {
    if let Some(dirs) = directories::ProjectDirs::from("", "", APP_NAME) {
        return dirs.data_dir().join("runs");
    }

    // Fallback to /tmp with uid so users don't share artifacts
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/{}-{}", APP_NAME, uid))
}

#[cfg(not(unix))]
pub fn default_working_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", APP_NAME)
        .map(|dirs| dirs.data_dir().join("runs"))
        .unwrap_or_else(|| std::env::temp_dir().join(APP_NAME))
}

/// Ensure the working directory exists
///
/// On Unix, a newly created directory gets mode 0700
pub fn ensure_working_dir(dir: &Path) -> io::Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
        }
    }
    Ok(())
}
