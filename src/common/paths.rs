//! Well-known file locations
//!
//! Run state (variables, pid file) lives in the working directory so that
//! the supervised children and external observers find it next to the
//! test results. Configuration uses the platform config directory.

use std::path::{Path, PathBuf};

/// Application name used for config directories
const APP_NAME: &str = "vmtest";

/// File holding the session variables
pub const VARS_FILE: &str = "vars.json";

/// File holding the supervisor's process id
pub const PID_FILE: &str = "vmtest.pid";

/// Path of the variables file inside a working directory
pub fn vars_path(workdir: &Path) -> PathBuf {
    workdir.join(VARS_FILE)
}

/// Path of the pid file inside a working directory
pub fn pid_path(workdir: &Path) -> PathBuf {
    workdir.join(PID_FILE)
}

/// Get the configuration directory path
///
/// Uses the directories crate for platform-appropriate locations:
/// - Linux: `~/.config/vmtest/`
/// - macOS: `~/Library/Application Support/vmtest/`
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the configuration file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}
