//! Configuration file handling

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::paths::config_path;
use super::Result;

/// Main configuration structure
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Test runner and command server programs
    #[serde(default)]
    pub processes: Processes,

    /// Backend driver programs by backend name
    #[serde(default)]
    pub backends: HashMap<String, ProgramConfig>,

    /// Default settings
    #[serde(default)]
    pub defaults: Defaults,

    /// Timeout settings
    #[serde(default)]
    pub timeouts: Timeouts,
}

/// How to launch one child program
#[derive(Debug, Deserialize, Clone)]
pub struct ProgramConfig {
    /// Path to the executable
    pub path: PathBuf,

    /// Additional arguments to pass
    #[serde(default)]
    pub args: Vec<String>,
}

/// Supervised programs other than the backend
#[derive(Debug, Deserialize, Default)]
pub struct Processes {
    /// Test-script runner
    pub autotest: Option<ProgramConfig>,

    /// Command/broadcast server
    pub command_server: Option<ProgramConfig>,
}

/// Default settings
#[derive(Debug, Deserialize)]
pub struct Defaults {
    /// Backend used when the BACKEND variable is unset
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Base port used when the QEMUPORT variable is unset
    #[serde(default = "default_base_port")]
    pub base_port: u16,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            base_port: default_base_port(),
        }
    }
}

fn default_backend() -> String {
    crate::backend::registry::DEFAULT_BACKEND.to_string()
}

fn default_base_port() -> u16 {
    20012
}

/// Timeout settings in seconds
#[derive(Debug, Deserialize)]
pub struct Timeouts {
    /// Bound for the command server broadcast before it is stopped
    #[serde(default = "default_notify")]
    pub notify_secs: u64,

    /// Grace period between SIGTERM and SIGKILL when stopping a child
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,

    /// Bound for a single synchronous backend call
    #[serde(default = "default_backend_call")]
    pub backend_call_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            notify_secs: default_notify(),
            stop_grace_secs: default_stop_grace(),
            backend_call_secs: default_backend_call(),
        }
    }
}

fn default_notify() -> u64 {
    15
}
fn default_stop_grace() -> u64 {
    5
}
fn default_backend_call() -> u64 {
    300
}

impl Timeouts {
    pub fn notify(&self) -> Duration {
        Duration::from_secs(self.notify_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn backend_call(&self) -> Duration {
        Duration::from_secs(self.backend_call_secs)
    }
}

impl Config {
    /// Load configuration from an explicit file or the default config file
    ///
    /// Returns default configuration if no file exists
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        if let Some(path) = config_path() {
            if path.exists() {
                return Self::from_file(&path);
            }
        }
        Ok(Self::default())
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| super::Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| super::Error::ConfigParse(e.to_string()))
    }

    /// Get the launch configuration for a backend by name
    ///
    /// Falls back to searching PATH for `vmtest-backend-<name>`
    pub fn get_backend(&self, name: &str) -> Option<ProgramConfig> {
        if let Some(config) = self.backends.get(name) {
            return Some(config.clone());
        }

        which::which(format!("vmtest-backend-{name}"))
            .ok()
            .map(|path| ProgramConfig {
                path,
                args: Vec::new(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_sections_missing() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.defaults.backend, "qemu");
        assert_eq!(config.defaults.base_port, 20012);
        assert_eq!(config.timeouts.notify(), Duration::from_secs(15));
        assert!(config.processes.autotest.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let config: Config = toml::from_str(
            r#"
            [processes.autotest]
            path = "/usr/lib/vmtest/autotest"
            args = ["--verbose"]

            [processes.command_server]
            path = "/usr/lib/vmtest/cmdsrv"

            [backends.qemu]
            path = "/usr/lib/vmtest/backend-qemu"

            [defaults]
            backend = "svirt"
            base_port = 15222

            [timeouts]
            stop_grace_secs = 1
            "#,
        )
        .unwrap();

        let autotest = config.processes.autotest.as_ref().unwrap();
        assert_eq!(autotest.args, vec!["--verbose"]);
        assert_eq!(config.defaults.backend, "svirt");
        assert_eq!(config.defaults.base_port, 15222);
        assert_eq!(config.timeouts.stop_grace(), Duration::from_secs(1));
        assert_eq!(config.timeouts.notify_secs, 15);
        assert_eq!(
            config.get_backend("qemu").unwrap().path,
            PathBuf::from("/usr/lib/vmtest/backend-qemu")
        );
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[defaults]\nbase_port = \"nope\"").unwrap();

        let err = Config::load(Some(&path)).unwrap_err();
        assert!(matches!(err, crate::common::Error::ConfigParse(_)));
    }
}
