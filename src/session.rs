//! Session state of one test run
//!
//! Holds the test variables and the run's return code. Variables are
//! persisted as a flat JSON object in the working directory so the
//! children can read them, and re-read after the run because the children
//! may add variables of their own.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::common::{config::Config, paths, Error, Result};

/// Test variables by upper-case name
pub type Vars = BTreeMap<String, String>;

pub struct Session {
    workdir: PathBuf,
    vars: Vars,
    /// 0 once the command loop was entered, 1 until then
    pub return_code: i32,
}

impl Session {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            vars: Vars::new(),
            return_code: 1,
        }
    }

    pub fn vars(&self) -> &Vars {
        &self.vars
    }

    pub fn vars_path(&self) -> PathBuf {
        paths::vars_path(&self.workdir)
    }

    /// Non-empty variable value
    pub fn var(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Load variables from disk and apply `overrides` on top
    pub fn load(&mut self, overrides: &[(String, String)]) -> Result<()> {
        self.vars = read_vars(&self.vars_path())?;
        for (key, value) in overrides {
            self.vars.insert(key.clone(), value.clone());
        }
        tracing::debug!(count = self.vars.len(), "session variables loaded");
        Ok(())
    }

    /// Merge variables the children wrote while the test was running
    pub fn reload(&mut self) -> Result<()> {
        let on_disk = read_vars(&self.vars_path())?;
        for (key, value) in on_disk {
            self.vars.entry(key).or_insert(value);
        }
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        let path = self.vars_path();
        let content = serde_json::to_string_pretty(&self.vars)?;
        std::fs::write(&path, content + "\n")?;
        tracing::debug!(path = %path.display(), "session variables saved");
        Ok(())
    }

    /// Backend selected by `BACKEND`, else the configured default
    pub fn backend_name(&self, config: &Config) -> String {
        self.var("BACKEND")
            .map(str::to_lowercase)
            .unwrap_or_else(|| config.defaults.backend.clone())
    }

    /// Base port from `QEMUPORT`, else the configured default
    pub fn base_port(&self, config: &Config) -> Result<u16> {
        match self.var("QEMUPORT") {
            Some(port) => port
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("QEMUPORT is not a port number: '{port}'"))),
            None => Ok(config.defaults.base_port),
        }
    }

    pub fn job_token(&self) -> Option<&str> {
        self.var("JOBTOKEN")
    }

    /// Environment every child gets
    pub fn child_env(&self) -> Vec<(String, String)> {
        vec![(
            "VMTEST_VARS".to_string(),
            self.vars_path().display().to_string(),
        )]
    }

    /// Record our pid for external supervisors
    pub fn write_pid_file(&self) -> Result<PathBuf> {
        let path = paths::pid_path(&self.workdir);
        std::fs::write(&path, format!("{}\n", std::process::id()))?;
        tracing::debug!(path = %path.display(), "pid file written");
        Ok(path)
    }
}

/// Read a vars file; a missing file is an empty map
fn read_vars(path: &Path) -> Result<Vars> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vars::new()),
        Err(e) => {
            return Err(Error::FileRead {
                path: path.display().to_string(),
                error: e.to_string(),
            })
        }
    };

    let Value::Object(map) = serde_json::from_str::<Value>(&content)? else {
        return Err(Error::Config(format!(
            "{} does not contain a JSON object",
            path.display()
        )));
    };

    Ok(map
        .into_iter()
        .filter_map(|(key, value)| match value {
            Value::Null => None,
            Value::String(s) => Some((key, s)),
            other => Some((key, other.to_string())),
        })
        .collect())
}
