//! Backend driver interface
//!
//! A backend owns the virtual (or physical) machine. The orchestrator talks
//! to it two ways: synchronous calls for control decisions, and an output
//! channel carrying replies to forwarded test-runner commands, which the
//! reactor multiplexes with the other channels.

pub mod driver;
pub mod registry;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::common::{config::Config, Error, Result};
use crate::ipc::{protocol::truthy, Channel};
use crate::runner::assets::AssetDescriptor;
use crate::supervisor::process::ProcessExit;

pub use driver::{BackendReply, ProcessBackend};
pub use registry::BackendInfo;

/// Capabilities every backend provides
#[async_trait]
pub trait Backend: Send {
    /// Registry entry of this backend
    fn info(&self) -> &'static BackendInfo;

    /// Channel carrying asynchronous backend messages
    fn output(&mut self) -> &mut Channel;

    /// Synchronous round-trip: send `cmd` and wait for its reply
    async fn call(&mut self, cmd: &str, arguments: Option<Value>) -> Result<Value>;

    /// Send `cmd` without waiting; the reply arrives on [`Backend::output`]
    ///
    /// Returns the token the reply will carry.
    async fn forward(&mut self, cmd: &str, arguments: Option<Value>) -> Result<String>;

    /// Stop the backend process
    async fn terminate(&mut self, grace: Duration);

    fn name(&self) -> &'static str {
        self.info().name
    }

    /// Liveness probe; a failed probe counts as "not alive"
    async fn alive(&mut self) -> bool {
        match self.call("alive", None).await {
            Ok(rsp) => truthy(&rsp),
            Err(e) => {
                tracing::debug!("liveness probe failed, assuming the VM is not running: {}", e);
                false
            }
        }
    }

    async fn start_vm(&mut self) -> Result<()> {
        self.call("start_vm", None).await?;
        Ok(())
    }

    /// Whether the machine reached a fully stopped state
    async fn is_shutdown(&mut self) -> Result<bool> {
        let rsp = self.call("is_shutdown", None).await?;
        Ok(truthy(&rsp))
    }

    async fn stop_vm(&mut self) -> Result<()> {
        self.call("stop_vm", None).await?;
        Ok(())
    }

    /// Pull one generated artifact out of the machine
    async fn extract_asset(&mut self, asset: &AssetDescriptor) -> Result<()> {
        if !self.info().supports_asset_extraction {
            return Err(Error::asset_extraction(
                asset,
                format!("backend '{}' cannot extract assets", self.name()),
            ));
        }

        let arguments = serde_json::to_value(asset)?;
        self.call("extract_asset", Some(arguments))
            .await
            .map_err(|e| Error::asset_extraction(asset, e))?;
        Ok(())
    }
}

/// Start the backend selected by `name`
///
/// `env` is passed to the backend process on top of the forced C locale.
pub fn create(
    config: &Config,
    name: &str,
    env: &[(String, String)],
    exits: mpsc::UnboundedSender<ProcessExit>,
) -> Result<Box<dyn Backend>> {
    let info = registry::lookup(name).ok_or_else(|| Error::UnknownBackend {
        name: name.to_string(),
        known: registry::known_names(),
    })?;

    let program = config.get_backend(name).ok_or_else(|| {
        Error::Config(format!(
            "No program configured for backend '{}'. Add [backends.{}] to the config file or put vmtest-backend-{} on PATH",
            name, name, name
        ))
    })?;

    let mut env = env.to_vec();
    env.push(("LC_ALL".to_string(), "C".to_string()));
    env.push(("LANG".to_string(), "C".to_string()));

    let backend = ProcessBackend::spawn(
        info,
        &program,
        &env,
        exits,
        config.timeouts.backend_call(),
    )?;
    Ok(Box::new(backend))
}
