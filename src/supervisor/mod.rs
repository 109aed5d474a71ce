//! Process supervisor
//!
//! Owns the three children of a run (backend, command server, test runner)
//! and their channels. Start order is backend, command server, test runner.
//! Every stop operation is idempotent: a stopped child is simply absent.

pub mod notify;
pub mod process;
pub mod shutdown;

use std::time::Duration;

use tokio::sync::mpsc;

use crate::backend::{self, Backend};
use crate::common::{config::Config, Error, Result};
use crate::ipc::Channel;
use crate::runner::Endpoints;

use process::{ChildProcess, ProcessExit, Role};

/// Stop reason of a run that ended normally
pub const TEST_EXECUTION_ENDED: &str = "test execution ended";

pub struct Supervisor {
    backend: Option<Box<dyn Backend>>,
    command_server: Option<ChildProcess>,
    command_server_channel: Option<Channel>,
    autotest: Option<ChildProcess>,
    autotest_channel: Option<Channel>,
    /// Port the command server listens on, once started
    cmd_srv_port: Option<u16>,
    job_token: Option<String>,
    exits_tx: mpsc::UnboundedSender<ProcessExit>,
    exits: mpsc::UnboundedReceiver<ProcessExit>,
    grace: Duration,
    notify_timeout: Duration,
}

impl Supervisor {
    pub fn new(config: &Config) -> Self {
        let (exits_tx, exits) = mpsc::unbounded_channel();
        Self {
            backend: None,
            command_server: None,
            command_server_channel: None,
            autotest: None,
            autotest_channel: None,
            cmd_srv_port: None,
            job_token: None,
            exits_tx,
            exits,
            grace: config.timeouts.stop_grace(),
            notify_timeout: config.timeouts.notify(),
        }
    }

    /// Start the backend and make sure a machine is running
    pub async fn start_backend(
        &mut self,
        config: &Config,
        name: &str,
        env: &[(String, String)],
    ) -> Result<()> {
        let backend = backend::create(config, name, env, self.exits_tx.clone())?;
        let backend = self.backend.insert(backend);
        tracing::info!(backend = name, "started backend: {}", backend.info().description);

        if backend.alive().await {
            tracing::info!("machine is already running, reusing it");
        } else {
            backend.start_vm().await?;
        }
        Ok(())
    }

    /// Start the command server on `base_port + 1`
    pub fn start_command_server(
        &mut self,
        config: &Config,
        base_port: u16,
        job_token: Option<&str>,
        env: &[(String, String)],
    ) -> Result<()> {
        let program = config
            .processes
            .command_server
            .as_ref()
            .ok_or_else(|| Error::ProcessNotConfigured(Role::CommandServer.to_string()))?;
        let port = base_port
            .checked_add(1)
            .ok_or_else(|| Error::Config(format!("base port {base_port} leaves no room for the command server")))?;

        let mut env = env.to_vec();
        env.push(("VMTEST_CMD_SRV_PORT".to_string(), port.to_string()));

        let spawned = ChildProcess::spawn(Role::CommandServer, program, &env, self.exits_tx.clone())?;
        tracing::info!(pid = spawned.process.pid(), port, "command server listening");

        self.command_server = Some(spawned.process);
        self.command_server_channel = Some(spawned.channel);
        self.cmd_srv_port = Some(port);
        self.job_token = job_token.map(String::from);
        Ok(())
    }

    /// Start the test runner
    pub fn start_autotest(&mut self, config: &Config, env: &[(String, String)]) -> Result<()> {
        let program = config
            .processes
            .autotest
            .as_ref()
            .ok_or_else(|| Error::ProcessNotConfigured(Role::Autotest.to_string()))?;

        let spawned = ChildProcess::spawn(Role::Autotest, program, env, self.exits_tx.clone())?;
        self.autotest = Some(spawned.process);
        self.autotest_channel = Some(spawned.channel);
        Ok(())
    }

    pub fn backend_mut(&mut self) -> Option<&mut (dyn Backend + 'static)> {
        self.backend.as_deref_mut()
    }

    /// Everything the command loop needs, borrowed at once
    pub fn loop_parts(
        &mut self,
    ) -> Result<(Endpoints<'_>, &mut mpsc::UnboundedReceiver<ProcessExit>)> {
        let backend = self
            .backend
            .as_mut()
            .ok_or_else(|| Error::Internal("backend not started".to_string()))?;
        let endpoints = Endpoints {
            autotest: &mut self.autotest_channel,
            command_server: &mut self.command_server_channel,
            backend: backend.as_mut(),
        };
        Ok((endpoints, &mut self.exits))
    }

    pub async fn stop_backend(&mut self) {
        let Some(mut backend) = self.backend.take() else {
            return;
        };
        tracing::info!(backend = backend.name(), "stopping backend");
        backend.terminate(self.grace).await;
        tracing::debug!("backend stopped");
    }

    /// Stop the command server, telling its clients first on a normal end
    pub async fn stop_commands(&mut self, reason: &str) {
        let Some(mut process) = self.command_server.take() else {
            if let Some(mut channel) = self.command_server_channel.take() {
                channel.close();
            }
            return;
        };

        if reason == TEST_EXECUTION_ENDED {
            if let Some(port) = self.cmd_srv_port {
                let url = notify::broadcast_url(port, self.job_token.as_deref());
                tracing::debug!(url = %url, "informing websocket clients");
                if let Err(e) = notify::notify_stopping(&url, reason, self.notify_timeout).await {
                    tracing::warn!("{}", e);
                }
            }
        }

        if let Some(mut channel) = self.command_server_channel.take() {
            channel.close();
        }

        tracing::info!(pid = process.pid(), reason, "stopping command server because {}", reason);
        process.stop(self.grace).await;
        tracing::debug!("command server stopped");
    }

    pub async fn stop_autotest(&mut self) {
        if let Some(mut channel) = self.autotest_channel.take() {
            channel.close();
        }
        let Some(mut process) = self.autotest.take() else {
            return;
        };
        tracing::info!(pid = process.pid(), "stopping autotest");
        process.stop(self.grace).await;
        tracing::debug!("autotest stopped");
    }

    /// Ordered shutdown after the command loop
    ///
    /// Returns whether the machine was shut down cleanly. A test runner
    /// that is still connected never reported completion, and a failing
    /// `stop_vm` fails the run as well: both set `return_code` to 1.
    pub async fn handle_shutdown(&mut self, return_code: &mut i32) -> bool {
        self.stop_commands(TEST_EXECUTION_ENDED).await;

        if self.autotest_channel.as_ref().is_some_and(Channel::is_open) {
            tracing::warn!("test runner is still connected, stopping it");
            *return_code = 1;
            self.stop_autotest().await;
        }

        let Some(backend) = self.backend_mut() else {
            return false;
        };

        let clean_shutdown = match backend.is_shutdown().await {
            Ok(clean) => clean,
            Err(e) => {
                tracing::warn!("unable to query the machine state: {}", e);
                false
            }
        };
        tracing::debug!(clean_shutdown, "machine state after the run");

        if let Err(e) = backend.stop_vm().await {
            tracing::error!("error while stopping the machine: {}", e);
            *return_code = 1;
        }

        clean_shutdown
    }

    /// Kill everything without grace period or notification
    pub async fn kill_all(&mut self, reason: &str) {
        self.grace = Duration::ZERO;
        self.teardown(reason).await;
    }

    /// Stop whatever is still running
    pub async fn teardown(&mut self, reason: &str) {
        self.stop_backend().await;
        self.stop_commands(reason).await;
        self.stop_autotest().await;
    }
}
