//! Child process handles
//!
//! Each child is spawned with piped stdin/stdout (its message channel) and
//! handed to a watcher task. The watcher reports exactly one
//! [`ProcessExit`] on the shared exit queue, whether the child died on its
//! own or was stopped by us.

use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};

use crate::common::{config::ProgramConfig, Error, Result};
use crate::ipc::Channel;

/// The three supervised processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Autotest,
    CommandServer,
    Backend,
}

impl Role {
    /// All roles in reactor polling order
    pub const ALL: [Role; 3] = [Role::Autotest, Role::CommandServer, Role::Backend];
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Autotest => write!(f, "autotest"),
            Self::CommandServer => write!(f, "command server"),
            Self::Backend => write!(f, "backend"),
        }
    }
}

/// "Collected" notification for a child that has exited
#[derive(Debug, Clone)]
pub struct ProcessExit {
    pub role: Role,
    pub pid: u32,
    pub status: Option<ExitStatus>,
}

/// A freshly spawned child and the channel to talk to it
pub struct Spawned {
    pub process: ChildProcess,
    pub channel: Channel,
}

/// Handle to a running child process
pub struct ChildProcess {
    role: Role,
    pid: u32,
    stop_tx: Option<oneshot::Sender<Duration>>,
    exited: watch::Receiver<bool>,
}

impl ChildProcess {
    /// Spawn a child and start watching it
    pub fn spawn(
        role: Role,
        program: &ProgramConfig,
        env: &[(String, String)],
        exits: mpsc::UnboundedSender<ProcessExit>,
    ) -> Result<Spawned> {
        let mut cmd = Command::new(&program.path);
        cmd.args(&program.args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd.spawn().map_err(|e| {
            Error::process_start(role, format!("{}: {}", program.path.display(), e))
        })?;

        let pid = child
            .id()
            .ok_or_else(|| Error::process_start(role, "process exited immediately"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::process_start(role, "failed to get stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::process_start(role, "failed to get stdout"))?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let (exited_tx, exited) = watch::channel(false);
        tokio::spawn(watch_child(role, pid, child, stop_rx, exited_tx, exits));

        tracing::info!(%role, pid, "{} started", role);

        Ok(Spawned {
            process: Self {
                role,
                pid,
                stop_tx: Some(stop_tx),
                exited,
            },
            channel: Channel::new(role.to_string(), stdout, stdin),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        !*self.exited.borrow()
    }

    /// Stop the child: SIGTERM, then SIGKILL after `grace`
    ///
    /// Returns whether the exit was observed. Never waits much longer than
    /// `grace`.
    pub async fn stop(&mut self, grace: Duration) -> bool {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(grace);
        }

        let mut exited = self.exited.clone();
        let observed = tokio::time::timeout(
            grace + Duration::from_secs(1),
            exited.wait_for(|exited| *exited),
        )
        .await
        .is_ok_and(|result| result.is_ok());

        if !observed {
            tracing::warn!(role = %self.role, pid = self.pid, "process did not exit in time");
        }
        observed
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        // Best-effort, we can't await in drop
        if self.is_running() {
            #[cfg(unix)]
            unsafe {
                libc::kill(self.pid as libc::pid_t, libc::SIGKILL);
            };
        }
    }
}

async fn watch_child(
    role: Role,
    pid: u32,
    mut child: Child,
    stop_rx: oneshot::Receiver<Duration>,
    exited_tx: watch::Sender<bool>,
    exits: mpsc::UnboundedSender<ProcessExit>,
) {
    let status = tokio::select! {
        status = child.wait() => status.ok(),
        Ok(grace) = stop_rx => terminate(&mut child, pid, grace).await,
    };

    match status {
        Some(status) => tracing::info!(%role, pid, "{} exited: {}", role, status),
        None => tracing::warn!(%role, pid, "{} exited with unknown status", role),
    }

    let _ = exited_tx.send(true);
    let _ = exits.send(ProcessExit { role, pid, status });
}

async fn terminate(child: &mut Child, pid: u32, grace: Duration) -> Option<ExitStatus> {
    #[cfg(unix)]
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    };
    #[cfg(not(unix))]
    let _ = child.start_kill();

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status.ok(),
        Err(_) => {
            tracing::warn!(pid, "process ignored SIGTERM for {:?}, killing", grace);
            let _ = child.kill().await;
            child.wait().await.ok()
        }
    }
}
