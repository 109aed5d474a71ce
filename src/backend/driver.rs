//! Backend running as a child process
//!
//! Requests go to the backend's stdin, everything the backend says comes
//! back on its stdout:
//! ```text
//! >>> {"cmd":"is_shutdown","json_cmd_token":"4711-3"}
//! <<< {"rsp":true,"json_cmd_token":"4711-3"}
//! ```
//! Each request carries a token and the backend echoes it, so a
//! synchronous call can tell its own reply apart from replies to commands
//! forwarded earlier. Those are left on the output channel for the reactor.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::common::{config::ProgramConfig, Error, Result};
use crate::ipc::Channel;
use crate::supervisor::process::{ChildProcess, ProcessExit, Role};

use super::{Backend, BackendInfo};

/// Request written to the backend
#[derive(Debug, Serialize)]
struct BackendRequest<'a> {
    cmd: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<Value>,
    json_cmd_token: &'a str,
}

/// Message read from the backend
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BackendReply {
    #[serde(default)]
    pub rsp: Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, rename = "json_cmd_token")]
    pub token: Option<String>,
}

impl BackendReply {
    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// The reply payload, or the error the backend reported for `cmd`
    pub fn into_result(self, cmd: &str) -> Result<Value> {
        match self.error {
            Some(message) => Err(Error::backend_call(cmd, message)),
            None => Ok(self.rsp),
        }
    }
}

/// Backend driver process
pub struct ProcessBackend {
    info: &'static BackendInfo,
    process: Option<ChildProcess>,
    channel: Channel,
    next_token: u64,
    call_timeout: Duration,
}

impl ProcessBackend {
    /// Spawn the backend process
    pub fn spawn(
        info: &'static BackendInfo,
        program: &ProgramConfig,
        env: &[(String, String)],
        exits: mpsc::UnboundedSender<ProcessExit>,
        call_timeout: Duration,
    ) -> Result<Self> {
        let spawned = ChildProcess::spawn(Role::Backend, program, env, exits)?;
        Ok(Self::with_channel(
            info,
            Some(spawned.process),
            spawned.channel,
            call_timeout,
        ))
    }

    fn with_channel(
        info: &'static BackendInfo,
        process: Option<ChildProcess>,
        channel: Channel,
        call_timeout: Duration,
    ) -> Self {
        Self {
            info,
            process,
            channel,
            next_token: 1,
            call_timeout,
        }
    }

    fn next_token(&mut self) -> String {
        let token = format!("{}-{}", std::process::id(), self.next_token);
        self.next_token += 1;
        token
    }

    async fn send_request(&mut self, cmd: &str, arguments: Option<Value>) -> Result<String> {
        let token = self.next_token();
        let request = BackendRequest {
            cmd,
            arguments,
            json_cmd_token: &token,
        };
        self.channel.send(&request).await?;
        Ok(token)
    }
}

#[async_trait]
impl Backend for ProcessBackend {
    fn info(&self) -> &'static BackendInfo {
        self.info
    }

    fn output(&mut self) -> &mut Channel {
        &mut self.channel
    }

    async fn call(&mut self, cmd: &str, arguments: Option<Value>) -> Result<Value> {
        let token = self.send_request(cmd, arguments).await?;
        tracing::debug!(cmd, token = %token, "backend call");

        let channel = &mut self.channel;
        let mut skipped = Vec::new();
        let wait = async {
            loop {
                let Some(value) = channel.receive().await else {
                    return Err(Error::ChannelClosed(channel.name().to_string()));
                };
                let reply = BackendReply::from_value(value.clone())?;
                if reply.token.as_deref() == Some(token.as_str()) {
                    return reply.into_result(cmd);
                }
                skipped.push(value);
            }
        };
        let result = tokio::time::timeout(self.call_timeout, wait).await;

        if !skipped.is_empty() {
            tracing::debug!(count = skipped.len(), "keeping unrelated backend messages for later");
            self.channel.requeue(skipped);
        }

        result.map_err(|_| Error::BackendTimeout(cmd.to_string()))?
    }

    async fn forward(&mut self, cmd: &str, arguments: Option<Value>) -> Result<String> {
        let token = self.send_request(cmd, arguments).await?;
        tracing::debug!(cmd, token = %token, "forwarded command to backend");
        Ok(token)
    }

    async fn terminate(&mut self, grace: Duration) {
        self.channel.close();
        if let Some(mut process) = self.process.take() {
            process.stop(grace).await;
        }
    }
}
