//! Command handler: routing and screen-check throttling
//!
//! All timing decisions of the run live here. The reactor only asks for the
//! current [`CommandHandler::timeout`] and hands over whatever arrives.
//!
//! A screen check is outstanding while `tags` is set. Checks are rate
//! limited to one per second of wall-clock time; `no_wait` checks poll
//! every 100ms instead. The result goes to the test runner once the backend
//! reports a match (`found`) or gives up (`timeout`).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};

use crate::backend::{Backend, BackendReply};
use crate::common::{Error, Result};
use crate::ipc::protocol::{CommandMessage, Message, ScreenCheckResult};
use crate::ipc::Channel;
use crate::supervisor::process::Role;

/// Minimum spacing of screen checks
const CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Delta assumed before the first check ever (fires immediately)
const ETERNITY: Duration = Duration::from_secs(100);

/// Poll interval of `no_wait` checks
const NO_WAIT_TIMEOUT: Duration = Duration::from_millis(100);

/// Checks fire once the remaining wait is at most this
const FIRE_THRESHOLD: Duration = Duration::from_millis(50);

/// Borrowed view of everything the handler talks to
pub struct Endpoints<'a> {
    pub autotest: &'a mut Option<Channel>,
    pub command_server: &'a mut Option<Channel>,
    pub backend: &'a mut dyn Backend,
}

impl Endpoints<'_> {
    pub fn channel(&mut self, role: Role) -> Option<&mut Channel> {
        match role {
            Role::Autotest => self.autotest.as_mut(),
            Role::CommandServer => self.command_server.as_mut(),
            Role::Backend => Some(self.backend.output()),
        }
    }
}

/// What the reactor should do after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Coarse run status reported by `status`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Initialized,
    Running,
    Finished,
}

impl RunStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Finished => "finished",
        }
    }
}

pub struct CommandHandler {
    tags: Option<Vec<String>>,
    no_wait: bool,
    timeout: Option<Duration>,
    last_check: Option<Instant>,
    /// Forwarded backend calls by token
    pending: HashMap<String, Role>,
    accepting: bool,
    paused: Option<String>,
    postponed: Option<CommandMessage>,
    current_test: Option<String>,
    current_test_full_name: Option<String>,
    status: RunStatus,
    test_completed: bool,
    test_died: bool,
}

impl Default for CommandHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandHandler {
    pub fn new() -> Self {
        Self {
            tags: None,
            no_wait: false,
            timeout: None,
            last_check: None,
            pending: HashMap::new(),
            accepting: true,
            paused: None,
            postponed: None,
            current_test: None,
            current_test_full_name: None,
            status: RunStatus::Initialized,
            test_completed: false,
            test_died: false,
        }
    }

    /// Bound for the reactor's next wait; `None` waits for input only
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn tags(&self) -> Option<&[String]> {
        self.tags.as_deref()
    }

    /// Whether a screen check is outstanding
    pub fn is_armed(&self) -> bool {
        self.tags.is_some()
    }

    pub fn test_completed(&self) -> bool {
        self.test_completed
    }

    pub fn test_died(&self) -> bool {
        self.test_died
    }

    /// Refuse all further commands
    pub fn stop_processing(&mut self) {
        tracing::debug!("no longer processing commands");
        self.accepting = false;
    }

    /// Handle a command from the test runner or the command server
    pub async fn process_command(
        &mut self,
        from: Role,
        message: Value,
        ep: &mut Endpoints<'_>,
    ) -> Result<Flow> {
        if !self.accepting {
            tracing::debug!(peer = %from, "ignoring message, command processing stopped");
            return Ok(Flow::Continue);
        }

        let command = match Message::from_value(message) {
            Message::Command(command) => command,
            other => {
                tracing::warn!(peer = %from, "ignoring message without command: {}", other.to_value());
                return Ok(Flow::Continue);
            }
        };
        tracing::debug!(peer = %from, cmd = %command.cmd, "processing command");

        let cmd = command.cmd.clone();
        match cmd.as_str() {
            "tests_done" => return Ok(self.tests_done(&command, ep)),
            "check_screen" => self.check_screen(from, command, ep).await?,
            "set_current_test" => self.set_current_test(&command, ep).await,
            "status" => {
                let status = self.status_report();
                reply(ep, from, status).await?;
            }
            "version" => {
                reply(ep, from, json!({ "version": env!("CARGO_PKG_VERSION") })).await?;
            }
            "pause_test_execution" => {
                let reason = command
                    .str_arg("reason")
                    .unwrap_or("manually paused")
                    .to_string();
                self.pause(reason.clone(), ep).await;
                reply(ep, from, json!({ "test_execution_paused": reason })).await?;
            }
            "resume_test_execution" => {
                self.resume(ep).await?;
                reply(ep, from, json!({ "test_execution_paused": false })).await?;
            }
            name if name.starts_with("backend_") => self.pass_to_backend(from, command, ep).await?,
            unknown => {
                tracing::warn!(peer = %from, "unknown command '{}'", unknown);
                reply(ep, from, Value::Null).await?;
            }
        }

        Ok(Flow::Continue)
    }

    /// Route a message from the backend's output channel to its requester
    pub async fn route_backend_reply(&mut self, message: Value, ep: &mut Endpoints<'_>) -> Result<()> {
        let reply_msg = BackendReply::from_value(message)?;

        let requester = match reply_msg.token.as_deref() {
            Some(token) => self.pending.remove(token),
            None if self.pending.len() == 1 => self.pending.drain().next().map(|(_, role)| role),
            None => None,
        };
        let Some(requester) = requester else {
            tracing::warn!(token = ?reply_msg.token, "backend reply without a requester, dropping it");
            return Ok(());
        };

        let ret = match reply_msg.error {
            Some(error) => {
                tracing::warn!(peer = %requester, "forwarded backend command failed: {}", error);
                Value::Null
            }
            None => reply_msg.rsp,
        };

        if ep.channel(requester).is_none() {
            tracing::debug!(peer = %requester, "requester is gone, dropping backend reply");
            return Ok(());
        }
        reply(ep, requester, ret).await
    }

    /// Throttled screen check, run by the reactor after every iteration
    pub async fn check_asserted_screen(&mut self, ep: &mut Endpoints<'_>, now: Instant) -> Result<()> {
        let Some(tags) = self.tags.clone() else {
            return Ok(());
        };

        let no_wait = self.no_wait;
        if no_wait {
            self.timeout = Some(NO_WAIT_TIMEOUT);
        } else {
            self.calc_check_delta(now);
            if self.timeout.is_some_and(|t| t > FIRE_THRESHOLD) {
                return Ok(());
            }
        }

        self.last_check = Some(now);
        let rsp = match ep.backend.call("check_asserted_screen", None).await {
            Ok(rsp) => rsp,
            Err(e) if e.is_disconnect() => return Err(e),
            Err(e) => {
                tracing::warn!("screen check failed: {}", e);
                Value::Null
            }
        };

        let mut result = ScreenCheckResult::from_value(rsp);
        result.set_tags(&tags);

        if result.is_conclusive() {
            reply(ep, Role::Autotest, result.into_value()).await?;
            self.tags = None;
            self.timeout = None;
            self.no_wait = false;
        } else if !no_wait {
            self.calc_check_delta(Instant::now());
        }
        Ok(())
    }

    /// Recompute the wait until the next check is due
    fn calc_check_delta(&mut self, now: Instant) -> Duration {
        let delta = match self.last_check {
            Some(last) => now.saturating_duration_since(last),
            None => ETERNITY,
        };
        self.timeout = Some(CHECK_INTERVAL.saturating_sub(delta));
        delta
    }

    fn tests_done(&mut self, command: &CommandMessage, ep: &mut Endpoints<'_>) -> Flow {
        self.test_died = command.flag("died");
        self.test_completed = command.flag("completed");
        self.current_test = None;
        self.status = RunStatus::Finished;
        tracing::info!(died = self.test_died, completed = self.test_completed, "tests done");

        if let Some(mut channel) = ep.autotest.take() {
            channel.close();
        }
        Flow::Stop
    }

    async fn check_screen(&mut self, from: Role, command: CommandMessage, ep: &mut Endpoints<'_>) -> Result<()> {
        if self.postpone_if_paused(from, &command) {
            return Ok(());
        }
        self.no_wait = command.flag("no_wait");

        let mut arguments = Map::new();
        for key in ["mustmatch", "timeout", "check"] {
            if let Some(value) = command.args.get(key) {
                arguments.insert(key.to_string(), value.clone());
            }
        }
        let api_function = if command.flag("check") {
            "check_screen"
        } else {
            "assert_screen"
        };
        self.send_to_command_server(
            ep,
            json!({ "check_screen": arguments, "current_api_function": api_function }),
        )
        .await;

        let requested = tags_of(command.args.get("mustmatch"));
        let rsp = match ep
            .backend
            .call("set_tags_to_assert", Some(Value::Object(arguments)))
            .await
        {
            Ok(rsp) => rsp,
            Err(e) if e.is_disconnect() => return Err(e),
            Err(e) => {
                tracing::error!("unable to arm screen check: {}", e);
                self.no_wait = false;
                return reply(ep, from, Value::Null).await;
            }
        };
        let tags = match rsp.get("tags") {
            Some(tags) => tags_of(Some(tags)),
            None => requested,
        };

        tracing::debug!(?tags, no_wait = self.no_wait, "screen check armed");
        self.tags = Some(tags);
        Ok(())
    }

    async fn set_current_test(&mut self, command: &CommandMessage, ep: &mut Endpoints<'_>) {
        self.current_test = command.str_arg("name").map(String::from);
        self.current_test_full_name = command.str_arg("full_name").map(String::from);
        self.status = RunStatus::Running;
        tracing::info!(test = ?self.current_test, "current test changed");

        self.send_to_command_server(
            ep,
            json!({
                "set_current_test": self.current_test,
                "current_test_full_name": self.current_test_full_name,
            }),
        )
        .await;
    }

    fn status_report(&self) -> Value {
        json!({
            "status": self.status.as_str(),
            "current_test": self.current_test,
            "current_test_full_name": self.current_test_full_name,
            "tags": self.tags,
            "test_execution_paused": self.paused,
        })
    }

    async fn pause(&mut self, reason: String, ep: &mut Endpoints<'_>) {
        tracing::info!(reason = %reason, "pausing test execution");
        self.send_to_command_server(ep, json!({ "paused": true, "reason": reason }))
            .await;
        self.paused = Some(reason);
    }

    async fn resume(&mut self, ep: &mut Endpoints<'_>) -> Result<()> {
        if self.paused.take().is_none() {
            return Ok(());
        }
        tracing::info!("resuming test execution");
        self.send_to_command_server(ep, json!({ "resume_test_execution": true }))
            .await;

        if let Some(command) = self.postponed.take() {
            tracing::info!(cmd = %command.cmd, "running postponed command");
            if command.cmd == "check_screen" {
                self.check_screen(Role::Autotest, command, ep).await?;
            } else {
                self.pass_to_backend(Role::Autotest, command, ep).await?;
            }
        }
        Ok(())
    }

    /// Keep a test-runner command until execution is resumed
    fn postpone_if_paused(&mut self, from: Role, command: &CommandMessage) -> bool {
        if from != Role::Autotest || self.paused.is_none() {
            return false;
        }
        tracing::info!(cmd = %command.cmd, "test execution paused, postponing command");
        self.postponed = Some(command.clone());
        true
    }

    async fn pass_to_backend(&mut self, from: Role, command: CommandMessage, ep: &mut Endpoints<'_>) -> Result<()> {
        if self.postpone_if_paused(from, &command) {
            return Ok(());
        }

        if self.pending.values().any(|r| *r == from) {
            tracing::error!(
                peer = %from,
                cmd = %command.cmd,
                "backend call issued while the previous one is still in flight, ignoring it"
            );
            return Ok(());
        }

        let cmd = command.cmd.trim_start_matches("backend_");
        match ep.backend.forward(cmd, Some(Value::Object(command.args.clone()))).await {
            Ok(token) => {
                self.pending.insert(token, from);
                Ok(())
            }
            Err(e) if e.is_disconnect() => Err(e),
            Err(e) => {
                tracing::error!(peer = %from, cmd, "unable to pass command to the backend: {}", e);
                reply(ep, from, Value::Null).await
            }
        }
    }

    /// Best-effort broadcast to the command server
    async fn send_to_command_server(&self, ep: &mut Endpoints<'_>, message: Value) {
        let Some(channel) = ep.command_server.as_mut() else {
            return;
        };
        if let Err(e) = channel.send(&message).await {
            tracing::warn!("unable to inform the command server: {}", e);
        }
    }
}

/// Send `{ret: value}` to a peer
async fn reply(ep: &mut Endpoints<'_>, to: Role, value: Value) -> Result<()> {
    let channel = ep
        .channel(to)
        .ok_or_else(|| Error::ChannelClosed(to.to_string()))?;
    channel.send(&Message::ret(value)).await
}

/// Needle tags from a string or a list of strings
fn tags_of(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(tag)) => tag.split_whitespace().map(String::from).collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}
