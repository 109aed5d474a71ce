//! Event loop multiplexing the three peer channels
//!
//! One iteration waits for whichever comes first: a message from the test
//! runner, the command server or the backend, a child exit, a stop request,
//! or the screen-check deadline. After waking, every other channel that
//! already has a message gets one read as well, so a busy peer cannot starve
//! the others. Messages are handed to the [`CommandHandler`]; everything
//! else ends the loop.

use std::future::pending;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::ipc::{Channel, Received};
use crate::supervisor::process::{ProcessExit, Role};
use crate::supervisor::shutdown::ShutdownToken;

use super::handler::{CommandHandler, Endpoints, Flow};

/// Why the loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// The test runner reported completion
    TestsDone,
    /// A supervised process went away
    ProcessExited(Role),
    /// A channel reached end-of-stream or could not be written
    ReadFailure(String),
    /// Stop requested by a signal
    Cancelled,
}

impl LoopExit {
    /// A peer vanished underneath the run
    ///
    /// A cancelled run is judged by the shutdown, which fails it when the
    /// test runner is still connected.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::ProcessExited(_) | Self::ReadFailure(_))
    }
}

enum Event {
    Message(Role, Value),
    Closed(Role),
    Exited(ProcessExit),
    Cancelled,
    Tick,
}

impl Event {
    /// Channel the event was read from
    fn source(&self) -> Option<Role> {
        match self {
            Self::Message(role, _) | Self::Closed(role) => Some(*role),
            _ => None,
        }
    }
}

/// Run until the test runner is done or something goes wrong
pub async fn run_loop(
    handler: &mut CommandHandler,
    ep: &mut Endpoints<'_>,
    exits: &mut mpsc::UnboundedReceiver<ProcessExit>,
    token: &ShutdownToken,
) -> LoopExit {
    tracing::debug!("entering command loop");

    loop {
        let event = tokio::select! {
            biased;
            _ = token.stopping() => Event::Cancelled,
            msg = recv(&mut *ep.autotest) => event_for(Role::Autotest, msg),
            msg = recv(&mut *ep.command_server) => event_for(Role::CommandServer, msg),
            msg = ep.backend.output().receive() => event_for(Role::Backend, msg),
            Some(exit) = exits.recv() => Event::Exited(exit),
            _ = tick(handler.timeout()) => Event::Tick,
        };

        let woke_on = event.source();
        if let Some(exit) = dispatch(handler, ep, event).await {
            return exit;
        }

        for role in Role::ALL {
            if Some(role) == woke_on {
                continue;
            }
            let Some(event) = ready(ep, role) else {
                continue;
            };
            if let Some(exit) = dispatch(handler, ep, event).await {
                return exit;
            }
        }

        if let Err(e) = handler.check_asserted_screen(ep, Instant::now()).await {
            tracing::error!("{}", e);
            return LoopExit::ReadFailure(e.to_string());
        }
    }
}

/// Handle one event; `Some` ends the loop
async fn dispatch(handler: &mut CommandHandler, ep: &mut Endpoints<'_>, event: Event) -> Option<LoopExit> {
    match event {
        Event::Message(Role::Backend, message) => {
            if let Err(e) = handler.route_backend_reply(message, ep).await {
                if e.is_disconnect() {
                    tracing::error!("{}", e);
                    return Some(LoopExit::ReadFailure(e.to_string()));
                }
                tracing::warn!("unable to route backend reply: {}", e);
            }
        }
        Event::Message(role, message) => match handler.process_command(role, message, ep).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Stop) => return Some(LoopExit::TestsDone),
            Err(e) if e.is_disconnect() => {
                tracing::error!("{}", e);
                return Some(LoopExit::ReadFailure(e.to_string()));
            }
            Err(e) => tracing::warn!(peer = %role, "command failed: {}", e),
        },
        Event::Closed(role) => {
            tracing::error!("{} closed its channel unexpectedly", role);
            return Some(LoopExit::ReadFailure(role.to_string()));
        }
        Event::Exited(exit) => {
            tracing::error!(pid = exit.pid, "{} exited during the test run", exit.role);
            return Some(LoopExit::ProcessExited(exit.role));
        }
        Event::Cancelled => {
            tracing::info!("stop requested, leaving command loop");
            return Some(LoopExit::Cancelled);
        }
        Event::Tick => {}
    }
    None
}

/// A message that is already waiting on `role`'s channel
fn ready(ep: &mut Endpoints<'_>, role: Role) -> Option<Event> {
    match ep.channel(role)?.try_receive()? {
        Received::Message(message) => Some(Event::Message(role, message)),
        Received::Closed => Some(Event::Closed(role)),
    }
}

fn event_for(role: Role, message: Option<Value>) -> Event {
    match message {
        Some(message) => Event::Message(role, message),
        None => Event::Closed(role),
    }
}

/// Next message of an optional channel; never resolves for a missing one
async fn recv(channel: &mut Option<Channel>) -> Option<Value> {
    match channel {
        Some(channel) => channel.receive().await,
        None => pending().await,
    }
}

async fn tick(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::FakeBackend;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    fn channel(name: &str) -> (Option<Channel>, DuplexStream) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(local);
        (Some(Channel::new(name, reader, writer)), remote)
    }

    async fn send(remote: &mut DuplexStream, value: Value) {
        remote
            .write_all(format!("{value}\n").as_bytes())
            .await
            .unwrap();
    }

    async fn run(
        autotest: &mut Option<Channel>,
        command_server: &mut Option<Channel>,
        backend: &mut FakeBackend,
        exits: &mut mpsc::UnboundedReceiver<ProcessExit>,
        token: &ShutdownToken,
    ) -> LoopExit {
        let mut handler = CommandHandler::new();
        let mut ep = Endpoints {
            autotest,
            command_server,
            backend,
        };
        tokio::time::timeout(
            Duration::from_secs(5),
            run_loop(&mut handler, &mut ep, exits, token),
        )
        .await
        .expect("loop did not finish")
    }

    #[tokio::test]
    async fn test_tests_done_ends_loop() {
        let (mut autotest, mut autotest_remote) = channel("autotest");
        let (mut command_server, _cs_remote) = channel("command server");
        let (mut backend, _backend_remote) = FakeBackend::new("qemu");
        let (_tx, mut exits) = mpsc::unbounded_channel();
        let token = ShutdownToken::new();

        send(&mut autotest_remote, json!({"cmd": "set_current_test", "name": "boot"})).await;
        send(&mut autotest_remote, json!({"cmd": "tests_done", "completed": 1})).await;

        let exit = run(&mut autotest, &mut command_server, &mut backend, &mut exits, &token).await;
        assert_eq!(exit, LoopExit::TestsDone);
        assert!(autotest.is_none());
    }

    #[tokio::test]
    async fn test_busy_test_runner_does_not_starve_command_server() {
        let (mut autotest, mut autotest_remote) = channel("autotest");
        let (mut command_server, cs_remote) = channel("command server");
        let (mut backend, _backend_remote) = FakeBackend::new("qemu");
        let (_tx, mut exits) = mpsc::unbounded_channel();
        let token = ShutdownToken::new();

        for n in 0..20 {
            send(&mut autotest_remote, json!({"cmd": "set_current_test", "name": format!("test{n}")})).await;
        }
        send(&mut autotest_remote, json!({"cmd": "tests_done", "completed": 1})).await;
        let (cs_reader, mut cs_writer) = tokio::io::split(cs_remote);
        cs_writer.write_all(b"{\"cmd\":\"status\"}\n").await.unwrap();

        // Let both pumps decode their input before the loop starts
        tokio::time::sleep(Duration::from_millis(50)).await;

        let exit = run(&mut autotest, &mut command_server, &mut backend, &mut exits, &token).await;
        assert_eq!(exit, LoopExit::TestsDone);

        let mut lines = BufReader::new(cs_reader).lines();
        let mut status = None;
        for position in 0..21 {
            let line = tokio::time::timeout(Duration::from_secs(1), lines.next_line())
                .await
                .expect("command server got no status reply")
                .unwrap()
                .unwrap();
            let message: Value = serde_json::from_str(&line).unwrap();
            if message.get("ret").is_some() {
                status = Some((position, message));
                break;
            }
        }

        let (position, reply) = status.expect("status was never answered");
        // Answered in the first iteration, right after the first broadcast
        assert_eq!(position, 1);
        assert_eq!(reply["ret"]["current_test"], "test0");
    }

    #[tokio::test]
    async fn test_peer_eof_is_a_read_failure() {
        let (mut autotest, autotest_remote) = channel("autotest");
        let (mut command_server, _cs_remote) = channel("command server");
        let (mut backend, _backend_remote) = FakeBackend::new("qemu");
        let (_tx, mut exits) = mpsc::unbounded_channel();
        let token = ShutdownToken::new();
        drop(autotest_remote);

        let exit = run(&mut autotest, &mut command_server, &mut backend, &mut exits, &token).await;
        assert_eq!(exit, LoopExit::ReadFailure("autotest".to_string()));
    }

    #[tokio::test]
    async fn test_child_exit_ends_loop() {
        let (mut autotest, _autotest_remote) = channel("autotest");
        let (mut command_server, _cs_remote) = channel("command server");
        let (mut backend, _backend_remote) = FakeBackend::new("qemu");
        let (tx, mut exits) = mpsc::unbounded_channel();
        let token = ShutdownToken::new();

        tx.send(ProcessExit {
            role: Role::CommandServer,
            pid: 4711,
            status: None,
        })
        .unwrap();

        let exit = run(&mut autotest, &mut command_server, &mut backend, &mut exits, &token).await;
        assert_eq!(exit, LoopExit::ProcessExited(Role::CommandServer));
    }

    #[tokio::test]
    async fn test_stop_request_cancels_loop() {
        let (mut autotest, _autotest_remote) = channel("autotest");
        let (mut command_server, _cs_remote) = channel("command server");
        let (mut backend, _backend_remote) = FakeBackend::new("qemu");
        let (_tx, mut exits) = mpsc::unbounded_channel();
        let token = ShutdownToken::new();
        token.escalate();

        let exit = run(&mut autotest, &mut command_server, &mut backend, &mut exits, &token).await;
        assert_eq!(exit, LoopExit::Cancelled);
        assert!(!exit.is_failure());
    }

    #[tokio::test]
    async fn test_backend_reply_reaches_test_runner() {
        let (mut autotest, autotest_remote) = channel("autotest");
        let (mut command_server, _cs_remote) = channel("command server");
        let (mut backend, mut backend_remote) = FakeBackend::new("qemu");
        let (_tx, mut exits) = mpsc::unbounded_channel();
        let token = ShutdownToken::new();

        let (runner_reader, mut runner_writer) = tokio::io::split(autotest_remote);
        let runner = tokio::spawn(async move {
            let mut lines = BufReader::new(runner_reader).lines();
            runner_writer
                .write_all(b"{\"cmd\":\"backend_get_info\"}\n")
                .await
                .unwrap();
            let ret: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
            runner_writer
                .write_all(b"{\"cmd\":\"tests_done\",\"completed\":1}\n")
                .await
                .unwrap();
            (ret, runner_writer)
        });

        // FakeBackend hands out sequential tokens
        send(&mut backend_remote, json!({"rsp": {"arch": "x86_64"}, "json_cmd_token": "t1"})).await;

        let exit = run(&mut autotest, &mut command_server, &mut backend, &mut exits, &token).await;
        assert_eq!(exit, LoopExit::TestsDone);

        let (ret, _writer) = runner.await.unwrap();
        assert_eq!(ret, json!({"ret": {"arch": "x86_64"}}));
        assert_eq!(backend.forwarded[0].0, "get_info");
    }

    #[tokio::test]
    async fn test_screen_check_result_is_delivered() {
        let (mut autotest, autotest_remote) = channel("autotest");
        let (mut command_server, _cs_remote) = channel("command server");
        let (mut backend, _backend_remote) = FakeBackend::new("qemu");
        backend.reply("check_asserted_screen", Ok(json!({})));
        backend.reply("check_asserted_screen", Ok(json!({"found": {"needle": "desktop"}})));
        let (_tx, mut exits) = mpsc::unbounded_channel();
        let token = ShutdownToken::new();

        let (runner_reader, mut runner_writer) = tokio::io::split(autotest_remote);
        let runner = tokio::spawn(async move {
            let mut lines = BufReader::new(runner_reader).lines();
            runner_writer
                .write_all(b"{\"cmd\":\"check_screen\",\"mustmatch\":\"desktop\"}\n")
                .await
                .unwrap();
            let ret: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
            runner_writer
                .write_all(b"{\"cmd\":\"tests_done\",\"completed\":1}\n")
                .await
                .unwrap();
            (ret, runner_writer)
        });

        let exit = run(&mut autotest, &mut command_server, &mut backend, &mut exits, &token).await;
        assert_eq!(exit, LoopExit::TestsDone);

        let (ret, _writer) = runner.await.unwrap();
        assert_eq!(ret["ret"]["found"]["needle"], "desktop");
        assert_eq!(ret["ret"]["tags"], json!(["desktop"]));
        // One immediate check, one after the throttle interval
        assert_eq!(backend.calls_to("check_asserted_screen"), 2);
    }
}
