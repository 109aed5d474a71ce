//! End-to-end tests for the orchestrator binary
//!
//! Each test runs `vmtest` with `mock_peer` playing the backend, the
//! command server and the test runner, then checks the exit status and
//! what the peers observed.

use std::fs;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::time::{Duration, Instant};

/// Test context with a private working directory
struct TestContext {
    dir: tempfile::TempDir,
    config: PathBuf,
    log: PathBuf,
    base_port: u16,
}

impl TestContext {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = dir.path().join("config.toml");
        let log = dir.path().join("peers.log");

        Self {
            config,
            log,
            base_port: free_port() - 1,
            dir,
        }
    }

    fn workdir(&self) -> &Path {
        self.dir.path()
    }

    /// Config with every child played by mock_peer
    fn write_config(&self, with_autotest: bool) {
        let peer = env!("CARGO_BIN_EXE_mock_peer");
        let mut config = format!(
            r#"
[processes.command_server]
path = "{peer}"
args = ["command-server"]

[backends.qemu]
path = "{peer}"
args = ["backend"]

[timeouts]
notify_secs = 5
stop_grace_secs = 2
backend_call_secs = 10
"#
        );
        if with_autotest {
            config.push_str(&format!(
                r#"
[processes.autotest]
path = "{peer}"
args = ["autotest"]
"#
            ));
        }
        fs::write(&self.config, config).expect("Failed to write config");
    }

    fn write_vars(&self, vars: serde_json::Value) {
        fs::write(self.workdir().join("vars.json"), vars.to_string()).expect("Failed to write vars");
    }

    fn command(&self, is_shutdown: bool) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_vmtest"));
        cmd.arg("--config")
            .arg(&self.config)
            .arg("--workdir")
            .arg(self.workdir())
            .arg(format!("QEMUPORT={}", self.base_port))
            .env("MOCK_LOG", &self.log)
            .env("MOCK_IS_SHUTDOWN", if is_shutdown { "1" } else { "0" })
            .env("RUST_LOG", "vmtest=debug");
        cmd
    }

    /// Run vmtest to completion
    fn run(&self, is_shutdown: bool) -> Output {
        self.command(is_shutdown)
            .output()
            .expect("Failed to run vmtest")
    }

    /// Start vmtest in the background with extra peer settings
    fn spawn(&self, env: &[(&str, &str)]) -> Child {
        self.command(true)
            .envs(env.iter().copied())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("Failed to start vmtest")
    }

    /// Wait until a peer has logged a line containing `needle`
    fn wait_for_log(&self, needle: &str) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if self.log_lines().iter().any(|l| l.contains(needle)) {
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("no '{needle}' in peer log: {:?}", self.log_lines());
    }

    /// Pid vmtest recorded in its working directory
    fn recorded_pid(&self) -> i32 {
        fs::read_to_string(self.workdir().join("vmtest.pid"))
            .expect("pid file missing")
            .trim()
            .parse()
            .expect("pid file is not a number")
    }

    fn position(&self, needle: &str) -> usize {
        self.log_lines()
            .iter()
            .position(|l| l.contains(needle))
            .unwrap_or_else(|| panic!("no '{needle}' in peer log: {:?}", self.log_lines()))
    }

    fn log_lines(&self) -> Vec<String> {
        fs::read_to_string(&self.log)
            .unwrap_or_default()
            .lines()
            .map(String::from)
            .collect()
    }

    fn backend_calls(&self, cmd: &str) -> Vec<String> {
        let prefix = format!("backend {cmd} ");
        self.log_lines()
            .into_iter()
            .filter(|line| line.starts_with(&prefix))
            .collect()
    }
}

/// A port nothing listens on right now
fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
    listener.local_addr().expect("No local address").port()
}

#[cfg(unix)]
fn send_signal(pid: i32, signal: libc::c_int) {
    let rc = unsafe { libc::kill(pid, signal) };
    assert_eq!(rc, 0, "Failed to signal vmtest");
}

/// Wait for `child` to exit, giving up after `limit`
fn wait_within(child: &mut Child, limit: Duration) -> Option<Duration> {
    let start = Instant::now();
    while start.elapsed() < limit {
        if child.try_wait().expect("Failed to poll vmtest").is_some() {
            return Some(start.elapsed());
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    None
}

fn exit_line(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .last()
        .unwrap_or_default()
        .to_string()
}

#[test]
fn test_completed_run_extracts_stored_disk() {
    let ctx = TestContext::new();
    ctx.write_config(true);
    ctx.write_vars(serde_json::json!({"NUMDISKS": "1", "STORE_HDD_1": "disk.qcow2"}));

    let output = ctx.run(true);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert_eq!(output.status.code(), Some(0), "stderr:\n{stderr}");
    assert!(exit_line(&output).ends_with(": EXIT 0"));

    let extractions = ctx.backend_calls("extract_asset");
    assert_eq!(extractions.len(), 1, "log: {:?}", ctx.log_lines());
    assert!(extractions[0].contains("\"dir\":\"assets_private\""));
    assert!(extractions[0].contains("\"name\":\"disk.qcow2\""));

    // The machine was started because it was not alive, and stopped at the end
    assert_eq!(ctx.backend_calls("start_vm").len(), 1);
    assert_eq!(ctx.backend_calls("stop_vm").len(), 1);

    let log = ctx.log_lines();
    assert!(log.iter().any(|l| l.starts_with("autotest") && l.contains("\"backend\":\"mock\"")));
    assert!(log.iter().any(|l| l.starts_with("autotest") && l.contains("\"needle\":\"desktop\"")));
    assert!(log.iter().any(|l| l.starts_with("command_server") && l.contains("set_current_test")));
    assert!(log
        .iter()
        .any(|l| l.starts_with("broadcast") && l.contains("test execution ended")));
}

#[test]
fn test_unclean_shutdown_skips_extraction() {
    let ctx = TestContext::new();
    ctx.write_config(true);
    ctx.write_vars(serde_json::json!({"NUMDISKS": "1", "STORE_HDD_1": "disk.qcow2"}));

    let output = ctx.run(false);

    assert_eq!(output.status.code(), Some(1));
    assert!(exit_line(&output).ends_with(": EXIT 1"));
    assert!(ctx.backend_calls("extract_asset").is_empty());
    assert_eq!(ctx.backend_calls("is_shutdown").len(), 1);
}

#[test]
fn test_run_files_are_written() {
    let ctx = TestContext::new();
    ctx.write_config(true);
    ctx.write_vars(serde_json::json!({"DISTRI": "example"}));

    let output = ctx.run(true);
    assert_eq!(output.status.code(), Some(0));

    let pid = fs::read_to_string(ctx.workdir().join("vmtest.pid")).expect("pid file missing");
    assert!(pid.trim().parse::<u32>().is_ok());

    let vars: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(ctx.workdir().join("vars.json")).unwrap()).unwrap();
    assert_eq!(vars["DISTRI"], "example");
    assert_eq!(vars["QEMUPORT"], ctx.base_port.to_string());
}

#[test]
fn test_missing_test_runner_fails() {
    let ctx = TestContext::new();
    ctx.write_config(false);

    let output = ctx.run(true);

    assert_eq!(output.status.code(), Some(1));
    assert!(exit_line(&output).ends_with(": EXIT 1"));
    assert!(!ctx.workdir().join("vmtest.pid").exists());
    // The backend was started and is torn down again
    assert_eq!(ctx.backend_calls("start_vm").len(), 1);
}

#[cfg(unix)]
#[test]
fn test_signal_stops_run_in_order() {
    let ctx = TestContext::new();
    ctx.write_config(true);
    ctx.write_vars(serde_json::json!({"NUMDISKS": "1", "STORE_HDD_1": "disk.qcow2"}));

    let mut child = ctx.spawn(&[("MOCK_AUTOTEST", "hang")]);
    ctx.wait_for_log("set_current_test");
    let pid = ctx.recorded_pid();
    assert_eq!(pid as u32, child.id());

    send_signal(pid, libc::SIGTERM);
    if wait_within(&mut child, Duration::from_secs(20)).is_none() {
        child.kill().ok();
        panic!("vmtest did not stop after SIGTERM: {:?}", ctx.log_lines());
    }
    let output = child.wait_with_output().expect("Failed to collect vmtest");

    // The test runner never reported completion
    assert_eq!(output.status.code(), Some(1));
    assert!(exit_line(&output).ends_with(": EXIT 1"));
    assert!(ctx.backend_calls("extract_asset").is_empty());

    // Broadcast, then command server, then test runner, then the machine
    let broadcast = ctx.position("broadcast");
    assert!(ctx.log_lines()[broadcast].contains("test execution ended"));
    let command_server = ctx.position("command_server stopped");
    let autotest = ctx.position("autotest stopped");
    let stop_vm = ctx.position("backend stop_vm");
    assert!(broadcast < command_server, "log: {:?}", ctx.log_lines());
    assert!(command_server < autotest, "log: {:?}", ctx.log_lines());
    assert!(autotest < stop_vm, "log: {:?}", ctx.log_lines());
}

#[cfg(unix)]
#[test]
fn test_second_signal_terminates_immediately() {
    let ctx = TestContext::new();
    ctx.write_config(true);

    let mut child = ctx.spawn(&[("MOCK_AUTOTEST", "hang"), ("MOCK_SLOW_BROADCAST", "1")]);
    ctx.wait_for_log("set_current_test");
    let pid = ctx.recorded_pid();

    // The ordered stop hangs in the broadcast until the second signal
    send_signal(pid, libc::SIGTERM);
    ctx.wait_for_log("broadcast");
    send_signal(pid, libc::SIGTERM);

    let Some(elapsed) = wait_within(&mut child, Duration::from_secs(10)) else {
        child.kill().ok();
        panic!("vmtest did not exit after the second signal");
    };
    // Well within the 5 s the broadcast is allowed to take
    assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");

    let output = child.wait_with_output().expect("Failed to collect vmtest");
    assert_eq!(output.status.code(), Some(1));
    assert!(exit_line(&output).ends_with(": EXIT 1"));

    let broadcasts = ctx
        .log_lines()
        .iter()
        .filter(|l| l.starts_with("broadcast"))
        .count();
    assert_eq!(broadcasts, 1);
    assert!(ctx.backend_calls("stop_vm").is_empty());
}
