//! Mock peer binary for integration testing
//!
//! Plays one of the three children of a run over line-delimited JSON on
//! stdin/stdout, selected by the first argument:
//!
//! - `backend`: answers backend calls, `MOCK_IS_SHUTDOWN=1` makes the
//!   machine report a clean shutdown
//! - `autotest`: runs a short scripted test and reports completion, or with
//!   `MOCK_AUTOTEST=hang` starts a test and then waits to be stopped
//! - `command-server`: records what it is told and answers the broadcast
//!   endpoint on `VMTEST_CMD_SRV_PORT`; `MOCK_SLOW_BROADCAST=1` delays the
//!   answer
//!
//! Every peer appends what it observes to the file named by `MOCK_LOG`.

use serde_json::{json, Value};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;

fn main() {
    let mode = std::env::args().nth(1).unwrap_or_default();
    match mode.as_str() {
        "backend" => backend(),
        "autotest" => autotest(),
        "command-server" => command_server(),
        other => {
            eprintln!("mock_peer: unknown mode '{other}'");
            std::process::exit(2);
        }
    }
}

/// Keep running on SIGTERM so the end of input is always recorded
fn ignore_sigterm() {
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGTERM, libc::SIG_IGN);
    }
}

/// Append one line to the shared observation log
fn record(line: &str) {
    let Ok(path) = std::env::var("MOCK_LOG") else {
        return;
    };
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        file.write_all(format!("{line}\n").as_bytes()).ok();
    }
}

fn send<W: Write>(writer: &mut W, message: &Value) {
    writer.write_all(format!("{message}\n").as_bytes()).ok();
    writer.flush().ok();
}

fn read_message<R: BufRead>(reader: &mut R) -> Option<Value> {
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap_or(0) == 0 {
            return None;
        }
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(value) = serde_json::from_str(&line) {
            return Some(value);
        }
    }
}

fn backend() {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut reader = BufReader::new(stdin.lock());
    let mut writer = stdout.lock();
    let is_shutdown = std::env::var("MOCK_IS_SHUTDOWN").is_ok_and(|v| v == "1");

    while let Some(request) = read_message(&mut reader) {
        let cmd = request["cmd"].as_str().unwrap_or_default().to_string();
        let arguments = request.get("arguments").cloned().unwrap_or(Value::Null);
        record(&format!("backend {cmd} {arguments}"));

        let rsp = match cmd.as_str() {
            "alive" => json!(false),
            "start_vm" | "stop_vm" => json!(true),
            "set_tags_to_assert" => json!({ "tags": arguments.get("mustmatch") }),
            "check_asserted_screen" => json!({ "found": { "needle": "desktop" } }),
            "is_shutdown" => json!(is_shutdown),
            "extract_asset" => json!(true),
            "get_info" => json!({ "backend": "mock" }),
            other => json!({ "echo": other }),
        };
        send(
            &mut writer,
            &json!({ "rsp": rsp, "json_cmd_token": request["json_cmd_token"] }),
        );
    }
}

fn autotest() {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut reader = BufReader::new(stdin.lock());
    let mut writer = stdout.lock();

    send(
        &mut writer,
        &json!({ "cmd": "set_current_test", "name": "boot", "full_name": "tests/boot" }),
    );

    if std::env::var("MOCK_AUTOTEST").is_ok_and(|v| v == "hang") {
        ignore_sigterm();
        record("autotest waiting");
        while read_message(&mut reader).is_some() {}
        record("autotest stopped");
        return;
    }

    send(&mut writer, &json!({ "cmd": "backend_get_info" }));
    let Some(info) = read_message(&mut reader) else {
        return;
    };
    record(&format!("autotest {info}"));

    send(
        &mut writer,
        &json!({ "cmd": "check_screen", "mustmatch": "desktop", "timeout": 30 }),
    );
    let Some(result) = read_message(&mut reader) else {
        return;
    };
    record(&format!("autotest {result}"));

    send(&mut writer, &json!({ "cmd": "tests_done", "died": 0, "completed": 1 }));

    // Wait for the orchestrator to close our input
    while read_message(&mut reader).is_some() {}
}

fn command_server() {
    ignore_sigterm();
    if let Some(port) = std::env::var("VMTEST_CMD_SRV_PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
    {
        if let Ok(listener) = TcpListener::bind(("127.0.0.1", port)) {
            std::thread::spawn(move || serve_broadcast(listener));
        }
    }

    let stdin = std::io::stdin();
    let mut reader = BufReader::new(stdin.lock());
    while let Some(message) = read_message(&mut reader) {
        record(&format!("command_server {message}"));
    }
    record("command_server stopped");
}

/// Answer every HTTP request with 200 and record its body
fn serve_broadcast(listener: TcpListener) {
    let slow = std::env::var("MOCK_SLOW_BROADCAST").is_ok_and(|v| v == "1");
    for stream in listener.incoming() {
        let Ok(mut stream) = stream else {
            continue;
        };

        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf).unwrap_or(0);
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
            if let Some(body) = complete_body(&request) {
                record(&format!("broadcast {body}"));
                break;
            }
        }

        if slow {
            std::thread::sleep(std::time::Duration::from_secs(20));
        }
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .ok();
    }
}

/// Body of a request once headers and `Content-Length` bytes are in
fn complete_body(request: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(request);
    let (head, body) = text.split_once("\r\n\r\n")?;
    let length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    (body.len() >= length).then(|| body.to_string())
}
