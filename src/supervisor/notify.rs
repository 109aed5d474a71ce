//! Broadcast to the command server's websocket clients
//!
//! Before the command server is stopped at the end of a run, its clients
//! are told that test execution is stopping. The call is bounded and any
//! failure is only reported back to the caller for logging.

use std::time::Duration;

use serde_json::json;

use crate::common::{Error, Result};

/// Broadcast endpoint of the command server
pub fn broadcast_url(port: u16, job_token: Option<&str>) -> String {
    match job_token {
        Some(token) if !token.is_empty() => format!("http://127.0.0.1:{port}/{token}/broadcast"),
        _ => format!("http://127.0.0.1:{port}/broadcast"),
    }
}

/// POST `{stopping_test_execution: reason}` to the broadcast endpoint
pub async fn notify_stopping(url: &str, reason: &str, timeout: Duration) -> Result<()> {
    let client = reqwest::Client::builder()
        .no_proxy()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Notification(e.to_string()))?;

    let response = client
        .post(url)
        .json(&json!({ "stopping_test_execution": reason }))
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                Error::Notification(format!("Request timeout after {:?}", timeout))
            } else {
                Error::Notification(e.to_string())
            }
        })?;

    if response.status() != reqwest::StatusCode::OK {
        return Err(Error::Notification(format!(
            "command server answered {}",
            response.status()
        )));
    }

    Ok(())
}
