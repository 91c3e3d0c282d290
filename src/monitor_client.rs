//! Monitor Client (C8): observes daemon events and issues approve/deny
//! and admin commands over the monitor socket.

use std::sync::Arc;

use serde_json::Value;
use tokio::io::BufReader;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex};

use crate::daemon::protocol::{
    read_line, write_message, MonitorCommand, MonitorCommandType, MonitorEventFrame, MonitorResponse,
};
use crate::error::{Result, SafeShellError};
use crate::events::Event;
use crate::paths;

enum Incoming {
    Event(Event),
    Response(MonitorResponse),
}

fn parse_incoming(line: &str) -> Result<Incoming> {
    let value: Value = serde_json::from_str(line)?;
    if value.get("type").and_then(Value::as_str) == Some("event") {
        let frame: MonitorEventFrame = serde_json::from_value(value)?;
        Ok(Incoming::Event(frame.event))
    } else {
        let response: MonitorResponse = serde_json::from_value(value)?;
        Ok(Incoming::Response(response))
    }
}

/// Holds the write half and a channel fed by a background reader task
/// that demultiplexes unsolicited events (dispatched to the caller's
/// callback) from command responses (handed back to `send`).
pub struct MonitorClient {
    write_half: Mutex<OwnedWriteHalf>,
    responses: Mutex<mpsc::UnboundedReceiver<MonitorResponse>>,
}

impl MonitorClient {
    pub async fn connect<F>(on_event: F) -> Result<Self>
    where
        F: Fn(Event) -> bool + Send + Sync + 'static,
    {
        let stream = UnixStream::connect(paths::monitor_socket_path()).await?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        // Welcome frame confirms the connection before any commands flow.
        let welcome_line = read_line(&mut reader).await?;
        let _welcome: MonitorResponse = serde_json::from_str(&welcome_line)?;

        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let on_event = Arc::new(on_event);

        tokio::spawn(async move {
            loop {
                let line = match read_line(&mut reader).await {
                    Ok(line) => line,
                    Err(_) => break,
                };
                match parse_incoming(&line) {
                    Ok(Incoming::Event(event)) => {
                        let callback = on_event.clone();
                        let outcome =
                            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(event)));
                        if outcome.is_err() {
                            tracing::warn!("monitor event callback panicked, isolating");
                        }
                    }
                    Ok(Incoming::Response(response)) => {
                        if response_tx.send(response).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to parse monitor frame"),
                }
            }
        });

        Ok(Self {
            write_half: Mutex::new(write_half),
            responses: Mutex::new(response_rx),
        })
    }

    async fn send(&self, command: MonitorCommand) -> Result<MonitorResponse> {
        {
            let mut writer = self.write_half.lock().await;
            write_message(&mut *writer, &command).await?;
        }
        let mut responses = self.responses.lock().await;
        responses
            .recv()
            .await
            .ok_or_else(|| SafeShellError::Protocol("monitor connection closed".to_string()))
    }

    pub async fn approve(&self, approval_id: &str, remember: bool) -> Result<MonitorResponse> {
        self.send(MonitorCommand {
            kind: MonitorCommandType::Approve,
            approval_id: Some(approval_id.to_string()),
            reason: None,
            remember,
            enabled: None,
        })
        .await
    }

    pub async fn deny(&self, approval_id: &str, reason: Option<String>, remember: bool) -> Result<MonitorResponse> {
        self.send(MonitorCommand {
            kind: MonitorCommandType::Deny,
            approval_id: Some(approval_id.to_string()),
            reason,
            remember,
            enabled: None,
        })
        .await
    }

    pub async fn set_enabled(&self, enabled: bool) -> Result<MonitorResponse> {
        self.send(MonitorCommand {
            kind: MonitorCommandType::SetEnabled,
            approval_id: None,
            reason: None,
            remember: false,
            enabled: Some(enabled),
        })
        .await
    }

    pub async fn reload_rules(&self) -> Result<MonitorResponse> {
        self.send(MonitorCommand {
            kind: MonitorCommandType::ReloadRules,
            approval_id: None,
            reason: None,
            remember: false,
            enabled: None,
        })
        .await
    }

    pub async fn get_status(&self) -> Result<MonitorResponse> {
        self.send(MonitorCommand {
            kind: MonitorCommandType::GetStatus,
            approval_id: None,
            reason: None,
            remember: false,
            enabled: None,
        })
        .await
    }

    pub async fn ping(&self) -> Result<MonitorResponse> {
        self.send(MonitorCommand {
            kind: MonitorCommandType::Ping,
            approval_id: None,
            reason: None,
            remember: false,
            enabled: None,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incoming_event_frame_is_distinguished_from_response() {
        let event_line = r#"{"type":"event","event":{"type":"daemon_status","timestamp":"2024-01-01T00:00:00Z","data":{}}}"#;
        assert!(matches!(parse_incoming(event_line).unwrap(), Incoming::Event(_)));

        let response_line = r#"{"success":true,"message":"pong","error":null}"#;
        assert!(matches!(parse_incoming(response_line).unwrap(), Incoming::Response(_)));
    }
}
