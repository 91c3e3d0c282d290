//! Wire protocol (§6): newline-delimited JSON over both sockets.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::context::ExecutionContext;
use crate::error::{Result, SafeShellError};
use crate::rules::Action;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Evaluate,
    Ping,
    Status,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonRequest {
    #[serde(rename = "type")]
    pub kind: RequestType,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub execution_context: ExecutionContext,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EvaluationResult {
    pub decision: Action,
    pub plugin_name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DaemonResponse {
    pub success: bool,
    #[serde(default)]
    pub results: Vec<EvaluationResult>,
    pub final_decision: Action,
    pub should_execute: bool,
    pub denial_message: Option<String>,
    pub error_message: Option<String>,
    pub approval_pending: bool,
    pub approval_id: Option<String>,
    pub is_intermediate: bool,
    pub status_message: Option<String>,
    /// Set when the matched rule's action is `redirect`: the template
    /// the wrapper should substitute `$ARGS` into and execute instead of
    /// the original command. The daemon never rewrites or executes
    /// anything itself.
    pub redirect_to: Option<String>,
    /// Surfaced from the matched rule so the wrapper can offer a manual
    /// escalation path on denial. Does not itself change `should_execute`.
    pub allow_override: bool,
}

impl DaemonResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            final_decision: Action::Allow,
            should_execute: true,
            ..Default::default()
        }
    }

    pub fn allow() -> Self {
        Self::ok()
    }

    pub fn redirect(redirect_to: &str, rule_name: &str, reason: &str) -> Self {
        Self {
            success: true,
            results: vec![EvaluationResult {
                decision: Action::Redirect,
                plugin_name: rule_name.to_string(),
                reason: reason.to_string(),
            }],
            final_decision: Action::Redirect,
            should_execute: true,
            redirect_to: Some(redirect_to.to_string()),
            ..Default::default()
        }
    }

    pub fn deny(reason: &str, rule_name: &str) -> Self {
        Self::deny_with_override(reason, rule_name, false)
    }

    pub fn deny_with_override(reason: &str, rule_name: &str, allow_override: bool) -> Self {
        Self {
            success: true,
            results: vec![EvaluationResult {
                decision: Action::Deny,
                plugin_name: rule_name.to_string(),
                reason: reason.to_string(),
            }],
            final_decision: Action::Deny,
            should_execute: false,
            denial_message: Some(format_denial(reason, rule_name)),
            allow_override,
            ..Default::default()
        }
    }

    pub fn error(message: &str) -> Self {
        Self {
            success: false,
            error_message: Some(message.to_string()),
            ..Default::default()
        }
    }

    pub fn waiting_for_approval(command: &str, rule_name: &str, reason: &str, approval_id: &str) -> Self {
        Self {
            success: true,
            approval_pending: true,
            approval_id: Some(approval_id.to_string()),
            is_intermediate: true,
            status_message: Some(format!(
                "[SafeShell] Waiting for approval...\nCommand: {command}\nRule: {rule_name}\nReason: {reason}"
            )),
            ..Default::default()
        }
    }

    pub fn status(message: impl Into<String>) -> Self {
        Self {
            success: true,
            status_message: Some(message.into()),
            ..Default::default()
        }
    }
}

fn format_denial(reason: &str, rule_name: &str) -> String {
    format!(
        "[SafeShell] BLOCKED\nReason: {reason}\nPolicy: {rule_name}\n\n\
This operation has been intentionally prevented by SafeShell policy."
    )
}

// Monitor protocol ----------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorCommandType {
    Subscribe,
    Unsubscribe,
    Approve,
    Deny,
    Ping,
    SetEnabled,
    ReloadRules,
    GetStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorCommand {
    #[serde(rename = "type")]
    pub kind: MonitorCommandType,
    #[serde(default)]
    pub approval_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub remember: bool,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MonitorResponse {
    pub success: bool,
    pub message: Option<String>,
    pub error: Option<String>,
}

impl MonitorResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorEventFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub event: crate::events::Event,
}

impl MonitorEventFrame {
    pub fn new(event: crate::events::Event) -> Self {
        Self {
            kind: "event".to_string(),
            event,
        }
    }
}

// Framing helpers -------------------------------------------------

pub async fn read_line<R: tokio::io::AsyncRead + Unpin>(reader: &mut BufReader<R>) -> Result<String> {
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .await
        .map_err(|e| SafeShellError::Protocol(e.to_string()))?;
    if n == 0 {
        return Err(SafeShellError::Protocol("connection closed".to_string()));
    }
    Ok(line.trim_end_matches(['\n', '\r']).to_string())
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message)?;
    encoded.push(b'\n');
    writer
        .write_all(&encoded)
        .await
        .map_err(|e| SafeShellError::Protocol(e.to_string()))?;
    writer.flush().await.map_err(|e| SafeShellError::Protocol(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips() {
        let json = r#"{"type":"evaluate","command":"git status","working_dir":"/tmp","env":{},"execution_context":"human"}"#;
        let req: DaemonRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.kind, RequestType::Evaluate);
        assert_eq!(req.command.as_deref(), Some("git status"));
    }

    #[test]
    fn deny_response_carries_rule_and_reason() {
        let resp = DaemonResponse::deny("no commits on main", "block-commit");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("block-commit"));
        assert!(json.contains("no commits on main"));
        assert!(!resp.should_execute);
    }

    #[test]
    fn monitor_command_parses_approve() {
        let json = r#"{"type":"approve","approval_id":"abc","remember":true}"#;
        let cmd: MonitorCommand = serde_json::from_str(json).unwrap();
        assert_eq!(cmd.kind, MonitorCommandType::Approve);
        assert_eq!(cmd.approval_id.as_deref(), Some("abc"));
        assert!(cmd.remember);
    }

    #[tokio::test]
    async fn read_line_strips_newline() {
        let data = b"{\"type\":\"ping\"}\n".to_vec();
        let mut reader = BufReader::new(&data[..]);
        let line = read_line(&mut reader).await.unwrap();
        assert_eq!(line, r#"{"type":"ping"}"#);
    }

    #[tokio::test]
    async fn read_line_on_eof_is_protocol_error() {
        let data: Vec<u8> = vec![];
        let mut reader = BufReader::new(&data[..]);
        assert!(read_line(&mut reader).await.is_err());
    }
}
