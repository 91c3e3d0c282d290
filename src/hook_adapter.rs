//! External Hook Adapter (§4.8): bridges an AI assistant's pre-command
//! hook protocol to the daemon. Every ambiguity fails open — a hook
//! that can't be trusted to check correctly must never be the thing
//! that silently stalls the assistant.

use std::io::Read;

use serde::Deserialize;

use crate::config::Config;
use crate::paths;

#[derive(Debug, Deserialize)]
struct HookInput {
    #[serde(default)]
    tool_name: Option<String>,
    #[serde(default)]
    tool_input: Option<ToolInput>,
}

#[derive(Debug, Deserialize)]
struct ToolInput {
    #[serde(default)]
    command: Option<String>,
}

/// Reads one hook invocation from stdin and returns the process exit
/// code the host should use: 0 to allow, 2 to block.
pub async fn run() -> i32 {
    let mut input = String::new();
    if std::io::stdin().read_to_string(&mut input).is_err() {
        return 0;
    }

    let hook: HookInput = match serde_json::from_str(&input) {
        Ok(hook) => hook,
        Err(_) => return 0,
    };

    if hook.tool_name.as_deref() != Some("Bash") {
        return 0;
    }

    let Some(command) = hook.tool_input.and_then(|t| t.command) else {
        return 0;
    };
    if command.trim().is_empty() {
        return 0;
    }

    if !paths::request_socket_path().exists() {
        return 0;
    }

    let config = Config::load(&paths::config_path()).unwrap_or_default();
    match crate::wrapper::evaluate(&command, &config).await {
        Ok(outcome) if outcome.should_execute => 0,
        Ok(outcome) => {
            if let Some(message) = outcome.denial_message {
                eprintln!("{message}");
            }
            2
        }
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_bash_tool_parses_but_is_ignored() {
        let raw = r#"{"tool_name":"Read","tool_input":{"file_path":"x"}}"#;
        let hook: HookInput = serde_json::from_str(raw).unwrap();
        assert_ne!(hook.tool_name.as_deref(), Some("Bash"));
    }

    #[test]
    fn bash_tool_extracts_command() {
        let raw = r#"{"tool_name":"Bash","tool_input":{"command":"git status"}}"#;
        let hook: HookInput = serde_json::from_str(raw).unwrap();
        assert_eq!(hook.tool_name.as_deref(), Some("Bash"));
        assert_eq!(hook.tool_input.unwrap().command.as_deref(), Some("git status"));
    }
}
