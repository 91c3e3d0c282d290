//! Wrapper Client (C7): the shell-replacement binary that asks the
//! daemon whether to run a command before actually running it.

use std::collections::HashMap;
use std::process::Command as StdCommand;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::UnixStream;

use crate::config::{Config, UnreachableBehavior};
use crate::context::ExecutionContext;
use crate::daemon::protocol::{read_line, write_message, DaemonRequest, DaemonResponse, RequestType};
use crate::error::Result;
use crate::paths;

/// Set by a command SafeShell itself ran, to prevent the wrapper from
/// recursively re-evaluating its own delegate-shell invocation.
const BYPASS_ENV: &str = "SAFESHELL_BYPASS";
const CONTEXT_ENV: &str = "SAFESHELL_CONTEXT";
const WARP_AI_ENV: &str = "WARP_AI_AGENT";

/// Centralizes the "who is running this" guess so every caller agrees:
/// an explicit `SAFESHELL_CONTEXT=ai` wins, then known agent-specific
/// environment markers, else assume a human typed it.
pub fn detect_execution_context() -> ExecutionContext {
    if std::env::var(CONTEXT_ENV).as_deref() == Ok("ai") {
        return ExecutionContext::Ai;
    }
    if std::env::var(WARP_AI_ENV).as_deref() == Ok("1") {
        return ExecutionContext::Ai;
    }
    ExecutionContext::Human
}

pub struct EvaluationOutcome {
    pub should_execute: bool,
    pub effective_command: String,
    pub denial_message: Option<String>,
}

/// Sends one evaluate request and drains intermediate status messages
/// (approval waits) until the final response arrives.
pub async fn evaluate(command: &str, config: &Config) -> Result<EvaluationOutcome> {
    if std::env::var(BYPASS_ENV).as_deref() == Ok("1") {
        return Ok(EvaluationOutcome {
            should_execute: true,
            effective_command: command.to_string(),
            denial_message: None,
        });
    }

    let working_dir = std::env::current_dir().unwrap_or_default();
    let env: HashMap<String, String> = std::env::vars().collect();
    let execution_context = detect_execution_context();
    let socket_path = paths::request_socket_path();

    let stream = match tokio::time::timeout(Duration::from_secs(5), UnixStream::connect(&socket_path)).await {
        Ok(Ok(stream)) => stream,
        _ => return Ok(unreachable_outcome(command, config)),
    };

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let request = DaemonRequest {
        kind: RequestType::Evaluate,
        command: Some(command.to_string()),
        working_dir: Some(working_dir.to_string_lossy().to_string()),
        env,
        execution_context,
    };
    write_message(&mut write_half, &request).await?;

    // Generous ceiling so a command pending human approval isn't cut off
    // by a client-side timeout shorter than the daemon's own.
    let read_timeout = Duration::from_secs_f64(config.approval_timeout_seconds * 2.0);

    loop {
        let line = match tokio::time::timeout(read_timeout, read_line(&mut reader)).await {
            Ok(Ok(line)) => line,
            _ => return Ok(unreachable_outcome(command, config)),
        };
        let response: DaemonResponse = serde_json::from_str(&line)?;

        if response.is_intermediate {
            if let Some(status) = &response.status_message {
                eprintln!("{status}");
            }
            continue;
        }

        if !response.success {
            let message = response.error_message.unwrap_or_else(|| "unknown error".to_string());
            eprintln!("[SafeShell] error: {message}");
            return Ok(EvaluationOutcome {
                should_execute: false,
                effective_command: command.to_string(),
                denial_message: Some(message),
            });
        }

        if let Some(denial) = &response.denial_message {
            eprintln!("{denial}");
            if response.allow_override {
                eprintln!(
                    "[SafeShell] this rule permits manual override; re-run with {BYPASS_ENV}=1 to proceed anyway"
                );
            }
        }

        let effective_command = response.redirect_to.unwrap_or_else(|| command.to_string());
        return Ok(EvaluationOutcome {
            should_execute: response.should_execute,
            effective_command,
            denial_message: response.denial_message,
        });
    }
}

fn unreachable_outcome(command: &str, config: &Config) -> EvaluationOutcome {
    match config.unreachable_behavior {
        UnreachableBehavior::FailOpen => {
            tracing::warn!("daemon unreachable; unreachable_behavior=fail_open, executing without evaluation");
            EvaluationOutcome {
                should_execute: true,
                effective_command: command.to_string(),
                denial_message: None,
            }
        }
        UnreachableBehavior::FailClosed => {
            eprintln!("[SafeShell] daemon unreachable; unreachable_behavior=fail_closed, refusing to run");
            EvaluationOutcome {
                should_execute: false,
                effective_command: command.to_string(),
                denial_message: Some("daemon unreachable".to_string()),
            }
        }
    }
}

/// Runs `command` through the configured delegate shell, inheriting
/// stdio and environment, with the bypass flag set so the child's own
/// shell invocation isn't re-evaluated.
pub fn execute(command: &str, config: &Config) -> i32 {
    let status = StdCommand::new(&config.delegate_shell)
        .arg("-c")
        .arg(command)
        .env(BYPASS_ENV, "1")
        .status();
    match status {
        Ok(status) => status.code().unwrap_or(1),
        Err(e) => {
            eprintln!("[SafeShell] failed to launch {}: {e}", config.delegate_shell.display());
            127
        }
    }
}

/// Top-level entry point for `safeshell wrapper -c "<command>"`.
pub async fn run_wrapper_command(command: &str) -> i32 {
    let config = Config::load(&paths::config_path()).unwrap_or_default();
    match evaluate(command, &config).await {
        Ok(outcome) if outcome.should_execute => execute(&outcome.effective_command, &config),
        Ok(_) => 1,
        Err(e) => {
            eprintln!("[SafeShell] internal error: {e}");
            match config.unreachable_behavior {
                UnreachableBehavior::FailOpen => execute(command, &config),
                UnreachableBehavior::FailClosed => 1,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bypass_env_short_circuits_before_any_connection() {
        // SAFETY: test-only env var scoped to this process; exercised
        // synchronously so no other test observes it mid-mutation.
        unsafe { std::env::set_var(BYPASS_ENV, "1") };
        let config = Config::default();
        let outcome = tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(evaluate("rm -rf /", &config))
            .unwrap();
        unsafe { std::env::remove_var(BYPASS_ENV) };
        assert!(outcome.should_execute);
        assert_eq!(outcome.effective_command, "rm -rf /");
    }

    #[test]
    fn context_env_marks_ai_execution() {
        unsafe { std::env::set_var(CONTEXT_ENV, "ai") };
        assert_eq!(detect_execution_context(), ExecutionContext::Ai);
        unsafe { std::env::remove_var(CONTEXT_ENV) };
    }

    #[test]
    fn unreachable_fail_closed_refuses_execution() {
        let mut config = Config::default();
        config.unreachable_behavior = UnreachableBehavior::FailClosed;
        let outcome = unreachable_outcome("git status", &config);
        assert!(!outcome.should_execute);
    }

    #[test]
    fn unreachable_fail_open_permits_execution() {
        let mut config = Config::default();
        config.unreachable_behavior = UnreachableBehavior::FailOpen;
        let outcome = unreachable_outcome("git status", &config);
        assert!(outcome.should_execute);
    }
}
