//! SafeShell - local policy daemon for AI-assistant shell commands.
//!
//! Subcommands:
//!   safeshell daemon                 run the policy daemon in the foreground
//!   safeshell stop                   stop a running daemon
//!   safeshell status                 print daemon status
//!   safeshell wrapper -c "<command>" evaluate then run a single command
//!   safeshell hook                   read a PreToolUse-style hook payload from stdin
//!
//! Usage:
//!   safeshell wrapper -c "gh pr list"
//!
//! Or in an AI assistant's hook configuration:
//!   {
//!     "hooks": {
//!       "PreToolUse": [{
//!         "matcher": "Bash",
//!         "hooks": [{"type": "command", "command": "/path/to/safeshell hook"}]
//!       }]
//!     }
//!   }

use std::env;

use safeshell::config::Config;
use safeshell::{daemon, paths};

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let args: Vec<String> = env::args().collect();

    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("safeshell {}", env!("GIT_VERSION"));
        return;
    }

    if args.iter().any(|a| a == "--help" || a == "-h") || args.len() < 2 {
        print_usage();
        std::process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    let exit_code = match args[1].as_str() {
        "daemon" => run_daemon().await,
        "stop" => run_stop().await,
        "status" => run_status().await,
        "wrapper" => run_wrapper(&args[2..]).await,
        "hook" => safeshell::hook_adapter::run().await,
        other => {
            eprintln!("unknown subcommand: {other}");
            print_usage();
            1
        }
    };

    std::process::exit(exit_code);
}

fn print_usage() {
    eprintln!(
        "safeshell <daemon|stop|status|wrapper|hook>\n\n\
         safeshell daemon                 run the policy daemon in the foreground\n\
         safeshell stop                   stop a running daemon\n\
         safeshell status                 print daemon status\n\
         safeshell wrapper -c \"<command>\" evaluate then run a single command\n\
         safeshell hook                   read a hook payload from stdin"
    );
}

async fn run_daemon() -> i32 {
    let config = match Config::load(&paths::config_path()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            return 1;
        }
    };

    if !paths::config_path().exists() {
        let _ = Config::write_default(&paths::config_path());
    }

    let _guard = safeshell::logging::init(config.log_level, Some(&config.log_file));

    match daemon::run(config).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("daemon exited with error: {e}");
            1
        }
    }
}

async fn run_stop() -> i32 {
    match daemon::lifecycle::stop_daemon().await {
        Ok(()) => {
            println!("daemon stopped");
            0
        }
        Err(e) => {
            eprintln!("{e}");
            1
        }
    }
}

async fn run_status() -> i32 {
    safeshell::logging::init_minimal();
    let socket_path = paths::request_socket_path();
    if !daemon::lifecycle::is_running(&socket_path).await {
        println!("daemon is not running");
        return 1;
    }

    use daemon::protocol::{read_line, write_message, DaemonRequest, DaemonResponse, RequestType};
    use tokio::io::BufReader;
    use tokio::net::UnixStream;

    let stream = match UnixStream::connect(&socket_path).await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("failed to connect: {e}");
            return 1;
        }
    };
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let request = DaemonRequest {
        kind: RequestType::Status,
        command: None,
        working_dir: None,
        env: Default::default(),
        execution_context: Default::default(),
    };
    if write_message(&mut write_half, &request).await.is_err() {
        eprintln!("failed to send status request");
        return 1;
    }
    match read_line(&mut reader).await {
        Ok(line) => match serde_json::from_str::<DaemonResponse>(&line) {
            Ok(response) => {
                println!("{}", response.status_message.unwrap_or_else(|| "ok".to_string()));
                0
            }
            Err(e) => {
                eprintln!("malformed status response: {e}");
                1
            }
        },
        Err(e) => {
            eprintln!("failed to read status response: {e}");
            1
        }
    }
}

async fn run_wrapper(args: &[String]) -> i32 {
    safeshell::logging::init_minimal();

    if args.first().map(String::as_str) == Some("-c") {
        let Some(command) = args.get(1) else {
            eprintln!("wrapper -c requires a command argument");
            return 1;
        };
        return safeshell::wrapper::run_wrapper_command(command).await;
    }

    if !args.is_empty() {
        // A script path: run its contents as a single evaluated command.
        match std::fs::read_to_string(&args[0]) {
            Ok(contents) => safeshell::wrapper::run_wrapper_command(&contents).await,
            Err(e) => {
                eprintln!("failed to read script {}: {e}", args[0]);
                127
            }
        }
    } else {
        // No command given: drop into an interactive delegate shell,
        // unevaluated (SafeShell only gates commands it's handed, not
        // an interactive session it can't see into).
        let config = Config::load(&paths::config_path()).unwrap_or_default();
        match std::process::Command::new(&config.delegate_shell).status() {
            Ok(status) => status.code().unwrap_or(1),
            Err(e) => {
                eprintln!("failed to launch {}: {e}", config.delegate_shell.display());
                127
            }
        }
    }
}
