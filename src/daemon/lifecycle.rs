//! Daemon lifecycle: pidfile management and stale-socket detection.

use std::path::Path;
use std::time::Duration;

use tokio::net::UnixStream;

use crate::paths;

/// Detects staleness by actually attempting to connect, not by merely
/// checking file existence: a crashed daemon can leave the socket file
/// behind, and only a failed connection attempt proves nothing is
/// listening.
pub async fn is_running(socket_path: &Path) -> bool {
    if !socket_path.exists() {
        return false;
    }
    match tokio::time::timeout(Duration::from_secs(1), UnixStream::connect(socket_path)).await {
        Ok(Ok(_stream)) => true,
        _ => {
            cleanup_stale_socket(socket_path);
            false
        }
    }
}

fn cleanup_stale_socket(socket_path: &Path) {
    if let Err(e) = std::fs::remove_file(socket_path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %socket_path.display(), error = %e, "failed to remove stale socket");
        }
    }
}

pub fn write_pid(pid_path: &Path) -> std::io::Result<()> {
    if let Some(parent) = pid_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(pid_path, std::process::id().to_string())
}

pub fn read_pid(pid_path: &Path) -> Option<u32> {
    std::fs::read_to_string(pid_path).ok()?.trim().parse().ok()
}

pub fn remove_pid(pid_path: &Path) {
    let _ = std::fs::remove_file(pid_path);
}

/// Removes stale sockets and pidfile left by a crashed previous
/// instance. Called once, before binding, at daemon startup.
pub async fn cleanup_on_start() -> std::io::Result<()> {
    paths::ensure_state_dir()?;
    for socket in [paths::request_socket_path(), paths::monitor_socket_path()] {
        if !is_running(&socket).await {
            cleanup_stale_socket(&socket);
        }
    }
    Ok(())
}

/// Sends SIGTERM to the pid recorded in the pidfile, waits briefly, and
/// verifies the process actually stopped via the connect-attempt check.
pub async fn stop_daemon() -> Result<(), String> {
    let pid_path = paths::pid_path();
    let Some(pid) = read_pid(&pid_path) else {
        return Err("no pidfile found; daemon does not appear to be running".to_string());
    };

    #[cfg(unix)]
    {
        let result = unsafe { libc_kill(pid as i32, 15) };
        if result != 0 {
            // Process already gone; clean up anyway.
            remove_pid(&pid_path);
            return Ok(());
        }
    }

    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if !is_running(&paths::request_socket_path()).await {
            remove_pid(&pid_path);
            return Ok(());
        }
    }
    Err("daemon did not stop within the timeout".to_string())
}

#[cfg(unix)]
unsafe fn libc_kill(pid: i32, sig: i32) -> i32 {
    unsafe extern "C" {
        fn kill(pid: i32, sig: i32) -> i32;
    }
    unsafe { kill(pid, sig) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn absent_socket_is_not_running() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!is_running(&tmp.path().join("daemon.sock")).await);
    }

    #[tokio::test]
    async fn stale_socket_file_is_cleaned_up() {
        let tmp = tempfile::tempdir().unwrap();
        let sock = tmp.path().join("daemon.sock");
        std::fs::write(&sock, b"").unwrap();
        assert!(!is_running(&sock).await);
        assert!(!sock.exists());
    }

    #[tokio::test]
    async fn live_listener_is_detected_as_running() {
        let tmp = tempfile::tempdir().unwrap();
        let sock = tmp.path().join("daemon.sock");
        let listener = tokio::net::UnixListener::bind(&sock).unwrap();
        let accept_task = tokio::spawn(async move {
            let _ = listener.accept().await;
        });
        assert!(is_running(&sock).await);
        accept_task.await.unwrap();
    }

    #[test]
    fn pidfile_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let pid_path = tmp.path().join("daemon.pid");
        write_pid(&pid_path).unwrap();
        assert_eq!(read_pid(&pid_path), Some(std::process::id()));
        remove_pid(&pid_path);
        assert_eq!(read_pid(&pid_path), None);
    }
}
