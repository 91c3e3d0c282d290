//! Per-user state directory layout.
//!
//! Everything SafeShell persists (config, rules, sockets, pidfile, log)
//! lives under `~/.safeshell`. Overridable via `SAFESHELL_DIR` so tests
//! and the daemon's own integration tests can point at a `TempDir`.

use std::path::PathBuf;

pub fn state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SAFESHELL_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".safeshell")
}

pub fn config_path() -> PathBuf {
    state_dir().join("config.yaml")
}

pub fn global_rules_path() -> PathBuf {
    state_dir().join("rules.yaml")
}

/// Relative path a repo checks out for its own additive rules, discovered
/// by walking upward from the working directory.
pub const REPO_RULES_RELATIVE: &str = ".safeshell/rules.yaml";

pub fn request_socket_path() -> PathBuf {
    state_dir().join("daemon.sock")
}

pub fn monitor_socket_path() -> PathBuf {
    state_dir().join("monitor.sock")
}

pub fn pid_path() -> PathBuf {
    state_dir().join("daemon.pid")
}

pub fn default_log_path() -> PathBuf {
    state_dir().join("daemon.log")
}

/// Walk upward from `start` looking for `relative`, stopping at the
/// filesystem root. Returns the first match found.
pub fn find_upward(start: &std::path::Path, relative: &str) -> Option<PathBuf> {
    let mut current = start.to_path_buf();
    loop {
        let candidate = current.join(relative);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !current.pop() {
            return None;
        }
    }
}

pub fn ensure_state_dir() -> std::io::Result<PathBuf> {
    let dir = state_dir();
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_upward_locates_file_in_ancestor() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::create_dir_all(tmp.path().join(".safeshell")).unwrap();
        std::fs::write(tmp.path().join(".safeshell/rules.yaml"), "rules: []").unwrap();

        let found = find_upward(&nested, REPO_RULES_RELATIVE);
        assert_eq!(found, Some(tmp.path().join(".safeshell/rules.yaml")));
    }

    #[test]
    fn find_upward_returns_none_when_absent() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(find_upward(tmp.path(), REPO_RULES_RELATIVE), None);
    }
}
