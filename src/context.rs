//! Command Context (C1): the immutable snapshot one evaluation runs against.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Who is executing the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionContext {
    Ai,
    Human,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::Human
    }
}

/// Immutable snapshot attached to one evaluation.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub raw_command: String,
    pub parsed_args: Vec<String>,
    pub working_dir: PathBuf,
    pub git_repo_root: Option<PathBuf>,
    pub git_branch: Option<String>,
    pub environment: HashMap<String, String>,
    pub execution_context: ExecutionContext,
}

impl CommandContext {
    pub fn from_command(
        command: &str,
        working_dir: impl Into<PathBuf>,
        environment: HashMap<String, String>,
        execution_context: ExecutionContext,
        git_cache: &GitStateCache,
    ) -> Self {
        let working_dir = working_dir.into();
        let parsed_args = tokenize(command);
        let (git_repo_root, git_branch) = git_cache.detect(&working_dir);
        Self {
            raw_command: command.to_string(),
            parsed_args,
            working_dir,
            git_repo_root,
            git_branch,
            environment,
            execution_context,
        }
    }

    pub fn executable(&self) -> Option<&str> {
        self.parsed_args.first().map(String::as_str)
    }

    pub fn args(&self) -> &[String] {
        if self.parsed_args.len() > 1 {
            &self.parsed_args[1..]
        } else {
            &[]
        }
    }

    /// The first whitespace-delimited token of the raw command, used as
    /// the second component of a session memory key. Distinct from
    /// `executable()`, which is quote-aware; this is a plain split to
    /// match the original reference implementation's key derivation.
    pub fn base_command(&self) -> &str {
        self.raw_command.split_whitespace().next().unwrap_or("")
    }
}

/// Quote-aware whitespace tokenizer, equivalent to a minimal `shlex.split`.
pub fn tokenize(s: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_single_quote = false;
    let mut in_double_quote = false;
    let mut escape_next = false;
    let mut has_token = false;

    for c in s.chars() {
        if escape_next {
            current.push(c);
            escape_next = false;
            continue;
        }
        match c {
            '\\' if !in_single_quote => escape_next = true,
            '\'' if !in_double_quote => {
                in_single_quote = !in_single_quote;
                has_token = true;
            }
            '"' if !in_single_quote => {
                in_double_quote = !in_double_quote;
                has_token = true;
            }
            ' ' | '\t' | '\n' if !in_single_quote && !in_double_quote => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            _ => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        tokens.push(current);
    }
    tokens
}

/// Reads `.git/HEAD` and returns the branch name if it's a symbolic ref
/// to `refs/heads/<name>`; `None` on detached HEAD or read failure.
fn read_head_branch(git_dir: &Path) -> Option<String> {
    let head = std::fs::read_to_string(git_dir.join("HEAD")).ok()?;
    let head = head.trim();
    if let Some(name) = head.strip_prefix("ref: refs/heads/") {
        Some(name.to_string())
    } else {
        None
    }
}

/// Walks upward from `working_dir` looking for the first `.git` directory.
fn detect_git_context(working_dir: &Path) -> (Option<PathBuf>, Option<String>) {
    let mut current = match working_dir.canonicalize() {
        Ok(p) => p,
        Err(_) => working_dir.to_path_buf(),
    };
    loop {
        let git_dir = current.join(".git");
        if git_dir.is_dir() {
            let branch = read_head_branch(&git_dir);
            return (Some(current), branch);
        }
        if !current.pop() {
            return (None, None);
        }
    }
}

struct CacheEntry {
    root: Option<PathBuf>,
    branch: Option<String>,
    at: Instant,
}

/// Bounded, short-TTL cache of git state per working directory so that a
/// burst of evaluations against the same directory doesn't each walk and
/// stat the filesystem.
pub struct GitStateCache {
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<PathBuf, CacheEntry>>,
}

impl Default for GitStateCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 200)
    }
}

impl GitStateCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn detect(&self, working_dir: &Path) -> (Option<PathBuf>, Option<String>) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get(working_dir) {
            if entry.at.elapsed() < self.ttl {
                return (entry.root.clone(), entry.branch.clone());
            }
        }

        let (root, branch) = detect_git_context(working_dir);

        if entries.len() >= self.max_entries {
            evict_oldest(&mut entries, self.max_entries / 5);
        }
        entries.insert(
            working_dir.to_path_buf(),
            CacheEntry {
                root: root.clone(),
                branch: branch.clone(),
                at: Instant::now(),
            },
        );
        (root, branch)
    }
}

fn evict_oldest(entries: &mut HashMap<PathBuf, CacheEntry>, count: usize) {
    let count = count.max(1);
    let mut keys: Vec<PathBuf> = entries.keys().cloned().collect();
    keys.sort_by_key(|k| entries[k].at);
    for key in keys.into_iter().take(count) {
        entries.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_head(dir: &Path, content: &str) {
        let git_dir = dir.join(".git");
        std::fs::create_dir_all(&git_dir).unwrap();
        std::fs::write(git_dir.join("HEAD"), content).unwrap();
    }

    #[test]
    fn tokenize_respects_quotes() {
        let tokens = tokenize(r#"git commit -m "fix: thing with spaces""#);
        assert_eq!(tokens, vec!["git", "commit", "-m", "fix: thing with spaces"]);
    }

    #[test]
    fn tokenize_empty_is_empty() {
        assert!(tokenize("   ").is_empty());
    }

    #[test]
    fn executable_and_args_split_first_token() {
        let ctx = CommandContext {
            raw_command: "git push --force".into(),
            parsed_args: tokenize("git push --force"),
            working_dir: PathBuf::from("/tmp"),
            git_repo_root: None,
            git_branch: None,
            environment: HashMap::new(),
            execution_context: ExecutionContext::Human,
        };
        assert_eq!(ctx.executable(), Some("git"));
        assert_eq!(ctx.args(), &["push", "--force"]);
        assert_eq!(ctx.base_command(), "git");
    }

    #[test]
    fn detects_branch_on_symbolic_head() {
        let tmp = tempfile::tempdir().unwrap();
        write_head(tmp.path(), "ref: refs/heads/feature/x\n");
        let cache = GitStateCache::default();
        let (root, branch) = cache.detect(tmp.path());
        assert!(root.is_some());
        assert_eq!(branch.as_deref(), Some("feature/x"));
    }

    #[test]
    fn detached_head_has_no_branch() {
        let tmp = tempfile::tempdir().unwrap();
        write_head(tmp.path(), "a1b2c3d4deadbeef\n");
        let cache = GitStateCache::default();
        let (root, branch) = cache.detect(tmp.path());
        assert!(root.is_some());
        assert_eq!(branch, None);
    }

    #[test]
    fn outside_repo_has_no_root() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = GitStateCache::default();
        let (root, branch) = cache.detect(tmp.path());
        assert_eq!(root, None);
        assert_eq!(branch, None);
    }

    #[test]
    fn cache_evicts_when_full() {
        let cache = GitStateCache::new(Duration::from_secs(60), 4);
        for i in 0..10 {
            let tmp_path = PathBuf::from(format!("/nonexistent/{i}"));
            cache.detect(&tmp_path);
        }
        let entries = cache.entries.lock().unwrap();
        assert!(entries.len() <= 4);
    }
}
