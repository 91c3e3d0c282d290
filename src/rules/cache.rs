//! Rule/Decision Cache (C9): mtime-keyed rule cache and a TTL-bounded
//! condition-result cache.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use crate::rules::schema::Rule;

fn mtime_of(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

struct CachedRuleSet {
    rules: Vec<Rule>,
    file_mtimes: HashMap<PathBuf, Option<SystemTime>>,
}

impl CachedRuleSet {
    fn is_stale(&self, current_paths: &[PathBuf]) -> bool {
        let current: std::collections::HashSet<&PathBuf> = current_paths.iter().collect();
        let cached: std::collections::HashSet<&PathBuf> = self.file_mtimes.keys().collect();
        if current != cached {
            return true;
        }
        for path in current_paths {
            if self.file_mtimes.get(path).copied().flatten() != mtime_of(path) {
                return true;
            }
        }
        false
    }
}

#[derive(Default, Clone, Copy)]
pub struct RuleCacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Caches the merged rule list per working directory, invalidated when
/// any contributing file's mtime changes or the set of contributing
/// files itself changes (a rule file appearing or disappearing).
pub struct RuleCache {
    entries: Mutex<HashMap<PathBuf, CachedRuleSet>>,
    stats: Mutex<RuleCacheStats>,
}

impl Default for RuleCache {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            stats: Mutex::new(RuleCacheStats::default()),
        }
    }
}

impl RuleCache {
    /// Returns the cached rules for `working_dir` if still valid,
    /// otherwise loads fresh via `load` and caches the result.
    pub fn get_or_load<F>(&self, working_dir: &Path, load: F) -> crate::error::Result<Vec<Rule>>
    where
        F: FnOnce(&Path) -> crate::error::Result<(Vec<Rule>, Vec<PathBuf>)>,
    {
        let key = working_dir.to_path_buf();
        {
            let entries = self.entries.lock().unwrap();
            if let Some(cached) = entries.get(&key) {
                let paths: Vec<PathBuf> = cached.file_mtimes.keys().cloned().collect();
                if !cached.is_stale(&paths) {
                    self.stats.lock().unwrap().hits += 1;
                    return Ok(cached.rules.clone());
                }
            }
        }

        self.stats.lock().unwrap().misses += 1;
        let (rules, paths) = load(working_dir)?;
        let file_mtimes = paths.iter().map(|p| (p.clone(), mtime_of(p))).collect();
        self.entries.lock().unwrap().insert(
            key,
            CachedRuleSet {
                rules: rules.clone(),
                file_mtimes,
            },
        );
        Ok(rules)
    }

    pub fn invalidate(&self, working_dir: &Path) {
        self.entries.lock().unwrap().remove(working_dir);
    }

    pub fn invalidate_all(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn stats(&self) -> RuleCacheStats {
        *self.stats.lock().unwrap()
    }
}

// Condition-result cache ----------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConditionCacheKey {
    pub fingerprint: String,
    pub raw_command: String,
    pub working_dir: PathBuf,
}

struct ConditionCacheEntry {
    value: bool,
    at: Instant,
}

/// TTL-bounded cache of condition evaluation results, keyed by
/// (condition fingerprint, raw command, working dir). Capacity-bounded;
/// eviction removes the oldest 10% when full.
pub struct ConditionCache {
    ttl: Duration,
    max_size: usize,
    entries: Mutex<HashMap<ConditionCacheKey, ConditionCacheEntry>>,
}

impl ConditionCache {
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            ttl,
            max_size,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &ConditionCacheKey) -> Option<bool> {
        let entries = self.entries.lock().unwrap();
        let entry = entries.get(key)?;
        if entry.at.elapsed() < self.ttl {
            Some(entry.value)
        } else {
            None
        }
    }

    pub fn put(&self, key: ConditionCacheKey, value: bool) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= self.max_size {
            evict_oldest(&mut entries, (self.max_size / 10).max(1));
        }
        entries.insert(key, ConditionCacheEntry { value, at: Instant::now() });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

impl Default for ConditionCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), 1000)
    }
}

fn evict_oldest(entries: &mut HashMap<ConditionCacheKey, ConditionCacheEntry>, count: usize) {
    let mut keys: Vec<ConditionCacheKey> = entries.keys().cloned().collect();
    keys.sort_by_key(|k| entries[k].at);
    for key in keys.into_iter().take(count) {
        entries.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::schema::{Action, RuleContext};

    fn dummy_rule(name: &str) -> Rule {
        Rule {
            name: name.into(),
            commands: vec!["git".into()],
            directory: None,
            conditions: vec![],
            action: Action::Allow,
            context: RuleContext::All,
            message: String::new(),
            allow_override: false,
            redirect_to: None,
        }
    }

    #[test]
    fn rule_cache_hits_on_unchanged_files() {
        let tmp = tempfile::tempdir().unwrap();
        let rule_path = tmp.path().join("rules.yaml");
        std::fs::write(&rule_path, "rules: []").unwrap();
        let cache = RuleCache::default();

        let mut calls = 0;
        let load = |_: &Path| {
            calls += 1;
            Ok((vec![dummy_rule("a")], vec![rule_path.clone()]))
        };
        let _ = cache.get_or_load(tmp.path(), load).unwrap();
        let load2 = |_: &Path| {
            calls += 1;
            Ok((vec![dummy_rule("a")], vec![rule_path.clone()]))
        };
        let _ = cache.get_or_load(tmp.path(), load2).unwrap();
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn rule_cache_invalidates_on_mtime_change() {
        let tmp = tempfile::tempdir().unwrap();
        let rule_path = tmp.path().join("rules.yaml");
        std::fs::write(&rule_path, "rules: []").unwrap();
        let cache = RuleCache::default();

        let _ = cache
            .get_or_load(tmp.path(), |_| Ok((vec![dummy_rule("a")], vec![rule_path.clone()])))
            .unwrap();

        std::thread::sleep(Duration::from_millis(10));
        std::fs::write(&rule_path, "rules: []\n# touched").unwrap();

        let rules = cache
            .get_or_load(tmp.path(), |_| Ok((vec![dummy_rule("b")], vec![rule_path.clone()])))
            .unwrap();
        assert_eq!(rules[0].name, "b");
        assert_eq!(cache.stats().misses, 2);
    }

    #[test]
    fn condition_cache_respects_ttl() {
        let cache = ConditionCache::new(Duration::from_millis(20), 100);
        let key = ConditionCacheKey {
            fingerprint: "command_contains:rm".into(),
            raw_command: "rm -rf /".into(),
            working_dir: PathBuf::from("/tmp"),
        };
        cache.put(key.clone(), true);
        assert_eq!(cache.get(&key), Some(true));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get(&key), None);
    }

    #[test]
    fn condition_cache_evicts_when_full() {
        let cache = ConditionCache::new(Duration::from_secs(60), 10);
        for i in 0..20 {
            cache.put(
                ConditionCacheKey {
                    fingerprint: format!("f{i}"),
                    raw_command: "cmd".into(),
                    working_dir: PathBuf::from("/tmp"),
                },
                true,
            );
        }
        assert!(cache.len() <= 10);
    }
}
