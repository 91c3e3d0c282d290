//! Rule Store & Loader (C2): merges built-in, global, and repo-local rule
//! sets and applies overrides under the security policy of §4.1.

use std::collections::HashMap;
use std::path::Path;

use crate::error::{Result, SafeShellError};
use crate::paths;
use crate::rules::defaults::DEFAULT_RULES_YAML;
use crate::rules::schema::{Rule, RuleSet};

fn parse_rule_set(path: &Path, content: &str) -> Result<RuleSet> {
    if content.trim().is_empty() {
        return Ok(RuleSet::default());
    }
    serde_yaml::from_str(content).map_err(|e| SafeShellError::RuleLoad {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn load_rule_file(path: &Path) -> Result<RuleSet> {
    let content = std::fs::read_to_string(path).map_err(|e| SafeShellError::RuleLoad {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    parse_rule_set(path, &content)
}

/// Applies `overrides` to `rules` in place. An override naming a rule
/// that doesn't exist is a fatal load error (§4.1). Disabled rules are
/// removed from the returned list.
fn apply_overrides(path: &Path, mut rules: Vec<Rule>, overrides: &[crate::rules::schema::RuleOverride]) -> Result<Vec<Rule>> {
    let mut by_name: HashMap<String, usize> = HashMap::new();
    for (i, rule) in rules.iter().enumerate() {
        by_name.insert(rule.name.clone(), i);
    }

    let mut disabled = vec![false; rules.len()];

    for ov in overrides {
        ov.validate().map_err(|e| SafeShellError::RuleLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let idx = *by_name
            .get(&ov.name)
            .ok_or_else(|| SafeShellError::OverrideLoad {
                path: path.to_path_buf(),
                rule_name: ov.name.clone(),
            })?;
        if ov.disables() {
            disabled[idx] = true;
        } else {
            ov.apply(&mut rules[idx]);
        }
    }

    let mut result = Vec::with_capacity(rules.len());
    for (i, rule) in rules.into_iter().enumerate() {
        if !disabled[i] {
            result.push(rule);
        }
    }
    Ok(result)
}

/// Loads the full merged rule list for an evaluation rooted at
/// `working_dir`, per the §4.1 load order:
///   1. built-in defaults
///   2. user-global rules.yaml (may override defaults)
///   3. repo-local rules.yaml (additive only; its overrides are ignored
///      with a warning — a malicious repo must not weaken protections)
///
/// Also returns the set of rule-file paths that were actually read, so
/// the caller (C9 rule cache) can key invalidation on their mtimes.
pub fn load_rules(working_dir: &Path) -> Result<(Vec<Rule>, Vec<std::path::PathBuf>)> {
    let mut touched_paths = Vec::new();

    let builtin = parse_rule_set(Path::new("<builtin>"), DEFAULT_RULES_YAML)?;
    let mut rules = builtin.rules;
    let mut pending_overrides = builtin.overrides;

    let global_path = paths::global_rules_path();
    if global_path.is_file() {
        touched_paths.push(global_path.clone());
        let global = load_rule_file(&global_path)?;
        rules.extend(global.rules);
        pending_overrides.extend(global.overrides);
    }

    // Apply defaults+global overrides before bringing in repo rules, so
    // that repo-local overrides (dropped below) can never shadow them.
    let global_override_source = if global_path.is_file() {
        global_path.clone()
    } else {
        Path::new("<builtin>").to_path_buf()
    };
    rules = apply_overrides(&global_override_source, rules, &pending_overrides)?;

    if let Some(repo_path) = paths::find_upward(working_dir, paths::REPO_RULES_RELATIVE) {
        touched_paths.push(repo_path.clone());
        let repo = load_rule_file(&repo_path)?;
        if !repo.overrides.is_empty() {
            tracing::warn!(
                path = %repo_path.display(),
                count = repo.overrides.len(),
                "ignoring repo-local rule overrides; repo rules cannot weaken protections"
            );
        }
        rules.extend(repo.rules);
    }

    for rule in &rules {
        if let Err(e) = rule.validate() {
            return Err(SafeShellError::RuleLoad {
                path: Path::new("<merged>").to_path_buf(),
                reason: e.to_string(),
            });
        }
    }
    check_unique_names(&rules)?;

    Ok((rules, touched_paths))
}

/// Enforces that `name` is unique across the final merged rule list.
/// A repo-local rule silently reusing a default or global rule's name
/// would otherwise collapse into it at override-application time
/// instead of failing loudly.
fn check_unique_names(rules: &[Rule]) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for rule in rules {
        if !seen.insert(rule.name.as_str()) {
            return Err(SafeShellError::RuleLoad {
                path: Path::new("<merged>").to_path_buf(),
                reason: format!("duplicate rule name {:?}", rule.name),
            });
        }
    }
    Ok(())
}
