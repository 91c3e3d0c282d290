//! Rule schema (C2/C3 data model): `Rule`, `Condition`, `RuleOverride`, `RuleSet`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::context::{CommandContext, ExecutionContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    // Ord derives bottom-to-top in declaration order; declared so that
    // `Allow < Redirect < RequireApproval < Deny`, matching the
    // most-restrictive-wins aggregation in §4.2.
    #[default]
    Allow,
    Redirect,
    RequireApproval,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuleContext {
    #[default]
    All,
    AiOnly,
    HumanOnly,
}

impl RuleContext {
    pub fn compatible_with(self, role: ExecutionContext) -> bool {
        match self {
            RuleContext::All => true,
            RuleContext::AiOnly => role == ExecutionContext::Ai,
            RuleContext::HumanOnly => role == ExecutionContext::Human,
        }
    }
}

/// A single condition variant. The YAML shorthand uses one key per
/// mapping (`command_matches: "..."`); serde's externally-tagged default
/// representation for a single-field-per-variant enum matches that
/// shorthand directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Condition {
    #[serde(rename = "command_matches")]
    CommandMatches(String),
    #[serde(rename = "command_contains")]
    CommandContains(String),
    #[serde(rename = "command_startswith")]
    CommandStartswith(String),
    #[serde(rename = "git_branch_in")]
    GitBranchIn(Vec<String>),
    #[serde(rename = "git_branch_matches")]
    GitBranchMatches(String),
    #[serde(rename = "in_git_repo")]
    InGitRepo(bool),
    #[serde(rename = "path_matches")]
    PathMatches(String),
    #[serde(rename = "file_exists")]
    FileExists(String),
    #[serde(rename = "env_equals")]
    EnvEquals { name: String, value: String },
}

impl Condition {
    /// Human-readable fingerprint used as part of the condition-result
    /// cache key (C9). Two conditions with the same fingerprint are
    /// interchangeable for caching purposes.
    pub fn fingerprint(&self) -> String {
        match self {
            Condition::CommandMatches(r) => format!("command_matches:{r}"),
            Condition::CommandContains(s) => format!("command_contains:{s}"),
            Condition::CommandStartswith(s) => format!("command_startswith:{s}"),
            Condition::GitBranchIn(names) => format!("git_branch_in:{}", names.join(",")),
            Condition::GitBranchMatches(r) => format!("git_branch_matches:{r}"),
            Condition::InGitRepo(b) => format!("in_git_repo:{b}"),
            Condition::PathMatches(r) => format!("path_matches:{r}"),
            Condition::FileExists(p) => format!("file_exists:{p}"),
            Condition::EnvEquals { name, value } => format!("env_equals:{name}={value}"),
        }
    }

    /// Evaluates this condition against a context. Regex compile
    /// failures and any other internal error are treated as `false`
    /// per the condition-failure error kind (§7): a condition never
    /// aborts evaluation, it just doesn't match.
    pub fn evaluate(&self, ctx: &CommandContext) -> bool {
        match self {
            Condition::CommandMatches(pattern) => Regex::new(pattern)
                .map(|re| re.is_match(&ctx.raw_command))
                .unwrap_or(false),
            Condition::CommandContains(s) => ctx.raw_command.contains(s.as_str()),
            Condition::CommandStartswith(s) => ctx.raw_command.starts_with(s.as_str()),
            Condition::GitBranchIn(names) => match &ctx.git_branch {
                Some(branch) => {
                    let set: HashSet<&str> = names.iter().map(String::as_str).collect();
                    set.contains(branch.as_str())
                }
                None => false,
            },
            Condition::GitBranchMatches(pattern) => match &ctx.git_branch {
                Some(branch) => Regex::new(pattern)
                    .map(|re| re.is_match(branch))
                    .unwrap_or(false),
                None => false,
            },
            Condition::InGitRepo(expected) => ctx.git_repo_root.is_some() == *expected,
            Condition::PathMatches(pattern) => Regex::new(pattern)
                .map(|re| re.is_match(&ctx.working_dir.to_string_lossy()))
                .unwrap_or(false),
            Condition::FileExists(relpath) => ctx.working_dir.join(relpath).exists(),
            Condition::EnvEquals { name, value } => {
                ctx.environment.get(name).map(String::as_str) == Some(value.as_str())
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub commands: Vec<String>,
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub action: Action,
    #[serde(default)]
    pub context: RuleContext,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub allow_override: bool,
    #[serde(default)]
    pub redirect_to: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RuleValidationError {
    #[error("rule {name:?} has an empty commands list")]
    EmptyCommands { name: String },
    #[error("rule {name:?} has action redirect but no redirect_to")]
    MissingRedirectTo { name: String },
}

impl Rule {
    pub fn validate(&self) -> Result<(), RuleValidationError> {
        if self.commands.is_empty() {
            return Err(RuleValidationError::EmptyCommands {
                name: self.name.clone(),
            });
        }
        if self.action == Action::Redirect && self.redirect_to.is_none() {
            return Err(RuleValidationError::MissingRedirectTo {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    /// `None` if the regex fails to compile; per §3 such a rule is
    /// dropped with a warning rather than failing the whole load.
    pub fn compiled_directory(&self) -> Option<Result<Regex, regex::Error>> {
        self.directory.as_deref().map(Regex::new)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleOverride {
    pub name: String,
    #[serde(default)]
    pub disabled: Option<bool>,
    #[serde(default)]
    pub action: Option<Action>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub context: Option<RuleContext>,
    #[serde(default)]
    pub allow_override: Option<bool>,
}

#[derive(Debug, thiserror::Error)]
#[error("override {name:?} modifies nothing (set disabled=true or a field)")]
pub struct EmptyOverrideError {
    pub name: String,
}

impl RuleOverride {
    pub fn validate(&self) -> Result<(), EmptyOverrideError> {
        let touches_something = self.disabled.is_some()
            || self.action.is_some()
            || self.message.is_some()
            || self.context.is_some()
            || self.allow_override.is_some();
        if !touches_something {
            return Err(EmptyOverrideError {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    pub fn apply(&self, rule: &mut Rule) {
        if let Some(action) = self.action {
            rule.action = action;
        }
        if let Some(ref message) = self.message {
            rule.message = message.clone();
        }
        if let Some(context) = self.context {
            rule.context = context;
        }
        if let Some(allow_override) = self.allow_override {
            rule.allow_override = allow_override;
        }
    }

    pub fn disables(&self) -> bool {
        self.disabled.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub overrides: Vec<RuleOverride>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_priority_orders_deny_highest() {
        assert!(Action::Deny > Action::RequireApproval);
        assert!(Action::RequireApproval > Action::Redirect);
        assert!(Action::Redirect > Action::Allow);
    }

    #[test]
    fn rule_validation_rejects_empty_commands() {
        let rule = Rule {
            name: "x".into(),
            commands: vec![],
            directory: None,
            conditions: vec![],
            action: Action::Allow,
            context: RuleContext::All,
            message: String::new(),
            allow_override: false,
            redirect_to: None,
        };
        assert!(rule.validate().is_err());
    }

    #[test]
    fn redirect_without_target_is_invalid() {
        let rule = Rule {
            name: "x".into(),
            commands: vec!["git".into()],
            directory: None,
            conditions: vec![],
            action: Action::Redirect,
            context: RuleContext::All,
            message: String::new(),
            allow_override: false,
            redirect_to: None,
        };
        assert!(rule.validate().is_err());
    }

    #[test]
    fn condition_yaml_shorthand_round_trips() {
        let yaml = "command_matches: \"^git\\\\s+commit\"\n";
        let cond: Condition = serde_yaml::from_str(yaml).unwrap();
        matches!(cond, Condition::CommandMatches(_));
    }

    #[test]
    fn env_equals_uses_name_and_value_fields() {
        let yaml = "env_equals:\n  name: FOO\n  value: bar\n";
        let cond: Condition = serde_yaml::from_str(yaml).unwrap();
        match cond {
            Condition::EnvEquals { name, value } => {
                assert_eq!(name, "FOO");
                assert_eq!(value, "bar");
            }
            _ => panic!("wrong variant"),
        }
    }

    fn base_ctx(raw: &str) -> CommandContext {
        CommandContext {
            raw_command: raw.into(),
            parsed_args: crate::context::tokenize(raw),
            working_dir: std::path::PathBuf::from("/tmp"),
            git_repo_root: Some(std::path::PathBuf::from("/tmp")),
            git_branch: Some("main".into()),
            environment: std::collections::HashMap::new(),
            execution_context: ExecutionContext::Human,
        }
    }

    #[test]
    fn git_branch_in_matches_current_branch() {
        let cond = Condition::GitBranchIn(vec!["main".into(), "master".into()]);
        assert!(cond.evaluate(&base_ctx("git commit")));
    }

    #[test]
    fn git_branch_in_false_outside_repo() {
        let mut ctx = base_ctx("git commit");
        ctx.git_branch = None;
        let cond = Condition::GitBranchIn(vec!["main".into()]);
        assert!(!cond.evaluate(&ctx));
    }

    #[test]
    fn bad_regex_condition_evaluates_false_not_panics() {
        let cond = Condition::CommandMatches("(unclosed".into());
        assert!(!cond.evaluate(&base_ctx("anything")));
    }

    #[test]
    fn override_disable_only_is_valid() {
        let ov = RuleOverride {
            name: "x".into(),
            disabled: Some(true),
            action: None,
            message: None,
            context: None,
            allow_override: None,
        };
        assert!(ov.validate().is_ok());
    }

    #[test]
    fn override_with_no_fields_is_invalid() {
        let ov = RuleOverride {
            name: "x".into(),
            disabled: None,
            action: None,
            message: None,
            context: None,
            allow_override: None,
        };
        assert!(ov.validate().is_err());
    }
}
