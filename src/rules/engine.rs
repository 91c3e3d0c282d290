//! Rule Evaluation Engine (C3): executable index, matching, aggregation.

use std::collections::HashMap;
use std::time::Instant;

use crate::context::CommandContext;
use crate::rules::cache::{ConditionCache, ConditionCacheKey};
use crate::rules::schema::{Action, Rule};

#[derive(Debug, Clone)]
pub struct EvaluationOutcome {
    pub action: Action,
    pub rule_name: Option<String>,
    pub message: Option<String>,
    pub allow_override: bool,
    pub redirect_to: Option<String>,
    pub conditions_evaluated: usize,
}

impl EvaluationOutcome {
    fn allow() -> Self {
        Self {
            action: Action::Allow,
            rule_name: None,
            message: None,
            allow_override: false,
            redirect_to: None,
            conditions_evaluated: 0,
        }
    }
}

/// Indexes rules by executable so that a command whose executable no
/// rule mentions short-circuits to `allow` without evaluating anything.
pub struct RuleEvaluator {
    index: HashMap<String, Vec<Rule>>,
}

impl RuleEvaluator {
    pub fn new(rules: Vec<Rule>) -> Self {
        let mut index: HashMap<String, Vec<Rule>> = HashMap::new();
        for rule in rules {
            for executable in &rule.commands {
                index.entry(executable.clone()).or_default().push(rule.clone());
            }
        }
        Self { index }
    }

    /// Number of (rule, executable) index entries, used for the
    /// `evaluation_started` event's informational rule count.
    pub fn rule_count(&self) -> usize {
        self.index.values().map(Vec::len).sum()
    }

    pub fn evaluate(&self, ctx: &CommandContext, cache: &ConditionCache) -> EvaluationOutcome {
        let Some(executable) = ctx.executable() else {
            return EvaluationOutcome::allow();
        };

        let Some(candidates) = self.index.get(executable) else {
            return EvaluationOutcome::allow();
        };

        let mut conditions_evaluated = 0usize;
        let mut matched: Vec<&Rule> = Vec::new();

        for rule in candidates {
            if !rule.context.compatible_with(ctx.execution_context) {
                continue;
            }

            if let Some(compiled) = rule.compiled_directory() {
                match compiled {
                    Ok(re) => {
                        if !re.is_match(&ctx.working_dir.to_string_lossy()) {
                            continue;
                        }
                    }
                    Err(_) => {
                        tracing::warn!(rule = %rule.name, "directory regex failed to compile, rule skipped");
                        continue;
                    }
                }
            }

            let mut all_conditions_pass = true;
            for condition in &rule.conditions {
                conditions_evaluated += 1;
                let key = ConditionCacheKey {
                    fingerprint: condition.fingerprint(),
                    raw_command: ctx.raw_command.clone(),
                    working_dir: ctx.working_dir.clone(),
                };
                let result = match cache.get(&key) {
                    Some(cached) => cached,
                    None => {
                        let evaluated = condition.evaluate(ctx);
                        cache.put(key, evaluated);
                        evaluated
                    }
                };
                if !result {
                    all_conditions_pass = false;
                    break;
                }
            }

            if all_conditions_pass {
                matched.push(rule);
            }
        }

        let Some(winner) = matched.iter().max_by_key(|r| r.action) else {
            return EvaluationOutcome {
                conditions_evaluated,
                ..EvaluationOutcome::allow()
            };
        };

        EvaluationOutcome {
            action: winner.action,
            rule_name: Some(winner.name.clone()),
            message: Some(winner.message.clone()),
            allow_override: winner.allow_override,
            redirect_to: winner.redirect_to.clone(),
            conditions_evaluated,
        }
    }
}

/// Wall-clock timing helper. Measures a whole evaluation against
/// `condition_timeout_ms` so the daemon can log when it's exceeded;
/// this is diagnostic, not enforcement — `regex`'s linear-time guarantee
/// means there's no pathological case to interrupt, so nothing here
/// aborts or truncates the evaluation in progress.
pub fn evaluate_with_budget(
    evaluator: &RuleEvaluator,
    ctx: &CommandContext,
    cache: &ConditionCache,
) -> (EvaluationOutcome, std::time::Duration) {
    let start = Instant::now();
    let outcome = evaluator.evaluate(ctx, cache);
    (outcome, start.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::rules::schema::{Condition, RuleContext};
    use std::collections::HashMap as Map;
    use std::path::PathBuf;

    fn ctx(raw: &str, branch: Option<&str>) -> CommandContext {
        CommandContext {
            raw_command: raw.into(),
            parsed_args: crate::context::tokenize(raw),
            working_dir: PathBuf::from("/repo"),
            git_repo_root: Some(PathBuf::from("/repo")),
            git_branch: branch.map(String::from),
            environment: Map::new(),
            execution_context: ExecutionContext::Human,
        }
    }

    fn deny_commit_on_main() -> Rule {
        Rule {
            name: "deny-commit-main".into(),
            commands: vec!["git".into()],
            directory: None,
            conditions: vec![
                Condition::CommandStartswith("git commit".into()),
                Condition::GitBranchIn(vec!["main".into()]),
            ],
            action: Action::Deny,
            context: RuleContext::All,
            message: "no commits on main".into(),
            allow_override: false,
            redirect_to: None,
        }
    }

    #[test]
    fn fast_path_allows_unindexed_executable_with_zero_conditions() {
        let evaluator = RuleEvaluator::new(vec![deny_commit_on_main()]);
        let cache = ConditionCache::default();
        let outcome = evaluator.evaluate(&ctx("echo hello", None), &cache);
        assert_eq!(outcome.action, Action::Allow);
        assert_eq!(outcome.conditions_evaluated, 0);
    }

    #[test]
    fn denies_commit_on_protected_branch() {
        let evaluator = RuleEvaluator::new(vec![deny_commit_on_main()]);
        let cache = ConditionCache::default();
        let outcome = evaluator.evaluate(&ctx("git commit -m x", Some("main")), &cache);
        assert_eq!(outcome.action, Action::Deny);
        assert_eq!(outcome.rule_name.as_deref(), Some("deny-commit-main"));
    }

    #[test]
    fn allows_commit_on_feature_branch() {
        let evaluator = RuleEvaluator::new(vec![deny_commit_on_main()]);
        let cache = ConditionCache::default();
        let outcome = evaluator.evaluate(&ctx("git commit -m x", Some("feature/x")), &cache);
        assert_eq!(outcome.action, Action::Allow);
    }

    #[test]
    fn aggregation_picks_most_restrictive_of_multiple_matches() {
        let mut approve_rule = deny_commit_on_main();
        approve_rule.name = "approve-push".into();
        approve_rule.conditions = vec![Condition::CommandStartswith("git".into())];
        approve_rule.action = Action::RequireApproval;

        let evaluator = RuleEvaluator::new(vec![approve_rule, deny_commit_on_main()]);
        let cache = ConditionCache::default();
        let outcome = evaluator.evaluate(&ctx("git commit -m x", Some("main")), &cache);
        assert_eq!(outcome.action, Action::Deny);
    }

    #[test]
    fn ai_only_rule_does_not_match_human_caller() {
        let mut rule = deny_commit_on_main();
        rule.context = RuleContext::AiOnly;
        let evaluator = RuleEvaluator::new(vec![rule]);
        let cache = ConditionCache::default();
        let outcome = evaluator.evaluate(&ctx("git commit -m x", Some("main")), &cache);
        assert_eq!(outcome.action, Action::Allow);
    }

    #[test]
    fn short_circuits_on_first_false_condition() {
        let mut rule = deny_commit_on_main();
        rule.conditions = vec![
            Condition::GitBranchIn(vec!["feature/x".into()]),
            Condition::CommandStartswith("git commit".into()),
        ];
        let evaluator = RuleEvaluator::new(vec![rule]);
        let cache = ConditionCache::default();
        let outcome = evaluator.evaluate(&ctx("git commit -m x", Some("main")), &cache);
        assert_eq!(outcome.action, Action::Allow);
        assert_eq!(outcome.conditions_evaluated, 1);
    }
}
