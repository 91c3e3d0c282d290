pub mod cache;
pub mod defaults;
pub mod engine;
pub mod loader;
pub mod schema;

pub use cache::{ConditionCache, RuleCache};
pub use engine::{EvaluationOutcome, RuleEvaluator};
pub use loader::load_rules;
pub use schema::{Action, Condition, Rule, RuleContext, RuleOverride, RuleSet};
