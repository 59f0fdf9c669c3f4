//! Condition rule domain module.

mod filter;
mod rule;

pub use filter::{FilterParseError, MatchFilter};
pub use rule::{ConditionAction, ConditionRule, evaluate_rules};
