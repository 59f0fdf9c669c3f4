//! Condition rules applied to extracted items at admission.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::MatchFilter;

/// A rule that rewrites or skips items whose metadata matches a filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionRule {
    pub name: String,
    /// Match filter expression, see [`MatchFilter`].
    pub filter: String,
    /// Extra command line arguments appended when the rule matches.
    #[serde(default)]
    pub cli_args: Vec<String>,
    /// Preset to switch to when the rule matches.
    #[serde(default)]
    pub preset: Option<String>,
    /// Store the item as skipped instead of downloading it.
    #[serde(default)]
    pub skip: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// What admission should do with an item after rule evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionAction {
    /// Record the item in history as skipped.
    Skip { rule: String },
    /// Re-admit with rewritten options.
    Requeue {
        rule: String,
        cli_args: Vec<String>,
        preset: Option<String>,
    },
}

impl ConditionRule {
    pub fn new(name: impl Into<String>, filter: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filter: filter.into(),
            cli_args: Vec::new(),
            preset: None,
            skip: false,
            enabled: true,
        }
    }

    pub fn with_cli_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cli_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_preset(mut self, preset: impl Into<String>) -> Self {
        self.preset = Some(preset.into());
        self
    }

    pub fn skipping(mut self) -> Self {
        self.skip = true;
        self
    }

    /// Whether this rule applies to `info`. Invalid filters never match.
    pub fn matches(&self, info: &Value) -> bool {
        if !self.enabled {
            return false;
        }
        match MatchFilter::parse(&self.filter) {
            Ok(filter) => filter.matches(info),
            Err(e) => {
                warn!(rule = %self.name, error = %e, "Ignoring condition rule with invalid filter");
                false
            }
        }
    }

    /// The action this rule produces, if it changes anything.
    pub fn action(&self) -> Option<ConditionAction> {
        if self.skip {
            return Some(ConditionAction::Skip {
                rule: self.name.clone(),
            });
        }
        if self.cli_args.is_empty() && self.preset.is_none() {
            return None;
        }
        Some(ConditionAction::Requeue {
            rule: self.name.clone(),
            cli_args: self.cli_args.clone(),
            preset: self.preset.clone(),
        })
    }
}

/// Evaluate rules in order; the first enabled matching rule wins.
pub fn evaluate_rules(rules: &[ConditionRule], info: &Value) -> Option<ConditionAction> {
    rules
        .iter()
        .find(|rule| rule.matches(info))
        .and_then(ConditionRule::action)
}
