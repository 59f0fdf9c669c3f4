//! Preset and condition-rule sources.
//!
//! The queue only sees the traits; the in-memory implementations back the binary and tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::options::Preset;
use crate::domain::ConditionRule;

/// Name of the preset applied when a request names none.
pub const DEFAULT_PRESET: &str = "default";

/// Source of named presets.
#[async_trait]
pub trait PresetProvider: Send + Sync {
    async fn get(&self, name: &str) -> Option<Preset>;
    async fn list(&self) -> Vec<Preset>;
}

/// Source of condition rules, in evaluation order.
#[async_trait]
pub trait ConditionProvider: Send + Sync {
    async fn rules(&self) -> Vec<ConditionRule>;
}

/// In-memory preset registry.
#[derive(Debug, Default)]
pub struct PresetRegistry {
    presets: RwLock<BTreeMap<String, Preset>>,
}

impl PresetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a preset. Returns the previous preset with the same name.
    pub async fn insert(&self, preset: Preset) -> Option<Preset> {
        self.presets.write().await.insert(preset.name.clone(), preset)
    }

    pub async fn remove(&self, name: &str) -> Option<Preset> {
        self.presets.write().await.remove(name)
    }
}

#[async_trait]
impl PresetProvider for PresetRegistry {
    async fn get(&self, name: &str) -> Option<Preset> {
        self.presets.read().await.get(name).cloned()
    }

    async fn list(&self) -> Vec<Preset> {
        self.presets.read().await.values().cloned().collect()
    }
}

/// In-memory, ordered condition list.
#[derive(Debug, Default)]
pub struct ConditionList {
    rules: RwLock<Vec<ConditionRule>>,
}

impl ConditionList {
    pub fn new(rules: Vec<ConditionRule>) -> Self {
        Self {
            rules: RwLock::new(rules),
        }
    }

    pub async fn push(&self, rule: ConditionRule) {
        self.rules.write().await.push(rule);
    }

    /// Replace every rule.
    pub async fn set(&self, rules: Vec<ConditionRule>) {
        *self.rules.write().await = rules;
    }
}

#[async_trait]
impl ConditionProvider for ConditionList {
    async fn rules(&self) -> Vec<ConditionRule> {
        self.rules.read().await.clone()
    }
}
