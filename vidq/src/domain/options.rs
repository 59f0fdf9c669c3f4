//! Per-item download options.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Immutable options attached to a download record.
///
/// Built once per item by [`crate::config::OptionsBuilder`] and carried through admission,
/// requeue and retry unchanged except for the fields a condition rule rewrites.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemOptions {
    /// Name of the preset the options were resolved from.
    #[serde(default)]
    pub preset: Option<String>,
    /// Sub-folder under the download root.
    #[serde(default)]
    pub folder: Option<String>,
    /// yt-dlp output template.
    #[serde(default)]
    pub template: Option<String>,
    /// Extra command line arguments for the download process.
    #[serde(default)]
    pub cli_args: Vec<String>,
    /// Template variables, e.g. playlist metadata for playlist entries.
    #[serde(default)]
    pub extras: BTreeMap<String, String>,
    /// Set once a condition rule has rewritten these options.
    #[serde(default)]
    pub requeued: bool,
}

impl ItemOptions {
    /// Set a template variable.
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }

    /// Options rewritten by a condition rule.
    ///
    /// Extra arguments are appended after the existing ones so they take precedence on the
    /// command line.
    pub fn requeue_with(&self, cli_args: &[String], preset: Option<&str>) -> Self {
        let mut next = self.clone();
        next.cli_args.extend(cli_args.iter().cloned());
        if let Some(preset) = preset {
            next.preset = Some(preset.to_string());
        }
        next.requeued = true;
        next
    }
}
