//! Layered per-item options.
//!
//! Three layers feed one immutable [`ItemOptions`]: what the caller asked for, the selected
//! preset, and the process defaults. Scalars take the first layer that sets them; command
//! line arguments accumulate default, then preset, then user, so later ones win on the yt-dlp
//! command line.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::providers::{DEFAULT_PRESET, PresetProvider};
use crate::domain::ItemOptions;
use crate::{Error, Result};

/// Options a caller may set on an add request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserOptions {
    pub preset: Option<String>,
    pub folder: Option<String>,
    pub template: Option<String>,
    pub cli_args: Vec<String>,
    pub extras: BTreeMap<String, String>,
}

/// Named bundle of download options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preset {
    pub name: String,
    pub folder: Option<String>,
    pub template: Option<String>,
    pub cli_args: Vec<String>,
}

impl Preset {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = Some(folder.into());
        self
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn with_cli_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cli_args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Resolves [`UserOptions`] into [`ItemOptions`].
#[derive(Debug, Clone, Default)]
pub struct OptionsBuilder {
    default_folder: Option<String>,
    default_template: Option<String>,
    default_cli_args: Vec<String>,
}

impl OptionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_folder(mut self, folder: Option<String>) -> Self {
        self.default_folder = folder;
        self
    }

    pub fn with_default_template(mut self, template: Option<String>) -> Self {
        self.default_template = template;
        self
    }

    pub fn with_default_cli_args(mut self, args: Vec<String>) -> Self {
        self.default_cli_args = args;
        self
    }

    /// Resolve the options of a new item.
    ///
    /// A named preset that does not exist is an admission error. Without a name, the
    /// `default` preset is used when one is registered.
    pub async fn build(
        &self,
        presets: &dyn PresetProvider,
        user: &UserOptions,
    ) -> Result<ItemOptions> {
        let preset = match user.preset.as_deref() {
            Some(name) => Some(
                presets
                    .get(name)
                    .await
                    .ok_or_else(|| Error::admission(format!("Unknown preset: {name}")))?,
            ),
            None => presets.get(DEFAULT_PRESET).await,
        };
        Ok(self.merge(preset.as_ref(), user))
    }

    /// Re-resolve an item's options against another preset, keeping what the user set.
    pub async fn rebase(
        &self,
        presets: &dyn PresetProvider,
        current: &ItemOptions,
        preset_name: &str,
    ) -> Result<ItemOptions> {
        let preset = presets
            .get(preset_name)
            .await
            .ok_or_else(|| Error::admission(format!("Unknown preset: {preset_name}")))?;
        let mut next = current.clone();
        next.preset = Some(preset.name.clone());
        if let Some(folder) = preset.folder.clone() {
            next.folder = Some(folder);
        }
        if let Some(template) = preset.template.clone() {
            next.template = Some(template);
        }
        next.cli_args.extend(preset.cli_args.iter().cloned());
        Ok(next)
    }

    fn merge(&self, preset: Option<&Preset>, user: &UserOptions) -> ItemOptions {
        let mut cli_args = self.default_cli_args.clone();
        if let Some(preset) = preset {
            cli_args.extend(preset.cli_args.iter().cloned());
        }
        cli_args.extend(user.cli_args.iter().cloned());

        let options = ItemOptions {
            preset: preset.map(|p| p.name.clone()),
            folder: user
                .folder
                .clone()
                .or_else(|| preset.and_then(|p| p.folder.clone()))
                .or_else(|| self.default_folder.clone()),
            template: user
                .template
                .clone()
                .or_else(|| preset.and_then(|p| p.template.clone()))
                .or_else(|| self.default_template.clone()),
            cli_args,
            extras: user.extras.clone(),
            requeued: false,
        };
        debug!(preset = ?options.preset, folder = ?options.folder, "Resolved item options");
        options
    }
}
