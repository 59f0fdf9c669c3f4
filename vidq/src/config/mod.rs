//! Configuration: process settings, layered item options, preset and condition sources.

pub mod app;
pub mod options;
pub mod providers;

pub use app::{AppConfig, MAX_RETENTION_DAYS, MAX_WINDOW_SECS};
pub use options::{OptionsBuilder, Preset, UserOptions};
pub use providers::{
    ConditionList, ConditionProvider, DEFAULT_PRESET, PresetProvider, PresetRegistry,
};
