//! Settings model and resolution

mod resolve;
mod types;

pub use resolve::{ConfigError, SettingsOverrides, load_settings_file, resolve_settings};
pub use types::{
    DEFAULT_ENDPOINT, DEFAULT_RELOAD_GRACE, DEFAULT_RETRY_DELAY, DEFAULT_WAIT, Endpoint, Settings,
    ConsulSection, RendererSection, SettingsFile, WatchEntry, WatchPair,
};
