//! Settings resolution

use super::types::{
    DEFAULT_ENDPOINT, DEFAULT_RELOAD_GRACE, DEFAULT_RETRY_DELAY, DEFAULT_WAIT, Endpoint, Settings,
    SettingsFile, WatchPair,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Settings file could not be read
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Consul address is neither a URL, a host:port pair nor a socket path
    #[error("invalid Consul address '{value}': {reason}")]
    InvalidEndpoint { value: String, reason: String },

    /// Watch mapping is not of the form FROM:TO
    #[error("invalid watch pair '{value}': expected FROM:TO")]
    InvalidWatchPair { value: String },

    /// Required setting absent from every source
    #[error("missing required setting: {0}")]
    MissingField(&'static str),

    /// No prefix → directory mapping configured
    #[error("at least one FROM:TO watch pair is required")]
    NoWatchPairs,

    /// Blocking listings need a positive wait
    #[error("long-poll wait must be greater than zero")]
    ZeroWait,
}

/// Command-line overrides for settings
#[derive(Debug, Default, Clone)]
pub struct SettingsOverrides {
    /// Path to an optional TOML settings file
    pub settings_path: Option<PathBuf>,
    /// Override Consul address
    pub endpoint: Option<String>,
    /// Override ACL token
    pub token: Option<String>,
    /// Override renderer binary
    pub renderer_bin: Option<PathBuf>,
    /// Override renderer config path
    pub renderer_config: Option<PathBuf>,
    /// Watch pairs given on the command line (appended to file pairs)
    pub pairs: Vec<WatchPair>,
    /// Override long-poll wait
    pub wait: Option<Duration>,
    /// Override listing retry delay
    pub retry_delay: Option<Duration>,
    /// Override renderer spawn retry delay
    pub spawn_retry_delay: Option<Duration>,
    /// Override reload grace period
    pub reload_grace: Option<Duration>,
}

/// Settings with every source merged but defaults not yet applied
#[derive(Debug, Default)]
struct PartialSettings {
    endpoint: Option<String>,
    token: Option<String>,
    renderer_bin: Option<PathBuf>,
    renderer_config: Option<PathBuf>,
    pairs: Vec<WatchPair>,
    wait: Option<Duration>,
    retry_delay: Option<Duration>,
    spawn_retry_delay: Option<Duration>,
    reload_grace: Option<Duration>,
}

/// Resolve settings from all sources
///
/// Priority (highest to lowest):
/// 1. Command-line overrides
/// 2. Environment variables (`CONSUL_HTTP_ADDR`, `CONSUL_HTTP_TOKEN`)
/// 3. Settings file (`--settings`)
/// 4. Defaults
///
/// Watch pairs are additive: file pairs first, then command-line pairs.
pub fn resolve_settings(overrides: &SettingsOverrides) -> Result<Settings, ConfigError> {
    let mut partial = PartialSettings::default();

    // 3. Settings file
    if let Some(path) = &overrides.settings_path {
        let file = load_settings_file(path)?;
        merge_file(&mut partial, file)?;
        debug!("Merged settings file {}", path.display());
    }

    // 2. Environment
    apply_env_overrides(&mut partial);

    // 1. Command line
    apply_cli_overrides(&mut partial, overrides);

    let endpoint: Endpoint = partial
        .endpoint
        .as_deref()
        .unwrap_or(DEFAULT_ENDPOINT)
        .parse()?;

    let settings = Settings {
        endpoint,
        token: partial.token.filter(|t| !t.is_empty()),
        renderer_bin: partial
            .renderer_bin
            .ok_or(ConfigError::MissingField("renderer binary"))?,
        renderer_config: partial
            .renderer_config
            .ok_or(ConfigError::MissingField("renderer config path"))?,
        pairs: partial.pairs,
        wait: partial.wait.unwrap_or(DEFAULT_WAIT),
        retry_delay: partial.retry_delay.unwrap_or(DEFAULT_RETRY_DELAY),
        spawn_retry_delay: partial.spawn_retry_delay.unwrap_or(DEFAULT_RETRY_DELAY),
        reload_grace: partial.reload_grace.unwrap_or(DEFAULT_RELOAD_GRACE),
    };

    settings.validate()?;
    Ok(settings)
}

/// Load settings from a TOML file
pub fn load_settings_file(path: &Path) -> Result<SettingsFile, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let file: SettingsFile = toml::from_str(&contents)?;
    Ok(file)
}

fn merge_file(base: &mut PartialSettings, file: SettingsFile) -> Result<(), ConfigError> {
    base.endpoint = file.consul.address;
    base.token = file.consul.token;
    base.wait = file.consul.wait_secs.map(Duration::from_secs);
    base.retry_delay = file.consul.retry_secs.map(Duration::from_secs);

    base.renderer_bin = file.renderer.bin;
    base.renderer_config = file.renderer.config;
    base.reload_grace = file.renderer.reload_grace_ms.map(Duration::from_millis);
    base.spawn_retry_delay = file.renderer.spawn_retry_secs.map(Duration::from_secs);

    for entry in file.watch {
        let pair = WatchPair::new(&entry.from, entry.to);
        if pair.prefix.is_empty() || pair.directory.as_os_str().is_empty() {
            return Err(ConfigError::InvalidWatchPair {
                value: format!("{}:{}", entry.from, pair.directory.display()),
            });
        }
        base.pairs.push(pair);
    }

    Ok(())
}

fn apply_env_overrides(base: &mut PartialSettings) {
    if let Ok(addr) = std::env::var("CONSUL_HTTP_ADDR")
        && !addr.is_empty()
    {
        base.endpoint = Some(addr);
    }
    if let Ok(token) = std::env::var("CONSUL_HTTP_TOKEN")
        && !token.is_empty()
    {
        base.token = Some(token);
    }
}

fn apply_cli_overrides(base: &mut PartialSettings, overrides: &SettingsOverrides) {
    if let Some(endpoint) = &overrides.endpoint {
        base.endpoint = Some(endpoint.clone());
    }
    if let Some(token) = &overrides.token {
        base.token = Some(token.clone());
    }
    if let Some(bin) = &overrides.renderer_bin {
        base.renderer_bin = Some(bin.clone());
    }
    if let Some(config) = &overrides.renderer_config {
        base.renderer_config = Some(config.clone());
    }
    if let Some(wait) = overrides.wait {
        base.wait = Some(wait);
    }
    if let Some(delay) = overrides.retry_delay {
        base.retry_delay = Some(delay);
    }
    if let Some(delay) = overrides.spawn_retry_delay {
        base.spawn_retry_delay = Some(delay);
    }
    if let Some(grace) = overrides.reload_grace {
        base.reload_grace = Some(grace);
    }
    base.pairs.extend(overrides.pairs.iter().cloned());
}
