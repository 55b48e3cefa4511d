//! Settings types

use super::resolve::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Consul agent address used when nothing else is configured
pub const DEFAULT_ENDPOINT: &str = "127.0.0.1:8500";

/// Long-poll wait passed to blocking KV listings
pub const DEFAULT_WAIT: Duration = Duration::from_secs(10);

/// Fixed delay after a failed listing request or a failed renderer spawn
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Delay between spawning the renderer and its first hang-up
pub const DEFAULT_RELOAD_GRACE: Duration = Duration::from_secs(1);

/// Address of the Consul agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// HTTP(S) base URL, e.g. `http://127.0.0.1:8500`
    Http(Url),
    /// Local unix domain socket the agent listens on
    Socket(PathBuf),
}

impl Endpoint {
    /// Base URL without a trailing slash, for HTTP endpoints.
    pub fn base_url(&self) -> Option<&str> {
        match self {
            Self::Http(url) => Some(url.as_str().trim_end_matches('/')),
            Self::Socket(_) => None,
        }
    }
}

impl FromStr for Endpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = |reason: &str| ConfigError::InvalidEndpoint {
            value: s.to_string(),
            reason: reason.to_string(),
        };

        if s.is_empty() {
            return Err(invalid("empty address"));
        }

        if let Some(rest) = s.strip_prefix("unix://").or_else(|| s.strip_prefix("unix:")) {
            if rest.is_empty() {
                return Err(invalid("missing socket path"));
            }
            return Ok(Self::Socket(PathBuf::from(rest)));
        }

        if s.starts_with('/') || s.starts_with("./") {
            return Ok(Self::Socket(PathBuf::from(s)));
        }

        let candidate = if s.contains("://") {
            s.to_string()
        } else {
            format!("http://{s}")
        };
        let url = Url::parse(&candidate).map_err(|e| invalid(&e.to_string()))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid("scheme must be http, https or unix"));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(invalid("missing host"));
        }

        Ok(Self::Http(url))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(url) => write!(f, "{}", url.as_str().trim_end_matches('/')),
            Self::Socket(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// One remote prefix mirrored into one local directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchPair {
    /// KV prefix, without a leading slash
    pub prefix: String,
    /// Directory templates under `prefix` are written to
    pub directory: PathBuf,
}

impl WatchPair {
    pub fn new(prefix: impl AsRef<str>, directory: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.as_ref().trim_start_matches('/').to_string(),
            directory: directory.into(),
        }
    }

    /// Local path for a remote key: the pair directory joined with the key's basename.
    pub fn local_path(&self, key: &str) -> PathBuf {
        let basename = key.rsplit('/').next().unwrap_or(key);
        self.directory.join(basename)
    }
}

impl FromStr for WatchPair {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidWatchPair {
            value: s.to_string(),
        };

        let (from, to) = s.split_once(':').ok_or_else(invalid)?;
        let from = from.trim();
        let to = to.trim();
        if from.trim_start_matches('/').is_empty() || to.is_empty() {
            return Err(invalid());
        }

        Ok(Self::new(from, to))
    }
}

impl fmt::Display for WatchPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.prefix, self.directory.display())
    }
}

/// Fully resolved runtime settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Consul agent address
    pub endpoint: Endpoint,
    /// ACL token sent as `X-Consul-Token`
    pub token: Option<String>,
    /// Renderer binary (consul-template)
    pub renderer_bin: PathBuf,
    /// Renderer config file; the generated block lives here
    pub renderer_config: PathBuf,
    /// Prefix → directory mappings, in configuration order
    pub pairs: Vec<WatchPair>,
    /// Long-poll wait for blocking listings
    pub wait: Duration,
    /// Delay after a failed listing request
    pub retry_delay: Duration,
    /// Delay after a failed renderer spawn
    pub spawn_retry_delay: Duration,
    /// Delay between a renderer spawn and its first hang-up
    pub reload_grace: Duration,
}

impl Settings {
    /// Check the invariants the daemon relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pairs.is_empty() {
            return Err(ConfigError::NoWatchPairs);
        }
        if self.renderer_bin.as_os_str().is_empty() {
            return Err(ConfigError::MissingField("renderer binary"));
        }
        if self.renderer_config.as_os_str().is_empty() {
            return Err(ConfigError::MissingField("renderer config path"));
        }
        if self.wait.is_zero() {
            return Err(ConfigError::ZeroWait);
        }
        Ok(())
    }

    /// Directories that must exist before the watchers start writing.
    pub fn directories(&self) -> impl Iterator<Item = &Path> {
        self.pairs.iter().map(|p| p.directory.as_path())
    }
}

/// On-disk settings file (`--settings`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub consul: ConsulSection,
    #[serde(default)]
    pub renderer: RendererSection,
    #[serde(default)]
    pub watch: Vec<WatchEntry>,
}

/// `[consul]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsulSection {
    pub address: Option<String>,
    pub token: Option<String>,
    pub wait_secs: Option<u64>,
    pub retry_secs: Option<u64>,
}

/// `[renderer]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RendererSection {
    pub bin: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub reload_grace_ms: Option<u64>,
    pub spawn_retry_secs: Option<u64>,
}

/// `[[watch]]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEntry {
    pub from: String,
    pub to: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_bare_host_port() {
        let endpoint: Endpoint = "consul.service:8500".parse().unwrap();
        assert_eq!(endpoint.base_url(), Some("http://consul.service:8500"));
    }

    #[test]
    fn test_endpoint_https_url() {
        let endpoint: Endpoint = "https://consul.example.com:8501/".parse().unwrap();
        assert_eq!(endpoint.to_string(), "https://consul.example.com:8501");
    }

    #[test]
    fn test_endpoint_socket_forms() {
        for raw in ["unix:///var/run/consul.sock", "unix:/var/run/consul.sock", "/var/run/consul.sock"] {
            let endpoint: Endpoint = raw.parse().unwrap();
            assert_eq!(
                endpoint,
                Endpoint::Socket(PathBuf::from("/var/run/consul.sock")),
                "{raw}"
            );
        }
    }

    #[test]
    fn test_endpoint_rejects_garbage() {
        assert!("".parse::<Endpoint>().is_err());
        assert!("unix:".parse::<Endpoint>().is_err());
        assert!("ftp://host:21".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_default_endpoint_parses() {
        let endpoint: Endpoint = DEFAULT_ENDPOINT.parse().unwrap();
        assert_eq!(endpoint.to_string(), "http://127.0.0.1:8500");
    }

    #[test]
    fn test_watch_pair_parse() {
        let pair: WatchPair = "/service/web/templates:/etc/ct/web".parse().unwrap();
        assert_eq!(pair.prefix, "service/web/templates");
        assert_eq!(pair.directory, PathBuf::from("/etc/ct/web"));
    }

    #[test]
    fn test_watch_pair_rejects_missing_halves() {
        assert!("no-separator".parse::<WatchPair>().is_err());
        assert!(":/etc/ct".parse::<WatchPair>().is_err());
        assert!("prefix:".parse::<WatchPair>().is_err());
    }

    #[test]
    fn test_local_path_uses_basename() {
        let pair = WatchPair::new("service/web", "/etc/ct");
        assert_eq!(
            pair.local_path("service/web/nested/nginx.conf.ctmpl"),
            PathBuf::from("/etc/ct/nginx.conf.ctmpl")
        );
        assert_eq!(pair.local_path("flat.ctmpl"), PathBuf::from("/etc/ct/flat.ctmpl"));
    }
}
