use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Process-wide broker configuration.
///
/// Every field carries a default so a missing or partial configuration file
/// always yields a runnable broker.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub transport: TransportConfig,
    pub discovery: DiscoveryConfig,
    pub network: NetworkConfig,
    pub queue: QueueConfig,
}

/// Listening endpoint and admission policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub certificate_path: Option<PathBuf>,
    pub allowed_origins: Vec<String>,
    pub max_connections: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 8765,
            use_tls: false,
            certificate_path: None,
            allowed_origins: vec!["*".to_owned()],
            max_connections: 32,
        }
    }
}

impl TransportConfig {
    /// Returns the bind address in `host:port` form.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns whether `origin` passes the allow-list.
    #[must_use]
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.allowed_origins.iter().any(|entry| entry == "*") {
            return true;
        }
        match origin {
            Some(origin) => self
                .allowed_origins
                .iter()
                .any(|entry| entry.eq_ignore_ascii_case(origin)),
            None => false,
        }
    }
}

/// Periodic rediscovery behaviour. The per-kind toggles gate that kind's
/// sweep participation; `enable_network` gates the on-demand subnet scan,
/// which is the only discovery the network kind has.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub interval_ms: u64,
    pub enable_printer: bool,
    pub enable_serial: bool,
    pub enable_usb_hid: bool,
    pub enable_network: bool,
    pub enable_biometric: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            enable_printer: true,
            enable_serial: true,
            enable_usb_hid: true,
            enable_network: true,
            enable_biometric: true,
        }
    }
}

impl DiscoveryConfig {
    /// Returns the rediscovery period.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Device-side TCP budgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub default_timeout_ms: u64,
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
            max_connections: 16,
        }
    }
}

impl NetworkConfig {
    /// Returns the default connect/I-O timeout.
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Durable operation queue behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub database_path: Option<PathBuf>,
    pub retry_interval_ms: u64,
    pub max_retry_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            retry_interval_ms: 5_000,
            max_retry_attempts: 3,
        }
    }
}

impl QueueConfig {
    /// Returns the worker tick period.
    #[must_use]
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl BrokerConfig {
    /// Loads configuration from `path`, treating a missing file as defaults.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(error) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source: error,
                });
            }
        };
        serde_json::from_str(&raw).map_err(|error| ConfigError::Parse {
            path: path.display().to_string(),
            source: error,
        })
    }

    /// Persists the configuration to `path` as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error when the parent directory cannot be created or the
    /// file cannot be written.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write = |path: &Path| -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let rendered = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
            std::fs::write(path, rendered)
        };
        write(path).map_err(|error| ConfigError::Write {
            path: path.display().to_string(),
            source: error,
        })
    }

    /// Returns the platform-default configuration file location.
    ///
    /// # Errors
    ///
    /// Returns an error when no home directory can be resolved.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let dirs = ProjectDirs::from("", "", "hwbridge").ok_or(ConfigError::NoProjectDirs)?;
        Ok(dirs.config_dir().join("config.json"))
    }

    /// Returns the queue database path, falling back to the platform data dir.
    ///
    /// # Errors
    ///
    /// Returns an error when no home directory can be resolved.
    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.queue.database_path {
            return Ok(path.clone());
        }
        let dirs = ProjectDirs::from("", "", "hwbridge").ok_or(ConfigError::NoProjectDirs)?;
        Ok(dirs.data_dir().join("queue.db"))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[test]
    fn defaults_match_documented_budgets() {
        let config = BrokerConfig::default();
        assert_eq!(30_000, config.discovery.interval_ms);
        assert_eq!(5_000, config.network.default_timeout_ms);
        assert_eq!(5_000, config.queue.retry_interval_ms);
        assert_eq!(3, config.queue.max_retry_attempts);
        assert_eq!(vec!["*".to_owned()], config.transport.allowed_origins);
    }

    #[rstest]
    #[case(vec!["*"], None, true)]
    #[case(vec!["*"], Some("https://evil.example"), true)]
    #[case(vec!["https://app.example"], Some("https://app.example"), true)]
    #[case(vec!["https://app.example"], Some("https://APP.example"), true)]
    #[case(vec!["https://app.example"], Some("https://other.example"), false)]
    #[case(vec!["https://app.example"], None, false)]
    fn origin_allow_list_honours_wildcard(
        #[case] allowed: Vec<&str>,
        #[case] origin: Option<&str>,
        #[case] expected: bool,
    ) {
        let transport = TransportConfig {
            allowed_origins: allowed.into_iter().map(str::to_owned).collect(),
            ..TransportConfig::default()
        };
        assert_eq!(expected, transport.origin_allowed(origin));
    }

    #[test]
    fn partial_files_fall_back_to_defaults() {
        let parsed: BrokerConfig =
            serde_json::from_str(r#"{"transport":{"port":9000}}"#).expect("partial should parse");
        assert_eq!(9000, parsed.transport.port);
        assert_eq!("127.0.0.1", parsed.transport.host);
        assert_eq!(30_000, parsed.discovery.interval_ms);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.json");
        let mut config = BrokerConfig::default();
        config.transport.port = 9123;
        config.queue.max_retry_attempts = 7;

        config.save(&path).expect("save should succeed");
        let loaded = BrokerConfig::load(&path).expect("load should succeed");
        assert_eq!(config, loaded);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let loaded = BrokerConfig::load(Path::new("/nonexistent/hwbridge/config.json"))
            .expect("missing file should not error");
        assert_eq!(BrokerConfig::default(), loaded);
    }
}
