//! Configuration for the endpoint daemon and the control client.
//!
//! Config file: `$XDG_CONFIG_HOME/mathgrade/config.toml` (or
//! `~/.config/mathgrade/config.toml`). Every section is optional.

use crate::model_selector::ModelSelectorConfig;
use crate::rpc::EndpointAddress;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const ENV_CONFIG: &str = "MATHGRADE_CONFIG";
pub const ENV_HOST: &str = "MATHGRADE_HOST";
pub const ENV_PORT: &str = "MATHGRADE_PORT";
pub const ENV_API_KEY: &str = "NVIDIA_API_KEY";

/// Where the tool endpoint listens / where callers connect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8765,
        }
    }
}

impl EndpointConfig {
    pub fn address(&self) -> EndpointAddress {
        EndpointAddress::new(self.host.clone(), self.port)
    }
}

/// Caller-side timeouts and connect policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub connect_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    /// Tool calls wait on slow remote models
    pub call_timeout_secs: u64,
    pub keepalive_timeout_secs: u64,
    /// Attempts before stepping down to transport-degraded
    pub connect_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            handshake_timeout_secs: 5,
            call_timeout_secs: 60,
            keepalive_timeout_secs: 5,
            connect_attempts: 1,
            retry_delay_ms: 2000,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.keepalive_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Remote model backend used by the endpoint's tools
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// OpenAI-compatible API root (`/chat/completions` is appended)
    pub base_url: String,
    pub api_key: Option<String>,
    /// File holding the API key, read when `api_key` is unset
    pub api_key_file: Option<PathBuf>,
    pub request_timeout_secs: u64,
    /// Upper bound on per-tool completion length
    pub max_tokens: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "https://integrate.api.nvidia.com/v1".to_string(),
            api_key: None,
            api_key_file: None,
            request_timeout_secs: 120,
            max_tokens: 2000,
        }
    }
}

impl BackendConfig {
    /// API key from config, then key file. Placeholder keys count as unset.
    pub fn resolve_api_key(&self) -> Option<String> {
        let from_file = || {
            self.api_key_file
                .as_ref()
                .and_then(|p| fs::read_to_string(p).ok())
                .map(|s| s.trim().to_string())
        };
        self.api_key
            .clone()
            .or_else(from_file)
            .filter(|k| !k.is_empty() && k != "nvapi-xxx")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for persisted grading results
    pub results_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            results_dir: base.join("mathgrade").join("results"),
        }
    }
}

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraderConfig {
    pub endpoint: EndpointConfig,
    pub client: ClientConfig,
    pub models: ModelSelectorConfig,
    pub backend: BackendConfig,
    pub storage: StorageConfig,
}

impl GraderConfig {
    /// Default user config path
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("mathgrade").join("config.toml"))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        debug!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Load configuration
    ///
    /// Priority:
    /// 1. Explicit path (`--config`)
    /// 2. `$MATHGRADE_CONFIG`
    /// 3. User config, when it exists
    /// 4. Defaults
    ///
    /// Environment overrides are applied on top.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = explicit {
            Self::from_path(path)?
        } else if let Ok(path) = std::env::var(ENV_CONFIG) {
            Self::from_path(Path::new(&path))?
        } else {
            match Self::user_config_path() {
                Some(path) if path.exists() => Self::from_path(&path)?,
                _ => Self::default(),
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `MATHGRADE_HOST`, `MATHGRADE_PORT`, `NVIDIA_API_KEY`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(ENV_HOST) {
            self.endpoint.host = host;
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.endpoint.port = port
                .parse()
                .with_context(|| format!("Invalid {}: '{}'", ENV_PORT, port))?;
        }
        if let Some(key) = lookup(ENV_API_KEY) {
            self.backend.api_key = Some(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = GraderConfig::default();
        assert_eq!(config.endpoint.port, 8765);
        assert_eq!(config.client.call_timeout(), Duration::from_secs(60));
        assert_eq!(config.client.connect_attempts, 1);
        assert_eq!(config.endpoint.address().to_string(), "localhost:8765");
    }

    #[test]
    fn test_partial_toml() {
        let config: GraderConfig = toml::from_str(
            r#"
            [endpoint]
            port = 9000

            [models]
            default_model = "local/tiny"
            "#,
        )
        .unwrap();
        assert_eq!(config.endpoint.port, 9000);
        assert_eq!(config.endpoint.host, "localhost");
        assert_eq!(config.models.default_model, "local/tiny");
        assert_eq!(config.client, ClientConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [(ENV_HOST, "10.0.0.2"), (ENV_PORT, "9100")].into();
        let mut config = GraderConfig::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.endpoint.address(), EndpointAddress::new("10.0.0.2", 9100));

        let bad: HashMap<&str, &str> = [(ENV_PORT, "http")].into();
        assert!(config
            .apply_overrides(|k| bad.get(k).map(|v| v.to_string()))
            .is_err());
    }

    #[test]
    fn test_placeholder_api_key_is_unset() {
        let backend = BackendConfig {
            api_key: Some("nvapi-xxx".to_string()),
            ..BackendConfig::default()
        };
        assert_eq!(backend.resolve_api_key(), None);
    }

    #[test]
    fn test_api_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api_key.txt");
        fs::write(&path, "nvapi-real\n").unwrap();
        let backend = BackendConfig {
            api_key_file: Some(path),
            ..BackendConfig::default()
        };
        assert_eq!(backend.resolve_api_key().as_deref(), Some("nvapi-real"));
    }
}
