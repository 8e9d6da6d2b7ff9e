use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "CHAT_PDFS_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    /// Bearer token -> user id
    pub api_tokens: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3737,
            db_path: PathBuf::from("chat-pdfs.db"),
            api_tokens: HashMap::new(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_url: String,
    pub api_token: Option<String>,
    /// Where the selection cache persists its local copy
    pub storage_path: PathBuf,
    pub max_sync_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:3737".to_string(),
            api_token: None,
            storage_path: PathBuf::from("selection.db"),
            max_sync_attempts: 3,
            retry_backoff_ms: 250,
        }
    }
}

impl ClientConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl AppConfig {
    /// Reads `path` if given, otherwise starts from defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// File named by `CHAT_PDFS_CONFIG` (if any), then process env overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        let mut config = Self::load(path.as_deref())?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(host) = lookup("CHAT_PDFS_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("CHAT_PDFS_PORT") {
            self.server.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                key: "CHAT_PDFS_PORT",
                value: port.clone(),
            })?;
        }
        if let Some(db) = lookup("CHAT_PDFS_DB") {
            self.server.db_path = PathBuf::from(db);
        }
        if let Some(tokens) = lookup("CHAT_PDFS_TOKENS") {
            self.server.api_tokens = parse_tokens(&tokens)?;
        }
        if let Some(url) = lookup("CHAT_PDFS_SERVER_URL") {
            self.client.server_url = url;
        }
        if let Some(token) = lookup("CHAT_PDFS_API_TOKEN") {
            self.client.api_token = Some(token);
        }
        Ok(())
    }
}

/// Parses `token=user,token2=user2`.
fn parse_tokens(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((token, user)) if !token.trim().is_empty() && !user.trim().is_empty() => {
                Ok((token.trim().to_string(), user.trim().to_string()))
            }
            _ => Err(ConfigError::InvalidValue {
                key: "CHAT_PDFS_TOKENS",
                value: pair.to_string(),
            }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_default() {
        let config = AppConfig::load(None).unwrap();
        assert_eq!(config.server.bind_addr(), "127.0.0.1:3737");
        assert!(config.server.api_tokens.is_empty());
        assert_eq!(config.client.max_sync_attempts, 3);
        assert_eq!(config.client.retry_backoff(), Duration::from_millis(250));
    }

    #[test]
    fn test_config_file_partial() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"server": {{"port": 9000, "api_tokens": {{"t1": "alice"}}}}}}"#
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.api_tokens.get("t1").unwrap(), "alice");
        assert_eq!(config.client.server_url, "http://127.0.0.1:3737");
    }

    #[test]
    fn test_config_file_invalid() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            AppConfig::load(Some(file.path())),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::default();
        config
            .apply_overrides(|key| match key {
                "CHAT_PDFS_PORT" => Some("8081".to_string()),
                "CHAT_PDFS_TOKENS" => Some("a=alice, b=bob".to_string()),
                "CHAT_PDFS_API_TOKEN" => Some("a".to_string()),
                _ => None,
            })
            .unwrap();

        assert_eq!(config.server.port, 8081);
        assert_eq!(config.server.api_tokens.len(), 2);
        assert_eq!(config.server.api_tokens.get("b").unwrap(), "bob");
        assert_eq!(config.client.api_token.as_deref(), Some("a"));
    }

    #[test]
    fn test_env_overrides_reject_garbage() {
        let mut config = AppConfig::default();
        let err = config
            .apply_overrides(|key| (key == "CHAT_PDFS_PORT").then(|| "http".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "CHAT_PDFS_PORT", .. }));

        let err = config
            .apply_overrides(|key| (key == "CHAT_PDFS_TOKENS").then(|| "lonely".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "CHAT_PDFS_TOKENS", .. }));
    }
}
