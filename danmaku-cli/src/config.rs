use anyhow::{Context, Result};
use danmaku::LiveConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Contents of `config.toml`.
///
/// ```toml
/// cookies = "SESSDATA=...; bili_jct=...; DedeUserID=..."
///
/// [live]
/// heartbeat_interval_secs = 30
///
/// [live.reconnect]
/// max_attempts = 5
/// delay_ms = 3000
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub cookies: Option<String>,
    pub live: LiveConfig,
}

impl AppConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("bili-danmaku").join("config.toml"))
    }

    /// Load from `path`, or from the default location if it exists.
    ///
    /// An explicit path must exist; a missing default file just means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_default() {
        assert_eq!(AppConfig::parse("").unwrap(), AppConfig::default());
    }

    #[test]
    fn test_partial_config() {
        let config = AppConfig::parse(
            r#"
            cookies = "SESSDATA=abc; DedeUserID=42"

            [live]
            heartbeat_interval_secs = 20

            [live.reconnect]
            max_attempts = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.cookies.as_deref(), Some("SESSDATA=abc; DedeUserID=42"));
        assert_eq!(config.live.heartbeat_interval_secs, 20);
        assert_eq!(config.live.handshake_timeout_secs, 10);
        assert_eq!(config.live.reconnect.max_attempts, 3);
        assert_eq!(config.live.reconnect.delay_ms, 3000);
    }

    #[test]
    fn test_missing_explicit_file_fails() {
        assert!(AppConfig::load(Some(Path::new("/nonexistent/bili-danmaku.toml"))).is_err());
    }
}
