//! Daemon configuration, loaded from a TOML file.
//!
//! Each OAuth2 provider is declared under `[auth.providers.<id>]` with a
//! `kind` tag selecting the provider shape. GitHub endpoint URLs default to
//! the public service but can be overridden, which is how the tests point a
//! handler at a local mock provider.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub feeds: FeedsConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// How long a pending login may sit between the redirect to the provider
    /// and the callback. Minutes, not hours: this also bounds the window in
    /// which a captured authorization code can be replayed.
    #[serde(default = "default_login_state_ttl")]
    pub login_state_ttl_secs: u64,
    #[serde(default = "default_session_token_ttl")]
    pub session_token_ttl_secs: u64,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            login_state_ttl_secs: default_login_state_ttl(),
            session_token_ttl_secs: default_session_token_ttl(),
            providers: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderConfig {
    Github {
        client_id: String,
        client_secret: String,
        #[serde(default)]
        redirect_uri: Option<String>,
        #[serde(default = "default_github_authorize_url")]
        authorize_url: String,
        #[serde(default = "default_github_token_url")]
        token_url: String,
        #[serde(default = "default_github_user_api_url")]
        user_api_url: String,
    },
    Nextcloud {
        base_url: String,
        client_id: String,
        client_secret: String,
        #[serde(default)]
        redirect_uri: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedsConfig {
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
}

impl Default for FeedsConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8732
}

fn default_login_state_ttl() -> u64 {
    300
}

fn default_session_token_ttl() -> u64 {
    30 * 24 * 60 * 60
}

fn default_refresh_interval() -> u64 {
    600
}

fn default_github_authorize_url() -> String {
    "https://github.com/login/oauth/authorize".to_string()
}

fn default_github_token_url() -> String {
    "https://github.com/login/oauth/access_token".to_string()
}

fn default_github_user_api_url() -> String {
    "https://api.github.com/user".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let raw = r#"
debug = true

[server]
host = "0.0.0.0"
port = 9000

[database]
path = "/var/lib/feedr/feedr.db"

[auth]
login_state_ttl_secs = 120

[auth.providers.github]
kind = "github"
client_id = "abc"
client_secret = "def"

[auth.providers.cloud]
kind = "nextcloud"
base_url = "https://cloud.example.com"
client_id = "cid"
client_secret = "csec"
redirect_uri = "https://feedr.example.com/auth/cloud/authorized"

[feeds]
refresh_interval_secs = 60
"#;
        let config: Config = toml::from_str(raw).expect("config should parse");
        assert!(config.debug);
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.auth.login_state_ttl_secs, 120);
        assert_eq!(config.feeds.refresh_interval_secs, 60);
        assert_eq!(config.auth.providers.len(), 2);
        match config.auth.providers.get("github") {
            Some(ProviderConfig::Github { authorize_url, .. }) => {
                assert_eq!(authorize_url, "https://github.com/login/oauth/authorize");
            }
            other => panic!("unexpected provider config: {other:?}"),
        }
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let raw = r#"
[database]
path = "feedr.db"
"#;
        let config: Config = toml::from_str(raw).expect("config should parse");
        assert!(!config.debug);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.auth.login_state_ttl_secs, 300);
        assert_eq!(config.feeds.refresh_interval_secs, 600);
        assert!(config.auth.providers.is_empty());
    }
}
