//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The session cookie and the initial access token are loaded from the
//! environment (or a cookie file), never stored in the TOML directly.

use common::Secret;
use serde::Deserialize;
use session_auth::{DEFAULT_LOGOUT_PATH, DEFAULT_REFRESH_PATH};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use transport::HeaderInjection;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub headers: Vec<HeaderInjection>,
}

/// Upstream rules API and its session endpoints
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default = "default_refresh_path")]
    pub refresh_path: String,
    #[serde(default = "default_logout_path")]
    pub logout_path: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_secs: u64,
    #[serde(default = "default_auth_failure_statuses")]
    pub auth_failure_statuses: Vec<u16>,
    /// Path to a file holding the session cookie (alternative to SESSION_COOKIE)
    #[serde(default)]
    pub session_cookie_file: Option<PathBuf>,
    #[serde(skip)]
    pub session_cookie: Option<Secret<String>>,
    #[serde(skip)]
    pub access_token: Option<Secret<String>>,
}

/// Local listener settings
#[derive(Debug, Deserialize)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_refresh_path() -> String {
    DEFAULT_REFRESH_PATH.to_string()
}

fn default_logout_path() -> String {
    DEFAULT_LOGOUT_PATH.to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_refresh_timeout() -> u64 {
    10
}

fn default_auth_failure_statuses() -> Vec<u16> {
    auth_client::DEFAULT_AUTH_FAILURE_STATUSES.to_vec()
}

fn default_max_connections() -> usize {
    1000
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Session cookie resolution order:
    /// 1. SESSION_COOKIE env var
    /// 2. session_cookie_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        if let Ok(cookie) = std::env::var("SESSION_COOKIE") {
            config.api.session_cookie = Some(cookie)
                .filter(|c| !c.trim().is_empty())
                .map(|c| Secret::new(c.trim().to_owned()));
        } else if let Some(ref cookie_file) = config.api.session_cookie_file {
            config.api.session_cookie = common::read_secret_file(cookie_file)?;
        }

        config.api.access_token = std::env::var("ACCESS_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty())
            .map(Secret::new);

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                self.api.base_url
            )));
        }

        for (name, path) in [
            ("refresh_path", &self.api.refresh_path),
            ("logout_path", &self.api.logout_path),
        ] {
            if !path.starts_with('/') {
                return Err(common::Error::Config(format!(
                    "{name} must start with '/', got: {path}"
                )));
            }
        }

        if self.api.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if self.api.refresh_timeout_secs == 0 {
            return Err(common::Error::Config(
                "refresh_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.api.auth_failure_statuses.is_empty() {
            return Err(common::Error::Config(
                "auth_failure_statuses must not be empty".into(),
            ));
        }
        if let Some(bad) = self
            .api
            .auth_failure_statuses
            .iter()
            .find(|s| !(400..=599).contains(*s))
        {
            return Err(common::Error::Config(format!(
                "auth_failure_statuses must be 4xx/5xx codes, got: {bad}"
            )));
        }

        if self.gateway.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("rules-api-gateway.toml")
    }
}
