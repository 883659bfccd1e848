use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use url::Url;

const DEFAULT_API_URL: &str = "https://vehicle.kietpep1303.com/api";
const DEFAULT_SOCKET_URL: &str = "wss://vehicle.kietpep1303.com/admin";
const CREDENTIALS_FILE_NAME: &str = "credentials.json";

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// REST base endpoint, e.g. `https://host/api`
    pub api_base_url: String,

    /// Realtime channel endpoint (admin namespace)
    pub socket_url: String,

    /// Ceiling for every HTTP request
    pub request_timeout_ms: u64,

    /// Page size requested by the live request lists
    pub page_limit: u32,

    /// Interval between keep-alive pings on the realtime channel
    pub heartbeat_secs: u64,

    /// Where the encrypted credential pair lives; defaults to the user data dir
    pub credentials_path: Option<PathBuf>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            socket_url: DEFAULT_SOCKET_URL.to_string(),
            request_timeout_ms: 10_000,
            page_limit: 5,
            heartbeat_secs: 30,
            credentials_path: None,
        }
    }
}

impl AdminConfig {
    /// Defaults, then the optional TOML file, then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.normalize()?;

        debug!("Loaded configuration: api={}, socket={}", config.api_base_url, config.socket_url);
        Ok(config)
    }

    /// Read a TOML config file; missing keys fall back to defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Apply `ADMIN_*` overrides using the given variable lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("ADMIN_API_URL") {
            self.api_base_url = value;
        }

        if let Some(value) = lookup("ADMIN_SOCKET_URL") {
            self.socket_url = value;
        }

        if let Some(value) = lookup("ADMIN_REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = value.parse()
                .context("ADMIN_REQUEST_TIMEOUT_MS must be a number of milliseconds")?;
        }

        if let Some(value) = lookup("ADMIN_PAGE_LIMIT") {
            self.page_limit = value.parse()
                .context("ADMIN_PAGE_LIMIT must be a positive integer")?;
        }

        if let Some(value) = lookup("ADMIN_HEARTBEAT_SECS") {
            self.heartbeat_secs = value.parse()
                .context("ADMIN_HEARTBEAT_SECS must be a number of seconds")?;
        }

        if let Some(value) = lookup("ADMIN_CREDENTIALS_PATH") {
            self.credentials_path = Some(PathBuf::from(value));
        }

        Ok(())
    }

    /// Validate endpoints and limits, rewriting an http(s) socket URL to ws(s)
    pub fn normalize(&mut self) -> Result<()> {
        let api = Url::parse(&self.api_base_url)
            .with_context(|| format!("Invalid API URL: {}", self.api_base_url))?;
        if !matches!(api.scheme(), "http" | "https") {
            anyhow::bail!("API URL must use http or https, got {}", api.scheme());
        }
        self.api_base_url = self.api_base_url.trim_end_matches('/').to_string();

        let mut socket = Url::parse(&self.socket_url)
            .with_context(|| format!("Invalid socket URL: {}", self.socket_url))?;
        let scheme = match socket.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => anyhow::bail!("Socket URL must use ws or wss, got {}", other),
        };
        if socket.scheme() != scheme {
            socket.set_scheme(scheme)
                .map_err(|_| anyhow::anyhow!("Cannot rewrite socket URL scheme"))?;
        }
        self.socket_url = socket.to_string().trim_end_matches('/').to_string();

        if self.request_timeout_ms == 0 {
            anyhow::bail!("Request timeout must be greater than zero");
        }
        if self.page_limit == 0 {
            anyhow::bail!("Page limit must be greater than zero");
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    /// Credential file location, falling back to the platform data directory
    pub fn credentials_file(&self) -> Result<PathBuf> {
        if let Some(path) = &self.credentials_path {
            return Ok(path.clone());
        }

        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?
            .join("rental-admin");

        Ok(data_dir.join(CREDENTIALS_FILE_NAME))
    }
}
