use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::time::Duration;

use crate::app::AppUrl;
use crate::auth::AuthSettings;
use crate::chunks::DEFAULT_CHUNK_SIZE;
use crate::protocol::Permission;
use crate::services::gateway::GatewayConfig;
use crate::services::storage::{Allowance, AppSettings};

#[derive(Debug, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    pub wallet: Option<WalletConfig>,
    #[serde(default)]
    pub apps: Vec<AppConfig>,
    pub demo: Option<DemoConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BridgeConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
        }
    }
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    #[serde(default = "default_popup_url")]
    pub popup_url: String,
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
    // unset waits until the popup window closes
    #[serde(default)]
    pub decision_timeout_secs: Option<u64>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            popup_url: default_popup_url(),
            ready_timeout_secs: default_ready_timeout(),
            decision_timeout_secs: None,
        }
    }
}

fn default_popup_url() -> String {
    "auth.html".to_string()
}

fn default_ready_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct WalletConfig {
    pub nickname: String,
}

/// Application settings seeded into the store at startup
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub permissions: BTreeSet<Permission>,
    #[serde(default)]
    pub blocked: bool,
    #[serde(default)]
    pub allowance: Allowance,
    #[serde(default)]
    pub gateway: Option<GatewayConfig>,
}

impl AppConfig {
    pub fn app_url(&self) -> Result<AppUrl> {
        AppUrl::parse(&self.url).map_err(|e| anyhow::anyhow!("Invalid app url {}: {}", self.url, e))
    }

    pub fn settings(&self) -> AppSettings {
        AppSettings {
            name: self.name.clone(),
            logo: None,
            permissions: self.permissions.clone(),
            allowance: self.allowance.clone(),
            gateway: self.gateway.clone(),
            blocked: self.blocked,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DemoConfig {
    pub url: String,
    #[serde(default = "default_auto_approve")]
    pub auto_approve: bool,
}

fn default_auto_approve() -> bool {
    true
}

impl ConfigFile {
    pub fn load(path: &str) -> Result<Self> {
        let content =
            fs::read_to_string(path).context(format!("Failed to read config file: {}", path))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    pub fn validate(&self) -> Result<()> {
        if self.bridge.chunk_size == 0 {
            anyhow::bail!("bridge.chunk_size must be greater than 0");
        }
        if self.auth.ready_timeout_secs == 0 {
            anyhow::bail!("auth.ready_timeout_secs must be greater than 0");
        }
        if self.auth.decision_timeout_secs == Some(0) {
            anyhow::bail!("auth.decision_timeout_secs must be greater than 0 when set");
        }
        if self.gateway.host.is_empty() {
            anyhow::bail!("gateway.host must not be empty");
        }
        if !matches!(self.gateway.protocol.as_str(), "http" | "https") {
            anyhow::bail!(
                "gateway.protocol must be 'http' or 'https', got '{}'",
                self.gateway.protocol
            );
        }

        let mut seen = HashSet::new();
        for app in &self.apps {
            let url = app.app_url()?;
            if !seen.insert(url.clone()) {
                anyhow::bail!("Application {} is configured more than once", url);
            }
        }

        if let Some(demo) = &self.demo {
            AppUrl::parse(&demo.url)
                .map_err(|e| anyhow::anyhow!("Invalid demo url {}: {}", demo.url, e))?;
        }
        Ok(())
    }

    pub fn auth_settings(&self) -> AuthSettings {
        AuthSettings {
            popup_url: self.auth.popup_url.clone(),
            ready_timeout: Duration::from_secs(self.auth.ready_timeout_secs),
            decision_timeout: self.auth.decision_timeout_secs.map(Duration::from_secs),
            chunk_size: self.bridge.chunk_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::storage::Winston;

    const SAMPLE: &str = r#"
[bridge]
chunk_size = 1024

[auth]
popup_url = "popup.html"
ready_timeout_secs = 5
decision_timeout_secs = 600

[gateway]
host = "localhost"
port = 1984
protocol = "http"

[wallet]
nickname = "Account 1"

[[apps]]
url = "https://example.com"
permissions = ["ACCESS_ADDRESS", "SIGN_TRANSACTION"]
[apps.allowance]
enabled = true
limit = "1000000000000"
spent = "0"

[demo]
url = "https://example.com/app"
"#;

    #[test]
    fn parses_full_config() {
        let config = ConfigFile::parse(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.bridge.chunk_size, 1024);
        assert_eq!(config.gateway.port, 1984);
        assert_eq!(config.wallet.as_ref().unwrap().nickname, "Account 1");
        assert_eq!(config.apps.len(), 1);

        let settings = config.apps[0].settings();
        assert!(settings.permissions.contains(&Permission::SignTransaction));
        assert_eq!(settings.allowance.limit, Winston(1_000_000_000_000));
        assert!(config.demo.as_ref().unwrap().auto_approve);

        let auth = config.auth_settings();
        assert_eq!(auth.popup_url, "popup.html");
        assert_eq!(auth.ready_timeout, Duration::from_secs(5));
        assert_eq!(auth.decision_timeout, Some(Duration::from_secs(600)));
        assert_eq!(auth.chunk_size, 1024);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = ConfigFile::parse("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.bridge.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.gateway, GatewayConfig::default());
        assert_eq!(config.auth_settings().decision_timeout, None);
        assert!(config.wallet.is_none());
    }

    #[test]
    fn rejects_invalid_values() {
        let config = ConfigFile::parse("[bridge]\nchunk_size = 0\n").unwrap();
        assert!(config.validate().is_err());

        let config = ConfigFile::parse("[[apps]]\nurl = \"not a url\"\n").unwrap();
        assert!(config.validate().is_err());

        let duplicate = "[[apps]]\nurl = \"https://a.com\"\n[[apps]]\nurl = \"https://A.com/x\"\n";
        let config = ConfigFile::parse(duplicate).unwrap();
        assert!(config.validate().is_err());

        assert!(ConfigFile::parse("[apps]\nurl = 1\n").is_err());
    }
}
