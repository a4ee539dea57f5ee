// Application identity
// An application is the trust scope of one site: the normalized host of the
// tab (or sub-frame) that issued a call

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::protocol::Permission;
use crate::services::storage::{Allowance, AppSettings, PermissionCheck, PermissionStore};

/// Normalized origin of an application (`host` or `host:port`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppUrl(String);

impl AppUrl {
    /// Derive the application URL from any page URL.
    ///
    /// Scheme, path, query and fragment are dropped; the host is lowercased and
    /// a non-default port is kept.
    pub fn parse(link: &str) -> Result<Self, String> {
        let parsed = url::Url::parse(link).map_err(|e| format!("Invalid URL {}: {}", link, e))?;
        let host = parsed
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| format!("URL {} has no host", link))?
            .to_lowercase();

        Ok(match parsed.port() {
            Some(port) => Self(format!("{}:{}", host, port)),
            None => Self(host),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store accessor bound to one application
#[derive(Clone)]
pub struct Application {
    url: AppUrl,
    store: Arc<dyn PermissionStore>,
}

impl Application {
    pub fn new(url: AppUrl, store: Arc<dyn PermissionStore>) -> Self {
        Self { url, store }
    }

    pub fn url(&self) -> &AppUrl {
        &self.url
    }

    pub async fn settings(&self) -> Result<Option<AppSettings>> {
        self.store.app(&self.url).await
    }

    pub async fn permissions(&self) -> Result<Vec<Permission>> {
        self.store.permissions(&self.url).await
    }

    pub async fn has_permissions(&self, required: &[Permission]) -> Result<PermissionCheck> {
        self.store.check_permissions(&self.url, required).await
    }

    pub async fn is_blocked(&self) -> Result<bool> {
        self.store.is_blocked(&self.url).await
    }

    pub async fn allowance(&self) -> Result<Allowance> {
        self.store.allowance(&self.url).await
    }

    pub async fn save(&self, settings: AppSettings) -> Result<()> {
        self.store.save_app(&self.url, settings).await
    }

    pub async fn remove(&self) -> Result<()> {
        self.store.remove_app(&self.url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_to_host() {
        assert_eq!(AppUrl::parse("https://Example.COM/path?q=1#x").unwrap().as_str(), "example.com");
        assert_eq!(AppUrl::parse("http://localhost:3000/").unwrap().as_str(), "localhost:3000");
        assert_eq!(AppUrl::parse("https://example.com:443/").unwrap().as_str(), "example.com");
        assert_eq!(
            AppUrl::parse("https://sub.example.com").unwrap(),
            AppUrl::parse("https://sub.example.com/other").unwrap()
        );
    }

    #[test]
    fn subdomains_are_distinct_apps() {
        assert_ne!(
            AppUrl::parse("https://a.example.com").unwrap(),
            AppUrl::parse("https://example.com").unwrap()
        );
    }

    #[test]
    fn rejects_hostless_urls() {
        assert!(AppUrl::parse("about:blank").is_err());
        assert!(AppUrl::parse("not a url").is_err());
    }
}
