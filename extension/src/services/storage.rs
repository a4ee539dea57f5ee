// Application settings storage
// Per-app permissions, allowance, gateway override and blocked flag, plus the
// wallet-wide token list. The background reads it on every call and never
// caches across calls.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use tokio::sync::broadcast;

use crate::app::AppUrl;
use crate::protocol::Permission;
use crate::services::gateway::GatewayConfig;

/// An amount of winston (the smallest AR unit), carried as a decimal string
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Winston(pub u128);

impl Winston {
    pub const ZERO: Winston = Winston(0);

    pub fn checked_add(self, other: Winston) -> Option<Winston> {
        self.0.checked_add(other.0).map(Winston)
    }
}

impl fmt::Display for Winston {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Winston {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(Winston::ZERO);
        }
        trimmed
            .parse::<u128>()
            .map(Winston)
            .map_err(|_| format!("Invalid winston amount: {}", s))
    }
}

impl Serialize for Winston {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Winston {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Number(u64),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Text(text) => text.parse().map_err(serde::de::Error::custom),
            Repr::Number(n) => Ok(Winston(n as u128)),
        }
    }
}

/// Spending allowance of one application
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allowance {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub limit: Winston,
    #[serde(default)]
    pub spent: Winston,
}

impl Allowance {
    /// Whether spending `amount` more stays within the limit
    pub fn covers(&self, amount: Winston) -> bool {
        self.enabled
            && self
                .spent
                .checked_add(amount)
                .is_some_and(|total| total <= self.limit)
    }
}

/// Everything stored about one application
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub logo: Option<String>,
    #[serde(default)]
    pub permissions: BTreeSet<Permission>,
    #[serde(default)]
    pub allowance: Allowance,
    #[serde(default)]
    pub gateway: Option<GatewayConfig>,
    #[serde(default)]
    pub blocked: bool,
}

/// Result of comparing required permissions with granted ones
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionCheck {
    pub result: bool,
    pub missing: Vec<Permission>,
    pub has: Vec<Permission>,
}

/// Emitted whenever stored application settings change
#[derive(Debug, Clone)]
pub enum StoreChange {
    AppSaved {
        url: AppUrl,
        previous: Option<AppSettings>,
        current: AppSettings,
    },
    AppRemoved {
        url: AppUrl,
    },
}

#[async_trait]
pub trait PermissionStore: Send + Sync {
    /// Stored settings, `None` for an application that never connected
    async fn app(&self, url: &AppUrl) -> Result<Option<AppSettings>>;

    async fn save_app(&self, url: &AppUrl, settings: AppSettings) -> Result<()>;

    async fn remove_app(&self, url: &AppUrl) -> Result<()>;

    async fn tokens(&self) -> Result<Vec<String>>;

    async fn add_token(&self, id: &str) -> Result<()>;

    fn changes(&self) -> broadcast::Receiver<StoreChange>;

    async fn permissions(&self, url: &AppUrl) -> Result<Vec<Permission>> {
        Ok(self
            .app(url)
            .await?
            .map(|app| app.permissions.into_iter().collect())
            .unwrap_or_default())
    }

    async fn check_permissions(&self, url: &AppUrl, required: &[Permission]) -> Result<PermissionCheck> {
        let has = self.permissions(url).await?;
        let missing: Vec<Permission> = required
            .iter()
            .filter(|permission| !has.contains(permission))
            .copied()
            .collect();

        Ok(PermissionCheck {
            result: missing.is_empty(),
            missing,
            has,
        })
    }

    async fn is_blocked(&self, url: &AppUrl) -> Result<bool> {
        Ok(self.app(url).await?.is_some_and(|app| app.blocked))
    }

    async fn allowance(&self, url: &AppUrl) -> Result<Allowance> {
        Ok(self.app(url).await?.map(|app| app.allowance).unwrap_or_default())
    }

    /// Atomically add `amount` to the spent counter if the allowance still
    /// covers it. Returns whether the amount was reserved.
    async fn try_reserve(&self, url: &AppUrl, amount: Winston) -> Result<bool>;

    /// Record `amount` as spent against the application's allowance
    async fn add_spent(&self, url: &AppUrl, amount: Winston) -> Result<()>;

    /// Give back a reservation whose signing did not go through
    async fn refund(&self, url: &AppUrl, amount: Winston) -> Result<()>;
}

/// In-memory settings store
pub struct MemoryStore {
    apps: RwLock<HashMap<AppUrl, AppSettings>>,
    tokens: RwLock<Vec<String>>,
    changes: broadcast::Sender<StoreChange>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            apps: RwLock::new(HashMap::new()),
            tokens: RwLock::new(Vec::new()),
            changes,
        }
    }

    /// Seed settings without emitting a change
    pub fn insert(&self, url: AppUrl, settings: AppSettings) {
        self.apps.write().insert(url, settings);
    }

    pub fn len(&self) -> usize {
        self.apps.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.read().is_empty()
    }

    /// Apply `update` to one application's allowance under the write lock.
    /// A change is published only when `update` returns true.
    fn update_allowance<F>(&self, url: &AppUrl, update: F) -> Result<bool>
    where
        F: FnOnce(&mut Allowance) -> Result<bool>,
    {
        let mut apps = self.apps.write();
        let app = apps
            .get_mut(url)
            .with_context(|| format!("No settings stored for {}", url))?;
        let previous = app.clone();
        if !update(&mut app.allowance)? {
            return Ok(false);
        }
        let current = app.clone();
        drop(apps);

        let _ = self.changes.send(StoreChange::AppSaved {
            url: url.clone(),
            previous: Some(previous),
            current,
        });
        Ok(true)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PermissionStore for MemoryStore {
    async fn app(&self, url: &AppUrl) -> Result<Option<AppSettings>> {
        Ok(self.apps.read().get(url).cloned())
    }

    async fn save_app(&self, url: &AppUrl, settings: AppSettings) -> Result<()> {
        let previous = self.apps.write().insert(url.clone(), settings.clone());
        if previous.as_ref() != Some(&settings) {
            let _ = self.changes.send(StoreChange::AppSaved {
                url: url.clone(),
                previous,
                current: settings,
            });
        }
        Ok(())
    }

    async fn remove_app(&self, url: &AppUrl) -> Result<()> {
        if self.apps.write().remove(url).is_some() {
            let _ = self.changes.send(StoreChange::AppRemoved { url: url.clone() });
        }
        Ok(())
    }

    async fn tokens(&self) -> Result<Vec<String>> {
        Ok(self.tokens.read().clone())
    }

    async fn add_token(&self, id: &str) -> Result<()> {
        let mut tokens = self.tokens.write();
        if !tokens.iter().any(|t| t == id) {
            tokens.push(id.to_string());
        }
        Ok(())
    }

    fn changes(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    async fn try_reserve(&self, url: &AppUrl, amount: Winston) -> Result<bool> {
        if self.apps.read().get(url).is_none() {
            return Ok(false);
        }
        self.update_allowance(url, |allowance| {
            if !allowance.covers(amount) {
                return Ok(false);
            }
            allowance.spent = allowance
                .spent
                .checked_add(amount)
                .context("Allowance counter overflow")?;
            Ok(true)
        })
    }

    async fn add_spent(&self, url: &AppUrl, amount: Winston) -> Result<()> {
        self.update_allowance(url, |allowance| {
            allowance.spent = allowance
                .spent
                .checked_add(amount)
                .context("Allowance counter overflow")?;
            Ok(true)
        })?;
        Ok(())
    }

    async fn refund(&self, url: &AppUrl, amount: Winston) -> Result<()> {
        self.update_allowance(url, |allowance| {
            allowance.spent = Winston(allowance.spent.0.saturating_sub(amount.0));
            Ok(true)
        })?;
        Ok(())
    }
}
