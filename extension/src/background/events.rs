// Push events
// Watches the settings store and the keystore and notifies every frame of
// the affected applications through their content scripts.

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use super::Services;
use crate::app::AppUrl;
use crate::bus::{Destination, Endpoint, MAIN_FRAME};
use crate::protocol::{channels, Permission, WalletEvent};
use crate::services::keystore::KeystoreChange;
use crate::services::storage::StoreChange;

pub struct EventBroadcaster {
    endpoint: Arc<Endpoint>,
    services: Services,
}

impl EventBroadcaster {
    pub fn new(endpoint: Arc<Endpoint>, services: Services) -> Self {
        Self { endpoint, services }
    }

    /// Content script addresses of every open frame, grouped by application
    async fn frames(&self) -> BTreeMap<AppUrl, Vec<Destination>> {
        let tabs = match self.services.browser.tabs().await {
            Ok(tabs) => tabs,
            Err(e) => {
                tracing::warn!("Cannot list tabs for events: {:#}", e);
                return BTreeMap::new();
            }
        };

        let mut frames: BTreeMap<AppUrl, Vec<Destination>> = BTreeMap::new();
        for tab in tabs {
            let documents = std::iter::once((MAIN_FRAME, tab.url.clone())).chain(tab.frames.clone());
            for (frame_id, url) in documents {
                if let Ok(app) = AppUrl::parse(&url) {
                    frames.entry(app).or_default().push(Destination::ContentScript {
                        tab_id: tab.id,
                        frame_id,
                    });
                }
            }
        }
        frames
    }

    async fn deliver(&self, destinations: &[Destination], channel: &str, payload: &Value) -> usize {
        let mut delivered = 0;
        for destination in destinations {
            match self.endpoint.send(channel, payload, *destination).await {
                Ok(_) => delivered += 1,
                // frames without a content script are expected
                Err(e) => tracing::debug!("{} not delivered to {}: {}", channel, destination, e),
            }
        }
        delivered
    }

    /// Send an event to every frame of `app`; returns how many frames got it
    pub async fn send_to_app(&self, app: &AppUrl, event: WalletEvent) -> usize {
        let frames = self.frames().await;
        let Some(destinations) = frames.get(app) else {
            return 0;
        };
        let payload = json!(event);
        self.deliver(destinations, channels::EVENT, &payload).await
    }

    /// Send an event to every open application holding `permission`
    async fn send_to_permitted(&self, permission: Permission, event: WalletEvent, switch: Option<&str>) {
        let payload = json!(event);
        for (app, destinations) in self.frames().await {
            match self.services.store.check_permissions(&app, &[permission]).await {
                Ok(check) if check.result => {}
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!("Permission lookup for {} failed: {:#}", app, e);
                    continue;
                }
            }
            self.deliver(&destinations, channels::EVENT, &payload).await;
            if let Some(address) = switch {
                self.deliver(
                    &destinations,
                    channels::SWITCH_WALLET_EVENT,
                    &json!({ "address": address }),
                )
                .await;
            }
        }
    }

    async fn on_store_change(&self, change: StoreChange) {
        match change {
            StoreChange::AppSaved {
                url,
                previous: None,
                current,
            } => {
                let event = WalletEvent::new("connect", json!({ "permissions": current.permissions }));
                self.send_to_app(&url, event).await;
            }
            StoreChange::AppSaved {
                url,
                previous: Some(previous),
                current,
            } => {
                if previous.permissions != current.permissions {
                    let event = WalletEvent::new("permissions", json!(current.permissions));
                    self.send_to_app(&url, event).await;
                }
                if previous.gateway != current.gateway {
                    let gateway = current.gateway.unwrap_or_else(|| self.services.gateway.config());
                    self.send_to_app(&url, WalletEvent::new("gateway", json!(gateway)))
                        .await;
                }
            }
            StoreChange::AppRemoved { url } => {
                self.send_to_app(&url, WalletEvent::new("disconnect", Value::Null))
                    .await;
            }
        }
    }

    async fn on_keystore_change(&self, change: KeystoreChange) {
        match change {
            KeystoreChange::ActiveWallet(address) => {
                let event = WalletEvent::new("activeAddress", json!(address));
                self.send_to_permitted(Permission::AccessAddress, event, Some(&address))
                    .await;
            }
            KeystoreChange::WalletsChanged => {
                let addresses: Vec<String> = match self.services.keystore.wallets().await {
                    Ok(wallets) => wallets.into_iter().map(|w| w.address).collect(),
                    Err(e) => {
                        tracing::warn!("Cannot list wallets for events: {:#}", e);
                        return;
                    }
                };
                let event = WalletEvent::new("addresses", json!(addresses));
                self.send_to_permitted(Permission::AccessAllAddresses, event, None)
                    .await;
            }
        }
    }

    pub fn watch_store(self: Arc<Self>) -> JoinHandle<()> {
        let mut changes = self.services.store.changes();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => self.on_store_change(change).await,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Store watcher skipped {} changes", skipped)
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    pub fn watch_keystore(self: Arc<Self>) -> JoinHandle<()> {
        let mut changes = self.services.keystore.changes();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => self.on_keystore_change(change).await,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Keystore watcher skipped {} changes", skipped)
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
