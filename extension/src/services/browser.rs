// Browser collaborator
// Tabs, frames and popup windows as the background sees them

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::broadcast;

use crate::bus::{FrameId, TabId, WindowId, MAIN_FRAME};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tab {
    pub id: TabId,
    pub url: String,
    pub favicon: Option<String>,
    /// Sub-frame URLs by frame ID
    pub frames: HashMap<FrameId, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowEvent {
    Created { window_id: WindowId, url: String },
    Removed { window_id: WindowId },
}

#[async_trait]
pub trait Browser: Send + Sync {
    async fn tab(&self, tab_id: TabId) -> Result<Option<Tab>>;

    async fn tabs(&self) -> Result<Vec<Tab>>;

    /// URL of a frame; the tab URL for the main frame
    async fn frame_url(&self, tab_id: TabId, frame_id: FrameId) -> Result<Option<String>> {
        Ok(self.tab(tab_id).await?.and_then(|tab| {
            if frame_id == MAIN_FRAME {
                Some(tab.url)
            } else {
                tab.frames.get(&frame_id).cloned()
            }
        }))
    }

    async fn open_popup(&self, url: &str) -> Result<WindowId>;

    async fn close_window(&self, window_id: WindowId) -> Result<()>;

    fn window_events(&self) -> broadcast::Receiver<WindowEvent>;
}

/// In-process browser: tabs and windows are plain records
pub struct SimulatedBrowser {
    tabs: RwLock<HashMap<TabId, Tab>>,
    windows: RwLock<HashMap<WindowId, String>>,
    next_id: AtomicU32,
    events: broadcast::Sender<WindowEvent>,
}

impl SimulatedBrowser {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            tabs: RwLock::new(HashMap::new()),
            windows: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            events,
        }
    }

    pub fn open_tab(&self, url: &str, favicon: Option<&str>) -> TabId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.tabs.write().insert(
            id,
            Tab {
                id,
                url: url.to_string(),
                favicon: favicon.map(str::to_string),
                frames: HashMap::new(),
            },
        );
        id
    }

    /// Attach an iframe to a tab and return its frame ID
    pub fn add_frame(&self, tab_id: TabId, url: &str) -> Result<FrameId> {
        let frame_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut tabs = self.tabs.write();
        let tab = tabs
            .get_mut(&tab_id)
            .with_context(|| format!("No tab {}", tab_id))?;
        tab.frames.insert(frame_id, url.to_string());
        Ok(frame_id)
    }

    pub fn close_tab(&self, tab_id: TabId) {
        self.tabs.write().remove(&tab_id);
    }

    pub fn is_window_open(&self, window_id: WindowId) -> bool {
        self.windows.read().contains_key(&window_id)
    }

    /// The user closes a window without going through the extension
    pub fn user_close(&self, window_id: WindowId) {
        if self.windows.write().remove(&window_id).is_some() {
            let _ = self.events.send(WindowEvent::Removed { window_id });
        }
    }
}

impl Default for SimulatedBrowser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Browser for SimulatedBrowser {
    async fn tab(&self, tab_id: TabId) -> Result<Option<Tab>> {
        Ok(self.tabs.read().get(&tab_id).cloned())
    }

    async fn tabs(&self) -> Result<Vec<Tab>> {
        Ok(self.tabs.read().values().cloned().collect())
    }

    async fn open_popup(&self, url: &str) -> Result<WindowId> {
        let window_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.windows.write().insert(window_id, url.to_string());
        tracing::debug!("Opened popup window {} at {}", window_id, url);
        let _ = self.events.send(WindowEvent::Created {
            window_id,
            url: url.to_string(),
        });
        Ok(window_id)
    }

    async fn close_window(&self, window_id: WindowId) -> Result<()> {
        self.user_close(window_id);
        Ok(())
    }

    fn window_events(&self) -> broadcast::Receiver<WindowEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_urls_resolve_per_frame() {
        let browser = SimulatedBrowser::new();
        let tab = browser.open_tab("https://outer.example/page", None);
        let frame = browser.add_frame(tab, "https://inner.example/widget").unwrap();

        assert_eq!(
            browser.frame_url(tab, MAIN_FRAME).await.unwrap().as_deref(),
            Some("https://outer.example/page")
        );
        assert_eq!(
            browser.frame_url(tab, frame).await.unwrap().as_deref(),
            Some("https://inner.example/widget")
        );
        assert_eq!(browser.frame_url(tab, 999).await.unwrap(), None);
        assert_eq!(browser.frame_url(999, MAIN_FRAME).await.unwrap(), None);
    }

    #[tokio::test]
    async fn closing_a_window_emits_removed_once() {
        let browser = SimulatedBrowser::new();
        let mut events = browser.window_events();
        let window = browser.open_popup("auth.html").await.unwrap();
        assert!(browser.is_window_open(window));

        browser.user_close(window);
        browser.user_close(window);
        assert!(!browser.is_window_open(window));

        assert!(matches!(events.recv().await.unwrap(), WindowEvent::Created { .. }));
        assert_eq!(
            events.recv().await.unwrap(),
            WindowEvent::Removed { window_id: window }
        );
        assert!(events.try_recv().is_err());
    }
}
