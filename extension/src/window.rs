// Page window transport
// Models `window.postMessage` and DOM custom events of one document: every
// listener in the document sees every posted message, including forged ones.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

const WINDOW_CAPACITY: usize = 1024;

/// Custom DOM events dispatched on the page window
#[derive(Debug, Clone, PartialEq)]
pub enum DomEvent {
    /// `arweaveWalletLoaded`
    WalletLoaded,
    /// `walletSwitch` with the new active address
    WalletSwitch { address: String },
}

impl DomEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomEvent::WalletLoaded => "arweaveWalletLoaded",
            DomEvent::WalletSwitch { .. } => "walletSwitch",
        }
    }
}

pub struct PageWindow {
    url: String,
    messages: broadcast::Sender<Value>,
    events: broadcast::Sender<DomEvent>,
    clipboard: Mutex<Option<String>>,
}

impl PageWindow {
    pub fn new(url: impl Into<String>) -> Self {
        let (messages, _) = broadcast::channel(WINDOW_CAPACITY);
        let (events, _) = broadcast::channel(WINDOW_CAPACITY);
        Self {
            url: url.into(),
            messages,
            events,
            clipboard: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// `window.postMessage(message, window.location.origin)`
    pub fn post_message<T: Serialize>(&self, message: &T) {
        match serde_json::to_value(message) {
            // no listeners is not an error for postMessage
            Ok(value) => {
                let _ = self.messages.send(value);
            }
            Err(e) => tracing::error!("Failed to serialize window message: {}", e),
        }
    }

    /// `window.addEventListener("message", ...)`
    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.messages.subscribe()
    }

    /// `window.dispatchEvent(new CustomEvent(...))`
    pub fn dispatch_event(&self, event: DomEvent) {
        tracing::debug!("Dispatching {} on {}", event.name(), self.url);
        let _ = self.events.send(event);
    }

    pub fn dom_events(&self) -> broadcast::Receiver<DomEvent> {
        self.events.subscribe()
    }

    pub fn write_clipboard(&self, text: String) {
        *self.clipboard.lock() = Some(text);
    }

    pub fn clipboard(&self) -> Option<String> {
        self.clipboard.lock().clone()
    }
}
