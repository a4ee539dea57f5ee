// Cross-context message bus
// Point-to-point request/response messaging between extension contexts.
// Every endpoint is bound to one address when attached, and the bus stamps
// that address on everything it sends, so receivers can trust `sender`.

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub type TabId = u32;
pub type FrameId = u32;
pub type WindowId = u32;

/// Frame ID of a tab's top-level document
pub const MAIN_FRAME: FrameId = 0;

/// Execution context a message originates from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Context {
    Page,
    ContentScript,
    Background,
    Popup,
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Context::Page => "page",
            Context::ContentScript => "content-script",
            Context::Background => "background",
            Context::Popup => "popup",
        };
        f.write_str(name)
    }
}

/// Address of an endpoint on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    Background,
    ContentScript { tab_id: TabId, frame_id: FrameId },
    Popup { window_id: WindowId },
}

impl Destination {
    pub fn context(&self) -> Context {
        match self {
            Destination::Background => Context::Background,
            Destination::ContentScript { .. } => Context::ContentScript,
            Destination::Popup { .. } => Context::Popup,
        }
    }

    /// Identity the bus attaches to messages sent from this address
    pub fn sender(&self) -> Sender {
        match *self {
            Destination::Background => Sender::new(Context::Background),
            Destination::ContentScript { tab_id, frame_id } => Sender {
                context: Context::ContentScript,
                tab_id: Some(tab_id),
                frame_id: Some(frame_id),
                window_id: None,
            },
            Destination::Popup { window_id } => Sender {
                context: Context::Popup,
                tab_id: None,
                frame_id: None,
                window_id: Some(window_id),
            },
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Background => write!(f, "background"),
            Destination::ContentScript { tab_id, frame_id } => {
                write!(f, "content-script@{}.{}", tab_id, frame_id)
            }
            Destination::Popup { window_id } => write!(f, "popup@{}", window_id),
        }
    }
}

/// Verified origin of a delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub context: Context,
    pub tab_id: Option<TabId>,
    pub frame_id: Option<FrameId>,
    pub window_id: Option<WindowId>,
}

impl Sender {
    pub fn new(context: Context) -> Self {
        Self {
            context,
            tab_id: None,
            frame_id: None,
            window_id: None,
        }
    }

    pub fn is(&self, context: Context) -> bool {
        self.context == context
    }
}

/// A delivered message
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub channel: String,
    pub data: Value,
    pub sender: Sender,
}

impl BusMessage {
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, String> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| format!("Invalid {} message: {}", self.channel, e))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("no handler for channel \"{channel}\" at {destination}")]
    NoHandler {
        channel: String,
        destination: Destination,
    },
    #[error("{0} is already attached to the bus")]
    AddressInUse(Destination),
    #[error("{0}")]
    Remote(String),
    #[error("message serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("handler for channel \"{0}\" panicked")]
    HandlerPanicked(String),
}

type Handler = Arc<dyn Fn(BusMessage) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// Routing table shared by every context
#[derive(Default)]
pub struct MessageBus {
    routes: RwLock<HashMap<Destination, HashMap<String, Handler>>>,
}

impl MessageBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bind a new endpoint to `address`
    pub fn attach(self: &Arc<Self>, address: Destination) -> Result<Endpoint, BusError> {
        let mut routes = self.routes.write();
        if routes.contains_key(&address) {
            return Err(BusError::AddressInUse(address));
        }
        routes.insert(address, HashMap::new());
        tracing::debug!("Attached {} to the bus", address);

        Ok(Endpoint {
            bus: self.clone(),
            address,
            attached: AtomicBool::new(true),
        })
    }

    pub fn is_attached(&self, address: &Destination) -> bool {
        self.routes.read().contains_key(address)
    }

    async fn deliver(
        &self,
        from: Destination,
        channel: &str,
        data: Value,
        destination: Destination,
    ) -> Result<Value, BusError> {
        let handler = self
            .routes
            .read()
            .get(&destination)
            .and_then(|handlers| handlers.get(channel))
            .cloned()
            .ok_or_else(|| BusError::NoHandler {
                channel: channel.to_string(),
                destination,
            })?;

        let message = BusMessage {
            channel: channel.to_string(),
            data,
            sender: from.sender(),
        };

        tracing::trace!("{} -> {} on \"{}\"", from, destination, channel);

        // The receiving context runs on its own task: dropping the sending
        // future never cancels the receiver's work.
        match tokio::spawn(handler(message)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(BusError::Remote(message)),
            Err(_) => Err(BusError::HandlerPanicked(channel.to_string())),
        }
    }
}

/// One context's connection to the bus.
///
/// Dropping the endpoint detaches it and removes all of its handlers.
pub struct Endpoint {
    bus: Arc<MessageBus>,
    address: Destination,
    attached: AtomicBool,
}

impl Endpoint {
    pub fn address(&self) -> Destination {
        self.address
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    /// Register (or replace) the handler for `channel`
    pub fn on<F, Fut>(&self, channel: &str, handler: F)
    where
        F: Fn(BusMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        if !self.is_attached() {
            tracing::warn!("Ignoring \"{}\" handler on detached {}", channel, self.address);
            return;
        }
        let handler: Handler = Arc::new(move |message| Box::pin(handler(message)));
        if let Some(handlers) = self.bus.routes.write().get_mut(&self.address) {
            handlers.insert(channel.to_string(), handler);
        }
    }

    pub fn off(&self, channel: &str) {
        if let Some(handlers) = self.bus.routes.write().get_mut(&self.address) {
            handlers.remove(channel);
        }
    }

    /// Send `payload` and wait for the remote handler's return value
    pub async fn send<T: Serialize + ?Sized>(
        &self,
        channel: &str,
        payload: &T,
        destination: Destination,
    ) -> Result<Value, BusError> {
        let data = serde_json::to_value(payload)?;
        self.bus
            .deliver(self.address, channel, data, destination)
            .await
    }

    /// Like [`Endpoint::send`] with a typed reply
    pub async fn request<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        channel: &str,
        payload: &T,
        destination: Destination,
    ) -> Result<R, BusError> {
        let value = self.send(channel, payload, destination).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Remove this endpoint and all of its handlers from the bus.
    ///
    /// Handlers often capture state that owns the endpoint itself, so
    /// explicit teardown goes through here rather than waiting for drop.
    pub fn detach(&self) {
        if self.attached.swap(false, Ordering::SeqCst) {
            self.bus.routes.write().remove(&self.address);
            tracing::debug!("Detached {} from the bus", self.address);
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn delivers_with_verified_sender() {
        let bus = MessageBus::new();
        let background = bus.attach(Destination::Background).unwrap();
        let content = bus
            .attach(Destination::ContentScript {
                tab_id: 7,
                frame_id: 2,
            })
            .unwrap();

        background.on("echo", |message| async move {
            Ok(json!({
                "data": message.data,
                "context": message.sender.context,
                "tab": message.sender.tab_id,
                "frame": message.sender.frame_id,
            }))
        });

        let reply = content
            .send("echo", &json!({"hello": 1}), Destination::Background)
            .await
            .unwrap();
        assert_eq!(reply["data"], json!({"hello": 1}));
        assert_eq!(reply["context"], "content-script");
        assert_eq!(reply["tab"], 7);
        assert_eq!(reply["frame"], 2);
    }

    #[tokio::test]
    async fn missing_handler_rejects() {
        let bus = MessageBus::new();
        let background = bus.attach(Destination::Background).unwrap();
        let popup = bus.attach(Destination::Popup { window_id: 1 }).unwrap();

        let err = popup
            .send("nothing", &json!(null), Destination::Background)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NoHandler { .. }));

        drop(background);
        let err = popup
            .send("nothing", &json!(null), Destination::Background)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NoHandler { .. }));
    }

    #[tokio::test]
    async fn remote_errors_propagate() {
        let bus = MessageBus::new();
        let background = bus.attach(Destination::Background).unwrap();
        let popup = bus.attach(Destination::Popup { window_id: 1 }).unwrap();
        background.on("fail", |_| async { Err("nope".to_string()) });

        let err = popup
            .send("fail", &json!(null), Destination::Background)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "nope");
    }

    #[tokio::test]
    async fn address_is_exclusive_until_dropped() {
        let bus = MessageBus::new();
        let first = bus.attach(Destination::Background).unwrap();
        assert!(matches!(
            bus.attach(Destination::Background),
            Err(BusError::AddressInUse(_))
        ));
        drop(first);
        assert!(!bus.is_attached(&Destination::Background));
        assert!(bus.attach(Destination::Background).is_ok());
    }

    #[tokio::test]
    async fn off_removes_handler() {
        let bus = MessageBus::new();
        let background = bus.attach(Destination::Background).unwrap();
        let popup = bus.attach(Destination::Popup { window_id: 3 }).unwrap();
        background.on("ping", |_| async { Ok(json!("pong")) });

        let reply: String = popup
            .request("ping", &json!(null), Destination::Background)
            .await
            .unwrap();
        assert_eq!(reply, "pong");

        background.off("ping");
        assert!(popup
            .send("ping", &json!(null), Destination::Background)
            .await
            .is_err());
    }
}
