// Popup side of the authorization handshake
// Fetch the request, signal listening, collect the streamed payload, reply.

use parking_lot::Mutex;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use super::{auth_id_from_url, AuthChunk, AuthError, AuthIdMessage, AuthRequest, AuthResult};
use crate::bus::{Context, Destination, Endpoint, MessageBus, WindowId};
use crate::chunks::{ChunkBuffer, Payload};
use crate::protocol::{channels, AuthId};
use crate::services::browser::WindowEvent;

type PayloadSlot = Arc<Mutex<Option<oneshot::Sender<Result<Payload, String>>>>>;

/// A loaded authorization popup
pub struct AuthPopup {
    endpoint: Endpoint,
    window_id: WindowId,
    request: AuthRequest,
    payload: Option<oneshot::Receiver<Result<Payload, String>>>,
}

impl AuthPopup {
    /// Attach the popup window to the bus and fetch its request
    pub async fn load(bus: &Arc<MessageBus>, window_id: WindowId, auth_id: AuthId) -> Result<Self, AuthError> {
        let endpoint = bus
            .attach(Destination::Popup { window_id })
            .map_err(|e| AuthError::Popup(e.to_string()))?;

        let (payload_tx, payload_rx) = oneshot::channel();
        let slot: PayloadSlot = Arc::new(Mutex::new(Some(payload_tx)));
        let buffer = Arc::new(Mutex::new(ChunkBuffer::default()));
        let expected = auth_id.clone();

        endpoint.on(channels::AUTH_CHUNK, move |message| {
            let slot = slot.clone();
            let buffer = buffer.clone();
            let expected = expected.clone();
            async move {
                if !message.sender.is(Context::Background) {
                    return Err("auth_chunk is only accepted from the background".to_string());
                }
                let AuthChunk { auth_id, chunk } = message.parse()?;
                if auth_id != expected {
                    return Err(format!("Chunk for foreign auth {}", auth_id));
                }

                let mut buffer = buffer.lock();
                if buffer.push(chunk).map_err(|e| e.to_string())? {
                    let complete = std::mem::take(&mut *buffer);
                    if let Some(sender) = slot.lock().take() {
                        let _ = sender.send(complete.finish().map_err(|e| e.to_string()));
                    }
                }
                Ok(Value::Null)
            }
        });

        let request: AuthRequest = endpoint
            .request(
                channels::AUTH_PARAMS,
                &AuthIdMessage { auth_id },
                Destination::Background,
            )
            .await
            .map_err(|e| AuthError::Popup(e.to_string()))?;
        tracing::debug!("Popup {} loaded auth {} ({:?})", window_id, request.auth_id, request.auth_type);

        Ok(Self {
            endpoint,
            window_id,
            payload: request.chunked.then_some(payload_rx),
            request,
        })
    }

    pub fn request(&self) -> &AuthRequest {
        &self.request
    }

    pub fn window_id(&self) -> WindowId {
        self.window_id
    }

    /// Tell the background the popup is ready for the payload
    pub async fn listen(&self) -> Result<(), AuthError> {
        self.endpoint
            .send(
                channels::AUTH_LISTENING,
                &AuthIdMessage {
                    auth_id: self.request.auth_id.clone(),
                },
                Destination::Background,
            )
            .await
            .map(|_| ())
            .map_err(|e| AuthError::Popup(e.to_string()))
    }

    /// The streamed payload, once complete. `None` when the request has none.
    pub async fn payload(&mut self) -> Result<Option<Payload>, AuthError> {
        let Some(receiver) = self.payload.take() else {
            return Ok(None);
        };
        match receiver.await {
            Ok(Ok(payload)) => Ok(Some(payload)),
            Ok(Err(e)) => Err(AuthError::Popup(e)),
            Err(_) => Err(AuthError::Popup("payload stream ended".to_string())),
        }
    }

    pub async fn approve(self, data: Value) -> Result<(), AuthError> {
        self.reply(false, data).await
    }

    pub async fn reject(self, reason: &str) -> Result<(), AuthError> {
        self.reply(true, Value::String(reason.to_string())).await
    }

    async fn reply(self, error: bool, data: Value) -> Result<(), AuthError> {
        let result = AuthResult {
            auth_id: self.request.auth_id.clone(),
            error,
            data,
        };
        let sent = self
            .endpoint
            .send(channels::AUTH_RESULT, &result, Destination::Background)
            .await;
        self.endpoint.detach();
        sent.map(|_| ()).map_err(|e| AuthError::Popup(e.to_string()))
    }
}

/// Load a popup for every auth window that opens and hand it to `decide`
pub fn serve<F, Fut>(bus: Arc<MessageBus>, mut windows: broadcast::Receiver<WindowEvent>, decide: F) -> JoinHandle<()>
where
    F: Fn(AuthPopup) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let decide = Arc::new(decide);
    tokio::spawn(async move {
        loop {
            let (window_id, url) = match windows.recv().await {
                Ok(WindowEvent::Created { window_id, url }) => (window_id, url),
                Ok(WindowEvent::Removed { .. }) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Popup host skipped {} window events", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let Some(auth_id) = auth_id_from_url(&url) else {
                continue;
            };

            let bus = bus.clone();
            let decide = decide.clone();
            tokio::spawn(async move {
                match AuthPopup::load(&bus, window_id, auth_id).await {
                    Ok(popup) => decide(popup).await,
                    Err(e) => tracing::warn!("Auth popup {} failed to load: {}", window_id, e),
                }
            });
        }
    })
}
