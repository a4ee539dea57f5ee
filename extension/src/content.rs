// Content script relay
// Bridges the page window and the extension bus for one frame: wallet calls
// posted by the page go to the background, answers and pushed events come
// back as window messages.

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::bus::{BusError, BusMessage, Context, Destination, Endpoint, FrameId, MessageBus, TabId};
use crate::protocol::{
    channels, ApiCall, ApiResponse, WalletEvent, CHUNK_CALL_TYPE, EVENT_MESSAGE_TYPE, WALLET_EXT,
};
use crate::window::{DomEvent, PageWindow};

#[derive(Debug, Deserialize)]
struct AddressMessage {
    address: String,
}

pub struct ContentScript {
    endpoint: Arc<Endpoint>,
    window: Arc<PageWindow>,
    relay: Mutex<Option<JoinHandle<()>>>,
}

impl ContentScript {
    /// Attach the content script of one frame and start relaying
    pub fn init(bus: &Arc<MessageBus>, tab_id: TabId, frame_id: FrameId, window: Arc<PageWindow>) -> Result<Arc<Self>, BusError> {
        let endpoint = Arc::new(bus.attach(Destination::ContentScript { tab_id, frame_id })?);

        let page = window.clone();
        endpoint.on(channels::EVENT, move |message| {
            let page = page.clone();
            async move {
                if from_background(&message) {
                    let event: WalletEvent = message.parse()?;
                    tracing::debug!("Forwarding {} event to the page", event.name);
                    page.post_message(&json!({ "type": EVENT_MESSAGE_TYPE, "event": event }));
                }
                Ok(Value::Null)
            }
        });

        let page = window.clone();
        endpoint.on(channels::SWITCH_WALLET_EVENT, move |message| {
            let page = page.clone();
            async move {
                if from_background(&message) {
                    let AddressMessage { address } = message.parse()?;
                    page.dispatch_event(DomEvent::WalletSwitch { address });
                }
                Ok(Value::Null)
            }
        });

        let page = window.clone();
        endpoint.on(channels::COPY_ADDRESS, move |message| {
            let page = page.clone();
            async move {
                if from_background(&message) {
                    let AddressMessage { address } = message.parse()?;
                    page.write_clipboard(address);
                }
                Ok(Value::Null)
            }
        });

        let relay = spawn_relay(endpoint.clone(), window.clone());
        tracing::debug!("Content script ready in tab {} frame {}", tab_id, frame_id);

        Ok(Arc::new(Self {
            endpoint,
            window,
            relay: Mutex::new(Some(relay)),
        }))
    }

    pub fn window(&self) -> &Arc<PageWindow> {
        &self.window
    }

    /// Stop relaying and leave the bus
    pub fn teardown(&self) {
        if let Some(relay) = self.relay.lock().take() {
            relay.abort();
        }
        self.endpoint.detach();
    }
}

impl Drop for ContentScript {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn from_background(message: &BusMessage) -> bool {
    let trusted = message.sender.is(Context::Background);
    if !trusted {
        tracing::warn!(
            "Ignoring {} from {}: only the background may send it",
            message.channel,
            message.sender.context
        );
    }
    trusted
}

fn spawn_relay(endpoint: Arc<Endpoint>, window: Arc<PageWindow>) -> JoinHandle<()> {
    let mut messages = window.subscribe();
    tokio::spawn(async move {
        loop {
            let value = match messages.recv().await {
                Ok(value) => value,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Relay skipped {} window messages", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            // responses, events and foreign messages share the window
            let Some(call) = ApiCall::from_value(&value) else {
                continue;
            };
            if call.ext != WALLET_EXT {
                continue;
            }

            // one task per call: a slow popup never holds up other calls
            let endpoint = endpoint.clone();
            let window = window.clone();
            tokio::spawn(async move {
                let response = forward(&endpoint, &call).await;
                if let Some(response) = response {
                    window.post_message(&response);
                }
            });
        }
    })
}

async fn forward(endpoint: &Endpoint, call: &ApiCall) -> Option<ApiResponse> {
    let channel = if call.call_type == CHUNK_CALL_TYPE {
        channels::CHUNK
    } else {
        channels::API_CALL
    };

    match endpoint.send(channel, call, Destination::Background).await {
        Ok(Value::Null) => {
            tracing::warn!("Background dropped {} ({})", call.call_type, call.call_id);
            None
        }
        Ok(value) => Some(serde_json::from_value(value).unwrap_or_else(|e| {
            ApiResponse::failure(
                &call.call_type,
                call.call_id.clone(),
                format!("Invalid response from background: {}", e),
            )
        })),
        Err(e) => Some(ApiResponse::failure(
            &call.call_type,
            call.call_id.clone(),
            e.to_string(),
        )),
    }
}
