// Injected wallet API
// The object a page talks to. Every method posts a call on the page window,
// waits for the response carrying the same call ID, and runs the method's
// finalizer on the result. Large binary arguments travel ahead as chunks.

pub mod events;
pub mod finalize;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::chunks::{self, Payload};
use crate::protocol::{
    ApiCall, ApiFunction, ApiResponse, AppInfo, CallId, CollectionId, Permission, WalletEvent,
    CHUNK_CALL_TYPE, EVENT_MESSAGE_TYPE,
};
use crate::services::gateway::GatewayConfig;
use crate::transaction::{DataItemParams, Transaction};
use crate::window::{DomEvent, PageWindow};

pub use events::{EventEmitter, ListenerId};

/// Answer of `dispatch`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchResult {
    pub id: String,
    #[serde(rename = "type")]
    pub result_type: String,
}

struct PendingCall {
    result_type: String,
    settle: oneshot::Sender<ApiResponse>,
}

type PendingCalls = Arc<Mutex<HashMap<CallId, PendingCall>>>;

/// Removes the pending entry however the call ends
struct PendingGuard {
    pending: PendingCalls,
    call_id: CallId,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.call_id);
    }
}

pub struct WalletApi {
    window: Arc<PageWindow>,
    pending: PendingCalls,
    events: Arc<EventEmitter>,
    chunk_size: usize,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl WalletApi {
    /// Install the API on a page window and announce it
    pub fn inject(window: Arc<PageWindow>, chunk_size: usize) -> Arc<Self> {
        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        let events = Arc::new(EventEmitter::new());
        let listener = spawn_listener(&window, pending.clone(), events.clone());

        let api = Arc::new(Self {
            window,
            pending,
            events,
            chunk_size,
            listener: Mutex::new(Some(listener)),
        });
        api.window.dispatch_event(DomEvent::WalletLoaded);
        tracing::debug!("Wallet API injected into {}", api.window.url());
        api
    }

    /// Re-announce once the document finished loading
    pub fn on_page_load(&self) {
        self.window.dispatch_event(DomEvent::WalletLoaded);
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Calls still waiting for their response
    pub fn pending_calls(&self) -> usize {
        self.pending.lock().len()
    }

    /// Stop listening; outstanding calls fail
    pub fn teardown(&self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        self.pending.lock().clear();
    }

    /// Post one call and wait for its response
    async fn post(&self, call_type: &str, params: Vec<Value>) -> Result<Value, String> {
        let call = ApiCall::new(call_type, params);
        let (settle, settled) = oneshot::channel();

        // registered before posting so a fast response cannot slip past
        self.pending.lock().insert(
            call.call_id.clone(),
            PendingCall {
                result_type: call.result_type(),
                settle,
            },
        );
        let _guard = PendingGuard {
            pending: self.pending.clone(),
            call_id: call.call_id.clone(),
        };

        self.window.post_message(&call);
        let response = settled
            .await
            .map_err(|_| "Wallet API was torn down".to_string())?;

        if response.error {
            Err(response.error_message())
        } else {
            Ok(response.data)
        }
    }

    /// Send a payload ahead of the call that uses it
    async fn upload(&self, payload: &Payload) -> Result<CollectionId, String> {
        let collection = CollectionId::random();
        for chunk in chunks::split(payload, &collection, self.chunk_size) {
            self.post(CHUNK_CALL_TYPE, vec![json!(chunk)]).await?;
        }
        Ok(collection)
    }

    /// Call an API function with raw positional arguments
    pub async fn invoke(&self, function: ApiFunction, params: Vec<Value>) -> Result<Value, String> {
        let prepared = finalize::prepare(function, &params)?;
        let params = match &prepared.upload {
            Some(payload) => {
                let collection = self.upload(payload).await?;
                finalize::with_collection(prepared.params, &collection)
            }
            None => prepared.params,
        };

        let data = self.post(&function.call_type(), params).await?;
        match finalize::finalize(function, &data, prepared.upload.as_ref())? {
            Some(result) if !result.is_null() => Ok(result),
            _ => Ok(data),
        }
    }

    async fn invoke_as<T: DeserializeOwned>(&self, function: ApiFunction, params: Vec<Value>) -> Result<T, String> {
        let value = self.invoke(function, params).await?;
        serde_json::from_value(value).map_err(|e| format!("Unexpected {} result: {}", function, e))
    }

    pub async fn connect(
        &self,
        permissions: &[Permission],
        app_info: Option<&AppInfo>,
        gateway: Option<&GatewayConfig>,
    ) -> Result<(), String> {
        self.invoke(
            ApiFunction::Connect,
            vec![json!(permissions), json!(app_info), json!(gateway)],
        )
        .await
        .map(|_| ())
    }

    pub async fn disconnect(&self) -> Result<(), String> {
        self.invoke(ApiFunction::Disconnect, Vec::new()).await.map(|_| ())
    }

    pub async fn get_active_address(&self) -> Result<String, String> {
        self.invoke_as(ApiFunction::GetActiveAddress, Vec::new()).await
    }

    pub async fn get_active_public_key(&self) -> Result<String, String> {
        self.invoke_as(ApiFunction::GetActivePublicKey, Vec::new()).await
    }

    pub async fn get_all_addresses(&self) -> Result<Vec<String>, String> {
        self.invoke_as(ApiFunction::GetAllAddresses, Vec::new()).await
    }

    pub async fn get_wallet_names(&self) -> Result<HashMap<String, String>, String> {
        self.invoke_as(ApiFunction::GetWalletNames, Vec::new()).await
    }

    pub async fn get_permissions(&self) -> Result<Vec<Permission>, String> {
        self.invoke_as(ApiFunction::GetPermissions, Vec::new()).await
    }

    pub async fn get_arweave_config(&self) -> Result<GatewayConfig, String> {
        self.invoke_as(ApiFunction::GetArweaveConfig, Vec::new()).await
    }

    pub async fn sign(&self, transaction: &Transaction, options: Option<Value>) -> Result<Transaction, String> {
        self.invoke_as(
            ApiFunction::Sign,
            vec![json!(transaction), options.unwrap_or(Value::Null)],
        )
        .await
    }

    pub async fn dispatch(&self, transaction: &Transaction, options: Option<Value>) -> Result<DispatchResult, String> {
        self.invoke_as(
            ApiFunction::Dispatch,
            vec![json!(transaction), options.unwrap_or(Value::Null)],
        )
        .await
    }

    /// Returns the binary data item
    pub async fn sign_data_item(&self, item: &DataItemParams) -> Result<Vec<u8>, String> {
        self.invoke_as(ApiFunction::SignDataItem, vec![json!(item)])
            .await
    }

    pub async fn batch_sign_data_item(&self, items: &[DataItemParams]) -> Result<Vec<Vec<u8>>, String> {
        self.invoke_as(ApiFunction::BatchSignDataItem, vec![json!(items)])
            .await
    }

    /// Raw signature over `data`; `algorithm` is passed through untouched
    pub async fn signature(&self, data: &[u8], algorithm: Value) -> Result<Vec<u8>, String> {
        self.invoke_as(ApiFunction::Signature, vec![json!(data), algorithm])
            .await
    }

    pub async fn sign_message(&self, data: &[u8], options: Option<Value>) -> Result<Vec<u8>, String> {
        self.invoke_as(
            ApiFunction::SignMessage,
            vec![json!(data), options.unwrap_or(Value::Null)],
        )
        .await
    }

    pub async fn verify_message(
        &self,
        data: &[u8],
        signature: &[u8],
        public_key: Option<&str>,
        options: Option<Value>,
    ) -> Result<bool, String> {
        self.invoke_as(
            ApiFunction::VerifyMessage,
            vec![
                json!(data),
                json!(signature),
                json!(public_key),
                options.unwrap_or(Value::Null),
            ],
        )
        .await
    }

    pub async fn encrypt(&self, data: &[u8], options: Option<Value>) -> Result<Vec<u8>, String> {
        self.invoke_as(
            ApiFunction::Encrypt,
            vec![json!(data), options.unwrap_or(Value::Null)],
        )
        .await
    }

    pub async fn decrypt(&self, data: &[u8], options: Option<Value>) -> Result<Vec<u8>, String> {
        self.invoke_as(
            ApiFunction::Decrypt,
            vec![json!(data), options.unwrap_or(Value::Null)],
        )
        .await
    }

    pub async fn add_token(&self, id: &str, token_type: Option<&str>) -> Result<(), String> {
        self.invoke(ApiFunction::AddToken, vec![json!(id), json!(token_type)])
            .await
            .map(|_| ())
    }

    pub async fn is_token_added(&self, id: &str) -> Result<bool, String> {
        self.invoke_as(ApiFunction::IsTokenAdded, vec![json!(id)]).await
    }
}

impl Drop for WalletApi {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Settles pending calls from responses and hands pushed events to the
/// emitter. Everything else on the window is ignored.
fn spawn_listener(window: &PageWindow, pending: PendingCalls, events: Arc<EventEmitter>) -> JoinHandle<()> {
    let mut messages = window.subscribe();
    tokio::spawn(async move {
        loop {
            let value = match messages.recv().await {
                Ok(value) => value,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Wallet API skipped {} window messages", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            if value.get("type").and_then(Value::as_str) == Some(EVENT_MESSAGE_TYPE) {
                match serde_json::from_value::<WalletEvent>(value["event"].clone()) {
                    Ok(event) => {
                        events.emit(&event.name, &event.value);
                    }
                    Err(e) => tracing::debug!("Ignoring malformed wallet event: {}", e),
                }
                continue;
            }

            let Ok(response) = serde_json::from_value::<ApiResponse>(value) else {
                continue;
            };

            let mut calls = pending.lock();
            // a response only counts for the call it names, with the matching type
            let matches = calls
                .get(&response.call_id)
                .is_some_and(|call| call.result_type == response.response_type);
            if !matches {
                continue;
            }
            if let Some(call) = calls.remove(&response.call_id) {
                let _ = call.settle.send(response);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Answers every call on the window with `answer(call)`
    fn fake_relay<F>(window: Arc<PageWindow>, answer: F) -> JoinHandle<()>
    where
        F: Fn(&ApiCall) -> Option<ApiResponse> + Send + 'static,
    {
        let mut messages = window.subscribe();
        tokio::spawn(async move {
            while let Ok(value) = messages.recv().await {
                let Some(call) = ApiCall::from_value(&value) else {
                    continue;
                };
                if let Some(response) = answer(&call) {
                    window.post_message(&response);
                }
            }
        })
    }

    #[tokio::test]
    async fn settles_only_matching_call() {
        let window = Arc::new(PageWindow::new("https://app.example"));
        let api = WalletApi::inject(window.clone(), 1024);

        let relay = fake_relay(window.clone(), |call| {
            if call.call_type == CHUNK_CALL_TYPE || call.ext.is_empty() {
                return None;
            }
            // a wrong type and a foreign ID come first
            Some(ApiResponse::success("api_other", call.call_id.clone(), json!("wrong")))
        });
        let mut messages = window.subscribe();

        let call = tokio::spawn({
            let api = api.clone();
            async move { api.get_active_address().await }
        });

        let posted = loop {
            let value = messages.recv().await.unwrap();
            if let Some(call) = ApiCall::from_value(&value) {
                if call.call_type == "api_getActiveAddress" {
                    break call;
                }
            }
        };
        window.post_message(&ApiResponse::success(
            &posted.call_type,
            CallId::from("someone-else"),
            json!("wrong"),
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!call.is_finished());

        window.post_message(&ApiResponse::success(&posted.call_type, posted.call_id, json!("addr")));
        assert_eq!(call.await.unwrap().unwrap(), "addr");
        assert_eq!(api.pending_calls(), 0);
        relay.abort();
    }

    #[tokio::test]
    async fn failures_surface_the_error_message() {
        let window = Arc::new(PageWindow::new("https://app.example"));
        let api = WalletApi::inject(window.clone(), 1024);
        let relay = fake_relay(window.clone(), |call| {
            (!call.call_type.ends_with("_result")).then(|| {
                ApiResponse::failure(&call.call_type, call.call_id.clone(), "Missing permission(s)")
            })
        });

        let err = api.get_permissions().await.unwrap_err();
        assert_eq!(err, "Missing permission(s)");
        relay.abort();
    }

    #[tokio::test]
    async fn events_reach_listeners() {
        let window = Arc::new(PageWindow::new("https://app.example"));
        let api = WalletApi::inject(window.clone(), 1024);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        api.events().on("activeAddress", move |value| {
            let _ = tx.send(value.clone());
        });

        window.post_message(&json!({
            "type": EVENT_MESSAGE_TYPE,
            "event": WalletEvent::new("activeAddress", json!("addr")),
        }));

        assert_eq!(rx.recv().await.unwrap(), json!("addr"));
    }

    #[tokio::test]
    async fn teardown_fails_outstanding_calls() {
        let window = Arc::new(PageWindow::new("https://app.example"));
        let api = WalletApi::inject(window, 1024);

        let call = tokio::spawn({
            let api = api.clone();
            async move { api.get_all_addresses().await }
        });
        while api.pending_calls() == 0 {
            tokio::task::yield_now().await;
        }
        api.teardown();

        assert_eq!(call.await.unwrap().unwrap_err(), "Wallet API was torn down");
    }

    #[tokio::test]
    async fn injection_announces_the_wallet() {
        let window = Arc::new(PageWindow::new("https://app.example"));
        let mut dom = window.dom_events();
        let api = WalletApi::inject(window, 1024);
        assert_eq!(dom.recv().await.unwrap(), DomEvent::WalletLoaded);
        api.on_page_load();
        assert_eq!(dom.recv().await.unwrap(), DomEvent::WalletLoaded);
    }
}
