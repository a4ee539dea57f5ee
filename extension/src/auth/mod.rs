// Authorization popups
// The background opens a popup window per request, waits until it listens,
// streams the request payload to it and blocks the calling module until the
// user decides or the window goes away.

pub mod popup;

use futures::future::Either;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;

use crate::app::AppUrl;
use crate::bus::{BusMessage, Context, Destination, Endpoint, WindowId};
use crate::chunks::{self, Chunk, Payload, DEFAULT_CHUNK_SIZE};
use crate::protocol::{channels, AuthId, CollectionId};
use crate::services::browser::{Browser, WindowEvent};

pub use popup::AuthPopup;

/// Query parameter carrying the auth ID in the popup URL
pub const AUTH_ID_PARAM: &str = "authID";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthType {
    Connect,
    Sign,
    Signature,
    SignDataItem,
    BatchSignDataItem,
    Token,
}

/// What the popup is asked to decide on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthRequest {
    #[serde(rename = "authID")]
    pub auth_id: AuthId,
    #[serde(rename = "type")]
    pub auth_type: AuthType,
    pub url: AppUrl,
    #[serde(default)]
    pub data: Value,
    /// A payload follows on `auth_chunk` once the popup listens
    #[serde(default)]
    pub chunked: bool,
}

/// The popup's decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthResult {
    #[serde(rename = "authID")]
    pub auth_id: AuthId,
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthChunk {
    #[serde(rename = "authID")]
    pub auth_id: AuthId,
    pub chunk: Chunk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthIdMessage {
    #[serde(rename = "authID")]
    pub auth_id: AuthId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Created,
    PopupOpened,
    AwaitingPopupReady,
    Streaming,
    AwaitingUserDecision,
    Resolved,
    Rejected,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("User cancelled the auth")]
    Cancelled,
    #[error("Auth popup did not respond within {0:?}")]
    PopupUnresponsive(Duration),
    #[error("No decision was made within {0:?}")]
    DecisionTimeout(Duration),
    #[error("{0}")]
    Rejected(String),
    #[error("Auth popup failed: {0}")]
    Popup(String),
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub popup_url: String,
    pub ready_timeout: Duration,
    pub decision_timeout: Option<Duration>,
    pub chunk_size: usize,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            popup_url: "auth.html".to_string(),
            ready_timeout: Duration::from_secs(30),
            decision_timeout: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// URL of the popup window for one session
pub fn popup_url(base: &str, auth_id: &AuthId) -> String {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair(AUTH_ID_PARAM, auth_id.as_str())
        .finish();
    format!("{}?{}", base, query)
}

pub fn auth_id_from_url(link: &str) -> Option<AuthId> {
    let (_, query) = link.split_once('?')?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == AUTH_ID_PARAM)
        .map(|(_, value)| AuthId::from(value.into_owned()))
}

type Outcome = Result<Value, AuthError>;

struct Session {
    request: AuthRequest,
    state: AuthState,
    window: watch::Sender<Option<WindowId>>,
    ready: Option<oneshot::Sender<()>>,
    outcome: Option<oneshot::Sender<Outcome>>,
}

pub struct AuthController {
    endpoint: Arc<Endpoint>,
    browser: Arc<dyn Browser>,
    settings: AuthSettings,
    sessions: Mutex<HashMap<AuthId, Session>>,
}

impl AuthController {
    pub fn new(endpoint: Arc<Endpoint>, browser: Arc<dyn Browser>, settings: AuthSettings) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            browser,
            settings,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Register the popup handshake handlers and start watching for closed
    /// windows. The returned task ends when the controller is dropped.
    pub fn init(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        self.endpoint.on(channels::AUTH_PARAMS, move |message| {
            let weak = weak.clone();
            async move { upgrade(&weak)?.on_params(message).await }
        });

        let weak = Arc::downgrade(self);
        self.endpoint.on(channels::AUTH_LISTENING, move |message| {
            let weak = weak.clone();
            async move { upgrade(&weak)?.on_listening(message).await }
        });

        let weak = Arc::downgrade(self);
        self.endpoint.on(channels::AUTH_RESULT, move |message| {
            let weak = weak.clone();
            async move { upgrade(&weak)?.on_result(message).await }
        });

        let weak = Arc::downgrade(self);
        let mut events = self.browser.window_events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(WindowEvent::Removed { window_id }) => match weak.upgrade() {
                        Some(controller) => controller.on_window_removed(window_id),
                        None => break,
                    },
                    Ok(WindowEvent::Created { .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Window watcher skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn state(&self, auth_id: &AuthId) -> Option<AuthState> {
        self.sessions.lock().get(auth_id).map(|session| session.state)
    }

    /// Ask the user through a popup and wait for the decision.
    ///
    /// Every path out of here closes the popup window.
    pub async fn request(
        &self,
        auth_type: AuthType,
        url: &AppUrl,
        data: Value,
        payload: Option<Payload>,
    ) -> Result<Value, AuthError> {
        let auth_id = AuthId::random();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (outcome_tx, mut outcome_rx) = oneshot::channel();
        let (window, _) = watch::channel(None);

        let request = AuthRequest {
            auth_id: auth_id.clone(),
            auth_type,
            url: url.clone(),
            data,
            chunked: payload.is_some(),
        };
        self.sessions.lock().insert(
            auth_id.clone(),
            Session {
                request,
                state: AuthState::Created,
                window,
                ready: Some(ready_tx),
                outcome: Some(outcome_tx),
            },
        );
        let _session = SessionGuard {
            controller: self,
            auth_id: auth_id.clone(),
        };

        let window_id = self
            .browser
            .open_popup(&popup_url(&self.settings.popup_url, &auth_id))
            .await
            .map_err(|e| AuthError::Popup(e.to_string()))?;
        self.with_session(&auth_id, |session| {
            session.window.send_replace(Some(window_id));
            session.state = AuthState::PopupOpened;
        });
        tracing::info!("Auth {} ({:?}) for {} opened in window {}", auth_id, auth_type, url, window_id);

        self.set_state(&auth_id, AuthState::AwaitingPopupReady);
        let ready = tokio::time::timeout(self.settings.ready_timeout, ready_rx);
        tokio::pin!(ready);
        match futures::future::select(ready, &mut outcome_rx).await {
            Either::Left((Ok(Ok(())), _)) => {}
            Either::Left((Ok(Err(_)), _)) => {
                return Err(AuthError::Popup("auth session was dropped".to_string()))
            }
            Either::Left((Err(_), _)) => {
                tracing::warn!("Auth popup {} never signalled it was listening", auth_id);
                return Err(AuthError::PopupUnresponsive(self.settings.ready_timeout));
            }
            // decided (or closed) before listening
            Either::Right((outcome, _)) => return settle(outcome),
        }

        if let Some(payload) = payload {
            self.set_state(&auth_id, AuthState::Streaming);
            let collection = CollectionId::random();
            for chunk in chunks::split(&payload, &collection, self.settings.chunk_size) {
                let message = AuthChunk {
                    auth_id: auth_id.clone(),
                    chunk,
                };
                if let Err(e) = self
                    .endpoint
                    .send(channels::AUTH_CHUNK, &message, Destination::Popup { window_id })
                    .await
                {
                    // a closed window shows up as a failed send
                    if let Ok(outcome) = outcome_rx.try_recv() {
                        return outcome;
                    }
                    if !self.endpoint.bus().is_attached(&Destination::Popup { window_id }) {
                        tracing::info!("Auth popup {} went away while streaming", auth_id);
                        self.set_state(&auth_id, AuthState::Cancelled);
                        return Err(AuthError::Cancelled);
                    }
                    return Err(AuthError::Popup(e.to_string()));
                }
            }
        }

        self.set_state(&auth_id, AuthState::AwaitingUserDecision);
        match self.settings.decision_timeout {
            Some(limit) => match tokio::time::timeout(limit, outcome_rx).await {
                Ok(outcome) => settle(outcome),
                Err(_) => Err(AuthError::DecisionTimeout(limit)),
            },
            None => settle(outcome_rx.await),
        }
    }

    fn with_session<R>(&self, auth_id: &AuthId, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        self.sessions.lock().get_mut(auth_id).map(f)
    }

    fn set_state(&self, auth_id: &AuthId, state: AuthState) {
        self.with_session(auth_id, |session| {
            tracing::debug!("Auth {}: {:?} -> {:?}", auth_id, session.state, state);
            session.state = state;
        });
    }

    /// Resolve the popup window of a session, waiting for it to be opened
    async fn popup_window(&self, auth_id: &AuthId) -> Option<WindowId> {
        let mut window = self.with_session(auth_id, |session| session.window.subscribe())?;
        let opened = tokio::time::timeout(self.settings.ready_timeout, window.wait_for(Option::is_some)).await;
        match opened {
            Ok(Ok(window_id)) => *window_id,
            _ => None,
        }
    }

    /// Parse an auth message and check it comes from the session's popup
    async fn verify<T>(&self, message: &BusMessage) -> Result<T, String>
    where
        T: serde::de::DeserializeOwned + HasAuthId,
    {
        if !message.sender.is(Context::Popup) {
            return Err(format!("{} is only accepted from auth popups", message.channel));
        }
        let parsed: T = message.parse()?;
        let window_id = self
            .popup_window(parsed.auth_id())
            .await
            .ok_or_else(|| format!("Unknown auth request {}", parsed.auth_id()))?;
        if message.sender.window_id != Some(window_id) {
            tracing::warn!(
                "Rejected {} for auth {} from foreign window {:?}",
                message.channel,
                parsed.auth_id(),
                message.sender.window_id
            );
            return Err(format!("Window is not the popup of auth {}", parsed.auth_id()));
        }
        Ok(parsed)
    }

    async fn on_params(&self, message: BusMessage) -> Result<Value, String> {
        let AuthIdMessage { auth_id } = self.verify(&message).await?;
        let request = self
            .with_session(&auth_id, |session| session.request.clone())
            .ok_or_else(|| format!("Unknown auth request {}", auth_id))?;
        serde_json::to_value(request).map_err(|e| e.to_string())
    }

    async fn on_listening(&self, message: BusMessage) -> Result<Value, String> {
        let AuthIdMessage { auth_id } = self.verify(&message).await?;
        if let Some(ready) = self.with_session(&auth_id, |session| session.ready.take()).flatten() {
            let _ = ready.send(());
        }
        Ok(Value::Null)
    }

    async fn on_result(&self, message: BusMessage) -> Result<Value, String> {
        let result: AuthResult = self.verify(&message).await?;
        let outcome = if result.error {
            Err(AuthError::Rejected(match result.data {
                Value::String(reason) => reason,
                Value::Null => "User rejected the request".to_string(),
                other => other.to_string(),
            }))
        } else {
            Ok(result.data)
        };
        let state = if outcome.is_ok() {
            AuthState::Resolved
        } else {
            AuthState::Rejected
        };

        let sender = self
            .with_session(&result.auth_id, |session| {
                session.state = state;
                session.outcome.take()
            })
            .flatten()
            .ok_or_else(|| format!("Auth {} was already settled", result.auth_id))?;
        let _ = sender.send(outcome);
        Ok(Value::Null)
    }

    fn on_window_removed(&self, window_id: WindowId) {
        let mut sessions = self.sessions.lock();
        for (auth_id, session) in sessions.iter_mut() {
            if *session.window.borrow() != Some(window_id) {
                continue;
            }
            if let Some(outcome) = session.outcome.take() {
                tracing::info!("Auth popup {} closed without a decision", auth_id);
                session.state = AuthState::Cancelled;
                let _ = outcome.send(Err(AuthError::Cancelled));
            }
        }
    }
}

trait HasAuthId {
    fn auth_id(&self) -> &AuthId;
}

impl HasAuthId for AuthIdMessage {
    fn auth_id(&self) -> &AuthId {
        &self.auth_id
    }
}

impl HasAuthId for AuthResult {
    fn auth_id(&self) -> &AuthId {
        &self.auth_id
    }
}

fn upgrade(weak: &Weak<AuthController>) -> Result<Arc<AuthController>, String> {
    weak.upgrade()
        .ok_or_else(|| "Auth controller is shut down".to_string())
}

fn settle(outcome: Result<Outcome, oneshot::error::RecvError>) -> Outcome {
    outcome.unwrap_or_else(|_| Err(AuthError::Popup("auth session was dropped".to_string())))
}

/// Removes the session and closes its popup, however `request` exits
struct SessionGuard<'a> {
    controller: &'a AuthController,
    auth_id: AuthId,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        let Some(session) = self.controller.sessions.lock().remove(&self.auth_id) else {
            return;
        };
        tracing::debug!("Auth {} finished in state {:?}", self.auth_id, session.state);

        let window_id = *session.window.borrow();
        if let Some(window_id) = window_id {
            let browser = self.controller.browser.clone();
            tokio::spawn(async move {
                if let Err(e) = browser.close_window(window_id).await {
                    tracing::warn!("Failed to close auth window {}: {}", window_id, e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessageBus;
    use crate::services::browser::SimulatedBrowser;

    #[test]
    fn popup_url_carries_auth_id() {
        let id = AuthId::from("a b&c");
        let link = popup_url("auth.html", &id);
        assert_eq!(auth_id_from_url(&link), Some(id));
        assert_eq!(auth_id_from_url("auth.html"), None);
        assert_eq!(auth_id_from_url("auth.html?other=1"), None);
    }

    #[test]
    fn result_wire_format() {
        let result: AuthResult =
            serde_json::from_str(r#"{"authID": "x", "error": true, "data": "no"}"#).unwrap();
        assert_eq!(result.auth_id.as_str(), "x");
        assert!(result.error);

        let request = AuthRequest {
            auth_id: AuthId::from("x"),
            auth_type: AuthType::SignDataItem,
            url: AppUrl::parse("https://example.com").unwrap(),
            data: Value::Null,
            chunked: false,
        };
        let value = serde_json::to_value(request).unwrap();
        assert_eq!(value["type"], "signDataItem");
        assert_eq!(value["authID"], "x");
    }

    #[tokio::test]
    async fn popup_leaving_the_bus_mid_stream_cancels() {
        let bus = MessageBus::new();
        let browser = Arc::new(SimulatedBrowser::new());
        let endpoint = Arc::new(bus.attach(Destination::Background).unwrap());
        let controller = AuthController::new(
            endpoint,
            browser.clone(),
            AuthSettings {
                chunk_size: 4,
                ..Default::default()
            },
        );
        let _watcher = controller.init();
        let mut windows = browser.window_events();

        // a popup page that unloads after the first chunk, window still open
        let popup_bus = bus.clone();
        let popup = tokio::spawn(async move {
            let (window_id, link) = match windows.recv().await.unwrap() {
                WindowEvent::Created { window_id, url } => (window_id, url),
                other => panic!("unexpected {:?}", other),
            };
            let auth_id = auth_id_from_url(&link).unwrap();
            let endpoint = Arc::new(popup_bus.attach(Destination::Popup { window_id }).unwrap());
            let weak = Arc::downgrade(&endpoint);
            endpoint.on(channels::AUTH_CHUNK, move |_| {
                let weak = weak.clone();
                async move {
                    if let Some(endpoint) = weak.upgrade() {
                        endpoint.detach();
                    }
                    Ok(Value::Null)
                }
            });
            endpoint
                .send(channels::AUTH_LISTENING, &AuthIdMessage { auth_id }, Destination::Background)
                .await
                .unwrap();
            (window_id, endpoint)
        });

        let app = AppUrl::parse("https://app.example").unwrap();
        let payload = Payload::new(Vec::new(), vec![1u8; 32]);
        let err = controller
            .request(AuthType::Sign, &app, Value::Null, Some(payload))
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::Cancelled);
        assert_eq!(controller.active_sessions(), 0);

        let (window_id, _endpoint) = popup.await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while browser.is_window_open(window_id) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
