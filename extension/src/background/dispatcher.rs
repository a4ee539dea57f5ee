// API call dispatcher
// Every relayed call goes through the same pipeline: provenance, shape,
// source tab, function lookup, application identity, permissions, blocklist,
// activity log, module. Whatever happens, the page gets a response.

use serde_json::Value;
use std::sync::{Arc, Weak};

use super::modules::{self, ModuleContext};
use super::Services;
use crate::app::{AppUrl, Application};
use crate::auth::AuthController;
use crate::bus::{BusMessage, Context, Endpoint, Sender, MAIN_FRAME};
use crate::chunks::{Chunk, ChunkStore};
use crate::protocol::{
    channels, ApiCall, ApiFunction, ApiResponse, CallId, Params, Permission, CHUNK_CALL_TYPE,
};
use crate::services::activity::ActivityEntry;
use crate::services::browser::Tab;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Invalid call")]
    InvalidCall,
    #[error("Call coming from invalid tab")]
    InvalidTab,
    #[error("API function \"{0}\" not found")]
    UnknownFunction(String),
    #[error("Missing permission(s) for \"{function}\": {}", join_permissions(.missing))]
    MissingPermissions {
        function: ApiFunction,
        missing: Vec<Permission>,
    },
    #[error("Missing permission(s) for \"{function}\": permissions could not be read ({reason})")]
    PermissionCheck { function: ApiFunction, reason: String },
    #[error("{0} is blocked from interacting with the wallet")]
    Blocked(AppUrl),
    #[error("Invalid chunk: {0}")]
    InvalidChunk(String),
    #[error("{0}")]
    Module(String),
}

fn join_permissions(permissions: &[Permission]) -> String {
    permissions
        .iter()
        .map(Permission::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

pub struct Dispatcher {
    services: Services,
    auth: Arc<AuthController>,
    chunks: Arc<ChunkStore>,
}

impl Dispatcher {
    pub fn new(services: Services, auth: Arc<AuthController>) -> Self {
        Self {
            services,
            auth,
            chunks: Arc::new(ChunkStore::new()),
        }
    }

    pub fn chunks(&self) -> &Arc<ChunkStore> {
        &self.chunks
    }

    /// Register the `api_call` and `chunk` handlers
    pub fn register(self: &Arc<Self>, endpoint: &Endpoint) {
        let weak = Arc::downgrade(self);
        endpoint.on(channels::API_CALL, move |message| {
            let weak = weak.clone();
            async move { reply(upgrade(&weak)?.handle_call(&message).await) }
        });

        let weak = Arc::downgrade(self);
        endpoint.on(channels::CHUNK, move |message| {
            let weak = weak.clone();
            async move { reply(upgrade(&weak)?.handle_chunk(&message).await) }
        });
    }

    /// Handle one relayed API call.
    ///
    /// `None` means the message was dropped without a reply (wrong sender).
    pub async fn handle_call(&self, message: &BusMessage) -> Option<ApiResponse> {
        if !message.sender.is(Context::ContentScript) {
            tracing::warn!(
                "Dropped api_call from {}: calls only accepted from content-script",
                message.sender.context
            );
            return None;
        }

        let Some(call) = ApiCall::from_value(&message.data) else {
            let (call_type, call_id) = loose_ids(&message.data);
            return Some(ApiResponse::failure(
                &call_type,
                call_id,
                DispatchError::InvalidCall.to_string(),
            ));
        };

        Some(match self.execute(&call, message.sender).await {
            Ok(data) => ApiResponse::success(&call.call_type, call.call_id, data),
            Err(e) => {
                tracing::debug!("{} ({}) failed: {}", call.call_type, call.call_id, e);
                ApiResponse::failure(&call.call_type, call.call_id, e.to_string())
            }
        })
    }

    async fn execute(&self, call: &ApiCall, sender: Sender) -> Result<Value, DispatchError> {
        let params = Params::new(call.data.params.clone());
        let tab = self.source_tab(sender).await?;
        let function = ApiFunction::from_call_type(&call.call_type)
            .ok_or_else(|| DispatchError::UnknownFunction(call.call_type.clone()))?;
        let app = self.application(sender).await?;

        let check = app
            .has_permissions(function.required_permissions())
            .await
            .map_err(|e| DispatchError::PermissionCheck {
                function,
                reason: format!("{:#}", e),
            })?;
        if !check.result {
            return Err(DispatchError::MissingPermissions {
                function,
                missing: check.missing,
            });
        }

        let blocked = app
            .is_blocked()
            .await
            .map_err(|e| DispatchError::PermissionCheck {
                function,
                reason: format!("{:#}", e),
            })?;
        if blocked {
            return Err(DispatchError::Blocked(app.url().clone()));
        }

        let activity = self.services.activity.clone();
        let entry = ActivityEntry::new(app.url().clone(), function);
        tokio::spawn(async move {
            if let Err(e) = activity.record(entry).await {
                tracing::warn!("Failed to record activity: {:#}", e);
            }
        });

        tracing::debug!("Executing {} for {}", function, app.url());
        let context = ModuleContext {
            app,
            favicon: tab.favicon,
            services: self.services.clone(),
            auth: self.auth.clone(),
            chunks: self.chunks.clone(),
        };
        modules::execute(function, &context, &params)
            .await
            .map_err(DispatchError::Module)
    }

    /// Handle one chunk upload from a page
    pub async fn handle_chunk(&self, message: &BusMessage) -> Option<ApiResponse> {
        if !message.sender.is(Context::ContentScript) {
            tracing::warn!("Dropped chunk from {}", message.sender.context);
            return None;
        }

        let Some(call) = ApiCall::from_value(&message.data).filter(|c| c.call_type == CHUNK_CALL_TYPE) else {
            let (call_type, call_id) = loose_ids(&message.data);
            return Some(ApiResponse::failure(
                &call_type,
                call_id,
                DispatchError::InvalidCall.to_string(),
            ));
        };

        Some(match self.store_chunk(&call, message.sender).await {
            Ok(()) => ApiResponse::success(&call.call_type, call.call_id, Value::Null),
            Err(e) => {
                tracing::warn!("Chunk {} rejected: {}", call.call_id, e);
                ApiResponse::failure(&call.call_type, call.call_id, e.to_string())
            }
        })
    }

    async fn store_chunk(&self, call: &ApiCall, sender: Sender) -> Result<(), DispatchError> {
        let app = self.application(sender).await?;
        let blocked = app.is_blocked().await.map_err(|e| DispatchError::Module(format!("{:#}", e)))?;
        if blocked {
            return Err(DispatchError::Blocked(app.url().clone()));
        }

        let chunk: Chunk = Params::new(call.data.params.clone())
            .required(0, "chunk")
            .map_err(DispatchError::InvalidChunk)?;
        self.chunks
            .push(app.url().as_str(), chunk)
            .map_err(|e| DispatchError::InvalidChunk(e.to_string()))
    }

    /// Application of the calling frame; iframes are their own applications
    async fn application(&self, sender: Sender) -> Result<Application, DispatchError> {
        let tab_id = sender.tab_id.ok_or(DispatchError::InvalidTab)?;
        let frame_id = sender.frame_id.unwrap_or(MAIN_FRAME);
        let url = self
            .services
            .browser
            .frame_url(tab_id, frame_id)
            .await
            .map_err(|e| {
                tracing::warn!("Frame lookup for {}/{} failed: {:#}", tab_id, frame_id, e);
                DispatchError::InvalidTab
            })?
            .ok_or(DispatchError::InvalidTab)?;
        let url = AppUrl::parse(&url).map_err(|e| {
            tracing::warn!("Cannot derive application from {}: {}", url, e);
            DispatchError::InvalidTab
        })?;
        Ok(Application::new(url, self.services.store.clone()))
    }

    async fn source_tab(&self, sender: Sender) -> Result<Tab, DispatchError> {
        let tab_id = sender.tab_id.ok_or(DispatchError::InvalidTab)?;
        self.services
            .browser
            .tab(tab_id)
            .await
            .map_err(|e| {
                tracing::warn!("Tab lookup for {} failed: {:#}", tab_id, e);
                DispatchError::InvalidTab
            })?
            .ok_or(DispatchError::InvalidTab)
    }
}

/// Best-effort type and callID of a malformed call
fn loose_ids(data: &Value) -> (String, CallId) {
    let field = |name: &str| data.get(name).and_then(Value::as_str).unwrap_or_default().to_string();
    (field("type"), CallId::from(field("callID")))
}

fn upgrade(weak: &Weak<Dispatcher>) -> Result<Arc<Dispatcher>, String> {
    weak.upgrade()
        .ok_or_else(|| "Background is shut down".to_string())
}

/// Dropped messages answer `null`, which the relay treats as no reply
fn reply(response: Option<ApiResponse>) -> Result<Value, String> {
    match response {
        Some(response) => serde_json::to_value(response).map_err(|e| e.to_string()),
        None => Ok(Value::Null),
    }
}
