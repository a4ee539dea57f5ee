// API modules
// One function per `ApiFunction`; each gets the calling application's
// context and the normalized positional arguments.

mod addresses;
mod connect;
mod data_item;
mod encryption;
mod message;
mod permissions;
mod sign;
mod tokens;

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use super::Services;
use crate::app::Application;
use crate::auth::{AuthController, AuthType};
use crate::chunks::{ChunkStore, Payload};
use crate::protocol::{ApiFunction, CollectionId, Params};
use crate::services::gateway::GatewayConfig;
use crate::services::keystore::{verify_signature, WalletInfo, WalletKind};
use crate::transaction::{b64_decode, bytes_or_string};

/// What a module knows about its caller
pub struct ModuleContext {
    pub app: Application,
    pub favicon: Option<String>,
    pub services: Services,
    pub auth: Arc<AuthController>,
    pub chunks: Arc<ChunkStore>,
}

pub async fn execute(function: ApiFunction, ctx: &ModuleContext, params: &Params) -> Result<Value, String> {
    match function {
        ApiFunction::Connect => connect::connect(ctx, params).await,
        ApiFunction::Disconnect => connect::disconnect(ctx).await,
        ApiFunction::GetActiveAddress => addresses::active_address(ctx).await,
        ApiFunction::GetActivePublicKey => addresses::active_public_key(ctx).await,
        ApiFunction::GetAllAddresses => addresses::all_addresses(ctx).await,
        ApiFunction::GetWalletNames => addresses::wallet_names(ctx).await,
        ApiFunction::GetPermissions => permissions::permissions(ctx).await,
        ApiFunction::GetArweaveConfig => permissions::arweave_config(ctx).await,
        ApiFunction::Sign => sign::sign(ctx, params).await,
        ApiFunction::Dispatch => sign::dispatch(ctx, params).await,
        ApiFunction::SignDataItem => data_item::sign_data_item(ctx, params).await,
        ApiFunction::BatchSignDataItem => data_item::batch_sign_data_item(ctx, params).await,
        ApiFunction::Signature => message::signature(ctx, params).await,
        ApiFunction::SignMessage => message::sign_message(ctx, params).await,
        ApiFunction::VerifyMessage => message::verify_message(ctx, params).await,
        ApiFunction::Encrypt => encryption::encrypt(ctx, params).await,
        ApiFunction::Decrypt => encryption::decrypt(ctx, params).await,
        ApiFunction::AddToken => tokens::add_token(ctx, params).await,
        ApiFunction::IsTokenAdded => tokens::is_token_added(ctx, params).await,
    }
}

/// Render a collaborator error with its context chain
fn err(e: anyhow::Error) -> String {
    format!("{:#}", e)
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| e.to_string())
}

#[derive(Deserialize)]
struct Bytes(#[serde(deserialize_with = "bytes_or_string")] Vec<u8>);

/// Binary argument given as a byte array or a string
fn bytes(params: &Params, index: usize, name: &str) -> Result<Vec<u8>, String> {
    params.required::<Bytes>(index, name).map(|b| b.0)
}

impl ModuleContext {
    pub async fn active_wallet(&self) -> Result<WalletInfo, String> {
        self.services.keystore.active_wallet().await.map_err(err)
    }

    /// Gateway the application configured, or the wallet default
    pub async fn gateway(&self) -> Result<GatewayConfig, String> {
        Ok(self
            .app
            .settings()
            .await
            .map_err(err)?
            .and_then(|settings| settings.gateway)
            .unwrap_or_else(|| self.services.gateway.config()))
    }

    /// Completed chunk collection uploaded by this application
    pub fn take_payload(&self, collection: &CollectionId) -> Result<Payload, String> {
        self.chunks
            .take(self.app.url().as_str(), collection)
            .ok_or_else(|| format!("Chunk collection {} not found", collection))
    }

    /// Block on a popup decision
    pub async fn authorize(&self, auth_type: AuthType, data: Value, payload: Option<Payload>) -> Result<Value, String> {
        self.auth
            .request(auth_type, self.app.url(), data, payload)
            .await
            .map_err(|e| e.to_string())
    }

    /// Signature by the given wallet. Hardware wallets sign in the popup, so
    /// their signature comes back as the popup's decision.
    pub async fn wallet_signature(
        &self,
        wallet: &WalletInfo,
        message: &[u8],
        decision: Option<&Value>,
    ) -> Result<Vec<u8>, String> {
        match wallet.kind {
            WalletKind::Local => self
                .services
                .keystore
                .sign(&wallet.address, message)
                .await
                .map_err(err),
            WalletKind::Hardware => {
                let signature = decision
                    .and_then(Value::as_str)
                    .and_then(|encoded| b64_decode(encoded).ok())
                    .ok_or_else(|| "Failed to decode signature from hardware wallet".to_string())?;
                if !verify_signature(&wallet.public_key, message, &signature).map_err(err)? {
                    return Err("Hardware wallet returned an invalid signature".to_string());
                }
                Ok(signature)
            }
        }
    }
}
