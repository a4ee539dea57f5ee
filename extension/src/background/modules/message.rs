use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256, Sha384, Sha512};

use super::{bytes, err, ModuleContext};
use crate::auth::AuthType;
use crate::chunks::Payload;
use crate::protocol::{CollectionId, Params};
use crate::services::keystore::verify_signature;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageOptions {
    #[serde(default)]
    hash_algorithm: Option<String>,
}

fn hash(data: &[u8], options: &MessageOptions) -> Result<Vec<u8>, String> {
    match options.hash_algorithm.as_deref().unwrap_or("SHA-256") {
        "SHA-256" => Ok(Sha256::digest(data).to_vec()),
        "SHA-384" => Ok(Sha384::digest(data).to_vec()),
        "SHA-512" => Ok(Sha512::digest(data).to_vec()),
        other => Err(format!("Unsupported hash algorithm: {}", other)),
    }
}

/// Raw signature over arbitrary data, always confirmed in a popup. The data
/// arrives as a chunk collection.
pub async fn signature(ctx: &ModuleContext, params: &Params) -> Result<Value, String> {
    let algorithm = params.get(1).cloned().unwrap_or(Value::Null);
    let collection: CollectionId = params.required(2, "chunkCollectionID")?;
    let Payload { data, .. } = ctx.take_payload(&collection)?;
    let wallet = ctx.active_wallet().await?;

    let decision = ctx
        .authorize(
            AuthType::Signature,
            json!({ "algorithm": algorithm, "address": wallet.address }),
            Some(Payload::new(Vec::new(), data.clone())),
        )
        .await?;

    let signature = ctx.wallet_signature(&wallet, &data, Some(&decision)).await?;
    Ok(json!(signature))
}

/// Signature over the hash of a message, no popup
pub async fn sign_message(ctx: &ModuleContext, params: &Params) -> Result<Value, String> {
    let data = bytes(params, 0, "data")?;
    let options: MessageOptions = params.optional(1, "options")?.unwrap_or_default();
    let digest = hash(&data, &options)?;

    let wallet = ctx.active_wallet().await?;
    let signature = ctx
        .services
        .keystore
        .sign(&wallet.address, &digest)
        .await
        .map_err(err)?;
    Ok(json!(signature))
}

pub async fn verify_message(ctx: &ModuleContext, params: &Params) -> Result<Value, String> {
    let data = bytes(params, 0, "data")?;
    let signature = bytes(params, 1, "signature")?;
    let public_key = match params.optional::<String>(2, "publicKey")? {
        Some(key) => key,
        None => ctx.active_wallet().await?.public_key,
    };
    let options: MessageOptions = params.optional(3, "options")?.unwrap_or_default();
    let digest = hash(&data, &options)?;

    let valid = verify_signature(&public_key, &digest, &signature).map_err(err)?;
    Ok(Value::Bool(valid))
}
