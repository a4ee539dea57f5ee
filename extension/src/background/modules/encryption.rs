use serde_json::{json, Value};

use super::{bytes, err, ModuleContext};
use crate::protocol::Params;

pub async fn encrypt(ctx: &ModuleContext, params: &Params) -> Result<Value, String> {
    let data = bytes(params, 0, "data")?;
    let wallet = ctx.active_wallet().await?;
    let ciphertext = ctx
        .services
        .keystore
        .encrypt(&wallet.address, &data)
        .await
        .map_err(err)?;
    Ok(json!(ciphertext))
}

pub async fn decrypt(ctx: &ModuleContext, params: &Params) -> Result<Value, String> {
    let data = bytes(params, 0, "data")?;
    let wallet = ctx.active_wallet().await?;
    let plaintext = ctx
        .services
        .keystore
        .decrypt(&wallet.address, &data)
        .await
        .map_err(err)?;
    Ok(json!(plaintext))
}
