use serde_json::{Map, Value};

use super::{err, ModuleContext};

pub async fn active_address(ctx: &ModuleContext) -> Result<Value, String> {
    Ok(Value::String(ctx.active_wallet().await?.address))
}

pub async fn active_public_key(ctx: &ModuleContext) -> Result<Value, String> {
    Ok(Value::String(ctx.active_wallet().await?.public_key))
}

pub async fn all_addresses(ctx: &ModuleContext) -> Result<Value, String> {
    let wallets = ctx.services.keystore.wallets().await.map_err(err)?;
    Ok(Value::Array(
        wallets
            .into_iter()
            .map(|wallet| Value::String(wallet.address))
            .collect(),
    ))
}

/// Address to nickname
pub async fn wallet_names(ctx: &ModuleContext) -> Result<Value, String> {
    let wallets = ctx.services.keystore.wallets().await.map_err(err)?;
    let names: Map<String, Value> = wallets
        .into_iter()
        .map(|wallet| (wallet.address, Value::String(wallet.nickname)))
        .collect();
    Ok(Value::Object(names))
}
