use serde_json::{json, Value};

use super::{err, ModuleContext};
use crate::auth::AuthType;
use crate::protocol::{CollectionId, Params};
use crate::services::keystore::WalletInfo;
use crate::transaction::{b64_decode, DataItem, DataItemParams};

async fn build_item(
    ctx: &ModuleContext,
    wallet: &WalletInfo,
    params: DataItemParams,
    decision: Option<&Value>,
) -> Result<Vec<u8>, String> {
    let owner = b64_decode(&wallet.public_key).map_err(err)?;
    let mut item = DataItem::new(params, owner).map_err(err)?;
    let signature = ctx
        .wallet_signature(wallet, &item.signing_message(), decision)
        .await?;
    item.set_signature(signature).map_err(err)?;
    // hardware signatures come from the popup
    if !item.verify().map_err(err)? {
        return Err("Signature does not match the data item".to_string());
    }
    tracing::debug!("{} signed data item {}", ctx.app.url(), item.id());
    item.to_bytes().map_err(err)
}

pub async fn sign_data_item(ctx: &ModuleContext, params: &Params) -> Result<Value, String> {
    let stripped: DataItemParams = params.required(0, "dataItem")?;
    let collection: CollectionId = params.required(1, "chunkCollectionID")?;
    let payload = ctx.take_payload(&collection)?;
    let wallet = ctx.active_wallet().await?;

    let decision = ctx
        .authorize(
            AuthType::SignDataItem,
            json!({ "dataItem": stripped, "address": wallet.address }),
            Some(payload.clone()),
        )
        .await?;

    let bytes = build_item(ctx, &wallet, stripped.with_payload(payload), Some(&decision)).await?;
    Ok(json!(bytes))
}

/// One popup for the whole batch; hardware wallets answer with one
/// signature per item
pub async fn batch_sign_data_item(ctx: &ModuleContext, params: &Params) -> Result<Value, String> {
    let items: Vec<DataItemParams> = params.required(0, "dataItems")?;
    if items.is_empty() {
        return Err("No data items to sign".to_string());
    }
    let wallet = ctx.active_wallet().await?;

    let decision = ctx
        .authorize(
            AuthType::BatchSignDataItem,
            json!({ "dataItems": items, "address": wallet.address }),
            None,
        )
        .await?;

    let mut signed = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        signed.push(build_item(ctx, &wallet, item, decision.get(index)).await?);
    }
    Ok(json!(signed))
}
