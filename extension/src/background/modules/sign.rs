use serde_json::{json, Value};

use super::{err, to_value, ModuleContext};
use crate::auth::AuthType;
use crate::protocol::{CollectionId, Params};
use crate::services::keystore::{WalletInfo, WalletKind};
use crate::services::storage::PermissionStore;
use crate::transaction::Transaction;

/// Rebuild the page's transaction from its stripped form and the uploaded
/// data and tag chunks
fn load_transaction(ctx: &ModuleContext, params: &Params) -> Result<Transaction, String> {
    let transaction: Transaction = params.required(0, "transaction")?;
    let collection: CollectionId = params.required(2, "chunkCollectionID")?;
    let payload = ctx.take_payload(&collection)?;
    Ok(transaction.with_payload(payload))
}

/// Sign with the active wallet. Spending inside the allowance skips the
/// popup; anything else, and every hardware wallet, asks the user.
async fn sign_transaction(ctx: &ModuleContext, mut transaction: Transaction) -> Result<Transaction, String> {
    let wallet = ctx.active_wallet().await?;
    transaction.prepare_for_signing(&wallet.public_key);

    let cost = transaction
        .cost()
        .ok_or_else(|| "Transaction cost overflows".to_string())?;
    let store = &ctx.services.store;
    let url = ctx.app.url();

    // reserved before signing; concurrent calls see the reduced allowance
    let reserved = wallet.kind != WalletKind::Hardware
        && store.try_reserve(url, cost).await.map_err(err)?;

    let decision = if reserved {
        tracing::debug!("{} spends {} within its allowance", url, cost);
        None
    } else {
        let (stripped, payload) = transaction.strip();
        Some(
            ctx.authorize(
                AuthType::Sign,
                json!({
                    "transaction": stripped,
                    "address": wallet.address,
                    "hardware": wallet.kind == WalletKind::Hardware,
                }),
                Some(payload),
            )
            .await?,
        )
    };

    let signed = sign_with(ctx, &wallet, &mut transaction, decision.as_ref()).await;
    if reserved {
        if let Err(e) = &signed {
            tracing::debug!("{} refunds {} after failed signing: {}", url, cost, e);
            store.refund(url, cost).await.map_err(err)?;
        }
    }
    signed?;

    if !reserved && ctx.app.allowance().await.map_err(err)?.enabled {
        store.add_spent(url, cost).await.map_err(err)?;
    }
    Ok(transaction)
}

async fn sign_with(
    ctx: &ModuleContext,
    wallet: &WalletInfo,
    transaction: &mut Transaction,
    decision: Option<&Value>,
) -> Result<(), String> {
    let message = transaction.signature_data().map_err(err)?;
    let signature = ctx.wallet_signature(wallet, &message, decision).await?;
    transaction.set_signature(&signature);
    Ok(())
}

/// Returns the signed transaction without data and tags; the page merges
/// its own copies back in
pub async fn sign(ctx: &ModuleContext, params: &Params) -> Result<Value, String> {
    let transaction = load_transaction(ctx, params)?;
    let signed = sign_transaction(ctx, transaction).await?;
    let (stripped, _) = signed.strip();
    to_value(stripped)
}

pub async fn dispatch(ctx: &ModuleContext, params: &Params) -> Result<Value, String> {
    let transaction = load_transaction(ctx, params)?;
    let signed = sign_transaction(ctx, transaction).await?;
    let gateway = ctx.gateway().await?;

    ctx.services
        .gateway
        .post_transaction(&gateway, &signed)
        .await
        .map_err(err)?;
    tracing::info!("{} dispatched {}", ctx.app.url(), signed.id);

    Ok(json!({ "id": signed.id, "type": "BASE" }))
}
