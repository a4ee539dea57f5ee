use serde_json::{json, Value};

use super::{err, ModuleContext};
use crate::auth::AuthType;
use crate::protocol::Params;

pub async fn add_token(ctx: &ModuleContext, params: &Params) -> Result<Value, String> {
    let id: String = params.required(0, "id")?;
    let token_type: Option<String> = params.optional(1, "type")?;

    let tokens = ctx.services.store.tokens().await.map_err(err)?;
    if tokens.contains(&id) {
        return Err(format!("Token {} is already added", id));
    }

    ctx.authorize(AuthType::Token, json!({ "id": id, "type": token_type }), None)
        .await?;
    ctx.services.store.add_token(&id).await.map_err(err)?;
    tracing::info!("{} added token {}", ctx.app.url(), id);
    Ok(Value::Null)
}

pub async fn is_token_added(ctx: &ModuleContext, params: &Params) -> Result<Value, String> {
    let id: String = params.required(0, "id")?;
    let tokens = ctx.services.store.tokens().await.map_err(err)?;
    Ok(Value::Bool(tokens.contains(&id)))
}
