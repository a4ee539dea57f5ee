use serde_json::Value;

use super::{err, to_value, ModuleContext};

pub async fn permissions(ctx: &ModuleContext) -> Result<Value, String> {
    to_value(ctx.app.permissions().await.map_err(err)?)
}

pub async fn arweave_config(ctx: &ModuleContext) -> Result<Value, String> {
    to_value(ctx.gateway().await?)
}
