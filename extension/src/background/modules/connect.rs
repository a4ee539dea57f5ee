use serde_json::{json, Value};
use std::collections::BTreeSet;

use super::{err, ModuleContext};
use crate::auth::AuthType;
use crate::protocol::{AppInfo, Params, Permission};
use crate::services::gateway::GatewayConfig;

fn requested_permissions(params: &Params) -> Result<Vec<Permission>, String> {
    let names: Vec<String> = params.required(0, "permissions")?;
    if names.is_empty() {
        return Err("No permissions requested".to_string());
    }
    names
        .iter()
        .map(|name| {
            serde_json::from_value(Value::String(name.clone()))
                .map_err(|_| format!("Unknown permission requested: {}", name))
        })
        .collect()
}

pub async fn connect(ctx: &ModuleContext, params: &Params) -> Result<Value, String> {
    let requested = requested_permissions(params)?;
    let app_info: AppInfo = params.optional(1, "appInfo")?.unwrap_or_default();
    let gateway: Option<GatewayConfig> = params.optional(2, "gateway")?;

    let existing = ctx.app.settings().await.map_err(err)?;
    let mut settings = existing.clone().unwrap_or_default();

    let missing: Vec<Permission> = requested
        .iter()
        .filter(|permission| !settings.permissions.contains(*permission))
        .copied()
        .collect();

    if !missing.is_empty() {
        let decision = ctx
            .authorize(
                AuthType::Connect,
                json!({
                    "permissions": requested,
                    "appInfo": app_info,
                    "gateway": gateway,
                }),
                None,
            )
            .await?;

        // The popup may narrow the requested set, never widen it
        let granted: BTreeSet<Permission> = match decision.get("permissions") {
            Some(list) => serde_json::from_value::<Vec<Permission>>(list.clone())
                .map_err(|e| format!("Invalid permissions from popup: {}", e))?
                .into_iter()
                .filter(|permission| requested.contains(permission))
                .collect(),
            None => requested.iter().copied().collect(),
        };
        if granted.is_empty() {
            return Err("No permissions were granted".to_string());
        }
        settings.permissions.extend(granted);
    }

    if let Some(name) = app_info.name {
        settings.name = Some(name);
    }
    if let Some(logo) = app_info.logo.or_else(|| ctx.favicon.clone()) {
        settings.logo = Some(logo);
    }
    if gateway.is_some() {
        settings.gateway = gateway;
    }

    if existing.as_ref() != Some(&settings) {
        tracing::info!(
            "{} connected with {:?}",
            ctx.app.url(),
            settings.permissions
        );
        ctx.app.save(settings).await.map_err(err)?;
    }
    Ok(Value::Null)
}

pub async fn disconnect(ctx: &ModuleContext) -> Result<Value, String> {
    ctx.app.remove().await.map_err(err)?;
    ctx.chunks.discard_owner(ctx.app.url().as_str());
    tracing::info!("{} disconnected", ctx.app.url());
    Ok(Value::Null)
}
