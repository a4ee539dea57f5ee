// Headless wallet host
// Runs the background, one simulated tab with the wallet API injected and a
// popup that decides automatically, then walks the page through a session.

use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::env;
use std::sync::Arc;

use arweave_wallet_extension::auth::{popup, AuthPopup};
use arweave_wallet_extension::bus::MAIN_FRAME;
use arweave_wallet_extension::chunks::Tag;
use arweave_wallet_extension::config::ConfigFile;
use arweave_wallet_extension::protocol::{AppInfo, Permission};
use arweave_wallet_extension::services::{
    Browser, DevKeystore, MemoryGateway, MemoryStore, SimulatedBrowser, TracingActivityLog, Winston,
};
use arweave_wallet_extension::transaction::{Transaction, TRANSACTION_FORMAT};
use arweave_wallet_extension::{Background, ContentScript, MessageBus, PageWindow, Services, WalletApi};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    tracing::info!("Loading configuration from: {}", config_path);

    let config = ConfigFile::load(&config_path)?;
    config.validate()?;

    let wallet = config
        .wallet
        .clone()
        .context("Missing [wallet] config section")?;
    let demo = config.demo.clone().context("Missing [demo] config section")?;

    let store = Arc::new(MemoryStore::new());
    for app in &config.apps {
        store.insert(app.app_url()?, app.settings());
    }
    tracing::info!("Seeded {} application(s)", store.len());

    let keystore = Arc::new(DevKeystore::new());
    let account = keystore.add_generated(&wallet.nickname);
    tracing::info!("Development wallet {} ({})", account.nickname, account.address);

    let gateway = Arc::new(MemoryGateway::new(config.gateway.clone()));
    let browser = Arc::new(SimulatedBrowser::new());
    let services = Services {
        store,
        keystore,
        gateway: gateway.clone(),
        browser: browser.clone(),
        activity: Arc::new(TracingActivityLog),
    };

    let bus = MessageBus::new();
    let background = Background::init(&bus, services, config.auth_settings())?;

    let auto_approve = demo.auto_approve;
    let popups = popup::serve(bus.clone(), browser.window_events(), move |popup| {
        decide(popup, auto_approve)
    });

    let tab_id = browser.open_tab(&demo.url, None);
    let window = Arc::new(PageWindow::new(demo.url.clone()));
    let content = ContentScript::init(&bus, tab_id, MAIN_FRAME, window.clone())?;
    let api = WalletApi::inject(window, config.bridge.chunk_size);
    tracing::info!("Opened {} in tab {}", demo.url, tab_id);

    let result = run_session(&api).await;
    match &result {
        Ok(()) => tracing::info!(
            "Session finished, {} transaction(s) posted",
            gateway.posted().len()
        ),
        Err(e) => tracing::error!("Session failed: {:#}", e),
    }

    popups.abort();
    api.teardown();
    content.teardown();
    background.teardown();
    result
}

/// What a user clicking through the popup would do
async fn decide(mut popup: AuthPopup, approve: bool) {
    let window_id = popup.window_id();
    tracing::info!(
        "Popup {} asks {} for {:?}",
        window_id,
        popup.request().url,
        popup.request().auth_type
    );

    if let Err(e) = popup.listen().await {
        tracing::warn!("Popup {} could not signal listening: {}", window_id, e);
        return;
    }
    match popup.payload().await {
        Ok(Some(payload)) => tracing::info!(
            "Popup {} received {} bytes and {} tags",
            window_id,
            payload.data.len(),
            payload.tags.len()
        ),
        Ok(None) => {}
        Err(e) => {
            tracing::warn!("Popup {} lost its payload: {}", window_id, e);
            return;
        }
    }

    let decided = if approve {
        popup.approve(Value::Null).await
    } else {
        popup.reject("User rejected the request").await
    };
    if let Err(e) = decided {
        tracing::warn!("Popup {} could not reply: {}", window_id, e);
    }
}

async fn run_session(api: &WalletApi) -> Result<()> {
    let permissions = [
        Permission::AccessAddress,
        Permission::AccessPublicKey,
        Permission::SignTransaction,
        Permission::Dispatch,
    ];
    let app_info = AppInfo {
        name: Some("Headless demo".to_string()),
        logo: None,
    };
    api.connect(&permissions, Some(&app_info), None)
        .await
        .map_err(anyhow::Error::msg)?;
    tracing::info!("Connected with {:?}", api.get_permissions().await.map_err(anyhow::Error::msg)?);

    let address = api.get_active_address().await.map_err(anyhow::Error::msg)?;
    tracing::info!("Active address: {}", address);

    let transaction = Transaction {
        format: TRANSACTION_FORMAT,
        quantity: Winston(1_000),
        reward: Winston(250),
        tags: vec![Tag::new("Content-Type", "text/plain")],
        data: b"hello from the headless wallet host".to_vec(),
        ..Default::default()
    };

    let signed = api.sign(&transaction, None).await.map_err(anyhow::Error::msg)?;
    tracing::info!(
        "Signed transaction {} (data sha256 {}), valid: {}",
        signed.id,
        hex::encode(Sha256::digest(&signed.data)),
        signed.verify()?
    );

    let dispatched = api
        .dispatch(&transaction, None)
        .await
        .map_err(anyhow::Error::msg)?;
    tracing::info!("Dispatched transaction {} ({})", dispatched.id, dispatched.result_type);
    Ok(())
}
