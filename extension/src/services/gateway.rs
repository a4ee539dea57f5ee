// Gateway collaborator
// Network access is out of scope; the core only needs the gateway settings it
// hands to applications and a way to post signed transactions.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::transaction::Transaction;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub protocol: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "arweave.net".to_string(),
            port: 443,
            protocol: "https".to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }
}

#[async_trait]
pub trait Gateway: Send + Sync {
    /// Gateway used when the application has no override
    fn config(&self) -> GatewayConfig;

    /// Submit a signed transaction
    async fn post_transaction(&self, gateway: &GatewayConfig, transaction: &Transaction) -> Result<()>;
}

/// Records posted transactions instead of sending them
#[derive(Default)]
pub struct MemoryGateway {
    config: GatewayConfig,
    posted: Mutex<Vec<(String, Transaction)>>,
}

impl MemoryGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            posted: Mutex::new(Vec::new()),
        }
    }

    /// `(gateway url, transaction)` for every post so far
    pub fn posted(&self) -> Vec<(String, Transaction)> {
        self.posted.lock().clone()
    }
}

#[async_trait]
impl Gateway for MemoryGateway {
    fn config(&self) -> GatewayConfig {
        self.config.clone()
    }

    async fn post_transaction(&self, gateway: &GatewayConfig, transaction: &Transaction) -> Result<()> {
        if transaction.signature.is_empty() {
            anyhow::bail!("Transaction {} is not signed", transaction.id);
        }
        tracing::info!("Posting transaction {} to {}", transaction.id, gateway.url());
        self.posted.lock().push((gateway.url(), transaction.clone()));
        Ok(())
    }
}
