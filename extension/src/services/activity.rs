// Activity log collaborator
// Every authorized call is recorded before execution. Recording is
// fire-and-forget: a failing log never aborts the call.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::app::AppUrl;
use crate::protocol::ApiFunction;

#[derive(Debug, Clone, Serialize)]
pub struct ActivityEntry {
    pub app: AppUrl,
    pub function: String,
    pub timestamp: u64,
}

impl ActivityEntry {
    pub fn new(app: AppUrl, function: ApiFunction) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            app,
            function: function.name().to_string(),
            timestamp,
        }
    }
}

#[async_trait]
pub trait ActivityLog: Send + Sync {
    async fn record(&self, entry: ActivityEntry) -> Result<()>;
}

/// Writes entries to the tracing output
pub struct TracingActivityLog;

#[async_trait]
impl ActivityLog for TracingActivityLog {
    async fn record(&self, entry: ActivityEntry) -> Result<()> {
        tracing::info!(app = %entry.app, function = %entry.function, "API call");
        Ok(())
    }
}

/// Keeps entries in memory
#[derive(Default)]
pub struct MemoryActivityLog {
    entries: Mutex<Vec<ActivityEntry>>,
}

impl MemoryActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<ActivityEntry> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl ActivityLog for MemoryActivityLog {
    async fn record(&self, entry: ActivityEntry) -> Result<()> {
        self.entries.lock().push(entry);
        Ok(())
    }
}
