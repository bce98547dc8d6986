use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::{Map, Value};

use conduit_types::ToolSchema;

pub mod catalog;
pub mod connection;
pub mod mcp;
pub mod preheat;

pub use catalog::{CatalogStats, ToolCatalogCache, ToolCatalogEntry};
pub use connection::{ConnectionError, ConnectionManager};
pub use mcp::{McpRegistry, McpServer};
pub use preheat::{MentionWarmer, WarmState};

/// Connection-oriented access to named tool servers.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    /// Persisted configuration for `name`, if it is registered.
    async fn server_config(&self, name: &str) -> Option<McpServer>;
    async fn is_connected(&self, name: &str) -> bool;
    async fn connect(&self, name: &str) -> anyhow::Result<()>;
    async fn disconnect(&self, name: &str) -> bool;
    async fn list_tools(&self, name: &str) -> anyhow::Result<Vec<ToolSchema>>;
    async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        args: &Map<String, Value>,
    ) -> anyhow::Result<String>;
}

/// `CONDUIT_STATE_DIR`, else `<data dir>/conduit`.
pub fn state_dir() -> PathBuf {
    if let Ok(state_dir) = std::env::var("CONDUIT_STATE_DIR") {
        let trimmed = state_dir.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    if let Some(data_dir) = dirs::data_dir() {
        return data_dir.join("conduit");
    }
    dirs::home_dir()
        .map(|home| home.join(".conduit").join("data"))
        .unwrap_or_else(|| PathBuf::from(".conduit"))
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
