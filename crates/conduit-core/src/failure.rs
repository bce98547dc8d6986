use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::RwLock;

use conduit_tools::hints;
use conduit_types::{ConversationId, FailKey, ToolSchema};

/// Consecutive-failure counters per (conversation, server, tool).
#[derive(Clone, Default)]
pub struct FailureEscalation {
    counters: Arc<RwLock<HashMap<FailKey, u32>>>,
}

impl FailureEscalation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one more failure and returns the new stage (1-based).
    pub async fn increment(&self, key: &FailKey) -> u32 {
        let mut counters = self.counters.write().await;
        let stage = counters.entry(key.clone()).or_insert(0);
        *stage = stage.saturating_add(1);
        *stage
    }

    pub async fn stage(&self, key: &FailKey) -> u32 {
        self.counters.read().await.get(key).copied().unwrap_or(0)
    }

    pub async fn reset(&self, key: &FailKey) {
        self.counters.write().await.remove(key);
    }

    pub async fn reset_conversation(&self, conversation: &ConversationId) {
        self.counters
            .write()
            .await
            .retain(|key, _| &key.conversation != conversation);
    }
}

/// Corrective text for a failed call; detail grows with the stage.
/// Without a schema the server's catalog is listed instead.
pub fn escalation_hint(
    stage: u32,
    server: &str,
    schema: Option<&ToolSchema>,
    args: &Map<String, Value>,
    catalog: &[ToolSchema],
) -> String {
    let Some(schema) = schema else {
        if catalog.is_empty() {
            return String::new();
        }
        return format!(
            "Available tools on \"{server}\":\n{}",
            hints::describe_tools(catalog)
        );
    };
    match stage {
        0 | 1 => hints::schema_hint(server, schema),
        2 => hints::concise_guide(server, schema, args),
        _ => hints::detailed_guide(server, schema, args, catalog),
    }
}
