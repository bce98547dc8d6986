use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use conduit_runtime::now_ms;
use conduit_types::{call_fingerprint, ToolCallResult};

use crate::config::CallHistoryConfig;

const RECENT_WINDOW_MS: u64 = 5 * 60 * 1000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallHistoryRecord {
    pub server: String,
    pub tool: String,
    pub args_fingerprint: String,
    pub timestamp: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolCallResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallHistoryStats {
    pub total_calls: usize,
    pub recent_calls: usize,
    pub success_rate: f64,
}

/// Recent tool calls keyed by fingerprint.
///
/// Two windows apply: a short one inside which a repeat of a successful call
/// counts as a duplicate, and a longer one inside which its result may still
/// be replayed. The `*_at` variants take the clock explicitly.
#[derive(Clone)]
pub struct CallHistory {
    records: Arc<RwLock<HashMap<String, CallHistoryRecord>>>,
    config: CallHistoryConfig,
    path: Option<Arc<PathBuf>>,
}

impl CallHistory {
    pub fn new(config: CallHistoryConfig, path: Option<PathBuf>) -> Self {
        let loaded = path.as_deref().map(load_file).unwrap_or_default();
        Self {
            records: Arc::new(RwLock::new(loaded)),
            config,
            path: path.map(Arc::new),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(CallHistoryConfig::default(), None)
    }

    pub async fn is_duplicate(&self, server: &str, tool: &str, args: &Map<String, Value>) -> bool {
        self.is_duplicate_at(server, tool, args, now_ms()).await
    }

    pub async fn is_duplicate_at(
        &self,
        server: &str,
        tool: &str,
        args: &Map<String, Value>,
        now: u64,
    ) -> bool {
        let key = call_fingerprint(server, tool, args);
        let window = self.config.duplicate_window_secs * 1000;
        self.records
            .read()
            .await
            .get(&key)
            .is_some_and(|r| r.success && now.saturating_sub(r.timestamp) < window)
    }

    pub async fn recent_result(
        &self,
        server: &str,
        tool: &str,
        args: &Map<String, Value>,
    ) -> Option<ToolCallResult> {
        self.recent_result_at(server, tool, args, now_ms()).await
    }

    pub async fn recent_result_at(
        &self,
        server: &str,
        tool: &str,
        args: &Map<String, Value>,
        now: u64,
    ) -> Option<ToolCallResult> {
        let key = call_fingerprint(server, tool, args);
        let window = self.config.reuse_window_secs * 1000;
        let records = self.records.read().await;
        let record = records.get(&key)?;
        if !record.success || now.saturating_sub(record.timestamp) >= window {
            return None;
        }
        record.result.clone()
    }

    pub async fn record(
        &self,
        server: &str,
        tool: &str,
        args: &Map<String, Value>,
        success: bool,
        result: Option<ToolCallResult>,
    ) {
        self.record_at(server, tool, args, success, result, now_ms()).await;
    }

    pub async fn record_at(
        &self,
        server: &str,
        tool: &str,
        args: &Map<String, Value>,
        success: bool,
        result: Option<ToolCallResult>,
        now: u64,
    ) {
        let key = call_fingerprint(server, tool, args);
        let record = CallHistoryRecord {
            server: server.to_string(),
            tool: tool.to_string(),
            args_fingerprint: key.clone(),
            timestamp: now,
            success,
            result: if success { result } else { None },
        };
        {
            let mut records = self.records.write().await;
            records.insert(key, record);
            self.evict(&mut records, now);
        }
        self.persist().await;
    }

    pub async fn stats(&self) -> CallHistoryStats {
        self.stats_at(now_ms()).await
    }

    pub async fn stats_at(&self, now: u64) -> CallHistoryStats {
        let records = self.records.read().await;
        let total = records.len();
        let recent = records
            .values()
            .filter(|r| now.saturating_sub(r.timestamp) < RECENT_WINDOW_MS)
            .count();
        let succeeded = records.values().filter(|r| r.success).count();
        CallHistoryStats {
            total_calls: total,
            recent_calls: recent,
            success_rate: if total == 0 {
                0.0
            } else {
                succeeded as f64 / total as f64
            },
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn clear(&self) {
        self.records.write().await.clear();
        self.persist().await;
    }

    /// Age first, then the oldest entries past the count bound.
    fn evict(&self, records: &mut HashMap<String, CallHistoryRecord>, now: u64) {
        let max_age = self.config.max_age_secs * 1000;
        records.retain(|_, r| now.saturating_sub(r.timestamp) <= max_age);
        let max_entries = self.config.max_entries.max(1);
        if records.len() <= max_entries {
            return;
        }
        let mut by_age = records
            .iter()
            .map(|(k, r)| (r.timestamp, k.clone()))
            .collect::<Vec<_>>();
        by_age.sort();
        let excess = records.len() - max_entries;
        for (_, key) in by_age.into_iter().take(excess) {
            records.remove(&key);
        }
    }

    async fn persist(&self) {
        let Some(path) = self.path.as_deref() else {
            return;
        };
        let snapshot = self.records.read().await.clone();
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        match serde_json::to_string_pretty(&snapshot) {
            Ok(payload) => {
                if let Err(err) = tokio::fs::write(path, payload).await {
                    tracing::debug!(path = %path.display(), error = %err, "call history not persisted");
                }
            }
            Err(err) => tracing::debug!(error = %err, "call history not serializable"),
        }
    }
}

fn load_file(path: &Path) -> HashMap<String, CallHistoryRecord> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}
