//! Per-server tool catalogs with a TTL, a JSON file behind them and
//! refresh-ahead in the background.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use conduit_types::ToolSchema;

use crate::{now_ms, ConnectionManager};

pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_LIST_TIMEOUT: Duration = Duration::from_millis(1200);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCatalogEntry {
    pub server_name: String,
    pub tools: Vec<ToolSchema>,
    pub last_connected: u64,
    pub ttl: u64,
}

impl ToolCatalogEntry {
    fn age(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_connected)
    }

    pub fn is_fresh(&self, now: u64) -> bool {
        self.age(now) < self.ttl
    }

    fn wants_refresh(&self, now: u64) -> bool {
        self.age(now) >= self.ttl / 2
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogFile {
    servers: HashMap<String, ToolCatalogEntry>,
    last_update: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CatalogStats {
    pub entries: usize,
    pub valid: usize,
    pub expired: usize,
    pub total_tools: usize,
}

#[derive(Clone)]
pub struct ToolCatalogCache {
    entries: Arc<RwLock<HashMap<String, ToolCatalogEntry>>>,
    refreshing: Arc<Mutex<HashSet<String>>>,
    connections: ConnectionManager,
    path: Option<Arc<PathBuf>>,
    ttl: Duration,
    list_timeout: Duration,
}

impl ToolCatalogCache {
    pub fn new(connections: ConnectionManager, path: Option<PathBuf>) -> Self {
        Self::with_limits(connections, path, DEFAULT_TTL, DEFAULT_LIST_TIMEOUT)
    }

    pub fn with_limits(
        connections: ConnectionManager,
        path: Option<PathBuf>,
        ttl: Duration,
        list_timeout: Duration,
    ) -> Self {
        let loaded = path.as_deref().map(load_file).unwrap_or_default();
        Self {
            entries: Arc::new(RwLock::new(loaded.servers)),
            refreshing: Arc::new(Mutex::new(HashSet::new())),
            connections,
            path: path.map(Arc::new),
            ttl,
            list_timeout,
        }
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// Fresh cache first; otherwise a bounded live listing, then any stale
    /// entry, then an empty list.
    pub async fn get_tools(&self, server: &str) -> Vec<ToolSchema> {
        let now = now_ms();
        let cached = self.entries.read().await.get(server).cloned();
        if let Some(entry) = cached.as_ref() {
            if entry.is_fresh(now) && !entry.tools.is_empty() {
                if entry.wants_refresh(now) {
                    self.spawn_refresh(server);
                }
                return entry.tools.clone();
            }
        }
        match self.refresh(server).await {
            Ok(tools) => tools,
            Err(err) => {
                tracing::warn!(server, error = %err, "tool listing failed");
                cached.map(|entry| entry.tools).unwrap_or_default()
            }
        }
    }

    /// Looks `tool` up case-insensitively; also returns the whole catalog for hints.
    pub async fn find_tool(&self, server: &str, tool: &str) -> (Option<ToolSchema>, Vec<ToolSchema>) {
        let tools = self.get_tools(server).await;
        let found = tools
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(tool))
            .cloned();
        (found, tools)
    }

    /// Like [`Self::find_tool`] but answers from memory only, fresh or stale.
    /// `None` when nothing usable is cached.
    pub async fn find_cached(
        &self,
        server: &str,
        tool: &str,
    ) -> Option<(Option<ToolSchema>, Vec<ToolSchema>)> {
        let tools = self
            .entries
            .read()
            .await
            .get(server)
            .map(|entry| entry.tools.clone())
            .filter(|tools| !tools.is_empty())?;
        let found = tools
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(tool))
            .cloned();
        Some((found, tools))
    }

    pub async fn refresh(&self, server: &str) -> anyhow::Result<Vec<ToolSchema>> {
        self.connections.ensure_connected(server).await?;
        let transport = self.connections.transport();
        let tools = tokio::time::timeout(self.list_timeout, transport.list_tools(server))
            .await
            .map_err(|_| anyhow!("listing tools for `{server}` timed out"))??;
        self.store(server, tools.clone(), now_ms()).await;
        Ok(tools)
    }

    pub fn spawn_refresh(&self, server: &str) {
        let cache = self.clone();
        let server = server.to_string();
        tokio::spawn(async move {
            if !cache.refreshing.lock().await.insert(server.clone()) {
                return;
            }
            if let Err(err) = cache.refresh(&server).await {
                tracing::debug!(server = %server, error = %err, "background catalog refresh failed");
            }
            cache.refreshing.lock().await.remove(&server);
        });
    }

    /// Warms several servers concurrently.
    pub async fn preconnect(&self, servers: &[String]) -> HashMap<String, Vec<ToolSchema>> {
        let lookups = servers.iter().map(|server| async move {
            let tools = self.get_tools(server).await;
            (server.clone(), tools)
        });
        let results = futures::future::join_all(lookups).await;
        let ready = results.iter().filter(|(_, tools)| !tools.is_empty()).count();
        tracing::info!(ready, requested = servers.len(), "catalog preconnect finished");
        results.into_iter().collect()
    }

    pub async fn cached(&self, server: &str) -> Option<ToolCatalogEntry> {
        self.entries.read().await.get(server).cloned()
    }

    /// Drops one server's catalog, or all of them.
    pub async fn invalidate(&self, server: Option<&str>) {
        {
            let mut entries = self.entries.write().await;
            match server {
                Some(name) => {
                    entries.remove(name);
                }
                None => entries.clear(),
            }
        }
        self.persist().await;
    }

    pub async fn stats(&self) -> CatalogStats {
        let now = now_ms();
        let entries = self.entries.read().await;
        let valid = entries.values().filter(|e| e.is_fresh(now)).count();
        CatalogStats {
            entries: entries.len(),
            valid,
            expired: entries.len() - valid,
            total_tools: entries.values().map(|e| e.tools.len()).sum(),
        }
    }

    pub(crate) async fn store(&self, server: &str, tools: Vec<ToolSchema>, at: u64) {
        let entry = ToolCatalogEntry {
            server_name: server.to_string(),
            tools,
            last_connected: at,
            ttl: self.ttl.as_millis() as u64,
        };
        self.entries.write().await.insert(server.to_string(), entry);
        self.persist().await;
    }

    async fn persist(&self) {
        let Some(path) = self.path.as_deref() else {
            return;
        };
        let file = CatalogFile {
            servers: self.entries.read().await.clone(),
            last_update: now_ms(),
        };
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if let Ok(payload) = serde_json::to_string_pretty(&file) {
            let _ = tokio::fs::write(path, payload).await;
        }
    }
}

fn load_file(path: &Path) -> CatalogFile {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<CatalogFile>(&raw).ok())
        .unwrap_or_default()
}
