//! Warms tool catalogs for servers mentioned as `@name` while the user types.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::ToolCatalogCache;

static MENTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@([A-Za-z0-9_-]+)").expect("valid mention regex"));

const DEBOUNCE: Duration = Duration::from_millis(500);
const WARM_CEILING: Duration = Duration::from_secs(5);
const REWARM_AFTER: Duration = Duration::from_secs(30);
const FORGET_AFTER: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmState {
    Idle,
    Warming,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Copy)]
struct WarmEntry {
    state: WarmState,
    updated: Instant,
}

#[derive(Clone)]
pub struct MentionWarmer {
    catalog: ToolCatalogCache,
    entries: Arc<RwLock<HashMap<String, WarmEntry>>>,
    generation: Arc<AtomicU64>,
    debounce: Duration,
    ceiling: Duration,
}

/// Distinct `@name` mentions in order of first appearance.
pub fn mentions(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for caps in MENTION_RE.captures_iter(text) {
        let name = caps[1].to_string();
        if !out.contains(&name) {
            out.push(name);
        }
    }
    out
}

impl MentionWarmer {
    pub fn new(catalog: ToolCatalogCache) -> Self {
        Self::with_timing(catalog, DEBOUNCE, WARM_CEILING)
    }

    pub fn with_timing(catalog: ToolCatalogCache, debounce: Duration, ceiling: Duration) -> Self {
        Self {
            catalog,
            entries: Arc::new(RwLock::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
            debounce,
            ceiling,
        }
    }

    /// Debounced: only the last input within the window triggers warming.
    pub fn on_input(&self, text: &str) {
        let servers = mentions(text);
        if servers.is_empty() {
            return;
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let warmer = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(warmer.debounce).await;
            if warmer.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            warmer.warm_now(&servers).await;
        });
    }

    pub async fn warm_now(&self, servers: &[String]) {
        self.prune().await;
        let transport = self.catalog.connections().transport();
        let mut targets = Vec::new();
        for server in servers {
            if transport.server_config(server).await.is_none() {
                continue;
            }
            let mut entries = self.entries.write().await;
            let due = match entries.get(server) {
                Some(entry) => match entry.state {
                    WarmState::Warming => false,
                    WarmState::Ready => entry.updated.elapsed() >= REWARM_AFTER,
                    WarmState::Idle | WarmState::Failed => true,
                },
                None => true,
            };
            if due {
                entries.insert(
                    server.clone(),
                    WarmEntry {
                        state: WarmState::Warming,
                        updated: Instant::now(),
                    },
                );
                targets.push(server.clone());
            }
        }

        let jobs = targets.into_iter().map(|server| async move {
            let warmed = tokio::time::timeout(self.ceiling, self.catalog.get_tools(&server)).await;
            let state = match warmed {
                Ok(tools) if !tools.is_empty() => WarmState::Ready,
                _ => WarmState::Failed,
            };
            tracing::debug!(server = %server, ?state, "mention warm-up finished");
            self.entries.write().await.insert(
                server,
                WarmEntry {
                    state,
                    updated: Instant::now(),
                },
            );
        });
        futures::future::join_all(jobs).await;
    }

    pub async fn state(&self, server: &str) -> WarmState {
        self.entries
            .read()
            .await
            .get(server)
            .map(|e| e.state)
            .unwrap_or(WarmState::Idle)
    }

    async fn prune(&self) {
        self.entries
            .write()
            .await
            .retain(|_, entry| entry.state == WarmState::Warming || entry.updated.elapsed() < FORGET_AFTER);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTransport;
    use crate::ConnectionManager;

    async fn warmer(fake: &FakeTransport, debounce_ms: u64) -> MentionWarmer {
        let catalog = ToolCatalogCache::new(ConnectionManager::new(Arc::new(fake.clone())), None);
        MentionWarmer::with_timing(catalog, Duration::from_millis(debounce_ms), WARM_CEILING)
    }

    #[test]
    fn mentions_are_distinct_and_ordered() {
        assert_eq!(
            mentions("ask @weather then @fs-tools and @weather again"),
            vec!["weather".to_string(), "fs-tools".to_string()]
        );
        assert!(mentions("mail me at nobody").is_empty());
    }

    #[tokio::test]
    async fn warm_marks_ready_and_skips_recent() {
        let fake = FakeTransport::default().with_server("weather", &["get"]).await;
        let warmer = warmer(&fake, 10).await;
        warmer.warm_now(&["weather".to_string()]).await;
        assert_eq!(warmer.state("weather").await, WarmState::Ready);
        warmer.warm_now(&["weather".to_string()]).await;
        assert_eq!(fake.list_count(), 1);
    }

    #[tokio::test]
    async fn unknown_mentions_are_ignored() {
        let fake = FakeTransport::default();
        let warmer = warmer(&fake, 10).await;
        warmer.warm_now(&["ghost".to_string()]).await;
        assert_eq!(warmer.state("ghost").await, WarmState::Idle);
    }

    #[tokio::test]
    async fn rapid_input_is_debounced_to_last() {
        let fake = FakeTransport::default()
            .with_server("a", &["x"])
            .await
            .with_server("b", &["y"])
            .await;
        let warmer = warmer(&fake, 30).await;
        warmer.on_input("@a");
        warmer.on_input("@b");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(warmer.state("a").await, WarmState::Idle);
        assert_eq!(warmer.state("b").await, WarmState::Ready);
    }
}
