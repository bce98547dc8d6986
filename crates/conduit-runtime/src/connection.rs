use std::sync::Arc;

use thiserror::Error;

use crate::ToolTransport;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("no configuration found for server `{0}`")]
    ConfigMissing(String),

    #[error("server `{0}` is disabled")]
    Disabled(String),

    #[error("failed to connect to {server}: {reason}")]
    Failed { server: String, reason: String },
}

/// Lazily (re)connects servers from their persisted configuration.
#[derive(Clone)]
pub struct ConnectionManager {
    transport: Arc<dyn ToolTransport>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn ToolTransport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> Arc<dyn ToolTransport> {
        self.transport.clone()
    }

    /// No-op when already connected; otherwise exactly one connection attempt.
    pub async fn ensure_connected(&self, server: &str) -> Result<(), ConnectionError> {
        if self.transport.is_connected(server).await {
            return Ok(());
        }
        let Some(config) = self.transport.server_config(server).await else {
            return Err(ConnectionError::ConfigMissing(server.to_string()));
        };
        if !config.enabled {
            return Err(ConnectionError::Disabled(server.to_string()));
        }
        tracing::debug!(server, transport = %config.transport, "connecting tool server");
        self.transport
            .connect(server)
            .await
            .map_err(|err| ConnectionError::Failed {
                server: server.to_string(),
                reason: err.to_string(),
            })
    }

    /// Connects every enabled server, returning one outcome per server.
    pub async fn reconnect_all_enabled(
        &self,
        servers: &[String],
    ) -> Vec<(String, Result<(), ConnectionError>)> {
        let mut outcomes = Vec::new();
        for name in servers {
            let enabled = self
                .transport
                .server_config(name)
                .await
                .map(|c| c.enabled)
                .unwrap_or(false);
            if !enabled {
                continue;
            }
            let outcome = self.ensure_connected(name).await;
            if let Err(err) = &outcome {
                tracing::warn!(server = %name, error = %err, "startup reconnect failed");
            }
            outcomes.push((name.clone(), outcome));
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTransport;

    #[tokio::test]
    async fn connects_once_then_noops() {
        let fake = FakeTransport::default().with_server("weather", &["get"]).await;
        let manager = ConnectionManager::new(Arc::new(fake.clone()));
        manager.ensure_connected("weather").await.expect("connect");
        manager.ensure_connected("weather").await.expect("already");
        assert_eq!(fake.connect_count(), 1);
    }

    #[tokio::test]
    async fn missing_config_is_typed() {
        let fake = FakeTransport::default();
        let manager = ConnectionManager::new(Arc::new(fake.clone()));
        let err = manager.ensure_connected("ghost").await.expect_err("missing");
        assert_eq!(err, ConnectionError::ConfigMissing("ghost".to_string()));
        assert_eq!(fake.connect_count(), 0);
    }

    #[tokio::test]
    async fn reconnect_all_reports_each_enabled_server() {
        let fake = FakeTransport::default()
            .with_server("a", &["x"])
            .await
            .with_server("b", &["y"])
            .await;
        let manager = ConnectionManager::new(Arc::new(fake));
        let outcomes = manager
            .reconnect_all_enabled(&["a".to_string(), "b".to_string(), "ghost".to_string()])
            .await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|(_, r)| r.is_ok()));
    }
}
