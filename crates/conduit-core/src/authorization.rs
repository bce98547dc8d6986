use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;

use conduit_runtime::now_ms;
use conduit_types::{MessageId, ToolCallRequest};

use crate::config::{AuthorizationConfig, ServerAuthorization};
use crate::event_bus::EventBus;

/// Servers that always ask unless a per-server override says otherwise.
pub const SENSITIVE_SERVERS: [&str; 3] = ["filesystem", "file-system", "fs"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingAuthorization {
    pub id: String,
    pub message_id: MessageId,
    pub server: String,
    pub tool: String,
    pub args: Value,
    pub created_at: u64,
}

/// Holds tool calls until an external actor approves or rejects them.
///
/// The pending id is the request's card id, so a re-entrant request for the
/// same card waits on the same decision instead of queueing a second prompt.
#[derive(Clone)]
pub struct AuthorizationGate {
    config: Arc<RwLock<AuthorizationConfig>>,
    pending: Arc<RwLock<Vec<PendingAuthorization>>>,
    waiters: Arc<RwLock<HashMap<String, watch::Sender<Option<bool>>>>>,
    event_bus: EventBus,
}

impl AuthorizationGate {
    pub fn new(config: AuthorizationConfig, event_bus: EventBus) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            pending: Arc::new(RwLock::new(Vec::new())),
            waiters: Arc::new(RwLock::new(HashMap::new())),
            event_bus,
        }
    }

    pub async fn set_config(&self, config: AuthorizationConfig) {
        *self.config.write().await = config;
    }

    pub async fn set_server_override(&self, server: &str, auto_authorize: Option<bool>) {
        let mut config = self.config.write().await;
        let entry = config
            .servers
            .entry(server.to_string())
            .or_insert_with(ServerAuthorization::default);
        entry.auto_authorize = auto_authorize;
        if entry == &ServerAuthorization::default() {
            config.servers.remove(server);
        }
    }

    /// Server override, then the sensitive denylist, then the global default.
    pub async fn should_auto_authorize(&self, server: &str) -> bool {
        let config = self.config.read().await;
        if let Some(explicit) = config.servers.get(server).and_then(|s| s.auto_authorize) {
            return explicit;
        }
        if SENSITIVE_SERVERS.contains(&server.to_ascii_lowercase().as_str()) {
            return false;
        }
        config.default_auto_authorize
    }

    /// Resolves immediately for auto-authorized servers, otherwise waits for a decision.
    pub async fn authorize(
        &self,
        request: &ToolCallRequest,
        message_id: &MessageId,
        cancel: CancellationToken,
    ) -> bool {
        if self.should_auto_authorize(&request.server).await {
            return true;
        }
        self.request_authorization(request, message_id, cancel).await
    }

    /// Registers (or joins) a pending entry and waits for it to be resolved.
    /// Cancellation abandons the wait, drops the entry and yields `false`.
    pub async fn request_authorization(
        &self,
        request: &ToolCallRequest,
        message_id: &MessageId,
        cancel: CancellationToken,
    ) -> bool {
        let id = request.card_id.clone();
        let (mut rx, fresh) = {
            let mut waiters = self.waiters.write().await;
            if let Some(tx) = waiters.get(&id) {
                (tx.subscribe(), false)
            } else {
                let (tx, rx) = watch::channel(None);
                waiters.insert(id.clone(), tx);
                (rx, true)
            }
        };
        if fresh {
            self.register(request, message_id).await;
        }

        let immediate = *rx.borrow();
        if let Some(decision) = immediate {
            return decision;
        }
        let cancelled = tokio::select! {
            _ = cancel.cancelled() => true,
            _ = rx.changed() => false,
        };
        if cancelled {
            self.abandon(&id).await;
            return false;
        }
        let decision = *rx.borrow();
        decision.unwrap_or(false)
    }

    pub async fn pending(&self) -> Vec<PendingAuthorization> {
        self.pending.read().await.clone()
    }

    pub async fn approve(&self, id: &str) -> bool {
        self.resolve(id, true).await
    }

    pub async fn reject(&self, id: &str) -> bool {
        self.resolve(id, false).await
    }

    async fn register(&self, request: &ToolCallRequest, message_id: &MessageId) {
        let entry = PendingAuthorization {
            id: request.card_id.clone(),
            message_id: message_id.clone(),
            server: request.server.clone(),
            tool: request.tool.clone(),
            args: Value::Object(request.args.clone()),
            created_at: now_ms(),
        };
        self.pending.write().await.push(entry.clone());
        tracing::debug!(id = %entry.id, server = %entry.server, tool = %entry.tool, "authorization pending");
        self.event_bus.emit(
            "authorization.asked",
            json!({
                "id": entry.id,
                "messageId": entry.message_id,
                "server": entry.server,
                "tool": entry.tool,
                "args": entry.args
            }),
        );
    }

    /// Exactly once per id: the entry is removed before the decision is sent.
    async fn resolve(&self, id: &str, approved: bool) -> bool {
        {
            let mut pending = self.pending.write().await;
            let Some(index) = pending.iter().position(|p| p.id == id) else {
                return false;
            };
            pending.remove(index);
        }
        let waiter = self.waiters.write().await.remove(id);
        if let Some(tx) = waiter {
            let _ = tx.send(Some(approved));
        }
        self.event_bus.emit(
            "authorization.replied",
            json!({"id": id, "approved": approved}),
        );
        true
    }

    async fn abandon(&self, id: &str) {
        self.pending.write().await.retain(|p| p.id != id);
        self.waiters.write().await.remove(id);
        tracing::debug!(id, "authorization wait cancelled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use std::time::Duration;

    fn gate(default_auto: bool) -> AuthorizationGate {
        AuthorizationGate::new(
            AuthorizationConfig {
                default_auto_authorize: default_auto,
                servers: HashMap::new(),
            },
            EventBus::new(),
        )
    }

    fn request(server: &str) -> ToolCallRequest {
        let mut args = Map::new();
        args.insert("path".to_string(), json!("README.md"));
        ToolCallRequest::new(server, "read", args)
    }

    async fn wait_for_pending(gate: &AuthorizationGate, count: usize) {
        for _ in 0..100 {
            if gate.pending().await.len() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("pending entries never reached {count}");
    }

    #[tokio::test]
    async fn filesystem_requires_approval_despite_global_default() {
        let gate = gate(true);
        assert!(!gate.should_auto_authorize("filesystem").await);
        assert!(!gate.should_auto_authorize("fs").await);
        assert!(gate.should_auto_authorize("weather").await);
        gate.set_server_override("filesystem", Some(true)).await;
        assert!(gate.should_auto_authorize("filesystem").await);
        gate.set_server_override("filesystem", None).await;
        assert!(!gate.should_auto_authorize("filesystem").await);
    }

    #[tokio::test]
    async fn approval_resolves_waiter_exactly_once() {
        let gate = gate(false);
        let req = request("filesystem");
        let waiting = {
            let gate = gate.clone();
            let req = req.clone();
            tokio::spawn(async move {
                gate.request_authorization(&req, &MessageId::from("m1"), CancellationToken::new())
                    .await
            })
        };
        wait_for_pending(&gate, 1).await;
        assert!(gate.approve(&req.card_id).await);
        assert!(!gate.reject(&req.card_id).await);
        assert!(waiting.await.expect("join"));
        assert!(gate.pending().await.is_empty());
    }

    #[tokio::test]
    async fn same_card_shares_one_pending_entry() {
        let gate = gate(false);
        let req = request("filesystem");
        let spawn_wait = |gate: AuthorizationGate, req: ToolCallRequest| {
            tokio::spawn(async move {
                gate.request_authorization(&req, &MessageId::from("m1"), CancellationToken::new())
                    .await
            })
        };
        let first = spawn_wait(gate.clone(), req.clone());
        wait_for_pending(&gate, 1).await;
        let second = spawn_wait(gate.clone(), req.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(gate.pending().await.len(), 1);
        assert!(gate.reject(&req.card_id).await);
        assert!(!first.await.expect("join"));
        assert!(!second.await.expect("join"));
    }

    #[tokio::test]
    async fn cancellation_removes_pending_entry() {
        let gate = gate(false);
        let req = request("filesystem");
        let cancel = CancellationToken::new();
        let waiting = {
            let gate = gate.clone();
            let req = req.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                gate.request_authorization(&req, &MessageId::from("m1"), cancel).await
            })
        };
        wait_for_pending(&gate, 1).await;
        cancel.cancel();
        assert!(!waiting.await.expect("join"));
        assert!(gate.pending().await.is_empty());
        assert!(!gate.approve(&req.card_id).await);
    }

    #[tokio::test]
    async fn asked_event_carries_tool_and_args() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let gate = AuthorizationGate::new(AuthorizationConfig::default(), bus);
        let req = request("filesystem");
        let waiting = {
            let gate = gate.clone();
            let req = req.clone();
            tokio::spawn(async move {
                gate.authorize(&req, &MessageId::from("m1"), CancellationToken::new())
                    .await
            })
        };
        let event = rx.recv().await.expect("event");
        assert_eq!(event.event_type, "authorization.asked");
        assert_eq!(event.properties["tool"], "read");
        assert_eq!(event.properties["args"]["path"], "README.md");
        gate.approve(&req.card_id).await;
        assert!(waiting.await.expect("join"));
        assert_eq!(rx.recv().await.expect("reply").event_type, "authorization.replied");
    }
}
