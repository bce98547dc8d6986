//! Tool executors. Each turns one [`ToolCallRequest`] into a
//! [`ToolCallResult`]; failures are results, never errors.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use conduit_types::{
    ConversationId, FailKey, MessageId, ToolCallRequest, ToolCallResult, ToolError, ToolSchema,
    WEB_SEARCH_SERVER,
};

use crate::authorization::AuthorizationGate;
use crate::call_history::CallHistory;
use crate::event_bus::EventBus;
use crate::failure::{escalation_hint, FailureEscalation};

mod mcp;
mod web;

pub use mcp::McpBackend;
pub use web::WebBackend;

pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(conversation_id: ConversationId, message_id: MessageId, cancel: CancellationToken) -> Self {
        Self {
            conversation_id,
            message_id,
            cancel,
        }
    }
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn execute(&self, request: &ToolCallRequest, ctx: &ExecutionContext) -> ToolCallResult;
}

/// Authorization, call history and failure escalation shared by every backend.
#[derive(Clone)]
pub struct CallGuards {
    pub gate: AuthorizationGate,
    pub history: CallHistory,
    pub failures: FailureEscalation,
    pub event_bus: EventBus,
}

impl CallGuards {
    pub fn new(
        gate: AuthorizationGate,
        history: CallHistory,
        failures: FailureEscalation,
        event_bus: EventBus,
    ) -> Self {
        Self {
            gate,
            history,
            failures,
            event_bus,
        }
    }

    pub(crate) async fn authorize(&self, request: &ToolCallRequest, ctx: &ExecutionContext) -> bool {
        self.gate
            .authorize(request, &ctx.message_id, ctx.cancel.clone())
            .await
    }

    /// A repeat of a call that succeeded inside the duplicate window replays its result.
    pub(crate) async fn replay(&self, request: &ToolCallRequest) -> Option<ToolCallResult> {
        if !self
            .history
            .is_duplicate(&request.server, &request.tool, &request.args)
            .await
        {
            return None;
        }
        let cached = self
            .history
            .recent_result(&request.server, &request.tool, &request.args)
            .await?;
        tracing::debug!(server = %request.server, tool = %request.tool, "replaying recent tool result");
        Some(cached.replayed())
    }

    pub(crate) async fn succeed(
        &self,
        request: &ToolCallRequest,
        ctx: &ExecutionContext,
        output: String,
    ) -> ToolCallResult {
        let result = ToolCallResult::success(output);
        self.history
            .record(&request.server, &request.tool, &request.args, true, Some(result.clone()))
            .await;
        self.failures
            .reset(&FailKey::new(&ctx.conversation_id, &request.server, &request.tool))
            .await;
        result
    }

    /// Records the failure, bumps the fail stage and attaches a staged hint.
    pub(crate) async fn fail(
        &self,
        request: &ToolCallRequest,
        ctx: &ExecutionContext,
        error: ToolError,
        schema: Option<&ToolSchema>,
        catalog: &[ToolSchema],
    ) -> ToolCallResult {
        self.history
            .record(&request.server, &request.tool, &request.args, false, None)
            .await;
        let stage = self
            .failures
            .increment(&FailKey::new(&ctx.conversation_id, &request.server, &request.tool))
            .await;
        tracing::debug!(
            server = %request.server,
            tool = %request.tool,
            code = error.code(),
            stage,
            "tool call failed"
        );
        let hint = escalation_hint(stage, &request.server, schema, &request.args, catalog);
        ToolCallResult::failure(&error)
            .with_hint(hint)
            .with_stage(stage)
    }
}

/// Sends `web_search` to the native backend and everything else to MCP.
#[derive(Clone)]
pub struct BackendRouter {
    mcp: Arc<dyn ExecutionBackend>,
    web: Arc<dyn ExecutionBackend>,
}

impl BackendRouter {
    pub fn new(mcp: Arc<dyn ExecutionBackend>, web: Arc<dyn ExecutionBackend>) -> Self {
        Self { mcp, web }
    }

    pub fn backend_for(&self, server: &str) -> Arc<dyn ExecutionBackend> {
        if server == WEB_SEARCH_SERVER {
            self.web.clone()
        } else {
            self.mcp.clone()
        }
    }
}

#[async_trait]
impl ExecutionBackend for BackendRouter {
    async fn execute(&self, request: &ToolCallRequest, ctx: &ExecutionContext) -> ToolCallResult {
        self.backend_for(&request.server).execute(request, ctx).await
    }
}

/// Bounds an invocation by `limit` and the context's cancellation.
pub(crate) async fn bounded<F>(
    limit: Duration,
    cancel: &CancellationToken,
    call: F,
) -> Result<String, ToolError>
where
    F: std::future::Future<Output = anyhow::Result<String>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(ToolError::InvocationFailed("cancelled".to_string())),
        outcome = tokio::time::timeout(limit, call) => match outcome {
            Err(_) => Err(ToolError::InvocationTimeout),
            Ok(Err(err)) => Err(ToolError::InvocationFailed(err.to_string())),
            Ok(Ok(output)) => Ok(output),
        },
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::config::AuthorizationConfig;

    pub fn guards(auto_authorize: bool) -> CallGuards {
        let bus = EventBus::new();
        CallGuards::new(
            AuthorizationGate::new(
                AuthorizationConfig {
                    default_auto_authorize: auto_authorize,
                    ..AuthorizationConfig::default()
                },
                bus.clone(),
            ),
            CallHistory::in_memory(),
            FailureEscalation::new(),
            bus,
        )
    }

    pub fn ctx() -> ExecutionContext {
        ExecutionContext::new(
            ConversationId::from("c1"),
            MessageId::from("m1"),
            CancellationToken::new(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    #[async_trait]
    impl ExecutionBackend for Fixed {
        async fn execute(&self, _request: &ToolCallRequest, _ctx: &ExecutionContext) -> ToolCallResult {
            ToolCallResult::success(self.0)
        }
    }

    #[tokio::test]
    async fn router_selects_by_server_sentinel() {
        let router = BackendRouter::new(Arc::new(Fixed("mcp")), Arc::new(Fixed("web")));
        let ctx = testing::ctx();
        let web = ToolCallRequest::new(WEB_SEARCH_SERVER, "search", Default::default());
        let other = ToolCallRequest::new("weather", "get", Default::default());
        assert_eq!(
            router.execute(&web, &ctx).await.result_preview.as_deref(),
            Some("web")
        );
        assert_eq!(
            router.execute(&other, &ctx).await.result_preview.as_deref(),
            Some("mcp")
        );
    }

    #[tokio::test]
    async fn bounded_maps_timeout_and_errors() {
        let cancel = CancellationToken::new();
        let slow = bounded(Duration::from_millis(10), &cancel, async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok("late".to_string())
        })
        .await;
        assert_eq!(slow, Err(ToolError::InvocationTimeout));
        let failed = bounded(Duration::from_secs(1), &cancel, async {
            Err(anyhow::anyhow!("boom"))
        })
        .await;
        assert_eq!(failed, Err(ToolError::InvocationFailed("boom".to_string())));
    }
}
