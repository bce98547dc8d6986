use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::RwLock;

use conduit_tools::hints;
use conduit_tools::web::{fetch_schema, search_schema, FETCH_TOOL, SEARCH_TOOL};
use conduit_tools::{ToolRegistry, WebSearchSettings};
use conduit_types::{ConversationId, ToolCallRequest, ToolCallResult, ToolError, ToolSchema};

use super::{bounded, CallGuards, ExecutionBackend, ExecutionContext, DEFAULT_TOOL_TIMEOUT};

/// Native `web_search` server: `search` and `fetch`.
#[derive(Clone)]
pub struct WebBackend {
    settings: Arc<RwLock<WebSearchSettings>>,
    overrides: Arc<RwLock<HashMap<ConversationId, String>>>,
    registry: Option<ToolRegistry>,
    guards: CallGuards,
    timeout: Duration,
}

impl WebBackend {
    pub fn new(settings: WebSearchSettings, guards: CallGuards) -> Self {
        Self {
            settings: Arc::new(RwLock::new(settings)),
            overrides: Arc::new(RwLock::new(HashMap::new())),
            registry: None,
            guards,
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    /// Serves calls from a fixed registry instead of one built from settings.
    pub fn with_registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn set_settings(&self, settings: WebSearchSettings) {
        *self.settings.write().await = settings;
    }

    /// Per-conversation provider choice; `None` falls back to the configured one.
    pub async fn set_conversation_provider(&self, conversation: &ConversationId, provider: Option<String>) {
        let mut overrides = self.overrides.write().await;
        match provider {
            Some(name) => {
                overrides.insert(conversation.clone(), name);
            }
            None => {
                overrides.remove(conversation);
            }
        }
    }

    pub async fn effective_settings(&self, conversation: &ConversationId) -> WebSearchSettings {
        let base = self.settings.read().await.clone();
        match self.overrides.read().await.get(conversation) {
            Some(provider) => base.with_provider(provider.clone()),
            None => base,
        }
    }

    fn schemas() -> [ToolSchema; 2] {
        [search_schema(), fetch_schema()]
    }
}

#[async_trait]
impl ExecutionBackend for WebBackend {
    async fn execute(&self, request: &ToolCallRequest, ctx: &ExecutionContext) -> ToolCallResult {
        let catalog = Self::schemas();
        let Some(schema) = catalog
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(&request.tool))
            .cloned()
        else {
            let error = ToolError::ToolNotFound {
                server: request.server.clone(),
                tool: request.tool.clone(),
                available: format!("{SEARCH_TOOL}, {FETCH_TOOL}"),
            };
            return self.guards.fail(request, ctx, error, None, &catalog).await;
        };
        let mut request = request.clone();
        request.tool = schema.name.clone();

        if !self.guards.authorize(&request, ctx).await {
            return self
                .guards
                .fail(&request, ctx, ToolError::AuthorizationDenied, None, &[])
                .await;
        }

        if let Some(replayed) = self.guards.replay(&request).await {
            return replayed;
        }

        let settings = self.effective_settings(&ctx.conversation_id).await;
        if settings.missing_credentials() {
            let error = ToolError::CredentialsMissing {
                provider: settings.provider.clone(),
            };
            tracing::warn!(provider = %settings.provider, "web search credentials missing");
            self.guards.event_bus.emit(
                "notification",
                json!({
                    "level": "error",
                    "title": "Web search unavailable",
                    "description": error.to_string(),
                    "messageId": ctx.message_id,
                }),
            );
            return self.guards.fail(&request, ctx, error, None, &[]).await;
        }

        if let Some(argument) = hints::missing_required(&schema, &request.args).into_iter().next() {
            let error = ToolError::MissingRequiredArgument { argument };
            return self
                .guards
                .fail(&request, ctx, error, Some(&schema), &catalog)
                .await;
        }

        let registry = self
            .registry
            .clone()
            .unwrap_or_else(|| ToolRegistry::native(settings));
        let outcome = bounded(self.timeout, &ctx.cancel, async {
            let output = registry
                .execute_with_cancel(&request.tool, &request.args, ctx.cancel.clone())
                .await?;
            Ok::<_, anyhow::Error>(output.output)
        })
        .await;
        match outcome {
            Ok(output) => self.guards.succeed(&request, ctx, output).await,
            Err(error) => {
                self.guards
                    .fail(&request, ctx, error, Some(&schema), &catalog)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::{Map, Value};

    use conduit_tools::{Tool, ToolOutput};
    use conduit_types::WEB_SEARCH_SERVER;

    use super::*;
    use crate::backends::testing::{ctx, guards};

    struct CannedSearch {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for CannedSearch {
        fn schema(&self) -> ToolSchema {
            search_schema()
        }

        async fn execute(&self, args: &Map<String, Value>) -> anyhow::Result<ToolOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let query = args.get("query").and_then(Value::as_str).unwrap_or_default();
            Ok(ToolOutput {
                output: format!("1. Result for {query}"),
                metadata: json!({}),
            })
        }
    }

    fn search(args: Value) -> ToolCallRequest {
        ToolCallRequest::new(
            WEB_SEARCH_SERVER,
            "search",
            args.as_object().cloned().unwrap_or_default(),
        )
    }

    async fn canned_backend() -> (WebBackend, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = ToolRegistry::empty();
        registry
            .register(Arc::new(CannedSearch {
                calls: calls.clone(),
            }))
            .await;
        let backend = WebBackend::new(WebSearchSettings::default(), guards(true)).with_registry(registry);
        (backend, calls)
    }

    #[tokio::test]
    async fn missing_credentials_never_reach_the_network() {
        let bus_guards = guards(true);
        let mut notifications = bus_guards.event_bus.subscribe();
        let backend = WebBackend::new(WebSearchSettings::default().with_provider("google"), bus_guards);
        let result = backend.execute(&search(json!({"query": "rust"})), &ctx()).await;
        assert_eq!(
            result.error_code.as_deref(),
            Some("WEB_SEARCH_CREDENTIALS_MISSING")
        );
        let event = notifications.recv().await.expect("notification");
        assert_eq!(event.event_type, "notification");
    }

    #[tokio::test]
    async fn conversation_override_picks_provider() {
        let backend = WebBackend::new(WebSearchSettings::default(), guards(true));
        let conversation = ConversationId::from("c1");
        backend
            .set_conversation_provider(&conversation, Some("bing".to_string()))
            .await;
        assert_eq!(backend.effective_settings(&conversation).await.provider, "bing");
        let result = backend.execute(&search(json!({"query": "rust"})), &ctx()).await;
        assert_eq!(
            result.error_code.as_deref(),
            Some("WEB_SEARCH_CREDENTIALS_MISSING")
        );
        backend.set_conversation_provider(&conversation, None).await;
        assert_eq!(
            backend.effective_settings(&conversation).await.provider,
            "duckduckgo"
        );
    }

    #[tokio::test]
    async fn missing_query_returns_schema_hint() {
        let (backend, calls) = canned_backend().await;
        let result = backend.execute(&search(json!({"query": " "})), &ctx()).await;
        assert_eq!(result.error_code.as_deref(), Some("MISSING_REQUIRED_ARGUMENT"));
        assert_eq!(result.error_message.as_deref(), Some("query is required"));
        assert!(result.schema_hint.unwrap_or_default().contains("query"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn search_runs_once_then_replays() {
        let (backend, calls) = canned_backend().await;
        let first = backend.execute(&search(json!({"query": "rust"})), &ctx()).await;
        assert!(first.ok);
        assert_eq!(first.result_preview.as_deref(), Some("1. Result for rust"));
        let second = backend.execute(&search(json!({"query": "rust"})), &ctx()).await;
        assert!(second.cached);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_web_tool_is_not_found() {
        let (backend, _) = canned_backend().await;
        let request = ToolCallRequest::new(WEB_SEARCH_SERVER, "browse", Map::new());
        let result = backend.execute(&request, &ctx()).await;
        assert_eq!(result.error_code.as_deref(), Some("TOOL_NOT_FOUND"));
    }
}
