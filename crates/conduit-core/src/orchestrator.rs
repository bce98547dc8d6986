use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use conduit_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use conduit_providers::{ChatMessage, ProviderRegistry, TokenClassifier};
use conduit_runtime::ToolCatalogCache;
use conduit_types::{
    ConversationId, MessageAction, MessageId, MessageStatus, StreamEvent, ToolCallRequest,
    ToolCallResult, ToolError,
};

use crate::authorization::AuthorizationGate;
use crate::backends::{ExecutionBackend, ExecutionContext};
use crate::config::{AppConfig, RecursionDepth};
use crate::dispatch::{MessageDispatcher, MessageStatusBoard};
use crate::event_bus::EventBus;
use crate::failure::FailureEscalation;
use crate::followup::{fallback_answer, followup_history, nudge_history, ToolExchange};
use crate::prompt::tool_context;

const COMPONENT: &str = "orchestrator";

type SharedRun = Shared<BoxFuture<'static, ToolCallResult>>;

/// One assistant message being produced for a user question.
#[derive(Debug, Clone)]
pub struct MessageRun {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub question: String,
    /// Prior turns, without the question itself.
    pub history: Vec<ChatMessage>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub cancel: CancellationToken,
}

impl MessageRun {
    pub fn new(
        conversation_id: ConversationId,
        message_id: MessageId,
        question: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id,
            message_id,
            question: question.into(),
            history: Vec::new(),
            provider: None,
            model: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn with_model(mut self, provider: Option<String>, model: Option<String>) -> Self {
        self.provider = provider;
        self.model = model;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn context(&self) -> ExecutionContext {
        ExecutionContext::new(
            self.conversation_id.clone(),
            self.message_id.clone(),
            self.cancel.clone(),
        )
    }
}

struct TurnOutcome {
    visible: String,
    calls: Vec<ToolCallRequest>,
}

/// Drives model turns, executes the tool calls they contain and feeds the
/// results back until the model answers in plain text or the follow-up
/// depth is exhausted.
#[derive(Clone)]
pub struct ToolCallOrchestrator {
    providers: ProviderRegistry,
    backends: Arc<dyn ExecutionBackend>,
    gate: AuthorizationGate,
    failures: FailureEscalation,
    catalog: ToolCatalogCache,
    dispatcher: Arc<dyn MessageDispatcher>,
    statuses: MessageStatusBoard,
    event_bus: EventBus,
    config: Arc<RwLock<AppConfig>>,
    enabled_servers: Arc<RwLock<Vec<String>>>,
    recursion: Arc<RwLock<HashMap<ConversationId, u32>>>,
    runs: Arc<Mutex<HashMap<String, SharedRun>>>,
}

impl ToolCallOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        providers: ProviderRegistry,
        backends: Arc<dyn ExecutionBackend>,
        gate: AuthorizationGate,
        failures: FailureEscalation,
        catalog: ToolCatalogCache,
        dispatcher: Arc<dyn MessageDispatcher>,
        statuses: MessageStatusBoard,
        event_bus: EventBus,
        config: AppConfig,
    ) -> Self {
        Self {
            providers,
            backends,
            gate,
            failures,
            catalog,
            dispatcher,
            statuses,
            event_bus,
            config: Arc::new(RwLock::new(config)),
            enabled_servers: Arc::new(RwLock::new(Vec::new())),
            recursion: Arc::new(RwLock::new(HashMap::new())),
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn set_config(&self, config: AppConfig) {
        *self.config.write().await = config;
    }

    /// Servers advertised to the model on the first turn.
    pub async fn set_enabled_servers(&self, servers: Vec<String>) {
        *self.enabled_servers.write().await = servers;
    }

    pub fn statuses(&self) -> &MessageStatusBoard {
        &self.statuses
    }

    pub async fn recursion_count(&self, conversation: &ConversationId) -> u32 {
        self.recursion
            .read()
            .await
            .get(conversation)
            .copied()
            .unwrap_or(0)
    }

    /// Answers a fresh user question, running any tool calls the model makes.
    pub async fn run_message(&self, run: MessageRun) -> MessageStatus {
        self.failures.reset_conversation(&run.conversation_id).await;
        self.reset_recursion(&run.conversation_id).await;
        self.statuses
            .set(&run.message_id, MessageStatus::Streaming)
            .await;
        self.statuses
            .attach(&run.message_id, run.cancel.clone())
            .await;

        let enabled = self.enabled_servers.read().await.clone();
        let mut messages = tool_context(&run.question, &enabled, &self.catalog).await;
        messages.extend(run.history.iter().cloned());
        messages.push(ChatMessage::user(run.question.clone()));

        let outcome = match self.stream_turn(&run, messages).await {
            Ok(outcome) => outcome,
            Err(err) => return self.stream_failed(&run, err).await,
        };
        if self.aborted(&run).await {
            return self.abandoned(&run).await;
        }
        if outcome.calls.is_empty() {
            return self.complete(&run, MessageStatus::Completed).await;
        }
        let mut history = run.history.clone();
        if !outcome.visible.is_empty() {
            history.push(ChatMessage::assistant(outcome.visible));
        }
        self.tool_loop(&run, history, outcome.calls).await
    }

    /// Entry point for a call detected outside [`Self::run_message`].
    pub async fn handle_tool_call(&self, run: &MessageRun, request: ToolCallRequest) -> MessageStatus {
        self.detected(run, &request);
        self.tool_loop(run, run.history.clone(), vec![request]).await
    }

    /// Executes one call and reports its result, or returns `None` when the
    /// message already ended.
    pub async fn execute_tool(&self, run: &MessageRun, request: ToolCallRequest) -> Option<ToolExchange> {
        self.statuses
            .attach(&run.message_id, run.cancel.clone())
            .await;
        if self.aborted(run).await {
            tracing::info!(message_id = %run.message_id, tool = %request.qualified_name(), "message ended before tool execution");
            return None;
        }
        if !self.gate.should_auto_authorize(&request.server).await {
            emit_event(
                Level::INFO,
                ProcessKind::Engine,
                tool_event("tool.authorization.pending", run, &request).status("pending"),
            );
        }
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            tool_event("tool.execute.start", run, &request).status("running"),
        );

        let result = self.execute_coalesced(run, &request).await;
        if self.aborted(run).await {
            tracing::info!(message_id = %run.message_id, tool = %request.qualified_name(), "message ended during tool execution");
            return None;
        }

        if result.ok {
            let status = if result.cached { "cached" } else { "ok" };
            emit_event(
                Level::INFO,
                ProcessKind::Engine,
                tool_event("tool.execute.finish", run, &request).status(status),
            );
        } else {
            let detail = result.error_message.clone().unwrap_or_default();
            emit_event(
                Level::WARN,
                ProcessKind::Engine,
                tool_event("tool.execute.error", run, &request)
                    .status("failed")
                    .error_code(result.error_code.as_deref().unwrap_or("CALL_TOOL_FAILED"))
                    .detail(&detail),
            );
        }
        self.dispatcher.dispatch(
            &run.message_id,
            MessageAction::ToolResult {
                card_id: request.card_id.clone(),
                server: request.server.clone(),
                tool: request.tool.clone(),
                result: result.clone(),
            },
        );
        Some(ToolExchange::new(request, result))
    }

    async fn tool_loop(
        &self,
        run: &MessageRun,
        mut history: Vec<ChatMessage>,
        mut calls: Vec<ToolCallRequest>,
    ) -> MessageStatus {
        loop {
            let mut exchanges = Vec::with_capacity(calls.len());
            for request in calls.drain(..) {
                match self.execute_tool(run, request).await {
                    Some(exchange) => exchanges.push(exchange),
                    None => return self.abandoned(run).await,
                }
            }
            if self.aborted(run).await {
                return self.abandoned(run).await;
            }

            let depth = {
                let config = self.config.read().await;
                config.recursion_depth_for(exchanges.last().map(|e| e.request.server.as_str()))
            };
            let round = match self.enter_followup(&run.conversation_id, depth).await {
                Ok(round) => round,
                Err(limit) => {
                    self.notify_limit(run, &limit);
                    return self.complete(run, MessageStatus::Completed).await;
                }
            };
            let round_text = format!("round {round} of {depth}");
            emit_event(
                Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent::new("followup.start", COMPONENT)
                    .message(run.conversation_id.as_str(), run.message_id.as_str())
                    .detail(&round_text),
            );

            let messages = followup_history(&history, &run.question, &exchanges);
            let outcome = match self.stream_turn(run, messages.clone()).await {
                Ok(outcome) => outcome,
                Err(err) => return self.stream_failed(run, err).await,
            };
            if self.aborted(run).await {
                return self.abandoned(run).await;
            }
            if !outcome.calls.is_empty() {
                history = carry_forward(messages, outcome.visible);
                calls = outcome.calls;
                continue;
            }
            if !outcome.visible.is_empty() {
                self.reset_recursion(&run.conversation_id).await;
                return self.complete(run, MessageStatus::Completed).await;
            }

            // Stalled after the result: one stricter retry, then a fallback.
            if self.aborted(run).await {
                return self.abandoned(run).await;
            }
            emit_event(
                Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent::new("followup.nudge", COMPONENT)
                    .message(run.conversation_id.as_str(), run.message_id.as_str()),
            );
            let nudge = nudge_history(&messages, &run.question);
            let outcome = match self.stream_turn(run, nudge.clone()).await {
                Ok(outcome) => outcome,
                Err(err) => return self.stream_failed(run, err).await,
            };
            if self.aborted(run).await {
                return self.abandoned(run).await;
            }
            if !outcome.calls.is_empty() {
                history = carry_forward(nudge, outcome.visible);
                calls = outcome.calls;
                continue;
            }
            if outcome.visible.is_empty() {
                self.dispatcher.dispatch(
                    &run.message_id,
                    MessageAction::TokenAppend {
                        content: fallback_answer(&exchanges),
                    },
                );
            }
            self.reset_recursion(&run.conversation_id).await;
            return self.complete(run, MessageStatus::Completed).await;
        }
    }

    async fn stream_turn(
        &self,
        run: &MessageRun,
        messages: Vec<ChatMessage>,
    ) -> anyhow::Result<TurnOutcome> {
        let (provider_id, model_id) = self
            .providers
            .resolve_model(run.provider.as_deref(), run.model.as_deref())
            .await?;
        let model = (!model_id.is_empty()).then_some(model_id.as_str());
        let mut classifier = TokenClassifier::for_model(&provider_id, &model_id);
        let mut stream = self
            .providers
            .stream_for_provider(Some(&provider_id), model, messages, run.cancel.clone())
            .await?;

        let mut calls = Vec::new();
        loop {
            let next = tokio::select! {
                _ = run.cancel.cancelled() => None,
                item = stream.next() => item,
            };
            let Some(item) = next else {
                break;
            };
            let events = classifier.push(&item?);
            self.forward(run, events, &mut calls);
            if classifier.is_finished() {
                break;
            }
        }
        if !classifier.is_finished() {
            let events = classifier.finish();
            self.forward(run, events, &mut calls);
        }
        Ok(TurnOutcome {
            visible: classifier.visible_text().trim().to_string(),
            calls,
        })
    }

    fn forward(&self, run: &MessageRun, events: Vec<StreamEvent>, calls: &mut Vec<ToolCallRequest>) {
        for event in events {
            let action = match event {
                StreamEvent::ThinkingStart { mode } => MessageAction::ThinkStart { mode },
                StreamEvent::ThinkingToken { content } => MessageAction::ThinkAppend { content },
                StreamEvent::ThinkingEnd => MessageAction::ThinkEnd,
                StreamEvent::ContentToken { content } => MessageAction::TokenAppend { content },
                StreamEvent::ToolCall {
                    parsed: Some(call), ..
                } => {
                    let request = call.into_request();
                    self.detected(run, &request);
                    calls.push(request);
                    continue;
                }
                StreamEvent::ToolCall { raw, parsed: None } => {
                    tracing::debug!(
                        message_id = %run.message_id,
                        raw = %redact_text(&raw),
                        "ignoring unparseable tool instruction"
                    );
                    continue;
                }
                StreamEvent::StreamComplete => continue,
            };
            self.dispatcher.dispatch(&run.message_id, action);
        }
    }

    fn detected(&self, run: &MessageRun, request: &ToolCallRequest) {
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            tool_event("tool.detected", run, request),
        );
        self.dispatcher.dispatch(
            &run.message_id,
            MessageAction::ToolHit {
                card_id: request.card_id.clone(),
                server: request.server.clone(),
                tool: request.tool.clone(),
                args: Value::Object(request.args.clone()),
            },
        );
    }

    /// Identical calls for the same message share one execution.
    async fn execute_coalesced(&self, run: &MessageRun, request: &ToolCallRequest) -> ToolCallResult {
        let key = format!("{}|{}", run.message_id, request.fingerprint());
        let shared = {
            let mut runs = self.runs.lock().await;
            match runs.get(&key) {
                Some(existing) => {
                    tracing::debug!(message_id = %run.message_id, tool = %request.qualified_name(), "joining in-flight tool call");
                    existing.clone()
                }
                None => {
                    let backends = self.backends.clone();
                    let owned = request.clone();
                    let ctx = run.context();
                    let run_future: SharedRun =
                        async move { backends.execute(&owned, &ctx).await }
                            .boxed()
                            .shared();
                    runs.insert(key.clone(), run_future.clone());
                    run_future
                }
            }
        };
        let result = shared.clone().await;
        self.release_run(&key, &shared).await;
        result
    }

    /// A newer run may already occupy the key; only `finished` is removed.
    async fn release_run(&self, key: &str, finished: &SharedRun) {
        let mut runs = self.runs.lock().await;
        if runs.get(key).is_some_and(|stored| stored.ptr_eq(finished)) {
            runs.remove(key);
        }
    }

    async fn enter_followup(
        &self,
        conversation: &ConversationId,
        depth: RecursionDepth,
    ) -> Result<u32, ToolError> {
        let mut counters = self.recursion.write().await;
        let count = counters.entry(conversation.clone()).or_insert(0);
        if let Some(max) = depth.limit() {
            if *count >= max {
                *count = 0;
                return Err(ToolError::RecursionLimitExceeded { max });
            }
        }
        *count += 1;
        Ok(*count)
    }

    async fn reset_recursion(&self, conversation: &ConversationId) {
        self.recursion.write().await.remove(conversation);
    }

    fn notify_limit(&self, run: &MessageRun, limit: &ToolError) {
        let detail = limit.to_string();
        emit_event(
            Level::WARN,
            ProcessKind::Engine,
            ObservabilityEvent::new("followup.limit", COMPONENT)
                .message(run.conversation_id.as_str(), run.message_id.as_str())
                .error_code(limit.code())
                .detail(&detail),
        );
        self.dispatcher.dispatch(
            &run.message_id,
            MessageAction::TokenAppend {
                content: format!("\n\n_{detail}. Ask again to continue._"),
            },
        );
    }

    async fn aborted(&self, run: &MessageRun) -> bool {
        run.cancel.is_cancelled() || self.statuses.is_terminal(&run.message_id).await
    }

    async fn abandoned(&self, run: &MessageRun) -> MessageStatus {
        let status = self
            .statuses
            .get(&run.message_id)
            .await
            .filter(|s| s.is_terminal())
            .unwrap_or(MessageStatus::Stopped);
        tracing::info!(message_id = %run.message_id, ?status, "tool loop abandoned");
        status
    }

    async fn complete(&self, run: &MessageRun, status: MessageStatus) -> MessageStatus {
        self.statuses.set(&run.message_id, status).await;
        self.dispatcher
            .dispatch(&run.message_id, MessageAction::StreamEnd { status });
        self.event_bus.emit(
            "message.status",
            json!({
                "conversationId": run.conversation_id,
                "messageId": run.message_id,
                "status": status,
            }),
        );
        status
    }

    async fn stream_failed(&self, run: &MessageRun, err: anyhow::Error) -> MessageStatus {
        let error_text = err.to_string();
        let detail = truncate_text(&error_text, 500);
        emit_event(
            Level::ERROR,
            ProcessKind::Engine,
            ObservabilityEvent::new("model.stream.error", COMPONENT)
                .message(run.conversation_id.as_str(), run.message_id.as_str())
                .status("failed")
                .error_code(provider_error_code(&error_text))
                .detail(&detail),
        );
        self.reset_recursion(&run.conversation_id).await;
        self.complete(run, MessageStatus::Error).await
    }
}

fn tool_event<'a>(
    event: &'a str,
    run: &'a MessageRun,
    request: &'a ToolCallRequest,
) -> ObservabilityEvent<'a> {
    ObservabilityEvent::new(event, COMPONENT)
        .message(run.conversation_id.as_str(), run.message_id.as_str())
        .tool(&request.server, &request.tool)
        .correlation(&request.card_id)
}

/// Keeps a round's turns (minus its system prompt) for the next follow-up.
fn carry_forward(messages: Vec<ChatMessage>, visible: String) -> Vec<ChatMessage> {
    let mut history = messages
        .into_iter()
        .filter(|m| m.role != "system")
        .collect::<Vec<_>>();
    if !visible.is_empty() {
        history.push(ChatMessage::assistant(visible));
    }
    history
}

fn truncate_text(input: &str, max_len: usize) -> String {
    if input.chars().count() <= max_len {
        return input.to_string();
    }
    let mut out = input.chars().take(max_len).collect::<String>();
    out.push_str("...<truncated>");
    out
}

fn provider_error_code(error_text: &str) -> &'static str {
    let lower = error_text.to_lowercase();
    if lower.contains("rate limit") || lower.contains("too many requests") || lower.contains("429")
    {
        return "RATE_LIMIT_EXCEEDED";
    }
    if lower.contains("context length")
        || lower.contains("max tokens")
        || lower.contains("token limit")
    {
        return "CONTEXT_LENGTH_EXCEEDED";
    }
    if lower.contains("unauthorized")
        || lower.contains("authentication")
        || lower.contains("401")
        || lower.contains("403")
    {
        return "AUTHENTICATION_ERROR";
    }
    if lower.contains("timeout") || lower.contains("timed out") {
        return "TIMEOUT";
    }
    if lower.contains("server error")
        || lower.contains("500")
        || lower.contains("502")
        || lower.contains("503")
        || lower.contains("504")
    {
        return "PROVIDER_SERVER_ERROR";
    }
    "PROVIDER_REQUEST_FAILED"
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc::UnboundedReceiver;

    use conduit_providers::{ModelDelta, ModelStream, Provider};
    use conduit_runtime::{ConnectionManager, McpServer, ToolTransport};
    use conduit_types::{ModelInfo, ProviderInfo, ToolSchema};

    use super::*;
    use crate::backends::{CallGuards, McpBackend, DEFAULT_TOOL_TIMEOUT};
    use crate::call_history::CallHistory;
    use crate::config::AuthorizationConfig;
    use crate::dispatch::ChannelDispatcher;

    type Turn = Vec<anyhow::Result<ModelDelta>>;

    struct ScriptedProvider {
        turns: std::sync::Mutex<VecDeque<Turn>>,
        seen: std::sync::Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedProvider {
        fn new(turns: Vec<Turn>) -> Arc<Self> {
            Arc::new(Self {
                turns: std::sync::Mutex::new(turns.into()),
                seen: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<Vec<ChatMessage>> {
            self.seen.lock().expect("seen").clone()
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn info(&self) -> ProviderInfo {
            ProviderInfo {
                id: "scripted".to_string(),
                name: "Scripted".to_string(),
                models: vec![ModelInfo {
                    id: "script-1".to_string(),
                    provider_id: "scripted".to_string(),
                    display_name: "Script".to_string(),
                }],
            }
        }

        async fn complete(&self, _prompt: &str, _model_override: Option<&str>) -> anyhow::Result<String> {
            Ok(String::new())
        }

        async fn stream(
            &self,
            messages: Vec<ChatMessage>,
            _model_override: Option<&str>,
            _cancel: CancellationToken,
        ) -> anyhow::Result<ModelStream> {
            self.seen.lock().expect("seen").push(messages);
            let turn = self
                .turns
                .lock()
                .expect("turns")
                .pop_front()
                .unwrap_or_else(|| vec![Ok(ModelDelta::done())]);
            Ok(Box::pin(futures::stream::iter(turn)))
        }
    }

    struct RecordingBackend {
        cities: std::sync::Mutex<Vec<String>>,
        delay: Option<Duration>,
        reply: String,
    }

    impl RecordingBackend {
        fn replying(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                cities: std::sync::Mutex::new(Vec::new()),
                delay: None,
                reply: reply.to_string(),
            })
        }

        fn cities(&self) -> Vec<String> {
            self.cities.lock().expect("cities").clone()
        }
    }

    #[async_trait]
    impl ExecutionBackend for RecordingBackend {
        async fn execute(&self, request: &ToolCallRequest, _ctx: &ExecutionContext) -> ToolCallResult {
            let city = request
                .args
                .get("city")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            self.cities.lock().expect("cities").push(city);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            ToolCallResult::success(self.reply.clone())
        }
    }

    struct NoServers;

    #[async_trait]
    impl ToolTransport for NoServers {
        async fn server_config(&self, _name: &str) -> Option<McpServer> {
            None
        }
        async fn is_connected(&self, _name: &str) -> bool {
            false
        }
        async fn connect(&self, name: &str) -> anyhow::Result<()> {
            anyhow::bail!("no server {name}")
        }
        async fn disconnect(&self, _name: &str) -> bool {
            false
        }
        async fn list_tools(&self, _name: &str) -> anyhow::Result<Vec<ToolSchema>> {
            Ok(Vec::new())
        }
        async fn call_tool(
            &self,
            _server: &str,
            _tool: &str,
            _args: &serde_json::Map<String, Value>,
        ) -> anyhow::Result<String> {
            anyhow::bail!("no servers")
        }
    }

    /// One `weather` server with a `get` tool that answers after `delay`.
    #[derive(Default)]
    struct WeatherServer {
        connected: std::sync::Mutex<bool>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl ToolTransport for WeatherServer {
        async fn server_config(&self, name: &str) -> Option<McpServer> {
            (name == "weather").then(|| McpServer {
                name: name.to_string(),
                transport: "stdio:weather".to_string(),
                enabled: true,
                connected: false,
                pid: None,
                last_error: None,
                headers: Default::default(),
                tool_cache: Vec::new(),
                tools_fetched_at_ms: None,
            })
        }
        async fn is_connected(&self, _name: &str) -> bool {
            *self.connected.lock().expect("connected")
        }
        async fn connect(&self, _name: &str) -> anyhow::Result<()> {
            *self.connected.lock().expect("connected") = true;
            Ok(())
        }
        async fn disconnect(&self, _name: &str) -> bool {
            std::mem::take(&mut *self.connected.lock().expect("connected"))
        }
        async fn list_tools(&self, _name: &str) -> anyhow::Result<Vec<ToolSchema>> {
            Ok(vec![ToolSchema::new("get", "Current weather", json!({"type": "object"}))])
        }
        async fn call_tool(
            &self,
            _server: &str,
            _tool: &str,
            _args: &serde_json::Map<String, Value>,
        ) -> anyhow::Result<String> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok("sunny".to_string())
        }
    }

    fn gate(auto_authorize: bool, bus: &EventBus) -> AuthorizationGate {
        AuthorizationGate::new(
            AuthorizationConfig {
                default_auto_authorize: auto_authorize,
                ..AuthorizationConfig::default()
            },
            bus.clone(),
        )
    }

    fn weather_backend(
        server: WeatherServer,
        gate: &AuthorizationGate,
        bus: &EventBus,
        timeout: Duration,
    ) -> Arc<McpBackend> {
        let catalog = ToolCatalogCache::new(ConnectionManager::new(Arc::new(server)), None);
        let guards = CallGuards::new(
            gate.clone(),
            CallHistory::in_memory(),
            FailureEscalation::new(),
            bus.clone(),
        );
        Arc::new(McpBackend::with_timeout(catalog, guards, timeout))
    }

    fn weather_request(city: &str) -> ToolCallRequest {
        let args = json!({"city": city}).as_object().cloned().expect("object");
        ToolCallRequest::new("weather", "get", args)
    }

    struct Harness {
        orchestrator: ToolCallOrchestrator,
        provider: Arc<ScriptedProvider>,
        actions: UnboundedReceiver<(MessageId, MessageAction)>,
    }

    impl Harness {
        fn actions(&mut self) -> Vec<MessageAction> {
            let mut out = Vec::new();
            while let Ok((_, action)) = self.actions.try_recv() {
                out.push(action);
            }
            out
        }
    }

    fn harness(turns: Vec<Turn>, backend: Arc<RecordingBackend>) -> Harness {
        let bus = EventBus::new();
        let gate = gate(true, &bus);
        harness_with(turns, backend, gate, bus)
    }

    fn harness_with(
        turns: Vec<Turn>,
        backend: Arc<dyn ExecutionBackend>,
        gate: AuthorizationGate,
        bus: EventBus,
    ) -> Harness {
        let provider = ScriptedProvider::new(turns);
        let providers = ProviderRegistry::from_providers(vec![provider.clone() as Arc<dyn Provider>], None);
        let catalog = ToolCatalogCache::new(ConnectionManager::new(Arc::new(NoServers)), None);
        let (dispatcher, actions) = ChannelDispatcher::new();
        let orchestrator = ToolCallOrchestrator::new(
            providers,
            backend,
            gate,
            FailureEscalation::new(),
            catalog,
            Arc::new(dispatcher),
            MessageStatusBoard::new(),
            bus,
            AppConfig::default(),
        );
        Harness {
            orchestrator,
            provider,
            actions,
        }
    }

    fn say(text: &str) -> Turn {
        vec![Ok(ModelDelta::content(text)), Ok(ModelDelta::done())]
    }

    fn weather_call(city: &str) -> String {
        format!(
            "<use_mcp_tool><server_name>weather</server_name><tool_name>get</tool_name><arguments>{{\"city\":\"{city}\"}}</arguments></use_mcp_tool>"
        )
    }

    fn run() -> MessageRun {
        MessageRun::new(
            ConversationId::from("c1"),
            MessageId::from("m1"),
            "weather in Tokyo?",
        )
    }

    fn appended_text(actions: &[MessageAction]) -> String {
        actions
            .iter()
            .filter_map(|a| match a {
                MessageAction::TokenAppend { content } => Some(content.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn tool_result_feeds_a_followup_answer() {
        let backend = RecordingBackend::replying("sunny");
        let mut h = harness(
            vec![
                say(&format!("Let me check. {}", weather_call("Tokyo"))),
                say("It is sunny in Tokyo."),
            ],
            backend.clone(),
        );
        let status = h.orchestrator.run_message(run()).await;
        assert_eq!(status, MessageStatus::Completed);
        assert_eq!(backend.cities(), vec!["Tokyo".to_string()]);

        let actions = h.actions();
        let hit = actions
            .iter()
            .position(|a| matches!(a, MessageAction::ToolHit { .. }))
            .expect("tool hit");
        let result = actions
            .iter()
            .position(|a| matches!(a, MessageAction::ToolResult { .. }))
            .expect("tool result");
        assert!(hit < result);
        assert_eq!(
            actions.last(),
            Some(&MessageAction::StreamEnd {
                status: MessageStatus::Completed
            })
        );
        assert!(!appended_text(&actions).contains("use_mcp_tool"));

        let seen = h.provider.seen();
        assert_eq!(seen.len(), 2);
        let followup = seen[1].last().expect("result message");
        assert_eq!(followup.role, "user");
        assert!(followup.content.contains("weather.get -> sunny"));
        assert_eq!(h.orchestrator.recursion_count(&ConversationId::from("c1")).await, 0);
    }

    #[tokio::test]
    async fn identical_concurrent_calls_execute_once() {
        let backend = Arc::new(RecordingBackend {
            cities: std::sync::Mutex::new(Vec::new()),
            delay: Some(Duration::from_millis(50)),
            reply: "sunny".to_string(),
        });
        let h = harness(Vec::new(), backend.clone());
        let args = json!({"city": "Tokyo"}).as_object().cloned().expect("object");
        let first = ToolCallRequest::new("weather", "get", args.clone());
        let second = ToolCallRequest::new("weather", "get", args);
        assert_ne!(first.card_id, second.card_id);

        let run = run();
        let (a, b) = tokio::join!(
            h.orchestrator.execute_tool(&run, first),
            h.orchestrator.execute_tool(&run, second)
        );
        assert_eq!(backend.cities().len(), 1);
        assert!(a.expect("first").result.ok);
        assert!(b.expect("second").result.ok);
    }

    #[tokio::test]
    async fn recursion_limit_ends_loop_without_error() {
        let backend = RecordingBackend::replying("cloudy");
        let mut h = harness(
            vec![
                say(&weather_call("Tokyo")),
                say(&weather_call("Tokyo")),
                say(&weather_call("Tokyo")),
                say(&weather_call("Tokyo")),
            ],
            backend.clone(),
        );
        let status = h.orchestrator.run_message(run()).await;
        assert_eq!(status, MessageStatus::Completed);
        // First turn plus two follow-ups; the third result hits the limit.
        assert_eq!(h.provider.seen().len(), 3);
        assert_eq!(backend.cities().len(), 3);
        assert_eq!(h.orchestrator.recursion_count(&ConversationId::from("c1")).await, 0);
        let text = appended_text(&h.actions());
        assert!(text.contains("tool call limit reached (2 follow-up rounds)"));
    }

    #[tokio::test]
    async fn silent_followup_nudges_once_then_falls_back() {
        let backend = RecordingBackend::replying(r#"["a.txt","b.txt"]"#);
        let mut h = harness(
            vec![
                say(&weather_call("Tokyo")),
                say("<think>reading the listing</think>"),
                say("<think>still thinking</think>"),
            ],
            backend,
        );
        let status = h.orchestrator.run_message(run()).await;
        assert_eq!(status, MessageStatus::Completed);

        let seen = h.provider.seen();
        assert_eq!(seen.len(), 3);
        let nudge = seen[2].last().expect("nudge message");
        assert!(nudge.content.starts_with("Based on all tool results above"));

        let text = appended_text(&h.actions());
        assert!(text.contains("- a.txt"));
        assert!(text.contains("- b.txt"));
    }

    #[tokio::test]
    async fn stopped_message_never_executes() {
        let backend = RecordingBackend::replying("sunny");
        let h = harness(vec![say("unused")], backend.clone());
        let run = run();
        h.orchestrator
            .statuses()
            .set(&run.message_id, MessageStatus::Stopped)
            .await;
        let args = json!({"city": "Tokyo"}).as_object().cloned().expect("object");
        let status = h
            .orchestrator
            .handle_tool_call(&run, ToolCallRequest::new("weather", "get", args))
            .await;
        assert_eq!(status, MessageStatus::Stopped);
        assert!(backend.cities().is_empty());
        assert!(h.provider.seen().is_empty());
    }

    #[tokio::test]
    async fn stream_failure_marks_message_error() {
        let backend = RecordingBackend::replying("sunny");
        let mut h = harness(
            vec![vec![Err(anyhow::anyhow!("429 too many requests"))]],
            backend,
        );
        let run = run();
        let status = h.orchestrator.run_message(run.clone()).await;
        assert_eq!(status, MessageStatus::Error);
        assert_eq!(
            h.orchestrator.statuses().get(&run.message_id).await,
            Some(MessageStatus::Error)
        );
        assert_eq!(
            h.actions().last(),
            Some(&MessageAction::StreamEnd {
                status: MessageStatus::Error
            })
        );
        assert_eq!(provider_error_code("429 too many requests"), "RATE_LIMIT_EXCEEDED");
    }

    #[tokio::test]
    async fn calls_from_one_turn_share_one_followup() {
        let backend = RecordingBackend::replying("mild");
        let mut h = harness(
            vec![
                say(&format!("{}\n{}", weather_call("Tokyo"), weather_call("Paris"))),
                say("Both are mild."),
            ],
            backend.clone(),
        );
        let status = h.orchestrator.run_message(run()).await;
        assert_eq!(status, MessageStatus::Completed);
        assert_eq!(backend.cities(), vec!["Tokyo".to_string(), "Paris".to_string()]);

        let seen = h.provider.seen();
        assert_eq!(seen.len(), 2);
        let followup = &seen[1].last().expect("result message").content;
        assert!(followup.contains("[1] weather.get"));
        assert!(followup.contains("[2] weather.get"));
        let results = h
            .actions()
            .into_iter()
            .filter(|a| matches!(a, MessageAction::ToolResult { .. }))
            .count();
        assert_eq!(results, 2);
    }

    fn tool_results(actions: &[MessageAction]) -> Vec<ToolCallResult> {
        actions
            .iter()
            .filter_map(|a| match a {
                MessageAction::ToolResult { result, .. } => Some(result.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn stop_releases_a_call_waiting_for_approval() {
        let bus = EventBus::new();
        let gate = gate(false, &bus);
        let backend = weather_backend(WeatherServer::default(), &gate, &bus, DEFAULT_TOOL_TIMEOUT);
        let mut h = harness_with(Vec::new(), backend, gate.clone(), bus);
        let run = run();

        let orchestrator = h.orchestrator.clone();
        let task_run = run.clone();
        let task = tokio::spawn(async move {
            orchestrator
                .execute_tool(&task_run, weather_request("Tokyo"))
                .await
        });
        tokio::time::timeout(Duration::from_secs(2), async {
            while gate.pending().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("approval requested");

        h.orchestrator
            .statuses()
            .set(&run.message_id, MessageStatus::Stopped)
            .await;
        let outcome = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("released after stop")
            .expect("join");
        assert!(outcome.is_none());
        assert!(gate.pending().await.is_empty());
        assert!(tool_results(&h.actions()).is_empty());
    }

    #[tokio::test]
    async fn stop_during_execution_suppresses_the_result() {
        let backend = Arc::new(RecordingBackend {
            cities: std::sync::Mutex::new(Vec::new()),
            delay: Some(Duration::from_millis(100)),
            reply: "sunny".to_string(),
        });
        let mut h = harness(Vec::new(), backend.clone());
        let run = run();

        let orchestrator = h.orchestrator.clone();
        let task_run = run.clone();
        let task = tokio::spawn(async move {
            orchestrator
                .execute_tool(&task_run, weather_request("Tokyo"))
                .await
        });
        while backend.cities().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        h.orchestrator
            .statuses()
            .set(&run.message_id, MessageStatus::Stopped)
            .await;
        assert!(run.cancel.is_cancelled());

        assert!(task.await.expect("join").is_none());
        assert_eq!(backend.cities(), vec!["Tokyo".to_string()]);
        assert!(tool_results(&h.actions()).is_empty());
    }

    #[tokio::test]
    async fn tool_timeout_is_fed_back_as_a_failure() {
        let bus = EventBus::new();
        let gate = gate(true, &bus);
        let server = WeatherServer {
            delay: Some(Duration::from_millis(200)),
            ..WeatherServer::default()
        };
        let backend = weather_backend(server, &gate, &bus, Duration::from_millis(20));
        let mut h = harness_with(
            vec![
                say(&weather_call("Tokyo")),
                say("The weather service did not answer in time."),
            ],
            backend,
            gate,
            bus,
        );
        let status = h.orchestrator.run_message(run()).await;
        assert_eq!(status, MessageStatus::Completed);

        let results = tool_results(&h.actions());
        assert_eq!(results.len(), 1);
        assert!(!results[0].ok);
        assert_eq!(results[0].error_message.as_deref(), Some("timeout"));
        assert_eq!(results[0].fail_stage, Some(1));

        let seen = h.provider.seen();
        assert_eq!(seen.len(), 2);
        let followup = &seen[1].last().expect("result message").content;
        assert!(followup.contains("weather.get -> timeout"));
        assert!(followup.contains("The call failed. Analyze the error"));
    }

    #[tokio::test]
    async fn finished_run_leaves_newer_entry_in_place() {
        let h = harness(Vec::new(), RecordingBackend::replying("sunny"));
        let older: SharedRun = async { ToolCallResult::success("old") }.boxed().shared();
        let newer: SharedRun = async { ToolCallResult::success("new") }.boxed().shared();
        h.orchestrator
            .runs
            .lock()
            .await
            .insert("m1|key".to_string(), newer.clone());

        h.orchestrator.release_run("m1|key", &older).await;
        assert!(h.orchestrator.runs.lock().await.contains_key("m1|key"));
        h.orchestrator.release_run("m1|key", &newer).await;
        assert!(h.orchestrator.runs.lock().await.is_empty());
    }
}
