use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use conduit_providers::ProviderRegistry;
use conduit_runtime::{ConnectionManager, McpRegistry, MentionWarmer, ToolCatalogCache};
use conduit_types::WEB_SEARCH_SERVER;

use crate::authorization::AuthorizationGate;
use crate::backends::{BackendRouter, CallGuards, McpBackend, WebBackend};
use crate::call_history::CallHistory;
use crate::config::{AppConfig, ConfigStore};
use crate::dispatch::{MessageDispatcher, MessageStatusBoard};
use crate::event_bus::EventBus;
use crate::failure::FailureEscalation;
use crate::orchestrator::ToolCallOrchestrator;

pub const CATALOG_FILE: &str = "tool_catalog.json";
pub const CALL_HISTORY_FILE: &str = "call_history.json";

/// Long-lived services of one engine process.
#[derive(Clone)]
pub struct RuntimeState {
    pub state_dir: PathBuf,
    pub config: ConfigStore,
    pub event_bus: EventBus,
    pub providers: ProviderRegistry,
    pub mcp: McpRegistry,
    pub catalog: ToolCatalogCache,
    pub warmer: MentionWarmer,
    pub gate: AuthorizationGate,
    pub history: CallHistory,
    pub failures: FailureEscalation,
    pub web: WebBackend,
    pub backends: BackendRouter,
    pub statuses: MessageStatusBoard,
    pub orchestrator: ToolCallOrchestrator,
}

impl RuntimeState {
    pub async fn build(
        state_dir: &Path,
        config: ConfigStore,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> anyhow::Result<Self> {
        let started = Instant::now();
        tokio::fs::create_dir_all(state_dir).await?;
        let app = config.get().await;

        let event_bus = EventBus::new();
        let providers = ProviderRegistry::new(app.clone().into());
        let mcp = match std::env::var("CONDUIT_MCP_REGISTRY") {
            Ok(path) if !path.trim().is_empty() => McpRegistry::new_with_state_file(PathBuf::from(path)),
            _ => McpRegistry::new_with_state_file(state_dir.join("mcp_servers.json")),
        };
        let catalog = ToolCatalogCache::with_limits(
            ConnectionManager::new(Arc::new(mcp.clone())),
            Some(state_dir.join(CATALOG_FILE)),
            app.catalog.ttl(),
            app.catalog.list_timeout(),
        );
        let warmer = MentionWarmer::new(catalog.clone());
        let gate = AuthorizationGate::new(app.authorization.clone(), event_bus.clone());
        let history = CallHistory::new(
            app.call_history.clone(),
            Some(state_dir.join(CALL_HISTORY_FILE)),
        );
        let failures = FailureEscalation::new();
        let guards = CallGuards::new(
            gate.clone(),
            history.clone(),
            failures.clone(),
            event_bus.clone(),
        );
        let mcp_backend =
            McpBackend::with_timeout(catalog.clone(), guards.clone(), app.tool_timeout());
        let web = WebBackend::new(app.web_search.clone(), guards).with_timeout(app.tool_timeout());
        let backends = BackendRouter::new(Arc::new(mcp_backend), Arc::new(web.clone()));
        let statuses = MessageStatusBoard::new();
        let orchestrator = ToolCallOrchestrator::new(
            providers.clone(),
            Arc::new(backends.clone()),
            gate.clone(),
            failures.clone(),
            catalog.clone(),
            dispatcher,
            statuses.clone(),
            event_bus.clone(),
            app,
        );

        let state = Self {
            state_dir: state_dir.to_path_buf(),
            config,
            event_bus,
            providers,
            mcp,
            catalog,
            warmer,
            gate,
            history,
            failures,
            web,
            backends,
            statuses,
            orchestrator,
        };
        state.refresh_enabled_servers().await;
        tracing::info!(
            state_dir = %state_dir.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "runtime built"
        );
        Ok(state)
    }

    /// Enabled MCP servers plus the native web server, sorted by name.
    pub async fn enabled_servers(&self) -> Vec<String> {
        let mut names = self
            .mcp
            .list()
            .await
            .into_values()
            .filter(|s| s.enabled)
            .map(|s| s.name)
            .collect::<Vec<_>>();
        names.sort();
        names.push(WEB_SEARCH_SERVER.to_string());
        names
    }

    pub async fn refresh_enabled_servers(&self) {
        let servers = self.enabled_servers().await;
        self.orchestrator.set_enabled_servers(servers).await;
    }

    /// Re-reads configuration into every component that caches it.
    pub async fn reload_config(&self) -> AppConfig {
        let app = self.config.get().await;
        self.providers.reload(app.clone().into()).await;
        self.gate.set_config(app.authorization.clone()).await;
        self.web.set_settings(app.web_search.clone()).await;
        self.orchestrator.set_config(app.clone()).await;
        app
    }

    /// Connects every enabled MCP server, logging failures.
    pub async fn reconnect_all(&self) -> usize {
        let names = self.mcp.list().await.into_keys().collect::<Vec<_>>();
        let outcomes = self
            .catalog
            .connections()
            .reconnect_all_enabled(&names)
            .await;
        outcomes.iter().filter(|(_, o)| o.is_ok()).count()
    }
}
