use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use conduit_types::ToolSchema;

pub mod hints;
pub mod web;

pub use web::{SearchProvider, SearchResult, WebSearchService, WebSearchSettings};

#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub output: String,
    pub metadata: Value,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;
    async fn execute(&self, args: &Map<String, Value>) -> anyhow::Result<ToolOutput>;
    async fn execute_with_cancel(
        &self,
        args: &Map<String, Value>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ToolOutput> {
        tokio::select! {
            result = self.execute(args) => result,
            _ = cancel.cancelled() => anyhow::bail!("cancelled"),
        }
    }
}

/// Tools served in-process under the `web_search` server name.
#[derive(Clone)]
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl ToolRegistry {
    pub fn empty() -> Self {
        Self {
            tools: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn native(settings: WebSearchSettings) -> Self {
        let mut map: HashMap<String, Arc<dyn Tool>> = HashMap::new();
        map.insert(
            web::SEARCH_TOOL.to_string(),
            Arc::new(WebSearchTool {
                settings: settings.clone(),
            }),
        );
        map.insert(web::FETCH_TOOL.to_string(), Arc::new(WebFetchTool { settings }));
        Self {
            tools: Arc::new(RwLock::new(map)),
        }
    }

    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.schema().name;
        self.tools.write().await.insert(name, tool);
    }

    pub async fn list(&self) -> Vec<ToolSchema> {
        let mut schemas = self
            .tools
            .read()
            .await
            .values()
            .map(|t| t.schema())
            .collect::<Vec<_>>();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    pub async fn execute_with_cancel(
        &self,
        name: &str,
        args: &Map<String, Value>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ToolOutput> {
        let Some(tool) = self.get(name).await else {
            anyhow::bail!("unknown tool: {name}");
        };
        tool.execute_with_cancel(args, cancel).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSchemaValidationError {
    pub tool_name: String,
    pub path: String,
    pub reason: String,
}

impl std::fmt::Display for ToolSchemaValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid tool schema `{}` at `{}`: {}",
            self.tool_name, self.path, self.reason
        )
    }
}

impl std::error::Error for ToolSchemaValidationError {}

/// Rejects schemas that strict providers refuse, such as arrays without `items`.
pub fn validate_tool_schemas(schemas: &[ToolSchema]) -> Result<(), ToolSchemaValidationError> {
    for schema in schemas {
        validate_schema_node(&schema.name, "$", &schema.input_schema)?;
    }
    Ok(())
}

fn validate_schema_node(
    tool_name: &str,
    path: &str,
    value: &Value,
) -> Result<(), ToolSchemaValidationError> {
    let Some(obj) = value.as_object() else {
        if let Some(arr) = value.as_array() {
            for (idx, item) in arr.iter().enumerate() {
                validate_schema_node(tool_name, &format!("{path}[{idx}]"), item)?;
            }
        }
        return Ok(());
    };

    if obj.get("type").and_then(|t| t.as_str()) == Some("array") && !obj.contains_key("items") {
        return Err(ToolSchemaValidationError {
            tool_name: tool_name.to_string(),
            path: path.to_string(),
            reason: "array schema missing items".to_string(),
        });
    }

    if let Some(items) = obj.get("items") {
        validate_schema_node(tool_name, &format!("{path}.items"), items)?;
    }
    if let Some(props) = obj.get("properties").and_then(|v| v.as_object()) {
        for (key, child) in props {
            validate_schema_node(tool_name, &format!("{path}.properties.{key}"), child)?;
        }
    }
    for combinator in ["oneOf", "anyOf", "allOf"] {
        if let Some(children) = obj.get(combinator).and_then(|v| v.as_array()) {
            for (idx, child) in children.iter().enumerate() {
                validate_schema_node(tool_name, &format!("{path}.{combinator}[{idx}]"), child)?;
            }
        }
    }

    Ok(())
}

fn str_arg<'a>(args: &'a Map<String, Value>, key: &str) -> &'a str {
    args.get(key).and_then(Value::as_str).unwrap_or("").trim()
}

struct WebSearchTool {
    settings: WebSearchSettings,
}

#[async_trait]
impl Tool for WebSearchTool {
    fn schema(&self) -> ToolSchema {
        web::search_schema()
    }

    async fn execute(&self, args: &Map<String, Value>) -> anyhow::Result<ToolOutput> {
        let query = str_arg(args, "query");
        if query.is_empty() {
            anyhow::bail!("query is required");
        }
        let service = WebSearchService::from_settings(&self.settings)?;
        let output = service.search(query).await?;
        tracing::debug!(provider = service.provider_name(), "web search finished");
        Ok(ToolOutput {
            output,
            metadata: json!({"query": query, "provider": self.settings.provider}),
        })
    }
}

struct WebFetchTool {
    settings: WebSearchSettings,
}

#[async_trait]
impl Tool for WebFetchTool {
    fn schema(&self) -> ToolSchema {
        web::fetch_schema()
    }

    async fn execute(&self, args: &Map<String, Value>) -> anyhow::Result<ToolOutput> {
        let url = str_arg(args, "url");
        if url.is_empty() {
            anyhow::bail!("url is required");
        }
        let client = web::fetch_client(&self.settings);
        let output = web::fetch_markdown(
            &client,
            url,
            self.settings.fetch_max_content_chars,
            self.settings.fetch_max_links,
        )
        .await?;
        Ok(ToolOutput {
            metadata: json!({"url": url, "chars": output.chars().count()}),
            output,
        })
    }
}
