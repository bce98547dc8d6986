use std::time::Duration;

use async_trait::async_trait;

use conduit_runtime::{ConnectionError, ToolCatalogCache};
use conduit_types::{ToolCallRequest, ToolCallResult, ToolError};

use super::{bounded, CallGuards, ExecutionBackend, ExecutionContext, DEFAULT_TOOL_TIMEOUT};

/// Generic executor for MCP servers: catalog check, authorization, replay,
/// connect, then a bounded `tools/call`. The catalog check runs after
/// authorization when nothing is cached for the server.
#[derive(Clone)]
pub struct McpBackend {
    catalog: ToolCatalogCache,
    guards: CallGuards,
    timeout: Duration,
}

impl McpBackend {
    pub fn new(catalog: ToolCatalogCache, guards: CallGuards) -> Self {
        Self::with_timeout(catalog, guards, DEFAULT_TOOL_TIMEOUT)
    }

    pub fn with_timeout(catalog: ToolCatalogCache, guards: CallGuards, timeout: Duration) -> Self {
        Self {
            catalog,
            guards,
            timeout,
        }
    }
}

#[async_trait]
impl ExecutionBackend for McpBackend {
    async fn execute(&self, request: &ToolCallRequest, ctx: &ExecutionContext) -> ToolCallResult {
        // Without a cached catalog, a live listing would start the server, so
        // ask for approval first.
        let (schema, tools, authorized) =
            match self.catalog.find_cached(&request.server, &request.tool).await {
                Some((schema, tools)) => (schema, tools, false),
                None => {
                    if !self.guards.authorize(request, ctx).await {
                        return self
                            .guards
                            .fail(request, ctx, ToolError::AuthorizationDenied, None, &[])
                            .await;
                    }
                    let (schema, tools) =
                        self.catalog.find_tool(&request.server, &request.tool).await;
                    (schema, tools, true)
                }
            };

        // An empty catalog means listing failed; let the call itself decide.
        if schema.is_none() && !tools.is_empty() {
            let available = tools
                .iter()
                .map(|t| t.name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            let error = ToolError::ToolNotFound {
                server: request.server.clone(),
                tool: request.tool.clone(),
                available,
            };
            return self.guards.fail(request, ctx, error, None, &tools).await;
        }

        // Match the catalog's spelling of the tool name.
        let mut request = request.clone();
        if let Some(found) = schema.as_ref() {
            request.tool = found.name.clone();
        }

        if !authorized && !self.guards.authorize(&request, ctx).await {
            return self
                .guards
                .fail(&request, ctx, ToolError::AuthorizationDenied, None, &[])
                .await;
        }

        if let Some(replayed) = self.guards.replay(&request).await {
            return replayed;
        }

        let connections = self.catalog.connections();
        if let Err(err) = connections.ensure_connected(&request.server).await {
            let reason = match &err {
                ConnectionError::Failed { reason, .. } => reason.clone(),
                other => other.to_string(),
            };
            let error = ToolError::ConnectionFailed {
                server: request.server.clone(),
                reason,
            };
            return self.guards.fail(&request, ctx, error, schema.as_ref(), &tools).await;
        }

        let transport = connections.transport();
        let outcome = bounded(
            self.timeout,
            &ctx.cancel,
            transport.call_tool(&request.server, &request.tool, &request.args),
        )
        .await;
        match outcome {
            Ok(output) => self.guards.succeed(&request, ctx, output).await,
            Err(error) => {
                self.guards
                    .fail(&request, ctx, error, schema.as_ref(), &tools)
                    .await
            }
        }
    }
}
