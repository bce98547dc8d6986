use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Server name routed to the built-in web search/fetch backend.
pub const WEB_SEARCH_SERVER: &str = "web_search";
pub const RESULT_PREVIEW_LIMIT: usize = 12_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema", alias = "inputSchema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    Value::Object(Map::new())
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// A tool instruction recovered from model text, before it is bound to a UI card.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParsedToolCall {
    pub server: String,
    pub tool: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl ParsedToolCall {
    pub fn fingerprint(&self) -> String {
        call_fingerprint(&self.server, &self.tool, &self.args)
    }

    pub fn into_request(self) -> ToolCallRequest {
        ToolCallRequest::new(self.server, self.tool, self.args)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRequest {
    pub server: String,
    pub tool: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(rename = "cardId")]
    pub card_id: String,
}

impl ToolCallRequest {
    pub fn new(server: impl Into<String>, tool: impl Into<String>, args: Map<String, Value>) -> Self {
        Self {
            server: server.into(),
            tool: tool.into(),
            args,
            card_id: Uuid::new_v4().to_string(),
        }
    }

    /// Identity of the call independent of its card: `server:tool:<canonical args>`.
    pub fn fingerprint(&self) -> String {
        call_fingerprint(&self.server, &self.tool, &self.args)
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.server, self.tool)
    }
}

pub fn call_fingerprint(server: &str, tool: &str, args: &Map<String, Value>) -> String {
    format!(
        "{}:{}:{}",
        server,
        tool,
        canonical_json(&Value::Object(args.clone()))
    )
}

/// Serializes with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys = map.keys().collect::<Vec<_>>();
            keys.sort();
            let body = keys
                .into_iter()
                .map(|key| {
                    format!(
                        "{}:{}",
                        Value::String(key.clone()),
                        canonical_json(&map[key])
                    )
                })
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{body}}}")
        }
        Value::Array(items) => {
            let body = items.iter().map(canonical_json).collect::<Vec<_>>().join(",");
            format!("[{body}]")
        }
        other => other.to_string(),
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("server({server}) does not contain tool {tool}; use one of: {available}")]
    ToolNotFound {
        server: String,
        tool: String,
        available: String,
    },

    #[error("user rejected authorization")]
    AuthorizationDenied,

    #[error("failed to connect to {server}: {reason}")]
    ConnectionFailed { server: String, reason: String },

    #[error("timeout")]
    InvocationTimeout,

    #[error("{0}")]
    InvocationFailed(String),

    #[error("web search credentials not configured for provider `{provider}`; switch provider or add credentials")]
    CredentialsMissing { provider: String },

    #[error("{argument} is required")]
    MissingRequiredArgument { argument: String },

    #[error("tool call limit reached ({max} follow-up rounds)")]
    RecursionLimitExceeded { max: u32 },
}

impl ToolError {
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::ToolNotFound { .. } => "TOOL_NOT_FOUND",
            ToolError::AuthorizationDenied => "AUTHORIZATION_DENIED",
            ToolError::ConnectionFailed { .. } => "CONNECTION_FAILED",
            ToolError::InvocationTimeout => "TIMEOUT",
            ToolError::InvocationFailed(_) => "CALL_TOOL_FAILED",
            ToolError::CredentialsMissing { .. } => "WEB_SEARCH_CREDENTIALS_MISSING",
            ToolError::MissingRequiredArgument { .. } => "MISSING_REQUIRED_ARGUMENT",
            ToolError::RecursionLimitExceeded { .. } => "RECURSION_LIMIT_EXCEEDED",
        }
    }

    /// Only the recursion limit ends the tool loop; everything else is fed back to the model.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ToolError::RecursionLimitExceeded { .. })
    }
}

/// Uniform outcome of one tool call. Always produced, including on denial and timeout.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_stage: Option<u32>,
    #[serde(default)]
    pub cached: bool,
}

impl ToolCallResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            ok: true,
            result_preview: Some(truncate_preview(&output.into())),
            ..Self::default()
        }
    }

    pub fn failure(error: &ToolError) -> Self {
        Self {
            ok: false,
            error_message: Some(error.to_string()),
            error_code: Some(error.code().to_string()),
            ..Self::default()
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        let hint = hint.into();
        if !hint.trim().is_empty() {
            self.schema_hint = Some(hint);
        }
        self
    }

    pub fn with_stage(mut self, stage: u32) -> Self {
        self.fail_stage = Some(stage);
        self
    }

    pub fn replayed(mut self) -> Self {
        self.cached = true;
        self
    }

    /// Text handed back to the model: the preview on success, the error and hint otherwise.
    pub fn payload_text(&self) -> String {
        if self.ok {
            return self.result_preview.clone().unwrap_or_default();
        }
        let mut out = self
            .error_message
            .clone()
            .unwrap_or_else(|| "tool call failed".to_string());
        if let Some(hint) = self.schema_hint.as_deref() {
            out.push_str("\n\n");
            out.push_str(hint);
        }
        out
    }
}

pub fn truncate_preview(text: &str) -> String {
    if text.chars().count() <= RESULT_PREVIEW_LIMIT {
        return text.to_string();
    }
    text.chars().take(RESULT_PREVIEW_LIMIT).collect()
}
