use std::collections::HashMap;
use std::sync::Arc;
use std::{pin::Pin, str};

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use conduit_types::{ModelInfo, ProviderInfo};

pub mod classifier;
pub mod extract;
pub mod thinking;

pub use classifier::TokenClassifier;
pub use extract::{clean_instructions, extract, ExtractOutcome};
pub use thinking::{strategy_for, ThinkingStrategy};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// One increment from a model transport: optional reasoning text, optional
/// answer text, and whether the stream has ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelDelta {
    pub thinking: Option<String>,
    pub content: Option<String>,
    pub done: bool,
}

impl ModelDelta {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn thinking(text: impl Into<String>) -> Self {
        Self {
            thinking: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn done() -> Self {
        Self {
            done: true,
            ..Self::default()
        }
    }
}

pub type ModelStream = Pin<Box<dyn Stream<Item = anyhow::Result<ModelDelta>> + Send>>;

#[async_trait]
pub trait Provider: Send + Sync {
    fn info(&self) -> ProviderInfo;
    async fn complete(&self, prompt: &str, model_override: Option<&str>) -> anyhow::Result<String>;
    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        model_override: Option<&str>,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ModelStream> {
        let prompt = messages
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        let response = self.complete(&prompt, model_override).await?;
        let stream = futures::stream::iter(vec![
            Ok(ModelDelta::content(response)),
            Ok(ModelDelta::done()),
        ]);
        Ok(Box::pin(stream))
    }
}

#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Arc<RwLock<Vec<Arc<dyn Provider>>>>,
    default_provider: Arc<RwLock<Option<String>>>,
}

impl ProviderRegistry {
    pub fn new(config: AppConfig) -> Self {
        let providers = build_providers(&config);
        Self::from_providers(providers, config.default_provider)
    }

    pub fn from_providers(providers: Vec<Arc<dyn Provider>>, default_provider: Option<String>) -> Self {
        Self {
            providers: Arc::new(RwLock::new(providers)),
            default_provider: Arc::new(RwLock::new(default_provider)),
        }
    }

    pub async fn reload(&self, config: AppConfig) {
        let rebuilt = build_providers(&config);
        *self.providers.write().await = rebuilt;
        *self.default_provider.write().await = config.default_provider;
    }

    pub async fn list(&self) -> Vec<ProviderInfo> {
        self.providers
            .read()
            .await
            .iter()
            .map(|p| p.info())
            .collect()
    }

    pub async fn stream_for_provider(
        &self,
        provider_id: Option<&str>,
        model_id: Option<&str>,
        messages: Vec<ChatMessage>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ModelStream> {
        let provider = self.select_provider(provider_id).await?;
        provider.stream(messages, model_id, cancel).await
    }

    /// Resolves the provider and the model id a request would actually use.
    pub async fn resolve_model(
        &self,
        provider_id: Option<&str>,
        model_id: Option<&str>,
    ) -> anyhow::Result<(String, String)> {
        let provider = self.select_provider(provider_id).await?;
        let info = provider.info();
        let model = model_id
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .or_else(|| info.models.first().map(|m| m.id.clone()))
            .unwrap_or_default();
        Ok((info.id, model))
    }

    pub async fn select_provider(
        &self,
        provider_id: Option<&str>,
    ) -> anyhow::Result<Arc<dyn Provider>> {
        let providers = self.providers.read().await;
        let available = providers.iter().map(|p| p.info().id).collect::<Vec<_>>();

        if let Some(id) = provider_id {
            if let Some(provider) = providers.iter().find(|p| p.info().id == id) {
                return Ok(provider.clone());
            }
            anyhow::bail!(
                "provider `{}` is not configured. configured providers: {}",
                id,
                available.join(", ")
            );
        };

        let configured_default = self.default_provider.read().await.clone();
        if let Some(default_id) = configured_default {
            if let Some(provider) = providers.iter().find(|p| p.info().id == default_id) {
                return Ok(provider.clone());
            }
        };

        let Some(provider) = providers.first() else {
            anyhow::bail!("No provider configured.");
        };
        Ok(provider.clone())
    }
}

/// Provider ids accepted by [`build_providers`], with base URL and default model.
pub const OPENAI_COMPATIBLE_PROVIDERS: &[(&str, &str, &str, &str, bool)] = &[
    ("ollama", "Ollama", "http://127.0.0.1:11434/v1", "llama3.1:8b", false),
    ("openai", "OpenAI", "https://api.openai.com/v1", "gpt-4o-mini", true),
    ("openrouter", "OpenRouter", "https://openrouter.ai/api/v1", "openai/gpt-4o-mini", true),
    ("deepseek", "DeepSeek", "https://api.deepseek.com/v1", "deepseek-chat", true),
    ("groq", "Groq", "https://api.groq.com/openai/v1", "llama-3.1-8b-instant", true),
    ("mistral", "Mistral", "https://api.mistral.ai/v1", "mistral-small-latest", true),
    ("together", "Together", "https://api.together.xyz/v1", "meta-llama/Llama-3.1-8B-Instruct-Turbo", true),
];

fn build_providers(config: &AppConfig) -> Vec<Arc<dyn Provider>> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();

    for (id, name, default_url, default_model, use_api_key) in OPENAI_COMPATIBLE_PROVIDERS {
        add_openai_provider(
            config,
            &mut providers,
            id,
            name,
            default_url,
            default_model,
            *use_api_key,
        );
    }

    if providers.is_empty() {
        providers.push(Arc::new(LocalEchoProvider));
    }

    providers
}

fn add_openai_provider(
    config: &AppConfig,
    providers: &mut Vec<Arc<dyn Provider>>,
    id: &str,
    name: &str,
    default_url: &str,
    default_model: &str,
    use_api_key: bool,
) {
    let Some(entry) = config.providers.get(id) else {
        return;
    };
    providers.push(Arc::new(OpenAICompatibleProvider {
        id: id.to_string(),
        name: name.to_string(),
        base_url: normalize_base(entry.url.as_deref().unwrap_or(default_url)),
        api_key: if use_api_key {
            entry
                .api_key
                .as_deref()
                .filter(|key| !is_placeholder_api_key(key))
                .map(|key| key.to_string())
                .or_else(|| env_api_key_for_provider(id))
        } else {
            None
        },
        default_model: entry
            .default_model
            .clone()
            .unwrap_or_else(|| default_model.to_string()),
        client: Client::new(),
    }));
}

fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("x")
        || trimmed.eq_ignore_ascii_case("placeholder")
}

pub fn provider_api_key_env(id: &str) -> Option<&'static str> {
    match id {
        "openai" => Some("OPENAI_API_KEY"),
        "openrouter" => Some("OPENROUTER_API_KEY"),
        "deepseek" => Some("DEEPSEEK_API_KEY"),
        "groq" => Some("GROQ_API_KEY"),
        "mistral" => Some("MISTRAL_API_KEY"),
        "together" => Some("TOGETHER_API_KEY"),
        _ => None,
    }
}

fn env_api_key_for_provider(id: &str) -> Option<String> {
    let env_name = provider_api_key_env(id)?;
    std::env::var(env_name)
        .ok()
        .filter(|v| !v.trim().is_empty())
}

struct LocalEchoProvider;

#[async_trait]
impl Provider for LocalEchoProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "local".to_string(),
            name: "Local Echo".to_string(),
            models: vec![ModelInfo {
                id: "echo-1".to_string(),
                provider_id: "local".to_string(),
                display_name: "Echo Model".to_string(),
            }],
        }
    }

    async fn complete(
        &self,
        prompt: &str,
        _model_override: Option<&str>,
    ) -> anyhow::Result<String> {
        let last_line = prompt.lines().last().unwrap_or(prompt);
        Ok(format!("Echo: {last_line}"))
    }
}

struct OpenAICompatibleProvider {
    id: String,
    name: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    client: Client,
}

impl OpenAICompatibleProvider {
    fn model<'a>(&'a self, model_override: Option<&'a str>) -> &'a str {
        model_override
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.default_model.as_str())
    }

    fn request(&self, body: &Value) -> reqwest::RequestBuilder {
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self.client.post(url).json(body);
        if self.id == "openrouter" {
            req = req.header("X-Title", "Conduit");
        }
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }
        req
    }
}

#[async_trait]
impl Provider for OpenAICompatibleProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            models: vec![ModelInfo {
                id: self.default_model.clone(),
                provider_id: self.id.clone(),
                display_name: self.default_model.clone(),
            }],
        }
    }

    async fn complete(&self, prompt: &str, model_override: Option<&str>) -> anyhow::Result<String> {
        let model = self.model(model_override);
        let response = self
            .request(&json!({
                "model": model,
                "messages": [{"role":"user","content": prompt}],
                "stream": false,
            }))
            .send()
            .await?;
        let status = response.status();
        let value: Value = response.json().await?;

        if !status.is_success() {
            let detail = extract_openai_error(&value)
                .unwrap_or_else(|| format!("provider request failed with status {}", status));
            anyhow::bail!(detail);
        }
        if let Some(detail) = extract_openai_error(&value) {
            anyhow::bail!(detail);
        }
        if let Some(text) = value
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
        {
            return Ok(text.to_string());
        }

        let body_preview = truncate_for_error(&value.to_string(), 500);
        anyhow::bail!(
            "provider returned no completion content for model `{}` (response: {})",
            model,
            body_preview
        );
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        model_override: Option<&str>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ModelStream> {
        let model = self.model(model_override);
        let wire_messages = messages
            .into_iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect::<Vec<_>>();
        let body = json!({
            "model": model,
            "messages": wire_messages,
            "stream": true,
        });

        let resp = self.request(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let key_hint = provider_api_key_env(&self.id).unwrap_or("provider API key");
            if status.as_u16() == 401 {
                anyhow::bail!(
                    "provider authentication failed ({}) for `{}`. Verify the API key (set `{}`) and retry.",
                    status,
                    self.id,
                    key_hint
                );
            }
            anyhow::bail!(
                "provider stream request failed with status {}: {}",
                status,
                truncate_for_error(&text, 500)
            );
        }

        let mut bytes = resp.bytes_stream();
        let stream = try_stream! {
            let mut buffer = String::new();
            let mut finished = false;
            while let Some(chunk) = bytes.next().await {
                if cancel.is_cancelled() {
                    break;
                }

                let chunk = chunk?;
                buffer.push_str(str::from_utf8(&chunk).unwrap_or_default());

                while let Some(pos) = buffer.find("\n\n") {
                    let frame = buffer[..pos].to_string();
                    buffer = buffer[pos + 2..].to_string();
                    for line in frame.lines() {
                        let Some(payload) = line.strip_prefix("data:").map(str::trim) else {
                            continue;
                        };
                        if payload == "[DONE]" {
                            finished = true;
                            continue;
                        }
                        let Ok(value) = serde_json::from_str::<Value>(payload) else {
                            continue;
                        };
                        if let Some(detail) = extract_openai_error(&value) {
                            Err(anyhow::anyhow!(detail))?;
                        }
                        if let Some(delta) = delta_from_sse(&value) {
                            yield delta;
                        }
                    }
                }
                if finished {
                    break;
                }
            }
            yield ModelDelta::done();
        };

        Ok(Box::pin(stream))
    }
}

/// Maps one OpenAI-style SSE payload to a delta. Reasoning arrives as
/// `reasoning_content` (DeepSeek), `reasoning` or `thinking` (Ollama).
fn delta_from_sse(value: &Value) -> Option<ModelDelta> {
    let delta = value.pointer("/choices/0/delta")?;
    let thinking = ["reasoning_content", "reasoning", "thinking"]
        .iter()
        .find_map(|key| delta.get(*key).and_then(Value::as_str))
        .filter(|t| !t.is_empty())
        .map(str::to_string);
    let content = delta
        .get("content")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string);
    if thinking.is_none() && content.is_none() {
        return None;
    }
    Some(ModelDelta {
        thinking,
        content,
        done: false,
    })
}

fn normalize_base(input: &str) -> String {
    input.trim_end_matches('/').to_string()
}

fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.chars().count() <= max_len {
        return input.to_string();
    }
    let mut out = input.chars().take(max_len).collect::<String>();
    out.push_str("...");
    out
}

fn extract_openai_error(value: &Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message").or(Some(v)))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}
