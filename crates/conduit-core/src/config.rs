use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use conduit_providers::{provider_api_key_env, OPENAI_COMPATIBLE_PROVIDERS};
use conduit_tools::WebSearchSettings;

pub const DEFAULT_RECURSION_DEPTH: u32 = 2;
pub const MAX_RECURSION_DEPTH: u32 = 15;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub default_model: Option<String>,
}

/// Follow-up rounds allowed after tool results: `2..=15` or unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecursionDepth {
    Limited(u32),
    Infinite,
}

impl RecursionDepth {
    pub fn limit(self) -> Option<u32> {
        match self {
            RecursionDepth::Limited(max) => Some(max),
            RecursionDepth::Infinite => None,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("infinite") {
            return Some(RecursionDepth::Infinite);
        }
        trimmed.parse::<u64>().ok().map(Self::clamped)
    }

    fn clamped(value: u64) -> Self {
        let bounded = value.clamp(DEFAULT_RECURSION_DEPTH as u64, MAX_RECURSION_DEPTH as u64);
        RecursionDepth::Limited(bounded as u32)
    }
}

impl Default for RecursionDepth {
    fn default() -> Self {
        RecursionDepth::Limited(DEFAULT_RECURSION_DEPTH)
    }
}

impl fmt::Display for RecursionDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecursionDepth::Limited(max) => write!(f, "{max}"),
            RecursionDepth::Infinite => f.write_str("infinite"),
        }
    }
}

impl Serialize for RecursionDepth {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RecursionDepth::Limited(max) => serializer.serialize_u32(*max),
            RecursionDepth::Infinite => serializer.serialize_str("infinite"),
        }
    }
}

impl<'de> Deserialize<'de> for RecursionDepth {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Number(value) => Ok(RecursionDepth::clamped(value)),
            Raw::Text(text) => RecursionDepth::parse(&text).ok_or_else(|| {
                serde::de::Error::custom(format!("invalid recursion depth `{text}`"))
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ServerAuthorization {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_authorize: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_recursion_depth: Option<RecursionDepth>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AuthorizationConfig {
    #[serde(default)]
    pub default_auto_authorize: bool,
    #[serde(default)]
    pub servers: HashMap<String, ServerAuthorization>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CatalogConfig {
    pub ttl_hours: u64,
    pub list_timeout_ms: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            ttl_hours: 24,
            list_timeout_ms: 1200,
        }
    }
}

impl CatalogConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_hours.max(1) * 60 * 60)
    }

    pub fn list_timeout(&self) -> Duration {
        Duration::from_millis(self.list_timeout_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CallHistoryConfig {
    pub duplicate_window_secs: u64,
    pub reuse_window_secs: u64,
    pub max_entries: usize,
    pub max_age_secs: u64,
}

impl Default for CallHistoryConfig {
    fn default() -> Self {
        Self {
            duplicate_window_secs: 60,
            reuse_window_secs: 10 * 60,
            max_entries: 100,
            max_age_secs: 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
    pub default_model: Option<String>,
    pub authorization: AuthorizationConfig,
    pub max_tool_recursion_depth: RecursionDepth,
    pub tool_timeout_ms: u64,
    pub web_search: WebSearchSettings,
    pub catalog: CatalogConfig,
    pub call_history: CallHistoryConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            providers: HashMap::new(),
            default_provider: None,
            default_model: None,
            authorization: AuthorizationConfig::default(),
            max_tool_recursion_depth: RecursionDepth::default(),
            tool_timeout_ms: 15_000,
            web_search: WebSearchSettings::default(),
            catalog: CatalogConfig::default(),
            call_history: CallHistoryConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms.max(1))
    }

    /// Server override first, then the global setting.
    pub fn recursion_depth_for(&self, server: Option<&str>) -> RecursionDepth {
        server
            .and_then(|name| self.authorization.servers.get(name))
            .and_then(|cfg| cfg.max_recursion_depth)
            .unwrap_or(self.max_tool_recursion_depth)
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    managed: Value,
    env: Value,
    runtime: Value,
    cli: Value,
}

/// Layered JSON configuration: global, project, managed, environment,
/// runtime patches and CLI overrides, merged in that order.
#[derive(Clone)]
pub struct ConfigStore {
    project_path: PathBuf,
    global_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let global_path = resolve_global_config_path().await?;
        Self::with_global_path(path, global_path, env_layer(), cli_overrides).await
    }

    async fn with_global_path(
        path: impl AsRef<Path>,
        global_path: PathBuf,
        env: Value,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let project_path = path.as_ref().to_path_buf();
        let managed_path = project_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("managed_config.json");

        let layers = ConfigLayers {
            global: read_json_file(&global_path).await,
            project: read_json_file(&project_path).await,
            managed: read_json_file(&managed_path).await,
            env,
            runtime: empty_object(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };

        Ok(Self {
            project_path,
            global_path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub async fn get(&self) -> AppConfig {
        let merged = self.get_effective_value().await;
        match serde_json::from_value(merged) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(error = %err, "invalid configuration, using defaults");
                AppConfig::default()
            }
        }
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.global);
        deep_merge(&mut merged, &layers.project);
        deep_merge(&mut merged, &layers.managed);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.runtime);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    pub async fn get_layers_value(&self) -> Value {
        let layers = self.layers.read().await;
        json!({
            "global": layers.global,
            "project": layers.project,
            "managed": layers.managed,
            "env": layers.env,
            "runtime": layers.runtime,
            "cli": layers.cli
        })
    }

    pub async fn patch_project(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.project, &patch);
        }
        self.save_project().await?;
        Ok(self.get_effective_value().await)
    }

    pub async fn patch_global(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.global, &patch);
        }
        self.save_global().await?;
        Ok(self.get_effective_value().await)
    }

    /// In-memory only; lost on restart.
    pub async fn patch_runtime(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.runtime, &patch);
        }
        Ok(self.get_effective_value().await)
    }

    async fn save_project(&self) -> anyhow::Result<()> {
        let snapshot = self.layers.read().await.project.clone();
        write_json_file(&self.project_path, &snapshot).await
    }

    async fn save_global(&self) -> anyhow::Result<()> {
        let snapshot = self.layers.read().await.global.clone();
        write_json_file(&self.global_path, &snapshot).await
    }
}

/// Turns `key.path=value` pairs into a JSON overlay. Values parse as JSON
/// when they can, otherwise they are kept as strings.
pub fn parse_cli_overrides(pairs: &[String]) -> anyhow::Result<Value> {
    let mut root = empty_object();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            anyhow::bail!("override `{pair}` must look like key=value");
        };
        let key = key.trim();
        if key.is_empty() {
            anyhow::bail!("override `{pair}` has an empty key");
        }
        let value = serde_json::from_str::<Value>(raw.trim())
            .unwrap_or_else(|_| Value::String(raw.trim().to_string()));
        let overlay = key
            .split('.')
            .rev()
            .fold(value, |inner, part| json!({ part: inner }));
        deep_merge(&mut root, &overlay);
    }
    Ok(root)
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn write_json_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let raw = serde_json::to_string_pretty(value)?;
    fs::write(path, raw).await?;
    Ok(())
}

async fn read_json_file(path: &Path) -> Value {
    let Ok(raw) = fs::read_to_string(path).await else {
        return empty_object();
    };
    serde_json::from_str::<Value>(&raw).unwrap_or_else(|err| {
        tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable config file");
        empty_object()
    })
}

async fn resolve_global_config_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("CONDUIT_GLOBAL_CONFIG") {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path.trim()));
        }
    }
    if let Some(config_dir) = dirs::config_dir() {
        return Ok(config_dir.join("conduit").join("config.json"));
    }
    Ok(PathBuf::from(".conduit/global_config.json"))
}

fn env_layer() -> Value {
    let mut root = empty_object();

    if let Some(provider) = env_value("CONDUIT_PROVIDER") {
        deep_merge(&mut root, &json!({ "default_provider": provider }));
    }
    if let Some(model) = env_value("CONDUIT_MODEL") {
        deep_merge(&mut root, &json!({ "default_model": model }));
    }
    if let Some(enabled) = env_value("CONDUIT_AUTO_AUTHORIZE").and_then(|v| parse_bool_like(&v)) {
        deep_merge(
            &mut root,
            &json!({ "authorization": { "default_auto_authorize": enabled } }),
        );
    }
    if let Some(depth) = env_value("CONDUIT_MAX_TOOL_DEPTH").and_then(|v| RecursionDepth::parse(&v)) {
        deep_merge(&mut root, &json!({ "max_tool_recursion_depth": depth }));
    }
    if let Some(provider) = env_value("CONDUIT_WEB_SEARCH_PROVIDER") {
        deep_merge(&mut root, &json!({ "web_search": { "provider": provider } }));
    }
    if let Some(key) = env_value("CONDUIT_WEB_SEARCH_API_KEY") {
        deep_merge(&mut root, &json!({ "web_search": { "api_key": key } }));
    }

    for (id, _, url, model, _) in OPENAI_COMPATIBLE_PROVIDERS {
        let Some(key_env) = provider_api_key_env(id) else {
            continue;
        };
        if let Some(api_key) = env_value(key_env) {
            add_provider_env(&mut root, id, Some(&api_key), url, model);
        }
    }
    if let Some(ollama_url) = env_value("OLLAMA_URL") {
        add_provider_env(&mut root, "ollama", None, &ollama_url, "llama3.1:8b");
    }

    root
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn add_provider_env(root: &mut Value, provider: &str, api_key: Option<&str>, url: &str, model: &str) {
    deep_merge(
        root,
        &json!({
            "providers": {
                provider: {
                    "api_key": api_key,
                    "url": url,
                    "default_model": model
                }
            }
        }),
    );
}

fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

impl From<ProviderConfig> for conduit_providers::ProviderConfig {
    fn from(value: ProviderConfig) -> Self {
        Self {
            api_key: value.api_key,
            url: value.url,
            default_model: value.default_model,
        }
    }
}

impl From<AppConfig> for conduit_providers::AppConfig {
    fn from(value: AppConfig) -> Self {
        Self {
            providers: value
                .providers
                .into_iter()
                .map(|(k, v)| (k, v.into()))
                .collect(),
            default_provider: value.default_provider,
        }
    }
}
