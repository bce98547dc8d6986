//! Native web search and page fetch.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use conduit_types::{ToolError, ToolSchema};

pub const SEARCH_TOOL: &str = "search";
pub const FETCH_TOOL: &str = "fetch";
pub const SEARCH_PROVIDERS: [&str; 5] = ["duckduckgo", "custom_scrape", "google", "bing", "ollama"];

const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

static RESULT_LINK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<a[^>]*class="result__a"[^>]*href="([^"]+)"[^>]*>(.*?)</a>"#)
        .expect("valid result link regex")
});
static RESULT_SNIPPET_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<a[^>]*class="result__snippet"[^>]*>(.*?)</a>"#)
        .expect("valid result snippet regex")
});
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("valid tag regex"));
static HREF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r##"href="(https?://[^"#\s]+)""##).expect("valid href regex"));

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebSearchSettings {
    pub provider: String,
    pub api_key: Option<String>,
    pub cse_id: Option<String>,
    pub max_results: usize,
    pub fetch_max_content_chars: usize,
    pub fetch_max_links: usize,
    pub timeout_secs: u64,
}

impl Default for WebSearchSettings {
    fn default() -> Self {
        Self {
            provider: "duckduckgo".to_string(),
            api_key: None,
            cse_id: None,
            max_results: 5,
            fetch_max_content_chars: 20_000,
            fetch_max_links: 0,
            timeout_secs: 15,
        }
    }
}

impl WebSearchSettings {
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    fn key(&self) -> Option<&str> {
        self.api_key.as_deref().map(str::trim).filter(|k| !k.is_empty())
    }

    fn cse(&self) -> Option<&str> {
        self.cse_id.as_deref().map(str::trim).filter(|k| !k.is_empty())
    }

    /// True when the selected provider needs a key (or Google CSE id) that is not set.
    pub fn missing_credentials(&self) -> bool {
        match self.provider.as_str() {
            "google" => self.key().is_none() || self.cse().is_none(),
            "bing" | "ollama" => self.key().is_none(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn search(&self, query: &str, max_results: usize) -> anyhow::Result<Vec<SearchResult>>;
}

fn http_client(timeout_secs: u64) -> Client {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .user_agent(USER_AGENT)
        .build()
        .unwrap_or_else(|_| Client::new())
}

fn str_field(item: &Value, key: &str) -> String {
    item.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

struct DuckDuckGoProvider {
    client: Client,
}

#[async_trait]
impl SearchProvider for DuckDuckGoProvider {
    fn name(&self) -> &str {
        "DuckDuckGo"
    }

    async fn search(&self, query: &str, max_results: usize) -> anyhow::Result<Vec<SearchResult>> {
        let data: Value = self
            .client
            .get("https://api.duckduckgo.com/")
            .query(&[("q", query), ("format", "json"), ("no_html", "1")])
            .send()
            .await?
            .json()
            .await?;

        let mut results = Vec::new();
        let abstract_text = str_field(&data, "AbstractText");
        if !abstract_text.is_empty() {
            let heading = str_field(&data, "Heading");
            results.push(SearchResult {
                title: if heading.is_empty() { "Result".to_string() } else { heading },
                url: str_field(&data, "AbstractURL"),
                snippet: abstract_text,
            });
        }
        if let Some(topics) = data.get("RelatedTopics").and_then(Value::as_array) {
            for topic in topics {
                if results.len() >= max_results {
                    break;
                }
                let text = str_field(topic, "Text");
                if text.is_empty() {
                    continue;
                }
                results.push(SearchResult {
                    title: text.chars().take(80).collect(),
                    url: str_field(topic, "FirstURL"),
                    snippet: text,
                });
            }
        }
        Ok(results)
    }
}

/// Scrapes the DuckDuckGo HTML results page.
struct CustomScrapeProvider {
    client: Client,
}

#[async_trait]
impl SearchProvider for CustomScrapeProvider {
    fn name(&self) -> &str {
        "DuckDuckGo HTML"
    }

    async fn search(&self, query: &str, max_results: usize) -> anyhow::Result<Vec<SearchResult>> {
        let body = self
            .client
            .get("https://html.duckduckgo.com/html/")
            .query(&[("q", query)])
            .send()
            .await?
            .text()
            .await?;
        Ok(parse_scraped_results(&body, max_results))
    }
}

fn parse_scraped_results(body: &str, max_results: usize) -> Vec<SearchResult> {
    let snippets = RESULT_SNIPPET_RE
        .captures_iter(body)
        .map(|caps| strip_tags(&caps[1]))
        .collect::<Vec<_>>();
    RESULT_LINK_RE
        .captures_iter(body)
        .enumerate()
        .map(|(idx, caps)| SearchResult {
            title: strip_tags(&caps[2]),
            url: resolve_redirect(&caps[1]),
            snippet: snippets.get(idx).cloned().unwrap_or_default(),
        })
        .filter(|r| !r.title.is_empty() && !r.url.is_empty())
        .take(max_results)
        .collect()
}

/// DuckDuckGo wraps result links as `//duckduckgo.com/l/?uddg=<target>`.
fn resolve_redirect(href: &str) -> String {
    let href = decode_entities(href);
    let absolute = if href.starts_with("//") {
        format!("https:{href}")
    } else {
        href.clone()
    };
    Url::parse(&absolute)
        .ok()
        .and_then(|url| {
            let target = url
                .query_pairs()
                .find(|(key, _)| key == "uddg")
                .map(|(_, target)| target.into_owned());
            target
        })
        .unwrap_or(href)
}

fn strip_tags(html: &str) -> String {
    decode_entities(TAG_RE.replace_all(html, "").trim())
}

fn decode_entities(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
}

struct GoogleProvider {
    client: Client,
    api_key: String,
    cse_id: String,
}

#[async_trait]
impl SearchProvider for GoogleProvider {
    fn name(&self) -> &str {
        "Google"
    }

    async fn search(&self, query: &str, max_results: usize) -> anyhow::Result<Vec<SearchResult>> {
        let data: Value = self
            .client
            .get("https://www.googleapis.com/customsearch/v1")
            .query(&[("key", self.api_key.as_str()), ("cx", self.cse_id.as_str()), ("q", query)])
            .send()
            .await?
            .json()
            .await?;
        let items = data
            .get("items")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow!("no items found in Google response"))?;
        Ok(items
            .iter()
            .map(|item| SearchResult {
                title: str_field(item, "title"),
                url: str_field(item, "link"),
                snippet: str_field(item, "snippet"),
            })
            .filter(|r| !r.url.is_empty())
            .take(max_results)
            .collect())
    }
}

struct BingProvider {
    client: Client,
    api_key: String,
}

#[async_trait]
impl SearchProvider for BingProvider {
    fn name(&self) -> &str {
        "Bing"
    }

    async fn search(&self, query: &str, max_results: usize) -> anyhow::Result<Vec<SearchResult>> {
        let data: Value = self
            .client
            .get("https://api.bing.microsoft.com/v7.0/search")
            .header("Ocp-Apim-Subscription-Key", &self.api_key)
            .query(&[("q", query)])
            .send()
            .await?
            .json()
            .await?;
        let items = data
            .pointer("/webPages/value")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow!("no webPages found in Bing response"))?;
        Ok(items
            .iter()
            .map(|item| SearchResult {
                title: str_field(item, "name"),
                url: str_field(item, "url"),
                snippet: str_field(item, "snippet"),
            })
            .filter(|r| !r.url.is_empty())
            .take(max_results)
            .collect())
    }
}

struct OllamaSearchProvider {
    client: Client,
    api_key: String,
}

#[async_trait]
impl SearchProvider for OllamaSearchProvider {
    fn name(&self) -> &str {
        "Ollama"
    }

    async fn search(&self, query: &str, max_results: usize) -> anyhow::Result<Vec<SearchResult>> {
        let data: Value = self
            .client
            .post("https://ollama.com/api/web_search")
            .bearer_auth(&self.api_key)
            .json(&json!({"query": query, "max_results": max_results}))
            .send()
            .await?
            .json()
            .await?;
        let items = data
            .get("results")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow!("no results found in Ollama response"))?;
        Ok(items
            .iter()
            .map(|item| SearchResult {
                title: str_field(item, "title"),
                url: str_field(item, "url"),
                snippet: str_field(item, "content"),
            })
            .filter(|r| !r.url.is_empty())
            .take(max_results)
            .collect())
    }
}

pub struct WebSearchService {
    provider: Box<dyn SearchProvider>,
    max_results: usize,
}

impl WebSearchService {
    pub fn from_settings(settings: &WebSearchSettings) -> Result<Self, ToolError> {
        if settings.missing_credentials() {
            return Err(ToolError::CredentialsMissing {
                provider: settings.provider.clone(),
            });
        }
        let client = http_client(settings.timeout_secs);
        let key = settings.key().unwrap_or_default().to_string();
        let provider: Box<dyn SearchProvider> = match settings.provider.as_str() {
            "duckduckgo" | "" => Box::new(DuckDuckGoProvider { client }),
            "custom_scrape" => Box::new(CustomScrapeProvider { client }),
            "google" => Box::new(GoogleProvider {
                client,
                api_key: key,
                cse_id: settings.cse().unwrap_or_default().to_string(),
            }),
            "bing" => Box::new(BingProvider { client, api_key: key }),
            "ollama" => Box::new(OllamaSearchProvider { client, api_key: key }),
            other => {
                return Err(ToolError::InvocationFailed(format!(
                    "unsupported search provider `{other}`; use one of: {}",
                    SEARCH_PROVIDERS.join(", ")
                )))
            }
        };
        Ok(Self::with_provider(provider, settings.max_results))
    }

    pub fn with_provider(provider: Box<dyn SearchProvider>, max_results: usize) -> Self {
        Self {
            provider,
            max_results: max_results.clamp(1, 10),
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub async fn search(&self, query: &str) -> anyhow::Result<String> {
        let query = query
            .chars()
            .filter(|c| !c.is_control() || *c == ' ')
            .collect::<String>();
        if query.trim().is_empty() {
            bail!("query is required");
        }
        let results = self.provider.search(query.trim(), self.max_results).await?;
        Ok(format_results(&query, self.provider.name(), &results))
    }
}

pub fn format_results(query: &str, provider: &str, results: &[SearchResult]) -> String {
    if results.is_empty() {
        return format!("Search results for \"{query}\" (via {provider}): no results found.");
    }
    let mut out = format!("Search results for \"{query}\" (via {provider}):\n\n");
    for (idx, result) in results.iter().enumerate() {
        out.push_str(&format!("{}. {}\n   {}\n", idx + 1, result.title, result.url));
        if !result.snippet.is_empty() {
            out.push_str(&format!("   {}\n", result.snippet));
        }
        out.push('\n');
    }
    out.trim_end().to_string()
}

/// Fetches a page as markdown, capped at `max_chars`, followed by up to `max_links` links.
pub async fn fetch_markdown(
    client: &Client,
    url: &str,
    max_chars: usize,
    max_links: usize,
) -> anyhow::Result<String> {
    let parsed = Url::parse(url.trim()).map_err(|err| anyhow!("invalid url `{url}`: {err}"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        bail!("unsupported url scheme `{}`", parsed.scheme());
    }
    let response = client.get(parsed).send().await?;
    let status = response.status();
    if !status.is_success() {
        bail!("fetch failed with status {status}");
    }
    let is_html = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("html"))
        .unwrap_or(false);
    let body = response.text().await?;
    Ok(render_page(&body, is_html, max_chars, max_links))
}

fn render_page(body: &str, is_html: bool, max_chars: usize, max_links: usize) -> String {
    let text = if is_html {
        html2md::parse_html(body)
    } else {
        body.to_string()
    };
    let total = text.chars().count();
    let mut out = text.chars().take(max_chars).collect::<String>();
    if total > max_chars {
        out.push_str(&format!("\n\n[truncated {} of {total} characters]", total - max_chars));
    }
    if is_html && max_links > 0 {
        let mut seen = HashSet::new();
        let links = HREF_RE
            .captures_iter(body)
            .map(|caps| caps[1].to_string())
            .filter(|link| seen.insert(link.clone()))
            .take(max_links)
            .collect::<Vec<_>>();
        if !links.is_empty() {
            out.push_str("\n\nLinks:\n");
            out.push_str(
                &links
                    .iter()
                    .map(|link| format!("- {link}"))
                    .collect::<Vec<_>>()
                    .join("\n"),
            );
        }
    }
    out
}

pub fn search_schema() -> ToolSchema {
    ToolSchema::new(
        SEARCH_TOOL,
        "Search the web and return titles, URLs and snippets",
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Search keywords"}
            },
            "required": ["query"]
        }),
    )
}

pub fn fetch_schema() -> ToolSchema {
    ToolSchema::new(
        FETCH_TOOL,
        "Fetch a web page and return its content as markdown",
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "Absolute http(s) URL"}
            },
            "required": ["url"]
        }),
    )
}

pub(crate) fn fetch_client(settings: &WebSearchSettings) -> Client {
    http_client(settings.timeout_secs)
}
