//! System messages that advertise tools on the first turn of a message.

use once_cell::sync::Lazy;
use regex::Regex;

use conduit_providers::ChatMessage;
use conduit_runtime::preheat::mentions;
use conduit_runtime::ToolCatalogCache;
use conduit_tools::web::{fetch_schema, search_schema};
use conduit_types::{ToolSchema, WEB_SEARCH_SERVER};

use crate::followup::TOOL_CALL_FORMAT;

/// Tools listed per server unless the server is mentioned explicitly.
pub const TOOL_LINE_LIMIT: usize = 8;

static TOOL_INTENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(@[a-z0-9_-]+|\blist\s|\bdir\s|\bls\b|\btool\b|\bmcp\b|\bsearch\b|\bfiles?\b|\bdirectory\b|文件|目录|列出)")
        .expect("valid tool intent regex")
});

/// Only prompts that mention a server or ask for tool-like work get tool context.
pub fn wants_tool_context(text: &str) -> bool {
    TOOL_INTENT_RE.is_match(text)
}

/// Enabled servers with explicitly mentioned ones first.
pub fn server_order(text: &str, enabled: &[String]) -> Vec<String> {
    let mut ordered: Vec<String> = Vec::new();
    for name in mentions(text) {
        if let Some(server) = enabled.iter().find(|s| s.eq_ignore_ascii_case(&name)) {
            if !ordered.contains(server) {
                ordered.push(server.clone());
            }
        }
    }
    for server in enabled {
        if !ordered.contains(server) {
            ordered.push(server.clone());
        }
    }
    ordered
}

pub fn tool_line(server: &str, tools: &[ToolSchema], mentioned: bool) -> Option<String> {
    if tools.is_empty() {
        return None;
    }
    let limit = if mentioned { tools.len() } else { TOOL_LINE_LIMIT };
    let names = tools
        .iter()
        .take(limit)
        .map(|t| t.name.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    Some(format!("Tools@{server}: {names}"))
}

pub fn protocol_message() -> String {
    [
        "You can call external tools (file system, web search and other MCP servers).",
        "Call a tool only when the answer cannot come from your own knowledge and a listed server clearly provides a suitable tool.",
        &format!("To call one, reply with a single line using exactly: {TOOL_CALL_FORMAT}"),
        "Do not write anything outside the tag when calling. If no tool is needed, answer normally.",
    ]
    .join(" ")
}

/// Builds the injected messages from already-fetched catalogs, in server order.
pub fn build_tool_context(text: &str, catalogs: &[(String, Vec<ToolSchema>)]) -> Vec<ChatMessage> {
    if !wants_tool_context(text) {
        return Vec::new();
    }
    let mentioned = mentions(text);
    let mut messages = catalogs
        .iter()
        .filter_map(|(server, tools)| {
            let is_mentioned = mentioned.iter().any(|m| m.eq_ignore_ascii_case(server));
            tool_line(server, tools, is_mentioned)
        })
        .map(ChatMessage::system)
        .collect::<Vec<_>>();
    messages.push(ChatMessage::system(protocol_message()));
    if !catalogs.is_empty() {
        let names = catalogs
            .iter()
            .map(|(server, _)| server.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        messages.push(ChatMessage::system(format!(
            "Enabled MCP servers: {names}. Prefer tools from these servers."
        )));
    }
    messages
}

/// Fetches catalogs for `enabled` servers and builds the injected messages.
pub async fn tool_context(
    text: &str,
    enabled: &[String],
    catalog: &ToolCatalogCache,
) -> Vec<ChatMessage> {
    if !wants_tool_context(text) {
        return Vec::new();
    }
    let mut catalogs = Vec::new();
    for server in server_order(text, enabled) {
        let tools = if server == WEB_SEARCH_SERVER {
            vec![search_schema(), fetch_schema()]
        } else {
            catalog.get_tools(&server).await
        };
        catalogs.push((server, tools));
    }
    build_tool_context(text, &catalogs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tools(count: usize) -> Vec<ToolSchema> {
        (0..count)
            .map(|i| ToolSchema::new(format!("t{i}"), "", json!({})))
            .collect()
    }

    #[test]
    fn plain_questions_get_no_tool_context() {
        assert!(!wants_tool_context("what is a black hole?"));
        assert!(wants_tool_context("@fs show me the readme"));
        assert!(wants_tool_context("list files in my home"));
        assert!(build_tool_context("why is the sky blue", &[("fs".into(), tools(2))]).is_empty());
    }

    #[test]
    fn mentioned_servers_come_first_with_full_lists() {
        let enabled = vec!["weather".to_string(), "fs".to_string()];
        let order = server_order("use @FS please", &enabled);
        assert_eq!(order, vec!["fs".to_string(), "weather".to_string()]);

        let catalogs = vec![("fs".to_string(), tools(10)), ("weather".to_string(), tools(10))];
        let messages = build_tool_context("use @fs to list files", &catalogs);
        assert!(messages[0].content.ends_with("t9"));
        assert!(messages[1].content.ends_with("t7"));
        assert!(messages.iter().any(|m| m.content.contains("<use_mcp_tool>")));
        assert!(messages
            .last()
            .is_some_and(|m| m.content.starts_with("Enabled MCP servers: fs, weather")));
    }

    #[test]
    fn servers_without_tools_are_skipped() {
        assert_eq!(tool_line("empty", &[], true), None);
    }
}
