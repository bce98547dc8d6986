//! Prompts for the turns that follow a tool result.

use serde_json::Value;

use conduit_providers::ChatMessage;
use conduit_types::{ToolCallRequest, ToolCallResult};

/// Per-result cap on the payload copied into a follow-up prompt.
pub const FOLLOWUP_PAYLOAD_LIMIT: usize = 4000;
const FALLBACK_ITEM_LIMIT: usize = 20;
const FALLBACK_TEXT_LIMIT: usize = 1500;

pub const TOOL_CALL_FORMAT: &str = "<use_mcp_tool><server_name>SERVER</server_name><tool_name>TOOL</tool_name><arguments>{JSON}</arguments></use_mcp_tool>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultClass {
    Error,
    Empty,
    Data,
    Unknown,
}

/// One executed call and its outcome, in detection order.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolExchange {
    pub request: ToolCallRequest,
    pub result: ToolCallResult,
}

impl ToolExchange {
    pub fn new(request: ToolCallRequest, result: ToolCallResult) -> Self {
        Self { request, result }
    }

    pub fn class(&self) -> ResultClass {
        classify(&self.result)
    }
}

pub fn classify(result: &ToolCallResult) -> ResultClass {
    if !result.ok {
        return ResultClass::Error;
    }
    let Some(text) = result.result_preview.as_deref() else {
        return ResultClass::Unknown;
    };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return ResultClass::Empty;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Null) => ResultClass::Empty,
        Ok(Value::Array(items)) if items.is_empty() => ResultClass::Empty,
        Ok(Value::Object(map)) if map.is_empty() => ResultClass::Empty,
        Ok(Value::String(s)) if s.trim().is_empty() => ResultClass::Empty,
        _ => ResultClass::Data,
    }
}

fn instruction(class: ResultClass) -> &'static str {
    match class {
        ResultClass::Error => {
            "The call failed. Analyze the error, then retry with corrected arguments or use another tool."
        }
        ResultClass::Empty => {
            "The call returned no data. Adjust the parameters and call again, or try a different tool."
        }
        ResultClass::Data => "Answer the original question using this result.",
        ResultClass::Unknown => {
            "Use this result to continue; call another tool only if something is still missing."
        }
    }
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut out = text.chars().take(limit).collect::<String>();
    out.push_str("\n...[truncated]");
    out
}

pub fn system_guidance(original_question: &str) -> String {
    [
        "You are answering the user's question with the help of tool results.",
        "Read every result carefully and stay on the user's original question.",
        "If a result is an error, empty or malformed, call another tool or call the same tool again with better arguments.",
        "If the results are not enough yet, call further tools.",
        &format!("To call a tool reply with exactly: {TOOL_CALL_FORMAT}"),
        "If the results are sufficient, give the complete final answer directly.",
        &format!("User question: {original_question}"),
    ]
    .join("\n")
}

/// The synthetic user turn carrying every result of the last model turn.
pub fn result_message(original_question: &str, exchanges: &[ToolExchange]) -> String {
    let mut out = format!("Original question: {original_question}\n\nTool results:\n");
    for (index, exchange) in exchanges.iter().enumerate() {
        let payload = truncate(&exchange.result.payload_text(), FOLLOWUP_PAYLOAD_LIMIT);
        out.push_str(&format!(
            "[{}] {} -> {}\nInstruction: {}\n\n",
            index + 1,
            exchange.request.qualified_name(),
            payload,
            instruction(exchange.class())
        ));
    }
    out.push_str(&format!(
        "If another tool is needed reply with {TOOL_CALL_FORMAT}; otherwise answer the original question."
    ));
    out
}

/// History for the follow-up turn. The original question is folded into the
/// result message, so its standalone copy is dropped.
pub fn followup_history(
    history: &[ChatMessage],
    original_question: &str,
    exchanges: &[ToolExchange],
) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(system_guidance(original_question))];
    messages.extend(
        history
            .iter()
            .filter(|m| !(m.role == "user" && m.content == original_question))
            .filter(|m| m.role != "system")
            .cloned(),
    );
    messages.push(ChatMessage::user(result_message(original_question, exchanges)));
    messages
}

/// A stricter retry after a follow-up turn produced no visible text.
pub fn nudge_history(followup: &[ChatMessage], original_question: &str) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(format!(
        "{}\nYou already have the tool results. Do not stop after thinking: write the answer as visible text now.",
        system_guidance(original_question)
    ))];
    messages.extend(followup.iter().filter(|m| m.role != "system").cloned());
    messages.push(ChatMessage::user(format!(
        "Based on all tool results above, answer the original question now. \
         Only if a result is clearly unusable, call one more tool with {TOOL_CALL_FORMAT}."
    )));
    messages
}

/// Minimal readable answer built from the raw results when the model stays silent.
pub fn fallback_answer(exchanges: &[ToolExchange]) -> String {
    exchanges
        .iter()
        .map(render_fallback)
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn render_fallback(exchange: &ToolExchange) -> String {
    let name = exchange.request.qualified_name();
    match exchange.class() {
        ResultClass::Error => format!(
            "`{name}` failed: {}",
            exchange
                .result
                .error_message
                .as_deref()
                .unwrap_or("unknown error")
        ),
        ResultClass::Empty => format!("`{name}` returned no results."),
        ResultClass::Unknown => format!("`{name}` finished without output."),
        ResultClass::Data => {
            let text = exchange.result.result_preview.as_deref().unwrap_or_default();
            match serde_json::from_str::<Value>(text.trim()) {
                Ok(Value::Array(items)) => {
                    let mut lines = vec![format!("Results from `{name}`:")];
                    lines.extend(
                        items
                            .iter()
                            .take(FALLBACK_ITEM_LIMIT)
                            .map(|item| format!("- {}", render_item(item))),
                    );
                    if items.len() > FALLBACK_ITEM_LIMIT {
                        lines.push(format!("- ... {} more", items.len() - FALLBACK_ITEM_LIMIT));
                    }
                    lines.join("\n")
                }
                _ => format!(
                    "Result from `{name}`:\n{}",
                    truncate(text.trim(), FALLBACK_TEXT_LIMIT)
                ),
            }
        }
    }
}

fn render_item(item: &Value) -> String {
    match item {
        Value::String(s) => s.clone(),
        Value::Object(map) => ["title", "name", "path", "id"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| item.to_string()),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_types::ToolError;
    use serde_json::Map;

    fn exchange(result: ToolCallResult) -> ToolExchange {
        ToolExchange::new(ToolCallRequest::new("fs", "list", Map::new()), result)
    }

    #[test]
    fn classification_covers_each_class() {
        assert_eq!(
            classify(&ToolCallResult::failure(&ToolError::InvocationTimeout)),
            ResultClass::Error
        );
        assert_eq!(classify(&ToolCallResult::success("[]")), ResultClass::Empty);
        assert_eq!(classify(&ToolCallResult::success("  ")), ResultClass::Empty);
        assert_eq!(classify(&ToolCallResult::success("a.txt")), ResultClass::Data);
        let bare = ToolCallResult {
            ok: true,
            ..ToolCallResult::default()
        };
        assert_eq!(classify(&bare), ResultClass::Unknown);
    }

    #[test]
    fn result_message_caps_payload_and_keeps_order() {
        let big = exchange(ToolCallResult::success("x".repeat(FOLLOWUP_PAYLOAD_LIMIT + 100)));
        let failed = exchange(ToolCallResult::failure(&ToolError::InvocationTimeout));
        let text = result_message("what is here?", &[big, failed]);
        assert!(text.contains("[truncated]"));
        let first = text.find("[1] fs.list").expect("first");
        let second = text.find("[2] fs.list").expect("second");
        assert!(first < second);
        assert!(text.contains("retry with corrected arguments"));
    }

    #[test]
    fn followup_drops_standalone_question() {
        let history = vec![
            ChatMessage::system("old system"),
            ChatMessage::user("list files"),
            ChatMessage::assistant("calling a tool"),
        ];
        let out = followup_history(&history, "list files", &[exchange(ToolCallResult::success("a"))]);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].role, "system");
        assert_eq!(out[1].role, "assistant");
        assert!(out[2].content.starts_with("Original question: list files"));
        let nudge = nudge_history(&out, "list files");
        assert_eq!(nudge.first().map(|m| m.role.as_str()), Some("system"));
        assert_eq!(nudge.iter().filter(|m| m.role == "system").count(), 1);
    }

    #[test]
    fn fallback_lists_array_items() {
        let listing = exchange(ToolCallResult::success(
            r#"[{"name":"a.txt"},{"name":"b.txt"},"c.txt"]"#,
        ));
        let text = fallback_answer(&[listing]);
        assert!(text.contains("- a.txt"));
        assert!(text.contains("- c.txt"));
        let failed = fallback_answer(&[exchange(ToolCallResult::failure(&ToolError::InvocationTimeout))]);
        assert!(failed.contains("failed: timeout"));
    }
}
