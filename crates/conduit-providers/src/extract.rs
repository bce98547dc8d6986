//! Recovery of tool-call instructions embedded in model text.
//!
//! Five textual forms are recognized, tried in a fixed order:
//! channel headers (`<|channel|>commentary to=server.tool <|message|>{..}`),
//! `<tool_call>{..}</tool_call>`, `<use_mcp_tool>..</use_mcp_tool>`,
//! the delimiter form `to= >>server>>tool>>{..}>>`, and bare JSON objects
//! carrying `"type":"tool_call"`. Extraction is a pure function of its input.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use conduit_types::{ParsedToolCall, WEB_SEARCH_SERVER};

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractOutcome {
    pub cleaned_text: String,
    pub call: Option<ParsedToolCall>,
}

/// A recognized instruction and the byte span it occupies in the input.
#[derive(Debug, Clone, PartialEq)]
pub struct Located {
    pub call: ParsedToolCall,
    pub start: usize,
    pub end: usize,
}

type TryParse = fn(&str) -> Option<Located>;

const PARSERS: [TryParse; 5] = [
    try_channel,
    try_tool_call_tag,
    try_use_mcp_tool,
    try_delimited,
    try_bare_json,
];

static CHANNEL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?is)<\|channel\|>\s*commentary\s+to=\s*([A-Za-z0-9_\-]+)(?:\.([^<]*?))?\s*(?:<\|constrain\|>[^<]*)?<\|message\|>",
    )
    .expect("valid channel regex")
});
static TOOL_CALL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<tool_call>\s*(.*?)\s*</tool_call>").expect("valid tool_call regex")
});
static USE_MCP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<use_mcp_tool>(.*?)</use_mcp_tool>").expect("valid use_mcp_tool regex")
});
static SERVER_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<server_name>\s*(.*?)\s*</server_name>").expect("valid server_name regex")
});
static TOOL_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<tool_name>\s*(.*?)\s*</tool_name>").expect("valid tool_name regex")
});
static ARGUMENTS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<arguments>\s*(.*?)\s*</arguments>").expect("valid arguments regex")
});
static DELIMITED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)to=\s*>>\s*([A-Za-z0-9_\-]+)\s*>>\s*([A-Za-z0-9_\-\.]+)\s*>>\s*")
        .expect("valid delimiter regex")
});
static TYPE_TOOL_CALL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""type"\s*:\s*"tool_call""#).expect("valid type regex")
});
static SIGNAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)commentary\s+to=|<\|channel\|>|<use_mcp_tool|<tool_call|"type"\s*:\s*"tool_call"|to=\s*>>"#)
        .expect("valid signal regex")
});

// Removal patterns used when a marker is present but nothing parsed.
static CLEAN_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?is)<use_mcp_tool>.*?</use_mcp_tool>",
        r"(?is)<tool_call>.*?</tool_call>",
        r"(?is)<use_mcp_tool>.*$",
        r"(?is)<tool_call>.*$",
        r"(?is)<\|channel\|>\s*commentary.*$",
        r"(?s)to=\s*>>.*$",
        r#"(?s)```(?:json)?\s*\{\s*"type"\s*:\s*"tool_call".*$"#,
        r#"(?s)\{\s*"type"\s*:\s*"tool_call".*$"#,
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("valid cleanup regex"))
    .collect()
});
static BLANK_RUN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n{3,}").expect("valid blank-line regex"));

static OPENER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<use_mcp_tool|<tool_call|<\|channel\|>\s*commentary|to=\s*>>|(?:```(?:json)?\s*)?\{\s*"type"\s*:\s*"tool_call""#)
        .expect("valid opener regex")
});
static CHANNEL_TAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<\|channel\|>\s*([a-z]*)$").expect("valid channel tail regex"));
static TO_TAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)to=\s*>?$").expect("valid delimiter tail regex"));
static FENCE_TAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```(?:json)?\s*$").expect("valid fence tail regex"));

/// Prefixes that may open an instruction; a chunk ending in part of one is held back.
pub const INSTRUCTION_OPENERS: [&str; 4] = ["<use_mcp_tool", "<tool_call", "<|channel|>", "to="];

pub fn has_instruction_signal(text: &str) -> bool {
    SIGNAL_RE.is_match(text)
}

/// Detects and removes one embedded tool instruction.
pub fn extract(text: &str) -> ExtractOutcome {
    if !has_instruction_signal(text) {
        return ExtractOutcome {
            cleaned_text: text.to_string(),
            call: None,
        };
    }
    match locate(text) {
        Some(located) => {
            let mut remainder = String::with_capacity(text.len());
            remainder.push_str(&text[..located.start]);
            remainder.push_str(&text[located.end..]);
            ExtractOutcome {
                cleaned_text: clean_instructions(&remainder),
                call: Some(located.call),
            }
        }
        None => ExtractOutcome {
            cleaned_text: clean_instructions(text),
            call: None,
        },
    }
}

/// First instruction found by the ordered parsers, with a wrapping code fence included in its span.
pub fn locate(text: &str) -> Option<Located> {
    PARSERS.iter().find_map(|parser| parser(text)).map(|located| {
        let (start, end) = expand_to_fence(text, located.start, located.end);
        Located {
            call: normalize_call(located.call),
            start,
            end,
        }
    })
}

/// Strips complete and half-finished instruction syntax so it is never displayed.
pub fn clean_instructions(text: &str) -> String {
    if !has_instruction_signal(text) && !text.contains("\n\n\n") {
        return text.trim().to_string();
    }
    let mut out = text.to_string();
    for re in CLEAN_RES.iter() {
        out = re.replace_all(&out, "").into_owned();
    }
    BLANK_RUN_RE.replace_all(&out, "\n\n").trim().to_string()
}

/// Length of the longest suffix of `text` that could begin an instruction opener.
pub fn partial_opener_len(text: &str) -> usize {
    let bytes = text.as_bytes();
    let mut best = 0;
    for opener in INSTRUCTION_OPENERS {
        let opener = opener.as_bytes();
        for k in (1..opener.len()).rev() {
            if k <= best || bytes.len() < k {
                continue;
            }
            if bytes[bytes.len() - k..].eq_ignore_ascii_case(&opener[..k]) {
                best = k;
                break;
            }
        }
    }
    best
}

/// Byte offset of the first complete instruction opener.
pub(crate) fn instruction_start(text: &str) -> Option<usize> {
    OPENER_RE.find(text).map(|m| m.start())
}

/// Start of a trailing fragment that may still grow into an instruction opener.
pub(crate) fn holdback_start(text: &str) -> usize {
    let mut start = text.len() - partial_opener_len(text);
    if let Some(caps) = CHANNEL_TAIL_RE.captures(text) {
        let word = caps.get(1).map(|m| m.as_str().to_ascii_lowercase()).unwrap_or_default();
        if "commentary".starts_with(&word) {
            start = start.min(caps.get(0).map(|m| m.start()).unwrap_or(start));
        }
    }
    for re in [&*TO_TAIL_RE, &*FENCE_TAIL_RE] {
        if let Some(m) = re.find(text) {
            start = start.min(m.start());
        }
    }
    start
}

/// Where to start holding back for the object opened at `open`: its code fence, if one precedes it.
pub(crate) fn object_hold_start(text: &str, open: usize) -> usize {
    FENCE_TAIL_RE
        .find(&text[..open])
        .map_or(open, |fence| fence.start())
}

/// The tool call carried by the closed object `text[open..close]`, spanning the whole object.
///
/// Catches bare calls whose `type` key is not the first one, which no opener can gate.
pub(crate) fn object_call(text: &str, open: usize, close: usize) -> Option<Located> {
    let located = try_bare_json(&text[open..close])?;
    let (start, end) = expand_to_fence(text, open, close);
    Some(Located {
        call: normalize_call(located.call),
        start,
        end,
    })
}

/// End of the instruction block that begins at offset 0, once it is syntactically closed.
pub(crate) fn closed_block_end(text: &str) -> Option<usize> {
    let lower = text.to_ascii_lowercase();
    if lower.starts_with("<tool_call") {
        return lower.find("</tool_call>").map(|i| i + "</tool_call>".len());
    }
    if lower.starts_with("<use_mcp_tool") {
        return lower
            .find("</use_mcp_tool>")
            .map(|i| i + "</use_mcp_tool>".len());
    }
    let json_from = if lower.starts_with("<|channel|>") {
        lower.find("<|message|>")?
    } else {
        0
    };
    let open = text[json_from..].find('{')? + json_from;
    let close = json_object_end(text, open)?;
    let rest = &text[close..];
    let trimmed = rest.trim_start();
    let tail = ["<|call|>", ">>", "```"]
        .iter()
        .find_map(|marker| trimmed.strip_prefix(marker));
    Some(match tail {
        Some(after) => text.len() - after.len(),
        None => close,
    })
}

fn normalize_call(mut call: ParsedToolCall) -> ParsedToolCall {
    if call.server == "filesystem" {
        if call.tool == "list" {
            call.tool = "dir".to_string();
        }
        if let Some(Value::String(path)) = call.args.get_mut("path") {
            *path = path.replace('\\', "/");
        }
    }
    call
}

fn try_channel(text: &str) -> Option<Located> {
    for caps in CHANNEL_RE.captures_iter(text) {
        let whole = caps.get(0)?;
        let server = caps.get(1)?.as_str().trim().to_string();
        let tool = caps
            .get(2)
            .map(|m| squash_whitespace(m.as_str().trim()))
            .filter(|tool| !tool.is_empty())
            .or_else(|| default_tool_for(&server).map(str::to_string));
        let Some(tool) = tool else {
            continue;
        };
        let Some(open) = text[whole.end()..].find('{').map(|i| whole.end() + i) else {
            continue;
        };
        let Some(close) = json_object_end(text, open) else {
            continue;
        };
        let Some(args) = parse_object(&text[open..close]) else {
            continue;
        };
        let mut end = close;
        if let Some(rest) = text[end..].strip_prefix("<|call|>") {
            end = text.len() - rest.len();
        }
        return Some(Located {
            call: ParsedToolCall { server, tool, args },
            start: whole.start(),
            end,
        });
    }
    None
}

fn try_tool_call_tag(text: &str) -> Option<Located> {
    for caps in TOOL_CALL_RE.captures_iter(text) {
        let whole = caps.get(0)?;
        let body = strip_code_fence(caps.get(1)?.as_str());
        let Some(value) = serde_json::from_str::<Value>(&body).ok() else {
            continue;
        };
        if let Some(call) = call_from_value(&value) {
            return Some(Located {
                call,
                start: whole.start(),
                end: whole.end(),
            });
        }
    }
    None
}

fn try_use_mcp_tool(text: &str) -> Option<Located> {
    for caps in USE_MCP_RE.captures_iter(text) {
        let whole = caps.get(0)?;
        let body = caps.get(1)?.as_str();
        let server = SERVER_NAME_RE
            .captures(body)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty());
        let tool = TOOL_NAME_RE
            .captures(body)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty());
        let (Some(server), Some(tool)) = (server, tool) else {
            continue;
        };
        let args = match ARGUMENTS_RE.captures(body).and_then(|c| c.get(1)) {
            Some(raw) => {
                let raw = strip_code_fence(raw.as_str());
                if raw.trim().is_empty() {
                    Map::new()
                } else {
                    let Some(args) = parse_object(&raw) else {
                        continue;
                    };
                    args
                }
            }
            None => Map::new(),
        };
        return Some(Located {
            call: ParsedToolCall { server, tool, args },
            start: whole.start(),
            end: whole.end(),
        });
    }
    None
}

fn try_delimited(text: &str) -> Option<Located> {
    for caps in DELIMITED_RE.captures_iter(text) {
        let whole = caps.get(0)?;
        let server = caps.get(1)?.as_str().to_string();
        let tool = caps.get(2)?.as_str().to_string();
        if !text[whole.end()..].starts_with('{') {
            continue;
        }
        let Some(close) = json_object_end(text, whole.end()) else {
            continue;
        };
        let Some(args) = parse_object(&text[whole.end()..close]) else {
            continue;
        };
        let rest = &text[close..];
        let trimmed = rest.trim_start();
        let end = match trimmed.strip_prefix(">>") {
            Some(after) => text.len() - after.len(),
            None => close,
        };
        return Some(Located {
            call: ParsedToolCall { server, tool, args },
            start: whole.start(),
            end,
        });
    }
    None
}

fn try_bare_json(text: &str) -> Option<Located> {
    for marker in TYPE_TOOL_CALL_RE.find_iter(text) {
        // Innermost enclosing object first.
        let candidates = text[..marker.start()]
            .char_indices()
            .filter(|(_, ch)| *ch == '{')
            .map(|(idx, _)| idx)
            .collect::<Vec<_>>();
        for open in candidates.into_iter().rev() {
            let Some(close) = json_object_end(text, open) else {
                continue;
            };
            if close < marker.end() {
                continue;
            }
            let Ok(value) = serde_json::from_str::<Value>(&text[open..close]) else {
                continue;
            };
            if value.get("type").and_then(Value::as_str) != Some("tool_call") {
                continue;
            }
            if let Some(call) = call_from_value(&value) {
                return Some(Located {
                    call,
                    start: open,
                    end: close,
                });
            }
        }
    }
    None
}

/// Field aliases shared by the `<tool_call>` and bare JSON forms.
fn call_from_value(value: &Value) -> Option<ParsedToolCall> {
    let obj = value.as_object()?;
    for key in ["tool_call", "toolCall", "function_call", "functionCall"] {
        if let Some(nested) = obj.get(key).filter(|v| v.is_object()) {
            if let Some(found) = call_from_value(nested) {
                return Some(found);
            }
        }
    }
    let server = first_str(obj, &["server", "mcp", "provider", "server_name", "serverName"]);
    let tool = first_str(obj, &["tool", "tool_name", "toolName", "name"]);
    let (server, tool) = match (server, tool) {
        (Some(server), Some(tool)) => (server, tool),
        (None, Some(tool)) => {
            let (server, tool) = tool.split_once('.')?;
            (server.to_string(), tool.to_string())
        }
        _ => return None,
    };
    let args = ["parameters", "args", "params", "arguments", "input"]
        .iter()
        .find_map(|key| obj.get(*key))
        .and_then(|raw| match raw {
            Value::Object(map) => Some(map.clone()),
            Value::String(s) => parse_object(s),
            _ => None,
        })
        .unwrap_or_default();
    if server.trim().is_empty() || tool.trim().is_empty() {
        return None;
    }
    Some(ParsedToolCall {
        server: server.trim().to_string(),
        tool: tool.trim().to_string(),
        args,
    })
}

fn first_str(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| obj.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn default_tool_for(server: &str) -> Option<&'static str> {
    if server == WEB_SEARCH_SERVER {
        Some("search")
    } else {
        None
    }
}

fn squash_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join("_")
}

fn parse_object(raw: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw.trim()).ok()? {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

fn strip_code_fence(raw: &str) -> String {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    let rest = rest
        .split_once('\n')
        .map(|(lang, body)| if lang.trim().contains('{') { rest } else { body })
        .unwrap_or(rest);
    rest.trim_end()
        .strip_suffix("```")
        .unwrap_or(rest)
        .trim()
        .to_string()
}

/// Widens a span to swallow a code fence that only wraps the instruction.
fn expand_to_fence(text: &str, start: usize, end: usize) -> (usize, usize) {
    let before = text[..start].trim_end();
    let after = text[end..].trim_start();
    let opening = ["```json", "```JSON", "```"]
        .iter()
        .find(|fence| before.ends_with(**fence));
    match (opening, after.strip_prefix("```")) {
        (Some(fence), Some(rest)) => (before.len() - fence.len(), text.len() - rest.len()),
        _ => (start, end),
    }
}

/// Returns the byte index just past the `}` closing the object opened at `open`.
pub(crate) fn json_object_end(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[open..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(open + offset + 1);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn plain_text_passes_through_unchanged() {
        let input = "  The answer is 42.\n\n\n";
        let out = extract(input);
        assert_eq!(out.cleaned_text, input);
        assert!(out.call.is_none());
    }

    #[test]
    fn channel_form_with_tool() {
        let input = "Let me check.<|channel|>commentary to=weather.get current <|constrain|>json<|message|>{\"city\":\"Tokyo\"}<|call|>";
        let out = extract(input);
        let call = out.call.expect("call");
        assert_eq!(call.server, "weather");
        assert_eq!(call.tool, "get_current");
        assert_eq!(call.args, args(json!({"city": "Tokyo"})));
        assert_eq!(out.cleaned_text, "Let me check.");
    }

    #[test]
    fn channel_form_defaults_native_tool() {
        let input = "<|channel|>commentary to=web_search <|message|>{\"query\":\"rust\"}";
        let call = extract(input).call.expect("call");
        assert_eq!(call.server, "web_search");
        assert_eq!(call.tool, "search");
    }

    #[test]
    fn channel_form_without_tool_for_unknown_server_is_ignored() {
        let input = "<|channel|>commentary to=weather <|message|>{\"city\":\"Tokyo\"}";
        let out = extract(input);
        assert!(out.call.is_none());
        assert_eq!(out.cleaned_text, "");
    }

    #[test]
    fn tool_call_tag_with_aliases() {
        let input = "Before\n<tool_call>{\"mcp\":\"weather\",\"tool_name\":\"get\",\"params\":{\"city\":\"Tokyo\"}}</tool_call>\nAfter";
        let out = extract(input);
        let call = out.call.expect("call");
        assert_eq!(call.server, "weather");
        assert_eq!(call.tool, "get");
        assert_eq!(call.args, args(json!({"city": "Tokyo"})));
        assert_eq!(out.cleaned_text, "Before\n\nAfter");
    }

    #[test]
    fn use_mcp_tool_with_fenced_arguments() {
        let input = "Checking files.\n<use_mcp_tool>\n<server_name>filesystem</server_name>\n<tool_name>read</tool_name>\n<arguments>\n```json\n{\"path\": \"C:\\\\tmp\\\\a.txt\"}\n```\n</arguments>\n</use_mcp_tool>";
        let out = extract(input);
        let call = out.call.expect("call");
        assert_eq!(call.server, "filesystem");
        assert_eq!(call.tool, "read");
        assert_eq!(call.args.get("path"), Some(&json!("C:/tmp/a.txt")));
        assert_eq!(out.cleaned_text, "Checking files.");
    }

    #[test]
    fn filesystem_list_is_aliased_to_dir() {
        let input = "<tool_call>{\"server\":\"filesystem\",\"tool\":\"list\",\"args\":{\"path\":\".\"}}</tool_call>";
        let call = extract(input).call.expect("call");
        assert_eq!(call.tool, "dir");
    }

    #[test]
    fn delimiter_form() {
        let input = "ok to= >>weather>>get>>{\"city\":\"Tokyo\"}>> done";
        let out = extract(input);
        let call = out.call.expect("call");
        assert_eq!(call.server, "weather");
        assert_eq!(call.tool, "get");
        assert_eq!(out.cleaned_text, "ok  done");
    }

    #[test]
    fn bare_json_in_fence() {
        let input = "Sure.\n```json\n{\"type\":\"tool_call\",\"server\":\"weather\",\"tool\":\"get\",\"parameters\":{\"city\":\"Tokyo\"}}\n```\nThanks";
        let out = extract(input);
        let call = out.call.expect("call");
        assert_eq!(call.server, "weather");
        assert_eq!(call.args, args(json!({"city": "Tokyo"})));
        assert_eq!(out.cleaned_text, "Sure.\n\nThanks");
    }

    #[test]
    fn bare_json_with_dotted_name() {
        let input = "{\"type\": \"tool_call\", \"name\": \"weather.get\", \"arguments\": \"{\\\"city\\\":\\\"Tokyo\\\"}\"}";
        let call = extract(input).call.expect("call");
        assert_eq!(call.server, "weather");
        assert_eq!(call.tool, "get");
        assert_eq!(call.args, args(json!({"city": "Tokyo"})));
    }

    #[test]
    fn invalid_json_falls_through_and_is_cleaned() {
        let input = "Hi <tool_call>{not json}</tool_call> there";
        let out = extract(input);
        assert!(out.call.is_none());
        assert_eq!(out.cleaned_text, "Hi  there");
    }

    #[test]
    fn unfinished_tag_never_leaks() {
        let first = extract("Let me look <tool_call>{\"server\":\"weather\",");
        assert_eq!(first.cleaned_text, "Let me look");
        assert!(first.call.is_none());

        let full = extract("Let me look <tool_call>{\"server\":\"weather\",\"tool\":\"get\",\"args\":{}}</tool_call>");
        assert_eq!(full.cleaned_text, "Let me look");
        assert!(full.call.is_some());
    }

    #[test]
    fn extraction_is_idempotent_on_cleaned_text() {
        let out = extract("A\n<tool_call>{\"server\":\"s\",\"tool\":\"t\"}</tool_call>\n\n\n\nB");
        let again = extract(&out.cleaned_text);
        assert_eq!(again.cleaned_text, out.cleaned_text);
        assert!(again.call.is_none());
    }

    #[test]
    fn extraction_is_deterministic() {
        let input = "x <tool_call>{\"server\":\"s\",\"tool\":\"t\",\"args\":{\"b\":1}}</tool_call>";
        assert_eq!(extract(input), extract(input));
    }

    #[test]
    fn partial_opener_detects_split_tags() {
        assert_eq!(partial_opener_len("hello <too"), 4);
        assert_eq!(partial_opener_len("hello <|chan"), 6);
        assert_eq!(partial_opener_len("hello"), 0);
    }

    #[test]
    fn object_end_skips_braces_in_strings() {
        let text = r#"{"a":"}{","b":{"c":1}} tail"#;
        assert_eq!(json_object_end(text, 0), Some(text.len() - " tail".len()));
    }
}
