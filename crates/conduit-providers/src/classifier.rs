use std::collections::HashSet;

use conduit_types::{ParsedToolCall, StreamEvent, ThinkingMode};

use crate::extract;
use crate::thinking::{strategy_for, Segment, ThinkingStrategy};
use crate::ModelDelta;

const RAW_DEDUPE_PREFIX: usize = 100;
// An unclosed object longer than this is treated as prose.
const OBJECT_HOLDBACK_LIMIT: usize = 4000;

/// Turns raw model deltas into the canonical [`StreamEvent`] sequence.
///
/// Instruction text in the content stream is held back from the moment an
/// opener appears until the block closes, so raw tool syntax never reaches a
/// `ContentToken`. JSON objects are held until they close and are released
/// only when they turn out not to be calls. Each distinct call is reported
/// once per message.
pub struct TokenClassifier {
    strategy: Box<dyn ThinkingStrategy>,
    in_thinking: bool,
    thinking_region: String,
    pending: String,
    visible: String,
    reported: HashSet<String>,
    finished: bool,
}

impl TokenClassifier {
    pub fn new(strategy: Box<dyn ThinkingStrategy>) -> Self {
        Self {
            strategy,
            in_thinking: false,
            thinking_region: String::new(),
            pending: String::new(),
            visible: String::new(),
            reported: HashSet::new(),
            finished: false,
        }
    }

    pub fn for_model(provider_id: &str, model_id: &str) -> Self {
        Self::new(strategy_for(provider_id, model_id))
    }

    pub fn mode(&self) -> ThinkingMode {
        self.strategy.mode()
    }

    /// Visible answer text emitted so far, with instructions removed.
    pub fn visible_text(&self) -> &str {
        &self.visible
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn reset(&mut self) {
        self.strategy.reset();
        self.in_thinking = false;
        self.thinking_region.clear();
        self.pending.clear();
        self.visible.clear();
        self.reported.clear();
        self.finished = false;
    }

    pub fn push(&mut self, delta: &ModelDelta) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        for segment in self.strategy.process(delta) {
            self.handle_segment(segment, &mut events);
        }
        if delta.done {
            self.finalize(&mut events);
        }
        events
    }

    /// Equivalent to pushing a bare `done` delta.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        self.push(&ModelDelta::done())
    }

    fn handle_segment(&mut self, segment: Segment, events: &mut Vec<StreamEvent>) {
        match segment {
            Segment::Thinking(text) => {
                if !self.in_thinking {
                    self.in_thinking = true;
                    events.push(StreamEvent::ThinkingStart { mode: self.mode() });
                }
                self.thinking_region.push_str(&text);
                events.push(StreamEvent::thinking(text));
            }
            Segment::Content(text) => {
                if self.in_thinking {
                    self.end_thinking(events);
                }
                self.pending.push_str(&text);
                self.drain_pending(events, false);
            }
        }
    }

    fn end_thinking(&mut self, events: &mut Vec<StreamEvent>) {
        self.in_thinking = false;
        events.push(StreamEvent::ThinkingEnd);
        // Some models place the call inside their reasoning.
        let region = std::mem::take(&mut self.thinking_region);
        if let Some(located) = extract::locate(&region) {
            let raw = region[located.start..located.end].to_string();
            self.report_call(raw, Some(located.call), events);
        }
    }

    fn drain_pending(&mut self, events: &mut Vec<StreamEvent>, at_end: bool) {
        loop {
            let opener = extract::instruction_start(&self.pending);
            let brace = self
                .pending
                .find('{')
                .filter(|brace| opener.map_or(true, |start| *brace < start));
            if let Some(open) = brace {
                if self.drain_object(open, events, at_end) {
                    continue;
                }
                return;
            }
            let Some(start) = opener else {
                let cut = if at_end {
                    self.pending.len()
                } else {
                    extract::holdback_start(&self.pending)
                };
                let visible = self.pending.drain(..cut).collect::<String>();
                self.emit_content(visible, events);
                return;
            };
            if start > 0 {
                let visible = self.pending.drain(..start).collect::<String>();
                self.emit_content(visible, events);
            }

            let block_end = extract::closed_block_end(&self.pending);
            let scope = match block_end {
                Some(end) => &self.pending[..end],
                None => self.pending.as_str(),
            };
            let located = extract::locate(scope)
                .filter(|located| scope[..located.start].trim().is_empty());
            if let Some(located) = located {
                let raw = self.pending[..located.end].to_string();
                self.pending.drain(..located.end);
                self.report_call(raw, Some(located.call), events);
                continue;
            }
            if let Some(end) = block_end {
                let raw = self.pending.drain(..end).collect::<String>();
                self.report_call(raw, None, events);
                continue;
            }
            if at_end {
                let rest = std::mem::take(&mut self.pending);
                self.emit_content(extract::clean_instructions(&rest), events);
            }
            return;
        }
    }

    /// Settles the object opened at `open`; false while it is still being held.
    fn drain_object(&mut self, open: usize, events: &mut Vec<StreamEvent>, at_end: bool) -> bool {
        let hold = extract::object_hold_start(&self.pending, open);
        let visible = self.pending.drain(..hold).collect::<String>();
        self.emit_content(visible, events);
        let open = open - hold;

        if let Some(close) = extract::json_object_end(&self.pending, open) {
            match extract::object_call(&self.pending, open, close) {
                Some(located) => {
                    let raw = self.pending.drain(..located.end).collect::<String>();
                    self.report_call(raw, Some(located.call), events);
                }
                None => {
                    let text = self.pending.drain(..close).collect::<String>();
                    self.emit_content(text, events);
                }
            }
            return true;
        }
        if at_end {
            // An unfinished call object is dropped.
            let rest = std::mem::take(&mut self.pending);
            if !extract::has_instruction_signal(&rest) {
                self.emit_content(rest, events);
            }
            return false;
        }
        if self.pending.len() - open > OBJECT_HOLDBACK_LIMIT {
            let text = self.pending.drain(..=open).collect::<String>();
            self.emit_content(text, events);
            return true;
        }
        false
    }

    fn finalize(&mut self, events: &mut Vec<StreamEvent>) {
        for segment in self.strategy.finish() {
            self.handle_segment(segment, events);
        }
        if self.in_thinking {
            self.end_thinking(events);
        }
        self.drain_pending(events, true);
        self.finished = true;
        events.push(StreamEvent::StreamComplete);
    }

    fn emit_content(&mut self, text: String, events: &mut Vec<StreamEvent>) {
        if text.is_empty() {
            return;
        }
        self.visible.push_str(&text);
        events.push(StreamEvent::content(text));
    }

    fn report_call(
        &mut self,
        raw: String,
        parsed: Option<ParsedToolCall>,
        events: &mut Vec<StreamEvent>,
    ) {
        let key = match &parsed {
            Some(call) => call.fingerprint(),
            None => raw.chars().take(RAW_DEDUPE_PREFIX).collect(),
        };
        if !self.reported.insert(key) {
            return;
        }
        events.push(StreamEvent::ToolCall { raw, parsed });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thinking::{DeepSeekReasoning, StandardThinking};

    fn run(classifier: &mut TokenClassifier, chunks: &[&str]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(classifier.push(&ModelDelta::content(*chunk)));
        }
        events.extend(classifier.finish());
        events
    }

    fn content_of(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentToken { content } => Some(content.as_str()),
                _ => None,
            })
            .collect()
    }

    fn calls_of(events: &[StreamEvent]) -> Vec<ParsedToolCall> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ToolCall { parsed, .. } => parsed.clone(),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn split_instruction_never_reaches_content() {
        let mut classifier = TokenClassifier::new(Box::new(StandardThinking::new()));
        let events = run(
            &mut classifier,
            &[
                "Checking <too",
                "l_call>{\"server\":\"weather\",\"tool\":\"get\",",
                "\"args\":{\"city\":\"Tokyo\"}}</tool_call> now.",
            ],
        );
        let content = content_of(&events);
        assert!(!content.contains("tool_call"));
        assert!(!content.contains('{'));
        assert_eq!(content, "Checking  now.");
        let calls = calls_of(&events);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].server, "weather");
        assert_eq!(events.last(), Some(&StreamEvent::StreamComplete));
    }

    fn assert_weather_call(events: &[StreamEvent]) {
        let calls = calls_of(events);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].server, "weather");
        assert_eq!(calls[0].tool, "get");
        assert_eq!(calls[0].args.get("city"), Some(&serde_json::json!("Tokyo")));
    }

    #[test]
    fn split_channel_header_never_reaches_content() {
        let mut classifier = TokenClassifier::new(Box::new(StandardThinking::new()));
        let events = run(
            &mut classifier,
            &[
                "Looking. <|chan",
                "nel|>comm",
                "entary to=weather.get <|message|>{\"city\":\"Tokyo\"}<|call|>",
            ],
        );
        assert_eq!(content_of(&events), "Looking. ");
        assert_weather_call(&events);
    }

    #[test]
    fn split_use_mcp_tool_never_reaches_content() {
        let mut classifier = TokenClassifier::new(Box::new(StandardThinking::new()));
        let events = run(
            &mut classifier,
            &[
                "Let me check. <use_mc",
                "p_tool><server_name>weather</server_name><tool_name>get</tool_name>",
                "<arguments>{\"city\":\"Tokyo\"}</argu",
                "ments></use_mcp_tool>",
            ],
        );
        assert_eq!(content_of(&events), "Let me check. ");
        assert_weather_call(&events);
    }

    #[test]
    fn split_delimiter_form_never_reaches_content() {
        let mut classifier = TokenClassifier::new(Box::new(StandardThinking::new()));
        let events = run(
            &mut classifier,
            &[
                "I will look it up to",
                "= >",
                ">weather>>get>>{\"city\":\"Tokyo\"}>> shortly",
            ],
        );
        let content = content_of(&events);
        assert!(!content.contains(">>"));
        assert_eq!(content, "I will look it up  shortly");
        assert_weather_call(&events);
    }

    #[test]
    fn split_bare_json_never_reaches_content() {
        let mut classifier = TokenClassifier::new(Box::new(StandardThinking::new()));
        let events = run(
            &mut classifier,
            &[
                "Sure. {\"type\":\"tool_",
                "call\",\"server\":\"weather\",\"tool\":\"get\",\"args\":{\"city\":\"Tokyo\"}} Done.",
            ],
        );
        assert_eq!(content_of(&events), "Sure.  Done.");
        assert_weather_call(&events);
    }

    #[test]
    fn reordered_tool_call_json_never_reaches_content() {
        let mut classifier = TokenClassifier::new(Box::new(StandardThinking::new()));
        let events = run(
            &mut classifier,
            &[
                "Sure. {\"server\":\"wea",
                "ther\",\"tool\":\"get\",\"type\":\"tool_call\",\"args\":{\"city\":\"Tokyo\"}}",
            ],
        );
        let content = content_of(&events);
        assert!(!content.contains('{'));
        assert!(!content.contains("tool_call"));
        assert_eq!(content, "Sure. ");
        assert_eq!(classifier.visible_text(), "Sure. ");
        assert_weather_call(&events);
    }

    #[test]
    fn ordinary_json_is_released_once_closed() {
        let mut classifier = TokenClassifier::new(Box::new(StandardThinking::new()));
        let held = classifier.push(&ModelDelta::content("Config: {\"a\":"));
        assert_eq!(content_of(&held), "Config: ");
        let mut events = held;
        events.extend(run(&mut classifier, &["1} ok. fn main() {"]));
        assert_eq!(content_of(&events), "Config: {\"a\":1} ok. fn main() {");
        assert!(calls_of(&events).is_empty());
    }

    #[test]
    fn thinking_is_framed_and_closed_on_done() {
        let mut classifier = TokenClassifier::new(Box::new(DeepSeekReasoning::new()));
        let mut events = classifier.push(&ModelDelta::thinking("let me think"));
        events.extend(classifier.push(&ModelDelta::done()));
        assert_eq!(
            events,
            vec![
                StreamEvent::ThinkingStart {
                    mode: ThinkingMode::Deepseek
                },
                StreamEvent::thinking("let me think"),
                StreamEvent::ThinkingEnd,
                StreamEvent::StreamComplete,
            ]
        );
    }

    #[test]
    fn interleaved_thinking_produces_multiple_regions() {
        let mut classifier = TokenClassifier::new(Box::new(StandardThinking::new()));
        let events = run(&mut classifier, &["<think>a</think>b<think>c</think>d"]);
        let starts = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::ThinkingStart { .. }))
            .count();
        let ends = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::ThinkingEnd))
            .count();
        assert_eq!(starts, 2);
        assert_eq!(ends, 2);
        assert_eq!(content_of(&events), "bd");
    }

    #[test]
    fn call_inside_thinking_is_reported() {
        let mut classifier = TokenClassifier::new(Box::new(StandardThinking::new()));
        let events = run(
            &mut classifier,
            &["<think>I should call <tool_call>{\"server\":\"s\",\"tool\":\"t\"}</tool_call></think>"],
        );
        assert_eq!(calls_of(&events).len(), 1);
        assert_eq!(content_of(&events), "");
    }

    #[test]
    fn repeated_call_is_reported_once() {
        let mut classifier = TokenClassifier::new(Box::new(StandardThinking::new()));
        let call = "<tool_call>{\"server\":\"s\",\"tool\":\"t\",\"args\":{\"a\":1}}</tool_call>";
        let events = run(&mut classifier, &[call, call]);
        assert_eq!(calls_of(&events).len(), 1);
    }

    #[test]
    fn unclosed_instruction_is_cleaned_at_done() {
        let mut classifier = TokenClassifier::new(Box::new(StandardThinking::new()));
        let events = run(&mut classifier, &["Answer: <use_mcp_tool><server_name>x"]);
        assert_eq!(content_of(&events), "Answer: ");
        assert!(calls_of(&events).is_empty());
    }

    #[test]
    fn reset_allows_reuse() {
        let mut classifier = TokenClassifier::new(Box::new(StandardThinking::new()));
        let _ = run(&mut classifier, &["<think>x", "y"]);
        assert!(classifier.is_finished());
        classifier.reset();
        classifier.reset();
        let events = run(&mut classifier, &["hello"]);
        assert_eq!(content_of(&events), "hello");
        assert_eq!(classifier.visible_text(), "hello");
    }
}
