//! Vendor-specific separation of reasoning text from answer text.

use conduit_types::ThinkingMode;

use crate::ModelDelta;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Thinking(String),
    Content(String),
}

/// One implementation per vendor family. Strategies only split text; event
/// framing (start/end markers, tool detection) belongs to the classifier.
pub trait ThinkingStrategy: Send {
    fn mode(&self) -> ThinkingMode;
    fn reset(&mut self);
    fn process(&mut self, delta: &ModelDelta) -> Vec<Segment>;
    /// Flushes text held back while waiting for a possibly split tag.
    fn finish(&mut self) -> Vec<Segment>;
}

/// Inline `<tag>..</tag>` splitter that tolerates tags split across chunks.
#[derive(Debug, Clone)]
struct TagSplitter {
    pairs: &'static [(&'static str, &'static str)],
    open_pair: Option<usize>,
    pending: String,
}

impl TagSplitter {
    fn new(pairs: &'static [(&'static str, &'static str)]) -> Self {
        Self {
            pairs,
            open_pair: None,
            pending: String::new(),
        }
    }

    fn reset(&mut self) {
        self.open_pair = None;
        self.pending.clear();
    }

    fn push(&mut self, text: &str, out: &mut Vec<Segment>) {
        self.pending.push_str(text);
        loop {
            let lower = self.pending.to_ascii_lowercase();
            let found = match self.open_pair {
                Some(idx) => {
                    let close = self.pairs[idx].1;
                    lower.find(close).map(|pos| (pos, close.len(), None))
                }
                None => self
                    .pairs
                    .iter()
                    .enumerate()
                    .filter_map(|(idx, (open, _))| {
                        lower.find(open).map(|pos| (pos, open.len(), Some(idx)))
                    })
                    .min_by_key(|(pos, _, _)| *pos),
            };
            match found {
                Some((pos, tag_len, next)) => {
                    let before = self.pending[..pos].to_string();
                    self.emit(before, out);
                    self.pending.drain(..pos + tag_len);
                    self.open_pair = next;
                }
                None => {
                    let keep = self.partial_tag_len();
                    let cut = self.pending.len() - keep;
                    let head = self.pending[..cut].to_string();
                    self.emit(head, out);
                    self.pending.drain(..cut);
                    return;
                }
            }
        }
    }

    fn finish(&mut self, out: &mut Vec<Segment>) {
        let rest = std::mem::take(&mut self.pending);
        self.emit(rest, out);
    }

    fn emit(&self, text: String, out: &mut Vec<Segment>) {
        if text.is_empty() {
            return;
        }
        out.push(if self.open_pair.is_some() {
            Segment::Thinking(text)
        } else {
            Segment::Content(text)
        });
    }

    fn partial_tag_len(&self) -> usize {
        let bytes = self.pending.as_bytes();
        let candidates: Vec<&str> = match self.open_pair {
            Some(idx) => vec![self.pairs[idx].1],
            None => self.pairs.iter().map(|(open, _)| *open).collect(),
        };
        candidates
            .into_iter()
            .filter_map(|tag| {
                let tag = tag.as_bytes();
                (1..tag.len()).rev().find(|k| {
                    bytes.len() >= *k && bytes[bytes.len() - k..].eq_ignore_ascii_case(&tag[..*k])
                })
            })
            .max()
            .unwrap_or(0)
    }
}

const THINK_TAGS: &[(&str, &str)] = &[("<think>", "</think>")];
const DEEPSEEK_TAGS: &[(&str, &str)] = &[
    ("<reasoning>", "</reasoning>"),
    ("<think>", "</think>"),
];

fn split_delta(splitter: &mut TagSplitter, delta: &ModelDelta) -> Vec<Segment> {
    let mut out = Vec::new();
    if let Some(thinking) = delta.thinking.as_deref().filter(|t| !t.is_empty()) {
        out.push(Segment::Thinking(thinking.to_string()));
    }
    if let Some(content) = delta.content.as_deref().filter(|c| !c.is_empty()) {
        splitter.push(content, &mut out);
    }
    out
}

/// Inline `<think>` tags inside the content stream.
pub struct StandardThinking {
    splitter: TagSplitter,
}

impl StandardThinking {
    pub fn new() -> Self {
        Self {
            splitter: TagSplitter::new(THINK_TAGS),
        }
    }
}

impl Default for StandardThinking {
    fn default() -> Self {
        Self::new()
    }
}

impl ThinkingStrategy for StandardThinking {
    fn mode(&self) -> ThinkingMode {
        ThinkingMode::Standard
    }

    fn reset(&mut self) {
        self.splitter.reset();
    }

    fn process(&mut self, delta: &ModelDelta) -> Vec<Segment> {
        split_delta(&mut self.splitter, delta)
    }

    fn finish(&mut self) -> Vec<Segment> {
        let mut out = Vec::new();
        self.splitter.finish(&mut out);
        out
    }
}

/// Dedicated `reasoning_content` deltas first, then `<reasoning>` or `<think>` tags.
pub struct DeepSeekReasoning {
    splitter: TagSplitter,
}

impl DeepSeekReasoning {
    pub fn new() -> Self {
        Self {
            splitter: TagSplitter::new(DEEPSEEK_TAGS),
        }
    }
}

impl Default for DeepSeekReasoning {
    fn default() -> Self {
        Self::new()
    }
}

impl ThinkingStrategy for DeepSeekReasoning {
    fn mode(&self) -> ThinkingMode {
        ThinkingMode::Deepseek
    }

    fn reset(&mut self) {
        self.splitter.reset();
    }

    fn process(&mut self, delta: &ModelDelta) -> Vec<Segment> {
        split_delta(&mut self.splitter, delta)
    }

    fn finish(&mut self) -> Vec<Segment> {
        let mut out = Vec::new();
        self.splitter.finish(&mut out);
        out
    }
}

/// Native `message.thinking` field, with `<think>` tags as the compatibility form.
/// An opened tag with no close keeps everything as thinking until the stream ends.
pub struct OllamaThinking {
    splitter: TagSplitter,
}

impl OllamaThinking {
    pub fn new() -> Self {
        Self {
            splitter: TagSplitter::new(THINK_TAGS),
        }
    }
}

impl Default for OllamaThinking {
    fn default() -> Self {
        Self::new()
    }
}

impl ThinkingStrategy for OllamaThinking {
    fn mode(&self) -> ThinkingMode {
        ThinkingMode::Ollama
    }

    fn reset(&mut self) {
        self.splitter.reset();
    }

    fn process(&mut self, delta: &ModelDelta) -> Vec<Segment> {
        split_delta(&mut self.splitter, delta)
    }

    fn finish(&mut self) -> Vec<Segment> {
        let mut out = Vec::new();
        self.splitter.finish(&mut out);
        out
    }
}

pub fn strategy_for(provider_id: &str, model_id: &str) -> Box<dyn ThinkingStrategy> {
    if model_id.to_ascii_lowercase().contains("deepseek") {
        return Box::new(DeepSeekReasoning::new());
    }
    if provider_id.eq_ignore_ascii_case("ollama") {
        return Box::new(OllamaThinking::new());
    }
    Box::new(StandardThinking::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content(text: &str) -> ModelDelta {
        ModelDelta::content(text)
    }

    fn collect(strategy: &mut dyn ThinkingStrategy, chunks: &[&str]) -> Vec<Segment> {
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(strategy.process(&content(chunk)));
        }
        out.extend(strategy.finish());
        out
    }

    fn joined(segments: &[Segment]) -> (String, String) {
        let mut thinking = String::new();
        let mut body = String::new();
        for seg in segments {
            match seg {
                Segment::Thinking(t) => thinking.push_str(t),
                Segment::Content(c) => body.push_str(c),
            }
        }
        (thinking, body)
    }

    #[test]
    fn standard_splits_tags_across_chunks() {
        let mut strategy = StandardThinking::new();
        let segments = collect(&mut strategy, &["<thi", "nk>plan</th", "ink>answer"]);
        let (thinking, body) = joined(&segments);
        assert_eq!(thinking, "plan");
        assert_eq!(body, "answer");
    }

    #[test]
    fn deepseek_accepts_reasoning_tags_and_field() {
        let mut strategy = DeepSeekReasoning::new();
        let mut segments = strategy.process(&ModelDelta::thinking("field "));
        segments.extend(strategy.process(&content("<reasoning>tagged</reasoning>done")));
        let (thinking, body) = joined(&segments);
        assert_eq!(thinking, "field tagged");
        assert_eq!(body, "done");
    }

    #[test]
    fn ollama_open_tag_stays_thinking_until_finish() {
        let mut strategy = OllamaThinking::new();
        let segments = collect(&mut strategy, &["<think>still going", " and going"]);
        assert!(segments.iter().all(|s| matches!(s, Segment::Thinking(_))));
    }

    #[test]
    fn no_token_is_dropped_for_lookalike_prefix() {
        let mut strategy = StandardThinking::new();
        let segments = collect(&mut strategy, &["a <b> c <th", "ing"]);
        let (_, body) = joined(&segments);
        assert_eq!(body, "a <b> c <thing");
    }

    #[test]
    fn factory_selects_by_model_and_provider() {
        assert_eq!(strategy_for("openai", "deepseek-r1").mode(), ThinkingMode::Deepseek);
        assert_eq!(strategy_for("ollama", "qwen3").mode(), ThinkingMode::Ollama);
        assert_eq!(strategy_for("openai", "gpt-4o").mode(), ThinkingMode::Standard);
    }
}
