use serde::{Deserialize, Serialize};

use crate::ParsedToolCall;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingMode {
    Standard,
    Deepseek,
    Ollama,
    ChainOfThought,
}

impl ThinkingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ThinkingMode::Standard => "standard",
            ThinkingMode::Deepseek => "deepseek",
            ThinkingMode::Ollama => "ollama",
            ThinkingMode::ChainOfThought => "chain_of_thought",
        }
    }
}

/// Canonical event emitted by the token classifier, in arrival order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    ThinkingStart {
        mode: ThinkingMode,
    },
    ThinkingToken {
        content: String,
    },
    ThinkingEnd,
    ContentToken {
        content: String,
    },
    ToolCall {
        raw: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        parsed: Option<ParsedToolCall>,
    },
    StreamComplete,
}

impl StreamEvent {
    pub fn content(text: impl Into<String>) -> Self {
        StreamEvent::ContentToken {
            content: text.into(),
        }
    }

    pub fn thinking(text: impl Into<String>) -> Self {
        StreamEvent::ThinkingToken {
            content: text.into(),
        }
    }

    pub fn is_visible_content(&self) -> bool {
        matches!(self, StreamEvent::ContentToken { content } if !content.trim().is_empty())
    }
}
