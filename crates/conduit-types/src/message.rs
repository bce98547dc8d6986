use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ThinkingMode, ToolCallResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl ConversationId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl MessageId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Key for per-tool failure tracking within one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FailKey {
    pub conversation: ConversationId,
    pub server: String,
    pub tool: String,
}

impl FailKey {
    pub fn new(conversation: &ConversationId, server: &str, tool: &str) -> Self {
        Self {
            conversation: conversation.clone(),
            server: server.to_string(),
            tool: tool.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Streaming,
    Completed,
    Stopped,
    Error,
}

impl MessageStatus {
    /// Externally-set states that stop any further orchestration of the message.
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Stopped | MessageStatus::Error)
    }
}

/// Write-only updates sent from the orchestrator to the UI/state layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageAction {
    ToolHit {
        card_id: String,
        server: String,
        tool: String,
        args: Value,
    },
    ToolResult {
        card_id: String,
        server: String,
        tool: String,
        result: ToolCallResult,
    },
    ThinkStart {
        mode: ThinkingMode,
    },
    ThinkAppend {
        content: String,
    },
    ThinkEnd,
    TokenAppend {
        content: String,
    },
    StreamEnd {
        status: MessageStatus,
    },
}
