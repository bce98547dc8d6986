use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use conduit_types::{MessageAction, MessageId, MessageStatus};

/// Write-only sink for per-message UI updates.
pub trait MessageDispatcher: Send + Sync {
    fn dispatch(&self, message_id: &MessageId, action: MessageAction);
}

/// Forwards every action into an unbounded channel; a closed receiver drops actions.
#[derive(Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<(MessageId, MessageAction)>,
}

impl ChannelDispatcher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(MessageId, MessageAction)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl MessageDispatcher for ChannelDispatcher {
    fn dispatch(&self, message_id: &MessageId, action: MessageAction) {
        let _ = self.tx.send((message_id.clone(), action));
    }
}

/// Message states shared with the UI. The UI writes terminal states here and
/// the orchestrator checks them before every suspend point. Writing a
/// terminal state also cancels the token attached to that message, which
/// wakes anything the message is waiting on.
#[derive(Clone, Default)]
pub struct MessageStatusBoard {
    statuses: Arc<RwLock<HashMap<MessageId, MessageStatus>>>,
    tokens: Arc<RwLock<HashMap<MessageId, CancellationToken>>>,
}

impl MessageStatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ties `token` to the message; cancelled at once if the message already ended.
    pub async fn attach(&self, message_id: &MessageId, token: CancellationToken) {
        if self.is_terminal(message_id).await {
            token.cancel();
        }
        self.tokens.write().await.insert(message_id.clone(), token);
    }

    pub async fn set(&self, message_id: &MessageId, status: MessageStatus) {
        self.statuses
            .write()
            .await
            .insert(message_id.clone(), status);
        if status.is_terminal() {
            if let Some(token) = self.tokens.read().await.get(message_id) {
                token.cancel();
            }
        }
    }

    pub async fn get(&self, message_id: &MessageId) -> Option<MessageStatus> {
        self.statuses.read().await.get(message_id).copied()
    }

    pub async fn is_terminal(&self, message_id: &MessageId) -> bool {
        self.get(message_id)
            .await
            .is_some_and(MessageStatus::is_terminal)
    }

    pub async fn forget(&self, message_id: &MessageId) {
        self.statuses.write().await.remove(message_id);
        self.tokens.write().await.remove(message_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn only_stopped_and_error_are_terminal() {
        let board = MessageStatusBoard::new();
        let id = MessageId::from("m1");
        assert!(!board.is_terminal(&id).await);
        board.set(&id, MessageStatus::Streaming).await;
        assert!(!board.is_terminal(&id).await);
        board.set(&id, MessageStatus::Stopped).await;
        assert!(board.is_terminal(&id).await);
        board.forget(&id).await;
        assert_eq!(board.get(&id).await, None);
    }

    #[tokio::test]
    async fn terminal_status_cancels_attached_token() {
        let board = MessageStatusBoard::new();
        let id = MessageId::from("m1");
        let token = CancellationToken::new();
        board.attach(&id, token.clone()).await;
        board.set(&id, MessageStatus::Streaming).await;
        assert!(!token.is_cancelled());
        board.set(&id, MessageStatus::Stopped).await;
        assert!(token.is_cancelled());

        let late = CancellationToken::new();
        board.attach(&id, late.clone()).await;
        assert!(late.is_cancelled());
    }

    #[tokio::test]
    async fn channel_dispatcher_forwards_in_order() {
        let (dispatcher, mut rx) = ChannelDispatcher::new();
        let id = MessageId::from("m1");
        dispatcher.dispatch(&id, MessageAction::ThinkEnd);
        dispatcher.dispatch(
            &id,
            MessageAction::TokenAppend {
                content: "hi".to_string(),
            },
        );
        assert_eq!(rx.recv().await.map(|(_, a)| a), Some(MessageAction::ThinkEnd));
        assert!(matches!(
            rx.recv().await,
            Some((_, MessageAction::TokenAppend { .. }))
        ));
    }
}
