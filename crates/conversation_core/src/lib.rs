//! Realtime conversation synchronization core.
//!
//! Keeps a causally ordered, deduplicated view of one chat conversation while
//! optimistic local mutations and an unordered, at-least-once realtime feed
//! both mutate it. All mutation funnels through one serialized queue per
//! conversation (see [`session`]).

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use shared::{
    domain::{ConversationId, Message, MessageId, TypingSignal, UserId},
    protocol::{RealtimeEvent, SendMessageRequest},
};

pub mod config;
pub mod error;
pub mod ingestor;
pub mod memory;
pub mod pagination;
pub mod presence;
pub mod reactions;
pub mod retry;
pub mod selection;
pub mod session;
pub mod state;
pub mod store;
pub mod tracker;
pub mod transport;

pub use config::{load_settings, SyncSettings};
pub use error::{MutationOperation, SyncError, UserNotice};
pub use session::{ConversationEvent, ConversationHandle, ConversationSession};
pub use state::{ConversationSnapshot, ConversationState};

/// Persisted realtime feed for one conversation. Dropping it unsubscribes.
pub type RealtimeFeed = BoxStream<'static, RealtimeEvent>;

/// Ephemeral typing feed for one conversation. Dropping it unsubscribes.
pub type TypingFeed = BoxStream<'static, TypingUpdate>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypingUpdate {
    Started(TypingSignal),
    Stopped(UserId),
}

/// Remote collaborator that owns persistence, authorization and the realtime
/// feeds. The acting user is implied by the implementation's session.
#[async_trait]
pub trait BackendDataService: Send + Sync {
    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        request: SendMessageRequest,
    ) -> Result<Message>;
    async fn edit_message(&self, message_id: &MessageId, new_body: &str) -> Result<()>;
    async fn delete_messages(&self, ids: &[MessageId]) -> Result<()>;
    async fn add_reaction(&self, message_id: &MessageId, emoji: &str) -> Result<()>;
    async fn remove_reaction(&self, message_id: &MessageId, emoji: &str) -> Result<()>;
    async fn fetch_page(
        &self,
        conversation_id: &ConversationId,
        before: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Message>>;
    async fn subscribe(&self, conversation_id: &ConversationId) -> Result<RealtimeFeed>;
    async fn broadcast_typing(
        &self,
        conversation_id: &ConversationId,
        update: TypingUpdate,
    ) -> Result<()>;
    async fn subscribe_typing(&self, conversation_id: &ConversationId) -> Result<TypingFeed>;
}

pub struct MissingBackendDataService;

#[async_trait]
impl BackendDataService for MissingBackendDataService {
    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        _request: SendMessageRequest,
    ) -> Result<Message> {
        Err(anyhow!(
            "backend unavailable for conversation {conversation_id}"
        ))
    }

    async fn edit_message(&self, message_id: &MessageId, _new_body: &str) -> Result<()> {
        Err(anyhow!("backend unavailable for message {message_id}"))
    }

    async fn delete_messages(&self, _ids: &[MessageId]) -> Result<()> {
        Err(anyhow!("backend unavailable"))
    }

    async fn add_reaction(&self, message_id: &MessageId, _emoji: &str) -> Result<()> {
        Err(anyhow!("backend unavailable for message {message_id}"))
    }

    async fn remove_reaction(&self, message_id: &MessageId, _emoji: &str) -> Result<()> {
        Err(anyhow!("backend unavailable for message {message_id}"))
    }

    async fn fetch_page(
        &self,
        conversation_id: &ConversationId,
        _before: Option<DateTime<Utc>>,
        _limit: u32,
    ) -> Result<Vec<Message>> {
        Err(anyhow!(
            "backend unavailable for conversation {conversation_id}"
        ))
    }

    async fn subscribe(&self, conversation_id: &ConversationId) -> Result<RealtimeFeed> {
        Err(anyhow!(
            "realtime feed unavailable for conversation {conversation_id}"
        ))
    }

    async fn broadcast_typing(
        &self,
        _conversation_id: &ConversationId,
        _update: TypingUpdate,
    ) -> Result<()> {
        Ok(())
    }

    async fn subscribe_typing(&self, conversation_id: &ConversationId) -> Result<TypingFeed> {
        Err(anyhow!(
            "typing feed unavailable for conversation {conversation_id}"
        ))
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod session_tests;

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod transport_tests;
