//! In-process backend used by the offline CLI mode and the test suite.
//!
//! One [`InMemoryBackend`] plays the server; each participant talks to it
//! through its own [`InMemoryClient`]. Faults (failures, latency, duplicate
//! or reordered delivery, dropped subscriptions) can be injected to exercise
//! reconciliation.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{future, StreamExt};
use shared::{
    domain::{
        ConversationId, Message, MessageId, MessageKind, Participant, ReactionEvent, ReactionKind,
        UserId,
    },
    error::{ApiError, ErrorCode},
    protocol::{RealtimeEvent, RealtimeOp, SendMessageRequest},
};
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, warn};

use crate::{BackendDataService, RealtimeFeed, TypingFeed, TypingUpdate};

const FEED_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallKind {
    Mutation,
    Fetch,
}

#[derive(Default)]
struct Faults {
    fail_next: u32,
    fail_next_fetch: u32,
    commit_delay: Duration,
    response_delay: Duration,
    duplicate_delivery: bool,
    feed_paused: bool,
    held: Vec<RealtimeEvent>,
}

struct HubState {
    messages: HashMap<MessageId, Message>,
    reactions: BTreeSet<(MessageId, UserId, String)>,
    next_id: u64,
    last_created_at: Option<DateTime<Utc>>,
    realtime: HashMap<ConversationId, broadcast::Sender<RealtimeEvent>>,
    typing: HashMap<ConversationId, broadcast::Sender<TypingUpdate>>,
    faults: Faults,
}

impl HubState {
    fn next_created_at(&mut self) -> DateTime<Utc> {
        let mut now = Utc::now();
        if let Some(last) = self.last_created_at {
            if now <= last {
                now = last + chrono::Duration::milliseconds(1);
            }
        }
        self.last_created_at = Some(now);
        now
    }

    fn realtime_sender(&mut self, conversation_id: &ConversationId) -> broadcast::Sender<RealtimeEvent> {
        self.realtime
            .entry(conversation_id.clone())
            .or_insert_with(|| broadcast::channel(FEED_CAPACITY).0)
            .clone()
    }

    fn typing_sender(&mut self, conversation_id: &ConversationId) -> broadcast::Sender<TypingUpdate> {
        self.typing
            .entry(conversation_id.clone())
            .or_insert_with(|| broadcast::channel(FEED_CAPACITY).0)
            .clone()
    }

    fn publish(&mut self, event: RealtimeEvent) {
        if self.faults.feed_paused {
            self.faults.held.push(event);
            return;
        }
        self.deliver(event);
    }

    fn deliver(&mut self, event: RealtimeEvent) {
        let sender = self.realtime_sender(&event.conversation_id);
        if self.faults.duplicate_delivery {
            let _ = sender.send(event.clone());
        }
        // No subscribers is fine; the event is persisted either way.
        let _ = sender.send(event);
    }

    fn take_failure(&mut self, kind: CallKind) -> bool {
        let remaining = match kind {
            CallKind::Mutation => &mut self.faults.fail_next,
            CallKind::Fetch => &mut self.faults.fail_next_fetch,
        };
        if *remaining > 0 {
            *remaining -= 1;
            return true;
        }
        false
    }
}

/// Shared in-memory server.
#[derive(Clone)]
pub struct InMemoryBackend {
    inner: Arc<Mutex<HubState>>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubState {
                messages: HashMap::new(),
                reactions: BTreeSet::new(),
                next_id: 1,
                last_created_at: None,
                realtime: HashMap::new(),
                typing: HashMap::new(),
                faults: Faults::default(),
            })),
        }
    }

    pub fn client_for(&self, participant: Participant) -> Arc<InMemoryClient> {
        Arc::new(InMemoryClient {
            hub: self.clone(),
            participant,
        })
    }

    /// Insert history directly, without publishing realtime events.
    pub async fn seed(&self, messages: impl IntoIterator<Item = Message>) {
        let mut state = self.inner.lock().await;
        for message in messages {
            if state.last_created_at.map_or(true, |last| message.created_at > last) {
                state.last_created_at = Some(message.created_at);
            }
            state.messages.insert(message.id.clone(), message);
        }
    }

    pub async fn message(&self, id: &MessageId) -> Option<Message> {
        self.inner.lock().await.messages.get(id).cloned()
    }

    pub async fn message_count(&self, conversation_id: &ConversationId) -> usize {
        self.inner
            .lock()
            .await
            .messages
            .values()
            .filter(|m| &m.conversation_id == conversation_id)
            .count()
    }

    /// Publish an arbitrary event on the realtime feed.
    pub async fn publish_raw(&self, event: RealtimeEvent) {
        self.inner.lock().await.publish(event);
    }

    /// Fail the next `count` mutations before they reach storage.
    pub async fn fail_next(&self, count: u32) {
        self.inner.lock().await.faults.fail_next = count;
    }

    pub async fn fail_next_fetch(&self, count: u32) {
        self.inner.lock().await.faults.fail_next_fetch = count;
    }

    pub async fn feed_subscribers(&self, conversation_id: &ConversationId) -> usize {
        self.inner
            .lock()
            .await
            .realtime
            .get(conversation_id)
            .map_or(0, |sender| sender.receiver_count())
    }

    pub async fn typing_subscribers(&self, conversation_id: &ConversationId) -> usize {
        self.inner
            .lock()
            .await
            .typing
            .get(conversation_id)
            .map_or(0, |sender| sender.receiver_count())
    }

    /// Delay between receiving a mutation and committing it.
    pub async fn set_commit_delay(&self, delay: Duration) {
        self.inner.lock().await.faults.commit_delay = delay;
    }

    /// Delay between committing a mutation and answering the caller.
    pub async fn set_response_delay(&self, delay: Duration) {
        self.inner.lock().await.faults.response_delay = delay;
    }

    pub async fn set_duplicate_delivery(&self, enabled: bool) {
        self.inner.lock().await.faults.duplicate_delivery = enabled;
    }

    /// Hold realtime events until [`resume_feed`](Self::resume_feed).
    pub async fn pause_feed(&self) {
        self.inner.lock().await.faults.feed_paused = true;
    }

    pub async fn resume_feed(&self) {
        self.release_held(false).await;
    }

    /// Release held events newest-first.
    pub async fn resume_feed_reversed(&self) {
        self.release_held(true).await;
    }

    async fn release_held(&self, reversed: bool) {
        let mut state = self.inner.lock().await;
        state.faults.feed_paused = false;
        let mut held = std::mem::take(&mut state.faults.held);
        if reversed {
            held.reverse();
        }
        for event in held {
            state.deliver(event);
        }
    }

    /// Close every open realtime subscription; events published until the
    /// clients resubscribe are lost to them.
    pub async fn drop_subscriptions(&self) {
        let mut state = self.inner.lock().await;
        state.realtime.clear();
        state.typing.clear();
        debug!("memory backend: subscriptions dropped");
    }

    /// Run server-side work on its own task so an impatient caller cannot
    /// cancel a commit, then apply the response delay. Delays only affect
    /// mutations.
    async fn run<T, F>(&self, kind: CallKind, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut HubState) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let committed = tokio::spawn(async move {
            let commit_delay = {
                let mut state = inner.lock().await;
                if state.take_failure(kind) {
                    bail!("injected backend failure");
                }
                match kind {
                    CallKind::Mutation => state.faults.commit_delay,
                    CallKind::Fetch => Duration::ZERO,
                }
            };
            if !commit_delay.is_zero() {
                tokio::time::sleep(commit_delay).await;
            }
            let mut state = inner.lock().await;
            work(&mut state)
        })
        .await
        .map_err(|err| anyhow!("backend task failed: {err}"))??;

        let response_delay = match kind {
            CallKind::Mutation => self.inner.lock().await.faults.response_delay,
            CallKind::Fetch => Duration::ZERO,
        };
        if !response_delay.is_zero() {
            tokio::time::sleep(response_delay).await;
        }
        Ok(committed)
    }
}

/// One participant's connection to an [`InMemoryBackend`].
pub struct InMemoryClient {
    hub: InMemoryBackend,
    participant: Participant,
}

impl InMemoryClient {
    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    pub fn backend(&self) -> &InMemoryBackend {
        &self.hub
    }

    async fn react(&self, message_id: &MessageId, emoji: &str, kind: ReactionKind) -> Result<()> {
        let message_id = message_id.clone();
        let emoji = emoji.to_string();
        let user_id = self.participant.user_id.clone();
        self.hub
            .run(CallKind::Mutation, move |state| {
                let conversation_id = state
                    .messages
                    .get(&message_id)
                    .map(|m| m.conversation_id.clone())
                    .ok_or_else(|| not_found(&message_id))?;
                let key = (message_id.clone(), user_id.clone(), emoji.clone());
                let changed = match kind {
                    ReactionKind::Remove => state.reactions.remove(&key),
                    _ => state.reactions.insert(key),
                };
                if !changed {
                    return Ok(());
                }
                let (op, kind) = match kind {
                    ReactionKind::Remove => (RealtimeOp::Delete, ReactionKind::Remove),
                    _ => (RealtimeOp::Insert, ReactionKind::Add),
                };
                state.publish(RealtimeEvent::reaction(
                    conversation_id,
                    op,
                    ReactionEvent {
                        message_id,
                        user_id,
                        emoji,
                        kind,
                    },
                ));
                Ok(())
            })
            .await
    }
}

#[async_trait]
impl BackendDataService for InMemoryClient {
    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        request: SendMessageRequest,
    ) -> Result<Message> {
        if request.sender_id != self.participant.user_id {
            return Err(ApiError::new(
                ErrorCode::Forbidden,
                "sender does not match the connected user",
            )
            .into());
        }
        let conversation_id = conversation_id.clone();
        let participant = self.participant.clone();
        self.hub
            .run(CallKind::Mutation, move |state| {
                let id = MessageId::new(format!("srv-{}", state.next_id));
                state.next_id += 1;
                let message = Message {
                    id: id.clone(),
                    conversation_id,
                    sender_id: participant.user_id,
                    sender_display_name: participant.display_name,
                    avatar_ref: participant.avatar_ref,
                    body: request.body,
                    kind: if request.attachment.is_some() {
                        MessageKind::Attachment
                    } else {
                        MessageKind::Text
                    },
                    created_at: state.next_created_at(),
                    edited_at: None,
                    is_edited: false,
                    reply_to_id: request.reply_to_id,
                    attachment: request.attachment,
                    client_token: request.client_token,
                };
                state.messages.insert(id, message.clone());
                state.publish(RealtimeEvent::message(RealtimeOp::Insert, message.clone()));
                Ok(message)
            })
            .await
    }

    async fn edit_message(&self, message_id: &MessageId, new_body: &str) -> Result<()> {
        let message_id = message_id.clone();
        let new_body = new_body.to_string();
        let user_id = self.participant.user_id.clone();
        self.hub
            .run(CallKind::Mutation, move |state| {
                let edited_at = state.next_created_at();
                let message = state
                    .messages
                    .get_mut(&message_id)
                    .ok_or_else(|| not_found(&message_id))?;
                if message.sender_id != user_id {
                    return Err(not_owner(&message_id));
                }
                message.body = new_body;
                message.is_edited = true;
                message.edited_at = Some(edited_at);
                let updated = message.clone();
                state.publish(RealtimeEvent::message(RealtimeOp::Update, updated));
                Ok(())
            })
            .await
    }

    async fn delete_messages(&self, ids: &[MessageId]) -> Result<()> {
        let ids = ids.to_vec();
        let user_id = self.participant.user_id.clone();
        self.hub
            .run(CallKind::Mutation, move |state| {
                for id in &ids {
                    let message = state
                        .messages
                        .get(id)
                        .ok_or_else(|| not_found(id))?;
                    if message.sender_id != user_id {
                        return Err(not_owner(id));
                    }
                }
                for id in ids {
                    if let Some(message) = state.messages.remove(&id) {
                        state.reactions.retain(|(message_id, _, _)| *message_id != id);
                        state.publish(RealtimeEvent::message(RealtimeOp::Delete, message));
                    }
                }
                Ok(())
            })
            .await
    }

    async fn add_reaction(&self, message_id: &MessageId, emoji: &str) -> Result<()> {
        self.react(message_id, emoji, ReactionKind::Add).await
    }

    async fn remove_reaction(&self, message_id: &MessageId, emoji: &str) -> Result<()> {
        self.react(message_id, emoji, ReactionKind::Remove).await
    }

    async fn fetch_page(
        &self,
        conversation_id: &ConversationId,
        before: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let conversation_id = conversation_id.clone();
        self.hub
            .run(CallKind::Fetch, move |state| {
                let mut page: Vec<Message> = state
                    .messages
                    .values()
                    .filter(|m| m.conversation_id == conversation_id)
                    .filter(|m| before.map_or(true, |before| m.created_at < before))
                    .cloned()
                    .collect();
                page.sort_by(|a, b| {
                    b.created_at
                        .cmp(&a.created_at)
                        .then_with(|| b.id.cmp(&a.id))
                });
                page.truncate(limit as usize);
                page.reverse();
                Ok(page)
            })
            .await
    }

    async fn subscribe(&self, conversation_id: &ConversationId) -> Result<RealtimeFeed> {
        let receiver = self
            .hub
            .inner
            .lock()
            .await
            .realtime_sender(conversation_id)
            .subscribe();
        Ok(until_lagged(receiver))
    }

    async fn broadcast_typing(
        &self,
        conversation_id: &ConversationId,
        update: TypingUpdate,
    ) -> Result<()> {
        let sender = self.hub.inner.lock().await.typing_sender(conversation_id);
        let _ = sender.send(update);
        Ok(())
    }

    async fn subscribe_typing(&self, conversation_id: &ConversationId) -> Result<TypingFeed> {
        let receiver = self
            .hub
            .inner
            .lock()
            .await
            .typing_sender(conversation_id)
            .subscribe();
        Ok(BroadcastStream::new(receiver)
            .filter_map(|item| async move { lagged_to_none(item) })
            .boxed())
    }
}

fn not_found(id: &MessageId) -> anyhow::Error {
    ApiError::new(ErrorCode::NotFound, format!("message {id} not found")).into()
}

fn not_owner(id: &MessageId) -> anyhow::Error {
    ApiError::new(ErrorCode::Forbidden, format!("message {id} belongs to another user")).into()
}

/// A lagged subscriber has missed persisted events, so its feed ends there
/// and the consumer resubscribes and reloads.
fn until_lagged(receiver: broadcast::Receiver<RealtimeEvent>) -> RealtimeFeed {
    BroadcastStream::new(receiver)
        .take_while(|item| {
            if let Err(BroadcastStreamRecvError::Lagged(skipped)) = item {
                warn!(skipped, "memory backend: realtime subscriber lagged, closing feed");
            }
            future::ready(item.is_ok())
        })
        .filter_map(|item| future::ready(item.ok()))
        .boxed()
}

/// Typing signals are ephemeral; a gap there needs no recovery.
fn lagged_to_none<T>(item: Result<T, BroadcastStreamRecvError>) -> Option<T> {
    match item {
        Ok(item) => Some(item),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            warn!(skipped, "memory backend: subscriber lagged");
            None
        }
    }
}
