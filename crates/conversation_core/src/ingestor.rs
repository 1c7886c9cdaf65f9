use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use shared::{
    domain::{ConversationId, Message, ReactionEvent, ReactionKind},
    protocol::{RealtimeEntity, RealtimeEvent, RealtimeOp},
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    retry::RetryPolicy,
    state::{ConversationEvent, ConversationState},
    store::UpsertOutcome,
    BackendDataService, TypingUpdate,
};

/// Input produced by the background feed tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedInput {
    /// The persisted feed is (re)established. On a reconnect, events may have
    /// been missed and the window must be reloaded.
    Subscribed { reconnect: bool },
    Realtime(RealtimeEvent),
    Typing(TypingUpdate),
}

/// Route one realtime event into the conversation state.
pub fn ingest(
    state: &mut ConversationState,
    event: RealtimeEvent,
    now: DateTime<Utc>,
) -> Vec<ConversationEvent> {
    if &event.conversation_id != state.conversation_id() {
        debug!(
            conversation_id = %event.conversation_id,
            "realtime: ignored event for another conversation"
        );
        return Vec::new();
    }

    match event.entity {
        RealtimeEntity::Message(message) => match event.op {
            RealtimeOp::Insert => ingest_insert(state, message),
            RealtimeOp::Update => ingest_update(state, message),
            RealtimeOp::Delete => ingest_delete(state, message, now),
        },
        RealtimeEntity::Reaction(reaction) => ingest_reaction(state, event.op, reaction, now),
    }
}

fn ingest_insert(state: &mut ConversationState, message: Message) -> Vec<ConversationEvent> {
    let mut events = Vec::new();
    let newest_before = state.newest_message_id();
    let message_id = message.id.clone();

    let provisional = if &message.sender_id == state.self_id() && !state.store.contains(&message.id)
    {
        state
            .store
            .find_provisional_match(&message, state.correlation_window())
    } else {
        None
    };

    let outcome = match provisional {
        Some(provisional_id) => {
            info!(
                %provisional_id,
                %message_id,
                "realtime: insert confirmed local send"
            );
            state.reconcile_from_feed(&provisional_id, message)
        }
        None => state.store.upsert(message),
    };

    if outcome == UpsertOutcome::Suppressed {
        debug!(%message_id, "realtime: insert suppressed");
    }
    if outcome.changed() {
        state.store_changed(newest_before, &mut events);
    }
    events
}

fn ingest_update(state: &mut ConversationState, message: Message) -> Vec<ConversationEvent> {
    let mut events = Vec::new();
    if !state.store.contains(&message.id) {
        // Updates outside the loaded window would extend it past the
        // pagination boundary.
        let inside_window = state
            .store
            .oldest_created_at()
            .map_or(true, |oldest| message.created_at >= oldest);
        if !inside_window {
            debug!(message_id = %message.id, "realtime: update outside loaded window ignored");
            return events;
        }
    }

    let newest_before = state.newest_message_id();
    if state.store.upsert(message).changed() {
        state.store_changed(newest_before, &mut events);
    }
    events
}

fn ingest_delete(
    state: &mut ConversationState,
    message: Message,
    now: DateTime<Utc>,
) -> Vec<ConversationEvent> {
    let mut events = Vec::new();
    let newest_before = state.newest_message_id();
    if state.store.remove(&message.id, now) {
        state.reactions.forget_message(&message.id);
        state.store_changed(newest_before, &mut events);
        events.extend(state.prune_selection());
    } else {
        debug!(message_id = %message.id, "realtime: delete tombstoned unknown id");
    }
    events
}

fn ingest_reaction(
    state: &mut ConversationState,
    op: RealtimeOp,
    mut reaction: ReactionEvent,
    now: DateTime<Utc>,
) -> Vec<ConversationEvent> {
    // A row deletion always means the reaction went away.
    if op == RealtimeOp::Delete {
        reaction.kind = ReactionKind::Remove;
    }
    if state.store.is_tombstoned(&reaction.message_id) {
        return Vec::new();
    }
    if state.reactions.apply(&reaction, now) {
        vec![ConversationEvent::ReactionsChanged {
            message_id: reaction.message_id,
        }]
    } else {
        Vec::new()
    }
}

/// Background tasks that keep the persisted and typing feeds open and push
/// what they receive into the owning session's queue.
///
/// The tasks hold only a weak sender, so they end on their own once the
/// session is gone. Dropping the subscription aborts them.
#[derive(Debug)]
pub struct RealtimeSubscription {
    tasks: Vec<JoinHandle<()>>,
}

impl RealtimeSubscription {
    pub fn start<C>(
        backend: Arc<dyn BackendDataService>,
        conversation_id: ConversationId,
        sink: mpsc::WeakSender<C>,
        retry: RetryPolicy,
    ) -> Self
    where
        C: From<FeedInput> + Send + 'static,
    {
        let realtime = tokio::spawn(run_realtime_feed(
            Arc::clone(&backend),
            conversation_id.clone(),
            sink.clone(),
            retry,
        ));
        let typing = tokio::spawn(run_typing_feed(backend, conversation_id, sink, retry));
        Self {
            tasks: vec![realtime, typing],
        }
    }

    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }
}

impl Drop for RealtimeSubscription {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn deliver<C: From<FeedInput>>(sink: &mpsc::WeakSender<C>, input: FeedInput) -> bool {
    let Some(sender) = sink.upgrade() else {
        return false;
    };
    sender.send(C::from(input)).await.is_ok()
}

async fn run_realtime_feed<C>(
    backend: Arc<dyn BackendDataService>,
    conversation_id: ConversationId,
    sink: mpsc::WeakSender<C>,
    retry: RetryPolicy,
) where
    C: From<FeedInput> + Send + 'static,
{
    let mut attempt = 0_u32;
    let mut connected_before = false;

    loop {
        if sink.upgrade().is_none() {
            return;
        }
        match backend.subscribe(&conversation_id).await {
            Ok(mut feed) => {
                attempt = 0;
                info!(%conversation_id, reconnect = connected_before, "realtime: subscribed");
                let subscribed = FeedInput::Subscribed {
                    reconnect: connected_before,
                };
                if !deliver(&sink, subscribed).await {
                    return;
                }
                connected_before = true;
                while let Some(event) = feed.next().await {
                    if !deliver(&sink, FeedInput::Realtime(event)).await {
                        return;
                    }
                }
                warn!(%conversation_id, "realtime: feed closed");
            }
            Err(err) => warn!(%conversation_id, attempt, "realtime: subscribe failed: {err}"),
        }
        let delay = retry.delay_for_attempt(attempt);
        attempt = attempt.saturating_add(1);
        tokio::time::sleep(delay).await;
    }
}

async fn run_typing_feed<C>(
    backend: Arc<dyn BackendDataService>,
    conversation_id: ConversationId,
    sink: mpsc::WeakSender<C>,
    retry: RetryPolicy,
) where
    C: From<FeedInput> + Send + 'static,
{
    let mut attempt = 0_u32;

    loop {
        if sink.upgrade().is_none() {
            return;
        }
        match backend.subscribe_typing(&conversation_id).await {
            Ok(mut feed) => {
                attempt = 0;
                while let Some(update) = feed.next().await {
                    if !deliver(&sink, FeedInput::Typing(update)).await {
                        return;
                    }
                }
                debug!(%conversation_id, "typing: feed closed");
            }
            Err(err) => debug!(%conversation_id, attempt, "typing: subscribe failed: {err}"),
        }
        let delay = retry.delay_for_attempt(attempt);
        attempt = attempt.saturating_add(1);
        tokio::time::sleep(delay).await;
    }
}
