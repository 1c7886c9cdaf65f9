use std::{future::Future, sync::Arc, time::Duration};

use chrono::Utc;
use shared::domain::{Attachment, ConversationId, Message, MessageId, Participant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

pub use crate::state::ConversationEvent;
use crate::{
    config::SyncSettings,
    error::{MutationOperation, SyncError},
    ingestor::{self, FeedInput, RealtimeSubscription},
    pagination::PageRequest,
    retry::RetryPolicy,
    state::{ConversationSnapshot, ConversationState},
    tracker::LocalId,
    BackendDataService, TypingUpdate,
};

const TICK_INTERVAL: Duration = Duration::from_secs(1);

type Reply<T> = oneshot::Sender<Result<T, SyncError>>;

/// Everything that mutates a conversation goes through this queue: user
/// intents, backend completions and feed input alike.
enum Command {
    SendText {
        body: String,
        reply_to_id: Option<MessageId>,
        reply: Reply<MessageId>,
    },
    SendAttachment {
        attachment: Attachment,
        caption: String,
        reply_to_id: Option<MessageId>,
        reply: Reply<MessageId>,
    },
    Edit {
        message_id: MessageId,
        body: String,
        reply: Reply<()>,
    },
    ToggleReaction {
        message_id: MessageId,
        emoji: String,
        reply: Reply<bool>,
    },
    EnterSelection {
        message_id: MessageId,
        reply: Reply<()>,
    },
    ToggleSelection {
        message_id: MessageId,
        reply: Reply<bool>,
    },
    CancelSelection {
        reply: Reply<()>,
    },
    ConfirmDelete {
        reply: Reply<()>,
    },
    DeleteSingle {
        message_id: MessageId,
        reply: Reply<()>,
    },
    LoadOlder {
        reply: Reply<usize>,
    },
    Reload {
        reply: Reply<usize>,
    },
    TypingKeystroke,
    Snapshot {
        reply: Reply<ConversationSnapshot>,
    },
    Shutdown,

    SendCompleted {
        local_id: LocalId,
        result: Result<Message, SyncError>,
        reply: Reply<MessageId>,
    },
    EditCompleted {
        local_id: LocalId,
        result: Result<(), SyncError>,
        reply: Reply<()>,
    },
    ReactionCompleted {
        added: bool,
        result: Result<(), SyncError>,
        reply: Reply<bool>,
    },
    DeleteCompleted {
        local_id: LocalId,
        result: Result<(), SyncError>,
        reply: Reply<()>,
    },
    PageLoaded {
        request: PageRequest,
        result: Result<Vec<Message>, SyncError>,
        reply: Option<Reply<usize>>,
    },
    Feed(FeedInput),
}

impl From<FeedInput> for Command {
    fn from(input: FeedInput) -> Self {
        Self::Feed(input)
    }
}

/// Single-writer actor owning one [`ConversationState`].
pub struct ConversationSession {
    state: ConversationState,
    backend: Arc<dyn BackendDataService>,
    settings: SyncSettings,
    events: broadcast::Sender<ConversationEvent>,
    commands: mpsc::WeakSender<Command>,
    subscription: Option<RealtimeSubscription>,
}

impl ConversationSession {
    /// Start the actor and the realtime feeds. The first page is fetched once
    /// the persisted feed is subscribed, so nothing falls between the two.
    /// Must be called inside a tokio runtime.
    pub fn spawn(
        settings: SyncSettings,
        backend: Arc<dyn BackendDataService>,
        author: Participant,
        conversation_id: ConversationId,
    ) -> ConversationHandle {
        let (commands, rx) = mpsc::channel(settings.command_buffer.max(1));
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));

        let session = Self {
            state: ConversationState::new(&settings, conversation_id, author),
            backend,
            settings,
            events: events.clone(),
            commands: commands.downgrade(),
            subscription: None,
        };
        tokio::spawn(session.run(rx));

        ConversationHandle { commands, events }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let conversation_id = self.state.conversation_id().clone();
        info!(%conversation_id, "session: started");

        self.subscription = Some(RealtimeSubscription::start(
            Arc::clone(&self.backend),
            conversation_id.clone(),
            self.commands.clone(),
            RetryPolicy::default(),
        ));

        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    None | Some(Command::Shutdown) => break,
                    Some(command) => self.handle(command),
                },
                _ = tick.tick() => self.on_tick(),
            }
        }

        if let Some(mut subscription) = self.subscription.take() {
            subscription.stop();
        }
        info!(%conversation_id, "session: stopped");
    }

    fn emit(&self, events: Vec<ConversationEvent>) {
        for event in events {
            // No receivers is fine; views subscribe on demand.
            let _ = self.events.send(event);
        }
    }

    /// Run a backend call off the actor, bounded by the mutation timeout, and
    /// post its completion back to the queue.
    fn spawn_call<T, F>(
        &self,
        operation: MutationOperation,
        call: F,
        complete: impl FnOnce(Result<T, SyncError>) -> Command + Send + 'static,
    ) where
        T: Send + 'static,
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let Some(commands) = self.commands.upgrade() else {
            return;
        };
        let timeout = self.settings.mutation_timeout;
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, call).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(SyncError::from_backend(operation, &err)),
                Err(_) => Err(SyncError::Timeout { operation }),
            };
            if commands.send(complete(result)).await.is_err() {
                debug!(%operation, "session: completion dropped after shutdown");
            }
        });
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::SendText {
                body,
                reply_to_id,
                reply,
            } => self.send(body, reply_to_id, None, reply),
            Command::SendAttachment {
                attachment,
                caption,
                reply_to_id,
                reply,
            } => self.send(caption, reply_to_id, Some(attachment), reply),
            Command::Edit {
                message_id,
                body,
                reply,
            } => self.edit(message_id, body, reply),
            Command::ToggleReaction {
                message_id,
                emoji,
                reply,
            } => self.toggle_reaction(message_id, emoji, reply),
            Command::EnterSelection { message_id, reply } => {
                let result = self
                    .state
                    .enter_selection(&message_id)
                    .map(|events| self.emit(events));
                let _ = reply.send(result);
            }
            Command::ToggleSelection { message_id, reply } => {
                let result = self
                    .state
                    .toggle_selection(&message_id)
                    .map(|(selected, events)| {
                        self.emit(events);
                        selected
                    });
                let _ = reply.send(result);
            }
            Command::CancelSelection { reply } => {
                let events = self.state.cancel_selection();
                self.emit(events);
                let _ = reply.send(Ok(()));
            }
            Command::ConfirmDelete { reply } => {
                let started = self.state.begin_bulk_delete(Utc::now());
                self.delete(started, reply);
            }
            Command::DeleteSingle { message_id, reply } => {
                let started = self.state.begin_single_delete(&message_id, Utc::now());
                self.delete(started, reply);
            }
            Command::LoadOlder { reply } => match self.state.begin_load_older() {
                Some(request) => self.fetch_page(request, Some(reply)),
                None => {
                    let _ = reply.send(Ok(0));
                }
            },
            Command::Reload { reply } => {
                let request = self.state.begin_reload();
                self.emit(vec![ConversationEvent::MessagesChanged]);
                self.fetch_page(request, Some(reply));
            }
            Command::TypingKeystroke => {
                if let Some(update) = self.state.typing_keystroke(Utc::now()) {
                    self.broadcast_typing(update);
                }
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(Ok(self.state.snapshot(Utc::now())));
            }
            Command::Shutdown => {}

            Command::SendCompleted {
                local_id,
                result,
                reply,
            } => {
                let (result, events) = self.state.complete_send(local_id, result);
                self.emit(events);
                let _ = reply.send(result);
            }
            Command::EditCompleted {
                local_id,
                result,
                reply,
            } => {
                let (result, events) = self.state.complete_edit(local_id, result, Utc::now());
                self.emit(events);
                let _ = reply.send(result);
            }
            Command::ReactionCompleted {
                added,
                result,
                reply,
            } => {
                let (result, events) = self.state.complete_reaction(result);
                self.emit(events);
                let _ = reply.send(result.map(|()| added));
            }
            Command::DeleteCompleted {
                local_id,
                result,
                reply,
            } => {
                let (result, events) = self.state.complete_delete(local_id, result, Utc::now());
                self.emit(events);
                let _ = reply.send(result);
            }
            Command::PageLoaded {
                request,
                result,
                reply,
            } => {
                let (result, mut events) = self.state.complete_page(request, result);
                if request.before.is_none() {
                    events.extend(self.state.prune_selection());
                }
                self.emit(events);
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            Command::Feed(input) => self.on_feed(input),
        }
    }

    fn send(
        &mut self,
        body: String,
        reply_to_id: Option<MessageId>,
        attachment: Option<Attachment>,
        reply: Reply<MessageId>,
    ) {
        let started = self
            .state
            .begin_send(body, reply_to_id, attachment, Utc::now());
        let (outbound, events) = match started {
            Ok(started) => started,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };
        self.emit(events);
        if outbound.typing_stopped {
            self.broadcast_typing(TypingUpdate::Stopped(self.state.self_id().clone()));
        }

        let backend = Arc::clone(&self.backend);
        let conversation_id = self.state.conversation_id().clone();
        let local_id = outbound.local_id;
        self.spawn_call(
            MutationOperation::Send,
            async move {
                backend
                    .send_message(&conversation_id, outbound.request)
                    .await
            },
            move |result| Command::SendCompleted {
                local_id,
                result,
                reply,
            },
        );
    }

    fn edit(&mut self, message_id: MessageId, body: String, reply: Reply<()>) {
        let local_id = match self.state.begin_edit(&message_id, body.clone(), Utc::now()) {
            Ok(local_id) => local_id,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };
        let backend = Arc::clone(&self.backend);
        self.spawn_call(
            MutationOperation::Edit,
            async move { backend.edit_message(&message_id, &body).await },
            move |result| Command::EditCompleted {
                local_id,
                result,
                reply,
            },
        );
    }

    fn toggle_reaction(&mut self, message_id: MessageId, emoji: String, reply: Reply<bool>) {
        let intent = match self.state.reaction_intent(&message_id, &emoji) {
            Ok(intent) => intent,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };
        let backend = Arc::clone(&self.backend);
        let added = intent.add;
        self.spawn_call(
            MutationOperation::React,
            async move {
                if intent.add {
                    backend.add_reaction(&intent.message_id, &intent.emoji).await
                } else {
                    backend
                        .remove_reaction(&intent.message_id, &intent.emoji)
                        .await
                }
            },
            move |result| Command::ReactionCompleted {
                added,
                result,
                reply,
            },
        );
    }

    fn delete(
        &mut self,
        started: Result<(LocalId, Vec<MessageId>), SyncError>,
        reply: Reply<()>,
    ) {
        let (local_id, ids) = match started {
            Ok(started) => started,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };
        info!(%local_id, count = ids.len(), "delete: requested");
        let backend = Arc::clone(&self.backend);
        self.spawn_call(
            MutationOperation::Delete,
            async move { backend.delete_messages(&ids).await },
            move |result| Command::DeleteCompleted {
                local_id,
                result,
                reply,
            },
        );
    }

    fn fetch_page(&self, request: PageRequest, reply: Option<Reply<usize>>) {
        let backend = Arc::clone(&self.backend);
        let conversation_id = self.state.conversation_id().clone();
        self.spawn_call(
            MutationOperation::Paginate,
            async move {
                backend
                    .fetch_page(&conversation_id, request.before, request.limit)
                    .await
            },
            move |result| Command::PageLoaded {
                request,
                result,
                reply,
            },
        );
    }

    fn broadcast_typing(&self, update: TypingUpdate) {
        let backend = Arc::clone(&self.backend);
        let conversation_id = self.state.conversation_id().clone();
        tokio::spawn(async move {
            if let Err(err) = backend.broadcast_typing(&conversation_id, update).await {
                debug!(%conversation_id, "typing: broadcast failed: {err}");
            }
        });
    }

    fn on_feed(&mut self, input: FeedInput) {
        let now = Utc::now();
        match input {
            FeedInput::Subscribed { reconnect: false } => {
                let request = self.state.initial_request();
                self.fetch_page(request, None);
            }
            FeedInput::Subscribed { reconnect: true } => {
                warn!(
                    conversation_id = %self.state.conversation_id(),
                    "realtime: reconnected, reloading window"
                );
                let request = self.state.begin_reload();
                self.emit(vec![ConversationEvent::MessagesChanged]);
                self.fetch_page(request, None);
            }
            FeedInput::Realtime(event) => {
                let events = ingestor::ingest(&mut self.state, event, now);
                self.emit(events);
            }
            FeedInput::Typing(update) => {
                let events = self.state.receive_typing(update, now);
                self.emit(events);
            }
        }
    }

    fn on_tick(&mut self) {
        let outcome = self.state.tick(Utc::now());
        self.emit(outcome.events);
        if outcome.broadcast_stop {
            self.broadcast_typing(TypingUpdate::Stopped(self.state.self_id().clone()));
        }
    }
}

/// Cloneable front door to a running [`ConversationSession`].
#[derive(Clone)]
pub struct ConversationHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ConversationEvent>,
}

impl ConversationHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| SyncError::SessionClosed)?;
        rx.await.map_err(|_| SyncError::SessionClosed)?
    }

    /// Resolves once the backend confirmed the message or it was rolled back.
    /// The provisional copy is visible as soon as the call is queued.
    pub async fn send_text(
        &self,
        body: impl Into<String>,
        reply_to_id: Option<MessageId>,
    ) -> Result<MessageId, SyncError> {
        let body = body.into();
        self.request(|reply| Command::SendText {
            body,
            reply_to_id,
            reply,
        })
        .await
    }

    pub async fn send_attachment(
        &self,
        attachment: Attachment,
        caption: impl Into<String>,
        reply_to_id: Option<MessageId>,
    ) -> Result<MessageId, SyncError> {
        let caption = caption.into();
        self.request(|reply| Command::SendAttachment {
            attachment,
            caption,
            reply_to_id,
            reply,
        })
        .await
    }

    pub async fn edit(
        &self,
        message_id: MessageId,
        body: impl Into<String>,
    ) -> Result<(), SyncError> {
        let body = body.into();
        self.request(|reply| Command::Edit {
            message_id,
            body,
            reply,
        })
        .await
    }

    /// Returns `true` when the reaction was added, `false` when removed. The
    /// visible counts change only once the feed reports it.
    pub async fn toggle_reaction(
        &self,
        message_id: MessageId,
        emoji: impl Into<String>,
    ) -> Result<bool, SyncError> {
        let emoji = emoji.into();
        self.request(|reply| Command::ToggleReaction {
            message_id,
            emoji,
            reply,
        })
        .await
    }

    pub async fn enter_selection(&self, message_id: MessageId) -> Result<(), SyncError> {
        self.request(|reply| Command::EnterSelection { message_id, reply })
            .await
    }

    pub async fn toggle_selection(&self, message_id: MessageId) -> Result<bool, SyncError> {
        self.request(|reply| Command::ToggleSelection { message_id, reply })
            .await
    }

    pub async fn cancel_selection(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::CancelSelection { reply }).await
    }

    pub async fn confirm_delete(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::ConfirmDelete { reply }).await
    }

    pub async fn delete_single(&self, message_id: MessageId) -> Result<(), SyncError> {
        self.request(|reply| Command::DeleteSingle { message_id, reply })
            .await
    }

    /// Number of newly merged messages; `0` when history is exhausted or a
    /// load is already running.
    pub async fn load_older(&self) -> Result<usize, SyncError> {
        self.request(|reply| Command::LoadOlder { reply }).await
    }

    pub async fn reload(&self) -> Result<usize, SyncError> {
        self.request(|reply| Command::Reload { reply }).await
    }

    pub async fn typing_keystroke(&self) -> Result<(), SyncError> {
        self.commands
            .send(Command::TypingKeystroke)
            .await
            .map_err(|_| SyncError::SessionClosed)
    }

    pub async fn snapshot(&self) -> Result<ConversationSnapshot, SyncError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConversationEvent> {
        self.events.subscribe()
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}
