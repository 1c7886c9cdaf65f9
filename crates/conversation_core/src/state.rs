use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use shared::{
    domain::{Attachment, ConversationId, Message, MessageId, Participant, TypingSignal, UserId},
    protocol::SendMessageRequest,
};
use tracing::{debug, info, warn};

use crate::{
    config::SyncSettings,
    error::{MutationOperation, SyncError, UserNotice},
    pagination::{ConversationWindow, PageRequest, PaginationController},
    presence::{TypingBroadcaster, TypingRoster},
    reactions::{ReactionAggregator, ReactionSnapshot},
    selection::SelectionCoordinator,
    store::{ConversationStore, UpsertOutcome},
    tracker::{LocalId, MutationPayload, MutationTracker},
    TypingUpdate,
};

/// Observable changes, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationEvent {
    MessagesChanged,
    /// The newest message changed; views should scroll to it.
    NewestChanged,
    /// Older history was merged; views must keep their scroll position.
    HistoryPrepended { count: usize },
    ReactionsChanged { message_id: MessageId },
    TypingChanged { description: Option<String> },
    SelectionChanged { active: bool, selected: Vec<MessageId> },
    Notice(UserNotice),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSnapshot {
    pub messages: Vec<Message>,
    pub reactions: BTreeMap<MessageId, ReactionSnapshot>,
    pub window: ConversationWindow,
    pub selection_active: bool,
    pub selected: Vec<MessageId>,
    pub typing: Option<String>,
    pub pending_mutations: usize,
}

#[derive(Debug, Clone)]
pub struct OutboundSend {
    pub local_id: LocalId,
    pub provisional_id: MessageId,
    pub request: SendMessageRequest,
    /// The send ended a typing burst; peers should be told it stopped.
    pub typing_stopped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionIntent {
    pub message_id: MessageId,
    pub emoji: String,
    pub add: bool,
}

/// Result of a timer tick.
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub events: Vec<ConversationEvent>,
    pub broadcast_stop: bool,
}

/// Everything the client knows about one conversation.
///
/// Pure and synchronous: every method is `(state, input) -> events`, so the
/// whole reconciliation logic is testable without a runtime. Components are
/// only reachable through these methods.
#[derive(Debug, Clone)]
pub struct ConversationState {
    conversation_id: ConversationId,
    author: Participant,
    correlation_window: std::time::Duration,
    pub(crate) store: ConversationStore,
    pub(crate) reactions: ReactionAggregator,
    tracker: MutationTracker,
    pagination: PaginationController,
    selection: SelectionCoordinator,
    typing_out: TypingBroadcaster,
    typing_in: TypingRoster,
    /// Sends the realtime feed confirmed before their response arrived.
    feed_confirmed: HashMap<LocalId, MessageId>,
}

impl ConversationState {
    pub fn new(
        settings: &SyncSettings,
        conversation_id: ConversationId,
        author: Participant,
    ) -> Self {
        let self_id = author.user_id.clone();
        Self {
            correlation_window: settings.correlation_window,
            store: ConversationStore::new(settings.tombstone_ttl),
            reactions: ReactionAggregator::new(self_id.clone(), settings.tombstone_ttl),
            tracker: MutationTracker::new(conversation_id.clone(), author.clone()),
            pagination: PaginationController::new(settings.page_size),
            selection: SelectionCoordinator::new(self_id.clone()),
            typing_out: TypingBroadcaster::new(
                author.clone(),
                settings.typing_timeout,
                settings.typing_throttle,
                settings.typing_idle,
            ),
            typing_in: TypingRoster::new(self_id, settings.typing_timeout),
            feed_confirmed: HashMap::new(),
            conversation_id,
            author,
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn self_id(&self) -> &UserId {
        &self.author.user_id
    }

    pub fn messages(&self) -> Vec<Message> {
        self.store.get_ordered()
    }

    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        self.store.get(id)
    }

    pub fn reactions_for(&self, id: &MessageId) -> ReactionSnapshot {
        self.reactions.snapshot(id)
    }

    pub fn tracker(&self) -> &MutationTracker {
        &self.tracker
    }

    pub fn window(&self) -> ConversationWindow {
        self.pagination.window()
    }

    pub fn selection(&self) -> &SelectionCoordinator {
        &self.selection
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> ConversationSnapshot {
        let messages = self.store.get_ordered();
        let reactions = messages
            .iter()
            .filter_map(|m| {
                let snapshot = self.reactions.snapshot(&m.id);
                (!snapshot.is_empty()).then(|| (m.id.clone(), snapshot))
            })
            .collect();
        ConversationSnapshot {
            messages,
            reactions,
            window: self.pagination.window(),
            selection_active: self.selection.is_active(),
            selected: self.selection.selected(),
            typing: self.typing_in.describe(now),
            pending_mutations: self.tracker.len(),
        }
    }

    fn newest_id(&self) -> Option<MessageId> {
        self.store.newest().map(|m| m.id.clone())
    }

    /// Emit store-change events for a mutation of the newest end of the
    /// conversation. History merges report through `HistoryPrepended` instead.
    pub(crate) fn store_changed(
        &self,
        newest_before: Option<MessageId>,
        events: &mut Vec<ConversationEvent>,
    ) {
        events.push(ConversationEvent::MessagesChanged);
        if self.newest_id() != newest_before {
            events.push(ConversationEvent::NewestChanged);
        }
    }

    fn selection_event(&self) -> ConversationEvent {
        ConversationEvent::SelectionChanged {
            active: self.selection.is_active(),
            selected: self.selection.selected(),
        }
    }

    fn notice(err: &SyncError, events: &mut Vec<ConversationEvent>) {
        if let Some(notice) = UserNotice::from_error(err) {
            events.push(ConversationEvent::Notice(notice));
        }
    }

    // --- send -----------------------------------------------------------

    pub fn begin_send(
        &mut self,
        body: String,
        reply_to_id: Option<MessageId>,
        attachment: Option<Attachment>,
        now: DateTime<Utc>,
    ) -> Result<(OutboundSend, Vec<ConversationEvent>), SyncError> {
        let (local_id, provisional) =
            self.tracker
                .begin_send(body, reply_to_id, attachment, now)?;
        self.tracker.mark_in_flight(local_id)?;

        let request = SendMessageRequest {
            sender_id: provisional.sender_id.clone(),
            body: provisional.body.clone(),
            reply_to_id: provisional.reply_to_id.clone(),
            attachment: provisional.attachment.clone(),
            client_token: provisional.client_token.clone(),
        };
        let provisional_id = provisional.id.clone();

        let newest_before = self.newest_id();
        self.store.upsert(provisional);
        let mut events = Vec::new();
        self.store_changed(newest_before, &mut events);
        let typing_stopped = self.typing_out.on_message_sent();

        info!(
            conversation_id = %self.conversation_id,
            %local_id,
            provisional_id = %provisional_id,
            "send: provisional message inserted"
        );
        Ok((
            OutboundSend {
                local_id,
                provisional_id,
                request,
                typing_stopped,
            },
            events,
        ))
    }

    /// Reconcile a send with the backend's answer. Returns the confirmed id on
    /// success.
    pub fn complete_send(
        &mut self,
        local_id: LocalId,
        result: Result<Message, SyncError>,
    ) -> (Result<MessageId, SyncError>, Vec<ConversationEvent>) {
        let mut events = Vec::new();
        let newest_before = self.newest_id();

        match result {
            Ok(confirmed) => {
                let confirmed_id = confirmed.id.clone();
                self.feed_confirmed.remove(&local_id);
                let outcome = match self.tracker.confirm(local_id) {
                    Ok(mutation) => match mutation.payload {
                        MutationPayload::Send { provisional_id, .. } => {
                            self.store.replace_provisional(&provisional_id, confirmed)
                        }
                        _ => self.store.upsert(confirmed),
                    },
                    // Already reconciled by the realtime feed.
                    Err(_) => self.store.upsert(confirmed),
                };
                if outcome.changed() {
                    self.store_changed(newest_before, &mut events);
                }
                info!(%local_id, message_id = %confirmed_id, "send: confirmed");
                (Ok(confirmed_id), events)
            }
            Err(err) => match self.tracker.fail(local_id) {
                Ok(mutation) => {
                    if let MutationPayload::Send { provisional_id, .. } = &mutation.payload {
                        if self.store.discard(provisional_id) {
                            self.store_changed(newest_before, &mut events);
                        }
                    }
                    warn!(%local_id, "send: rolled back after failure: {err}");
                    Self::notice(&err, &mut events);
                    (Err(err), events)
                }
                Err(_) => {
                    // The feed already delivered the confirmed copy; the late
                    // failure is moot.
                    debug!(%local_id, "send: failure after realtime confirmation ignored");
                    let confirmed = self.feed_confirmed.remove(&local_id).ok_or(err);
                    (confirmed, events)
                }
            },
        }
    }

    // --- edit -----------------------------------------------------------

    pub fn begin_edit(
        &mut self,
        message_id: &MessageId,
        new_body: String,
        now: DateTime<Utc>,
    ) -> Result<LocalId, SyncError> {
        let local_id = self
            .tracker
            .begin_edit(&self.store, message_id, new_body, now)?;
        self.tracker.mark_in_flight(local_id)?;
        Ok(local_id)
    }

    pub fn complete_edit(
        &mut self,
        local_id: LocalId,
        result: Result<(), SyncError>,
        now: DateTime<Utc>,
    ) -> (Result<(), SyncError>, Vec<ConversationEvent>) {
        let mut events = Vec::new();
        match result {
            Ok(()) => {
                let mutation = match self.tracker.confirm(local_id) {
                    Ok(mutation) => mutation,
                    Err(err) => return (Err(err), events),
                };
                if let MutationPayload::Edit {
                    message_id,
                    new_body,
                } = mutation.payload
                {
                    if let Some(mut message) = self.store.get(&message_id).cloned() {
                        message.body = new_body;
                        message.is_edited = true;
                        message.edited_at = Some(now.max(message.revision_at()));
                        let newest_before = self.newest_id();
                        if self.store.upsert(message).changed() {
                            self.store_changed(newest_before, &mut events);
                        }
                    }
                }
                (Ok(()), events)
            }
            Err(err) => {
                let _ = self.tracker.fail(local_id);
                warn!(%local_id, "edit: failed: {err}");
                Self::notice(&err, &mut events);
                (Err(err), events)
            }
        }
    }

    // --- reactions ------------------------------------------------------

    /// Decide whether tapping `emoji` adds or removes the user's reaction.
    /// Reactions are not applied speculatively; the feed is the source of
    /// truth.
    pub fn reaction_intent(
        &self,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<ReactionIntent, SyncError> {
        if message_id.is_provisional() {
            return Err(SyncError::NotConfirmed(message_id.clone()));
        }
        if !self.store.contains(message_id) {
            return Err(SyncError::UnknownMessage(message_id.clone()));
        }
        Ok(ReactionIntent {
            message_id: message_id.clone(),
            emoji: emoji.to_string(),
            add: !self.reactions.self_has(message_id, emoji),
        })
    }

    pub fn complete_reaction(
        &mut self,
        result: Result<(), SyncError>,
    ) -> (Result<(), SyncError>, Vec<ConversationEvent>) {
        let mut events = Vec::new();
        if let Err(err) = &result {
            warn!("reaction: failed: {err}");
            Self::notice(err, &mut events);
        }
        (result, events)
    }

    // --- selection / delete --------------------------------------------

    fn owned_message(&self, message_id: &MessageId) -> Result<Message, SyncError> {
        self.store
            .get(message_id)
            .cloned()
            .ok_or_else(|| SyncError::UnknownMessage(message_id.clone()))
    }

    pub fn enter_selection(
        &mut self,
        message_id: &MessageId,
    ) -> Result<Vec<ConversationEvent>, SyncError> {
        let message = self.owned_message(message_id)?;
        self.selection.enter(&message)?;
        Ok(vec![self.selection_event()])
    }

    pub fn toggle_selection(
        &mut self,
        message_id: &MessageId,
    ) -> Result<(bool, Vec<ConversationEvent>), SyncError> {
        let message = self.owned_message(message_id)?;
        let selected = self.selection.toggle(&message)?;
        Ok((selected, vec![self.selection_event()]))
    }

    pub fn cancel_selection(&mut self) -> Vec<ConversationEvent> {
        self.selection.cancel();
        vec![self.selection_event()]
    }

    pub fn begin_bulk_delete(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<(LocalId, Vec<MessageId>), SyncError> {
        let ids = self.selection.begin_confirm()?;
        let local_id = self.tracker.begin_delete(ids.clone(), now);
        self.tracker.mark_in_flight(local_id)?;
        Ok((local_id, ids))
    }

    /// A single delete is a one-element bulk delete.
    pub fn begin_single_delete(
        &mut self,
        message_id: &MessageId,
        now: DateTime<Utc>,
    ) -> Result<(LocalId, Vec<MessageId>), SyncError> {
        let message = self.owned_message(message_id)?;
        self.selection.cancel();
        self.selection.enter(&message)?;
        self.begin_bulk_delete(now)
    }

    pub fn complete_delete(
        &mut self,
        local_id: LocalId,
        result: Result<(), SyncError>,
        now: DateTime<Utc>,
    ) -> (Result<(), SyncError>, Vec<ConversationEvent>) {
        let mut events = Vec::new();
        match result {
            Ok(()) => {
                let ids = match self.tracker.confirm(local_id) {
                    Ok(mutation) => match mutation.payload {
                        MutationPayload::Delete { ids } => ids,
                        _ => Vec::new(),
                    },
                    Err(err) => return (Err(err), events),
                };
                let newest_before = self.newest_id();
                let mut removed_any = false;
                for id in &ids {
                    removed_any |= self.store.remove(id, now);
                    self.reactions.forget_message(id);
                }
                if removed_any {
                    self.store_changed(newest_before, &mut events);
                }
                self.selection.on_delete_succeeded();
                events.push(self.selection_event());
                info!(%local_id, count = ids.len(), "delete: confirmed");
                (Ok(()), events)
            }
            Err(err) => {
                let _ = self.tracker.fail(local_id);
                self.selection.on_delete_failed();
                warn!(%local_id, "delete: failed, selection kept: {err}");
                Self::notice(&err, &mut events);
                events.push(self.selection_event());
                (Err(err), events)
            }
        }
    }

    // --- pagination -----------------------------------------------------

    pub fn begin_load_older(&mut self) -> Option<PageRequest> {
        self.pagination.next_request(&self.store)
    }

    /// Start a full reload: forget loaded history (keeping unconfirmed local
    /// sends and tombstones) and request the newest page.
    pub fn begin_reload(&mut self) -> PageRequest {
        let provisional: Vec<Message> = self
            .store
            .get_ordered()
            .into_iter()
            .filter(|m| m.id.is_provisional())
            .collect();
        self.store.clear();
        for message in provisional {
            self.store.upsert(message);
        }
        self.pagination.initial_request()
    }

    pub fn initial_request(&mut self) -> PageRequest {
        self.pagination.initial_request()
    }

    pub fn complete_page(
        &mut self,
        request: PageRequest,
        result: Result<Vec<Message>, SyncError>,
    ) -> (Result<usize, SyncError>, Vec<ConversationEvent>) {
        let mut events = Vec::new();
        let page = match result {
            Ok(page) => page,
            Err(err) => {
                if request.before.is_some() {
                    self.pagination.abort_older();
                }
                warn!(conversation_id = %self.conversation_id, "pagination: failed: {err}");
                Self::notice(&err, &mut events);
                return (Err(err), events);
            }
        };

        let older = request.before.is_some();
        let newest_before = self.newest_id();
        let merge = self.pagination.merge_page(&mut self.store, request, page);
        if merge.appended > 0 {
            if older {
                events.push(ConversationEvent::MessagesChanged);
                events.push(ConversationEvent::HistoryPrepended {
                    count: merge.appended,
                });
            } else {
                self.store_changed(newest_before, &mut events);
            }
        }
        (Ok(merge.appended), events)
    }

    // --- typing ---------------------------------------------------------

    pub fn typing_keystroke(&mut self, now: DateTime<Utc>) -> Option<TypingUpdate> {
        self.typing_out.on_keystroke(now).map(TypingUpdate::Started)
    }

    pub fn receive_typing(
        &mut self,
        update: TypingUpdate,
        now: DateTime<Utc>,
    ) -> Vec<ConversationEvent> {
        let changed = match update {
            TypingUpdate::Started(signal) => self.receive_signal(signal, now),
            TypingUpdate::Stopped(user_id) => self.typing_in.receive_stop(&user_id),
        };
        if changed {
            vec![ConversationEvent::TypingChanged {
                description: self.typing_in.describe(now),
            }]
        } else {
            Vec::new()
        }
    }

    fn receive_signal(&mut self, signal: TypingSignal, now: DateTime<Utc>) -> bool {
        if !signal.is_active(now) {
            return false;
        }
        self.typing_in.receive(signal, now)
    }

    pub fn tick(&mut self, now: DateTime<Utc>) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        let pruned = self.store.prune_tombstones(now);
        if pruned > 0 {
            debug!(pruned, "store: tombstones expired");
        }
        let forgotten = self.reactions.prune(now);
        if forgotten > 0 {
            debug!(forgotten, "reactions: ordering bookkeeping expired");
        }
        if self.typing_in.prune(now) > 0 {
            outcome.events.push(ConversationEvent::TypingChanged {
                description: self.typing_in.describe(now),
            });
        }
        outcome.broadcast_stop = self.typing_out.poll_idle(now);
        outcome
    }

    // --- realtime helpers used by the ingestor ---------------------------

    pub(crate) fn correlation_window(&self) -> std::time::Duration {
        self.correlation_window
    }

    /// Confirm the in-flight send whose provisional entry the feed just
    /// matched, so the later backend response is treated as already handled.
    pub(crate) fn reconcile_from_feed(
        &mut self,
        provisional_id: &MessageId,
        confirmed: Message,
    ) -> UpsertOutcome {
        if let Some(local_id) = self.tracker.pending_send_for(provisional_id) {
            match self.tracker.confirm(local_id) {
                Ok(_) => {
                    self.feed_confirmed.insert(local_id, confirmed.id.clone());
                }
                Err(err) => debug!(%local_id, "send: feed confirmation raced resolution: {err}"),
            }
        }
        self.store.replace_provisional(provisional_id, confirmed)
    }

    pub(crate) fn prune_selection(&mut self) -> Option<ConversationEvent> {
        if !self.selection.is_active() {
            return None;
        }
        let before = self.selection.selected();
        let store = &self.store;
        self.selection.retain_existing(|id| store.contains(id));
        (self.selection.selected() != before).then(|| self.selection_event())
    }

    pub(crate) fn newest_message_id(&self) -> Option<MessageId> {
        self.newest_id()
    }
}
