use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::domain::{MessageId, ReactionEvent, ReactionKind, UserId};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReactionSummary {
    pub count: u32,
    pub self_reacted: bool,
}

pub type ReactionSnapshot = BTreeMap<String, ReactionSummary>;

type ReactionKey = (MessageId, UserId, String);

/// Folds the reaction event log into per-message emoji summaries.
///
/// Counts are derived from which users currently hold which emoji, so add and
/// remove events from different users commute. A remove that overtakes its add
/// is parked and cancels the add when it shows up. Both the parked removes and
/// the record of seen adds are kept for `memory` and then pruned.
#[derive(Debug, Clone)]
pub struct ReactionAggregator {
    self_id: UserId,
    memory: chrono::Duration,
    held: HashMap<MessageId, HashMap<UserId, BTreeSet<String>>>,
    observed_adds: HashMap<ReactionKey, DateTime<Utc>>,
    pending_removals: HashMap<ReactionKey, DateTime<Utc>>,
}

impl ReactionAggregator {
    pub fn new(self_id: UserId, memory: Duration) -> Self {
        Self {
            self_id,
            memory: chrono::Duration::from_std(memory).unwrap_or(chrono::Duration::MAX),
            held: HashMap::new(),
            observed_adds: HashMap::new(),
            pending_removals: HashMap::new(),
        }
    }

    /// Returns whether the visible state for `event.message_id` changed.
    pub fn apply(&mut self, event: &ReactionEvent, now: DateTime<Utc>) -> bool {
        match event.kind {
            ReactionKind::Add => self.add(event, now),
            ReactionKind::Remove => self.remove(event, now),
            ReactionKind::Replace => self.replace(event, now),
        }
    }

    /// Drop ordering bookkeeping older than `memory`. Held reactions are
    /// untouched.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let memory = self.memory;
        let before = self.observed_adds.len() + self.pending_removals.len();
        self.observed_adds.retain(|_, seen_at| now - *seen_at < memory);
        self.pending_removals.retain(|_, seen_at| now - *seen_at < memory);
        before - self.observed_adds.len() - self.pending_removals.len()
    }

    pub fn snapshot(&self, message_id: &MessageId) -> ReactionSnapshot {
        let mut snapshot = ReactionSnapshot::new();
        let Some(users) = self.held.get(message_id) else {
            return snapshot;
        };
        for (user_id, emojis) in users {
            for emoji in emojis {
                let summary = snapshot.entry(emoji.clone()).or_default();
                summary.count += 1;
                if *user_id == self.self_id {
                    summary.self_reacted = true;
                }
            }
        }
        snapshot
    }

    pub fn self_has(&self, message_id: &MessageId, emoji: &str) -> bool {
        self.held
            .get(message_id)
            .and_then(|users| users.get(&self.self_id))
            .is_some_and(|emojis| emojis.contains(emoji))
    }

    pub fn forget_message(&mut self, message_id: &MessageId) {
        self.held.remove(message_id);
        self.observed_adds.retain(|(id, _, _), _| id != message_id);
        self.pending_removals.retain(|(id, _, _), _| id != message_id);
    }

    fn key(event: &ReactionEvent) -> ReactionKey {
        (
            event.message_id.clone(),
            event.user_id.clone(),
            event.emoji.clone(),
        )
    }

    fn add(&mut self, event: &ReactionEvent, now: DateTime<Utc>) -> bool {
        let key = Self::key(event);
        if self.pending_removals.remove(&key).is_some() {
            debug!(
                message_id = %event.message_id,
                user_id = %event.user_id,
                "reactions: add cancelled by earlier out-of-order remove"
            );
            self.observed_adds.insert(key, now);
            return false;
        }
        self.observed_adds.insert(key, now);
        self.held
            .entry(event.message_id.clone())
            .or_default()
            .entry(event.user_id.clone())
            .or_default()
            .insert(event.emoji.clone())
    }

    fn remove(&mut self, event: &ReactionEvent, now: DateTime<Utc>) -> bool {
        let removed = self
            .held
            .get_mut(&event.message_id)
            .and_then(|users| users.get_mut(&event.user_id))
            .is_some_and(|emojis| emojis.remove(&event.emoji));
        if removed {
            self.prune_empty(&event.message_id, &event.user_id);
            return true;
        }

        let key = Self::key(event);
        if self.observed_adds.contains_key(&key) {
            // Duplicate delivery of a remove that was already applied.
            return false;
        }
        warn!(
            message_id = %event.message_id,
            user_id = %event.user_id,
            emoji = event.emoji.as_str(),
            "reactions: remove without matching add; count clamped at zero"
        );
        self.pending_removals.insert(key, now);
        false
    }

    fn replace(&mut self, event: &ReactionEvent, now: DateTime<Utc>) -> bool {
        let users = self.held.entry(event.message_id.clone()).or_default();
        let emojis = users.entry(event.user_id.clone()).or_default();
        let already_exact = emojis.len() == 1 && emojis.contains(&event.emoji);
        emojis.clear();
        emojis.insert(event.emoji.clone());

        self.pending_removals
            .retain(|(id, user, _), _| !(id == &event.message_id && user == &event.user_id));
        self.observed_adds.insert(Self::key(event), now);
        !already_exact
    }

    fn prune_empty(&mut self, message_id: &MessageId, user_id: &UserId) {
        if let Some(users) = self.held.get_mut(message_id) {
            if users.get(user_id).is_some_and(BTreeSet::is_empty) {
                users.remove(user_id);
            }
            if users.is_empty() {
                self.held.remove(message_id);
            }
        }
    }
}
