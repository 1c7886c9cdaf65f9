use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::domain::{Message, MessageId};
use tracing::debug;

/// Result of merging one message into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
    /// The id was tombstoned or the incoming copy is older than the local one.
    Suppressed,
}

impl UpsertOutcome {
    pub fn changed(self) -> bool {
        matches!(self, Self::Inserted | Self::Updated)
    }
}

#[derive(Debug, Clone)]
struct StoredEntry {
    message: Message,
    seq: u64,
}

impl StoredEntry {
    fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.message.created_at, self.seq)
    }
}

/// Canonical ordered, deduplicated message list for one conversation.
///
/// Ordering is `(created_at, insertion sequence)`; exactly one entry exists per
/// id, and removed ids stay tombstoned for `tombstone_ttl`.
#[derive(Debug, Clone)]
pub struct ConversationStore {
    entries: HashMap<MessageId, StoredEntry>,
    order: BTreeMap<(DateTime<Utc>, u64), MessageId>,
    tombstones: HashMap<MessageId, DateTime<Utc>>,
    tombstone_ttl: Duration,
    next_seq: u64,
}

impl ConversationStore {
    pub fn new(tombstone_ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            tombstones: HashMap::new(),
            tombstone_ttl,
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.entries.get(id).map(|entry| &entry.message)
    }

    pub fn is_tombstoned(&self, id: &MessageId) -> bool {
        self.tombstones.contains_key(id)
    }

    /// Resolve a reply reference. The target may simply not be loaded yet.
    pub fn reply_target(&self, message: &Message) -> Option<&Message> {
        message.reply_to_id.as_ref().and_then(|id| self.get(id))
    }

    pub fn get_ordered(&self) -> Vec<Message> {
        self.order
            .values()
            .filter_map(|id| self.entries.get(id))
            .map(|entry| entry.message.clone())
            .collect()
    }

    pub fn oldest_created_at(&self) -> Option<DateTime<Utc>> {
        self.order.keys().next().map(|(created_at, _)| *created_at)
    }

    pub fn newest(&self) -> Option<&Message> {
        self.order
            .values()
            .next_back()
            .and_then(|id| self.entries.get(id))
            .map(|entry| &entry.message)
    }

    pub fn upsert(&mut self, message: Message) -> UpsertOutcome {
        if self.tombstones.contains_key(&message.id) {
            debug!(message_id = %message.id, "store: suppressed upsert of tombstoned id");
            return UpsertOutcome::Suppressed;
        }

        let Some(entry) = self.entries.get_mut(&message.id) else {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.order
                .insert((message.created_at, seq), message.id.clone());
            self.entries
                .insert(message.id.clone(), StoredEntry { message, seq });
            return UpsertOutcome::Inserted;
        };

        if entry.message == message {
            return UpsertOutcome::Unchanged;
        }

        // Position follows the latest `created_at` seen; content follows the
        // latest revision.
        let old_key = entry.order_key();
        if entry.message.revision_at() > message.revision_at() {
            if entry.message.created_at == message.created_at {
                debug!(message_id = %message.id, "store: ignored stale copy");
                return UpsertOutcome::Suppressed;
            }
            entry.message.created_at = message.created_at;
        } else {
            entry.message = message;
        }
        let new_key = entry.order_key();
        if old_key != new_key {
            let id = entry.message.id.clone();
            self.order.remove(&old_key);
            self.order.insert(new_key, id);
        }
        UpsertOutcome::Updated
    }

    /// Removes `id` and tombstones it, even if it was never loaded, so a
    /// delete that overtakes its insert still wins.
    pub fn remove(&mut self, id: &MessageId, now: DateTime<Utc>) -> bool {
        self.tombstones.insert(id.clone(), now);
        self.discard(id)
    }

    /// Drops an entry without tombstoning it (used for rolled-back sends).
    pub fn discard(&mut self, id: &MessageId) -> bool {
        match self.entries.remove(id) {
            Some(entry) => {
                self.order.remove(&entry.order_key());
                true
            }
            None => false,
        }
    }

    /// Swap a provisional entry for its confirmed counterpart, keeping the
    /// provisional entry's insertion sequence.
    pub fn replace_provisional(
        &mut self,
        provisional_id: &MessageId,
        confirmed: Message,
    ) -> UpsertOutcome {
        if self.tombstones.contains_key(&confirmed.id) {
            self.discard(provisional_id);
            return UpsertOutcome::Suppressed;
        }

        if self.entries.contains_key(&confirmed.id) {
            self.discard(provisional_id);
            let outcome = self.upsert(confirmed);
            return if outcome == UpsertOutcome::Unchanged {
                UpsertOutcome::Updated
            } else {
                outcome
            };
        }

        let Some(provisional) = self.entries.remove(provisional_id) else {
            return self.upsert(confirmed);
        };
        self.order.remove(&provisional.order_key());

        let entry = StoredEntry {
            message: confirmed,
            seq: provisional.seq,
        };
        self.order.insert(entry.order_key(), entry.message.id.clone());
        self.entries.insert(entry.message.id.clone(), entry);
        UpsertOutcome::Updated
    }

    /// Find the provisional entry a confirmed message completes. A matching
    /// client token is authoritative; otherwise the oldest provisional entry
    /// with the same sender and payload inside `window` is chosen.
    pub fn find_provisional_match(
        &self,
        candidate: &Message,
        window: Duration,
    ) -> Option<MessageId> {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        let mut best: Option<&StoredEntry> = None;

        for entry in self.entries.values() {
            let local = &entry.message;
            if !local.id.is_provisional() || local.sender_id != candidate.sender_id {
                continue;
            }
            if let (Some(a), Some(b)) = (&local.client_token, &candidate.client_token) {
                if a == b {
                    return Some(local.id.clone());
                }
                continue;
            }
            let same_payload = local.body == candidate.body
                && local.attachment == candidate.attachment
                && local.reply_to_id == candidate.reply_to_id;
            let delta = (candidate.created_at - local.created_at).abs();
            if same_payload && delta <= window && best.map_or(true, |b| entry.seq < b.seq) {
                best = Some(entry);
            }
        }

        best.map(|entry| entry.message.id.clone())
    }

    pub fn prune_tombstones(&mut self, now: DateTime<Utc>) -> usize {
        let ttl = chrono::Duration::from_std(self.tombstone_ttl).unwrap_or(chrono::Duration::MAX);
        let before = self.tombstones.len();
        self.tombstones.retain(|_, removed_at| now - *removed_at < ttl);
        before - self.tombstones.len()
    }

    /// Forget every loaded message ahead of a full reload. Tombstones survive
    /// so the reload cannot resurrect recent deletions.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use shared::domain::{ConversationId, MessageKind, UserId};

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn message(id: &str, sender: &str, body: &str, secs: i64) -> Message {
        Message {
            id: MessageId::from(id),
            conversation_id: ConversationId::from("conv"),
            sender_id: UserId::from(sender),
            sender_display_name: sender.to_uppercase(),
            avatar_ref: None,
            body: body.into(),
            kind: MessageKind::Text,
            created_at: at(secs),
            edited_at: None,
            is_edited: false,
            reply_to_id: None,
            attachment: None,
            client_token: None,
        }
    }

    fn ids(store: &ConversationStore) -> Vec<String> {
        store
            .get_ordered()
            .into_iter()
            .map(|m| m.id.0)
            .collect()
    }

    #[test]
    fn orders_by_created_at_then_insertion() {
        let mut store = ConversationStore::new(Duration::from_secs(60));
        store.upsert(message("b", "u", "second", 5));
        store.upsert(message("a", "u", "first", 1));
        store.upsert(message("c", "u", "tie", 5));
        assert_eq!(ids(&store), vec!["a", "b", "c"]);
    }

    #[test]
    fn upsert_twice_is_a_noop() {
        let mut store = ConversationStore::new(Duration::from_secs(60));
        assert_eq!(store.upsert(message("a", "u", "x", 1)), UpsertOutcome::Inserted);
        assert_eq!(store.upsert(message("a", "u", "x", 1)), UpsertOutcome::Unchanged);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn overwrite_keeps_position_unless_created_at_moves() {
        let mut store = ConversationStore::new(Duration::from_secs(60));
        store.upsert(message("a", "u", "x", 1));
        store.upsert(message("b", "u", "y", 2));

        let mut renamed = message("a", "u", "x2", 1);
        renamed.edited_at = Some(at(10));
        assert_eq!(store.upsert(renamed), UpsertOutcome::Updated);
        assert_eq!(ids(&store), vec!["a", "b"]);

        let moved = message("a", "u", "x2", 3);
        assert_eq!(store.upsert(moved), UpsertOutcome::Updated);
        assert_eq!(ids(&store), vec!["b", "a"]);
        let kept = store.get(&MessageId::from("a")).unwrap();
        assert_eq!(kept.edited_at, Some(at(10)));
        assert_eq!(kept.created_at, at(3));
    }

    #[test]
    fn stale_copy_with_moved_created_at_reorders_but_keeps_edit() {
        let mut store = ConversationStore::new(Duration::from_secs(60));
        let mut edited = message("a", "u", "edited", 1);
        edited.edited_at = Some(at(20));
        edited.is_edited = true;
        store.upsert(edited);
        store.upsert(message("b", "u", "y", 2));

        assert_eq!(
            store.upsert(message("a", "u", "original", 5)),
            UpsertOutcome::Updated
        );
        assert_eq!(ids(&store), vec!["b", "a"]);
        let kept = store.get(&MessageId::from("a")).unwrap();
        assert_eq!(kept.body, "edited");
        assert!(kept.is_edited);
    }

    #[test]
    fn older_copy_does_not_overwrite_newer_edit() {
        let mut store = ConversationStore::new(Duration::from_secs(60));
        let mut edited = message("a", "u", "edited", 1);
        edited.edited_at = Some(at(20));
        edited.is_edited = true;
        store.upsert(edited);

        assert_eq!(
            store.upsert(message("a", "u", "original", 1)),
            UpsertOutcome::Suppressed
        );
        assert_eq!(store.get(&MessageId::from("a")).unwrap().body, "edited");
    }

    #[test]
    fn removed_ids_are_not_resurrected_until_tombstone_expires() {
        let mut store = ConversationStore::new(Duration::from_secs(60));
        store.upsert(message("m1", "u", "x", 1));
        assert!(store.remove(&MessageId::from("m1"), at(100)));
        assert_eq!(
            store.upsert(message("m1", "u", "x", 1)),
            UpsertOutcome::Suppressed
        );

        assert_eq!(store.prune_tombstones(at(130)), 0);
        assert_eq!(store.prune_tombstones(at(161)), 1);
        assert_eq!(store.upsert(message("m1", "u", "x", 1)), UpsertOutcome::Inserted);
    }

    #[test]
    fn delete_before_insert_still_blocks_insert() {
        let mut store = ConversationStore::new(Duration::from_secs(60));
        assert!(!store.remove(&MessageId::from("late"), at(0)));
        assert_eq!(
            store.upsert(message("late", "u", "x", 1)),
            UpsertOutcome::Suppressed
        );
        assert!(store.is_empty());
    }

    #[test]
    fn replaces_provisional_in_place() {
        let mut store = ConversationStore::new(Duration::from_secs(60));
        store.upsert(message("a", "u", "before", 1));
        store.upsert(message("tmp-1", "me", "hi", 2));
        store.upsert(message("z", "u", "after", 3));

        let outcome = store.replace_provisional(
            &MessageId::from("tmp-1"),
            message("srv-42", "me", "hi", 2),
        );
        assert_eq!(outcome, UpsertOutcome::Updated);
        assert_eq!(ids(&store), vec!["a", "srv-42", "z"]);
    }

    #[test]
    fn replacing_when_confirmed_already_present_drops_provisional() {
        let mut store = ConversationStore::new(Duration::from_secs(60));
        store.upsert(message("tmp-1", "me", "hi", 2));
        store.upsert(message("srv-42", "me", "hi", 2));

        store.replace_provisional(&MessageId::from("tmp-1"), message("srv-42", "me", "hi", 2));
        assert_eq!(ids(&store), vec!["srv-42"]);
    }

    #[test]
    fn matches_oldest_provisional_with_same_sender_and_body() {
        let mut store = ConversationStore::new(Duration::from_secs(60));
        store.upsert(message("tmp-1", "me", "hi", 2));
        store.upsert(message("tmp-2", "me", "hi", 3));
        store.upsert(message("tmp-3", "other", "hi", 3));

        let found = store.find_provisional_match(
            &message("srv-1", "me", "hi", 4),
            Duration::from_secs(30),
        );
        assert_eq!(found, Some(MessageId::from("tmp-1")));

        let outside_window = store.find_provisional_match(
            &message("srv-1", "me", "hi", 400),
            Duration::from_secs(30),
        );
        assert_eq!(outside_window, None);
    }

    #[test]
    fn client_token_match_wins_over_heuristic() {
        let mut store = ConversationStore::new(Duration::from_secs(60));
        let mut first = message("tmp-1", "me", "hi", 2);
        first.client_token = Some("token-a".into());
        let mut second = message("tmp-2", "me", "hi", 2);
        second.client_token = Some("token-b".into());
        store.upsert(first);
        store.upsert(second);

        let mut confirmed = message("srv-9", "me", "hi", 2);
        confirmed.client_token = Some("token-b".into());
        assert_eq!(
            store.find_provisional_match(&confirmed, Duration::from_secs(30)),
            Some(MessageId::from("tmp-2"))
        );
    }

    #[test]
    fn resolves_reply_targets_weakly() {
        let mut store = ConversationStore::new(Duration::from_secs(60));
        store.upsert(message("root", "u", "question", 1));
        let mut reply = message("r", "v", "answer", 2);
        reply.reply_to_id = Some(MessageId::from("root"));
        let mut dangling = message("d", "v", "?", 3);
        dangling.reply_to_id = Some(MessageId::from("not-loaded"));

        assert_eq!(store.reply_target(&reply).map(|m| m.body.as_str()), Some("question"));
        assert!(store.reply_target(&dangling).is_none());
    }
}
