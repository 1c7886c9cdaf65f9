use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use shared::domain::{Attachment, ConversationId, Message, MessageId, MessageKind, Participant};
use tracing::debug;
use uuid::Uuid;

use crate::{error::SyncError, store::ConversationStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalId(pub u64);

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationPayload {
    Send {
        provisional_id: MessageId,
        body: String,
        reply_to_id: Option<MessageId>,
        attachment: Option<Attachment>,
        client_token: String,
    },
    Edit {
        message_id: MessageId,
        new_body: String,
    },
    Delete {
        ids: Vec<MessageId>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    Created,
    InFlight,
    Confirmed,
    Failed,
}

impl MutationStatus {
    fn name(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::InFlight => "in-flight",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMutation {
    pub local_id: LocalId,
    pub target_message_id: Option<MessageId>,
    pub payload: MutationPayload,
    pub status: MutationStatus,
    pub created_at: DateTime<Utc>,
}

/// Owns every locally originated mutation until it reaches a terminal state.
///
/// `Created -> InFlight -> {Confirmed | Failed}`. Resolved mutations leave the
/// tracker and are handed back to the caller.
#[derive(Debug, Clone)]
pub struct MutationTracker {
    conversation_id: ConversationId,
    author: Participant,
    next_local: u64,
    pending: BTreeMap<LocalId, PendingMutation>,
}

impl MutationTracker {
    pub fn new(conversation_id: ConversationId, author: Participant) -> Self {
        Self {
            conversation_id,
            author,
            next_local: 1,
            pending: BTreeMap::new(),
        }
    }

    pub fn author(&self) -> &Participant {
        &self.author
    }

    pub fn get(&self, local_id: LocalId) -> Option<&PendingMutation> {
        self.pending.get(&local_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingMutation> {
        self.pending.values()
    }

    pub fn in_flight(&self) -> impl Iterator<Item = &PendingMutation> {
        self.pending
            .values()
            .filter(|m| m.status == MutationStatus::InFlight)
    }

    pub fn pending_send_for(&self, provisional_id: &MessageId) -> Option<LocalId> {
        self.pending.values().find_map(|m| match &m.payload {
            MutationPayload::Send {
                provisional_id: id, ..
            } if id == provisional_id => Some(m.local_id),
            _ => None,
        })
    }

    fn allocate(&mut self) -> LocalId {
        let id = LocalId(self.next_local);
        self.next_local += 1;
        id
    }

    /// Register a send and build the provisional message the store shows
    /// until the backend confirms it.
    pub fn begin_send(
        &mut self,
        body: String,
        reply_to_id: Option<MessageId>,
        attachment: Option<Attachment>,
        now: DateTime<Utc>,
    ) -> Result<(LocalId, Message), SyncError> {
        if body.trim().is_empty() && attachment.is_none() {
            return Err(SyncError::EmptyBody);
        }

        let local_id = self.allocate();
        let provisional_id = MessageId::provisional(local_id.0);
        let client_token = Uuid::new_v4().to_string();
        let message = Message {
            id: provisional_id.clone(),
            conversation_id: self.conversation_id.clone(),
            sender_id: self.author.user_id.clone(),
            sender_display_name: self.author.display_name.clone(),
            avatar_ref: self.author.avatar_ref.clone(),
            body: body.clone(),
            kind: if attachment.is_some() {
                MessageKind::Attachment
            } else {
                MessageKind::Text
            },
            created_at: now,
            edited_at: None,
            is_edited: false,
            reply_to_id: reply_to_id.clone(),
            attachment: attachment.clone(),
            client_token: Some(client_token.clone()),
        };

        self.pending.insert(
            local_id,
            PendingMutation {
                local_id,
                target_message_id: Some(provisional_id.clone()),
                payload: MutationPayload::Send {
                    provisional_id,
                    body,
                    reply_to_id,
                    attachment,
                    client_token,
                },
                status: MutationStatus::Created,
                created_at: now,
            },
        );
        debug!(%local_id, "tracker: send created");
        Ok((local_id, message))
    }

    /// Edits are refused locally for provisional targets: there is no remote
    /// identity to edit yet.
    pub fn begin_edit(
        &mut self,
        store: &ConversationStore,
        message_id: &MessageId,
        new_body: String,
        now: DateTime<Utc>,
    ) -> Result<LocalId, SyncError> {
        if message_id.is_provisional() {
            return Err(SyncError::EditOfProvisional(message_id.clone()));
        }
        let Some(target) = store.get(message_id) else {
            return Err(SyncError::UnknownMessage(message_id.clone()));
        };
        if target.sender_id != self.author.user_id {
            return Err(SyncError::NotMessageOwner(message_id.clone()));
        }
        if new_body.trim().is_empty() {
            return Err(SyncError::EmptyBody);
        }

        let local_id = self.allocate();
        self.pending.insert(
            local_id,
            PendingMutation {
                local_id,
                target_message_id: Some(message_id.clone()),
                payload: MutationPayload::Edit {
                    message_id: message_id.clone(),
                    new_body,
                },
                status: MutationStatus::Created,
                created_at: now,
            },
        );
        Ok(local_id)
    }

    pub fn begin_delete(&mut self, ids: Vec<MessageId>, now: DateTime<Utc>) -> LocalId {
        let local_id = self.allocate();
        self.pending.insert(
            local_id,
            PendingMutation {
                local_id,
                target_message_id: ids.first().cloned(),
                payload: MutationPayload::Delete { ids },
                status: MutationStatus::Created,
                created_at: now,
            },
        );
        local_id
    }

    pub fn mark_in_flight(&mut self, local_id: LocalId) -> Result<(), SyncError> {
        let mutation = self
            .pending
            .get_mut(&local_id)
            .ok_or_else(|| unknown_transition(local_id, MutationStatus::InFlight))?;
        if mutation.status != MutationStatus::Created {
            return Err(invalid_transition(
                local_id,
                mutation.status,
                MutationStatus::InFlight,
            ));
        }
        mutation.status = MutationStatus::InFlight;
        Ok(())
    }

    pub fn confirm(&mut self, local_id: LocalId) -> Result<PendingMutation, SyncError> {
        self.resolve(local_id, MutationStatus::Confirmed)
    }

    pub fn fail(&mut self, local_id: LocalId) -> Result<PendingMutation, SyncError> {
        self.resolve(local_id, MutationStatus::Failed)
    }

    fn resolve(
        &mut self,
        local_id: LocalId,
        to: MutationStatus,
    ) -> Result<PendingMutation, SyncError> {
        let status = self
            .pending
            .get(&local_id)
            .map(|m| m.status)
            .ok_or_else(|| unknown_transition(local_id, to))?;
        if status != MutationStatus::InFlight {
            return Err(invalid_transition(local_id, status, to));
        }
        let mut mutation = self
            .pending
            .remove(&local_id)
            .ok_or_else(|| unknown_transition(local_id, to))?;
        mutation.status = to;
        debug!(%local_id, status = to.name(), "tracker: mutation resolved");
        Ok(mutation)
    }
}

fn invalid_transition(local_id: LocalId, from: MutationStatus, to: MutationStatus) -> SyncError {
    SyncError::InvalidTransition {
        local_id: local_id.to_string(),
        from: from.name(),
        to: to.name(),
    }
}

fn unknown_transition(local_id: LocalId, to: MutationStatus) -> SyncError {
    SyncError::InvalidTransition {
        local_id: local_id.to_string(),
        from: "resolved",
        to: to.name(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;
    use shared::domain::UserId;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn tracker() -> MutationTracker {
        MutationTracker::new(
            ConversationId::from("conv"),
            Participant {
                user_id: UserId::from("me"),
                display_name: "Me".into(),
                avatar_ref: None,
            },
        )
    }

    #[test]
    fn send_builds_provisional_message() {
        let mut tracker = tracker();
        let (local_id, message) = tracker
            .begin_send("hi".into(), None, None, now())
            .expect("send");
        assert!(message.id.is_provisional());
        assert_eq!(message.sender_id, UserId::from("me"));
        assert!(message.client_token.is_some());
        assert_eq!(tracker.pending_send_for(&message.id), Some(local_id));
        assert_eq!(tracker.get(local_id).unwrap().status, MutationStatus::Created);
    }

    #[test]
    fn rejects_empty_send() {
        let mut tracker = tracker();
        assert_eq!(
            tracker.begin_send("   ".into(), None, None, now()),
            Err(SyncError::EmptyBody)
        );
        assert!(tracker.is_empty());
    }

    #[test]
    fn lifecycle_is_created_inflight_terminal() {
        let mut tracker = tracker();
        let (local_id, _) = tracker.begin_send("hi".into(), None, None, now()).unwrap();

        assert!(matches!(
            tracker.confirm(local_id),
            Err(SyncError::InvalidTransition { from: "created", .. })
        ));
        tracker.mark_in_flight(local_id).expect("in flight");
        assert!(tracker.mark_in_flight(local_id).is_err());

        let resolved = tracker.confirm(local_id).expect("confirm");
        assert_eq!(resolved.status, MutationStatus::Confirmed);
        assert!(matches!(
            tracker.fail(local_id),
            Err(SyncError::InvalidTransition { from: "resolved", .. })
        ));
    }

    #[test]
    fn concurrent_sends_resolve_independently() {
        let mut tracker = tracker();
        let (first, _) = tracker.begin_send("one".into(), None, None, now()).unwrap();
        let (second, _) = tracker.begin_send("two".into(), None, None, now()).unwrap();
        tracker.mark_in_flight(first).unwrap();
        tracker.mark_in_flight(second).unwrap();
        assert_eq!(tracker.in_flight().count(), 2);

        tracker.fail(second).expect("fail second");
        assert_eq!(tracker.in_flight().count(), 1);
        assert_eq!(tracker.confirm(first).unwrap().status, MutationStatus::Confirmed);
        assert!(tracker.is_empty());
    }

    #[test]
    fn edit_of_provisional_is_rejected_before_network() {
        let mut tracker = tracker();
        let mut store = ConversationStore::new(Duration::from_secs(60));
        let (_, provisional) = tracker.begin_send("hi".into(), None, None, now()).unwrap();
        store.upsert(provisional.clone());

        let before = tracker.len();
        assert_eq!(
            tracker.begin_edit(&store, &provisional.id, "edited".into(), now()),
            Err(SyncError::EditOfProvisional(provisional.id.clone()))
        );
        assert_eq!(tracker.len(), before);
    }

    #[test]
    fn edit_requires_loaded_own_message() {
        let mut tracker = tracker();
        let mut store = ConversationStore::new(Duration::from_secs(60));
        let (_, mut mine) = tracker.begin_send("hi".into(), None, None, now()).unwrap();
        mine.id = MessageId::from("srv-1");
        let mut theirs = mine.clone();
        theirs.id = MessageId::from("srv-2");
        theirs.sender_id = UserId::from("them");
        store.upsert(mine);
        store.upsert(theirs);

        assert!(tracker
            .begin_edit(&store, &MessageId::from("srv-1"), "edited".into(), now())
            .is_ok());
        assert_eq!(
            tracker.begin_edit(&store, &MessageId::from("srv-2"), "x".into(), now()),
            Err(SyncError::NotMessageOwner(MessageId::from("srv-2")))
        );
        assert_eq!(
            tracker.begin_edit(&store, &MessageId::from("srv-404"), "x".into(), now()),
            Err(SyncError::UnknownMessage(MessageId::from("srv-404")))
        );
    }
}
