use std::collections::BTreeSet;

use shared::domain::{Message, MessageId, UserId};

use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SelectionState {
    #[default]
    Normal,
    SelectionActive {
        selected: BTreeSet<MessageId>,
        deleting: bool,
    },
}

/// Multi-select "delete mode". Only the acting user's confirmed messages can
/// be selected.
#[derive(Debug, Clone)]
pub struct SelectionCoordinator {
    self_id: UserId,
    state: SelectionState,
}

impl SelectionCoordinator {
    pub fn new(self_id: UserId) -> Self {
        Self {
            self_id,
            state: SelectionState::Normal,
        }
    }

    pub fn state(&self) -> &SelectionState {
        &self.state
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, SelectionState::SelectionActive { .. })
    }

    pub fn selected(&self) -> Vec<MessageId> {
        match &self.state {
            SelectionState::Normal => Vec::new(),
            SelectionState::SelectionActive { selected, .. } => selected.iter().cloned().collect(),
        }
    }

    fn ensure_owned(&self, message: &Message) -> Result<(), SyncError> {
        if message.sender_id != self.self_id {
            return Err(SyncError::NotMessageOwner(message.id.clone()));
        }
        if message.id.is_provisional() {
            return Err(SyncError::NotConfirmed(message.id.clone()));
        }
        Ok(())
    }

    /// Enter selection mode from one of the user's own messages, which starts
    /// out selected.
    pub fn enter(&mut self, message: &Message) -> Result<(), SyncError> {
        self.ensure_owned(message)?;
        if let SelectionState::SelectionActive { selected, .. } = &mut self.state {
            selected.insert(message.id.clone());
        } else {
            self.state = SelectionState::SelectionActive {
                selected: BTreeSet::from([message.id.clone()]),
                deleting: false,
            };
        }
        Ok(())
    }

    /// Returns whether the message is selected after the toggle.
    pub fn toggle(&mut self, message: &Message) -> Result<bool, SyncError> {
        self.ensure_owned(message)?;
        let SelectionState::SelectionActive { selected, deleting } = &mut self.state else {
            return Err(SyncError::SelectionInactive);
        };
        if *deleting {
            return Ok(selected.contains(&message.id));
        }
        if selected.remove(&message.id) {
            Ok(false)
        } else {
            selected.insert(message.id.clone());
            Ok(true)
        }
    }

    pub fn begin_confirm(&mut self) -> Result<Vec<MessageId>, SyncError> {
        let SelectionState::SelectionActive { selected, deleting } = &mut self.state else {
            return Err(SyncError::SelectionInactive);
        };
        if selected.is_empty() {
            return Err(SyncError::EmptySelection);
        }
        *deleting = true;
        Ok(selected.iter().cloned().collect())
    }

    pub fn on_delete_succeeded(&mut self) {
        self.state = SelectionState::Normal;
    }

    /// Stay in selection mode with the selection intact so the user can retry.
    pub fn on_delete_failed(&mut self) {
        if let SelectionState::SelectionActive { deleting, .. } = &mut self.state {
            *deleting = false;
        }
    }

    pub fn cancel(&mut self) {
        self.state = SelectionState::Normal;
    }

    /// Drop ids that vanished from the store (e.g. deleted by another device).
    pub fn retain_existing(&mut self, exists: impl Fn(&MessageId) -> bool) {
        if let SelectionState::SelectionActive { selected, .. } = &mut self.state {
            selected.retain(|id| exists(id));
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use shared::domain::{ConversationId, MessageKind};

    use super::*;

    fn message(id: &str, sender: &str) -> Message {
        Message {
            id: MessageId::from(id),
            conversation_id: ConversationId::from("conv"),
            sender_id: UserId::from(sender),
            sender_display_name: sender.into(),
            avatar_ref: None,
            body: "x".into(),
            kind: MessageKind::Text,
            created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            edited_at: None,
            is_edited: false,
            reply_to_id: None,
            attachment: None,
            client_token: None,
        }
    }

    #[test]
    fn entering_requires_own_message_and_preselects_it() {
        let mut selection = SelectionCoordinator::new(UserId::from("me"));
        assert_eq!(
            selection.enter(&message("m1", "them")),
            Err(SyncError::NotMessageOwner(MessageId::from("m1")))
        );
        assert!(!selection.is_active());

        selection.enter(&message("m2", "me")).expect("enter");
        assert_eq!(selection.selected(), vec![MessageId::from("m2")]);
    }

    #[test]
    fn toggling_others_messages_is_rejected() {
        let mut selection = SelectionCoordinator::new(UserId::from("me"));
        selection.enter(&message("m1", "me")).unwrap();
        assert!(selection.toggle(&message("m9", "them")).is_err());
        assert_eq!(selection.toggle(&message("m2", "me")), Ok(true));
        assert_eq!(selection.toggle(&message("m1", "me")), Ok(false));
        assert_eq!(selection.selected(), vec![MessageId::from("m2")]);
    }

    #[test]
    fn failed_delete_keeps_selection_and_success_returns_to_normal() {
        let mut selection = SelectionCoordinator::new(UserId::from("me"));
        selection.enter(&message("m1", "me")).unwrap();
        selection.toggle(&message("m2", "me")).unwrap();

        let ids = selection.begin_confirm().expect("confirm");
        assert_eq!(ids.len(), 2);
        selection.on_delete_failed();
        assert!(selection.is_active());
        assert_eq!(selection.selected().len(), 2);

        selection.begin_confirm().expect("retry");
        selection.on_delete_succeeded();
        assert_eq!(selection.state(), &SelectionState::Normal);
    }

    #[test]
    fn cancel_and_empty_confirm() {
        let mut selection = SelectionCoordinator::new(UserId::from("me"));
        assert_eq!(selection.begin_confirm(), Err(SyncError::SelectionInactive));
        selection.enter(&message("m1", "me")).unwrap();
        selection.toggle(&message("m1", "me")).unwrap();
        assert_eq!(selection.begin_confirm(), Err(SyncError::EmptySelection));
        selection.cancel();
        assert!(!selection.is_active());
    }
}
