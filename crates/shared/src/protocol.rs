use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{Attachment, ConversationId, Message, MessageId, ReactionEvent, TypingSignal, UserId},
    error::ApiError,
};

/// Row-level operation reported by the realtime feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RealtimeOp {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entity", content = "payload", rename_all = "snake_case")]
pub enum RealtimeEntity {
    Message(Message),
    Reaction(ReactionEvent),
}

/// One entry of the persisted realtime feed. Delivery is at-least-once and
/// unordered, so consumers must treat every event as possibly stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    pub conversation_id: ConversationId,
    pub op: RealtimeOp,
    #[serde(flatten)]
    pub entity: RealtimeEntity,
}

impl RealtimeEvent {
    pub fn message(op: RealtimeOp, message: Message) -> Self {
        Self {
            conversation_id: message.conversation_id.clone(),
            op,
            entity: RealtimeEntity::Message(message),
        }
    }

    pub fn reaction(conversation_id: ConversationId, op: RealtimeOp, event: ReactionEvent) -> Self {
        Self {
            conversation_id,
            op,
            entity: RealtimeEntity::Reaction(event),
        }
    }
}

/// Frames pushed over the realtime websocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    Realtime(RealtimeEvent),
    Typing {
        conversation_id: ConversationId,
        signal: TypingSignal,
    },
    TypingStopped {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    Error(ApiError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub sender_id: UserId,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditMessageRequest {
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteMessagesRequest {
    pub ids: Vec<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionRequest {
    pub emoji: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchPageQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<DateTime<Utc>>,
    pub limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingBroadcastRequest {
    pub signal: TypingSignal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingStopRequest {
    pub user_id: UserId,
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::domain::{MessageKind, ReactionKind};

    fn message() -> Message {
        Message {
            id: MessageId::from("srv-1"),
            conversation_id: ConversationId::from("conv-1"),
            sender_id: UserId::from("alice"),
            sender_display_name: "Alice".into(),
            avatar_ref: None,
            body: "hi".into(),
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
    fn realtime_message_event_uses_flat_entity_tag() {
        let event = RealtimeEvent::message(RealtimeOp::Insert, message());
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["op"], "insert");
        assert_eq!(value["entity"], "message");
        assert_eq!(value["payload"]["id"], "srv-1");
        assert_eq!(value["conversation_id"], "conv-1");
    }

    #[test]
    fn decodes_reaction_frame_from_server() {
        let raw = r#"{
            "type": "realtime",
            "payload": {
                "conversation_id": "conv-1",
                "op": "insert",
                "entity": "reaction",
                "payload": {"message_id": "srv-1", "user_id": "bob", "emoji": "👍", "kind": "add"}
            }
        }"#;
        let frame: ServerEvent = serde_json::from_str(raw).expect("decode");
        match frame {
            ServerEvent::Realtime(RealtimeEvent {
                entity: RealtimeEntity::Reaction(reaction),
                ..
            }) => {
                assert_eq!(reaction.kind, ReactionKind::Add);
                assert_eq!(reaction.user_id, UserId::from("bob"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn message_without_optional_fields_decodes_with_defaults() {
        let raw = r#"{
            "id": "srv-9",
            "conversation_id": "conv-1",
            "sender_id": "alice",
            "sender_display_name": "Alice",
            "body": "yo",
            "created_at": "2024-01-01T00:00:00Z"
        }"#;
        let decoded: Message = serde_json::from_str(raw).expect("decode");
        assert_eq!(decoded.kind, MessageKind::Text);
        assert!(!decoded.is_edited);
        assert!(decoded.client_token.is_none());
        assert!(!decoded.id.is_provisional());
    }

    #[test]
    fn provisional_ids_carry_prefix() {
        let id = MessageId::provisional(7);
        assert_eq!(id.as_str(), "tmp-7");
        assert!(id.is_provisional());
    }
}
