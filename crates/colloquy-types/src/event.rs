//! Change notifications published by the session store.
//!
//! `StoreEvent` is broadcast after every store mutation so that a UI can
//! re-render. All variants are Clone + Send + Sync for use with tokio
//! broadcast channels.

use serde::{Deserialize, Serialize};

use crate::chat::{MessageId, MessageStatus, SessionId, Slot};

/// Events emitted by the session store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    SessionCreated { session_id: SessionId },

    SessionDeleted { session_id: SessionId },

    /// Session name, flags, prompt or model configuration changed.
    SessionUpdated { session_id: SessionId },

    ActiveChanged { session_id: Option<SessionId> },

    MessageAppended {
        session_id: SessionId,
        message_id: MessageId,
        slot: Slot,
    },

    /// Content or status of an existing message changed.
    MessageUpdated {
        session_id: SessionId,
        message_id: MessageId,
    },

    /// History was cut back so that `last_kept` is the final main message.
    HistoryTruncated {
        session_id: SessionId,
        last_kept: MessageId,
    },

    /// A request was dispatched for `slot` (loading on, streaming off).
    TurnStarted { session_id: SessionId, slot: Slot },

    /// A streamed text fragment was applied to the buffer of `slot`.
    Delta {
        session_id: SessionId,
        slot: Slot,
        text: String,
    },

    /// The request for `slot` ended and its buffer was cleared.
    ///
    /// `status` is `None` when nothing was committed (canceled before any delta).
    TurnSettled {
        session_id: SessionId,
        slot: Slot,
        status: Option<MessageStatus>,
    },
}

impl StoreEvent {
    /// Session the event concerns, if any.
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            StoreEvent::SessionCreated { session_id }
            | StoreEvent::SessionDeleted { session_id }
            | StoreEvent::SessionUpdated { session_id }
            | StoreEvent::MessageAppended { session_id, .. }
            | StoreEvent::MessageUpdated { session_id, .. }
            | StoreEvent::HistoryTruncated { session_id, .. }
            | StoreEvent::TurnStarted { session_id, .. }
            | StoreEvent::Delta { session_id, .. }
            | StoreEvent::TurnSettled { session_id, .. } => Some(*session_id),
            StoreEvent::ActiveChanged { session_id } => *session_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_event_serde() {
        let event = StoreEvent::Delta {
            session_id: SessionId::new(),
            slot: Slot::Model("m1".to_string()),
            text: "Hi".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "delta");
        assert_eq!(json["slot"]["slot"], "model");
        assert_eq!(json["slot"]["model"], "m1");
        let parsed: StoreEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_session_id_accessor() {
        let id = SessionId::new();
        assert_eq!(
            StoreEvent::TurnStarted {
                session_id: id,
                slot: Slot::Primary
            }
            .session_id(),
            Some(id)
        );
        assert_eq!(StoreEvent::ActiveChanged { session_id: None }.session_id(), None);
    }
}
