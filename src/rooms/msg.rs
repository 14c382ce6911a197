use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::{
    ids::{RoomId, UserId},
    schedule::{Proposal, SlotMap},
};
use crate::ChatError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    Enter,
    Talk,
    Leave,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Enter => "ENTER",
            MessageKind::Talk => "TALK",
            MessageKind::Leave => "LEAVE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ENTER" => Some(MessageKind::Enter),
            "TALK" => Some(MessageKind::Talk),
            "LEAVE" => Some(MessageKind::Leave),
            _ => None,
        }
    }
}

/// A message as the server delivers it. `sequence` is the room-local order;
/// presence messages carry the sequence of the latest TALK instead of a new
/// one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub nickname: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub sequence: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Everything a client may send over its socket. The tag is checked during
/// decoding, so an unknown `type` never reaches the room.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    Enter {
        room_id: RoomId,
        #[serde(default)]
        since: u64,
        #[serde(default)]
        sender_id: Option<UserId>,
    },
    #[serde(rename_all = "camelCase")]
    Talk {
        room_id: RoomId,
        #[serde(default)]
        message: String,
        #[serde(default)]
        sender_id: Option<UserId>,
    },
    #[serde(rename_all = "camelCase")]
    Leave {
        room_id: RoomId,
        #[serde(default)]
        sender_id: Option<UserId>,
    },
    #[serde(rename_all = "camelCase")]
    Propose {
        room_id: RoomId,
        #[serde(alias = "time")]
        slots: Proposal,
        #[serde(default, alias = "participantId")]
        sender_id: Option<UserId>,
    },
}

impl ClientFrame {
    pub fn room_id(&self) -> RoomId {
        match self {
            ClientFrame::Enter { room_id, .. }
            | ClientFrame::Talk { room_id, .. }
            | ClientFrame::Leave { room_id, .. }
            | ClientFrame::Propose { room_id, .. } => *room_id,
        }
    }

    pub fn claimed_sender(&self) -> Option<UserId> {
        match self {
            ClientFrame::Enter { sender_id, .. }
            | ClientFrame::Talk { sender_id, .. }
            | ClientFrame::Leave { sender_id, .. }
            | ClientFrame::Propose { sender_id, .. } => *sender_id,
        }
    }

    pub fn op(&self) -> &'static str {
        match self {
            ClientFrame::Enter { .. } => "ENTER",
            ClientFrame::Talk { .. } => "TALK",
            ClientFrame::Leave { .. } => "LEAVE",
            ClientFrame::Propose { .. } => "PROPOSE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum ServerFrame {
    Message(Message),
    #[serde(rename_all = "camelCase")]
    History {
        room_id: RoomId,
        messages: Vec<Message>,
    },
    #[serde(rename_all = "camelCase")]
    Overlap {
        room_id: RoomId,
        slots: SlotMap,
    },
    #[serde(rename_all = "camelCase")]
    Ack {
        room_id: RoomId,
        op: &'static str,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        room_id: Option<RoomId>,
        code: &'static str,
        message: String,
    },
}

impl ServerFrame {
    pub fn error(room_id: Option<RoomId>, err: &ChatError) -> Self {
        ServerFrame::Error {
            room_id,
            code: err.code(),
            message: err.to_string(),
        }
    }

    pub fn bad_frame(reason: impl ToString) -> Self {
        ServerFrame::Error {
            room_id: None,
            code: "BAD_FRAME",
            message: reason.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        // Every field is a plain string, number or map with string keys.
        serde_json::to_string(self).unwrap_or_else(|err| {
            format!(r#"{{"frame":"error","code":"INTERNAL","message":"{err}"}}"#)
        })
    }
}

/// Fan-out unit. One allocation shared by every subscriber's outbox.
pub type Outbound = Arc<ServerFrame>;
