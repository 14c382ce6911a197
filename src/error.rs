use thiserror::Error;

use crate::rooms::{RoomId, UserId};

/// Errors returned synchronously to whoever initiated a room operation.
/// Nothing here is ever broadcast to the other participant.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("user {user} is not a participant of room {room}")]
    Unauthorized { room: RoomId, user: UserId },

    #[error("user {actual} cannot act as user {claimed}")]
    Impersonation { claimed: UserId, actual: UserId },

    #[error("hour {hour} on {date} is outside the bookable window")]
    InvalidSlot { date: String, hour: i64 },

    #[error("{date} is outside the bookable horizon")]
    DateOutOfHorizon { date: String },

    #[error("room {0} not found")]
    RoomNotFound(RoomId),

    #[error("connection has not entered room {0}")]
    NotEntered(RoomId),

    #[error("request for room {body} sent to room {path}")]
    RoomMismatch { path: RoomId, body: RoomId },

    #[error("buyer and seller must be different users")]
    SelfDealing,

    #[error("history store: {0}")]
    History(anyhow::Error),

    #[error("room directory: {0}")]
    Directory(anyhow::Error),
}

impl ChatError {
    /// Stable code for the `error` wire frame.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Unauthorized { .. } | ChatError::Impersonation { .. } => "UNAUTHORIZED",
            ChatError::InvalidSlot { .. } | ChatError::DateOutOfHorizon { .. } => "INVALID_SLOT",
            ChatError::RoomNotFound(_) => "ROOM_NOT_FOUND",
            ChatError::NotEntered(_) => "NOT_ENTERED",
            ChatError::RoomMismatch { .. } | ChatError::SelfDealing => "BAD_REQUEST",
            ChatError::History(_) | ChatError::Directory(_) => "INTERNAL",
        }
    }
}
