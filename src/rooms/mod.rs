mod connection;
mod directory;
mod history;
mod hub;
mod ids;
mod msg;
mod new;
mod presence;
mod registry;
mod relay;
mod room;
mod schedule;
mod ws;

use axum::{
    routing::{delete, get, post},
    Router,
};

use crate::AppState;

pub use connection::Connection;
pub use directory::{ListingId, MemoryDirectory, RoomDirectory, RoomInfo, SqliteDirectory};
pub use history::{HistoryStore, MemoryHistory, SqliteHistory};
pub use hub::Hub;
pub use ids::{ConnectionId, Participant, Role, RoomId, UserId};
pub use msg::{ClientFrame, Message, MessageKind, Outbound, ServerFrame};
pub use presence::{Entered, Presence, PresenceBook, Released};
pub use registry::{Room, RoomHandle, RoomRegistry, RoomState};
pub use relay::{Delivery, Outbox, OutboxReceiver, Published};
pub use schedule::{intersect, Negotiation, Proposal, SlotDate, SlotMap, SlotWindow};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/chat", post(new::new_room))
        .route("/chat/user/{user_id}", get(new::user_rooms))
        .route("/chat/buyer/{user_id}", get(new::buyer_rooms))
        .route("/chat/seller/{user_id}", get(new::seller_rooms))
        .route("/chat/{room_id}", delete(room::delete_room))
        .route("/chat/{room_id}/messages", get(room::messages))
        .route("/schedule/{room_id}", post(room::submit_schedule))
        .route("/overlapping/{room_id}", get(room::overlapping))
        .route("/ws", get(ws::room_ws))
}
