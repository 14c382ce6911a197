use std::sync::Arc;

use axum::{
    debug_handler,
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::{
    directory::{ListingId, RoomInfo},
    hub::Hub,
    ids::{Role, RoomId, UserId},
    msg::Message,
};
use crate::{session::Identity, AppResult, AppState, ChatError};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NewRoomQuery {
    buyer: UserId,
    seller: UserId,
    product: ListingId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RoomSummary {
    room_id: RoomId,
    buyer: UserId,
    seller: UserId,
    product: ListingId,
    #[serde(with = "time::serde::rfc3339")]
    created_at: OffsetDateTime,
    message: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    time: Option<OffsetDateTime>,
}

impl RoomSummary {
    fn new(info: RoomInfo, last: Option<Message>) -> Self {
        let (message, time) = match last {
            Some(last) => (Some(last.message), Some(last.timestamp)),
            None => (None, None),
        };
        Self {
            room_id: info.room_id,
            buyer: info.buyer,
            seller: info.seller,
            product: info.product,
            created_at: info.created_at,
            message,
            time,
        }
    }
}

/// Opens the room for a buyer's interest in a listing, or returns the one
/// already open. Only the buyer may ask.
#[debug_handler(state = AppState)]
pub(crate) async fn new_room(
    State(hub): State<Arc<Hub>>,
    Identity(me): Identity,
    Json(NewRoomQuery { buyer, seller, product }): Json<NewRoomQuery>,
) -> AppResult<Json<RoomSummary>> {
    if me.user_id != buyer {
        return Err(ChatError::Impersonation { claimed: buyer, actual: me.user_id }.into());
    }

    let info = hub.open_room(buyer, seller, product).await?;
    let last = hub.history().last_message(info.room_id).await?;
    Ok(Json(RoomSummary::new(info, last)))
}

async fn rooms(hub: &Hub, me: UserId, user_id: UserId, role: Option<Role>) -> AppResult<Json<Vec<RoomSummary>>> {
    if me != user_id {
        return Err(ChatError::Impersonation { claimed: user_id, actual: me }.into());
    }
    let rooms = hub.rooms_of(user_id, role).await?;
    Ok(Json(rooms.into_iter().map(|(info, last)| RoomSummary::new(info, last)).collect()))
}

#[debug_handler(state = AppState)]
pub(crate) async fn user_rooms(
    State(hub): State<Arc<Hub>>,
    Identity(me): Identity,
    Path(user_id): Path<UserId>,
) -> AppResult<Json<Vec<RoomSummary>>> {
    rooms(&hub, me.user_id, user_id, None).await
}

#[debug_handler(state = AppState)]
pub(crate) async fn buyer_rooms(
    State(hub): State<Arc<Hub>>,
    Identity(me): Identity,
    Path(user_id): Path<UserId>,
) -> AppResult<Json<Vec<RoomSummary>>> {
    rooms(&hub, me.user_id, user_id, Some(Role::Buyer)).await
}

#[debug_handler(state = AppState)]
pub(crate) async fn seller_rooms(
    State(hub): State<Arc<Hub>>,
    Identity(me): Identity,
    Path(user_id): Path<UserId>,
) -> AppResult<Json<Vec<RoomSummary>>> {
    rooms(&hub, me.user_id, user_id, Some(Role::Seller)).await
}
