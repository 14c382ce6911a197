use std::sync::Arc;

use axum::{
    debug_handler,
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use super::{
    hub::Hub,
    ids::{RoomId, UserId},
    msg::Message,
    schedule::{Proposal, SlotDate, SlotMap},
};
use crate::{session::Identity, AppResult, AppState, ChatError};

#[derive(Debug, Default, Deserialize)]
pub(crate) struct SinceQuery {
    #[serde(default)]
    since: u64,
}

#[debug_handler(state = AppState)]
pub(crate) async fn messages(
    State(hub): State<Arc<Hub>>,
    Identity(me): Identity,
    Path(room_id): Path<RoomId>,
    Query(SinceQuery { since }): Query<SinceQuery>,
) -> AppResult<Json<Vec<Message>>> {
    Ok(Json(hub.history_for(room_id, &me, since).await?))
}

#[debug_handler(state = AppState)]
pub(crate) async fn delete_room(
    State(hub): State<Arc<Hub>>,
    Identity(me): Identity,
    Path(room_id): Path<RoomId>,
) -> AppResult<StatusCode> {
    hub.close_room(room_id, &me).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ScheduleQuery {
    room_id: Option<RoomId>,
    sender_id: Option<UserId>,
    #[serde(alias = "slots")]
    time: Proposal,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct OverlapEntry {
    date: SlotDate,
    overlapping_times: Vec<u8>,
}

fn entries(overlap: SlotMap) -> Vec<OverlapEntry> {
    overlap
        .into_iter()
        .map(|(date, hours)| OverlapEntry {
            date,
            overlapping_times: hours.into_iter().collect(),
        })
        .collect()
}

#[debug_handler(state = AppState)]
pub(crate) async fn submit_schedule(
    State(hub): State<Arc<Hub>>,
    Identity(me): Identity,
    Path(room_id): Path<RoomId>,
    Json(ScheduleQuery { room_id: body_room, sender_id, time }): Json<ScheduleQuery>,
) -> AppResult<Json<Vec<OverlapEntry>>> {
    if let Some(body) = body_room.filter(|body| *body != room_id) {
        return Err(ChatError::RoomMismatch { path: room_id, body }.into());
    }
    if let Some(claimed) = sender_id.filter(|claimed| *claimed != me.user_id) {
        return Err(ChatError::Impersonation { claimed, actual: me.user_id }.into());
    }

    let overlap = hub.propose(room_id, &me, time).await?;
    Ok(Json(entries(overlap)))
}

#[debug_handler(state = AppState)]
pub(crate) async fn overlapping(
    State(hub): State<Arc<Hub>>,
    Identity(me): Identity,
    Path(room_id): Path<RoomId>,
) -> AppResult<Json<Vec<OverlapEntry>>> {
    Ok(Json(entries(hub.overlap(room_id, &me).await?)))
}
