use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, PoisonError, RwLock},
};

use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

use super::{
    directory::{RoomDirectory, RoomInfo},
    history::HistoryStore,
    ids::{ConnectionId, Participant, Role, RoomId},
    presence::PresenceBook,
    relay::Outbox,
    schedule::Negotiation,
};
use crate::ChatError;

/// Live state of one room. Everything that must not interleave within a
/// room (sequencing, presence changes, proposal replacement) happens while
/// holding its lock; rooms never share a lock.
#[derive(Debug)]
pub struct Room {
    info: RoomInfo,
    state: Mutex<RoomState>,
}

#[derive(Debug, Default)]
pub struct RoomState {
    pub(crate) presence: PresenceBook,
    pub(crate) subscribers: HashMap<ConnectionId, Outbox>,
    pub(crate) last_sequence: u64,
    pub(crate) negotiation: Negotiation,
    /// Set once the room is deleted. Handles taken earlier must not act on it.
    pub(crate) closed: bool,
}

impl RoomState {
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn negotiation(&self) -> &Negotiation {
        &self.negotiation
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl Room {
    fn new(info: RoomInfo, last_sequence: u64) -> Self {
        Self {
            info,
            state: Mutex::new(RoomState {
                last_sequence,
                ..RoomState::default()
            }),
        }
    }

    pub fn info(&self) -> &RoomInfo {
        &self.info
    }

    pub async fn lock(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().await
    }

    /// Like [`Room::lock`], but refuses a room that has been deleted since
    /// the caller got hold of it.
    pub async fn lock_open(&self) -> Result<MutexGuard<'_, RoomState>, ChatError> {
        let state = self.state.lock().await;
        if state.closed {
            return Err(ChatError::RoomNotFound(self.info.room_id));
        }
        Ok(state)
    }
}

/// A participant's admission to a room, with the role it holds there.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    room: Arc<Room>,
    role: Role,
}

impl RoomHandle {
    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    pub fn role(&self) -> Role {
        self.role
    }
}

#[derive(Default)]
struct Rooms {
    live: HashMap<RoomId, Arc<Room>>,
    /// Deleted rooms. An admission that read the directory before the
    /// delete must not bring the room back.
    closed: HashSet<RoomId>,
}

/// room id -> live room. The map lock is only held for lookups and inserts,
/// never across an await.
pub struct RoomRegistry {
    rooms: RwLock<Rooms>,
    directory: Arc<dyn RoomDirectory>,
    history: Arc<dyn HistoryStore>,
}

impl RoomRegistry {
    pub fn new(directory: Arc<dyn RoomDirectory>, history: Arc<dyn HistoryStore>) -> Self {
        Self {
            rooms: RwLock::new(Rooms::default()),
            directory,
            history,
        }
    }

    /// Loads the room on first use and checks that `participant` is its
    /// buyer or seller. Repeat admissions reuse the same state. A rejected
    /// participant leaves nothing behind.
    pub async fn admit(&self, room_id: RoomId, participant: &Participant) -> Result<RoomHandle, ChatError> {
        let unauthorized = || ChatError::Unauthorized {
            room: room_id,
            user: participant.user_id,
        };

        if let Some(room) = self.get(room_id) {
            let role = room.info().role_of(participant.user_id).ok_or_else(unauthorized)?;
            return Ok(RoomHandle { room, role });
        }

        let info = self
            .directory
            .get(room_id)
            .await
            .map_err(ChatError::Directory)?
            .ok_or(ChatError::RoomNotFound(room_id))?;
        let role = info.role_of(participant.user_id).ok_or_else(unauthorized)?;
        let last_sequence = self.history.last_sequence(room_id).await.map_err(ChatError::History)?;

        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        if rooms.closed.contains(&room_id) {
            return Err(ChatError::RoomNotFound(room_id));
        }
        let room = rooms
            .live
            .entry(room_id)
            .or_insert_with(|| {
                info!(%room_id, last_sequence, "room loaded");
                Arc::new(Room::new(info, last_sequence))
            })
            .clone();
        Ok(RoomHandle { room, role })
    }

    pub fn get(&self, room_id: RoomId) -> Option<Arc<Room>> {
        self.rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .live
            .get(&room_id)
            .cloned()
    }

    /// Forgets a deleted room for good and marks its live state closed.
    /// Subscribers are dropped without a LEAVE.
    pub async fn evict(&self, room_id: RoomId) {
        let evicted = {
            let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
            rooms.closed.insert(room_id);
            rooms.live.remove(&room_id)
        };
        if let Some(room) = evicted {
            let mut state = room.lock().await;
            state.closed = true;
            state.subscribers.clear();
            info!(%room_id, "room evicted");
        }
    }

    pub fn len(&self) -> usize {
        self.rooms.read().unwrap_or_else(PoisonError::into_inner).live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
