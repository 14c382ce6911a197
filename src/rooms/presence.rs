//! Who is in a room right now.
//!
//! Each participant moves through `Absent -> Entering -> Present -> Leaving
//! -> Absent`. A participant may hold the room from several connections
//! (two tabs, or a reconnect that raced the old socket's close); only the
//! first connection in and the last connection out produce a broadcast.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use super::{
    hub::Hub,
    ids::{ConnectionId, Participant, RoomId, UserId},
    msg::{Message, MessageKind, ServerFrame},
    registry::RoomState,
    relay::Outbox,
};
use crate::ChatError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Absent,
    Entering,
    Present,
    Leaving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entered {
    Joined,
    /// Already present from this or another connection. No broadcast.
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
    Left { room_inactive: bool },
    /// Another connection still holds the participant's presence.
    StillPresent,
    NotEntered,
}

#[derive(Debug)]
struct Seat {
    state: Presence,
    connections: HashSet<ConnectionId>,
}

#[derive(Debug, PartialEq, Eq)]
enum LeaveStep {
    NotEntered,
    StillPresent,
    Leaving,
}

#[derive(Debug, Default)]
pub struct PresenceBook {
    seats: HashMap<UserId, Seat>,
}

impl PresenceBook {
    pub fn state(&self, user: UserId) -> Presence {
        self.seats.get(&user).map_or(Presence::Absent, |seat| seat.state)
    }

    pub fn is_present(&self, user: UserId) -> bool {
        self.state(user) == Presence::Present
    }

    pub fn active_count(&self) -> usize {
        self.seats.values().filter(|seat| seat.state == Presence::Present).count()
    }

    fn begin_enter(&mut self, user: UserId, connection: ConnectionId) -> Entered {
        let seat = self.seats.entry(user).or_insert_with(|| Seat {
            state: Presence::Absent,
            connections: HashSet::new(),
        });
        seat.connections.insert(connection);
        match seat.state {
            Presence::Absent => {
                seat.state = Presence::Entering;
                Entered::Joined
            }
            Presence::Entering | Presence::Present | Presence::Leaving => Entered::AlreadyPresent,
        }
    }

    fn finish_enter(&mut self, user: UserId) {
        if let Some(seat) = self.seats.get_mut(&user) {
            if seat.state == Presence::Entering {
                seat.state = Presence::Present;
            }
        }
    }

    fn begin_leave(&mut self, user: UserId, connection: ConnectionId) -> LeaveStep {
        let Some(seat) = self.seats.get_mut(&user) else {
            return LeaveStep::NotEntered;
        };
        if !seat.connections.remove(&connection) {
            return LeaveStep::NotEntered;
        }
        if !seat.connections.is_empty() {
            return LeaveStep::StillPresent;
        }
        seat.state = Presence::Leaving;
        LeaveStep::Leaving
    }

    fn finish_leave(&mut self, user: UserId) {
        if self.state(user) == Presence::Leaving {
            self.seats.remove(&user);
        }
    }
}

impl RoomState {
    fn presence_notice(
        &self,
        room_id: RoomId,
        participant: &Participant,
        kind: MessageKind,
        at: time::OffsetDateTime,
    ) -> ServerFrame {
        ServerFrame::Message(Message {
            room_id,
            sender_id: participant.user_id,
            nickname: participant.nickname.clone(),
            message: String::new(),
            kind,
            sequence: self.last_sequence,
            timestamp: at,
        })
    }
}

impl Hub {
    /// Subscribes `outbox` to the room, sends it the history after `since`,
    /// and announces the participant unless it is already present.
    pub async fn enter(
        &self,
        room_id: RoomId,
        participant: &Participant,
        outbox: &Outbox,
        since: u64,
    ) -> Result<Entered, ChatError> {
        let handle = self.registry().admit(room_id, participant).await?;
        let mut state = handle.room().lock_open().await?;

        let messages = self.history().list_since(room_id, since).await.map_err(ChatError::History)?;

        state.subscribers.insert(outbox.connection(), outbox.clone());
        outbox.deliver(&ServerFrame::History { room_id, messages }.into());
        if !state.negotiation.overlap().is_empty() {
            let slots = state.negotiation.overlap().clone();
            outbox.deliver(&ServerFrame::Overlap { room_id, slots }.into());
        }

        let entered = state.presence.begin_enter(participant.user_id, outbox.connection());
        match entered {
            Entered::Joined => {
                let notice = state.presence_notice(room_id, participant, MessageKind::Enter, self.stamp());
                state.fan_out(notice);
                state.presence.finish_enter(participant.user_id);
                info!(%room_id, user = %participant.user_id, role = %handle.role(), "entered room");
            }
            Entered::AlreadyPresent => {
                debug!(%room_id, user = %participant.user_id, "absorbed repeated ENTER");
            }
        }
        Ok(entered)
    }

    /// Retires one connection's hold on the room. When it was the
    /// participant's last connection, everyone still subscribed (the
    /// leaving connection included) gets a LEAVE.
    ///
    /// A room left with nobody present stays loaded: its sequence counter
    /// and negotiation survive until the room is deleted.
    pub async fn release(
        &self,
        room_id: RoomId,
        participant: &Participant,
        connection: ConnectionId,
    ) -> Result<Released, ChatError> {
        let room = self.registry().get(room_id).ok_or(ChatError::RoomNotFound(room_id))?;
        let mut state = room.lock().await;

        let released = match state.presence.begin_leave(participant.user_id, connection) {
            LeaveStep::NotEntered => Released::NotEntered,
            LeaveStep::StillPresent => Released::StillPresent,
            LeaveStep::Leaving => {
                let notice = state.presence_notice(room_id, participant, MessageKind::Leave, self.stamp());
                state.fan_out(notice);
                state.presence.finish_leave(participant.user_id);
                let room_inactive = state.presence.active_count() == 0;
                info!(%room_id, user = %participant.user_id, room_inactive, "left room");
                Released::Left { room_inactive }
            }
        };
        state.subscribers.remove(&connection);
        Ok(released)
    }

    /// Transport loss: an immediate implicit LEAVE for every room the
    /// connection had entered. Failures stay local to the room they hit.
    pub async fn disconnect(
        &self,
        connection: ConnectionId,
        participant: &Participant,
        rooms: impl IntoIterator<Item = RoomId>,
    ) {
        for room_id in rooms {
            match self.release(room_id, participant, connection).await {
                Ok(released) => debug!(%room_id, %connection, ?released, "released on disconnect"),
                Err(err) => debug!(%room_id, %connection, %err, "nothing to release on disconnect"),
            }
        }
    }

    pub async fn presence(&self, room_id: RoomId, user: UserId) -> Presence {
        match self.registry().get(room_id) {
            Some(room) => room.lock().await.presence.state(user),
            None => Presence::Absent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_connection_does_not_reenter() {
        let mut book = PresenceBook::default();
        let (a, b) = (ConnectionId::new(), ConnectionId::new());

        assert_eq!(book.begin_enter(UserId(1), a), Entered::Joined);
        assert_eq!(book.state(UserId(1)), Presence::Entering);
        book.finish_enter(UserId(1));
        assert_eq!(book.begin_enter(UserId(1), a), Entered::AlreadyPresent);
        assert_eq!(book.begin_enter(UserId(1), b), Entered::AlreadyPresent);
        assert_eq!(book.active_count(), 1);
    }

    #[test]
    fn last_connection_out_leaves() {
        let mut book = PresenceBook::default();
        let (a, b) = (ConnectionId::new(), ConnectionId::new());
        book.begin_enter(UserId(1), a);
        book.finish_enter(UserId(1));
        book.begin_enter(UserId(1), b);

        assert_eq!(book.begin_leave(UserId(1), a), LeaveStep::StillPresent);
        assert!(book.is_present(UserId(1)));
        assert_eq!(book.begin_leave(UserId(1), b), LeaveStep::Leaving);
        assert_eq!(book.state(UserId(1)), Presence::Leaving);
        book.finish_leave(UserId(1));
        assert_eq!(book.state(UserId(1)), Presence::Absent);
        assert_eq!(book.begin_leave(UserId(1), b), LeaveStep::NotEntered);
    }

    #[test]
    fn unknown_connection_cannot_leave_for_someone() {
        let mut book = PresenceBook::default();
        book.begin_enter(UserId(1), ConnectionId::new());
        book.finish_enter(UserId(1));

        assert_eq!(book.begin_leave(UserId(1), ConnectionId::new()), LeaveStep::NotEntered);
        assert!(book.is_present(UserId(1)));
    }
}
