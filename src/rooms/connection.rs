use std::{collections::HashSet, sync::Arc};

use tracing::{debug, warn};

use super::{
    hub::Hub,
    ids::{ConnectionId, Participant, RoomId},
    msg::{ClientFrame, ServerFrame},
    presence::{Entered, Released},
    relay::{Outbox, OutboxReceiver, Published},
};
use crate::ChatError;

/// Server side of one client socket. Owns the connection's outbox and the
/// set of rooms it has entered; joins nothing until asked to.
pub struct Connection {
    id: ConnectionId,
    participant: Participant,
    hub: Arc<Hub>,
    outbox: Outbox,
    joined: HashSet<RoomId>,
}

impl Connection {
    pub fn open(hub: Arc<Hub>, participant: Participant, outbox_capacity: usize) -> (Connection, OutboxReceiver) {
        let id = ConnectionId::new();
        let (outbox, rx) = Outbox::new(id, outbox_capacity);
        debug!(connection = %id, user = %participant.user_id, "connection opened");
        (
            Connection {
                id,
                participant,
                hub,
                outbox,
                joined: HashSet::new(),
            },
            rx,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    pub fn joined(&self) -> &HashSet<RoomId> {
        &self.joined
    }

    /// Decodes and handles one text frame. Undecodable input is answered
    /// with `BAD_FRAME` and otherwise ignored.
    pub async fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ClientFrame>(text) {
            Ok(frame) => self.handle(frame).await,
            Err(err) => {
                debug!(connection = %self.id, %err, "undecodable frame");
                self.reply(ServerFrame::bad_frame(err));
            }
        }
    }

    pub async fn handle(&mut self, frame: ClientFrame) {
        let room_id = frame.room_id();
        let op = frame.op();
        if let Err(err) = self.dispatch(frame).await {
            warn!(connection = %self.id, %room_id, op, %err, "frame rejected");
            self.reply(ServerFrame::error(Some(room_id), &err));
        }
    }

    async fn dispatch(&mut self, frame: ClientFrame) -> Result<(), ChatError> {
        if let Some(claimed) = frame.claimed_sender() {
            if claimed != self.participant.user_id {
                return Err(ChatError::Impersonation {
                    claimed,
                    actual: self.participant.user_id,
                });
            }
        }

        match frame {
            ClientFrame::Enter { room_id, since, .. } => {
                let entered = self.hub.enter(room_id, &self.participant, &self.outbox, since).await?;
                self.joined.insert(room_id);
                if entered == Entered::AlreadyPresent {
                    self.reply(ServerFrame::Ack { room_id, op: "ENTER" });
                }
            }
            ClientFrame::Talk { room_id, message, .. } => {
                self.require_joined(room_id)?;
                if self.hub.publish(room_id, &self.participant, &message).await? == Published::Dropped {
                    self.reply(ServerFrame::Ack { room_id, op: "TALK" });
                }
            }
            ClientFrame::Leave { room_id, .. } => {
                if !self.joined.remove(&room_id) {
                    self.reply(ServerFrame::Ack { room_id, op: "LEAVE" });
                    return Ok(());
                }
                let released = self.hub.release(room_id, &self.participant, self.id).await?;
                // Left already put a LEAVE on this connection
                if !matches!(released, Released::Left { .. }) {
                    self.reply(ServerFrame::Ack { room_id, op: "LEAVE" });
                }
            }
            ClientFrame::Propose { room_id, slots, .. } => {
                self.require_joined(room_id)?;
                self.hub.propose(room_id, &self.participant, slots).await?;
            }
        }
        Ok(())
    }

    fn require_joined(&self, room_id: RoomId) -> Result<(), ChatError> {
        if self.joined.contains(&room_id) {
            Ok(())
        } else {
            Err(ChatError::NotEntered(room_id))
        }
    }

    fn reply(&self, frame: ServerFrame) {
        self.outbox.deliver(&Arc::new(frame));
    }

    /// Transport is gone: implicit LEAVE everywhere this connection entered.
    pub async fn close(mut self) {
        let rooms: Vec<RoomId> = self.joined.drain().collect();
        debug!(connection = %self.id, rooms = rooms.len(), "connection closing");
        self.hub.disconnect(self.id, &self.participant, rooms).await;
    }
}
