use std::sync::Arc;

use tokio::sync::{
    mpsc::{self, error::TrySendError},
    Notify,
};
use tracing::{debug, warn};

use super::{
    hub::Hub,
    ids::{ConnectionId, Participant, RoomId},
    msg::{Message, MessageKind, Outbound, ServerFrame},
    registry::RoomState,
};
use crate::ChatError;

/// Sending half of a connection's outbound queue. Rooms hold a clone per
/// subscribed connection and never wait on it.
#[derive(Debug, Clone)]
pub struct Outbox {
    connection: ConnectionId,
    tx: mpsc::Sender<Outbound>,
    evict: Arc<Notify>,
}

pub struct OutboxReceiver {
    rx: mpsc::Receiver<Outbound>,
    evict: Arc<Notify>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The connection already went away.
    Gone,
    /// The queue is full; the connection has been told to close.
    Stalled,
}

impl Outbox {
    pub fn new(connection: ConnectionId, capacity: usize) -> (Outbox, OutboxReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let evict = Arc::new(Notify::new());
        (
            Outbox { connection, tx, evict: evict.clone() },
            OutboxReceiver { rx, evict },
        )
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn deliver(&self, frame: &Outbound) -> Delivery {
        match self.tx.try_send(frame.clone()) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Closed(_)) => Delivery::Gone,
            Err(TrySendError::Full(_)) => {
                self.evict.notify_one();
                Delivery::Stalled
            }
        }
    }
}

impl OutboxReceiver {
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.rx.recv().await
    }

    /// Everything queued so far, without waiting.
    pub fn drain(&mut self) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Fires once a room found this connection's queue full.
    pub fn eviction(&self) -> Arc<Notify> {
        self.evict.clone()
    }
}

/// Result of a TALK publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Published {
    Delivered(Message),
    /// Blank body. Nothing was sequenced, stored or broadcast.
    Dropped,
}

impl RoomState {
    /// Queues `frame` on every subscriber in one pass. Subscribers that are
    /// gone or stalled are unsubscribed; their own disconnect handles
    /// presence.
    pub(crate) fn fan_out(&mut self, frame: ServerFrame) -> usize {
        let frame: Outbound = Arc::new(frame);
        let mut reached = 0;
        self.subscribers.retain(|connection, outbox| match outbox.deliver(&frame) {
            Delivery::Queued => {
                reached += 1;
                true
            }
            Delivery::Gone => {
                debug!(%connection, "dropping closed subscriber");
                false
            }
            Delivery::Stalled => {
                warn!(%connection, "subscriber is not keeping up, evicting");
                false
            }
        });
        reached
    }
}

impl Hub {
    /// Sequences, stores and broadcasts a TALK message.
    ///
    /// The sender must belong to the room and currently be present in it.
    /// Sequence assignment, the history append and the fan-out all happen
    /// under the room lock, so every subscriber sees the room's order.
    pub async fn publish(
        &self,
        room_id: RoomId,
        sender: &Participant,
        body: &str,
    ) -> Result<Published, ChatError> {
        let handle = self.registry().admit(room_id, sender).await?;
        let mut state = handle.room().lock_open().await?;

        if !state.presence.is_present(sender.user_id) {
            return Err(ChatError::NotEntered(room_id));
        }
        if body.trim().is_empty() {
            debug!(%room_id, sender = %sender.user_id, "dropping blank TALK");
            return Ok(Published::Dropped);
        }

        let message = Message {
            room_id,
            sender_id: sender.user_id,
            nickname: sender.nickname.clone(),
            message: body.to_owned(),
            kind: MessageKind::Talk,
            sequence: state.last_sequence + 1,
            timestamp: self.stamp(),
        };
        self.history().append(&message).await.map_err(ChatError::History)?;
        state.last_sequence = message.sequence;

        let reached = state.fan_out(ServerFrame::Message(message.clone()));
        debug!(%room_id, sequence = message.sequence, reached, "TALK relayed");
        Ok(Published::Delivered(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_outbox_stalls_and_signals_eviction() {
        let (outbox, mut rx) = Outbox::new(ConnectionId::new(), 1);
        let frame: Outbound = Arc::new(ServerFrame::bad_frame("x"));

        assert_eq!(outbox.deliver(&frame), Delivery::Queued);
        assert_eq!(outbox.deliver(&frame), Delivery::Stalled);
        // the permit is stored even though nobody was waiting yet
        rx.eviction().notified().await;
        assert_eq!(rx.drain().len(), 1);
    }

    #[test]
    fn closed_outbox_is_a_no_op() {
        let (outbox, rx) = Outbox::new(ConnectionId::new(), 4);
        drop(rx);
        let frame: Outbound = Arc::new(ServerFrame::bad_frame("x"));
        assert_eq!(outbox.deliver(&frame), Delivery::Gone);
    }
}
