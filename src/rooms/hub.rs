use std::sync::Arc;

use time::OffsetDateTime;
use tracing::info;

use super::{
    directory::{ListingId, RoomDirectory, RoomInfo},
    history::HistoryStore,
    ids::{Participant, Role, RoomId, UserId},
    msg::Message,
    registry::RoomRegistry,
    schedule::SlotWindow,
};
use crate::{clock::Clock, db, ChatError};

/// The chat core: live rooms plus the collaborators they lean on.
///
/// Operations are split by concern: presence in `presence.rs`, TALK relay
/// in `relay.rs`, negotiation in `schedule.rs`.
pub struct Hub {
    registry: RoomRegistry,
    directory: Arc<dyn RoomDirectory>,
    history: Arc<dyn HistoryStore>,
    window: SlotWindow,
    clock: Arc<dyn Clock>,
}

impl Hub {
    pub fn new(
        directory: Arc<dyn RoomDirectory>,
        history: Arc<dyn HistoryStore>,
        window: SlotWindow,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry: RoomRegistry::new(directory.clone(), history.clone()),
            directory,
            history,
            window,
            clock,
        }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub fn history(&self) -> &dyn HistoryStore {
        self.history.as_ref()
    }

    pub fn window(&self) -> SlotWindow {
        self.window
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Timestamp for a new message, at the precision history keeps.
    pub(crate) fn stamp(&self) -> OffsetDateTime {
        db::truncate_to_millis(self.clock.now())
    }

    /// Opens (or finds) the room for a buyer's interest in a listing.
    pub async fn open_room(&self, buyer: UserId, seller: UserId, product: ListingId) -> Result<RoomInfo, ChatError> {
        if buyer == seller {
            return Err(ChatError::SelfDealing);
        }
        let info = self
            .directory
            .create(buyer, seller, product)
            .await
            .map_err(ChatError::Directory)?;
        info!(room_id = %info.room_id, %buyer, %seller, product, "room opened");
        Ok(info)
    }

    /// Rooms of `user` with their latest TALK, newest room first.
    pub async fn rooms_of(&self, user: UserId, role: Option<Role>) -> Result<Vec<(RoomInfo, Option<Message>)>, ChatError> {
        let rooms = self.directory.list_for(user, role).await.map_err(ChatError::Directory)?;
        let mut summaries = Vec::with_capacity(rooms.len());
        for room in rooms {
            let last = self.history.last_message(room.room_id).await.map_err(ChatError::History)?;
            summaries.push((room, last));
        }
        Ok(summaries)
    }

    /// Stored TALK messages after `since`, for a participant of the room.
    pub async fn history_for(
        &self,
        room_id: RoomId,
        participant: &Participant,
        since: u64,
    ) -> Result<Vec<Message>, ChatError> {
        self.authorize(room_id, participant.user_id).await?;
        self.history.list_since(room_id, since).await.map_err(ChatError::History)
    }

    /// Retention: deletes the room and its log, and forgets its live state.
    ///
    /// The live room is closed before the log is purged, so a TALK racing
    /// the delete is either purged with the rest or refused.
    pub async fn close_room(&self, room_id: RoomId, participant: &Participant) -> Result<(), ChatError> {
        self.authorize(room_id, participant.user_id).await?;
        self.directory.delete(room_id).await.map_err(ChatError::Directory)?;
        self.registry.evict(room_id).await;
        let purged = self.history.purge(room_id).await.map_err(ChatError::History)?;
        info!(%room_id, by = %participant.user_id, purged, "room closed");
        Ok(())
    }

    /// Checks membership without loading the room into the registry.
    async fn authorize(&self, room_id: RoomId, user: UserId) -> Result<RoomInfo, ChatError> {
        let info = match self.registry.get(room_id) {
            Some(room) => room.info().clone(),
            None => self
                .directory
                .get(room_id)
                .await
                .map_err(ChatError::Directory)?
                .ok_or(ChatError::RoomNotFound(room_id))?,
        };
        match info.role_of(user) {
            Some(_) => Ok(info),
            None => Err(ChatError::Unauthorized { room: room_id, user }),
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use time::macros::datetime;
    use tokio::sync::{oneshot, Mutex, Notify};

    use super::*;
    use crate::{
        clock::FixedClock,
        rooms::{
            directory::MemoryDirectory,
            history::{MemoryHistory, SqliteHistory},
            ids::ConnectionId,
            presence::{Entered, Presence, Released},
            relay::{Outbox, Published},
            schedule::{Proposal, SlotMap},
        },
    };

    fn hub() -> Hub {
        Hub::new(
            Arc::new(MemoryDirectory::new()),
            Arc::new(MemoryHistory::new()),
            SlotWindow::default(),
            Arc::new(FixedClock::new(datetime!(2024-06-01 10:00 UTC))),
        )
    }

    #[tokio::test]
    async fn open_room_refuses_self_dealing() {
        let hub = hub();
        assert!(matches!(hub.open_room(UserId(1), UserId(1), 5).await, Err(ChatError::SelfDealing)));
    }

    #[tokio::test]
    async fn outsider_is_rejected_without_loading_room() {
        let hub = hub();
        let room = hub.open_room(UserId(1), UserId(2), 5).await.unwrap();
        let outsider = Participant::new(3, "eve");

        let err = hub.registry().admit(room.room_id, &outsider).await.unwrap_err();
        assert!(matches!(err, ChatError::Unauthorized { .. }));
        assert!(hub.registry().is_empty());
        assert!(matches!(
            hub.history_for(room.room_id, &outsider, 0).await,
            Err(ChatError::Unauthorized { .. })
        ));
    }

    #[tokio::test]
    async fn admit_is_idempotent() {
        let hub = hub();
        let room = hub.open_room(UserId(1), UserId(2), 5).await.unwrap();
        let buyer = Participant::new(1, "kim");

        let first = hub.registry().admit(room.room_id, &buyer).await.unwrap();
        let second = hub.registry().admit(room.room_id, &buyer).await.unwrap();
        assert!(Arc::ptr_eq(first.room(), second.room()));
        assert_eq!(first.role(), Role::Buyer);
        assert_eq!(hub.registry().len(), 1);
    }

    #[tokio::test]
    async fn inactive_room_keeps_sequence_and_negotiation() {
        let hub = hub();
        let room = hub.open_room(UserId(1), UserId(2), 5).await.unwrap();
        let buyer = Participant::new(1, "kim");
        let conn = ConnectionId::new();
        let (outbox, _rx) = Outbox::new(conn, 16);

        assert_eq!(hub.enter(room.room_id, &buyer, &outbox, 0).await.unwrap(), Entered::Joined);
        hub.publish(room.room_id, &buyer, "hi").await.unwrap();
        let proposal: Proposal = serde_json::from_str(r#"{"2024-06-02":[9]}"#).unwrap();
        let slots: SlotMap = serde_json::from_str(r#"{"2024-06-02":[9]}"#).unwrap();
        hub.propose(room.room_id, &buyer, proposal).await.unwrap();

        let released = hub.release(room.room_id, &buyer, conn).await.unwrap();
        assert_eq!(released, Released::Left { room_inactive: true });
        assert_eq!(hub.presence(room.room_id, UserId(1)).await, Presence::Absent);

        let live = hub.registry().get(room.room_id).unwrap();
        let state = live.lock().await;
        assert_eq!(state.last_sequence(), 1);
        assert_eq!(state.negotiation().proposal(Role::Buyer), Some(&slots));
    }

    #[tokio::test]
    async fn publish_requires_presence() {
        let hub = hub();
        let room = hub.open_room(UserId(1), UserId(2), 5).await.unwrap();
        let seller = Participant::new(2, "lee");

        assert!(matches!(
            hub.publish(room.room_id, &seller, "hello").await,
            Err(ChatError::NotEntered(_))
        ));
    }

    #[tokio::test]
    async fn blank_talk_is_dropped_without_sequencing() {
        let hub = hub();
        let room = hub.open_room(UserId(1), UserId(2), 5).await.unwrap();
        let buyer = Participant::new(1, "kim");
        let (outbox, _rx) = Outbox::new(ConnectionId::new(), 16);
        hub.enter(room.room_id, &buyer, &outbox, 0).await.unwrap();

        assert_eq!(hub.publish(room.room_id, &buyer, "   ").await.unwrap(), Published::Dropped);
        let Published::Delivered(msg) = hub.publish(room.room_id, &buyer, "hello").await.unwrap() else {
            panic!("expected delivery");
        };
        assert_eq!(msg.sequence, 1);
    }

    #[tokio::test]
    async fn close_room_forgets_everything() {
        let hub = hub();
        let room = hub.open_room(UserId(1), UserId(2), 5).await.unwrap();
        let buyer = Participant::new(1, "kim");
        let (outbox, _rx) = Outbox::new(ConnectionId::new(), 16);
        hub.enter(room.room_id, &buyer, &outbox, 0).await.unwrap();
        hub.publish(room.room_id, &buyer, "hi").await.unwrap();

        hub.close_room(room.room_id, &buyer).await.unwrap();
        assert!(hub.registry().get(room.room_id).is_none());
        assert!(matches!(
            hub.history_for(room.room_id, &buyer, 0).await,
            Err(ChatError::RoomNotFound(_))
        ));
    }

    #[tokio::test]
    async fn rooms_of_reports_last_talk() {
        let hub = hub();
        let room = hub.open_room(UserId(1), UserId(2), 5).await.unwrap();
        hub.open_room(UserId(3), UserId(2), 6).await.unwrap();
        let buyer = Participant::new(1, "kim");
        let (outbox, _rx) = Outbox::new(ConnectionId::new(), 16);
        hub.enter(room.room_id, &buyer, &outbox, 0).await.unwrap();
        hub.publish(room.room_id, &buyer, "still available?").await.unwrap();

        let mine = hub.rooms_of(UserId(1), None).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].1.as_ref().map(|msg| msg.message.as_str()), Some("still available?"));
        assert_eq!(hub.rooms_of(UserId(2), Some(Role::Seller)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn relayed_talk_matches_stored_copy() {
        let db_pool = db::memory_pool().await.unwrap();
        let hub = Hub::new(
            Arc::new(MemoryDirectory::new()),
            Arc::new(SqliteHistory::new(db_pool)),
            SlotWindow::default(),
            Arc::new(FixedClock::new(datetime!(2024-06-01 10:00:05.198004495 UTC))),
        );
        let room = hub.open_room(UserId(1), UserId(2), 5).await.unwrap();
        let buyer = Participant::new(1, "kim");
        let (outbox, _rx) = Outbox::new(ConnectionId::new(), 16);
        hub.enter(room.room_id, &buyer, &outbox, 0).await.unwrap();

        let Published::Delivered(live) = hub.publish(room.room_id, &buyer, "hi").await.unwrap() else {
            panic!("expected delivery");
        };
        assert_eq!(live.timestamp, datetime!(2024-06-01 10:00:05.198 UTC));
        assert_eq!(hub.history_for(room.room_id, &buyer, 0).await.unwrap(), vec![live]);
    }

    #[tokio::test]
    async fn handle_taken_before_close_cannot_act() {
        let hub = hub();
        let room = hub.open_room(UserId(1), UserId(2), 5).await.unwrap();
        let buyer = Participant::new(1, "kim");
        let stale = hub.registry().admit(room.room_id, &buyer).await.unwrap();

        hub.close_room(room.room_id, &buyer).await.unwrap();
        assert!(matches!(stale.room().lock_open().await, Err(ChatError::RoomNotFound(_))));
        assert!(matches!(
            hub.publish(room.room_id, &buyer, "still there?").await,
            Err(ChatError::RoomNotFound(_))
        ));
    }

    /// Holds the first `get` after it has read the room, until released.
    struct PausedDirectory {
        inner: MemoryDirectory,
        gate: Mutex<Option<oneshot::Receiver<()>>>,
        paused: Notify,
    }

    #[async_trait]
    impl RoomDirectory for PausedDirectory {
        async fn create(&self, buyer: UserId, seller: UserId, product: ListingId) -> anyhow::Result<RoomInfo> {
            self.inner.create(buyer, seller, product).await
        }

        async fn get(&self, room_id: RoomId) -> anyhow::Result<Option<RoomInfo>> {
            let info = self.inner.get(room_id).await?;
            let gate = self.gate.lock().await.take();
            if let Some(gate) = gate {
                self.paused.notify_one();
                let _ = gate.await;
            }
            Ok(info)
        }

        async fn list_for(&self, user: UserId, role: Option<Role>) -> anyhow::Result<Vec<RoomInfo>> {
            self.inner.list_for(user, role).await
        }

        async fn delete(&self, room_id: RoomId) -> anyhow::Result<bool> {
            self.inner.delete(room_id).await
        }
    }

    #[tokio::test]
    async fn admission_racing_close_does_not_revive_room() {
        let (release, gate) = oneshot::channel();
        let directory = Arc::new(PausedDirectory {
            inner: MemoryDirectory::new(),
            gate: Mutex::new(None),
            paused: Notify::new(),
        });
        let hub = Arc::new(Hub::new(
            directory.clone(),
            Arc::new(MemoryHistory::new()),
            SlotWindow::default(),
            Arc::new(FixedClock::new(datetime!(2024-06-01 10:00 UTC))),
        ));
        let room_id = hub.open_room(UserId(1), UserId(2), 5).await.unwrap().room_id;
        let buyer = Participant::new(1, "kim");
        *directory.gate.lock().await = Some(gate);

        let admitting = tokio::spawn({
            let hub = hub.clone();
            let buyer = buyer.clone();
            async move { hub.registry().admit(room_id, &buyer).await.map(|_| ()) }
        });
        directory.paused.notified().await;

        hub.close_room(room_id, &buyer).await.unwrap();
        release.send(()).unwrap();

        assert!(matches!(admitting.await.unwrap(), Err(ChatError::RoomNotFound(_))));
        assert!(hub.registry().is_empty());
    }
}
