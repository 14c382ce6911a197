use std::collections::HashMap;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use super::{
    ids::{RoomId, UserId},
    msg::{Message, MessageKind},
};
use crate::db;

/// Append-only chat log, one sequence per room.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, message: &Message) -> anyhow::Result<()>;

    /// Messages with `sequence > from_sequence`, in sequence order.
    async fn list_since(&self, room_id: RoomId, from_sequence: u64) -> anyhow::Result<Vec<Message>>;

    /// 0 for a room with no messages yet.
    async fn last_sequence(&self, room_id: RoomId) -> anyhow::Result<u64>;

    async fn last_message(&self, room_id: RoomId) -> anyhow::Result<Option<Message>>;

    async fn purge(&self, room_id: RoomId) -> anyhow::Result<u64>;
}

pub struct SqliteHistory {
    db_pool: SqlitePool,
}

impl SqliteHistory {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self { db_pool }
    }
}

type MessageRow = (String, i64, i64, String, String, String, i64);

fn message_from_row(
    (room_id, sequence, sender_id, nickname, kind, body, sent_at): MessageRow,
) -> anyhow::Result<Message> {
    Ok(Message {
        room_id: room_id.parse().with_context(|| format!("bad room id {room_id}"))?,
        sender_id: UserId(sender_id),
        nickname,
        message: body,
        kind: MessageKind::parse(&kind).ok_or_else(|| anyhow!("bad message kind {kind}"))?,
        sequence: u64::try_from(sequence)?,
        timestamp: db::from_millis(sent_at)?,
    })
}

const MESSAGE_COLUMNS: &str = "room_id,sequence,sender_id,nickname,kind,body,sent_at";

#[async_trait]
impl HistoryStore for SqliteHistory {
    async fn append(&self, message: &Message) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO messages (room_id,sequence,sender_id,nickname,kind,body,sent_at) VALUES (?,?,?,?,?,?,?)",
        )
        .bind(message.room_id.to_string())
        .bind(i64::try_from(message.sequence)?)
        .bind(message.sender_id.0)
        .bind(&message.nickname)
        .bind(message.kind.as_str())
        .bind(&message.message)
        .bind(db::to_millis(message.timestamp))
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }

    async fn list_since(&self, room_id: RoomId, from_sequence: u64) -> anyhow::Result<Vec<Message>> {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE room_id=? AND sequence>? ORDER BY sequence"
        ))
        .bind(room_id.to_string())
        .bind(i64::try_from(from_sequence)?)
        .fetch_all(&self.db_pool)
        .await?;
        rows.into_iter().map(message_from_row).collect()
    }

    async fn last_sequence(&self, room_id: RoomId) -> anyhow::Result<u64> {
        let (last,): (Option<i64>,) = sqlx::query_as("SELECT MAX(sequence) FROM messages WHERE room_id=?")
            .bind(room_id.to_string())
            .fetch_one(&self.db_pool)
            .await?;
        Ok(u64::try_from(last.unwrap_or(0))?)
    }

    async fn last_message(&self, room_id: RoomId) -> anyhow::Result<Option<Message>> {
        let row: Option<MessageRow> = sqlx::query_as(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE room_id=? ORDER BY sequence DESC LIMIT 1"
        ))
        .bind(room_id.to_string())
        .fetch_optional(&self.db_pool)
        .await?;
        row.map(message_from_row).transpose()
    }

    async fn purge(&self, room_id: RoomId) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM messages WHERE room_id=?")
            .bind(room_id.to_string())
            .execute(&self.db_pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Default)]
pub struct MemoryHistory {
    rooms: Mutex<HashMap<RoomId, Vec<Message>>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn append(&self, message: &Message) -> anyhow::Result<()> {
        let mut rooms = self.rooms.lock().await;
        let log = rooms.entry(message.room_id).or_default();
        let expected = log.last().map_or(1, |last| last.sequence + 1);
        if message.sequence != expected {
            return Err(anyhow!(
                "room {} expected sequence {expected}, got {}",
                message.room_id,
                message.sequence
            ));
        }
        log.push(message.clone());
        Ok(())
    }

    async fn list_since(&self, room_id: RoomId, from_sequence: u64) -> anyhow::Result<Vec<Message>> {
        let rooms = self.rooms.lock().await;
        Ok(rooms
            .get(&room_id)
            .map(|log| log.iter().filter(|msg| msg.sequence > from_sequence).cloned().collect())
            .unwrap_or_default())
    }

    async fn last_sequence(&self, room_id: RoomId) -> anyhow::Result<u64> {
        let rooms = self.rooms.lock().await;
        Ok(rooms.get(&room_id).and_then(|log| log.last()).map_or(0, |msg| msg.sequence))
    }

    async fn last_message(&self, room_id: RoomId) -> anyhow::Result<Option<Message>> {
        let rooms = self.rooms.lock().await;
        Ok(rooms.get(&room_id).and_then(|log| log.last()).cloned())
    }

    async fn purge(&self, room_id: RoomId) -> anyhow::Result<u64> {
        let removed = self.rooms.lock().await.remove(&room_id);
        Ok(removed.map_or(0, |log| log.len() as u64))
    }
}
