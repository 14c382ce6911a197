use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use sqlx::SqlitePool;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use super::ids::{Role, RoomId, UserId};
use crate::db;

/// Listing id on the marketplace side. Opaque to the chat.
pub type ListingId = i64;

/// Fixed facts about a room, set when the listing service opens it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub room_id: RoomId,
    pub buyer: UserId,
    pub seller: UserId,
    pub product: ListingId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl RoomInfo {
    pub fn role_of(&self, user: UserId) -> Option<Role> {
        if user == self.buyer {
            Some(Role::Buyer)
        } else if user == self.seller {
            Some(Role::Seller)
        } else {
            None
        }
    }
}

/// Room metadata owned by the listing service.
#[async_trait]
pub trait RoomDirectory: Send + Sync {
    /// Returns the existing room for (buyer, product) or opens a new one.
    async fn create(&self, buyer: UserId, seller: UserId, product: ListingId) -> anyhow::Result<RoomInfo>;

    async fn get(&self, room_id: RoomId) -> anyhow::Result<Option<RoomInfo>>;

    /// Rooms `user` takes part in, optionally only those where it holds `role`.
    /// Newest first.
    async fn list_for(&self, user: UserId, role: Option<Role>) -> anyhow::Result<Vec<RoomInfo>>;

    async fn delete(&self, room_id: RoomId) -> anyhow::Result<bool>;
}

pub struct SqliteDirectory {
    db_pool: SqlitePool,
}

impl SqliteDirectory {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self { db_pool }
    }
}

type RoomRow = (String, i64, i64, i64, i64);

fn room_from_row((room_id, buyer, seller, product, created_at): RoomRow) -> anyhow::Result<RoomInfo> {
    Ok(RoomInfo {
        room_id: room_id.parse().with_context(|| format!("bad room id {room_id}"))?,
        buyer: UserId(buyer),
        seller: UserId(seller),
        product,
        created_at: db::from_millis(created_at)?,
    })
}

#[async_trait]
impl RoomDirectory for SqliteDirectory {
    async fn create(&self, buyer: UserId, seller: UserId, product: ListingId) -> anyhow::Result<RoomInfo> {
        let room_id = RoomId::new();
        sqlx::query(
            "INSERT INTO rooms (id,buyer_id,seller_id,listing_id,created_at) VALUES (?,?,?,?,?)
             ON CONFLICT (buyer_id,listing_id) DO NOTHING",
        )
        .bind(room_id.to_string())
        .bind(buyer.0)
        .bind(seller.0)
        .bind(product)
        .bind(db::to_millis(OffsetDateTime::now_utc()))
        .execute(&self.db_pool)
        .await?;

        let row: RoomRow = sqlx::query_as(
            "SELECT id,buyer_id,seller_id,listing_id,created_at FROM rooms WHERE buyer_id=? AND listing_id=?",
        )
        .bind(buyer.0)
        .bind(product)
        .fetch_one(&self.db_pool)
        .await?;
        room_from_row(row)
    }

    async fn get(&self, room_id: RoomId) -> anyhow::Result<Option<RoomInfo>> {
        let row: Option<RoomRow> =
            sqlx::query_as("SELECT id,buyer_id,seller_id,listing_id,created_at FROM rooms WHERE id=?")
                .bind(room_id.to_string())
                .fetch_optional(&self.db_pool)
                .await?;
        row.map(room_from_row).transpose()
    }

    async fn list_for(&self, user: UserId, role: Option<Role>) -> anyhow::Result<Vec<RoomInfo>> {
        let filter = match role {
            None => "buyer_id=?1 OR seller_id=?1",
            Some(Role::Buyer) => "buyer_id=?1",
            Some(Role::Seller) => "seller_id=?1",
        };
        let rows: Vec<RoomRow> = sqlx::query_as(&format!(
            "SELECT id,buyer_id,seller_id,listing_id,created_at FROM rooms WHERE {filter} ORDER BY created_at DESC, id DESC"
        ))
        .bind(user.0)
        .fetch_all(&self.db_pool)
        .await?;
        rows.into_iter().map(room_from_row).collect()
    }

    async fn delete(&self, room_id: RoomId) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM rooms WHERE id=?")
            .bind(room_id.to_string())
            .execute(&self.db_pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[derive(Default)]
pub struct MemoryDirectory {
    rooms: Mutex<HashMap<RoomId, RoomInfo>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RoomDirectory for MemoryDirectory {
    async fn create(&self, buyer: UserId, seller: UserId, product: ListingId) -> anyhow::Result<RoomInfo> {
        let mut rooms = self.rooms.lock().await;
        if let Some(existing) = rooms.values().find(|room| room.buyer == buyer && room.product == product) {
            return Ok(existing.clone());
        }
        let info = RoomInfo {
            room_id: RoomId::new(),
            buyer,
            seller,
            product,
            created_at: OffsetDateTime::now_utc(),
        };
        rooms.insert(info.room_id, info.clone());
        Ok(info)
    }

    async fn get(&self, room_id: RoomId) -> anyhow::Result<Option<RoomInfo>> {
        Ok(self.rooms.lock().await.get(&room_id).cloned())
    }

    async fn list_for(&self, user: UserId, role: Option<Role>) -> anyhow::Result<Vec<RoomInfo>> {
        let rooms = self.rooms.lock().await;
        let mut found: Vec<RoomInfo> = rooms
            .values()
            .filter(|room| match (room.role_of(user), role) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some(held), Some(wanted)) => held == wanted,
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.room_id.cmp(&a.room_id)));
        Ok(found)
    }

    async fn delete(&self, room_id: RoomId) -> anyhow::Result<bool> {
        Ok(self.rooms.lock().await.remove(&room_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn sqlite() -> SqliteDirectory {
        SqliteDirectory::new(db::memory_pool().await.unwrap())
    }

    #[tokio::test]
    async fn create_is_get_or_create_per_buyer_and_listing() {
        let directory = sqlite().await;
        let first = directory.create(UserId(1), UserId(2), 77).await.unwrap();
        let again = directory.create(UserId(1), UserId(2), 77).await.unwrap();
        let other = directory.create(UserId(3), UserId(2), 77).await.unwrap();

        assert_eq!(first.room_id, again.room_id);
        assert_ne!(first.room_id, other.room_id);
        assert_eq!(directory.get(first.room_id).await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn list_filters_by_role() {
        let directory = sqlite().await;
        directory.create(UserId(1), UserId(2), 10).await.unwrap();
        directory.create(UserId(2), UserId(3), 11).await.unwrap();

        assert_eq!(directory.list_for(UserId(2), None).await.unwrap().len(), 2);
        let selling = directory.list_for(UserId(2), Some(Role::Seller)).await.unwrap();
        assert_eq!(selling.len(), 1);
        assert_eq!(selling[0].product, 10);
        assert!(directory.list_for(UserId(9), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_reports_whether_room_existed() {
        let directory = sqlite().await;
        let room = directory.create(UserId(1), UserId(2), 10).await.unwrap();

        assert!(directory.delete(room.room_id).await.unwrap());
        assert!(!directory.delete(room.room_id).await.unwrap());
        assert_eq!(directory.get(room.room_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_directory_matches_role_rules() {
        let directory = MemoryDirectory::new();
        let room = directory.create(UserId(1), UserId(2), 10).await.unwrap();

        assert_eq!(room.role_of(UserId(1)), Some(Role::Buyer));
        assert_eq!(room.role_of(UserId(2)), Some(Role::Seller));
        assert_eq!(room.role_of(UserId(3)), None);
        assert_eq!(directory.list_for(UserId(1), Some(Role::Seller)).await.unwrap(), vec![]);
    }
}
