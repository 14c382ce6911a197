use std::str::FromStr;

use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use time::OffsetDateTime;

const SCHEMA: &str = include_str!("../res/schema.sql");

pub async fn connect(database_url: &str) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    let db_pool = SqlitePoolOptions::new()
        .max_connections(16)
        .connect_with(options)
        .await?;
    migrate(&db_pool).await?;
    Ok(db_pool)
}

/// A private in-memory database. One connection, kept forever, since each
/// sqlite memory connection is its own database.
pub async fn memory_pool() -> anyhow::Result<SqlitePool> {
    let db_pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    migrate(&db_pool).await?;
    Ok(db_pool)
}

pub async fn migrate(db_pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA)
        .execute(db_pool)
        .await?;
    Ok(())
}

pub fn to_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

/// `at` without the sub-millisecond part the message table cannot hold.
pub fn truncate_to_millis(at: OffsetDateTime) -> OffsetDateTime {
    at.replace_nanosecond(u32::from(at.millisecond()) * 1_000_000).unwrap_or(at)
}

pub fn from_millis(millis: i64) -> anyhow::Result<OffsetDateTime> {
    Ok(OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)?)
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn stored_millis_match_truncated_time() {
        let at = datetime!(2024-06-01 10:00:05.198004495 UTC);
        let truncated = truncate_to_millis(at);

        assert_eq!(truncated, datetime!(2024-06-01 10:00:05.198 UTC));
        assert_eq!(from_millis(to_millis(at)).unwrap(), truncated);
        assert_eq!(truncate_to_millis(truncated), truncated);
    }
}
