//! Optional SQLite mirror of per-app build times. Purely a cache on top of
//! the state directory; the registry falls back to the on-disk documents
//! whenever the index has no answer.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::warn;

pub struct TimeIndex {
    pool: SqlitePool,
}

impl TimeIndex {
    pub async fn new(path: &Path) -> sqlx::Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS build_times (
                app TEXT PRIMARY KEY,  -- app name
                build_time TEXT        -- RFC 3339 timestamp of the last build start
            )",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub async fn stamp(&self, app: &str, time: DateTime<Utc>) -> sqlx::Result<()> {
        sqlx::query(
            "INSERT INTO build_times (app, build_time) VALUES (?, ?)
             ON CONFLICT(app) DO UPDATE SET build_time = excluded.build_time",
        )
        .bind(app)
        .bind(time.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn last_build_time(&self, app: &str) -> sqlx::Result<Option<DateTime<Utc>>> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT build_time FROM build_times WHERE app = ?")
                .bind(app)
                .fetch_optional(&self.pool)
                .await?;

        Ok(raw.and_then(|raw| match DateTime::parse_from_rfc3339(&raw) {
            Ok(time) => Some(time.with_timezone(&Utc)),
            Err(err) => {
                warn!(%app, %err, "unparseable build time in index");
                None
            }
        }))
    }
}
