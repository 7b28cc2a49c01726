use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::SqliteRepository;
use super::mapping::{conn, ser};
use crate::repository::{JobLockRepository, StorageError};

#[async_trait]
impl JobLockRepository for SqliteRepository {
    async fn try_acquire(
        &self,
        name: &str,
        holder: Uuid,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await.map_err(conn)?;

        let current = sqlx::query("SELECT holder, expires_at FROM job_locks WHERE name = ?1")
            .bind(name)
            .fetch_optional(&mut *tx)
            .await
            .map_err(conn)?;
        if let Some(row) = current {
            let owner: String = row.try_get("holder").map_err(ser)?;
            let expires_at: DateTime<Utc> = row.try_get("expires_at").map_err(ser)?;
            if owner != holder.to_string() && expires_at > now {
                return Ok(false);
            }
        }

        sqlx::query(
            r"
                INSERT INTO job_locks (name, holder, expires_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(name) DO UPDATE SET
                    holder = excluded.holder,
                    expires_at = excluded.expires_at
            ",
        )
        .bind(name)
        .bind(holder.to_string())
        .bind(now + ttl)
        .execute(&mut *tx)
        .await
        .map_err(conn)?;

        tx.commit().await.map_err(conn)?;
        Ok(true)
    }

    async fn release(&self, name: &str, holder: Uuid) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM job_locks WHERE name = ?1 AND holder = ?2")
            .bind(name)
            .bind(holder.to_string())
            .execute(&self.pool)
            .await
            .map_err(conn)?;
        Ok(())
    }
}
