use async_trait::async_trait;
use progress_core::model::{PlatformUser, UserId};
use sqlx::Row;

use super::SqliteRepository;
use super::mapping::{conn, map_user_row, ser, to_i64, write_err};
use crate::repository::{StorageError, UserRepository};

#[async_trait]
impl UserRepository for SqliteRepository {
    async fn upsert_user(&self, user: &PlatformUser) -> Result<(), StorageError> {
        sqlx::query(
            r"
                INSERT INTO platform_users (id, username, access_token, token_expires_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(id) DO UPDATE SET
                    username = excluded.username,
                    access_token = excluded.access_token,
                    token_expires_at = excluded.token_expires_at
            ",
        )
        .bind(to_i64("user_id", user.id.value())?)
        .bind(&user.username)
        .bind(&user.access_token)
        .bind(user.token_expires_at)
        .execute(&self.pool)
        .await
        .map_err(write_err)?;
        Ok(())
    }

    async fn get_user(&self, id: UserId) -> Result<PlatformUser, StorageError> {
        let row = sqlx::query(
            r"
                SELECT id, username, access_token, token_expires_at
                FROM platform_users
                WHERE id = ?1
            ",
        )
        .bind(to_i64("user_id", id.value())?)
        .fetch_optional(&self.pool)
        .await
        .map_err(conn)?
        .ok_or(StorageError::NotFound)?;
        map_user_row(&row)
    }

    async fn list_user_ids(&self) -> Result<Vec<UserId>, StorageError> {
        let rows = sqlx::query("SELECT id FROM platform_users ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(conn)?;
        rows.iter()
            .map(|row| {
                let id: i64 = row.try_get("id").map_err(ser)?;
                u64::try_from(id)
                    .map(UserId::new)
                    .map_err(|_| StorageError::Serialization(format!("invalid user id: {id}")))
            })
            .collect()
    }
}
