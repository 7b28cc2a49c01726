use async_trait::async_trait;
use chrono::{DateTime, Utc};
use progress_core::model::{CacheKind, CacheRefreshMarker, CachedRecord, CourseRunId, UserId};
use sqlx::Row;

use super::SqliteRepository;
use super::mapping::{
    collect, conn, map_cached_record_row, marker_column, payload_to_text, ser, to_i64,
    user_id_from_row, write_err,
};
use crate::repository::{CacheEntry, CacheRepository, StorageError};

#[async_trait]
impl CacheRepository for SqliteRepository {
    async fn records(
        &self,
        user: UserId,
        kind: CacheKind,
    ) -> Result<Vec<CachedRecord>, StorageError> {
        let rows = sqlx::query(
            r"
                SELECT r.user_id, r.course_run_id, r.kind, r.payload, r.last_request
                FROM cached_records r
                JOIN course_runs cr ON cr.id = r.course_run_id
                JOIN courses c ON c.id = cr.course_id
                JOIN programs p ON p.id = c.program_id
                WHERE r.user_id = ?1
                  AND r.kind = ?2
                  AND cr.is_discontinued = 0
                  AND p.live = 1
                ORDER BY r.course_run_id ASC
            ",
        )
        .bind(to_i64("user_id", user.value())?)
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(conn)?;
        collect(&rows, map_cached_record_row)
    }

    async fn replace_kind(
        &self,
        user: UserId,
        kind: CacheKind,
        entries: &[CacheEntry],
        refreshed_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let user_id = to_i64("user_id", user.value())?;
        let mut tx = self.pool.begin().await.map_err(conn)?;

        for (run, payload) in entries {
            sqlx::query(
                r"
                    INSERT INTO cached_records (
                        user_id, course_run_id, kind, payload, last_request
                    )
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    ON CONFLICT(user_id, course_run_id, kind) DO UPDATE SET
                        payload = excluded.payload,
                        last_request = excluded.last_request
                ",
            )
            .bind(user_id)
            .bind(to_i64("course_run_id", run.value())?)
            .bind(kind.as_str())
            .bind(payload_to_text(payload.as_ref())?)
            .bind(refreshed_at)
            .execute(&mut *tx)
            .await
            .map_err(write_err)?;
        }

        let column = marker_column(kind);
        let sql = format!(
            r"
                INSERT INTO cache_refresh_markers (user_id, {column})
                VALUES (?1, ?2)
                ON CONFLICT(user_id) DO UPDATE SET {column} = excluded.{column}
            "
        );
        sqlx::query(&sql)
            .bind(user_id)
            .bind(refreshed_at)
            .execute(&mut *tx)
            .await
            .map_err(conn)?;

        tx.commit().await.map_err(conn)?;
        tracing::debug!(user_id = %user, kind = %kind, records = entries.len(), "cache kind replaced");
        Ok(())
    }

    async fn marker(&self, user: UserId) -> Result<CacheRefreshMarker, StorageError> {
        let row = sqlx::query(
            r"
                SELECT enrollment_at, certificate_at, current_grade_at
                FROM cache_refresh_markers
                WHERE user_id = ?1
            ",
        )
        .bind(to_i64("user_id", user.value())?)
        .fetch_optional(&self.pool)
        .await
        .map_err(conn)?;

        let Some(row) = row else {
            return Ok(CacheRefreshMarker::empty(user));
        };
        Ok(CacheRefreshMarker {
            user_id: user,
            enrollment: row.try_get("enrollment_at").map_err(ser)?,
            certificate: row.try_get("certificate_at").map_err(ser)?,
            current_grade: row.try_get("current_grade_at").map_err(ser)?,
        })
    }

    async fn users_enrolled_in_run(&self, run: CourseRunId) -> Result<Vec<UserId>, StorageError> {
        let rows = sqlx::query(
            r"
                SELECT user_id
                FROM cached_records
                WHERE course_run_id = ?1
                  AND kind = 'enrollment'
                  AND payload IS NOT NULL
                  AND json_extract(payload, '$.is_active') = 1
                ORDER BY user_id ASC
            ",
        )
        .bind(to_i64("course_run_id", run.value())?)
        .fetch_all(&self.pool)
        .await
        .map_err(conn)?;
        collect(&rows, user_id_from_row)
    }

    async fn record_refresh_failure(
        &self,
        user: UserId,
        at: DateTime<Utc>,
    ) -> Result<u32, StorageError> {
        let row = sqlx::query(
            r"
                INSERT INTO refresh_failures (user_id, failures, last_failure_at)
                VALUES (?1, 1, ?2)
                ON CONFLICT(user_id) DO UPDATE SET
                    failures = refresh_failures.failures + 1,
                    last_failure_at = excluded.last_failure_at
                RETURNING failures
            ",
        )
        .bind(to_i64("user_id", user.value())?)
        .bind(at)
        .fetch_one(&self.pool)
        .await
        .map_err(conn)?;
        let failures: i64 = row.try_get("failures").map_err(ser)?;
        u32::try_from(failures)
            .map_err(|_| StorageError::Serialization(format!("invalid failures: {failures}")))
    }

    async fn reset_refresh_failures(&self, user: UserId) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM refresh_failures WHERE user_id = ?1")
            .bind(to_i64("user_id", user.value())?)
            .execute(&self.pool)
            .await
            .map_err(conn)?;
        Ok(())
    }

    async fn refresh_failures(&self, user: UserId) -> Result<u32, StorageError> {
        let failures: Option<i64> =
            sqlx::query_scalar("SELECT failures FROM refresh_failures WHERE user_id = ?1")
                .bind(to_i64("user_id", user.value())?)
                .fetch_optional(&self.pool)
                .await
                .map_err(conn)?;
        let failures = failures.unwrap_or(0);
        u32::try_from(failures)
            .map_err(|_| StorageError::Serialization(format!("invalid failures: {failures}")))
    }
}
