use async_trait::async_trait;
use progress_core::model::{CourseId, ExamAuthorization, FinancialAid, Payment, ProgramId, UserId};

use super::SqliteRepository;
use super::mapping::{
    collect, conn, map_authorization_row, map_financial_aid_row, map_payment_row, to_i64,
    write_err,
};
use crate::repository::{LedgerRepository, StorageError};

#[async_trait]
impl LedgerRepository for SqliteRepository {
    async fn upsert_payment(&self, payment: &Payment) -> Result<(), StorageError> {
        sqlx::query(
            r"
                INSERT INTO payments (id, user_id, course_key, status, paid_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(id) DO UPDATE SET
                    user_id = excluded.user_id,
                    course_key = excluded.course_key,
                    status = excluded.status,
                    paid_at = excluded.paid_at
            ",
        )
        .bind(to_i64("payment_id", payment.id.value())?)
        .bind(to_i64("user_id", payment.user_id.value())?)
        .bind(&payment.course_key)
        .bind(payment.status.as_str())
        .bind(payment.paid_at)
        .execute(&self.pool)
        .await
        .map_err(write_err)?;
        Ok(())
    }

    async fn payments_for_user(&self, user: UserId) -> Result<Vec<Payment>, StorageError> {
        let rows = sqlx::query(
            r"
                SELECT id, user_id, course_key, status, paid_at
                FROM payments
                WHERE user_id = ?1
                ORDER BY paid_at ASC, id ASC
            ",
        )
        .bind(to_i64("user_id", user.value())?)
        .fetch_all(&self.pool)
        .await
        .map_err(conn)?;
        collect(&rows, map_payment_row)
    }

    async fn upsert_financial_aid(&self, aid: &FinancialAid) -> Result<(), StorageError> {
        sqlx::query(
            r"
                INSERT INTO financial_aid (user_id, tier_program_id, status, created_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(user_id, tier_program_id) DO UPDATE SET
                    status = excluded.status,
                    created_at = excluded.created_at
            ",
        )
        .bind(to_i64("user_id", aid.user_id.value())?)
        .bind(to_i64("tier_program_id", aid.tier_program_id.value())?)
        .bind(aid.status.as_str())
        .bind(aid.created_at)
        .execute(&self.pool)
        .await
        .map_err(write_err)?;
        Ok(())
    }

    async fn financial_aid_for_program(
        &self,
        user: UserId,
        program: ProgramId,
    ) -> Result<Vec<FinancialAid>, StorageError> {
        let rows = sqlx::query(
            r"
                SELECT fa.user_id, fa.tier_program_id, fa.status, fa.created_at
                FROM financial_aid fa
                JOIN tier_programs t ON t.id = fa.tier_program_id
                WHERE fa.user_id = ?1 AND t.program_id = ?2
                ORDER BY fa.created_at DESC
            ",
        )
        .bind(to_i64("user_id", user.value())?)
        .bind(to_i64("program_id", program.value())?)
        .fetch_all(&self.pool)
        .await
        .map_err(conn)?;
        collect(&rows, map_financial_aid_row)
    }

    async fn upsert_exam_authorization(
        &self,
        authorization: &ExamAuthorization,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r"
                INSERT INTO exam_authorizations (
                    user_id, course_id, exam_run_id, status, exam_taken
                )
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(user_id, exam_run_id) DO UPDATE SET
                    course_id = excluded.course_id,
                    status = excluded.status,
                    exam_taken = excluded.exam_taken
            ",
        )
        .bind(to_i64("user_id", authorization.user_id.value())?)
        .bind(to_i64("course_id", authorization.course_id.value())?)
        .bind(to_i64("exam_run_id", authorization.exam_run_id.value())?)
        .bind(authorization.status.as_str())
        .bind(authorization.exam_taken)
        .execute(&self.pool)
        .await
        .map_err(write_err)?;
        Ok(())
    }

    async fn exam_authorizations(
        &self,
        user: UserId,
        course: CourseId,
    ) -> Result<Vec<ExamAuthorization>, StorageError> {
        let rows = sqlx::query(
            r"
                SELECT user_id, course_id, exam_run_id, status, exam_taken
                FROM exam_authorizations
                WHERE user_id = ?1 AND course_id = ?2
                ORDER BY exam_run_id ASC
            ",
        )
        .bind(to_i64("user_id", user.value())?)
        .bind(to_i64("course_id", course.value())?)
        .fetch_all(&self.pool)
        .await
        .map_err(conn)?;
        collect(&rows, map_authorization_row)
    }
}
