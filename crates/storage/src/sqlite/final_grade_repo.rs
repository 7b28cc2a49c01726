use async_trait::async_trait;
use chrono::{DateTime, Utc};
use progress_core::model::{CourseRunId, FinalGrade, FinalGradeStatus, GradingStatus, UserId};
use sqlx::Row;

use super::SqliteRepository;
use super::mapping::{collect, conn, map_final_grade_row, ser, to_i64, user_id_from_row, write_err};
use crate::repository::{FinalGradeRepository, StorageError};

const FINAL_GRADE_COLUMNS: &str = r"
    user_id, course_run_id, grade, passed, status, paid_on_platform, created_at, updated_at
";

#[async_trait]
impl FinalGradeRepository for SqliteRepository {
    async fn get_final_grade(
        &self,
        user: UserId,
        run: CourseRunId,
    ) -> Result<Option<FinalGrade>, StorageError> {
        let sql = format!(
            "SELECT {FINAL_GRADE_COLUMNS} FROM final_grades WHERE user_id = ?1 AND course_run_id = ?2"
        );
        let row = sqlx::query(&sql)
            .bind(to_i64("user_id", user.value())?)
            .bind(to_i64("course_run_id", run.value())?)
            .fetch_optional(&self.pool)
            .await
            .map_err(conn)?;
        row.as_ref().map(map_final_grade_row).transpose()
    }

    async fn final_grades_for_user(&self, user: UserId) -> Result<Vec<FinalGrade>, StorageError> {
        let sql = format!(
            "SELECT {FINAL_GRADE_COLUMNS} FROM final_grades WHERE user_id = ?1 ORDER BY course_run_id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(to_i64("user_id", user.value())?)
            .fetch_all(&self.pool)
            .await
            .map_err(conn)?;
        collect(&rows, map_final_grade_row)
    }

    async fn save_complete(&self, grade: &FinalGrade) -> Result<FinalGrade, StorageError> {
        let user_id = to_i64("user_id", grade.user_id.value())?;
        let run_id = to_i64("course_run_id", grade.course_run_id.value())?;
        let mut tx = self.pool.begin().await.map_err(conn)?;

        // A complete row is left as is; the select below returns it.
        sqlx::query(
            r"
                INSERT INTO final_grades (
                    user_id, course_run_id, grade, passed, status,
                    paid_on_platform, created_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(user_id, course_run_id) DO UPDATE SET
                    grade = excluded.grade,
                    passed = excluded.passed,
                    status = excluded.status,
                    paid_on_platform = excluded.paid_on_platform,
                    updated_at = excluded.updated_at
                WHERE final_grades.status <> ?9
            ",
        )
        .bind(user_id)
        .bind(run_id)
        .bind(grade.grade)
        .bind(grade.passed)
        .bind(grade.status.as_str())
        .bind(grade.paid_on_platform)
        .bind(grade.created_at)
        .bind(grade.updated_at)
        .bind(FinalGradeStatus::Complete.as_str())
        .execute(&mut *tx)
        .await
        .map_err(write_err)?;

        let sql = format!(
            "SELECT {FINAL_GRADE_COLUMNS} FROM final_grades WHERE user_id = ?1 AND course_run_id = ?2"
        );
        let row = sqlx::query(&sql)
            .bind(user_id)
            .bind(run_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(conn)?;
        let stored = map_final_grade_row(&row)?;

        tx.commit().await.map_err(conn)?;
        Ok(stored)
    }

    async fn users_with_complete_grade(
        &self,
        run: CourseRunId,
    ) -> Result<Vec<UserId>, StorageError> {
        let rows = sqlx::query(
            r"
                SELECT user_id
                FROM final_grades
                WHERE course_run_id = ?1 AND status = ?2
                ORDER BY user_id ASC
            ",
        )
        .bind(to_i64("course_run_id", run.value())?)
        .bind(FinalGradeStatus::Complete.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(conn)?;
        collect(&rows, user_id_from_row)
    }

    async fn grading_status(
        &self,
        run: CourseRunId,
    ) -> Result<Option<GradingStatus>, StorageError> {
        let row = sqlx::query("SELECT status FROM course_run_grading_status WHERE course_run_id = ?1")
            .bind(to_i64("course_run_id", run.value())?)
            .fetch_optional(&self.pool)
            .await
            .map_err(conn)?;
        row.map(|row| {
            row.try_get::<String, _>("status")
                .map_err(ser)?
                .parse::<GradingStatus>()
                .map_err(ser)
        })
        .transpose()
    }

    async fn set_grading_status(
        &self,
        run: CourseRunId,
        status: GradingStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r"
                INSERT INTO course_run_grading_status (course_run_id, status, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(course_run_id) DO UPDATE SET
                    status = excluded.status,
                    updated_at = excluded.updated_at
            ",
        )
        .bind(to_i64("course_run_id", run.value())?)
        .bind(status.as_str())
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(write_err)?;
        Ok(())
    }
}
