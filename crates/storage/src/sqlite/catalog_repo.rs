use async_trait::async_trait;
use progress_core::model::{
    Course, CourseId, CoursePrice, CourseRun, CourseRunId, ExamRun, ExamRunId, Program,
    ProgramId, TierProgram, TierProgramId,
};

use super::SqliteRepository;
use super::mapping::{
    COURSE_RUN_COLUMNS, collect, conn, map_course_row, map_course_run_row, map_exam_run_row,
    map_price_row, map_program_row, map_tier_row, ser, to_i64, write_err,
};
use crate::repository::{CatalogRepository, StorageError};

#[async_trait]
impl CatalogRepository for SqliteRepository {
    async fn upsert_program(&self, program: &Program) -> Result<(), StorageError> {
        program.validate().map_err(ser)?;
        sqlx::query(
            r"
                INSERT INTO programs (
                    id, title, live, financial_aid_availability,
                    exam_attempts_first_date, exam_attempts_second_date
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title,
                    live = excluded.live,
                    financial_aid_availability = excluded.financial_aid_availability,
                    exam_attempts_first_date = excluded.exam_attempts_first_date,
                    exam_attempts_second_date = excluded.exam_attempts_second_date
            ",
        )
        .bind(to_i64("program_id", program.id.value())?)
        .bind(&program.title)
        .bind(program.live)
        .bind(program.financial_aid_availability)
        .bind(program.exam_attempts_first_date)
        .bind(program.exam_attempts_second_date)
        .execute(&self.pool)
        .await
        .map_err(write_err)?;
        Ok(())
    }

    async fn get_program(&self, id: ProgramId) -> Result<Program, StorageError> {
        let row = sqlx::query(
            r"
                SELECT id, title, live, financial_aid_availability,
                       exam_attempts_first_date, exam_attempts_second_date
                FROM programs
                WHERE id = ?1
            ",
        )
        .bind(to_i64("program_id", id.value())?)
        .fetch_optional(&self.pool)
        .await
        .map_err(conn)?
        .ok_or(StorageError::NotFound)?;
        map_program_row(&row)
    }

    async fn upsert_course(&self, course: &Course) -> Result<(), StorageError> {
        course.validate().map_err(ser)?;
        sqlx::query(
            r"
                INSERT INTO courses (id, program_id, title, position_in_program)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(id) DO UPDATE SET
                    program_id = excluded.program_id,
                    title = excluded.title,
                    position_in_program = excluded.position_in_program
            ",
        )
        .bind(to_i64("course_id", course.id.value())?)
        .bind(to_i64("program_id", course.program_id.value())?)
        .bind(&course.title)
        .bind(i64::from(course.position_in_program))
        .execute(&self.pool)
        .await
        .map_err(write_err)?;
        Ok(())
    }

    async fn get_course(&self, id: CourseId) -> Result<Course, StorageError> {
        let row = sqlx::query(
            r"
                SELECT id, program_id, title, position_in_program
                FROM courses
                WHERE id = ?1
            ",
        )
        .bind(to_i64("course_id", id.value())?)
        .fetch_optional(&self.pool)
        .await
        .map_err(conn)?
        .ok_or(StorageError::NotFound)?;
        map_course_row(&row)
    }

    async fn courses_for_program(&self, program: ProgramId) -> Result<Vec<Course>, StorageError> {
        let rows = sqlx::query(
            r"
                SELECT id, program_id, title, position_in_program
                FROM courses
                WHERE program_id = ?1
                ORDER BY position_in_program ASC, id ASC
            ",
        )
        .bind(to_i64("program_id", program.value())?)
        .fetch_all(&self.pool)
        .await
        .map_err(conn)?;
        collect(&rows, map_course_row)
    }

    async fn upsert_course_run(&self, run: &CourseRun) -> Result<(), StorageError> {
        run.validate().map_err(ser)?;
        sqlx::query(
            r"
                INSERT INTO course_runs (
                    id, course_id, title, platform_key, start_date, end_date,
                    enrollment_start, enrollment_end, upgrade_deadline,
                    freeze_grade_date, is_discontinued
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                ON CONFLICT(id) DO UPDATE SET
                    course_id = excluded.course_id,
                    title = excluded.title,
                    platform_key = excluded.platform_key,
                    start_date = excluded.start_date,
                    end_date = excluded.end_date,
                    enrollment_start = excluded.enrollment_start,
                    enrollment_end = excluded.enrollment_end,
                    upgrade_deadline = excluded.upgrade_deadline,
                    freeze_grade_date = excluded.freeze_grade_date,
                    is_discontinued = excluded.is_discontinued
            ",
        )
        .bind(to_i64("course_run_id", run.id.value())?)
        .bind(to_i64("course_id", run.course_id.value())?)
        .bind(&run.title)
        .bind(run.platform_key.as_deref())
        .bind(run.start_date)
        .bind(run.end_date)
        .bind(run.enrollment_start)
        .bind(run.enrollment_end)
        .bind(run.upgrade_deadline)
        .bind(run.freeze_grade_date)
        .bind(run.is_discontinued)
        .execute(&self.pool)
        .await
        .map_err(write_err)?;
        Ok(())
    }

    async fn get_course_run(&self, id: CourseRunId) -> Result<CourseRun, StorageError> {
        let sql = format!("SELECT {COURSE_RUN_COLUMNS} FROM course_runs cr WHERE cr.id = ?1");
        let row = sqlx::query(&sql)
            .bind(to_i64("course_run_id", id.value())?)
            .fetch_optional(&self.pool)
            .await
            .map_err(conn)?
            .ok_or(StorageError::NotFound)?;
        map_course_run_row(&row)
    }

    async fn runs_for_program(&self, program: ProgramId) -> Result<Vec<CourseRun>, StorageError> {
        let sql = format!(
            r"
                SELECT {COURSE_RUN_COLUMNS}
                FROM course_runs cr
                JOIN courses c ON c.id = cr.course_id
                WHERE c.program_id = ?1
                ORDER BY cr.id ASC
            "
        );
        let rows = sqlx::query(&sql)
            .bind(to_i64("program_id", program.value())?)
            .fetch_all(&self.pool)
            .await
            .map_err(conn)?;
        collect(&rows, map_course_run_row)
    }

    async fn candidate_runs(&self) -> Result<Vec<CourseRun>, StorageError> {
        let sql = format!(
            r"
                SELECT {COURSE_RUN_COLUMNS}
                FROM course_runs cr
                JOIN courses c ON c.id = cr.course_id
                JOIN programs p ON p.id = c.program_id
                WHERE cr.is_discontinued = 0
                  AND cr.platform_key IS NOT NULL
                  AND p.live = 1
                ORDER BY cr.id ASC
            "
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(conn)?;
        collect(&rows, map_course_run_row)
    }

    async fn upsert_course_price(&self, price: &CoursePrice) -> Result<(), StorageError> {
        sqlx::query(
            r"
                INSERT INTO course_prices (course_run_id, price, is_valid)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(course_run_id) DO UPDATE SET
                    price = excluded.price,
                    is_valid = excluded.is_valid
            ",
        )
        .bind(to_i64("course_run_id", price.course_run_id.value())?)
        .bind(to_i64("price", price.price)?)
        .bind(price.is_valid)
        .execute(&self.pool)
        .await
        .map_err(write_err)?;
        Ok(())
    }

    async fn prices_for_program(
        &self,
        program: ProgramId,
    ) -> Result<Vec<CoursePrice>, StorageError> {
        let rows = sqlx::query(
            r"
                SELECT cp.course_run_id, cp.price, cp.is_valid
                FROM course_prices cp
                JOIN course_runs cr ON cr.id = cp.course_run_id
                JOIN courses c ON c.id = cr.course_id
                WHERE c.program_id = ?1
                ORDER BY cp.course_run_id ASC
            ",
        )
        .bind(to_i64("program_id", program.value())?)
        .fetch_all(&self.pool)
        .await
        .map_err(conn)?;
        collect(&rows, map_price_row)
    }

    async fn upsert_tier_program(&self, tier: &TierProgram) -> Result<(), StorageError> {
        sqlx::query(
            r"
                INSERT INTO tier_programs (
                    id, program_id, discount_amount, income_threshold, current
                )
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(id) DO UPDATE SET
                    program_id = excluded.program_id,
                    discount_amount = excluded.discount_amount,
                    income_threshold = excluded.income_threshold,
                    current = excluded.current
            ",
        )
        .bind(to_i64("tier_program_id", tier.id.value())?)
        .bind(to_i64("program_id", tier.program_id.value())?)
        .bind(to_i64("discount_amount", tier.discount_amount)?)
        .bind(to_i64("income_threshold", tier.income_threshold)?)
        .bind(tier.current)
        .execute(&self.pool)
        .await
        .map_err(write_err)?;
        Ok(())
    }

    async fn get_tier_program(&self, id: TierProgramId) -> Result<TierProgram, StorageError> {
        let row = sqlx::query(
            r"
                SELECT id, program_id, discount_amount, income_threshold, current
                FROM tier_programs
                WHERE id = ?1
            ",
        )
        .bind(to_i64("tier_program_id", id.value())?)
        .fetch_optional(&self.pool)
        .await
        .map_err(conn)?
        .ok_or(StorageError::NotFound)?;
        map_tier_row(&row)
    }

    async fn tiers_for_program(
        &self,
        program: ProgramId,
    ) -> Result<Vec<TierProgram>, StorageError> {
        let rows = sqlx::query(
            r"
                SELECT id, program_id, discount_amount, income_threshold, current
                FROM tier_programs
                WHERE program_id = ?1
                ORDER BY id ASC
            ",
        )
        .bind(to_i64("program_id", program.value())?)
        .fetch_all(&self.pool)
        .await
        .map_err(conn)?;
        collect(&rows, map_tier_row)
    }

    async fn upsert_exam_run(&self, exam_run: &ExamRun) -> Result<(), StorageError> {
        exam_run.validate().map_err(ser)?;
        sqlx::query(
            r"
                INSERT INTO exam_runs (id, course_id, date_first_eligible, date_last_eligible)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(id) DO UPDATE SET
                    course_id = excluded.course_id,
                    date_first_eligible = excluded.date_first_eligible,
                    date_last_eligible = excluded.date_last_eligible
            ",
        )
        .bind(to_i64("exam_run_id", exam_run.id.value())?)
        .bind(to_i64("course_id", exam_run.course_id.value())?)
        .bind(exam_run.date_first_eligible)
        .bind(exam_run.date_last_eligible)
        .execute(&self.pool)
        .await
        .map_err(write_err)?;
        Ok(())
    }

    async fn get_exam_run(&self, id: ExamRunId) -> Result<ExamRun, StorageError> {
        let row = sqlx::query(
            r"
                SELECT id, course_id, date_first_eligible, date_last_eligible
                FROM exam_runs
                WHERE id = ?1
            ",
        )
        .bind(to_i64("exam_run_id", id.value())?)
        .fetch_optional(&self.pool)
        .await
        .map_err(conn)?
        .ok_or(StorageError::NotFound)?;
        map_exam_run_row(&row)
    }
}
