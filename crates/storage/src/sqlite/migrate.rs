use chrono::Utc;
use sqlx::SqlitePool;
use tracing::info;

use super::SqliteInitError;

/// Version 1: the locally owned catalog, learners and ledger tables.
const CATALOG_AND_LEDGER: &[&str] = &[
    r"
        CREATE TABLE IF NOT EXISTS programs (
            id INTEGER PRIMARY KEY,
            title TEXT NOT NULL,
            live INTEGER NOT NULL DEFAULT 1,
            financial_aid_availability INTEGER NOT NULL DEFAULT 0,
            exam_attempts_first_date TEXT,
            exam_attempts_second_date TEXT
        );
    ",
    r"
        CREATE TABLE IF NOT EXISTS courses (
            id INTEGER PRIMARY KEY,
            program_id INTEGER NOT NULL,
            title TEXT NOT NULL,
            position_in_program INTEGER NOT NULL CHECK (position_in_program >= 0),
            FOREIGN KEY (program_id) REFERENCES programs(id) ON DELETE CASCADE
        );
    ",
    r"
        CREATE TABLE IF NOT EXISTS course_runs (
            id INTEGER PRIMARY KEY,
            course_id INTEGER NOT NULL,
            title TEXT NOT NULL,
            platform_key TEXT UNIQUE,
            start_date TEXT,
            end_date TEXT,
            enrollment_start TEXT,
            enrollment_end TEXT,
            upgrade_deadline TEXT,
            freeze_grade_date TEXT,
            is_discontinued INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (course_id) REFERENCES courses(id) ON DELETE CASCADE
        );
    ",
    r"
        CREATE TABLE IF NOT EXISTS course_prices (
            course_run_id INTEGER PRIMARY KEY,
            price INTEGER NOT NULL CHECK (price >= 0),
            is_valid INTEGER NOT NULL,
            FOREIGN KEY (course_run_id) REFERENCES course_runs(id) ON DELETE CASCADE
        );
    ",
    r"
        CREATE TABLE IF NOT EXISTS tier_programs (
            id INTEGER PRIMARY KEY,
            program_id INTEGER NOT NULL,
            discount_amount INTEGER NOT NULL CHECK (discount_amount >= 0),
            income_threshold INTEGER NOT NULL CHECK (income_threshold >= 0),
            current INTEGER NOT NULL,
            FOREIGN KEY (program_id) REFERENCES programs(id) ON DELETE CASCADE
        );
    ",
    r"
        CREATE TABLE IF NOT EXISTS exam_runs (
            id INTEGER PRIMARY KEY,
            course_id INTEGER NOT NULL,
            date_first_eligible TEXT NOT NULL,
            date_last_eligible TEXT NOT NULL,
            FOREIGN KEY (course_id) REFERENCES courses(id) ON DELETE CASCADE
        );
    ",
    r"
        CREATE TABLE IF NOT EXISTS platform_users (
            id INTEGER PRIMARY KEY,
            username TEXT NOT NULL,
            access_token TEXT NOT NULL,
            token_expires_at TEXT
        );
    ",
    r"
        CREATE TABLE IF NOT EXISTS payments (
            id INTEGER PRIMARY KEY,
            user_id INTEGER NOT NULL,
            course_key TEXT NOT NULL,
            status TEXT NOT NULL,
            paid_at TEXT NOT NULL
        );
    ",
    r"
        CREATE TABLE IF NOT EXISTS financial_aid (
            user_id INTEGER NOT NULL,
            tier_program_id INTEGER NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (user_id, tier_program_id),
            FOREIGN KEY (tier_program_id) REFERENCES tier_programs(id) ON DELETE CASCADE
        );
    ",
    r"
        CREATE TABLE IF NOT EXISTS exam_authorizations (
            user_id INTEGER NOT NULL,
            course_id INTEGER NOT NULL,
            exam_run_id INTEGER NOT NULL,
            status TEXT NOT NULL,
            exam_taken INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (user_id, exam_run_id),
            FOREIGN KEY (course_id) REFERENCES courses(id) ON DELETE CASCADE,
            FOREIGN KEY (exam_run_id) REFERENCES exam_runs(id) ON DELETE CASCADE
        );
    ",
    r"
        CREATE INDEX IF NOT EXISTS idx_payments_user
            ON payments (user_id, paid_at);
    ",
    r"
        CREATE INDEX IF NOT EXISTS idx_exam_authorizations_user_course
            ON exam_authorizations (user_id, course_id);
    ",
];

/// Version 2: tables written by the engine itself.
const ENGINE_STATE: &[&str] = &[
    r"
        CREATE TABLE IF NOT EXISTS cached_records (
            user_id INTEGER NOT NULL,
            course_run_id INTEGER NOT NULL,
            kind TEXT NOT NULL CHECK (kind IN ('enrollment', 'certificate', 'current_grade')),
            payload TEXT,
            last_request TEXT NOT NULL,
            PRIMARY KEY (user_id, course_run_id, kind),
            FOREIGN KEY (course_run_id) REFERENCES course_runs(id) ON DELETE CASCADE
        );
    ",
    r"
        CREATE TABLE IF NOT EXISTS cache_refresh_markers (
            user_id INTEGER PRIMARY KEY,
            enrollment_at TEXT,
            certificate_at TEXT,
            current_grade_at TEXT
        );
    ",
    r"
        CREATE TABLE IF NOT EXISTS refresh_failures (
            user_id INTEGER PRIMARY KEY,
            failures INTEGER NOT NULL CHECK (failures >= 0),
            last_failure_at TEXT NOT NULL
        );
    ",
    r"
        CREATE TABLE IF NOT EXISTS final_grades (
            user_id INTEGER NOT NULL,
            course_run_id INTEGER NOT NULL,
            grade REAL NOT NULL CHECK (grade BETWEEN 0.0 AND 1.0),
            passed INTEGER NOT NULL,
            status TEXT NOT NULL,
            paid_on_platform INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (user_id, course_run_id),
            FOREIGN KEY (course_run_id) REFERENCES course_runs(id) ON DELETE CASCADE
        );
    ",
    r"
        CREATE TABLE IF NOT EXISTS course_run_grading_status (
            course_run_id INTEGER PRIMARY KEY,
            status TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (course_run_id) REFERENCES course_runs(id) ON DELETE CASCADE
        );
    ",
    r"
        CREATE TABLE IF NOT EXISTS job_locks (
            name TEXT PRIMARY KEY,
            holder TEXT NOT NULL,
            expires_at TEXT NOT NULL
        );
    ",
    r"
        CREATE INDEX IF NOT EXISTS idx_cached_records_run_kind
            ON cached_records (course_run_id, kind);
    ",
];

async fn is_applied(pool: &SqlitePool, version: i64) -> Result<bool, sqlx::Error> {
    let row = sqlx::query("SELECT 1 FROM schema_migrations WHERE version = ?1")
        .bind(version)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

async fn apply(pool: &SqlitePool, version: i64, statements: &[&str]) -> Result<(), sqlx::Error> {
    if is_applied(pool, version).await? {
        return Ok(());
    }

    let mut tx = pool.begin().await?;
    for statement in statements {
        sqlx::query(statement).execute(&mut *tx).await?;
    }
    sqlx::query(
        r"
            INSERT INTO schema_migrations (version, applied_at)
            VALUES (?1, ?2)
            ON CONFLICT(version) DO NOTHING
        ",
    )
    .bind(version)
    .bind(Utc::now())
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    info!(version, "applied schema migration");
    Ok(())
}

/// Brings the schema up to date, one transaction per version.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), SqliteInitError> {
    sqlx::query(
        r"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );
            ",
    )
    .execute(pool)
    .await?;

    apply(pool, 1, CATALOG_AND_LEDGER).await?;
    apply(pool, 2, ENGINE_STATE).await?;
    Ok(())
}
