use chrono::{DateTime, Utc};
use progress_core::model::{
    CacheKind, CachedRecord, Course, CourseId, CoursePrice, CourseRun, CourseRunId,
    ExamAuthorization, ExamRun, ExamRunId, FinalGrade, FinancialAid, Payment, PaymentId,
    PlatformUser, Program, ProgramId, TierProgram, TierProgramId, UserId,
};
use serde_json::Value;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::repository::StorageError;

pub(crate) fn ser<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Serialization(e.to_string())
}

pub(crate) fn conn<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Connection(e.to_string())
}

/// Foreign key and unique violations surface as conflicts.
pub(crate) fn write_err(e: sqlx::Error) -> StorageError {
    let conflict = e
        .as_database_error()
        .is_some_and(|db| db.is_foreign_key_violation() || db.is_unique_violation());
    if conflict {
        StorageError::Conflict
    } else {
        conn(e)
    }
}

pub(crate) fn collect<T>(
    rows: &[SqliteRow],
    map: fn(&SqliteRow) -> Result<T, StorageError>,
) -> Result<Vec<T>, StorageError> {
    rows.iter().map(map).collect()
}

pub(crate) fn to_i64(field: &'static str, v: u64) -> Result<i64, StorageError> {
    i64::try_from(v).map_err(|_| StorageError::Serialization(format!("{field} overflow")))
}

fn to_u64(field: &'static str, v: i64) -> Result<u64, StorageError> {
    u64::try_from(v).map_err(|_| StorageError::Serialization(format!("{field} sign overflow")))
}

fn get_u64(row: &SqliteRow, field: &'static str) -> Result<u64, StorageError> {
    to_u64(field, row.try_get::<i64, _>(field).map_err(ser)?)
}

fn get_parsed<T>(row: &SqliteRow, field: &'static str) -> Result<T, StorageError>
where
    T: std::str::FromStr,
    T::Err: core::fmt::Display,
{
    row.try_get::<String, _>(field)
        .map_err(ser)?
        .parse::<T>()
        .map_err(ser)
}

pub(crate) fn payload_to_text(payload: Option<&Value>) -> Result<Option<String>, StorageError> {
    payload.map(serde_json::to_string).transpose().map_err(ser)
}

pub(crate) fn map_program_row(row: &SqliteRow) -> Result<Program, StorageError> {
    Ok(Program {
        id: ProgramId::new(get_u64(row, "id")?),
        title: row.try_get("title").map_err(ser)?,
        live: row.try_get("live").map_err(ser)?,
        financial_aid_availability: row.try_get("financial_aid_availability").map_err(ser)?,
        exam_attempts_first_date: row.try_get("exam_attempts_first_date").map_err(ser)?,
        exam_attempts_second_date: row.try_get("exam_attempts_second_date").map_err(ser)?,
    })
}

pub(crate) fn map_course_row(row: &SqliteRow) -> Result<Course, StorageError> {
    let position: i64 = row.try_get("position_in_program").map_err(ser)?;
    Ok(Course {
        id: CourseId::new(get_u64(row, "id")?),
        program_id: ProgramId::new(get_u64(row, "program_id")?),
        title: row.try_get("title").map_err(ser)?,
        position_in_program: u32::try_from(position).map_err(|_| {
            StorageError::Serialization(format!("invalid position_in_program: {position}"))
        })?,
    })
}

pub(crate) const COURSE_RUN_COLUMNS: &str = r"
    cr.id, cr.course_id, cr.title, cr.platform_key, cr.start_date, cr.end_date,
    cr.enrollment_start, cr.enrollment_end, cr.upgrade_deadline, cr.freeze_grade_date,
    cr.is_discontinued
";

pub(crate) fn map_course_run_row(row: &SqliteRow) -> Result<CourseRun, StorageError> {
    Ok(CourseRun {
        id: CourseRunId::new(get_u64(row, "id")?),
        course_id: CourseId::new(get_u64(row, "course_id")?),
        title: row.try_get("title").map_err(ser)?,
        platform_key: row.try_get("platform_key").map_err(ser)?,
        start_date: row.try_get("start_date").map_err(ser)?,
        end_date: row.try_get("end_date").map_err(ser)?,
        enrollment_start: row.try_get("enrollment_start").map_err(ser)?,
        enrollment_end: row.try_get("enrollment_end").map_err(ser)?,
        upgrade_deadline: row.try_get("upgrade_deadline").map_err(ser)?,
        freeze_grade_date: row.try_get("freeze_grade_date").map_err(ser)?,
        is_discontinued: row.try_get("is_discontinued").map_err(ser)?,
    })
}

pub(crate) fn map_price_row(row: &SqliteRow) -> Result<CoursePrice, StorageError> {
    Ok(CoursePrice {
        course_run_id: CourseRunId::new(get_u64(row, "course_run_id")?),
        price: get_u64(row, "price")?,
        is_valid: row.try_get("is_valid").map_err(ser)?,
    })
}

pub(crate) fn map_tier_row(row: &SqliteRow) -> Result<TierProgram, StorageError> {
    Ok(TierProgram {
        id: TierProgramId::new(get_u64(row, "id")?),
        program_id: ProgramId::new(get_u64(row, "program_id")?),
        discount_amount: get_u64(row, "discount_amount")?,
        income_threshold: get_u64(row, "income_threshold")?,
        current: row.try_get("current").map_err(ser)?,
    })
}

pub(crate) fn map_exam_run_row(row: &SqliteRow) -> Result<ExamRun, StorageError> {
    Ok(ExamRun {
        id: ExamRunId::new(get_u64(row, "id")?),
        course_id: CourseId::new(get_u64(row, "course_id")?),
        date_first_eligible: row.try_get("date_first_eligible").map_err(ser)?,
        date_last_eligible: row.try_get("date_last_eligible").map_err(ser)?,
    })
}

pub(crate) fn map_user_row(row: &SqliteRow) -> Result<PlatformUser, StorageError> {
    Ok(PlatformUser {
        id: UserId::new(get_u64(row, "id")?),
        username: row.try_get("username").map_err(ser)?,
        access_token: row.try_get("access_token").map_err(ser)?,
        token_expires_at: row.try_get("token_expires_at").map_err(ser)?,
    })
}

pub(crate) fn user_id_from_row(row: &SqliteRow) -> Result<UserId, StorageError> {
    Ok(UserId::new(get_u64(row, "user_id")?))
}

pub(crate) fn map_cached_record_row(row: &SqliteRow) -> Result<CachedRecord, StorageError> {
    let payload = row
        .try_get::<Option<String>, _>("payload")
        .map_err(ser)?
        .map(|text| serde_json::from_str::<Value>(&text))
        .transpose()
        .map_err(ser)?;
    Ok(CachedRecord {
        user_id: user_id_from_row(row)?,
        course_run_id: CourseRunId::new(get_u64(row, "course_run_id")?),
        kind: get_parsed::<CacheKind>(row, "kind")?,
        payload,
        last_request: row.try_get("last_request").map_err(ser)?,
    })
}

/// Column holding the refresh marker for each kind.
pub(crate) fn marker_column(kind: CacheKind) -> &'static str {
    match kind {
        CacheKind::Enrollment => "enrollment_at",
        CacheKind::Certificate => "certificate_at",
        CacheKind::CurrentGrade => "current_grade_at",
    }
}

pub(crate) fn map_final_grade_row(row: &SqliteRow) -> Result<FinalGrade, StorageError> {
    Ok(FinalGrade {
        user_id: user_id_from_row(row)?,
        course_run_id: CourseRunId::new(get_u64(row, "course_run_id")?),
        grade: row.try_get("grade").map_err(ser)?,
        passed: row.try_get("passed").map_err(ser)?,
        status: get_parsed(row, "status")?,
        paid_on_platform: row.try_get("paid_on_platform").map_err(ser)?,
        created_at: row.try_get("created_at").map_err(ser)?,
        updated_at: row.try_get("updated_at").map_err(ser)?,
    })
}

pub(crate) fn map_payment_row(row: &SqliteRow) -> Result<Payment, StorageError> {
    Ok(Payment {
        id: PaymentId::new(get_u64(row, "id")?),
        user_id: user_id_from_row(row)?,
        course_key: row.try_get("course_key").map_err(ser)?,
        status: get_parsed(row, "status")?,
        paid_at: row.try_get("paid_at").map_err(ser)?,
    })
}

pub(crate) fn map_financial_aid_row(row: &SqliteRow) -> Result<FinancialAid, StorageError> {
    Ok(FinancialAid {
        user_id: user_id_from_row(row)?,
        tier_program_id: TierProgramId::new(get_u64(row, "tier_program_id")?),
        status: get_parsed(row, "status")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(ser)?,
    })
}

pub(crate) fn map_authorization_row(row: &SqliteRow) -> Result<ExamAuthorization, StorageError> {
    Ok(ExamAuthorization {
        user_id: user_id_from_row(row)?,
        course_id: CourseId::new(get_u64(row, "course_id")?),
        exam_run_id: ExamRunId::new(get_u64(row, "exam_run_id")?),
        status: get_parsed(row, "status")?,
        exam_taken: row.try_get("exam_taken").map_err(ser)?,
    })
}
