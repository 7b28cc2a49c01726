use std::fmt;

use chrono::{DateTime, Duration, Utc};
use progress_core::model::{
    Course, CourseId, CoursePrice, CourseRun, CourseRunId, ExamRun, ExamRunId, PlatformUser,
    Program, ProgramId, TierProgram, TierProgramId, UserId,
};
use storage::repository::Storage;

#[derive(Debug, Clone)]
struct Args {
    db_url: String,
    program_id: ProgramId,
    program_title: String,
    financial_aid: bool,
    user_id: UserId,
    username: String,
    access_token: String,
    now: Option<DateTime<Utc>>,
}

#[derive(Debug)]
enum ArgsError {
    MissingValue { flag: &'static str },
    UnknownArg(String),
    InvalidProgramId { raw: String },
    InvalidUserId { raw: String },
    InvalidDbUrl { raw: String },
    InvalidNow { raw: String },
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsError::MissingValue { flag } => write!(f, "{flag} requires a value"),
            ArgsError::UnknownArg(arg) => write!(f, "unknown argument: {arg}"),
            ArgsError::InvalidProgramId { raw } => write!(f, "invalid --program-id value: {raw}"),
            ArgsError::InvalidUserId { raw } => write!(f, "invalid --user-id value: {raw}"),
            ArgsError::InvalidDbUrl { raw } => write!(f, "invalid --db value: {raw}"),
            ArgsError::InvalidNow { raw } => {
                write!(f, "invalid --now value (expected RFC3339): {raw}")
            }
        }
    }
}

impl std::error::Error for ArgsError {}

fn require_value(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<String, ArgsError> {
    args.next().ok_or(ArgsError::MissingValue { flag })
}

impl Args {
    fn parse() -> Result<Self, ArgsError> {
        let mut db_url =
            std::env::var("PROGRESS_DB_URL").unwrap_or_else(|_| "sqlite:progress.sqlite3?mode=rwc".into());
        let mut program_id = std::env::var("PROGRESS_SEED_PROGRAM_ID")
            .ok()
            .and_then(|value| value.parse::<ProgramId>().ok())
            .unwrap_or_else(|| ProgramId::new(1));
        let mut program_title = std::env::var("PROGRESS_SEED_PROGRAM_TITLE")
            .unwrap_or_else(|_| "Data, Economics, and Development Policy".into());
        let mut financial_aid = false;
        let mut user_id = std::env::var("PROGRESS_SEED_USER_ID")
            .ok()
            .and_then(|value| value.parse::<UserId>().ok())
            .unwrap_or_else(|| UserId::new(1));
        let mut username =
            std::env::var("PROGRESS_SEED_USERNAME").unwrap_or_else(|_| "demo-learner".into());
        let mut access_token =
            std::env::var("PROGRESS_SEED_ACCESS_TOKEN").unwrap_or_else(|_| "dev-token".into());
        let mut now: Option<DateTime<Utc>> = None;

        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--db" => {
                    let value = require_value(&mut args, "--db")?;
                    if value.trim().is_empty() {
                        return Err(ArgsError::InvalidDbUrl { raw: value });
                    }
                    db_url = value;
                }
                "--program-id" => {
                    let value = require_value(&mut args, "--program-id")?;
                    program_id = value
                        .parse()
                        .map_err(|_| ArgsError::InvalidProgramId { raw: value.clone() })?;
                }
                "--program-title" => {
                    program_title = require_value(&mut args, "--program-title")?;
                }
                "--financial-aid" => {
                    financial_aid = true;
                }
                "--user-id" => {
                    let value = require_value(&mut args, "--user-id")?;
                    user_id = value
                        .parse()
                        .map_err(|_| ArgsError::InvalidUserId { raw: value.clone() })?;
                }
                "--username" => {
                    username = require_value(&mut args, "--username")?;
                }
                "--access-token" => {
                    access_token = require_value(&mut args, "--access-token")?;
                }
                "--now" => {
                    let value = require_value(&mut args, "--now")?;
                    let parsed = DateTime::parse_from_rfc3339(&value)
                        .map_err(|_| ArgsError::InvalidNow { raw: value.clone() })?
                        .with_timezone(&Utc);
                    now = Some(parsed);
                }
                "--help" | "-h" => {
                    print_usage();
                    std::process::exit(0);
                }
                _ => return Err(ArgsError::UnknownArg(arg)),
            }
        }

        Ok(Self {
            db_url,
            program_id,
            program_title,
            financial_aid,
            user_id,
            username,
            access_token,
            now,
        })
    }
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  cargo run -p storage --bin seed -- [options]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --db <sqlite_url>         SQLite URL (default: sqlite:progress.sqlite3?mode=rwc)");
    eprintln!("  --program-id <id>         Program id to upsert (default: 1)");
    eprintln!("  --program-title <title>   Program title");
    eprintln!("  --financial-aid           Mark the program as offering financial aid");
    eprintln!("  --user-id <id>            Learner id to upsert (default: 1)");
    eprintln!("  --username <name>         Learner username on the platform");
    eprintln!("  --access-token <token>    Platform access token for the learner");
    eprintln!("  --now <rfc3339>           Fixed current time for deterministic seeding");
    eprintln!("  -h, --help                Show this help");
    eprintln!();
    eprintln!("Environment (same as flags):");
    eprintln!(
        "  PROGRESS_DB_URL, PROGRESS_SEED_PROGRAM_ID, PROGRESS_SEED_PROGRAM_TITLE, PROGRESS_SEED_USER_ID,"
    );
    eprintln!("  PROGRESS_SEED_USERNAME, PROGRESS_SEED_ACCESS_TOKEN");
}

/// A past, a current and a future run of one course.
fn sample_runs(course: CourseId, slug: &str, first_id: u64, now: DateTime<Utc>) -> Vec<CourseRun> {
    let terms = [
        ("past", now - Duration::weeks(30), now - Duration::weeks(18)),
        ("current", now - Duration::weeks(4), now + Duration::weeks(8)),
        ("future", now + Duration::weeks(10), now + Duration::weeks(22)),
    ];
    terms
        .iter()
        .zip(first_id..)
        .map(|((term, start, end), id)| {
            let mut run = CourseRun::new(CourseRunId::new(id), course, format!("{slug} ({term})"))
                .with_platform_key(format!("course-v1:MITx+{slug}+{term}"))
                .with_dates(Some(*start), Some(*end));
            run.enrollment_end = Some(*end - Duration::weeks(6));
            run.upgrade_deadline = Some(*end - Duration::weeks(2));
            run.freeze_grade_date = Some(*end + Duration::weeks(1));
            run
        })
        .collect()
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse().map_err(|e| {
        eprintln!("{e}");
        print_usage();
        e
    })?;

    let storage = Storage::sqlite(&args.db_url).await?;
    let now = args.now.unwrap_or_else(Utc::now);

    let mut program = Program::new(args.program_id, args.program_title.clone());
    program.financial_aid_availability = args.financial_aid;
    program.exam_attempts_first_date = Some(now - Duration::weeks(52));
    program.exam_attempts_second_date = Some(now - Duration::weeks(26));
    storage.catalog.upsert_program(&program).await?;

    let base = args.program_id.value() * 100;
    let mut run_count = 0;
    for (position, slug) in (1_u32..).zip(["14.100x", "14.310x"]) {
        let course_id = CourseId::new(base + u64::from(position));
        storage
            .catalog
            .upsert_course(&Course::new(course_id, program.id, slug, position))
            .await?;

        let first_run = (base + u64::from(position)) * 10;
        for run in sample_runs(course_id, slug, first_run, now) {
            storage.catalog.upsert_course_run(&run).await?;
            storage
                .catalog
                .upsert_course_price(&CoursePrice {
                    course_run_id: run.id,
                    price: 100_000,
                    is_valid: true,
                })
                .await?;
            run_count += 1;
        }

        storage
            .catalog
            .upsert_exam_run(&ExamRun {
                id: ExamRunId::new(course_id.value()),
                course_id,
                date_first_eligible: now - Duration::days(7),
                date_last_eligible: now + Duration::days(21),
            })
            .await?;
    }

    let tiers = [(0_u64, 0_u64), (25_000, 50_000), (75_000, 10_000)];
    for (offset, (discount_amount, income_threshold)) in (0_u64..).zip(tiers) {
        storage
            .catalog
            .upsert_tier_program(&TierProgram {
                id: TierProgramId::new(base + offset),
                program_id: program.id,
                discount_amount,
                income_threshold,
                current: true,
            })
            .await?;
    }

    storage
        .users
        .upsert_user(&PlatformUser {
            id: args.user_id,
            username: args.username.clone(),
            access_token: args.access_token.clone(),
            token_expires_at: Some(now + Duration::hours(1)),
        })
        .await?;

    println!(
        "Seeded program {} with {} course runs and learner {} into {}",
        program.id, run_count, args.user_id, args.db_url
    );

    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(2);
    }
}
