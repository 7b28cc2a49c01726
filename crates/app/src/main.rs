use std::fmt;

use progress_core::model::{CourseId, CourseRunId, ProgramId, UserId};
use serde_json::json;
use services::{
    BatchError, BatchOutcome, Clock, ConfigError, EngineConfig, EngineError, FreezeError,
    LedgerError, ProgressEngine, ProgressError, UserFacing, Viewer,
};
use thiserror::Error;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "services=info,storage=info,app=info";

/// Exit code for failures the learner fixes by signing in again.
const EXIT_REAUTHENTICATE: i32 = 3;
const EXIT_FAILURE: i32 = 2;

#[derive(Debug)]
enum ArgsError {
    MissingValue { flag: &'static str },
    MissingFlag { flag: &'static str },
    UnknownArg(String),
    UnknownCommand(String),
    InvalidId { flag: &'static str, raw: String },
    InvalidDbUrl { raw: String },
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsError::MissingValue { flag } => write!(f, "{flag} requires a value"),
            ArgsError::MissingFlag { flag } => write!(f, "{flag} is required"),
            ArgsError::UnknownArg(arg) => write!(f, "unknown argument: {arg}"),
            ArgsError::UnknownCommand(cmd) => write!(f, "unknown subcommand: {cmd}"),
            ArgsError::InvalidId { flag, raw } => write!(f, "invalid {flag} value: {raw}"),
            ArgsError::InvalidDbUrl { raw } => write!(f, "invalid --db value: {raw}"),
        }
    }
}

impl std::error::Error for ArgsError {}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Args(#[from] ArgsError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Progress(#[from] ProgressError),
    #[error(transparent)]
    Freeze(#[from] FreezeError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    fn user_facing(&self) -> UserFacing {
        match self {
            CliError::Progress(err) => UserFacing::from(err),
            CliError::Freeze(err) => UserFacing::from(err),
            _ => UserFacing::Failure,
        }
    }
}

fn require_value(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<String, ArgsError> {
    args.next().ok_or(ArgsError::MissingValue { flag })
}

fn parse_id(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<u64, ArgsError> {
    let value = require_value(args, flag)?;
    value
        .parse()
        .map_err(|_| ArgsError::InvalidId { flag, raw: value })
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  app progress      --user-id <id> --program-id <id> [--observer]");
    eprintln!("  app freeze        --user-id <id> --run-id <id>");
    eprintln!("  app freeze-run    --run-id <id>");
    eprintln!("  app attempts      --user-id <id> --course-id <id>");
    eprintln!("  app refresh-batch");
    eprintln!();
    eprintln!("Every command accepts --db <sqlite_url> (default sqlite:progress.sqlite3).");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  PROGRESS_DB_URL, PROGRESS_REMOTE_BASE_URL, PROGRESS_REMOTE_TIMEOUT_SECS,");
    eprintln!("  PROGRESS_*_STALENESS_SECS, PROGRESS_BATCH_*, PROGRESS_LOG_JSON, RUST_LOG");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Progress {
        user: UserId,
        program: ProgramId,
        viewer: Viewer,
    },
    Freeze {
        user: UserId,
        run: CourseRunId,
    },
    FreezeRun {
        run: CourseRunId,
    },
    Attempts {
        user: UserId,
        course: CourseId,
    },
    RefreshBatch,
}

#[derive(Debug, Default)]
struct Flags {
    user: Option<u64>,
    program: Option<u64>,
    run: Option<u64>,
    course: Option<u64>,
    observer: bool,
}

fn required(value: Option<u64>, flag: &'static str) -> Result<u64, ArgsError> {
    value.ok_or(ArgsError::MissingFlag { flag })
}

struct Args {
    db_url: String,
    command: Command,
}

impl Args {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Option<Self>, ArgsError> {
        let Some(name) = args.next() else {
            return Ok(None);
        };
        if matches!(name.as_str(), "--help" | "-h") {
            return Ok(None);
        }

        let mut db_url = normalize_sqlite_url(
            std::env::var("PROGRESS_DB_URL").unwrap_or_else(|_| "sqlite:progress.sqlite3".into()),
        );
        let mut flags = Flags::default();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--db" => {
                    let value = require_value(&mut args, "--db")?;
                    if value.trim().is_empty() {
                        return Err(ArgsError::InvalidDbUrl { raw: value });
                    }
                    db_url = normalize_sqlite_url(value);
                }
                "--user-id" => flags.user = Some(parse_id(&mut args, "--user-id")?),
                "--program-id" => flags.program = Some(parse_id(&mut args, "--program-id")?),
                "--run-id" => flags.run = Some(parse_id(&mut args, "--run-id")?),
                "--course-id" => flags.course = Some(parse_id(&mut args, "--course-id")?),
                "--observer" => flags.observer = true,
                "--help" | "-h" => return Ok(None),
                _ => return Err(ArgsError::UnknownArg(arg)),
            }
        }

        let command = match name.as_str() {
            "progress" => Command::Progress {
                user: UserId::new(required(flags.user, "--user-id")?),
                program: ProgramId::new(required(flags.program, "--program-id")?),
                viewer: if flags.observer {
                    Viewer::Observer
                } else {
                    Viewer::Subject
                },
            },
            "freeze" => Command::Freeze {
                user: UserId::new(required(flags.user, "--user-id")?),
                run: CourseRunId::new(required(flags.run, "--run-id")?),
            },
            "freeze-run" => Command::FreezeRun {
                run: CourseRunId::new(required(flags.run, "--run-id")?),
            },
            "attempts" => Command::Attempts {
                user: UserId::new(required(flags.user, "--user-id")?),
                course: CourseId::new(required(flags.course, "--course-id")?),
            },
            "refresh-batch" => Command::RefreshBatch,
            _ => return Err(ArgsError::UnknownCommand(name)),
        };
        Ok(Some(Self { db_url, command }))
    }
}

fn normalize_sqlite_url(raw: String) -> String {
    if raw == "sqlite::memory:" || raw.starts_with("sqlite://") {
        return raw;
    }

    let trimmed = raw.trim();
    let (path, query) = trimmed.split_once('?').unwrap_or((trimmed, "mode=rwc"));
    let path = std::path::Path::new(path.strip_prefix("sqlite:").unwrap_or(path));
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| std::path::PathBuf::from("."))
            .join(path)
    };
    format!("sqlite://{}?{query}", absolute.display())
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let json = std::env::var("PROGRESS_LOG_JSON").is_ok_and(|value| value == "1");
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_json(value: &serde_json::Value) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn execute(engine: &ProgressEngine, command: Command) -> Result<(), CliError> {
    match command {
        Command::Progress {
            user,
            program,
            viewer,
        } => {
            let progress = engine.get_program_progress(user, program, viewer).await?;
            print_json(&serde_json::to_value(&progress)?)
        }
        Command::Freeze { user, run } => {
            let grade = engine.freeze_run(user, run).await?;
            print_json(&serde_json::to_value(&grade)?)
        }
        Command::FreezeRun { run } => {
            let report = engine.freeze_course_run(run).await?;
            let failed: Vec<_> = report
                .failed
                .iter()
                .map(|(user, reason)| json!({ "user_id": user, "reason": reason }))
                .collect();
            print_json(&json!({
                "course_run_id": run,
                "already_complete": report.already_complete,
                "completed": report.completed,
                "frozen": report.frozen,
                "failed": failed,
            }))
        }
        Command::Attempts { user, course } => {
            let remaining = engine.remaining_exam_attempts(user, course).await?;
            print_json(&json!({
                "user_id": user,
                "course_id": course,
                "remaining_attempts": remaining,
            }))
        }
        Command::RefreshBatch => match engine.refresh_batch().await? {
            BatchOutcome::LockHeld => print_json(&json!({ "status": "lock_held" })),
            BatchOutcome::Completed(report) => print_json(&json!({
                "status": "completed",
                "selected": report.selected,
                "refreshed": report.refreshed,
                "failed": report.failed,
                "skipped_failing": report.skipped_failing,
            })),
        },
    }
}

async fn run() -> Result<(), CliError> {
    let Some(args) = Args::parse(std::env::args().skip(1))? else {
        print_usage();
        return Ok(());
    };

    let config = EngineConfig::from_env()?;
    tracing::debug!(
        db_url = %args.db_url,
        remote = %config.remote_base_url,
        "starting progress engine"
    );
    let engine = ProgressEngine::new_sqlite(&args.db_url, &config, Clock::default()).await?;
    execute(&engine, args.command).await
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    if let Err(err) = run().await {
        let code = match err.user_facing() {
            UserFacing::ReauthenticationRequired => {
                eprintln!("{}", UserFacing::ReauthenticationRequired.message());
                EXIT_REAUTHENTICATE
            }
            UserFacing::Failure => {
                eprintln!("{err}");
                if matches!(err, CliError::Args(_)) {
                    print_usage();
                }
                EXIT_FAILURE
            }
        };
        std::process::exit(code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Option<Args>, ArgsError> {
        Args::parse(args.iter().map(|arg| (*arg).to_string()))
    }

    #[test]
    fn progress_defaults_to_the_learner_view() {
        let args = parse(&[
            "progress",
            "--user-id",
            "7",
            "--program-id",
            "2",
            "--db",
            "sqlite::memory:",
        ])
        .expect("parse")
        .expect("command");
        assert_eq!(args.db_url, "sqlite::memory:");
        assert_eq!(
            args.command,
            Command::Progress {
                user: UserId::new(7),
                program: ProgramId::new(2),
                viewer: Viewer::Subject,
            }
        );
    }

    #[test]
    fn observer_flag_switches_the_viewer() {
        let args = parse(&["progress", "--user-id", "7", "--program-id", "2", "--observer"])
            .expect("parse")
            .expect("command");
        assert!(matches!(
            args.command,
            Command::Progress {
                viewer: Viewer::Observer,
                ..
            }
        ));
    }

    #[test]
    fn missing_and_malformed_ids_are_rejected() {
        assert!(matches!(
            parse(&["freeze", "--user-id", "7"]),
            Err(ArgsError::MissingFlag { flag: "--run-id" })
        ));
        assert!(matches!(
            parse(&["attempts", "--user-id", "seven"]),
            Err(ArgsError::InvalidId { flag: "--user-id", .. })
        ));
        assert!(matches!(
            parse(&["freeze-run", "--run-id"]),
            Err(ArgsError::MissingValue { flag: "--run-id" })
        ));
    }

    #[test]
    fn unknown_commands_and_flags_are_reported() {
        assert!(matches!(parse(&["grades"]), Err(ArgsError::UnknownCommand(_))));
        assert!(matches!(
            parse(&["refresh-batch", "--verbose"]),
            Err(ArgsError::UnknownArg(_))
        ));
        assert!(parse(&[]).expect("parse").is_none());
    }

    #[test]
    fn relative_database_paths_become_absolute() {
        let url = normalize_sqlite_url("sqlite:data/progress.db".to_string());
        assert!(url.starts_with("sqlite:///"));
        assert!(url.ends_with("data/progress.db?mode=rwc"));

        let kept = normalize_sqlite_url("sqlite:/tmp/p.db?mode=ro".to_string());
        assert_eq!(kept, "sqlite:///tmp/p.db?mode=ro");
    }
}
