#![forbid(unsafe_code)]

pub mod batch;
pub mod cache;
pub mod config;
pub mod dashboard;
pub mod engine;
pub mod error;
pub mod events;
pub mod facade;
pub mod freezer;
pub mod ledger;
pub mod remote;

pub use progress_core::Clock;

pub use batch::{BatchOutcome, BatchRefreshJob, BatchReport};
pub use cache::RemoteDataCache;
pub use config::{BatchConfig, ConfigError, EngineConfig, StalenessWindows};
pub use dashboard::{CourseProgress, FormattedRun, ProgramProgress, get_program_progress};
pub use engine::ProgressEngine;
pub use error::{
    BatchError, CacheError, EngineError, FreezeError, LedgerError, ProgressError, RemoteError,
    UserFacing,
};
pub use events::{EventBus, ProgressEvent};
pub use facade::{ProgressFacade, ProgressReader, Viewer};
pub use freezer::{GradeFreezer, RunFreezeReport};
pub use ledger::ExamAttemptLedger;
pub use remote::{HttpRemoteClient, RemoteClient};
