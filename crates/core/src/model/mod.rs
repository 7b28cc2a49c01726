mod cache;
mod catalog;
mod grade;
mod ids;
mod ledger;
mod user;

pub use cache::{
    CacheKind, CacheRefreshMarker, CachedPayload, CachedRecord, CertificateData, CurrentGradeData,
    EnrollmentData, PAID_MODES, PayloadError, is_paid_mode,
};
pub use catalog::{
    AttemptCutover, CatalogError, Course, CoursePrice, CourseRun, ExamRun, Program, TierProgram,
    next_offerable_run,
};
pub use grade::{FinalGrade, FinalGradeError, FinalGradeStatus, GradingStatus};
pub use ids::{
    CourseId, CourseRunId, ExamRunId, ParseIdError, PaymentId, ProgramId, TierProgramId, UserId,
};
pub use ledger::{
    ExamAuthorization, ExamAuthorizationStatus, FinancialAid, FinancialAidStatus, Payment,
    PaymentStatus, UnknownVariant,
};
pub use user::PlatformUser;
