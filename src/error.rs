//! Error taxonomy shared by the capture path and the sync engine.
use crate::model::{ConflictDetection, PunchType};
use crate::remote::RemoteError;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Input that can never be recorded. Reported to the caller synchronously and
/// never enqueued.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("employee id must be non-empty")]
    EmptyEmployeeId,
    #[error("expected a {expected} punch but {requested} was requested")]
    UnexpectedPunchType {
        expected: PunchType,
        requested: PunchType,
    },
    #[error("credential rejected for employee {0}")]
    CredentialRejected(String),
    #[error("punch {0} not found")]
    UnknownPunch(String),
    #[error("punch {punch_id} does not belong to employee {employee_id}")]
    ForeignPunch {
        punch_id: String,
        employee_id: String,
    },
    #[error("punch {0} does not leave an open shift")]
    PunchNotOpen(String),
    #[error("no clock-in found for the shift containing punch {0}")]
    MissingShiftClockIn(String),
    #[error("corrected timestamp must be strictly after the shift clock-in at {clock_in}")]
    CorrectedNotAfterClockIn { clock_in: DateTime<Utc> },
    #[error("corrected timestamp must be strictly after the open punch at {open_punch}")]
    CorrectedNotAfterOpenPunch { open_punch: DateTime<Utc> },
    #[error("corrected shift lasts {minutes} minutes, over the {max_hours}h limit")]
    ShiftTooLong { minutes: i64, max_hours: i64 },
    #[error("corrected timestamp {0} lies in the future")]
    CorrectedInFuture(DateTime<Utc>),
    #[error("correction reason text is required")]
    MissingReason,
    #[error("correction reason category is required")]
    MissingReasonCategory,
    #[error("punch {0} already has a correction on file")]
    DuplicateCorrection(String),
}

/// Local persistence failure. A punch that hits one of these was NOT recorded.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("queue entry {0} not found")]
    UnknownEntry(String),
}

#[derive(Debug, Error)]
pub enum KioskError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("punch blocked by unresolved conflict: {0}")]
    Conflict(Box<ConflictDetection>),
    #[error("local storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("transient network failure: {0}")]
    TransientNetwork(#[from] RemoteError),
    #[error("entry {entry_id} exhausted its retry budget after {retry_count} attempts")]
    PermanentFailure { entry_id: String, retry_count: u8 },
}

impl From<ConflictDetection> for KioskError {
    fn from(detection: ConflictDetection) -> Self {
        KioskError::Conflict(Box::new(detection))
    }
}
