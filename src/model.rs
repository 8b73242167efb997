use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PunchType {
    ClockIn,
    ClockOut,
    BreakStart,
    BreakEnd,
    MealStart,
    MealEnd,
}

impl PunchType {
    pub const ALL: [PunchType; 6] = [
        PunchType::ClockIn,
        PunchType::ClockOut,
        PunchType::BreakStart,
        PunchType::BreakEnd,
        PunchType::MealStart,
        PunchType::MealEnd,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PunchType::ClockIn => "clock_in",
            PunchType::ClockOut => "clock_out",
            PunchType::BreakStart => "break_start",
            PunchType::BreakEnd => "break_end",
            PunchType::MealStart => "meal_start",
            PunchType::MealEnd => "meal_end",
        }
    }

    pub fn parse_type(s: &str) -> Option<Self> {
        PunchType::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// True when this punch leaves the employee on the clock and working.
    pub fn opens_shift(&self) -> bool {
        matches!(
            self,
            PunchType::ClockIn | PunchType::BreakEnd | PunchType::MealEnd
        )
    }
}

impl fmt::Display for PunchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single clock event. Immutable once captured; only `remote_id` is filled
/// in after the remote authority acknowledges it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Punch {
    /// Client-generated id, also the idempotency key on the wire.
    pub id: String,
    pub employee_id: String,
    pub company_id: String,
    pub punch_type: PunchType,
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub location: Option<String>,
    pub photo_reference: Option<String>,
    pub pin_verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
}

impl Punch {
    pub fn to_ref(&self) -> PunchRef {
        PunchRef {
            id: self.id.clone(),
            punch_type: self.punch_type,
            timestamp: self.timestamp,
        }
    }
}

/// Lightweight pointer at a stored punch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PunchRef {
    pub id: String,
    pub punch_type: PunchType,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCategory {
    Forgot,
    KioskDown,
    Emergency,
    BreakIssue,
    Other,
}

impl ReasonCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCategory::Forgot => "forgot",
            ReasonCategory::KioskDown => "kiosk_down",
            ReasonCategory::Emergency => "emergency",
            ReasonCategory::BreakIssue => "break_issue",
            ReasonCategory::Other => "other",
        }
    }

    pub fn parse_category(s: &str) -> Option<Self> {
        match s {
            "forgot" => Some(ReasonCategory::Forgot),
            "kiosk_down" => Some(ReasonCategory::KioskDown),
            "emergency" => Some(ReasonCategory::Emergency),
            "break_issue" => Some(ReasonCategory::BreakIssue),
            "other" => Some(ReasonCategory::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        }
    }
}

/// Where a correction sits in its approval workflow.
///
/// `Submitted` exists only on the device; the remote acknowledgement moves it
/// to `PendingApproval`, and only a remote decision reaches `Approved` or
/// `Rejected`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionState {
    Submitted,
    PendingApproval,
    Approved,
    Rejected,
}

impl CorrectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorrectionState::Submitted => "submitted",
            CorrectionState::PendingApproval => "pending_approval",
            CorrectionState::Approved => "approved",
            CorrectionState::Rejected => "rejected",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "submitted" => Some(CorrectionState::Submitted),
            "pending_approval" => Some(CorrectionState::PendingApproval),
            "approved" => Some(CorrectionState::Approved),
            "rejected" => Some(CorrectionState::Rejected),
            _ => None,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, CorrectionState::Approved | CorrectionState::Rejected)
    }

    /// State after the remote authority acknowledged the submission.
    pub fn acknowledged(self) -> Self {
        match self {
            CorrectionState::Submitted => CorrectionState::PendingApproval,
            other => other,
        }
    }

    /// State after observing a remote approval status. Decisions are only
    /// accepted once the correction reached the remote authority, and a
    /// final state never changes again.
    pub fn apply_remote(self, status: ApprovalStatus) -> Self {
        match (self, status) {
            (CorrectionState::PendingApproval, ApprovalStatus::Approved) => {
                CorrectionState::Approved
            }
            (CorrectionState::PendingApproval, ApprovalStatus::Rejected) => {
                CorrectionState::Rejected
            }
            (state, _) => state,
        }
    }
}

/// A proposed amendment closing an open shift. Never rewrites the punch it
/// refers to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Correction {
    pub id: String,
    pub employee_id: String,
    pub original_punch_id: String,
    pub corrected_timestamp: DateTime<Utc>,
    pub reason: String,
    pub reason_category: ReasonCategory,
    pub state: CorrectionState,
    pub submitted_at: DateTime<Utc>,
    pub offline_submitted: bool,
    pub approved_at: Option<DateTime<Utc>>,
    pub approved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
}

impl Correction {
    pub fn approval_status(&self) -> ApprovalStatus {
        match self.state {
            CorrectionState::Submitted | CorrectionState::PendingApproval => {
                ApprovalStatus::Pending
            }
            CorrectionState::Approved => ApprovalStatus::Approved,
            CorrectionState::Rejected => ApprovalStatus::Rejected,
        }
    }

    /// A correction that has not been rejected closes the shift it refers to.
    pub fn closes_shift(&self) -> bool {
        self.state != CorrectionState::Rejected
    }
}

/// What a queue entry carries to the remote authority.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueuePayload {
    Punch(Punch),
    Correction(Correction),
}

impl QueuePayload {
    pub fn kind(&self) -> &'static str {
        match self {
            QueuePayload::Punch(_) => "punch",
            QueuePayload::Correction(_) => "correction",
        }
    }

    pub fn employee_id(&self) -> &str {
        match self {
            QueuePayload::Punch(p) => &p.employee_id,
            QueuePayload::Correction(c) => &c.employee_id,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Pending,
    InFlight,
    FailedPermanent,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::Pending => "pending",
            EntryState::InFlight => "in_flight",
            EntryState::FailedPermanent => "failed_permanent",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EntryState::Pending),
            "in_flight" => Some(EntryState::InFlight),
            "failed_permanent" => Some(EntryState::FailedPermanent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueEntry {
    /// Insertion order; drives sync order.
    pub seq: i64,
    /// Client-generated, globally unique; the idempotency key.
    pub entry_id: String,
    pub payload: QueuePayload,
    pub state: EntryState,
    pub retry_count: u8,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Remote reference of an already uploaded photo, kept so a retried
    /// submission does not upload the blob again.
    pub uploaded_photo: Option<String>,
}

impl QueueEntry {
    /// A fresh entry for `payload`. The entry id is the payload's own id so
    /// that a resubmission of the same punch or correction is recognised by
    /// the remote authority.
    pub fn new(payload: QueuePayload, now: DateTime<Utc>) -> Self {
        let entry_id = match &payload {
            QueuePayload::Punch(p) => p.id.clone(),
            QueuePayload::Correction(c) => c.id.clone(),
        };
        Self {
            seq: 0,
            entry_id,
            payload,
            state: EntryState::Pending,
            retry_count: 0,
            created_at: now,
            last_attempt_at: None,
            next_attempt_at: now,
            last_error: None,
            uploaded_photo: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    MissingClockout,
    MissingClockin,
    OverlappingShift,
    None,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::MissingClockout => "missing_clockout",
            ConflictType::MissingClockin => "missing_clockin",
            ConflictType::OverlappingShift => "overlapping_shift",
            ConflictType::None => "none",
        }
    }
}

/// Result of inspecting an employee's last punch before a new one.
/// Computed on demand, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConflictDetection {
    pub has_conflict: bool,
    pub conflict_type: ConflictType,
    pub last_punch: Option<PunchRef>,
    pub suggested_clockout: Option<DateTime<Utc>>,
}

impl ConflictDetection {
    pub fn clear(last_punch: Option<PunchRef>) -> Self {
        Self {
            has_conflict: false,
            conflict_type: ConflictType::None,
            last_punch,
            suggested_clockout: None,
        }
    }

    pub fn conflict(
        conflict_type: ConflictType,
        last_punch: Option<PunchRef>,
        suggested_clockout: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            has_conflict: conflict_type != ConflictType::None,
            conflict_type,
            last_punch,
            suggested_clockout,
        }
    }
}

impl fmt::Display for ConflictDetection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.conflict_type.as_str())?;
        if let Some(last) = &self.last_punch {
            write!(f, " (last {} at {})", last.punch_type, last.timestamp)?;
        }
        if let Some(suggested) = &self.suggested_clockout {
            write!(f, ", suggested clock-out {}", suggested)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct OfflineStatus {
    pub is_online: bool,
    pub pending_count: u32,
    pub failed_permanent_count: u32,
}

/// One entry that could not be delivered during a sync pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntryFailure {
    pub entry_id: String,
    pub retry_count: u8,
    pub permanent: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SyncSummary {
    pub synced_count: u32,
    pub errors: Vec<EntryFailure>,
    /// Entries handed back to the queue because connectivity dropped mid-pass.
    pub abandoned_count: u32,
    /// Corrections held back because their punch is not yet acknowledged.
    pub deferred_count: u32,
    pub purged_count: u32,
    pub approvals_resolved: u32,
    /// True when another pass was already running and this trigger was a no-op.
    pub skipped: bool,
}
