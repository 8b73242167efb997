//! Correction workflow: turns a missed clock-out into an approvable record.
//!
//! Validation happens here, before anything is enqueued. A correction that
//! passes is queued exactly like a punch and only the remote authority can
//! approve or reject it.

use crate::error::ValidationError;
use crate::model::{Correction, CorrectionState, Punch, PunchType, ReasonCategory};
use crate::remote::ApprovalDecision;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrectionRequest {
    pub employee_id: String,
    pub original_punch_id: String,
    pub corrected_timestamp: DateTime<Utc>,
    pub reason: String,
    pub reason_category: Option<ReasonCategory>,
}

#[derive(Debug, Clone, Copy)]
pub struct CorrectionWorkflow {
    max_shift: Duration,
}

impl Default for CorrectionWorkflow {
    fn default() -> Self {
        Self::new(Duration::hours(16))
    }
}

impl CorrectionWorkflow {
    pub fn new(max_shift: Duration) -> Self {
        Self { max_shift }
    }

    /// Check `request` against the open punch it amends and the clock-in that
    /// started that shift.
    pub fn validate(
        &self,
        request: &CorrectionRequest,
        original: &Punch,
        shift_clock_in: &Punch,
        now: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        if request.reason.trim().is_empty() {
            return Err(ValidationError::MissingReason);
        }
        if request.reason_category.is_none() {
            return Err(ValidationError::MissingReasonCategory);
        }
        if original.employee_id != request.employee_id {
            return Err(ValidationError::ForeignPunch {
                punch_id: original.id.clone(),
                employee_id: request.employee_id.clone(),
            });
        }
        if !original.punch_type.opens_shift() {
            return Err(ValidationError::PunchNotOpen(original.id.clone()));
        }
        if shift_clock_in.punch_type != PunchType::ClockIn
            || shift_clock_in.employee_id != original.employee_id
            || shift_clock_in.timestamp > original.timestamp
        {
            return Err(ValidationError::MissingShiftClockIn(original.id.clone()));
        }

        let corrected = request.corrected_timestamp;
        if corrected <= shift_clock_in.timestamp {
            return Err(ValidationError::CorrectedNotAfterClockIn {
                clock_in: shift_clock_in.timestamp,
            });
        }
        if corrected <= original.timestamp {
            return Err(ValidationError::CorrectedNotAfterOpenPunch {
                open_punch: original.timestamp,
            });
        }
        let length = corrected - shift_clock_in.timestamp;
        if length > self.max_shift {
            return Err(ValidationError::ShiftTooLong {
                minutes: length.num_minutes(),
                max_hours: self.max_shift.num_hours(),
            });
        }
        if corrected > now {
            return Err(ValidationError::CorrectedInFuture(corrected));
        }
        Ok(())
    }

    /// Validate and build the record to enqueue. `online` is the link state
    /// at submission time.
    pub fn build(
        &self,
        request: &CorrectionRequest,
        original: &Punch,
        shift_clock_in: &Punch,
        now: DateTime<Utc>,
        online: bool,
    ) -> Result<Correction, ValidationError> {
        self.validate(request, original, shift_clock_in, now)?;
        let reason_category = request
            .reason_category
            .ok_or(ValidationError::MissingReasonCategory)?;
        Ok(Correction {
            id: Uuid::new_v4().to_string(),
            employee_id: request.employee_id.clone(),
            original_punch_id: original.id.clone(),
            corrected_timestamp: request.corrected_timestamp,
            reason: request.reason.trim().to_string(),
            reason_category,
            state: CorrectionState::Submitted,
            submitted_at: now,
            offline_submitted: !online,
            approved_at: None,
            approved_by: None,
            remote_id: None,
        })
    }

    /// Apply a remote decision. Returns the updated correction when the
    /// decision moved it to a final state.
    pub fn apply_decision(
        correction: &Correction,
        decision: &ApprovalDecision,
        observed_at: DateTime<Utc>,
    ) -> Option<Correction> {
        let next = correction.state.apply_remote(decision.status);
        if next == correction.state {
            return None;
        }
        let mut updated = correction.clone();
        updated.state = next;
        updated.approved_at = Some(decision.decided_at.unwrap_or(observed_at));
        updated.approved_by = decision.decided_by.clone();
        Some(updated)
    }
}
