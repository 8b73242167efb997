//! Row shapes returned by repository queries and their conversion into
//! domain types.
//!
//! Timestamps are stored as integer Unix milliseconds so that range queries
//! compare numerically.

use crate::error::StorageError;
use crate::model::{
    Correction, CorrectionState, EntryState, Punch, PunchType, QueueEntry, QueuePayload,
    ReasonCategory,
};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::FromRow;

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, StorageError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StorageError::Corrupt(format!("timestamp {} out of range", ms)))
}

#[derive(Debug, Clone, FromRow)]
pub struct PunchRow {
    pub id: String,
    pub employee_id: String,
    pub company_id: String,
    pub punch_type: String,
    pub timestamp_ms: i64,
    pub device_id: String,
    pub location: Option<String>,
    pub photo_reference: Option<String>,
    pub pin_verified: bool,
    pub remote_id: Option<String>,
}

impl TryFrom<PunchRow> for Punch {
    type Error = StorageError;

    fn try_from(row: PunchRow) -> Result<Self, Self::Error> {
        let punch_type = PunchType::parse_type(&row.punch_type).ok_or_else(|| {
            StorageError::Corrupt(format!(
                "punch {} has unknown type {}",
                row.id, row.punch_type
            ))
        })?;
        Ok(Punch {
            id: row.id,
            employee_id: row.employee_id,
            company_id: row.company_id,
            punch_type,
            timestamp: from_millis(row.timestamp_ms)?,
            device_id: row.device_id,
            location: row.location,
            photo_reference: row.photo_reference,
            pin_verified: row.pin_verified,
            remote_id: row.remote_id,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct CorrectionRow {
    pub id: String,
    pub employee_id: String,
    pub original_punch_id: String,
    pub corrected_timestamp_ms: i64,
    pub reason: String,
    pub reason_category: String,
    pub state: String,
    pub submitted_at_ms: i64,
    pub offline_submitted: bool,
    pub approved_at_ms: Option<i64>,
    pub approved_by: Option<String>,
    pub remote_id: Option<String>,
}

impl TryFrom<CorrectionRow> for Correction {
    type Error = StorageError;

    fn try_from(row: CorrectionRow) -> Result<Self, Self::Error> {
        let reason_category = ReasonCategory::parse_category(&row.reason_category)
            .ok_or_else(|| {
                StorageError::Corrupt(format!(
                    "correction {} has unknown category {}",
                    row.id, row.reason_category
                ))
            })?;
        let state = CorrectionState::parse_state(&row.state).ok_or_else(|| {
            StorageError::Corrupt(format!(
                "correction {} has unknown state {}",
                row.id, row.state
            ))
        })?;
        Ok(Correction {
            id: row.id,
            employee_id: row.employee_id,
            original_punch_id: row.original_punch_id,
            corrected_timestamp: from_millis(row.corrected_timestamp_ms)?,
            reason: row.reason,
            reason_category,
            state,
            submitted_at: from_millis(row.submitted_at_ms)?,
            offline_submitted: row.offline_submitted,
            approved_at: row.approved_at_ms.map(from_millis).transpose()?,
            approved_by: row.approved_by,
            remote_id: row.remote_id,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct QueueEntryRow {
    pub seq: i64,
    pub entry_id: String,
    pub kind: String,
    pub employee_id: String,
    pub payload: String,
    pub state: String,
    pub retry_count: i64,
    pub created_at_ms: i64,
    pub last_attempt_at_ms: Option<i64>,
    pub next_attempt_at_ms: i64,
    pub last_error: Option<String>,
    pub uploaded_photo: Option<String>,
}

impl TryFrom<QueueEntryRow> for QueueEntry {
    type Error = StorageError;

    fn try_from(row: QueueEntryRow) -> Result<Self, Self::Error> {
        let payload: QueuePayload = serde_json::from_str(&row.payload)?;
        if payload.kind() != row.kind {
            return Err(StorageError::Corrupt(format!(
                "entry {} is tagged {} but carries a {}",
                row.entry_id,
                row.kind,
                payload.kind()
            )));
        }
        let state = EntryState::parse_state(&row.state).ok_or_else(|| {
            StorageError::Corrupt(format!(
                "entry {} has unknown state {}",
                row.entry_id, row.state
            ))
        })?;
        let retry_count = u8::try_from(row.retry_count).map_err(|_| {
            StorageError::Corrupt(format!(
                "entry {} has retry count {}",
                row.entry_id, row.retry_count
            ))
        })?;
        Ok(QueueEntry {
            seq: row.seq,
            entry_id: row.entry_id,
            payload,
            state,
            retry_count,
            created_at: from_millis(row.created_at_ms)?,
            last_attempt_at: row.last_attempt_at_ms.map(from_millis).transpose()?,
            next_attempt_at: from_millis(row.next_attempt_at_ms)?,
            last_error: row.last_error,
            uploaded_photo: row.uploaded_photo,
        })
    }
}
