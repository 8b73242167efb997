use super::model::{to_millis, CorrectionRow, PunchRow, QueueEntryRow};
use crate::error::StorageError;
use crate::model::{
    Correction, CorrectionState, EntryState, Punch, PunchType, QueueEntry, QueuePayload,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::path::Path;
use std::str::FromStr;
use tracing::instrument;

pub type Pool = SqlitePool;
type Result<T> = std::result::Result<T, StorageError>;

const PUNCH_COLUMNS: &str = "id, employee_id, company_id, punch_type, timestamp_ms, device_id, \
     location, photo_reference, pin_verified, remote_id";
const CORRECTION_COLUMNS: &str = "id, employee_id, original_punch_id, corrected_timestamp_ms, \
     reason, reason_category, state, submitted_at_ms, offline_submitted, approved_at_ms, \
     approved_by, remote_id";
const ENTRY_COLUMNS: &str = "seq, entry_id, kind, employee_id, payload, state, retry_count, \
     created_at_ms, last_attempt_at_ms, next_attempt_at_ms, last_error, uploaded_photo";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    if let Some(dir) = database_path(database_url).and_then(Path::parent) {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    // WAL plus FULL sync: a punch reported as recorded must survive power loss.
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true);
    // Every connection to `sqlite::memory:` is its own database, so an
    // in-memory store gets exactly one connection that is never recycled.
    let in_memory = database_url.starts_with("sqlite::memory");
    let mut pool_options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 4 });
    if in_memory {
        pool_options = pool_options
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    }
    let pool = pool_options.connect_with(options).await?;
    Ok(pool)
}

/// File behind a `sqlite:` URL; `None` for in-memory and non-sqlite URLs.
fn database_path(url: &str) -> Option<&Path> {
    let rest = url.strip_prefix("sqlite:")?;
    if rest.starts_with(":memory") {
        return None;
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let path = rest.split_once('?').map_or(rest, |(path, _)| path);
    (!path.is_empty()).then(|| Path::new(path))
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ── key/value store ──────────────────────────────────────────────

#[instrument(skip_all)]
pub async fn kv_get(pool: &Pool, key: &str) -> Result<Option<Vec<u8>>> {
    let value = sqlx::query_scalar::<_, Vec<u8>>("SELECT value FROM kv WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(value)
}

#[instrument(skip_all)]
pub async fn kv_set(pool: &Pool, key: &str, value: &[u8]) -> Result<()> {
    sqlx::query(
        "INSERT INTO kv (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

// ── punches ──────────────────────────────────────────────────────

/// Record a captured punch and its queue entry in one transaction.
#[instrument(skip_all)]
pub async fn insert_punch_and_enqueue(
    pool: &Pool,
    punch: &Punch,
    entry: &QueueEntry,
) -> Result<i64> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO punches (id, employee_id, company_id, punch_type, timestamp_ms, device_id, location, photo_reference, pin_verified) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&punch.id)
    .bind(&punch.employee_id)
    .bind(&punch.company_id)
    .bind(punch.punch_type.as_str())
    .bind(to_millis(punch.timestamp))
    .bind(&punch.device_id)
    .bind(&punch.location)
    .bind(&punch.photo_reference)
    .bind(punch.pin_verified)
    .execute(&mut *tx)
    .await?;
    let seq = insert_entry_tx(&mut tx, entry).await?;
    tx.commit().await?;
    Ok(seq)
}

#[instrument(skip_all)]
pub async fn fetch_punch(pool: &Pool, punch_id: &str) -> Result<Option<Punch>> {
    let row = sqlx::query_as::<_, PunchRow>(&format!(
        "SELECT {} FROM punches WHERE id = ?",
        PUNCH_COLUMNS
    ))
    .bind(punch_id)
    .fetch_optional(pool)
    .await?;
    row.map(Punch::try_from).transpose()
}

#[instrument(skip_all)]
pub async fn last_punch_for_employee(pool: &Pool, employee_id: &str) -> Result<Option<Punch>> {
    let row = sqlx::query_as::<_, PunchRow>(&format!(
        "SELECT {} FROM punches WHERE employee_id = ? ORDER BY timestamp_ms DESC LIMIT 1",
        PUNCH_COLUMNS
    ))
    .bind(employee_id)
    .fetch_optional(pool)
    .await?;
    row.map(Punch::try_from).transpose()
}

/// Latest clock-in of `employee_id` at or before `at`.
#[instrument(skip_all)]
pub async fn shift_clock_in(
    pool: &Pool,
    employee_id: &str,
    at: DateTime<Utc>,
) -> Result<Option<Punch>> {
    let row = sqlx::query_as::<_, PunchRow>(&format!(
        "SELECT {} FROM punches WHERE employee_id = ? AND punch_type = ? AND timestamp_ms <= ? \
         ORDER BY timestamp_ms DESC LIMIT 1",
        PUNCH_COLUMNS
    ))
    .bind(employee_id)
    .bind(PunchType::ClockIn.as_str())
    .bind(to_millis(at))
    .fetch_optional(pool)
    .await?;
    row.map(Punch::try_from).transpose()
}

#[instrument(skip_all)]
pub async fn punches_for_employee(pool: &Pool, employee_id: &str) -> Result<Vec<Punch>> {
    let rows = sqlx::query_as::<_, PunchRow>(&format!(
        "SELECT {} FROM punches WHERE employee_id = ? ORDER BY timestamp_ms ASC",
        PUNCH_COLUMNS
    ))
    .bind(employee_id)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(Punch::try_from).collect()
}

// ── corrections ──────────────────────────────────────────────────

#[instrument(skip_all)]
pub async fn insert_correction_and_enqueue(
    pool: &Pool,
    correction: &Correction,
    entry: &QueueEntry,
) -> Result<i64> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO corrections (id, employee_id, original_punch_id, corrected_timestamp_ms, reason, reason_category, state, submitted_at_ms, offline_submitted) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&correction.id)
    .bind(&correction.employee_id)
    .bind(&correction.original_punch_id)
    .bind(to_millis(correction.corrected_timestamp))
    .bind(&correction.reason)
    .bind(correction.reason_category.as_str())
    .bind(correction.state.as_str())
    .bind(to_millis(correction.submitted_at))
    .bind(correction.offline_submitted)
    .execute(&mut *tx)
    .await?;
    let seq = insert_entry_tx(&mut tx, entry).await?;
    tx.commit().await?;
    Ok(seq)
}

#[instrument(skip_all)]
pub async fn fetch_correction(pool: &Pool, correction_id: &str) -> Result<Option<Correction>> {
    let row = sqlx::query_as::<_, CorrectionRow>(&format!(
        "SELECT {} FROM corrections WHERE id = ?",
        CORRECTION_COLUMNS
    ))
    .bind(correction_id)
    .fetch_optional(pool)
    .await?;
    row.map(Correction::try_from).transpose()
}

/// Most recent correction for `punch_id` that still closes its shift.
#[instrument(skip_all)]
pub async fn closing_correction_for(pool: &Pool, punch_id: &str) -> Result<Option<Correction>> {
    let row = sqlx::query_as::<_, CorrectionRow>(&format!(
        "SELECT {} FROM corrections WHERE original_punch_id = ? AND state != ? \
         ORDER BY submitted_at_ms DESC LIMIT 1",
        CORRECTION_COLUMNS
    ))
    .bind(punch_id)
    .bind(CorrectionState::Rejected.as_str())
    .fetch_optional(pool)
    .await?;
    row.map(Correction::try_from).transpose()
}

#[instrument(skip_all)]
pub async fn corrections_in_state(pool: &Pool, state: CorrectionState) -> Result<Vec<Correction>> {
    let rows = sqlx::query_as::<_, CorrectionRow>(&format!(
        "SELECT {} FROM corrections WHERE state = ? ORDER BY submitted_at_ms ASC",
        CORRECTION_COLUMNS
    ))
    .bind(state.as_str())
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(Correction::try_from).collect()
}

#[instrument(skip_all)]
pub async fn record_correction_decision(
    pool: &Pool,
    correction_id: &str,
    state: CorrectionState,
    decided_at: Option<DateTime<Utc>>,
    decided_by: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE corrections SET state = ?, approved_at_ms = ?, approved_by = ? WHERE id = ?",
    )
    .bind(state.as_str())
    .bind(decided_at.map(to_millis))
    .bind(decided_by)
    .bind(correction_id)
    .execute(pool)
    .await?;
    Ok(())
}

// ── queue ────────────────────────────────────────────────────────

async fn insert_entry_tx(tx: &mut Transaction<'_, Sqlite>, entry: &QueueEntry) -> Result<i64> {
    let payload = serde_json::to_string(&entry.payload)?;
    let seq: i64 = sqlx::query_scalar(
        "INSERT INTO queue_entries (entry_id, kind, employee_id, payload, state, retry_count, created_at_ms, last_attempt_at_ms, next_attempt_at_ms) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING seq",
    )
    .bind(&entry.entry_id)
    .bind(entry.payload.kind())
    .bind(entry.payload.employee_id())
    .bind(payload)
    .bind(entry.state.as_str())
    .bind(i64::from(entry.retry_count))
    .bind(to_millis(entry.created_at))
    .bind(entry.last_attempt_at.map(to_millis))
    .bind(to_millis(entry.next_attempt_at))
    .fetch_one(&mut **tx)
    .await?;
    Ok(seq)
}

#[instrument(skip_all)]
pub async fn insert_entry(pool: &Pool, entry: &QueueEntry) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let seq = insert_entry_tx(&mut tx, entry).await?;
    tx.commit().await?;
    Ok(seq)
}

/// Move up to `limit` pending entries with `seq > after_seq` to `in_flight`
/// and return them in queue order. With `due_at` set, only entries whose
/// backoff has elapsed are claimed.
#[instrument(skip_all)]
pub async fn claim_entries(
    pool: &Pool,
    after_seq: i64,
    limit: u32,
    due_at: Option<DateTime<Utc>>,
) -> Result<Vec<QueueEntryRow>> {
    let due_ms = due_at.map(to_millis);
    let mut tx = pool.begin().await?;
    let mut rows = sqlx::query_as::<_, QueueEntryRow>(&format!(
        "SELECT {} FROM queue_entries \
         WHERE state = ? AND seq > ? AND (? IS NULL OR next_attempt_at_ms <= ?) \
         ORDER BY seq ASC LIMIT ?",
        ENTRY_COLUMNS
    ))
    .bind(EntryState::Pending.as_str())
    .bind(after_seq)
    .bind(due_ms)
    .bind(due_ms)
    .bind(i64::from(limit))
    .fetch_all(&mut *tx)
    .await?;
    for row in rows.iter_mut() {
        sqlx::query("UPDATE queue_entries SET state = ? WHERE seq = ?")
            .bind(EntryState::InFlight.as_str())
            .bind(row.seq)
            .execute(&mut *tx)
            .await?;
        row.state = EntryState::InFlight.as_str().to_string();
    }
    tx.commit().await?;
    Ok(rows)
}

#[instrument(skip_all)]
pub async fn fetch_entry(pool: &Pool, entry_id: &str) -> Result<Option<QueueEntryRow>> {
    let row = sqlx::query_as::<_, QueueEntryRow>(&format!(
        "SELECT {} FROM queue_entries WHERE entry_id = ?",
        ENTRY_COLUMNS
    ))
    .bind(entry_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

#[instrument(skip_all)]
pub async fn list_entries(pool: &Pool, state: Option<EntryState>) -> Result<Vec<QueueEntryRow>> {
    let state = state.map(|s| s.as_str());
    let rows = sqlx::query_as::<_, QueueEntryRow>(&format!(
        "SELECT {} FROM queue_entries WHERE (? IS NULL OR state = ?) ORDER BY seq ASC",
        ENTRY_COLUMNS
    ))
    .bind(state)
    .bind(state)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Delete an acknowledged entry and record the server id on the punch or
/// correction it carried.
#[instrument(skip_all)]
pub async fn complete_entry(
    pool: &Pool,
    entry: &QueueEntry,
    remote_id: &str,
) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let deleted = sqlx::query("DELETE FROM queue_entries WHERE entry_id = ?")
        .bind(&entry.entry_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    match &entry.payload {
        QueuePayload::Punch(p) => {
            sqlx::query("UPDATE punches SET remote_id = ? WHERE id = ?")
                .bind(remote_id)
                .bind(&p.id)
                .execute(&mut *tx)
                .await?;
        }
        QueuePayload::Correction(c) => {
            sqlx::query("UPDATE corrections SET remote_id = ?, state = ? WHERE id = ? AND state = ?")
                .bind(remote_id)
                .bind(CorrectionState::PendingApproval.as_str())
                .bind(&c.id)
                .bind(CorrectionState::Submitted.as_str())
                .execute(&mut *tx)
                .await?;
        }
    }
    tx.commit().await?;
    Ok(deleted > 0)
}

#[instrument(skip_all)]
pub async fn record_attempt_failure(
    pool: &Pool,
    entry_id: &str,
    retry_count: u8,
    state: EntryState,
    attempted_at: DateTime<Utc>,
    next_attempt_at: DateTime<Utc>,
    error: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE queue_entries SET retry_count = ?, state = ?, last_attempt_at_ms = ?, next_attempt_at_ms = ?, last_error = ? \
         WHERE entry_id = ?",
    )
    .bind(i64::from(retry_count))
    .bind(state.as_str())
    .bind(to_millis(attempted_at))
    .bind(to_millis(next_attempt_at))
    .bind(error)
    .bind(entry_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn record_photo_upload(pool: &Pool, entry_id: &str, remote_ref: &str) -> Result<()> {
    sqlx::query("UPDATE queue_entries SET uploaded_photo = ? WHERE entry_id = ?")
        .bind(remote_ref)
        .bind(entry_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Hand claimed entries back without consuming a retry.
#[instrument(skip_all)]
pub async fn release_entries(pool: &Pool, entry_ids: &[String]) -> Result<u64> {
    let mut tx = pool.begin().await?;
    let mut released = 0;
    for id in entry_ids {
        released += sqlx::query(
            "UPDATE queue_entries SET state = ? WHERE entry_id = ? AND state = ?",
        )
        .bind(EntryState::Pending.as_str())
        .bind(id)
        .bind(EntryState::InFlight.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();
    }
    tx.commit().await?;
    Ok(released)
}

#[instrument(skip_all)]
pub async fn release_all_in_flight(pool: &Pool) -> Result<u64> {
    let released = sqlx::query("UPDATE queue_entries SET state = ? WHERE state = ?")
        .bind(EntryState::Pending.as_str())
        .bind(EntryState::InFlight.as_str())
        .execute(pool)
        .await?
        .rows_affected();
    Ok(released)
}

#[instrument(skip_all)]
pub async fn entries_created_before(
    pool: &Pool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<QueueEntryRow>> {
    let rows = sqlx::query_as::<_, QueueEntryRow>(&format!(
        "SELECT {} FROM queue_entries WHERE created_at_ms < ? ORDER BY seq ASC",
        ENTRY_COLUMNS
    ))
    .bind(to_millis(cutoff))
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[instrument(skip_all)]
pub async fn delete_entries(pool: &Pool, seqs: &[i64]) -> Result<u64> {
    let mut tx = pool.begin().await?;
    let mut deleted = 0;
    for seq in seqs {
        deleted += sqlx::query("DELETE FROM queue_entries WHERE seq = ?")
            .bind(seq)
            .execute(&mut *tx)
            .await?
            .rows_affected();
    }
    tx.commit().await?;
    Ok(deleted)
}

#[instrument(skip_all)]
pub async fn count_entries(pool: &Pool, state: EntryState) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_entries WHERE state = ?")
        .bind(state.as_str())
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Give permanently failed entries a fresh retry budget.
#[instrument(skip_all)]
pub async fn requeue_failed(pool: &Pool, now: DateTime<Utc>) -> Result<u64> {
    let requeued = sqlx::query(
        "UPDATE queue_entries SET state = ?, retry_count = 0, next_attempt_at_ms = ? WHERE state = ?",
    )
    .bind(EntryState::Pending.as_str())
    .bind(to_millis(now))
    .bind(EntryState::FailedPermanent.as_str())
    .execute(pool)
    .await?
    .rows_affected();
    Ok(requeued)
}
