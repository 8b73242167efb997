//! Durable offline queue of punches and corrections awaiting remote
//! acknowledgement.
//!
//! Every mutation goes through the SQLite store before returning, so a
//! captured entry survives process restarts. Entries leave the queue only
//! through [`OfflineQueue::mark_succeeded`] or [`OfflineQueue::purge_stale`];
//! an exhausted retry budget parks the entry in `failed_permanent` where it
//! stays visible until an operator resyncs it.

use crate::clock::Clock;
use crate::db::{self, Pool};
use crate::error::StorageError;
use crate::model::{Correction, EntryState, Punch, QueueEntry, QueuePayload};
use crate::remote::Ack;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, instrument, warn};

pub const MAX_RETRIES: u8 = 3;
pub const ENTRY_TTL_HOURS: i64 = 72;
const EVENT_CHANNEL_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePolicy {
    pub max_retries: u8,
    pub entry_ttl: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            entry_ttl: Duration::hours(ENTRY_TTL_HOURS),
            base_backoff: Duration::seconds(5),
            max_backoff: Duration::seconds(300),
        }
    }
}

impl QueuePolicy {
    /// Delay before the next automatic attempt after `retry_count` failures:
    /// `base * 2^(retry_count - 1)`, capped at `max_backoff`.
    pub fn backoff_after(&self, retry_count: u8) -> Duration {
        let exp = u32::from(retry_count.saturating_sub(1)).min(10);
        let delay = self.base_backoff * (1_i32 << exp);
        delay.min(self.max_backoff)
    }
}

/// Notifications about queue entries an operator may need to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Enqueued {
        entry_id: String,
        kind: &'static str,
    },
    Succeeded {
        entry_id: String,
    },
    FailedPermanent {
        entry_id: String,
        retry_count: u8,
        last_error: String,
    },
    Purged(PurgedEntry),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgedEntry {
    pub entry_id: String,
    pub employee_id: String,
    pub kind: String,
    pub state: String,
    pub retry_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub retry_count: u8,
    pub permanent: bool,
}

/// Position of a sync pass in the queue. Each entry is offered at most once
/// per cursor, so a failing entry is not retried within the same pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeueCursor {
    after_seq: i64,
    respect_backoff: bool,
}

impl DequeueCursor {
    /// Only entries whose backoff has elapsed.
    pub fn due() -> Self {
        Self {
            after_seq: 0,
            respect_backoff: true,
        }
    }

    /// Every pending entry, regardless of backoff.
    pub fn all() -> Self {
        Self {
            after_seq: 0,
            respect_backoff: false,
        }
    }

    fn advance(&mut self, batch: &[QueueEntry]) {
        if let Some(last) = batch.last() {
            self.after_seq = self.after_seq.max(last.seq);
        }
    }
}

pub struct OfflineQueue {
    pool: Pool,
    clock: Arc<dyn Clock>,
    policy: QueuePolicy,
    events: broadcast::Sender<QueueEvent>,
    write_lock: Mutex<()>,
}

impl OfflineQueue {
    /// Open the queue over an already migrated pool. Entries left in flight
    /// by a previous process are handed back without consuming a retry,
    /// since their outcome is unknown.
    pub async fn open(
        pool: Pool,
        clock: Arc<dyn Clock>,
        policy: QueuePolicy,
    ) -> Result<Self, StorageError> {
        let recovered = db::release_all_in_flight(&pool).await?;
        if recovered > 0 {
            warn!(recovered, "recovered in-flight queue entries from previous run");
        }
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Ok(Self {
            pool,
            clock,
            policy,
            events,
            write_lock: Mutex::new(()),
        })
    }

    pub fn policy(&self) -> &QueuePolicy {
        &self.policy
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Append a standalone entry.
    #[instrument(skip_all, fields(entry_id = %entry.entry_id))]
    pub async fn enqueue(&self, entry: &QueueEntry) -> Result<i64, StorageError> {
        let _guard = self.write_lock.lock().await;
        let seq = db::insert_entry(&self.pool, entry).await?;
        self.after_enqueue(entry);
        Ok(seq)
    }

    /// Record a captured punch in the local ledger and queue it, atomically.
    #[instrument(skip_all, fields(punch_id = %punch.id))]
    pub async fn enqueue_punch(&self, punch: &Punch) -> Result<QueueEntry, StorageError> {
        let mut entry = QueueEntry::new(QueuePayload::Punch(punch.clone()), self.clock.now());
        let _guard = self.write_lock.lock().await;
        entry.seq = db::insert_punch_and_enqueue(&self.pool, punch, &entry).await?;
        self.after_enqueue(&entry);
        Ok(entry)
    }

    #[instrument(skip_all, fields(correction_id = %correction.id))]
    pub async fn enqueue_correction(
        &self,
        correction: &Correction,
    ) -> Result<QueueEntry, StorageError> {
        let mut entry =
            QueueEntry::new(QueuePayload::Correction(correction.clone()), self.clock.now());
        let _guard = self.write_lock.lock().await;
        entry.seq = db::insert_correction_and_enqueue(&self.pool, correction, &entry).await?;
        self.after_enqueue(&entry);
        Ok(entry)
    }

    fn after_enqueue(&self, entry: &QueueEntry) {
        info!(
            entry_id = %entry.entry_id,
            kind = entry.payload.kind(),
            employee_id = entry.payload.employee_id(),
            "queued entry"
        );
        self.emit(QueueEvent::Enqueued {
            entry_id: entry.entry_id.clone(),
            kind: entry.payload.kind(),
        });
    }

    /// Claim up to `limit` due entries for a sync attempt.
    pub async fn dequeue_batch(&self, limit: u32) -> Result<Vec<QueueEntry>, StorageError> {
        let mut cursor = DequeueCursor::due();
        self.dequeue_from(&mut cursor, limit).await
    }

    /// Claim up to `limit` entries after `cursor` and advance it. Claimed
    /// entries are `in_flight` and invisible to other claims until they are
    /// marked or released.
    #[instrument(skip_all)]
    pub async fn dequeue_from(
        &self,
        cursor: &mut DequeueCursor,
        limit: u32,
    ) -> Result<Vec<QueueEntry>, StorageError> {
        let due_at = cursor.respect_backoff.then(|| self.clock.now());
        let rows = {
            let _guard = self.write_lock.lock().await;
            db::claim_entries(&self.pool, cursor.after_seq, limit, due_at).await?
        };
        let batch = rows
            .into_iter()
            .map(QueueEntry::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        cursor.advance(&batch);
        Ok(batch)
    }

    /// Remove an acknowledged entry for good, recording the server id on the
    /// punch or correction it carried.
    #[instrument(skip_all, fields(entry_id = %entry.entry_id))]
    pub async fn mark_succeeded(&self, entry: &QueueEntry, ack: &Ack) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        if !db::complete_entry(&self.pool, entry, &ack.remote_id).await? {
            return Err(StorageError::UnknownEntry(entry.entry_id.clone()));
        }
        self.emit(QueueEvent::Succeeded {
            entry_id: entry.entry_id.clone(),
        });
        Ok(())
    }

    /// Count a failed attempt. The entry is parked in `failed_permanent` once
    /// it reaches the retry budget; it is never deleted here.
    #[instrument(skip_all, fields(entry_id = %entry_id))]
    pub async fn mark_failed(
        &self,
        entry_id: &str,
        error: &str,
    ) -> Result<FailureOutcome, StorageError> {
        let now = self.clock.now();
        let _guard = self.write_lock.lock().await;
        let row = db::fetch_entry(&self.pool, entry_id)
            .await?
            .ok_or_else(|| StorageError::UnknownEntry(entry_id.to_string()))?;
        let current = u8::try_from(row.retry_count).unwrap_or(u8::MAX);
        let retry_count = current.saturating_add(1).min(self.policy.max_retries);
        let permanent = retry_count >= self.policy.max_retries;
        let state = if permanent {
            EntryState::FailedPermanent
        } else {
            EntryState::Pending
        };
        let next_attempt_at = now + self.policy.backoff_after(retry_count);
        db::record_attempt_failure(
            &self.pool,
            entry_id,
            retry_count,
            state,
            now,
            next_attempt_at,
            error,
        )
        .await?;

        if permanent {
            warn!(
                entry_id,
                retry_count, error, "queue entry failed permanently; operator resync required"
            );
            self.emit(QueueEvent::FailedPermanent {
                entry_id: entry_id.to_string(),
                retry_count,
                last_error: error.to_string(),
            });
        } else {
            info!(entry_id, retry_count, %next_attempt_at, error, "queue entry will be retried");
        }
        Ok(FailureOutcome {
            retry_count,
            permanent,
        })
    }

    /// Hand claimed entries back without counting an attempt.
    pub async fn release(&self, entries: &[QueueEntry]) -> Result<u64, StorageError> {
        let ids: Vec<String> = entries.iter().map(|e| e.entry_id.clone()).collect();
        let _guard = self.write_lock.lock().await;
        db::release_entries(&self.pool, &ids).await
    }

    /// Remember the remote reference of an uploaded photo so a retry skips
    /// the upload.
    pub async fn record_photo_upload(
        &self,
        entry_id: &str,
        remote_ref: &str,
    ) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        db::record_photo_upload(&self.pool, entry_id, remote_ref).await
    }

    /// Drop every entry created more than the TTL before `now`, whatever its
    /// state. Each discarded entry is logged and announced.
    #[instrument(skip_all)]
    pub async fn purge_stale(&self, now: DateTime<Utc>) -> Result<Vec<PurgedEntry>, StorageError> {
        let cutoff = now - self.policy.entry_ttl;
        let _guard = self.write_lock.lock().await;
        let rows = db::entries_created_before(&self.pool, cutoff).await?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let seqs: Vec<i64> = rows.iter().map(|r| r.seq).collect();
        db::delete_entries(&self.pool, &seqs).await?;

        let purged: Vec<PurgedEntry> = rows
            .into_iter()
            .map(|row| PurgedEntry {
                entry_id: row.entry_id,
                employee_id: row.employee_id,
                kind: row.kind,
                state: row.state,
                retry_count: row.retry_count,
            })
            .collect();
        for entry in &purged {
            warn!(
                entry_id = %entry.entry_id,
                employee_id = %entry.employee_id,
                kind = %entry.kind,
                state = %entry.state,
                retry_count = entry.retry_count,
                "purged stale queue entry"
            );
            self.emit(QueueEvent::Purged(entry.clone()));
        }
        Ok(purged)
    }

    /// Give every permanently failed entry a fresh retry budget.
    pub async fn resync_failed(&self) -> Result<u64, StorageError> {
        let _guard = self.write_lock.lock().await;
        let requeued = db::requeue_failed(&self.pool, self.clock.now()).await?;
        if requeued > 0 {
            info!(requeued, "requeued permanently failed entries");
        }
        Ok(requeued)
    }

    /// Entries not yet acknowledged and still eligible for automatic sync.
    pub async fn pending_count(&self) -> Result<u32, StorageError> {
        let pending = db::count_entries(&self.pool, EntryState::Pending).await?;
        let in_flight = db::count_entries(&self.pool, EntryState::InFlight).await?;
        Ok(u32::try_from(pending + in_flight).unwrap_or(u32::MAX))
    }

    pub async fn failed_permanent_count(&self) -> Result<u32, StorageError> {
        let failed = db::count_entries(&self.pool, EntryState::FailedPermanent).await?;
        Ok(u32::try_from(failed).unwrap_or(u32::MAX))
    }

    pub async fn entries(&self, state: Option<EntryState>) -> Result<Vec<QueueEntry>, StorageError> {
        db::list_entries(&self.pool, state)
            .await?
            .into_iter()
            .map(QueueEntry::try_from)
            .collect()
    }

    pub async fn entry(&self, entry_id: &str) -> Result<Option<QueueEntry>, StorageError> {
        db::fetch_entry(&self.pool, entry_id)
            .await?
            .map(QueueEntry::try_from)
            .transpose()
    }
}
