//! Drains the offline queue against the remote authority.
//!
//! At most one pass runs at a time. A pass purges expired entries, then
//! submits pending entries in queue order, offering each entry once. If
//! connectivity drops mid-pass, the in-flight submission is abandoned and the
//! rest of the claimed batch is handed back untouched. A correction is held
//! back while the punch it corrects is still queued.

use crate::clock::Clock;
use crate::connectivity::Connectivity;
use crate::correction::CorrectionWorkflow;
use crate::db;
use crate::error::{KioskError, StorageError};
use crate::model::{CorrectionState, EntryFailure, QueueEntry, QueuePayload, SyncSummary};
use crate::queue::{DequeueCursor, OfflineQueue};
use crate::remote::{Ack, RemoteAuthority, RemoteError};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

pub const SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// What started a sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Timer,
    Reconnect,
    Capture,
    Manual,
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTrigger::Timer => "timer",
            SyncTrigger::Reconnect => "reconnect",
            SyncTrigger::Capture => "capture",
            SyncTrigger::Manual => "manual",
        }
    }

    /// Only the periodic timer waits out retry backoff.
    pub fn respects_backoff(&self) -> bool {
        matches!(self, SyncTrigger::Timer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub batch_size: u32,
    pub request_timeout: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: 25,
            request_timeout: Duration::from_secs(15),
        }
    }
}

enum Outcome {
    Settled,
    /// Handed back untouched; retried on a later pass.
    Deferred,
    Abandoned,
}

struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncEngine {
    queue: Arc<OfflineQueue>,
    remote: Arc<dyn RemoteAuthority>,
    connectivity: Connectivity,
    settings: SyncSettings,
    running: AtomicBool,
}

async fn timed<T, F>(limit: Duration, fut: F) -> Result<T, RemoteError>
where
    F: Future<Output = Result<T, RemoteError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| RemoteError::Timeout(limit))?
}

async fn went_offline(link: &mut watch::Receiver<bool>) {
    // Err means the sender is gone, which only happens at shutdown.
    let _ = link.wait_for(|online| !*online).await;
}

impl SyncEngine {
    pub fn new(
        queue: Arc<OfflineQueue>,
        remote: Arc<dyn RemoteAuthority>,
        connectivity: Connectivity,
        settings: SyncSettings,
    ) -> Self {
        Self {
            queue,
            remote,
            connectivity,
            settings,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// Run one pass. Returns `None` when another pass already holds the
    /// engine.
    #[instrument(skip_all, fields(trigger = trigger.as_str()))]
    pub async fn run_pass(&self, trigger: SyncTrigger) -> Result<Option<SyncSummary>, StorageError> {
        let Some(_guard) = PassGuard::acquire(&self.running) else {
            debug!("sync pass already running; trigger ignored");
            return Ok(None);
        };

        let mut summary = SyncSummary::default();
        let purged = self.queue.purge_stale(self.queue.clock().now()).await?;
        summary.purged_count = u32::try_from(purged.len()).unwrap_or(u32::MAX);

        if !self.connectivity.is_online() {
            debug!("offline; nothing submitted");
            return Ok(Some(summary));
        }

        info!("sync pass started");
        let mut link = self.connectivity.subscribe();
        let mut cursor = if trigger.respects_backoff() {
            DequeueCursor::due()
        } else {
            DequeueCursor::all()
        };

        'pass: loop {
            // A failed claim rolls back, so nothing is left in flight.
            let batch = self
                .queue
                .dequeue_from(&mut cursor, self.settings.batch_size)
                .await?;
            if batch.is_empty() {
                break;
            }
            let mut claimed = batch.into_iter();
            while let Some(entry) = claimed.next() {
                match self.process(&entry, &mut link, &mut summary).await {
                    Ok(Outcome::Settled) => {}
                    Ok(Outcome::Deferred) => summary.deferred_count += 1,
                    Ok(Outcome::Abandoned) => {
                        let mut abandoned = vec![entry];
                        abandoned.extend(claimed);
                        self.queue.release(&abandoned).await?;
                        summary.abandoned_count =
                            u32::try_from(abandoned.len()).unwrap_or(u32::MAX);
                        warn!(
                            abandoned = summary.abandoned_count,
                            "connectivity lost; sync pass abandoned"
                        );
                        break 'pass;
                    }
                    Err(err) => {
                        let mut stranded = vec![entry];
                        stranded.extend(claimed);
                        self.hand_back(&stranded).await;
                        return Err(err);
                    }
                }
            }
        }

        if self.connectivity.is_online() {
            summary.approvals_resolved = self.refresh_approvals().await?;
        }

        info!(
            synced = summary.synced_count,
            failed = summary.errors.len(),
            abandoned = summary.abandoned_count,
            deferred = summary.deferred_count,
            purged = summary.purged_count,
            approvals = summary.approvals_resolved,
            "sync pass finished"
        );
        Ok(Some(summary))
    }

    /// Run a pass on its own task.
    pub fn spawn_pass(self: &Arc<Self>, trigger: SyncTrigger) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = engine.run_pass(trigger).await {
                error!(error = %err, trigger = trigger.as_str(), "sync pass failed");
            }
        })
    }

    /// Submit one claimed entry and record the outcome.
    async fn process(
        &self,
        entry: &QueueEntry,
        link: &mut watch::Receiver<bool>,
        summary: &mut SyncSummary,
    ) -> Result<Outcome, StorageError> {
        let original_remote_id = match &entry.payload {
            QueuePayload::Punch(_) => None,
            QueuePayload::Correction(correction) => {
                let pool = self.queue.pool();
                if db::fetch_entry(pool, &correction.original_punch_id)
                    .await?
                    .is_some()
                {
                    self.queue.release(std::slice::from_ref(entry)).await?;
                    debug!(
                        entry_id = %entry.entry_id,
                        punch_id = %correction.original_punch_id,
                        "correction waits for its punch"
                    );
                    return Ok(Outcome::Deferred);
                }
                db::fetch_punch(pool, &correction.original_punch_id)
                    .await?
                    .and_then(|punch| punch.remote_id)
            }
        };

        let result = tokio::select! {
            biased;
            _ = went_offline(link) => return Ok(Outcome::Abandoned),
            result = self.submit(entry, original_remote_id.as_deref()) => result,
        };
        self.settle(entry, result, summary).await?;
        Ok(Outcome::Settled)
    }

    /// Return entries to `pending` after a local failure cut the pass short.
    async fn hand_back(&self, entries: &[QueueEntry]) {
        match self.queue.release(entries).await {
            Ok(released) => warn!(released, "sync pass aborted; claimed entries handed back"),
            Err(err) => error!(
                error = %err,
                stranded = entries.len(),
                "could not hand back claimed entries; they are recovered on restart"
            ),
        }
    }

    async fn settle(
        &self,
        entry: &QueueEntry,
        result: Result<Ack, RemoteError>,
        summary: &mut SyncSummary,
    ) -> Result<(), StorageError> {
        match result {
            Ok(ack) => {
                match self.queue.mark_succeeded(entry, &ack).await {
                    Ok(()) => {}
                    Err(StorageError::UnknownEntry(id)) => {
                        warn!(entry_id = %id, "acknowledged entry no longer queued");
                    }
                    Err(err) => return Err(err),
                }
                summary.synced_count += 1;
                info!(
                    entry_id = %entry.entry_id,
                    remote_id = %ack.remote_id,
                    duplicate = ack.duplicate,
                    "entry synced"
                );
            }
            Err(err) => {
                let outcome = self.queue.mark_failed(&entry.entry_id, &err.to_string()).await?;
                let message = if outcome.permanent {
                    let permanent = KioskError::PermanentFailure {
                        entry_id: entry.entry_id.clone(),
                        retry_count: outcome.retry_count,
                    };
                    format!("{}: {}", permanent, err)
                } else if err.is_transient() {
                    KioskError::TransientNetwork(err).to_string()
                } else {
                    err.to_string()
                };
                warn!(
                    entry_id = %entry.entry_id,
                    retry_count = outcome.retry_count,
                    permanent = outcome.permanent,
                    error = %message,
                    "entry sync failed"
                );
                summary.errors.push(EntryFailure {
                    entry_id: entry.entry_id.clone(),
                    retry_count: outcome.retry_count,
                    permanent: outcome.permanent,
                    message,
                });
            }
        }
        Ok(())
    }

    async fn submit(
        &self,
        entry: &QueueEntry,
        original_remote_id: Option<&str>,
    ) -> Result<Ack, RemoteError> {
        let limit = self.settings.request_timeout;
        match &entry.payload {
            QueuePayload::Punch(punch) => {
                let photo_id = match (&entry.uploaded_photo, &punch.photo_reference) {
                    (Some(uploaded), _) => Some(uploaded.clone()),
                    (None, Some(reference)) => {
                        let uploaded =
                            timed(limit, self.remote.upload_photo(&entry.entry_id, reference))
                                .await?;
                        if let Err(err) = self
                            .queue
                            .record_photo_upload(&entry.entry_id, &uploaded)
                            .await
                        {
                            warn!(entry_id = %entry.entry_id, error = %err, "could not record photo upload");
                        }
                        Some(uploaded)
                    }
                    (None, None) => None,
                };
                timed(
                    limit,
                    self.remote
                        .submit_punch(&entry.entry_id, punch, photo_id.as_deref()),
                )
                .await
            }
            QueuePayload::Correction(correction) => {
                timed(
                    limit,
                    self.remote
                        .submit_correction(&entry.entry_id, correction, original_remote_id),
                )
                .await
            }
        }
    }

    /// Poll decisions for acknowledged corrections still awaiting approval.
    async fn refresh_approvals(&self) -> Result<u32, StorageError> {
        let pool = self.queue.pool();
        let awaiting = db::corrections_in_state(pool, CorrectionState::PendingApproval).await?;
        let mut resolved = 0;
        for correction in awaiting {
            if !self.connectivity.is_online() {
                break;
            }
            let lookup = correction.remote_id.as_deref().unwrap_or(&correction.id);
            let decision = match timed(
                self.settings.request_timeout,
                self.remote.get_approval_status(lookup),
            )
            .await
            {
                Ok(decision) => decision,
                Err(err) => {
                    debug!(correction_id = %correction.id, error = %err, "approval lookup failed");
                    continue;
                }
            };
            let observed_at = self.queue.clock().now();
            if let Some(updated) = CorrectionWorkflow::apply_decision(&correction, &decision, observed_at) {
                db::record_correction_decision(
                    pool,
                    &updated.id,
                    updated.state,
                    updated.approved_at,
                    updated.approved_by.as_deref(),
                )
                .await?;
                info!(
                    correction_id = %updated.id,
                    state = updated.state.as_str(),
                    "correction decided"
                );
                resolved += 1;
            }
        }
        Ok(resolved)
    }
}

/// Periodic and reconnect-driven sync. Stops when `cancel` fires.
pub fn spawn_sync_scheduler(
    engine: Arc<SyncEngine>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;
        let mut link = engine.connectivity().subscribe();
        let mut was_online = *link.borrow_and_update();
        loop {
            let trigger = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                changed = link.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = *link.borrow_and_update();
                    let reconnected = online && !was_online;
                    was_online = online;
                    if !reconnected {
                        continue;
                    }
                    SyncTrigger::Reconnect
                }
                _ = ticker.tick() => SyncTrigger::Timer,
            };
            if let Err(err) = engine.run_pass(trigger).await {
                error!(error = %err, trigger = trigger.as_str(), "sync pass failed");
            }
        }
        info!("sync scheduler stopped");
    })
}
