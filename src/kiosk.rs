//! The kiosk engine as seen by the capture UI and reporting.
//!
//! A punch attempt runs the conflict detector, then the punch state machine,
//! then lands in the offline queue. Only a durable write is reported as a
//! captured punch.

use crate::clock::Clock;
use crate::config::{Config, ConfigError};
use crate::conflict::{ConflictDetector, ShiftPolicy, ShiftSnapshot};
use crate::connectivity::Connectivity;
use crate::correction::{CorrectionRequest, CorrectionWorkflow};
use crate::credential::CredentialVerifier;
use crate::db::{self, Pool};
use crate::device::DeviceIdentity;
use crate::error::{KioskError, StorageError, ValidationError};
use crate::model::{
    ConflictDetection, Correction, EntryState, OfflineStatus, Punch, PunchType, QueueEntry,
    SyncSummary,
};
use crate::queue::{OfflineQueue, QueueEvent, QueuePolicy};
use crate::remote::RemoteAuthority;
use crate::state_machine;
use crate::sync::{SyncEngine, SyncSettings, SyncTrigger};
use chrono::{DateTime, Duration, FixedOffset, TimeZone, Utc};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KioskSettings {
    pub company_id: String,
    /// Fixed device id; generated and persisted when absent.
    pub device_id: Option<String>,
    pub queue: QueuePolicy,
    pub shift: ShiftPolicy,
    pub sync: SyncSettings,
    pub submit_on_capture: bool,
}

impl Default for KioskSettings {
    fn default() -> Self {
        Self {
            company_id: "default".into(),
            device_id: None,
            queue: QueuePolicy::default(),
            shift: ShiftPolicy::default(),
            sync: SyncSettings::default(),
            submit_on_capture: true,
        }
    }
}

// Config values are clamped to a century so chrono never overflows.
const MAX_CONFIG_HOURS: u64 = 24 * 365 * 100;

fn hours(value: u64) -> Duration {
    Duration::hours(value.min(MAX_CONFIG_HOURS) as i64)
}

fn seconds(value: u64) -> Duration {
    Duration::seconds(value.min(MAX_CONFIG_HOURS * 3600) as i64)
}

impl KioskSettings {
    pub fn from_config(cfg: &Config) -> Result<Self, ConfigError> {
        let local_offset = FixedOffset::east_opt(cfg.shift.utc_offset_minutes * 60)
            .ok_or(ConfigError::Invalid("shift.utc_offset_minutes must be within a day"))?;
        Ok(Self {
            company_id: cfg.device.company_id.clone(),
            device_id: cfg.device.device_id.clone(),
            queue: QueuePolicy {
                max_retries: cfg.queue.max_retries,
                entry_ttl: hours(cfg.queue.entry_ttl_hours),
                max_backoff: seconds(cfg.sync.max_backoff_seconds),
                ..QueuePolicy::default()
            },
            shift: ShiftPolicy {
                default_open_shift: hours(cfg.shift.default_open_shift_hours),
                typical_shift: hours(cfg.shift.typical_shift_hours),
                max_shift: hours(cfg.shift.max_shift_hours),
                local_offset,
            },
            sync: SyncSettings {
                batch_size: cfg.sync.batch_size,
                request_timeout: std::time::Duration::from_secs(cfg.sync.request_timeout_seconds),
            },
            submit_on_capture: cfg.sync.submit_on_capture,
        })
    }
}

/// One punch attempt at the kiosk.
#[derive(Clone, Default)]
pub struct CaptureRequest {
    pub employee_id: String,
    /// Punch type chosen by the employee. When absent the state machine
    /// decides.
    pub punch_type: Option<PunchType>,
    pub location: Option<String>,
    pub photo_reference: Option<String>,
    /// PIN or badge secret, checked by the kiosk's credential verifier.
    pub credential: Option<String>,
    /// Length of the employee's scheduled shift, when the schedule is known.
    pub scheduled_shift: Option<Duration>,
}

impl fmt::Debug for CaptureRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureRequest")
            .field("employee_id", &self.employee_id)
            .field("punch_type", &self.punch_type)
            .field("location", &self.location)
            .field("photo_reference", &self.photo_reference)
            .field("credential", &self.credential.as_ref().map(|_| "***"))
            .field("scheduled_shift", &self.scheduled_shift)
            .finish()
    }
}

impl CaptureRequest {
    pub fn new(employee_id: impl Into<String>) -> Self {
        Self {
            employee_id: employee_id.into(),
            ..Self::default()
        }
    }

    pub fn punch_type(mut self, punch_type: PunchType) -> Self {
        self.punch_type = Some(punch_type);
        self
    }

    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn photo(mut self, reference: impl Into<String>) -> Self {
        self.photo_reference = Some(reference.into());
        self
    }

    pub fn credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    pub fn scheduled_shift(mut self, length: Duration) -> Self {
        self.scheduled_shift = Some(length);
        self
    }
}

pub struct Kiosk {
    queue: Arc<OfflineQueue>,
    engine: Arc<SyncEngine>,
    connectivity: Connectivity,
    clock: Arc<dyn Clock>,
    verifier: Arc<dyn CredentialVerifier>,
    detector: ConflictDetector,
    corrections: CorrectionWorkflow,
    device: DeviceIdentity,
    company_id: String,
    submit_on_capture: bool,
    // Serializes the read-check-write of a capture or correction.
    capture_lock: Mutex<()>,
}

impl Kiosk {
    /// Assemble the engine over a migrated pool.
    pub async fn open(
        pool: Pool,
        remote: Arc<dyn RemoteAuthority>,
        clock: Arc<dyn Clock>,
        verifier: Arc<dyn CredentialVerifier>,
        connectivity: Connectivity,
        settings: KioskSettings,
    ) -> Result<Self, StorageError> {
        let device = DeviceIdentity::load_or_create(&pool, settings.device_id.as_deref()).await?;
        let queue = Arc::new(OfflineQueue::open(pool, Arc::clone(&clock), settings.queue).await?);
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&queue),
            remote,
            connectivity.clone(),
            settings.sync,
        ));
        info!(device_id = %device.id(), company_id = %settings.company_id, "kiosk ready");
        Ok(Self {
            queue,
            engine,
            connectivity,
            clock,
            verifier,
            detector: ConflictDetector::new(settings.shift),
            corrections: CorrectionWorkflow::new(settings.shift.max_shift),
            device,
            company_id: settings.company_id,
            submit_on_capture: settings.submit_on_capture,
            capture_lock: Mutex::new(()),
        })
    }

    pub fn device_id(&self) -> &str {
        self.device.id()
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.queue.subscribe()
    }

    /// Stored timestamps have millisecond precision.
    fn now(&self) -> DateTime<Utc> {
        let now = self.clock.now();
        Utc.timestamp_millis_opt(now.timestamp_millis())
            .single()
            .unwrap_or(now)
    }

    async fn snapshot_parts(
        &self,
        employee_id: &str,
    ) -> Result<(Option<Punch>, Option<Correction>), StorageError> {
        let pool = self.queue.pool();
        let last = db::last_punch_for_employee(pool, employee_id).await?;
        let closing = match &last {
            Some(punch) => db::closing_correction_for(pool, &punch.id).await?,
            None => None,
        };
        Ok((last, closing))
    }

    /// Key derivation is CPU-bound, so it runs on the blocking pool.
    async fn verify_credential(&self, employee_id: &str, credential: &str) -> bool {
        let verifier = Arc::clone(&self.verifier);
        let employee_id = employee_id.to_string();
        let credential = credential.to_string();
        match tokio::task::spawn_blocking(move || verifier.verify(&employee_id, &credential)).await
        {
            Ok(accepted) => accepted,
            Err(err) => {
                error!(error = %err, "credential check did not complete");
                false
            }
        }
    }

    /// Record a punch for `request.employee_id`. Fails without recording
    /// anything on a conflict, a validation error or a storage error.
    #[instrument(skip_all, fields(employee_id = %request.employee_id))]
    pub async fn capture_punch(&self, request: CaptureRequest) -> Result<Punch, KioskError> {
        let employee_id = request.employee_id.trim();
        if employee_id.is_empty() {
            return Err(ValidationError::EmptyEmployeeId.into());
        }
        let pin_verified = match &request.credential {
            Some(credential) => {
                if !self.verify_credential(employee_id, credential).await {
                    warn!("credential rejected");
                    return Err(ValidationError::CredentialRejected(employee_id.to_string()).into());
                }
                true
            }
            None => false,
        };

        let guard = self.capture_lock.lock().await;
        let now = self.now();
        let (last, closing) = self.snapshot_parts(employee_id).await?;
        let snapshot = ShiftSnapshot::new(last.as_ref(), closing.as_ref());
        let detection =
            self.detector
                .check_attempt(&snapshot, request.punch_type, now, request.scheduled_shift);
        if detection.has_conflict {
            info!(conflict = %detection, "punch blocked");
            return Err(detection.into());
        }

        let last_type = snapshot.effective_last_type();
        let punch_type = match request.punch_type {
            Some(requested) => state_machine::validate_next(last_type, requested)?,
            None => state_machine::next_punch_type(last_type),
        };

        let punch = Punch {
            id: Uuid::new_v4().to_string(),
            employee_id: employee_id.to_string(),
            company_id: self.company_id.clone(),
            punch_type,
            timestamp: now,
            device_id: self.device.id().to_string(),
            location: request.location,
            photo_reference: request.photo_reference,
            pin_verified,
            remote_id: None,
        };
        self.queue.enqueue_punch(&punch).await?;
        drop(guard);

        info!(punch_id = %punch.id, punch_type = %punch.punch_type, "punch captured");
        self.after_enqueue();
        Ok(punch)
    }

    /// Submit a correction for the employee's open punch.
    #[instrument(skip_all, fields(employee_id = %request.employee_id, punch_id = %request.original_punch_id))]
    pub async fn submit_correction(
        &self,
        request: CorrectionRequest,
    ) -> Result<Correction, KioskError> {
        if request.employee_id.trim().is_empty() {
            return Err(ValidationError::EmptyEmployeeId.into());
        }
        let guard = self.capture_lock.lock().await;
        let pool = self.queue.pool();
        let original = db::fetch_punch(pool, &request.original_punch_id)
            .await?
            .ok_or_else(|| ValidationError::UnknownPunch(request.original_punch_id.clone()))?;
        if original.employee_id != request.employee_id {
            return Err(ValidationError::ForeignPunch {
                punch_id: original.id,
                employee_id: request.employee_id,
            }
            .into());
        }
        let last = db::last_punch_for_employee(pool, &request.employee_id).await?;
        if last.as_ref().map(|p| p.id.as_str()) != Some(original.id.as_str()) {
            return Err(ValidationError::PunchNotOpen(original.id).into());
        }
        if db::closing_correction_for(pool, &original.id).await?.is_some() {
            return Err(ValidationError::DuplicateCorrection(original.id).into());
        }
        let clock_in = if original.punch_type == PunchType::ClockIn {
            original.clone()
        } else {
            db::shift_clock_in(pool, &original.employee_id, original.timestamp)
                .await?
                .ok_or_else(|| ValidationError::MissingShiftClockIn(original.id.clone()))?
        };

        let correction = self.corrections.build(
            &request,
            &original,
            &clock_in,
            self.now(),
            self.connectivity.is_online(),
        )?;
        self.queue.enqueue_correction(&correction).await?;
        drop(guard);

        info!(
            correction_id = %correction.id,
            offline = correction.offline_submitted,
            "correction submitted"
        );
        self.after_enqueue();
        Ok(correction)
    }

    fn after_enqueue(&self) {
        if self.submit_on_capture && self.connectivity.is_online() {
            self.engine.spawn_pass(SyncTrigger::Capture);
        }
    }

    /// Conflict state of `employee_id` as of now, without attempting a punch.
    pub async fn check_conflict(
        &self,
        employee_id: &str,
        scheduled_shift: Option<Duration>,
    ) -> Result<ConflictDetection, KioskError> {
        let (last, closing) = self.snapshot_parts(employee_id).await?;
        let snapshot = ShiftSnapshot::new(last.as_ref(), closing.as_ref());
        Ok(self
            .detector
            .check_attempt(&snapshot, None, self.now(), scheduled_shift))
    }

    pub async fn get_offline_status(&self) -> Result<OfflineStatus, KioskError> {
        Ok(OfflineStatus {
            is_online: self.connectivity.is_online(),
            pending_count: self.queue.pending_count().await?,
            failed_permanent_count: self.queue.failed_permanent_count().await?,
        })
    }

    /// Drain the queue now, ignoring backoff. If a pass is already running
    /// the returned summary is marked `skipped`.
    pub async fn force_sync(&self) -> Result<SyncSummary, KioskError> {
        match self.engine.run_pass(SyncTrigger::Manual).await? {
            Some(summary) => Ok(summary),
            None => Ok(SyncSummary {
                skipped: true,
                ..SyncSummary::default()
            }),
        }
    }

    /// Operator action: give permanently failed entries a new retry budget.
    pub async fn resync_failed(&self) -> Result<u64, KioskError> {
        Ok(self.queue.resync_failed().await?)
    }

    pub async fn failed_entries(&self) -> Result<Vec<QueueEntry>, KioskError> {
        Ok(self.queue.entries(Some(EntryState::FailedPermanent)).await?)
    }

    pub async fn correction(&self, correction_id: &str) -> Result<Option<Correction>, KioskError> {
        Ok(db::fetch_correction(self.queue.pool(), correction_id).await?)
    }
}
