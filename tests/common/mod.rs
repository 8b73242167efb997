#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use punch_kiosk::clock::ManualClock;
use punch_kiosk::connectivity::Connectivity;
use punch_kiosk::credential::{hash_pin, Pbkdf2PinVerifier};
use punch_kiosk::db::{self, Pool};
use punch_kiosk::kiosk::{Kiosk, KioskSettings};
use punch_kiosk::model::{ApprovalStatus, Correction, Punch};
use punch_kiosk::remote::{Ack, ApprovalDecision, RemoteAuthority, RemoteError};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub const PIN: &str = "4821";

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 6, 8, 0, 0).unwrap()
}

pub fn remote_id_for(entry_id: &str) -> String {
    format!("r-{}", entry_id)
}

/// Scripted outcome of one submission.
#[derive(Debug, Clone)]
pub enum Script {
    Fail(RemoteError),
    /// The remote records the entry but the acknowledgement is lost.
    RecordThenFail(RemoteError),
    Delay(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub entry_id: String,
    pub kind: &'static str,
    pub photo_id: Option<String>,
    /// Server id a correction named its punch by.
    pub original_remote_id: Option<String>,
}

/// In-memory payroll backend that honours idempotency keys.
#[derive(Clone, Default)]
pub struct RecordingRemote {
    scripts: Arc<Mutex<VecDeque<Script>>>,
    photo_scripts: Arc<Mutex<VecDeque<RemoteError>>>,
    calls: Arc<Mutex<Vec<Submission>>>,
    recorded: Arc<Mutex<HashMap<String, u32>>>,
    uploads: Arc<Mutex<Vec<String>>>,
    decisions: Arc<Mutex<HashMap<String, ApprovalDecision>>>,
}

impl RecordingRemote {
    pub fn with_scripts(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(VecDeque::from(scripts))),
            ..Default::default()
        }
    }

    pub async fn push_script(&self, script: Script) {
        self.scripts.lock().await.push_back(script);
    }

    pub async fn push_photo_failure(&self, err: RemoteError) {
        self.photo_scripts.lock().await.push_back(err);
    }

    pub async fn calls(&self) -> Vec<Submission> {
        self.calls.lock().await.clone()
    }

    /// How many distinct records the remote holds for `entry_id`.
    pub async fn records_for(&self, entry_id: &str) -> u32 {
        self.recorded.lock().await.get(entry_id).copied().unwrap_or(0)
    }

    pub async fn uploads(&self) -> Vec<String> {
        self.uploads.lock().await.clone()
    }

    pub async fn decide(&self, correction_entry_id: &str, status: ApprovalStatus, by: &str) {
        self.decisions.lock().await.insert(
            remote_id_for(correction_entry_id),
            ApprovalDecision {
                status,
                decided_at: Some(start() + chrono::Duration::days(2)),
                decided_by: Some(by.to_string()),
            },
        );
    }

    async fn accept(
        &self,
        entry_id: &str,
        kind: &'static str,
        photo_id: Option<&str>,
        original_remote_id: Option<&str>,
    ) -> Result<Ack, RemoteError> {
        self.calls.lock().await.push(Submission {
            entry_id: entry_id.to_string(),
            kind,
            photo_id: photo_id.map(str::to_string),
            original_remote_id: original_remote_id.map(str::to_string),
        });
        let script = self.scripts.lock().await.pop_front();
        match script {
            Some(Script::Fail(err)) => return Err(err),
            Some(Script::RecordThenFail(err)) => {
                self.record(entry_id).await;
                return Err(err);
            }
            Some(Script::Delay(delay)) => tokio::time::sleep(delay).await,
            None => {}
        }
        let duplicate = self.record(entry_id).await;
        Ok(Ack {
            remote_id: remote_id_for(entry_id),
            duplicate,
        })
    }

    /// Returns true when the key had been seen before.
    async fn record(&self, entry_id: &str) -> bool {
        let mut recorded = self.recorded.lock().await;
        let seen = recorded.contains_key(entry_id);
        recorded.entry(entry_id.to_string()).or_insert(1);
        seen
    }
}

#[async_trait]
impl RemoteAuthority for RecordingRemote {
    async fn upload_photo(
        &self,
        entry_id: &str,
        _photo_reference: &str,
    ) -> Result<String, RemoteError> {
        if let Some(err) = self.photo_scripts.lock().await.pop_front() {
            return Err(err);
        }
        self.uploads.lock().await.push(entry_id.to_string());
        Ok(format!("photo-{}", entry_id))
    }

    async fn submit_punch(
        &self,
        entry_id: &str,
        _punch: &Punch,
        photo_id: Option<&str>,
    ) -> Result<Ack, RemoteError> {
        self.accept(entry_id, "punch", photo_id, None).await
    }

    async fn submit_correction(
        &self,
        entry_id: &str,
        _correction: &Correction,
        original_remote_id: Option<&str>,
    ) -> Result<Ack, RemoteError> {
        self.accept(entry_id, "correction", None, original_remote_id).await
    }

    async fn get_approval_status(
        &self,
        correction_id: &str,
    ) -> Result<ApprovalDecision, RemoteError> {
        let decision = self.decisions.lock().await.get(correction_id).cloned();
        Ok(decision.unwrap_or(ApprovalDecision {
            status: ApprovalStatus::Pending,
            decided_at: None,
            decided_by: None,
        }))
    }
}

pub struct Harness {
    pub kiosk: Kiosk,
    pub remote: RecordingRemote,
    pub clock: Arc<ManualClock>,
    pub connectivity: Connectivity,
    pub pool: Pool,
}

pub fn settings() -> KioskSettings {
    KioskSettings {
        company_id: "acme".into(),
        device_id: Some("kiosk-test".into()),
        submit_on_capture: false,
        ..KioskSettings::default()
    }
}

pub fn verifier() -> Pbkdf2PinVerifier {
    let mut verifier = Pbkdf2PinVerifier::new();
    verifier.enroll("e-1".into(), hash_pin(PIN, 1000).unwrap());
    verifier
}

pub async fn memory_pool() -> Pool {
    let pool = db::init_pool("sqlite::memory:").await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

pub async fn open_with(
    pool: Pool,
    remote: RecordingRemote,
    clock: Arc<ManualClock>,
    online: bool,
    settings: KioskSettings,
) -> Harness {
    let connectivity = Connectivity::new(online);
    let kiosk = Kiosk::open(
        pool.clone(),
        Arc::new(remote.clone()),
        clock.clone(),
        Arc::new(verifier()),
        connectivity.clone(),
        settings,
    )
    .await
    .unwrap();
    Harness {
        kiosk,
        remote,
        clock,
        connectivity,
        pool,
    }
}

/// Offline kiosk over an in-memory store, clock at [`start`].
pub async fn harness() -> Harness {
    harness_with(RecordingRemote::default(), settings()).await
}

pub async fn harness_with(remote: RecordingRemote, settings: KioskSettings) -> Harness {
    let clock = Arc::new(ManualClock::new(start()));
    open_with(memory_pool().await, remote, clock, false, settings).await
}
