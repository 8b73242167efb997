mod common;

use chrono::Duration;
use common::{harness_with, remote_id_for, settings, start, RecordingRemote, Script};
use punch_kiosk::correction::CorrectionRequest;
use punch_kiosk::db;
use punch_kiosk::error::KioskError;
use punch_kiosk::kiosk::CaptureRequest;
use punch_kiosk::model::{ApprovalStatus, ConflictType, CorrectionState, EntryState, ReasonCategory};
use punch_kiosk::queue::QueueEvent;
use punch_kiosk::remote::RemoteError;
use punch_kiosk::sync::{spawn_sync_scheduler, SyncTrigger};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::broadcast::error::TryRecvError;
use tokio_util::sync::CancellationToken;

fn transient() -> RemoteError {
    RemoteError::Transient("connection reset".into())
}

async fn wait_for_calls(remote: &RecordingRemote, n: usize) {
    for _ in 0..400 {
        if remote.calls().await.len() >= n {
            return;
        }
        tokio::time::sleep(StdDuration::from_millis(5)).await;
    }
    panic!("remote never saw {n} calls");
}

#[tokio::test]
async fn entries_sync_in_capture_order_once_online() {
    let h = harness_with(RecordingRemote::default(), settings()).await;
    let mut ids = Vec::new();
    for employee in ["e-1", "e-2", "e-3"] {
        ids.push(h.kiosk.capture_punch(CaptureRequest::new(employee)).await.unwrap().id);
        h.clock.advance(Duration::minutes(1));
    }

    // offline: nothing leaves the device
    let summary = h.kiosk.force_sync().await.unwrap();
    assert_eq!(summary.synced_count, 0);
    assert!(h.remote.calls().await.is_empty());

    h.connectivity.set_online(true);
    let summary = h.kiosk.force_sync().await.unwrap();
    assert_eq!(summary.synced_count, 3);
    assert!(summary.errors.is_empty());
    let sent: Vec<String> = h.remote.calls().await.into_iter().map(|c| c.entry_id).collect();
    assert_eq!(sent, ids);

    let status = h.kiosk.get_offline_status().await.unwrap();
    assert!(status.is_online);
    assert_eq!(status.pending_count, 0);
    let stored = db::fetch_punch(&h.pool, &ids[0]).await.unwrap().unwrap();
    assert_eq!(stored.remote_id, Some(remote_id_for(&ids[0])));
}

#[tokio::test]
async fn lost_acknowledgement_does_not_duplicate_the_punch() {
    let remote = RecordingRemote::with_scripts(vec![Script::RecordThenFail(RemoteError::Timeout(
        StdDuration::from_secs(15),
    ))]);
    let h = harness_with(remote, settings()).await;
    h.connectivity.set_online(true);
    let punch = h.kiosk.capture_punch(CaptureRequest::new("e-1")).await.unwrap();

    let first = h.kiosk.force_sync().await.unwrap();
    assert_eq!(first.synced_count, 0);
    assert_eq!(first.errors.len(), 1);
    assert_eq!(first.errors[0].retry_count, 1);
    assert!(!first.errors[0].permanent);

    let second = h.kiosk.force_sync().await.unwrap();
    assert_eq!(second.synced_count, 1);

    let calls = h.remote.calls().await;
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|c| c.entry_id == punch.id));
    assert_eq!(h.remote.records_for(&punch.id).await, 1);
}

#[tokio::test]
async fn three_failures_park_the_entry() {
    let remote = RecordingRemote::with_scripts(vec![
        Script::Fail(transient()),
        Script::Fail(transient()),
        Script::Fail(RemoteError::Rejected {
            status: 422,
            body: "unknown employee".into(),
        }),
    ]);
    let h = harness_with(remote, settings()).await;
    h.connectivity.set_online(true);
    let punch = h.kiosk.capture_punch(CaptureRequest::new("e-1")).await.unwrap();
    let mut events = h.kiosk.subscribe();

    for expected in 1..=3u8 {
        let summary = h.kiosk.force_sync().await.unwrap();
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].retry_count, expected);
        assert_eq!(summary.errors[0].permanent, expected == 3);
    }

    let status = h.kiosk.get_offline_status().await.unwrap();
    assert_eq!(status.pending_count, 0);
    assert_eq!(status.failed_permanent_count, 1);

    let parked = h.kiosk.failed_entries().await.unwrap();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].entry_id, punch.id);
    assert_eq!(parked[0].retry_count, 3);
    assert_eq!(parked[0].state, EntryState::FailedPermanent);
    assert!(parked[0].last_error.as_deref().unwrap().contains("422"));

    let mut saw_permanent = false;
    loop {
        match events.try_recv() {
            Ok(QueueEvent::FailedPermanent { entry_id, retry_count, .. }) => {
                assert_eq!(entry_id, punch.id);
                assert_eq!(retry_count, 3);
                saw_permanent = true;
            }
            Ok(_) => {}
            Err(TryRecvError::Empty) => break,
            Err(err) => panic!("event channel: {err}"),
        }
    }
    assert!(saw_permanent);

    // excluded from automatic passes
    let summary = h.kiosk.force_sync().await.unwrap();
    assert_eq!(summary.synced_count, 0);
    assert!(summary.errors.is_empty());
    assert_eq!(h.remote.calls().await.len(), 3);

    // until an operator resyncs it
    assert_eq!(h.kiosk.resync_failed().await.unwrap(), 1);
    let summary = h.kiosk.force_sync().await.unwrap();
    assert_eq!(summary.synced_count, 1);
    assert_eq!(h.kiosk.get_offline_status().await.unwrap().failed_permanent_count, 0);
}

#[tokio::test]
async fn each_entry_is_tried_once_per_pass() {
    let mut s = settings();
    s.sync.batch_size = 1;
    let remote = RecordingRemote::with_scripts(vec![Script::Fail(transient())]);
    let h = harness_with(remote, s).await;
    h.connectivity.set_online(true);
    for employee in ["e-1", "e-2", "e-3"] {
        h.kiosk.capture_punch(CaptureRequest::new(employee)).await.unwrap();
    }

    let summary = h.kiosk.force_sync().await.unwrap();
    assert_eq!(summary.synced_count, 2);
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(h.remote.calls().await.len(), 3);
    assert_eq!(h.kiosk.get_offline_status().await.unwrap().pending_count, 1);
}

#[tokio::test]
async fn timer_passes_wait_out_backoff() {
    let remote = RecordingRemote::with_scripts(vec![Script::Fail(transient())]);
    let h = harness_with(remote, settings()).await;
    h.connectivity.set_online(true);
    h.kiosk.capture_punch(CaptureRequest::new("e-1")).await.unwrap();
    let engine = h.kiosk.engine();

    let first = engine.run_pass(SyncTrigger::Timer).await.unwrap().unwrap();
    assert_eq!(first.errors.len(), 1);

    let early = engine.run_pass(SyncTrigger::Timer).await.unwrap().unwrap();
    assert_eq!(early.synced_count + early.errors.len() as u32, 0);
    assert_eq!(h.remote.calls().await.len(), 1);

    h.clock.advance(Duration::seconds(6));
    let later = engine.run_pass(SyncTrigger::Timer).await.unwrap().unwrap();
    assert_eq!(later.synced_count, 1);
}

#[tokio::test]
async fn photo_is_uploaded_once_across_retries() {
    let remote = RecordingRemote::with_scripts(vec![Script::Fail(transient())]);
    let h = harness_with(remote, settings()).await;
    h.connectivity.set_online(true);
    let punch = h
        .kiosk
        .capture_punch(CaptureRequest::new("e-1").photo("photos/e-1.jpg"))
        .await
        .unwrap();

    assert_eq!(h.kiosk.force_sync().await.unwrap().errors.len(), 1);
    let entry = h.kiosk.queue().entry(&punch.id).await.unwrap().unwrap();
    assert_eq!(entry.uploaded_photo, Some(format!("photo-{}", punch.id)));

    assert_eq!(h.kiosk.force_sync().await.unwrap().synced_count, 1);
    assert_eq!(h.remote.uploads().await, vec![punch.id.clone()]);
    let calls = h.remote.calls().await;
    assert_eq!(calls.len(), 2);
    for call in calls {
        assert_eq!(call.photo_id, Some(format!("photo-{}", punch.id)));
    }
}

#[tokio::test]
async fn failed_photo_upload_counts_as_an_attempt() {
    let h = harness_with(RecordingRemote::default(), settings()).await;
    h.connectivity.set_online(true);
    h.remote
        .push_photo_failure(RemoteError::Media("photos/e-1.jpg: not found".into()))
        .await;
    h.kiosk
        .capture_punch(CaptureRequest::new("e-1").photo("photos/e-1.jpg"))
        .await
        .unwrap();

    let summary = h.kiosk.force_sync().await.unwrap();
    assert_eq!(summary.errors.len(), 1);
    assert!(summary.errors[0].message.contains("not found"));
    assert!(h.remote.calls().await.is_empty());
}

#[tokio::test]
async fn slow_submission_times_out_as_transient() {
    let mut s = settings();
    s.sync.request_timeout = StdDuration::from_millis(50);
    let remote = RecordingRemote::with_scripts(vec![Script::Delay(StdDuration::from_secs(5))]);
    let h = harness_with(remote, s).await;
    h.connectivity.set_online(true);
    h.kiosk.capture_punch(CaptureRequest::new("e-1")).await.unwrap();

    let summary = h.kiosk.force_sync().await.unwrap();
    assert_eq!(summary.errors.len(), 1);
    assert!(summary.errors[0].message.contains("timed out"));
    assert!(!summary.errors[0].permanent);
    assert_eq!(h.kiosk.get_offline_status().await.unwrap().pending_count, 1);
}

#[tokio::test]
async fn stale_entries_are_purged_and_announced() {
    let h = harness_with(RecordingRemote::default(), settings()).await;
    let punch = h.kiosk.capture_punch(CaptureRequest::new("e-1")).await.unwrap();
    let mut events = h.kiosk.subscribe();

    h.clock.advance(Duration::hours(72));
    let summary = h.kiosk.force_sync().await.unwrap();
    assert_eq!(summary.purged_count, 0);

    h.clock.advance(Duration::hours(1));
    let summary = h.kiosk.force_sync().await.unwrap();
    assert_eq!(summary.purged_count, 1);
    assert_eq!(h.kiosk.get_offline_status().await.unwrap().pending_count, 0);

    match events.try_recv().unwrap() {
        QueueEvent::Purged(purged) => {
            assert_eq!(purged.entry_id, punch.id);
            assert_eq!(purged.state, "pending");
            assert_eq!(purged.retry_count, 0);
        }
        other => panic!("unexpected event {other:?}"),
    }
    // the local ledger keeps the punch
    assert!(db::fetch_punch(&h.pool, &punch.id).await.unwrap().is_some());
}

#[tokio::test]
async fn permanently_failed_entries_also_expire() {
    let remote = RecordingRemote::with_scripts(vec![
        Script::Fail(transient()),
        Script::Fail(transient()),
        Script::Fail(transient()),
    ]);
    let h = harness_with(remote, settings()).await;
    h.connectivity.set_online(true);
    h.kiosk.capture_punch(CaptureRequest::new("e-1")).await.unwrap();
    for _ in 0..3 {
        h.kiosk.force_sync().await.unwrap();
    }
    assert_eq!(h.kiosk.get_offline_status().await.unwrap().failed_permanent_count, 1);

    h.clock.advance(Duration::hours(73));
    let summary = h.kiosk.force_sync().await.unwrap();
    assert_eq!(summary.purged_count, 1);
    assert_eq!(h.kiosk.get_offline_status().await.unwrap().failed_permanent_count, 0);
}

#[tokio::test]
async fn second_trigger_during_a_pass_is_a_no_op() {
    let remote = RecordingRemote::with_scripts(vec![Script::Delay(StdDuration::from_millis(300))]);
    let h = harness_with(remote, settings()).await;
    h.connectivity.set_online(true);
    h.kiosk.capture_punch(CaptureRequest::new("e-1")).await.unwrap();

    let engine = Arc::clone(h.kiosk.engine());
    let running = tokio::spawn(async move { engine.run_pass(SyncTrigger::Timer).await });
    wait_for_calls(&h.remote, 1).await;
    assert!(h.kiosk.engine().is_running());

    let skipped = h.kiosk.force_sync().await.unwrap();
    assert!(skipped.skipped);
    assert_eq!(skipped.synced_count, 0);
    assert!(h
        .kiosk
        .engine()
        .run_pass(SyncTrigger::Reconnect)
        .await
        .unwrap()
        .is_none());

    let summary = running.await.unwrap().unwrap().unwrap();
    assert_eq!(summary.synced_count, 1);
    assert_eq!(h.remote.calls().await.len(), 1);
    assert!(!h.kiosk.engine().is_running());
}

#[tokio::test]
async fn going_offline_abandons_the_pass_without_spending_retries() {
    let remote = RecordingRemote::with_scripts(vec![Script::Delay(StdDuration::from_secs(30))]);
    let h = harness_with(remote, settings()).await;
    let first = h.kiosk.capture_punch(CaptureRequest::new("e-1")).await.unwrap();
    h.kiosk.capture_punch(CaptureRequest::new("e-2")).await.unwrap();
    h.connectivity.set_online(true);

    let engine = Arc::clone(h.kiosk.engine());
    let running = tokio::spawn(async move { engine.run_pass(SyncTrigger::Manual).await });
    wait_for_calls(&h.remote, 1).await;
    h.connectivity.set_online(false);

    let summary = running.await.unwrap().unwrap().unwrap();
    assert_eq!(summary.abandoned_count, 2);
    assert_eq!(summary.synced_count, 0);
    assert!(summary.errors.is_empty());

    let entries = h.kiosk.queue().entries(None).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries
        .iter()
        .all(|e| e.state == EntryState::Pending && e.retry_count == 0));
    assert_eq!(h.remote.records_for(&first.id).await, 0);

    h.connectivity.set_online(true);
    assert_eq!(h.kiosk.force_sync().await.unwrap().synced_count, 2);
}

#[tokio::test]
async fn approval_decisions_flow_back_to_the_device() {
    let h = harness_with(RecordingRemote::default(), settings()).await;
    let clock_in = h.kiosk.capture_punch(CaptureRequest::new("e-1")).await.unwrap();
    h.clock.advance(Duration::hours(20));
    let filed = h
        .kiosk
        .submit_correction(CorrectionRequest {
            employee_id: "e-1".into(),
            original_punch_id: clock_in.id.clone(),
            corrected_timestamp: start() + Duration::hours(8),
            reason: "kiosk screen froze".into(),
            reason_category: Some(ReasonCategory::KioskDown),
        })
        .await
        .unwrap();
    assert!(filed.offline_submitted);

    h.connectivity.set_online(true);
    let summary = h.kiosk.force_sync().await.unwrap();
    assert_eq!(summary.synced_count, 2);
    assert_eq!(summary.approvals_resolved, 0);
    let acked = h.kiosk.correction(&filed.id).await.unwrap().unwrap();
    assert_eq!(acked.state, CorrectionState::PendingApproval);
    assert_eq!(acked.approval_status(), ApprovalStatus::Pending);
    assert_eq!(acked.remote_id, Some(remote_id_for(&filed.id)));
    let calls = h.remote.calls().await;
    assert_eq!(calls[1].entry_id, filed.id);
    assert_eq!(calls[1].original_remote_id, Some(remote_id_for(&clock_in.id)));

    h.remote.decide(&filed.id, ApprovalStatus::Approved, "manager-3").await;
    let summary = h.kiosk.force_sync().await.unwrap();
    assert_eq!(summary.approvals_resolved, 1);
    let approved = h.kiosk.correction(&filed.id).await.unwrap().unwrap();
    assert_eq!(approved.state, CorrectionState::Approved);
    assert_eq!(approved.approved_by.as_deref(), Some("manager-3"));
    assert_eq!(approved.approved_at, Some(start() + Duration::days(2)));

    assert_eq!(h.kiosk.force_sync().await.unwrap().approvals_resolved, 0);
}

#[tokio::test]
async fn rejected_correction_reopens_the_conflict() {
    let h = harness_with(RecordingRemote::default(), settings()).await;
    let clock_in = h.kiosk.capture_punch(CaptureRequest::new("e-1")).await.unwrap();
    h.clock.advance(Duration::hours(20));
    let filed = h
        .kiosk
        .submit_correction(CorrectionRequest {
            employee_id: "e-1".into(),
            original_punch_id: clock_in.id.clone(),
            corrected_timestamp: start() + Duration::hours(9),
            reason: "emergency call".into(),
            reason_category: Some(ReasonCategory::Emergency),
        })
        .await
        .unwrap();
    h.connectivity.set_online(true);
    h.kiosk.force_sync().await.unwrap();

    h.remote.decide(&filed.id, ApprovalStatus::Rejected, "manager-3").await;
    assert_eq!(h.kiosk.force_sync().await.unwrap().approvals_resolved, 1);

    let detection = h.kiosk.check_conflict("e-1", None).await.unwrap();
    assert_eq!(detection.conflict_type, ConflictType::MissingClockout);
}

#[tokio::test]
async fn scheduler_syncs_on_reconnect() {
    let h = harness_with(RecordingRemote::default(), settings()).await;
    h.kiosk.capture_punch(CaptureRequest::new("e-1")).await.unwrap();

    let cancel = CancellationToken::new();
    let scheduler = spawn_sync_scheduler(
        Arc::clone(h.kiosk.engine()),
        StdDuration::from_secs(3600),
        cancel.clone(),
    );
    // let the scheduler subscribe while still offline
    tokio::time::sleep(StdDuration::from_millis(20)).await;
    h.connectivity.set_online(true);
    wait_for_calls(&h.remote, 1).await;

    cancel.cancel();
    scheduler.await.unwrap();
    assert_eq!(h.kiosk.get_offline_status().await.unwrap().pending_count, 0);
    assert_eq!(h.remote.calls().await.len(), 1);
}

#[tokio::test]
async fn local_write_failure_mid_pass_hands_entries_back() {
    let h = harness_with(RecordingRemote::default(), settings()).await;
    for employee in ["e-1", "e-2", "e-3"] {
        h.kiosk.capture_punch(CaptureRequest::new(employee)).await.unwrap();
        h.clock.advance(Duration::minutes(1));
    }
    h.connectivity.set_online(true);
    sqlx::query(
        "CREATE TRIGGER refuse_remote_id BEFORE UPDATE ON punches \
         BEGIN SELECT RAISE(ABORT, 'disk full'); END",
    )
    .execute(&h.pool)
    .await
    .unwrap();

    let err = h.kiosk.force_sync().await.unwrap_err();
    assert!(matches!(err, KioskError::Storage(_)), "{err}");
    assert!(!h.kiosk.engine().is_running());
    let entries = h.kiosk.queue().entries(None).await.unwrap();
    assert_eq!(entries.len(), 3);
    assert!(entries
        .iter()
        .all(|e| e.state == EntryState::Pending && e.retry_count == 0));

    sqlx::query("DROP TRIGGER refuse_remote_id")
        .execute(&h.pool)
        .await
        .unwrap();
    let summary = h.kiosk.force_sync().await.unwrap();
    assert_eq!(summary.synced_count, 3);
    for entry in &entries {
        assert_eq!(h.remote.records_for(&entry.entry_id).await, 1);
    }
}

#[tokio::test]
async fn correction_waits_until_its_punch_is_acknowledged() {
    let remote = RecordingRemote::with_scripts(vec![Script::Fail(transient())]);
    let h = harness_with(remote, settings()).await;
    let clock_in = h.kiosk.capture_punch(CaptureRequest::new("e-1")).await.unwrap();
    h.clock.advance(Duration::hours(20));
    let filed = h
        .kiosk
        .submit_correction(CorrectionRequest {
            employee_id: "e-1".into(),
            original_punch_id: clock_in.id.clone(),
            corrected_timestamp: start() + Duration::hours(8),
            reason: "badge reader offline".into(),
            reason_category: Some(ReasonCategory::KioskDown),
        })
        .await
        .unwrap();
    h.connectivity.set_online(true);

    let first = h.kiosk.force_sync().await.unwrap();
    assert_eq!(first.errors.len(), 1);
    assert_eq!(first.deferred_count, 1);
    let calls = h.remote.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].entry_id, clock_in.id);
    let waiting = h.kiosk.queue().entry(&filed.id).await.unwrap().unwrap();
    assert_eq!(waiting.state, EntryState::Pending);
    assert_eq!(waiting.retry_count, 0);

    let second = h.kiosk.force_sync().await.unwrap();
    assert_eq!(second.synced_count, 2);
    assert_eq!(second.deferred_count, 0);
    let calls = h.remote.calls().await;
    assert_eq!(calls[2].entry_id, filed.id);
    assert_eq!(calls[2].original_remote_id, Some(remote_id_for(&clock_in.id)));
}
