//! Trial Lifecycle Integration Tests
//!
//! Exercise the full ingest -> accumulate -> finalize path through
//! `TelemetryService`, against the in-memory store, a store that fails on
//! demand, and a sled store reopened across a simulated restart.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use vitalstream::storage::{InMemoryTrialStore, SledTrialStore, StoreError, TrialStore};
use vitalstream::types::{
    AckStatus, PatientId, Reading, SensorValue, StoredTrialRecord, Trial, TrialId, TrialLogEntry,
    TrialStatus,
};
use vitalstream::{ServiceConfig, TelemetryService, TrialError};

// ============================================================================
// Helpers
// ============================================================================

fn service() -> TelemetryService {
    service_with_store(Arc::new(InMemoryTrialStore::new()))
}

fn service_with_store(store: Arc<dyn TrialStore>) -> TelemetryService {
    TelemetryService::new(ServiceConfig::default(), store).unwrap()
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
}

fn reading_at(
    patient_id: PatientId,
    values: &[(&str, SensorValue)],
    at: DateTime<Utc>,
) -> Reading {
    let values: BTreeMap<String, SensorValue> = values
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect();
    Reading::new(patient_id, "dev1", values).with_device_timestamp(at)
}

fn heart_rate(patient_id: PatientId, hr: f64, at: DateTime<Utc>) -> Reading {
    reading_at(patient_id, &[("heart_rate", SensorValue::from(hr))], at)
}

/// In-memory store whose record writes can be made to fail.
struct FlakyStore {
    inner: InMemoryTrialStore,
    fail_records: AtomicBool,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: InMemoryTrialStore::new(),
            fail_records: AtomicBool::new(false),
        }
    }
}

impl TrialStore for FlakyStore {
    fn next_trial_id(&self) -> Result<TrialId, StoreError> {
        self.inner.next_trial_id()
    }
    fn put_trial(&self, trial: &Trial) -> Result<(), StoreError> {
        self.inner.put_trial(trial)
    }
    fn get_trial(&self, trial_id: TrialId) -> Result<Option<Trial>, StoreError> {
        self.inner.get_trial(trial_id)
    }
    fn list_trials(&self, patient_id: PatientId) -> Result<Vec<Trial>, StoreError> {
        self.inner.list_trials(patient_id)
    }
    fn open_trials(&self) -> Result<Vec<Trial>, StoreError> {
        self.inner.open_trials()
    }
    fn append_log(&self, entry: &TrialLogEntry) -> Result<(), StoreError> {
        self.inner.append_log(entry)
    }
    fn read_log(&self, trial_id: TrialId) -> Result<Vec<TrialLogEntry>, StoreError> {
        self.inner.read_log(trial_id)
    }
    fn purge_log(&self, trial_id: TrialId) -> Result<usize, StoreError> {
        self.inner.purge_log(trial_id)
    }
    fn put_record(&self, record: &StoredTrialRecord) -> Result<(), StoreError> {
        if self.fail_records.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("record storage offline".to_string()));
        }
        self.inner.put_record(record)
    }
    fn get_record(&self, trial_id: TrialId) -> Result<Option<StoredTrialRecord>, StoreError> {
        self.inner.get_record(trial_id)
    }
    fn flush(&self) -> Result<(), StoreError> {
        self.inner.flush()
    }
    fn backend_name(&self) -> &'static str {
        "Flaky"
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn scenario_a_three_readings_finalize_into_one_record() {
    let svc = service();
    let start = svc.trials().start_trial(42, Some("dev1".to_string())).await.unwrap();
    assert_eq!(start.trial_id, 1);
    assert!(!start.already_active);

    let times = [t0(), t0() + Duration::seconds(1), t0() + Duration::seconds(2)];
    for (hr, at) in [70.0, 72.0, 75.0].into_iter().zip(times) {
        let ack = svc.gateway().ingest(heart_rate(42, hr, at)).unwrap();
        assert_eq!(ack.status, AckStatus::Ok);
        assert_eq!(ack.trial_id, Some(1));
    }

    let end = svc.trials().end_trial(42).await.unwrap();
    assert_eq!(end.trial_id, 1);
    assert_eq!(end.readings, 3);
    assert_eq!(end.record_ref, "trial_records/1");

    let record = end.record;
    assert_eq!(record.timestamps, times.to_vec());
    assert_eq!(
        record.parameters["heart_rate"],
        vec![Some(70.0), Some(72.0), Some(75.0)]
    );
    let stats = record.summary_stats["heart_rate"];
    assert_eq!(stats.min, 70.0);
    assert_eq!(stats.max, 75.0);
    assert!((stats.avg - 72.333).abs() < 0.01);

    let trial = svc.store().get_trial(1).unwrap().unwrap();
    assert_eq!(trial.status, TrialStatus::Closed);
    assert!(trial.end_time.is_some());
    assert!(svc.store().read_log(1).unwrap().is_empty(), "log purged after finalize");
    assert!(svc.store().get_record(1).unwrap().is_some());
}

#[tokio::test]
async fn scenario_b_heterogeneous_keys_align_with_nulls() {
    let svc = service();
    svc.trials().start_trial(5, None).await.unwrap();

    svc.gateway()
        .ingest(heart_rate(5, 70.0, t0()))
        .unwrap();
    svc.gateway()
        .ingest(reading_at(
            5,
            &[("temperature", SensorValue::from(37.0))],
            t0() + Duration::seconds(1),
        ))
        .unwrap();

    let record = svc.trials().end_trial(5).await.unwrap().record;
    assert_eq!(record.parameters["heart_rate"], vec![Some(70.0), None]);
    assert_eq!(record.parameters["temperature"], vec![None, Some(37.0)]);
    assert_eq!(record.summary_stats["heart_rate"].count, 1);
}

#[tokio::test]
async fn scenario_c_repeated_start_returns_same_trial() {
    let svc = service();
    let first = svc.trials().start_trial(7, Some("d".to_string())).await.unwrap();
    let second = svc.trials().start_trial(7, Some("d".to_string())).await.unwrap();

    assert_eq!(first.trial_id, second.trial_id);
    assert!(second.already_active);

    let trials = svc.store().list_trials(7).unwrap();
    assert_eq!(trials.len(), 1);
    assert_eq!(trials[0].status, TrialStatus::Active);
}

// ============================================================================
// Properties
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_starts_agree_on_one_trial() {
    let svc = Arc::new(service());

    let mut handles = Vec::new();
    for _ in 0..16 {
        let svc = Arc::clone(&svc);
        handles.push(tokio::spawn(async move {
            svc.trials().start_trial(11, None).await.unwrap().trial_id
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1, "all concurrent starts return the same trial");

    let active: Vec<_> = svc
        .store()
        .list_trials(11)
        .unwrap()
        .into_iter()
        .filter(|t| t.status == TrialStatus::Active)
        .collect();
    assert_eq!(active.len(), 1);
}

#[tokio::test]
async fn failed_finalize_keeps_log_for_retry() {
    let store = Arc::new(FlakyStore::new());
    let svc = service_with_store(store.clone());

    let trial_id = svc.trials().start_trial(9, None).await.unwrap().trial_id;
    for i in 0..5 {
        svc.gateway()
            .ingest(heart_rate(9, 60.0 + f64::from(i), t0() + Duration::seconds(i64::from(i))))
            .unwrap();
    }
    let before = store.read_log(trial_id).unwrap();
    assert_eq!(before.len(), 5);

    store.fail_records.store(true, Ordering::SeqCst);
    let err = svc.trials().end_trial(9).await.unwrap_err();
    assert!(matches!(err, TrialError::PersistenceFailure { .. }));

    // Reverted: still active and the log is untouched.
    assert_eq!(svc.trials().active_trial(9), Some(trial_id));
    assert_eq!(store.read_log(trial_id).unwrap(), before);
    assert_eq!(
        store.get_trial(trial_id).unwrap().unwrap().status,
        TrialStatus::Active
    );

    store.fail_records.store(false, Ordering::SeqCst);
    let end = svc.trials().end_trial(9).await.unwrap();
    assert_eq!(end.readings, 5);
    assert_eq!(
        end.record.parameters["heart_rate"],
        vec![Some(60.0), Some(61.0), Some(62.0), Some(63.0), Some(64.0)]
    );
}

#[tokio::test]
async fn buffer_keeps_only_most_recent_readings() {
    let svc = service();
    let capacity = svc.config().rolling_buffer.capacity;

    for i in 0..(capacity + 25) {
        let offset = i64::try_from(i).unwrap();
        svc.gateway()
            .ingest(heart_rate(3, offset as f64, t0() + Duration::seconds(offset)))
            .unwrap();
    }

    let live = svc.buffer().query(3, usize::MAX);
    assert_eq!(live.len(), capacity);
    assert_eq!(
        live.first().unwrap().timestamp,
        t0() + Duration::seconds(25)
    );
    assert!(live.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
}

#[tokio::test]
async fn ending_trial_leaves_buffer_untouched_and_sweep_leaves_log() {
    let svc = service();
    let trial_id = svc.trials().start_trial(4, None).await.unwrap().trial_id;
    for i in 0..3 {
        svc.gateway()
            .ingest(heart_rate(4, 80.0, t0() + Duration::seconds(i)))
            .unwrap();
    }

    // Buffer eviction does not touch the trial log.
    let removed = svc
        .buffer()
        .sweep_expired_at(Utc::now() + Duration::seconds(1), std::time::Duration::ZERO);
    assert_eq!(removed, 3);
    assert_eq!(svc.store().read_log(trial_id).unwrap().len(), 3);

    svc.gateway()
        .ingest(heart_rate(4, 81.0, t0() + Duration::seconds(10)))
        .unwrap();
    let live_before = svc.buffer().query(4, usize::MAX);

    svc.trials().end_trial(4).await.unwrap();
    assert_eq!(svc.buffer().query(4, usize::MAX), live_before);
}

#[tokio::test]
async fn empty_trial_stays_active() {
    let svc = service();
    let trial_id = svc.trials().start_trial(8, Some("d".to_string())).await.unwrap().trial_id;

    let err = svc.trials().end_trial(8).await.unwrap_err();
    assert!(matches!(err, TrialError::EmptyTrial { trial_id: id } if id == trial_id));

    assert_eq!(svc.trials().active_trial(8), Some(trial_id));
    let row = svc.store().get_trial(trial_id).unwrap().unwrap();
    assert_eq!(row.status, TrialStatus::Active);
    assert!(row.end_time.is_none());
}

#[tokio::test]
async fn readings_after_end_are_buffer_only() {
    let svc = service();
    svc.trials().start_trial(6, None).await.unwrap();
    svc.gateway().ingest(heart_rate(6, 70.0, t0())).unwrap();
    svc.trials().end_trial(6).await.unwrap();

    let ack = svc
        .gateway()
        .ingest(heart_rate(6, 71.0, t0() + Duration::seconds(1)))
        .unwrap();
    assert_eq!(ack.status, AckStatus::Ok);
    assert_eq!(ack.trial_id, None);
    assert_eq!(svc.buffer().query(6, usize::MAX).len(), 2);

    // The next trial starts with a fresh log.
    let next = svc.trials().start_trial(6, None).await.unwrap();
    assert_eq!(next.trial_id, 2);
    assert!(svc.store().read_log(next.trial_id).unwrap().is_empty());
}

#[tokio::test]
async fn sequence_numbers_are_contiguous_per_trial() {
    let svc = service();
    let trial_id = svc.trials().start_trial(12, None).await.unwrap().trial_id;
    for i in 0..10 {
        svc.gateway()
            .on_reading(12, "dev1", &format!(r#"{{"sensor_data":{{"spo2":{}}}}}"#, 90 + i))
            .unwrap();
    }

    let seqs: Vec<u64> = svc
        .store()
        .read_log(trial_id)
        .unwrap()
        .iter()
        .map(|e| e.sequence_no)
        .collect();
    assert_eq!(seqs, (1..=10).collect::<Vec<_>>());
}

#[tokio::test]
async fn duplicate_device_timestamps_logged_once() {
    let svc = service();
    let trial_id = svc.trials().start_trial(13, None).await.unwrap().trial_id;

    let frame = r#"{"sensor_data":{"heart_rate":70},"timestamp":"2024-03-01T10:00:00Z"}"#;
    for _ in 0..3 {
        let ack = svc.gateway().on_reading(13, "dev1", frame).unwrap();
        assert_eq!(ack.trial_id, Some(trial_id));
    }

    assert_eq!(svc.store().read_log(trial_id).unwrap().len(), 1);
    assert_eq!(svc.buffer().query(13, usize::MAX).len(), 3);
}

// ============================================================================
// Restart Recovery
// ============================================================================

#[tokio::test]
async fn active_trial_survives_restart() {
    let temp_dir = tempfile::tempdir().unwrap();

    let trial_id = {
        let store = SledTrialStore::open(temp_dir.path(), true).unwrap();
        let svc = service_with_store(Arc::new(store));
        let trial_id = svc.trials().start_trial(21, Some("dev1".to_string())).await.unwrap().trial_id;
        svc.gateway().ingest(heart_rate(21, 70.0, t0())).unwrap();
        svc.gateway()
            .ingest(heart_rate(21, 72.0, t0() + Duration::seconds(1)))
            .unwrap();
        svc.shutdown().await.unwrap();
        trial_id
    };

    let store = SledTrialStore::open(temp_dir.path(), true).unwrap();
    let svc = service_with_store(Arc::new(store));
    assert_eq!(svc.recovery().resumed, 1);
    assert_eq!(svc.trials().active_trial(21), Some(trial_id));

    svc.gateway()
        .ingest(heart_rate(21, 74.0, t0() + Duration::seconds(2)))
        .unwrap();
    let seqs: Vec<u64> = svc
        .store()
        .read_log(trial_id)
        .unwrap()
        .iter()
        .map(|e| e.sequence_no)
        .collect();
    assert_eq!(seqs, vec![1, 2, 3]);

    let end = svc.trials().end_trial(21).await.unwrap();
    assert_eq!(end.readings, 3);

    // Trial ids keep counting after the restart.
    let next = svc.trials().start_trial(21, None).await.unwrap();
    assert!(next.trial_id > trial_id);
}

#[tokio::test]
async fn extreme_readings_produce_a_readable_record() {
    let temp_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SledTrialStore::open(temp_dir.path(), true).unwrap());
    let svc = service_with_store(store.clone());

    let trial_id = svc.trials().start_trial(22, None).await.unwrap().trial_id;
    svc.gateway()
        .on_reading(22, "dev1", r#"{"sensor_data":{"x":1.7e308}}"#)
        .unwrap();
    svc.gateway()
        .on_reading(22, "dev1", r#"{"sensor_data":{"x":-1.7e308}}"#)
        .unwrap();

    let end = svc.trials().end_trial(22).await.unwrap();
    assert!(end.record.summary_stats["x"].avg.is_finite());

    let stored = store.get_record(trial_id).unwrap().unwrap();
    assert_eq!(stored.record, end.record);
    assert_eq!(stored.record.summary_stats["x"].avg, 0.0);
}

#[tokio::test]
async fn stored_record_completes_close_on_recovery() {
    let store = Arc::new(InMemoryTrialStore::new());

    // Crash after the record write but before the trial row was closed.
    let trial = Trial::start(store.next_trial_id().unwrap(), 30, None)
        .with_status(TrialStatus::Finalizing);
    store.put_trial(&trial).unwrap();
    let entry = TrialLogEntry {
        trial_id: trial.trial_id,
        sequence_no: 1,
        reading: heart_rate(30, 65.0, t0()),
    };
    store.append_log(&entry).unwrap();
    let record = vitalstream::trials::build_record(&trial, &[entry], Utc::now());
    store
        .put_record(&StoredTrialRecord {
            metadata: vitalstream::trials::render_metadata(&record, Utc::now()),
            record,
        })
        .unwrap();

    let svc = service_with_store(store.clone());
    assert_eq!(svc.recovery().completed, 1);
    assert_eq!(svc.trials().active_trial(30), None);
    assert_eq!(
        store.get_trial(trial.trial_id).unwrap().unwrap().status,
        TrialStatus::Closed
    );
    assert!(store.read_log(trial.trial_id).unwrap().is_empty());
}
