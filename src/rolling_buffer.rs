//! Rolling Buffer Store
//!
//! Bounded per-patient cache of the most recent readings for live display.
//! Independent of trial state: nothing here is ever read by finalization,
//! and evicting or expiring an entry never touches a trial log.
//!
//! Ordering: `query` returns readings in chronological (insertion) order,
//! oldest first, limited to the newest `limit` entries.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use crate::types::{PatientId, Reading};

/// A reading held by the rolling buffer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollingBufferEntry {
    pub patient_id: PatientId,
    pub reading: Reading,
    pub inserted_at: DateTime<Utc>,
}

type Partition = Arc<Mutex<VecDeque<RollingBufferEntry>>>;

/// Per-patient FIFO buffers with capacity eviction and age expiry.
///
/// The partition map is only write-locked to add or drop a patient; appends
/// lock a single patient's deque.
pub struct RollingBufferStore {
    capacity: usize,
    partitions: RwLock<HashMap<PatientId, Partition>>,
}

/// Occupancy snapshot for health reporting.
#[derive(Debug, Clone, Copy, Serialize, Default)]
pub struct BufferStats {
    pub patients: usize,
    pub entries: usize,
}

impl RollingBufferStore {
    /// Create a store holding at most `capacity` readings per patient.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            partitions: RwLock::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn partition(&self, patient_id: PatientId) -> Option<Partition> {
        if let Ok(map) = self.partitions.read() {
            if let Some(p) = map.get(&patient_id) {
                return Some(Arc::clone(p));
            }
        }
        let mut map = self.partitions.write().ok()?;
        Some(Arc::clone(map.entry(patient_id).or_default()))
    }

    /// Append a reading, evicting the oldest entries beyond capacity.
    ///
    /// Best effort: invalid patient ids and poisoned locks are ignored.
    pub fn append(&self, patient_id: PatientId, reading: Reading) {
        self.append_at(patient_id, reading, Utc::now());
    }

    /// `append` with an explicit insertion time.
    pub fn append_at(&self, patient_id: PatientId, reading: Reading, inserted_at: DateTime<Utc>) {
        if patient_id <= 0 {
            tracing::debug!(patient_id, "Ignoring rolling buffer append for invalid patient id");
            return;
        }
        let Some(partition) = self.partition(patient_id) else {
            return;
        };
        let Ok(mut deque) = partition.lock() else {
            tracing::warn!(patient_id, "Rolling buffer partition poisoned, dropping reading");
            return;
        };

        deque.push_back(RollingBufferEntry {
            patient_id,
            reading,
            inserted_at,
        });
        while deque.len() > self.capacity {
            deque.pop_front();
        }
    }

    /// The newest `limit` readings for a patient, oldest first.
    pub fn query(&self, patient_id: PatientId, limit: usize) -> Vec<Reading> {
        let partition = match self.partitions.read() {
            Ok(map) => map.get(&patient_id).cloned(),
            Err(_) => None,
        };
        let Some(partition) = partition else {
            return Vec::new();
        };
        let Ok(deque) = partition.lock() else {
            return Vec::new();
        };

        let skip = deque.len().saturating_sub(limit);
        deque.iter().skip(skip).map(|e| e.reading.clone()).collect()
    }

    /// Remove entries inserted more than `max_age` ago.
    pub fn sweep_expired(&self, max_age: std::time::Duration) -> usize {
        self.sweep_expired_at(Utc::now(), max_age)
    }

    /// `sweep_expired` evaluated against an explicit clock.
    pub fn sweep_expired_at(&self, now: DateTime<Utc>, max_age: std::time::Duration) -> usize {
        let max_age = Duration::from_std(max_age).unwrap_or(Duration::MAX);
        let cutoff = now.checked_sub_signed(max_age).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let Ok(mut map) = self.partitions.write() else {
            return 0;
        };

        let mut removed = 0;
        map.retain(|_, partition| {
            let Ok(mut deque) = partition.lock() else {
                return true;
            };
            // Insertion order is time order, so expired entries sit at the front.
            while deque.front().is_some_and(|e| e.inserted_at < cutoff) {
                deque.pop_front();
                removed += 1;
            }
            !deque.is_empty()
        });

        removed
    }

    pub fn stats(&self) -> BufferStats {
        let Ok(map) = self.partitions.read() else {
            return BufferStats::default();
        };
        BufferStats {
            patients: map.len(),
            entries: map
                .values()
                .map(|p| p.lock().map_or(0, |d| d.len()))
                .sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SensorValue;
    use std::collections::BTreeMap;

    fn reading(patient_id: PatientId, hr: f64, at: DateTime<Utc>) -> Reading {
        let mut values = BTreeMap::new();
        values.insert("heart_rate".to_string(), SensorValue::Number(hr));
        Reading::new(patient_id, "dev1", values).with_device_timestamp(at)
    }

    #[test]
    fn test_capacity_keeps_most_recent() {
        let store = RollingBufferStore::new(60);
        let t0 = Utc::now();
        for i in 0..100 {
            store.append(1, reading(1, f64::from(i), t0 + Duration::seconds(i64::from(i))));
        }

        let recent = store.query(1, 1000);
        assert_eq!(recent.len(), 60);
        assert_eq!(recent.first().unwrap().values["heart_rate"], SensorValue::Number(40.0));
        assert_eq!(recent.last().unwrap().values["heart_rate"], SensorValue::Number(99.0));
        assert!(recent.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn test_query_limit_returns_newest() {
        let store = RollingBufferStore::new(10);
        let t0 = Utc::now();
        for i in 0..5 {
            store.append(1, reading(1, f64::from(i), t0));
        }
        let recent = store.query(1, 2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].values["heart_rate"], SensorValue::Number(4.0));
        assert!(store.query(2, 10).is_empty());
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let store = RollingBufferStore::new(60);
        let now = Utc::now();
        store.append_at(1, reading(1, 1.0, now), now - Duration::hours(2));
        store.append_at(1, reading(1, 2.0, now), now - Duration::minutes(10));
        store.append_at(2, reading(2, 3.0, now), now - Duration::hours(3));

        let removed = store.sweep_expired_at(now, std::time::Duration::from_secs(3600));
        assert_eq!(removed, 2);
        assert_eq!(store.query(1, 10).len(), 1);
        assert!(store.query(2, 10).is_empty());
        assert_eq!(store.stats().patients, 1);
    }

    #[test]
    fn test_invalid_patient_is_noop() {
        let store = RollingBufferStore::new(5);
        store.append(0, reading(0, 1.0, Utc::now()));
        store.append(-3, reading(-3, 1.0, Utc::now()));
        assert_eq!(store.stats().entries, 0);
    }
}
