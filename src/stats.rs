use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Process-wide counters shared by every component. Created once by the service and injected.
#[derive(Debug, Default)]
pub struct StatusCounters {
    pub sensor_readings: AtomicU64,
    pub gps_readings: AtomicU64,
    pub audio_readings: AtomicU64,
    pub documents_indexed: AtomicU64,
    pub upload_errors: AtomicU64,
    pub queue_depth: AtomicU64,
    pub dropped_entries: AtomicU64,
    pub logging: AtomicBool,
    pub uploading: AtomicBool,
}

/// Read-only view handed to the UI collaborator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub sensor_readings: u64,
    pub gps_readings: u64,
    pub audio_readings: u64,
    pub documents_indexed: u64,
    pub upload_errors: u64,
    pub queue_depth: u64,
    pub dropped_entries: u64,
    pub logging: bool,
    pub uploading: bool,
}

impl StatusCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// One emitted record; GPS/audio only get credit when their data was spliced in.
    pub fn record_emitted(&self, gps: bool, audio: bool) {
        self.sensor_readings.fetch_add(1, Ordering::Relaxed);
        if gps {
            self.gps_readings.fetch_add(1, Ordering::Relaxed);
        }
        if audio {
            self.audio_readings.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_indexed(&self, documents: u64) {
        self.documents_indexed.fetch_add(documents, Ordering::Relaxed);
    }

    pub fn record_upload_error(&self) {
        self.upload_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, entries: u64) {
        self.dropped_entries.fetch_add(entries, Ordering::Relaxed);
    }

    pub fn set_queue_depth(&self, depth: u64) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }

    pub fn set_logging(&self, logging: bool) {
        self.logging.store(logging, Ordering::Relaxed);
    }

    pub fn set_uploading(&self, uploading: bool) {
        self.uploading.store(uploading, Ordering::Relaxed);
    }

    /// Called at logging-session start.
    pub fn reset_sampling(&self) {
        self.sensor_readings.store(0, Ordering::Relaxed);
        self.gps_readings.store(0, Ordering::Relaxed);
        self.audio_readings.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            sensor_readings: self.sensor_readings.load(Ordering::Relaxed),
            gps_readings: self.gps_readings.load(Ordering::Relaxed),
            audio_readings: self.audio_readings.load(Ordering::Relaxed),
            documents_indexed: self.documents_indexed.load(Ordering::Relaxed),
            upload_errors: self.upload_errors.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            dropped_entries: self.dropped_entries.load(Ordering::Relaxed),
            logging: self.logging.load(Ordering::Relaxed),
            uploading: self.uploading.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn concurrent_increments_are_not_lost() {
        let stats = Arc::new(StatusCounters::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.record_emitted(i % 2 == 0, i % 4 == 0);
                        stats.record_upload_error();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snap = stats.snapshot();
        assert_eq!(snap.sensor_readings, 8000);
        assert_eq!(snap.gps_readings, 4000);
        assert_eq!(snap.audio_readings, 2000);
        assert_eq!(snap.upload_errors, 8000);
    }

    #[test]
    fn reset_sampling_keeps_upload_counters() {
        let stats = StatusCounters::new();
        stats.record_emitted(true, true);
        stats.record_indexed(42);
        stats.set_queue_depth(7);
        stats.reset_sampling();

        let snap = stats.snapshot();
        assert_eq!(snap.sensor_readings, 0);
        assert_eq!(snap.gps_readings, 0);
        assert_eq!(snap.documents_indexed, 42);
        assert_eq!(snap.queue_depth, 7);
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let stats = StatusCounters::new();
        stats.record_indexed(3);
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["documentsIndexed"], 3);
        assert_eq!(json["queueDepth"], 0);
    }
}
