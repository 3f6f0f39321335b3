//! Readings delivered by the OS-facing side, and the channel ingress they travel through.

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;

const SOURCE_CHANNEL_CAPACITY: usize = 1024;

/// One hardware sensor callback. `at` is when the callback fired, which drives rate limiting.
#[derive(Debug, Clone)]
pub struct SensorEvent {
    pub sensor_type: String,
    pub values: Vec<f64>,
    pub at: Instant,
}

impl SensorEvent {
    pub fn now(sensor_type: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            sensor_type: sensor_type.into(),
            values,
            at: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub altitude: f64,
    #[serde(default)]
    pub accuracy: f64,
    #[serde(default)]
    pub bearing: f64,
    #[serde(default)]
    pub speed: f64,
    #[serde(default = "default_provider")]
    pub provider: String,
}

fn default_provider() -> String {
    "gps".to_string()
}

impl GpsFix {
    pub fn location(&self) -> String {
        format!("{},{}", self.latitude, self.longitude)
    }
}

/// Raw battery broadcast: `level` out of `scale`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct BatteryLevel {
    pub level: i64,
    pub scale: i64,
}

impl BatteryLevel {
    pub fn percentage(&self) -> Option<f64> {
        if self.level > 0 && self.scale > 0 {
            Some(self.level as f64 / self.scale as f64 * 100.0)
        } else {
            None
        }
    }
}

pub(crate) struct SourceReceivers {
    pub sensor_rx: mpsc::Receiver<SensorEvent>,
    pub gps_rx: mpsc::Receiver<GpsFix>,
    pub battery_rx: mpsc::Receiver<BatteryLevel>,
}

/// Cloneable ingress handed to OS callbacks. Sends never block: when the fusion task falls
/// behind, the reading is dropped, since only the latest reading per source matters.
#[derive(Clone)]
pub struct SourceHandle {
    sensor_tx: mpsc::Sender<SensorEvent>,
    gps_tx: mpsc::Sender<GpsFix>,
    battery_tx: mpsc::Sender<BatteryLevel>,
}

impl SourceHandle {
    pub(crate) fn channel() -> (Self, SourceReceivers) {
        let (sensor_tx, sensor_rx) = mpsc::channel(SOURCE_CHANNEL_CAPACITY);
        let (gps_tx, gps_rx) = mpsc::channel(SOURCE_CHANNEL_CAPACITY);
        let (battery_tx, battery_rx) = mpsc::channel(SOURCE_CHANNEL_CAPACITY);
        (
            Self {
                sensor_tx,
                gps_tx,
                battery_tx,
            },
            SourceReceivers {
                sensor_rx,
                gps_rx,
                battery_rx,
            },
        )
    }

    pub fn sensor(&self, event: SensorEvent) -> bool {
        deliver(&self.sensor_tx, event, "sensor")
    }

    pub fn gps(&self, fix: GpsFix) -> bool {
        deliver(&self.gps_tx, fix, "gps")
    }

    pub fn battery(&self, level: BatteryLevel) -> bool {
        deliver(&self.battery_tx, level, "battery")
    }
}

fn deliver<T>(tx: &mpsc::Sender<T>, value: T, source: &'static str) -> bool {
    match tx.try_send(value) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            tracing::debug!(source, "fusion task behind; dropping reading");
            false
        }
        Err(TrySendError::Closed(_)) => {
            tracing::debug!(source, "fusion task stopped; dropping reading");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn battery_percentage_needs_positive_level_and_scale() {
        assert_eq!(BatteryLevel { level: 50, scale: 200 }.percentage(), Some(25.0));
        assert_eq!(BatteryLevel { level: 0, scale: 100 }.percentage(), None);
        assert_eq!(BatteryLevel { level: 40, scale: -1 }.percentage(), None);
    }

    #[test]
    fn gps_fix_defaults_provider_and_formats_location() {
        let fix: GpsFix =
            serde_json::from_str(r#"{"latitude":45.5,"longitude":-73.25}"#).unwrap();
        assert_eq!(fix.provider, "gps");
        assert_eq!(fix.location(), "45.5,-73.25");
    }

    #[tokio::test]
    async fn closed_fusion_task_drops_readings() {
        let (handle, receivers) = SourceHandle::channel();
        assert!(handle.battery(BatteryLevel { level: 1, scale: 1 }));
        drop(receivers);
        assert!(!handle.sensor(SensorEvent::now("light", vec![1.0])));
    }
}
