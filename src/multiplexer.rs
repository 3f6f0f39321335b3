//! Sample fusion.
//!
//! One long-lived task owns every "latest reading": GPS fix, battery level, the audio feature
//! channel and the rate-limit clock. Sensor callbacks are the trigger; each one that arrives
//! after the interval has elapsed produces one record, which goes straight to the queue.

use crate::audio::{AudioFeatures, AudioInput, AudioSampler};
use crate::config::{clamp_interval_ms, SamplingConfig};
use crate::queue::QueueHandle;
use crate::record::{
    format_timestamp, sensor_field_names, Record, FIELD_ACCURACY, FIELD_ALTITUDE,
    FIELD_AMPLITUDE, FIELD_BATTERY, FIELD_BEARING, FIELD_DURATION, FIELD_FREQUENCY,
    FIELD_LOCATION, FIELD_PROVIDER, FIELD_SESSION_START, FIELD_SPEED, FIELD_START_LOCATION,
    FIELD_TIMESTAMP,
};
use crate::sources::{BatteryLevel, GpsFix, SensorEvent, SourceHandle, SourceReceivers};
use crate::stats::StatusCounters;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Local};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// GPS is asked for fixes slightly faster than records are emitted so one is usually fresh.
const GPS_INTERVAL_LEAD: Duration = Duration::from_millis(10);

pub type AudioOpener = Arc<dyn Fn() -> Result<Box<dyn AudioInput>> + Send + Sync>;

/// What the OS side should currently have registered. Published on every state change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SamplingPlan {
    pub logging: bool,
    pub sensors: bool,
    pub gps_interval: Option<Duration>,
    pub audio: bool,
    pub interval: Duration,
}

#[derive(Debug)]
enum FusionOp {
    Start,
    Stop,
    SetGps(bool),
    SetAudio(bool),
    SetInterval(Duration),
}

#[derive(Debug)]
struct FusionCommand {
    op: FusionOp,
    respond_to: oneshot::Sender<()>,
}

struct AudioState {
    sampler: AudioSampler,
    rx: watch::Receiver<AudioFeatures>,
}

struct Session {
    started_wall: DateTime<Local>,
    started_at: Instant,
}

pub struct Multiplexer {
    queue: QueueHandle,
    stats: Arc<StatusCounters>,
    interval: Duration,
    sensors_enabled: bool,
    gps_requested: bool,
    audio_requested: bool,
    session: Option<Session>,
    last_emit: Option<Instant>,
    last_wall: Option<DateTime<Local>>,
    gps: Option<GpsFix>,
    start_location: Option<String>,
    battery: Option<f64>,
    audio: Option<AudioState>,
    audio_failed: bool,
    audio_opener: Option<AudioOpener>,
    audio_frame_samples: usize,
    plan_tx: watch::Sender<SamplingPlan>,
}

impl Multiplexer {
    pub fn new(
        queue: QueueHandle,
        stats: Arc<StatusCounters>,
        sampling: &SamplingConfig,
        audio_opener: Option<AudioOpener>,
    ) -> (Self, watch::Receiver<SamplingPlan>) {
        let (plan_tx, plan_rx) = watch::channel(SamplingPlan::default());
        let mux = Self {
            queue,
            stats,
            interval: sampling.interval(),
            sensors_enabled: sampling.sensors_enabled,
            gps_requested: sampling.gps_enabled,
            audio_requested: sampling.audio_enabled,
            session: None,
            last_emit: None,
            last_wall: None,
            gps: None,
            start_location: None,
            battery: None,
            audio: None,
            audio_failed: false,
            audio_opener,
            audio_frame_samples: sampling.audio_frame_samples,
            plan_tx,
        };
        mux.publish_plan();
        (mux, plan_rx)
    }

    pub fn is_logging(&self) -> bool {
        self.session.is_some()
    }

    fn gps_active(&self) -> bool {
        self.is_logging() && self.sensors_enabled && self.gps_requested
    }

    fn plan(&self) -> SamplingPlan {
        let logging = self.is_logging();
        SamplingPlan {
            logging,
            sensors: logging && self.sensors_enabled,
            gps_interval: self
                .gps_active()
                .then(|| self.interval.saturating_sub(GPS_INTERVAL_LEAD)),
            audio: self.audio.is_some(),
            interval: self.interval,
        }
    }

    fn publish_plan(&self) {
        let plan = self.plan();
        self.plan_tx.send_if_modified(|current| {
            if *current == plan {
                false
            } else {
                *current = plan;
                true
            }
        });
    }

    pub async fn start(&mut self) {
        if self.is_logging() {
            return;
        }
        self.session = Some(Session {
            started_wall: Local::now(),
            started_at: Instant::now(),
        });
        self.last_emit = None;
        self.gps = None;
        self.start_location = None;
        self.battery = None;
        self.audio_failed = false;
        self.stats.reset_sampling();
        self.stats.set_logging(true);

        if self.audio_requested && self.sensors_enabled {
            self.start_audio();
        }
        self.publish_plan();
        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            gps = self.gps_requested,
            audio = self.audio_requested,
            "logging started"
        );
    }

    /// Returns once the audio sampler (if any) has been stopped; see [`AudioSampler::stop`].
    pub async fn stop(&mut self) {
        if !self.is_logging() {
            return;
        }
        self.stop_audio().await;
        self.session = None;
        self.gps = None;
        self.start_location = None;
        self.battery = None;
        self.stats.set_logging(false);
        self.publish_plan();
        tracing::info!("logging stopped");
    }

    pub fn set_gps(&mut self, enabled: bool) {
        self.gps_requested = enabled;
        if !enabled {
            self.gps = None;
        }
        self.publish_plan();
        tracing::info!(enabled, logging = self.is_logging(), "gps toggled");
    }

    pub async fn set_audio(&mut self, enabled: bool) {
        self.audio_requested = enabled;
        if enabled {
            self.audio_failed = false;
            if self.is_logging() && self.sensors_enabled && self.audio.is_none() {
                self.start_audio();
            }
        } else {
            self.stop_audio().await;
        }
        self.publish_plan();
        tracing::info!(enabled, logging = self.is_logging(), "audio toggled");
    }

    pub fn set_interval(&mut self, interval: Duration) {
        let ms = clamp_interval_ms(u64::try_from(interval.as_millis()).unwrap_or(u64::MAX));
        self.interval = Duration::from_millis(ms);
        self.publish_plan();
        tracing::info!(interval_ms = ms, "sampling interval changed");
    }

    pub fn on_gps(&mut self, fix: GpsFix) {
        if !self.gps_active() {
            return;
        }
        if self.start_location.is_none() {
            self.start_location = Some(fix.location());
        }
        self.gps = Some(fix);
    }

    pub fn on_battery(&mut self, level: BatteryLevel) {
        if !self.is_logging() {
            return;
        }
        if let Some(percentage) = level.percentage() {
            self.battery = Some(percentage);
        }
    }

    /// Emits and persists a record when the interval has elapsed. Returns whether one was queued.
    pub async fn on_sensor(&mut self, event: SensorEvent) -> bool {
        if !self.sensors_enabled {
            return false;
        }
        let Some(session) = &self.session else {
            return false;
        };
        if let Some(last) = self.last_emit {
            if event.at.saturating_duration_since(last) < self.interval {
                return false;
            }
        }
        self.last_emit = Some(event.at);

        let now = Local::now();
        let wall = match self.last_wall {
            Some(prev) if prev > now => prev,
            _ => now,
        };
        self.last_wall = Some(wall);

        let mut record = Record::new();
        record.insert_text(FIELD_TIMESTAMP, format_timestamp(&wall));
        record.insert_text(FIELD_SESSION_START, format_timestamp(&session.started_wall));
        record.insert_int(
            FIELD_DURATION,
            event.at.saturating_duration_since(session.started_at).as_secs() as i64,
        );

        let gps_spliced = self.splice_gps(&mut record);
        let audio_spliced = self.splice_audio(&mut record).await;
        if let Some(battery) = self.battery {
            record.insert_number(FIELD_BATTERY, battery);
        }

        let names = sensor_field_names(&event.sensor_type, event.values.len());
        for (name, value) in names.into_iter().zip(event.values) {
            if !record.insert_number(name.as_str(), value) {
                tracing::trace!(field = %name, value, "dropped non-finite sensor value");
            }
        }

        match self.queue.append(&record).await {
            Ok(id) => {
                self.stats.record_emitted(gps_spliced, audio_spliced);
                tracing::trace!(id, sensor = %event.sensor_type, "record queued");
                true
            }
            Err(err) => {
                tracing::warn!(error=%err, "failed to queue record; dropping it");
                false
            }
        }
    }

    fn splice_gps(&mut self, record: &mut Record) -> bool {
        if !self.gps_active() {
            return false;
        }
        let Some(fix) = self.gps.take() else {
            return false;
        };
        record.insert_text(FIELD_LOCATION, fix.location());
        if let Some(start) = &self.start_location {
            record.insert_text(FIELD_START_LOCATION, start.clone());
        }
        record.insert_number(FIELD_ALTITUDE, fix.altitude);
        record.insert_number(FIELD_ACCURACY, fix.accuracy);
        record.insert_number(FIELD_BEARING, fix.bearing);
        record.insert_number(FIELD_SPEED, fix.speed);
        record.insert_text(FIELD_PROVIDER, fix.provider);
        true
    }

    async fn splice_audio(&mut self, record: &mut Record) -> bool {
        let Some(state) = &mut self.audio else {
            return false;
        };
        match state.rx.has_changed() {
            Ok(true) => {
                let features = *state.rx.borrow_and_update();
                record.insert_number(FIELD_FREQUENCY, features.frequency);
                record.insert_number(FIELD_AMPLITUDE, features.amplitude);
                true
            }
            Ok(false) => false,
            Err(_) => {
                tracing::warn!("audio sampler exited; audio unavailable for this session");
                self.audio_failed = true;
                self.stop_audio().await;
                self.publish_plan();
                false
            }
        }
    }

    fn start_audio(&mut self) {
        if self.audio_failed || self.audio.is_some() {
            return;
        }
        let Some(opener) = self.audio_opener.clone() else {
            tracing::warn!("audio requested but no audio input is configured");
            self.audio_failed = true;
            return;
        };
        let (tx, rx) = watch::channel(AudioFeatures::default());
        match AudioSampler::spawn(move || opener(), self.audio_frame_samples, tx) {
            Ok(sampler) => self.audio = Some(AudioState { sampler, rx }),
            Err(err) => {
                tracing::warn!(error=%err, "failed to start audio sampler");
                self.audio_failed = true;
            }
        }
    }

    async fn stop_audio(&mut self) {
        let Some(state) = self.audio.take() else {
            return;
        };
        drop(state.rx);
        if tokio::task::spawn_blocking(move || state.sampler.stop())
            .await
            .is_err()
        {
            tracing::error!("audio shutdown task failed");
        }
    }
}

/// Control side of a running fusion task.
#[derive(Clone)]
pub struct MultiplexerHandle {
    control: mpsc::Sender<FusionCommand>,
    sources: SourceHandle,
    plan: watch::Receiver<SamplingPlan>,
}

impl MultiplexerHandle {
    pub fn sources(&self) -> SourceHandle {
        self.sources.clone()
    }

    pub fn plan(&self) -> watch::Receiver<SamplingPlan> {
        self.plan.clone()
    }

    pub async fn start(&self) -> Result<()> {
        self.request(FusionOp::Start).await
    }

    /// Completes after the audio sampler has stopped publishing.
    pub async fn stop(&self) -> Result<()> {
        self.request(FusionOp::Stop).await
    }

    pub async fn set_gps(&self, enabled: bool) -> Result<()> {
        self.request(FusionOp::SetGps(enabled)).await
    }

    pub async fn set_audio(&self, enabled: bool) -> Result<()> {
        self.request(FusionOp::SetAudio(enabled)).await
    }

    pub async fn set_interval(&self, interval: Duration) -> Result<()> {
        self.request(FusionOp::SetInterval(interval)).await
    }

    async fn request(&self, op: FusionOp) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(FusionCommand { op, respond_to: tx })
            .await
            .map_err(|_| anyhow!("fusion task stopped"))?;
        rx.await.map_err(|_| anyhow!("fusion task dropped response"))
    }
}

pub fn spawn(
    mut mux: Multiplexer,
    plan: watch::Receiver<SamplingPlan>,
    shutdown: CancellationToken,
) -> (MultiplexerHandle, JoinHandle<()>) {
    let (control_tx, mut control_rx) = mpsc::channel::<FusionCommand>(32);
    let (sources, receivers) = SourceHandle::channel();
    let SourceReceivers {
        mut sensor_rx,
        mut gps_rx,
        mut battery_rx,
    } = receivers;

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(cmd) = control_rx.recv() => {
                    match cmd.op {
                        FusionOp::Start => mux.start().await,
                        FusionOp::Stop => mux.stop().await,
                        FusionOp::SetGps(enabled) => mux.set_gps(enabled),
                        FusionOp::SetAudio(enabled) => mux.set_audio(enabled).await,
                        FusionOp::SetInterval(interval) => mux.set_interval(interval),
                    }
                    let _ = cmd.respond_to.send(());
                }
                Some(event) = sensor_rx.recv() => {
                    mux.on_sensor(event).await;
                }
                Some(fix) = gps_rx.recv() => mux.on_gps(fix),
                Some(level) = battery_rx.recv() => mux.on_battery(level),
                else => break,
            }
        }
        mux.stop().await;
        tracing::info!("fusion task stopped");
    });

    (
        MultiplexerHandle {
            control: control_tx,
            sources,
            plan,
        },
        task,
    )
}
