//! Context object owning the queue, counters, fusion task and upload supervisor. This is the
//! control surface the UI/OS collaborator drives.

use crate::audio::{AudioInput, PcmStreamInput};
use crate::config::{Config, SamplingConfig};
use crate::multiplexer::{self, AudioOpener, Multiplexer, MultiplexerHandle, SamplingPlan};
use crate::queue::QueueHandle;
use crate::sources::SourceHandle;
use crate::stats::{StatusCounters, StatusSnapshot};
use crate::supervisor::{self, SupervisorHandle};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const IN_MEMORY_QUEUE: &str = ":memory:";

/// Opens the configured PCM stream on demand, if a device path is set.
pub fn pcm_audio_opener(sampling: &SamplingConfig) -> Option<AudioOpener> {
    let path = sampling.audio_device.clone()?;
    let rate = sampling.audio_sample_rate;
    Some(Arc::new(move || {
        let input = PcmStreamInput::open(&path, rate)?;
        Ok(Box::new(input) as Box<dyn AudioInput>)
    }))
}

pub struct Service {
    stats: Arc<StatusCounters>,
    queue: QueueHandle,
    fusion: MultiplexerHandle,
    supervisor: SupervisorHandle,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Service {
    /// Must be called inside a Tokio runtime.
    pub fn new(config: &Config, audio_opener: Option<AudioOpener>) -> Result<Self> {
        let stats = Arc::new(StatusCounters::new());
        let queue = if config.queue_path == Path::new(IN_MEMORY_QUEUE) {
            QueueHandle::open_in_memory(stats.clone())
        } else {
            QueueHandle::open(&config.queue_path, config.queue_max_entries, stats.clone())
        }
        .context("failed to open durable queue")?;

        let shutdown = CancellationToken::new();
        let (mux, plan) =
            Multiplexer::new(queue.clone(), stats.clone(), &config.sampling, audio_opener);
        let (fusion, fusion_task) = multiplexer::spawn(mux, plan, shutdown.child_token());
        let (supervisor, supervisor_task) = supervisor::spawn(
            queue.clone(),
            stats.clone(),
            config.elastic.clone(),
            config.upload.clone(),
            shutdown.child_token(),
        );

        Ok(Self {
            stats,
            queue,
            fusion,
            supervisor,
            shutdown,
            tasks: Mutex::new(vec![fusion_task, supervisor_task]),
        })
    }

    pub fn sources(&self) -> SourceHandle {
        self.fusion.sources()
    }

    pub fn plan(&self) -> watch::Receiver<SamplingPlan> {
        self.fusion.plan()
    }

    pub fn queue(&self) -> &QueueHandle {
        &self.queue
    }

    pub async fn start_logging(&self) -> Result<()> {
        self.fusion.start().await
    }

    /// Returns after sources are unregistered and the audio input is released. A running
    /// upload session is abandoned; queued entries stay for the next one.
    pub async fn stop_logging(&self) -> Result<()> {
        self.fusion.stop().await?;
        self.supervisor.cancel_session();
        Ok(())
    }

    pub async fn set_gps(&self, enabled: bool) -> Result<()> {
        self.fusion.set_gps(enabled).await
    }

    pub async fn set_audio(&self, enabled: bool) -> Result<()> {
        self.fusion.set_audio(enabled).await
    }

    pub async fn set_interval(&self, interval: Duration) -> Result<()> {
        self.fusion.set_interval(interval).await
    }

    pub fn trigger_upload(&self) {
        self.supervisor.trigger();
    }

    pub fn status(&self) -> StatusSnapshot {
        self.stats.snapshot()
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks = match self.tasks.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            if let Err(err) = task.await {
                tracing::warn!(error=%err, "background task failed during shutdown");
            }
        }
        tracing::info!("service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::sources::SensorEvent;
    use crate::uploader::tests::{spawn_fake_index, FakeIndex};

    async fn wait_for(mut cond: impl FnMut(StatusSnapshot) -> bool, service: &Service) {
        for _ in 0..400 {
            if cond(service.status()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("status never reached expected state: {:?}", service.status());
    }

    #[tokio::test]
    async fn readings_flow_from_sources_to_the_index() {
        let fake = Arc::new(FakeIndex::default());
        let port = spawn_fake_index(fake).await;
        let mut config = test_config();
        config.elastic.port = port;
        config.upload.stagnation_secs = 1;
        let service = Service::new(&config, None).unwrap();

        service.set_interval(Duration::from_millis(50)).await.unwrap();
        service.start_logging().await.unwrap();
        assert!(service.status().logging);
        assert!(service.plan().borrow().sensors);

        let sources = service.sources();
        for _ in 0..3 {
            sources.sensor(SensorEvent::now("android.sensor.light", vec![120.0]));
            tokio::time::sleep(Duration::from_millis(60)).await;
        }
        wait_for(|s| s.sensor_readings == 3, &service).await;

        service.trigger_upload();
        wait_for(|s| s.documents_indexed == 3 && s.queue_depth == 0, &service).await;

        service.stop_logging().await.unwrap();
        assert!(!service.status().logging);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn audio_without_device_is_ignored() {
        let mut config = test_config();
        config.sampling.audio_enabled = true;
        assert!(pcm_audio_opener(&config.sampling).is_none());

        let service = Service::new(&config, None).unwrap();
        service.start_logging().await.unwrap();
        assert!(!service.plan().borrow().audio);
        service.shutdown().await;
    }
}
