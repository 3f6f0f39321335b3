//! Re-arms upload sessions on a timer, backing off while the remote keeps failing.

use crate::config::{ElasticConfig, UploadConfig};
use crate::queue::QueueHandle;
use crate::stats::StatusCounters;
use crate::uploader::{SessionOutcome, UploadSession};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const FIRST_RUN_DELAY: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct SupervisorHandle {
    trigger: Arc<Notify>,
    current: Arc<Mutex<Option<CancellationToken>>>,
}

impl SupervisorHandle {
    /// Starts a session now, ignoring any backoff in progress.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Cancels the running session, if any. The supervisor keeps its schedule.
    pub fn cancel_session(&self) {
        if let Ok(guard) = self.current.lock() {
            if let Some(token) = guard.as_ref() {
                token.cancel();
            }
        }
    }
}

/// Doubles `interval` per consecutive failed session, capped at `max`.
pub fn backoff_delay(interval: Duration, failed_sessions: u32, max: Duration) -> Duration {
    if failed_sessions == 0 {
        return interval;
    }
    let factor = 1u32 << failed_sessions.saturating_sub(1).min(16);
    interval.saturating_mul(factor).min(max.max(interval))
}

pub fn spawn(
    queue: QueueHandle,
    stats: Arc<StatusCounters>,
    elastic: ElasticConfig,
    upload: UploadConfig,
    shutdown: CancellationToken,
) -> (SupervisorHandle, JoinHandle<()>) {
    let handle = SupervisorHandle {
        trigger: Arc::new(Notify::new()),
        current: Arc::new(Mutex::new(None)),
    };
    let trigger = handle.trigger.clone();
    let current = handle.current.clone();

    let task = tokio::spawn(async move {
        let interval = upload.supervisor_interval();
        let max_backoff = upload.supervisor_max_backoff();
        let mut delay = FIRST_RUN_DELAY;
        let mut failed_sessions: u32 = 0;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
                _ = trigger.notified() => {
                    tracing::info!("upload triggered");
                    failed_sessions = 0;
                }
            }

            let backlog = match queue.count().await {
                Ok(count) => count,
                Err(err) => {
                    tracing::warn!(error=%err, "failed to read queue depth");
                    0
                }
            };
            if backlog == 0 {
                delay = interval;
                continue;
            }

            let session = match UploadSession::new(
                queue.clone(),
                stats.clone(),
                elastic.clone(),
                upload.clone(),
            ) {
                Ok(session) => session,
                Err(err) => {
                    tracing::error!(error=%err, "failed to build upload client");
                    failed_sessions = failed_sessions.saturating_add(1);
                    delay = backoff_delay(interval, failed_sessions, max_backoff);
                    continue;
                }
            };

            let cancel = shutdown.child_token();
            if let Ok(mut guard) = current.lock() {
                *guard = Some(cancel.clone());
            }
            tracing::info!(backlog, "upload session starting");
            let outcome = session.run(cancel).await;
            if let Ok(mut guard) = current.lock() {
                *guard = None;
            }

            if shutdown.is_cancelled() {
                break;
            }
            if outcome.is_failure() {
                failed_sessions = failed_sessions.saturating_add(1);
            } else if outcome != SessionOutcome::Cancelled {
                failed_sessions = 0;
            }
            delay = backoff_delay(interval, failed_sessions, max_backoff);
            if failed_sessions > 0 {
                tracing::info!(
                    failed_sessions,
                    retry_in_secs = delay.as_secs(),
                    "upload session failed; backing off"
                );
            }
        }
        tracing::info!("upload supervisor stopped");
    });

    (handle, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::uploader::tests::{spawn_fake_index, FakeIndex};
    use std::sync::atomic::Ordering;

    #[test]
    fn backoff_doubles_and_caps() {
        let interval = Duration::from_secs(30);
        let max = Duration::from_secs(300);
        assert_eq!(backoff_delay(interval, 0, max), interval);
        assert_eq!(backoff_delay(interval, 1, max), interval);
        assert_eq!(backoff_delay(interval, 2, max), Duration::from_secs(60));
        assert_eq!(backoff_delay(interval, 3, max), Duration::from_secs(120));
        assert_eq!(backoff_delay(interval, 5, max), max);
        assert_eq!(backoff_delay(interval, u32::MAX, max), max);
    }

    async fn wait_until_empty(queue: &QueueHandle) {
        for _ in 0..300 {
            if queue.count().await.unwrap() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("queue never drained");
    }

    #[tokio::test]
    async fn trigger_bypasses_the_schedule() {
        let fake = Arc::new(FakeIndex::default());
        let port = spawn_fake_index(fake.clone()).await;
        let stats = Arc::new(StatusCounters::new());
        let queue = QueueHandle::open_in_memory(stats.clone()).unwrap();
        let mut config = test_config();
        config.elastic.port = port;
        config.upload.stagnation_secs = 1;
        config.upload.supervisor_interval_secs = 3600;

        let shutdown = CancellationToken::new();
        let (handle, task) = spawn(
            queue.clone(),
            stats.clone(),
            config.elastic,
            config.upload,
            shutdown.clone(),
        );

        // First scheduled run finds nothing and parks for an hour.
        tokio::time::sleep(FIRST_RUN_DELAY + Duration::from_millis(200)).await;
        assert_eq!(fake.bulk_posts.load(Ordering::SeqCst), 0);

        for i in 0..20 {
            queue.append_raw(format!("{{\"n\":{i}}}")).await.unwrap();
        }
        handle.trigger();
        wait_until_empty(&queue).await;
        assert_eq!(stats.snapshot().documents_indexed, 20);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_cancels_a_running_session() {
        let fake = Arc::new(FakeIndex::default());
        fake.fail_bulk.store(true, Ordering::SeqCst);
        let port = spawn_fake_index(fake.clone()).await;
        let stats = Arc::new(StatusCounters::new());
        let queue = QueueHandle::open_in_memory(stats.clone()).unwrap();
        queue.append_raw("{}".to_string()).await.unwrap();
        let mut config = test_config();
        config.elastic.port = port;
        config.upload.max_consecutive_failures = u32::MAX;
        config.upload.stagnation_secs = 3600;

        let shutdown = CancellationToken::new();
        let (_handle, task) = spawn(
            queue.clone(),
            stats.clone(),
            config.elastic,
            config.upload,
            shutdown.clone(),
        );
        tokio::time::sleep(FIRST_RUN_DELAY + Duration::from_millis(200)).await;
        assert!(stats.snapshot().uploading);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(!stats.snapshot().uploading);
        assert_eq!(queue.count().await.unwrap(), 1);
    }
}
