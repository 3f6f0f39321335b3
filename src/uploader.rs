//! One upload session: health check, one mapping call, then batch drains until the queue stays
//! empty, the remote keeps failing, or the session is cancelled.

use crate::config::{ElasticConfig, UploadConfig};
use crate::error::UploadError;
use crate::health::check_host;
use crate::indexer::{build_bulk_body, build_client, post_bulk, put_mapping, ElasticTarget};
use crate::queue::{Drained, QueueHandle};
use crate::stats::StatusCounters;
use chrono::Local;
use reqwest::Client;
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Health check failed; nothing was attempted.
    HostUnreachable,
    /// Host, port or index cannot form a valid URL.
    Misconfigured,
    /// Queue stayed below the backlog threshold for the whole stagnation window.
    Idle,
    TooManyFailures,
    /// Backlog was present but no batch succeeded within the stagnation window.
    Stagnated,
    Cancelled,
}

impl SessionOutcome {
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            SessionOutcome::HostUnreachable
                | SessionOutcome::Misconfigured
                | SessionOutcome::TooManyFailures
                | SessionOutcome::Stagnated
        )
    }
}

enum BatchResult {
    Delivered,
    Failed(UploadError),
    Cancelled,
}

pub struct UploadSession {
    queue: QueueHandle,
    stats: Arc<StatusCounters>,
    elastic: ElasticConfig,
    upload: UploadConfig,
    client: Client,
    mapping_created: bool,
    consecutive_failures: u32,
    last_success: Instant,
}

impl UploadSession {
    pub fn new(
        queue: QueueHandle,
        stats: Arc<StatusCounters>,
        elastic: ElasticConfig,
        upload: UploadConfig,
    ) -> Result<Self, UploadError> {
        let client = build_client(upload.request_timeout())?;
        Ok(Self {
            queue,
            stats,
            elastic,
            upload,
            client,
            mapping_created: false,
            consecutive_failures: 0,
            last_success: Instant::now(),
        })
    }

    pub async fn run(mut self, cancel: CancellationToken) -> SessionOutcome {
        self.stats.set_uploading(true);
        let outcome = self.run_inner(&cancel).await;
        self.stats.set_uploading(false);
        tracing::info!(?outcome, failures = self.consecutive_failures, "upload session ended");
        outcome
    }

    async fn run_inner(&mut self, cancel: &CancellationToken) -> SessionOutcome {
        let target = match ElasticTarget::resolve(&self.elastic, Local::now().date_naive()) {
            Ok(target) => target,
            Err(err) => {
                tracing::error!(error=%err, "invalid index target");
                return SessionOutcome::Misconfigured;
            }
        };

        let health = tokio::select! {
            _ = cancel.cancelled() => return SessionOutcome::Cancelled,
            res = check_host(&self.client, &target) => res,
        };
        if let Err(err) = health {
            tracing::warn!(error=%err, url = %target.base_url(), "index host unreachable");
            return SessionOutcome::HostUnreachable;
        }

        if !self.mapping_created {
            let res = tokio::select! {
                _ = cancel.cancelled() => return SessionOutcome::Cancelled,
                res = put_mapping(&self.client, &target) => res,
            };
            match res {
                Ok(outcome) => tracing::info!(index = target.index(), ?outcome, "index mapping ready"),
                Err(err) => {
                    tracing::warn!(error=%err, index = target.index(), "mapping request failed; uploading anyway")
                }
            }
            self.mapping_created = true;
        }

        self.last_success = Instant::now();
        let stagnation = self.upload.stagnation_window();
        let mut ticker = tokio::time::interval(self.upload.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return SessionOutcome::Cancelled,
                _ = ticker.tick() => {}
            }

            let backlog = match self.queue.count().await {
                Ok(count) => count,
                Err(err) => {
                    tracing::warn!(error=%err, "failed to read queue depth");
                    0
                }
            };

            if backlog >= self.upload.min_backlog.max(1) {
                match self.upload_batch(&target, cancel).await {
                    BatchResult::Delivered => {}
                    BatchResult::Cancelled => return SessionOutcome::Cancelled,
                    BatchResult::Failed(err) => {
                        self.stats.record_upload_error();
                        self.consecutive_failures += 1;
                        tracing::warn!(
                            error=%err,
                            failures = self.consecutive_failures,
                            "bulk upload failed; entries kept for retry"
                        );
                        if !err.is_retryable() {
                            return SessionOutcome::Misconfigured;
                        }
                        if self.consecutive_failures >= self.upload.max_consecutive_failures {
                            return SessionOutcome::TooManyFailures;
                        }
                    }
                }
            }

            if self.last_success.elapsed() >= stagnation {
                return if self.consecutive_failures > 0 {
                    SessionOutcome::Stagnated
                } else {
                    SessionOutcome::Idle
                };
            }
        }
    }

    async fn upload_batch(
        &mut self,
        target: &ElasticTarget,
        cancel: &CancellationToken,
    ) -> BatchResult {
        let batch: Drained = match self.queue.drain_oldest(self.upload.batch_size).await {
            Ok(batch) if batch.is_empty() => return BatchResult::Delivered,
            Ok(batch) => batch,
            Err(err) => {
                tracing::warn!(error=%err, "failed to drain queue");
                return BatchResult::Delivered;
            }
        };

        let body = build_bulk_body(
            target.index(),
            target.doc_type(),
            batch.entries.iter().map(|entry| entry.payload.as_str()),
        );
        let res = tokio::select! {
            _ = cancel.cancelled() => return BatchResult::Cancelled,
            res = post_bulk(&self.client, target, body) => res,
        };
        let summary = match res {
            Ok(summary) => summary,
            Err(err) => return BatchResult::Failed(err),
        };

        if summary.errors {
            tracing::warn!(
                rejected = summary.rejected_items,
                batch = batch.len(),
                "index rejected some documents; batch treated as delivered"
            );
        }
        if let Err(err) = self.queue.delete_range(batch.first_id, batch.count).await {
            tracing::error!(error=%err, first_id = batch.first_id, "failed to delete uploaded range");
        }
        self.consecutive_failures = 0;
        self.last_success = Instant::now();
        self.stats.record_indexed(batch.len() as u64);
        tracing::debug!(documents = batch.len(), first_id = batch.first_id, "batch indexed");
        BatchResult::Delivered
    }
}
