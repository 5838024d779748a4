// src/refresh.rs - Background recomputation queue for stale cache entries
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::models::{ApiError, MetricKey, Tenant};

#[derive(Debug, Clone)]
pub struct RefreshJob {
    pub tenant: Tenant,
    pub key: MetricKey,
    pub requested_at: DateTime<Utc>,
}

/// Recomputes one metric and writes it back to the cache.
#[async_trait]
pub trait MetricRecomputer: Send + Sync {
    async fn recompute(&self, tenant: &Tenant, key: &MetricKey) -> Result<(), ApiError>;
}

/// Sending half of the refresh queue. Scheduling never waits: when the queue
/// is full the request is dropped and the next stale read asks again.
#[derive(Clone)]
pub struct RefreshScheduler {
    tx: mpsc::Sender<RefreshJob>,
}

impl RefreshScheduler {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<RefreshJob>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub fn schedule(&self, tenant: &Tenant, key: &MetricKey) -> bool {
        let job = RefreshJob {
            tenant: tenant.clone(),
            key: key.clone(),
            requested_at: Utc::now(),
        };

        match self.tx.try_send(job) {
            Ok(()) => {
                debug!(shop = %tenant.shop, metric = %key, "Background refresh scheduled");
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(shop = %tenant.shop, metric = %key, "Refresh queue full, skipping refresh");
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!(shop = %tenant.shop, metric = %key, "Refresh worker stopped, skipping refresh");
                false
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    pub shop: String,
    pub metric_key: String,
    pub queued_ms: i64,
    pub elapsed_ms: u128,
    pub result: Result<(), String>,
}

/// Drain the queue, running each job on its own task so a slow shop does not
/// hold up the others. Duplicate jobs for the same key are allowed.
pub fn spawn_refresh_worker(
    mut jobs: mpsc::Receiver<RefreshJob>,
    recomputer: Arc<dyn MetricRecomputer>,
    outcomes: mpsc::UnboundedSender<RefreshOutcome>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(job) = jobs.recv().await {
            let recomputer = Arc::clone(&recomputer);
            let outcomes = outcomes.clone();

            tokio::spawn(async move {
                let queued_ms = (Utc::now() - job.requested_at).num_milliseconds();
                let start = Instant::now();
                let result = recomputer
                    .recompute(&job.tenant, &job.key)
                    .await
                    .map_err(|e| e.to_string());

                // Receiver gone means shutdown.
                let _ = outcomes.send(RefreshOutcome {
                    shop: job.tenant.shop,
                    metric_key: job.key.cache_key(),
                    queued_ms,
                    elapsed_ms: start.elapsed().as_millis(),
                    result,
                });
            });
        }
        info!("Refresh worker stopped");
    })
}

pub fn spawn_outcome_logger(
    mut outcomes: mpsc::UnboundedReceiver<RefreshOutcome>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(outcome) = outcomes.recv().await {
            match &outcome.result {
                Ok(()) => info!(
                    shop = %outcome.shop,
                    metric = %outcome.metric_key,
                    queued_ms = outcome.queued_ms,
                    elapsed_ms = outcome.elapsed_ms as u64,
                    "Background refresh completed"
                ),
                Err(err) => error!(
                    shop = %outcome.shop,
                    metric = %outcome.metric_key,
                    elapsed_ms = outcome.elapsed_ms as u64,
                    error = %err,
                    "Background refresh failed"
                ),
            }
        }
    })
}
