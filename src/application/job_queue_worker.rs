use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use super::execution_engine::ExecutionEngine;
use crate::ports::JobQueue;

const MAX_ATTEMPTS: u32 = 5;
const VISIBILITY_TIMEOUT: Duration = Duration::from_secs(60);
const POLL_INTERVAL_IDLE: Duration = Duration::from_millis(500);

/// Drains the durable job queue with `worker_count` concurrent workers
/// (spec §4.2, §5). Each worker polls independently; `claim_next`'s
/// visibility timeout is what prevents two workers from double-processing
/// the same job.
pub struct JobQueueWorkerPool {
    pub jobs: Arc<dyn JobQueue>,
    pub execution_engine: Arc<ExecutionEngine>,
    pub worker_count: usize,
}

impl JobQueueWorkerPool {
    /// Spawns `worker_count` tasks and returns their handles. The caller
    /// holds the handles and aborts them on shutdown after the drain
    /// deadline (spec §5 "Cancellation & timeouts").
    pub fn spawn(self: Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.worker_count)
            .map(|worker_index| {
                let pool = self.clone();
                tokio::spawn(async move { pool.run_worker(worker_index).await })
            })
            .collect()
    }

    async fn run_worker(&self, worker_index: usize) {
        loop {
            match self.jobs.claim_next(VISIBILITY_TIMEOUT).await {
                Ok(Some(job)) => {
                    let outcome = self.dispatch(&job.job_name, &job.payload).await;
                    match outcome {
                        Ok(()) => {
                            if let Err(e) = self.jobs.complete(&job.id).await {
                                error!(worker = worker_index, job_id = %job.id, error = %e, "failed to mark job complete");
                            }
                        }
                        Err(e) => {
                            warn!(worker = worker_index, job_id = %job.id, job_name = %job.job_name, attempt = job.attempt, error = %e, "job failed");
                            let retry_at = if job.attempt < MAX_ATTEMPTS {
                                Some(Utc::now() + chrono::Duration::seconds(backoff_seconds(job.attempt)))
                            } else {
                                None
                            };
                            if retry_at.is_none() {
                                error!(job_id = %job.id, job_name = %job.job_name, "job exhausted retry budget, marking permanently failed");
                            }
                            if let Err(e) = self.jobs.fail(&job.id, retry_at).await {
                                error!(worker = worker_index, job_id = %job.id, error = %e, "failed to record job failure");
                            }
                        }
                    }
                }
                Ok(None) => tokio::time::sleep(POLL_INTERVAL_IDLE).await,
                Err(e) => {
                    error!(worker = worker_index, error = %e, "error claiming next job, backing off");
                    tokio::time::sleep(POLL_INTERVAL_IDLE).await;
                }
            }
        }
    }

    async fn dispatch(&self, job_name: &str, payload: &serde_json::Value) -> anyhow::Result<()> {
        match job_name {
            "execute_signal" => {
                let signal_id = payload.get("signal_id").and_then(|v| v.as_str()).ok_or_else(|| anyhow::anyhow!("execute_signal payload missing signal_id"))?;
                self.execution_engine.execute_signal(signal_id).await
            }
            other => {
                info!(job_name = other, "no handler registered for job, dropping");
                Ok(())
            }
        }
    }
}

/// Exponential backoff, capped at 5 minutes. See spec §4.2 "Failure handling".
fn backoff_seconds(attempt: u32) -> i64 {
    let capped = attempt.min(8);
    (2i64.saturating_pow(capped)).min(300)
}
