use crate::config::SweepConfig;
use crate::metrics::{SWEEP_OPTIMISTIC_MISSES, SWEEP_REQUEUED};
use chrono::Utc;
use cineforge_common::model::{JobId, RequeueContext};
use cineforge_common::SafeDisplay;
use cineforge_service_base::repo::job::{JobRecord, JobRepo};
use cineforge_service_base::service::job::JobService;
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome counters of one maintenance pass; exposed for tests and logs.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub stale_requeued: usize,
    pub stale_misses: usize,
    pub backoff_requeued: usize,
    pub backoff_misses: usize,
}

/// The two maintenance sweeps of the job lifecycle. This is the only place
/// that retries failed jobs; workers never self-retry.
pub struct LifecycleMonitor {
    job_repo: Arc<dyn JobRepo>,
    job_service: Arc<dyn JobService>,
    sweeps: SweepConfig,
}

impl LifecycleMonitor {
    pub fn new(
        job_repo: Arc<dyn JobRepo>,
        job_service: Arc<dyn JobService>,
        sweeps: SweepConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            job_repo,
            job_service,
            sweeps,
        })
    }

    /// Runs both sweeps concurrently and reports what moved.
    pub async fn run_once(&self) -> SweepReport {
        let (stale, backoff) = tokio::join!(self.sweep_stale(), self.sweep_backoff());
        let report = SweepReport {
            stale_requeued: stale.0,
            stale_misses: stale.1,
            backoff_requeued: backoff.0,
            backoff_misses: backoff.1,
        };
        if report != SweepReport::default() {
            info!(
                stale_requeued = report.stale_requeued,
                stale_misses = report.stale_misses,
                backoff_requeued = report.backoff_requeued,
                backoff_misses = report.backoff_misses,
                "lifecycle sweep finished"
            );
        }
        report
    }

    /// RUNNING rows whose claim went stale: the worker died or lost its
    /// claim. The optimistic attempt guard means a still-live worker that
    /// finishes in between cannot be clobbered.
    async fn sweep_stale(&self) -> (usize, usize) {
        let stale_after = match chrono::Duration::from_std(self.sweeps.stale_after) {
            Ok(duration) => duration,
            Err(_) => return (0, 0),
        };
        let cutoff = Utc::now() - stale_after;
        let candidates = match self.job_repo.stale_running(cutoff).await {
            Ok(candidates) => candidates,
            Err(error) => {
                warn!(error = %error.to_safe_string(), "stale sweep select failed");
                return (0, 0);
            }
        };
        self.requeue_all(candidates, RequeueContext::StaleRecovery).await
    }

    /// FAILED rows whose exponential-backoff window has elapsed.
    async fn sweep_backoff(&self) -> (usize, usize) {
        let candidates = match self.job_repo.failed_ready_for_backoff(Utc::now()).await {
            Ok(candidates) => candidates,
            Err(error) => {
                warn!(error = %error.to_safe_string(), "backoff sweep select failed");
                return (0, 0);
            }
        };
        self.requeue_all(candidates, RequeueContext::BackoffRetry).await
    }

    async fn requeue_all(
        &self,
        candidates: Vec<JobRecord>,
        context: RequeueContext,
    ) -> (usize, usize) {
        let label = context.to_string();
        let mut requeued = 0;
        let mut misses = 0;
        for candidate in candidates {
            let job_id = JobId(candidate.id);
            match self
                .job_service
                .requeue_job(&job_id, candidate.attempt, context)
                .await
            {
                Ok(Some(_)) => {
                    requeued += 1;
                    SWEEP_REQUEUED.with_label_values(&[label.as_str()]).inc();
                }
                // The attempt moved between select and update; someone
                // else got there first. Normal, not an error.
                Ok(None) => {
                    misses += 1;
                    SWEEP_OPTIMISTIC_MISSES
                        .with_label_values(&[label.as_str()])
                        .inc();
                }
                Err(error) => {
                    warn!(
                        job_id = %job_id,
                        context = %label,
                        error = %error.to_safe_string(),
                        "requeue failed"
                    );
                }
            }
        }
        (requeued, misses)
    }
}
