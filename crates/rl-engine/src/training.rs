//! Training job manager. Runs simulator training as a cancellable
//! background job with status polling and a wall-clock timeout. Only the
//! most recently finished jobs are retained.

use crate::simulator::{
    EpisodeSimulator, StopReason, TrainingControl, TrainingRequest, TrainingResult,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use pricing_core::error::{PricingError, PricingResult};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
            JobState::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Queued | JobState::Running)
    }
}

/// Point-in-time view of a training job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingJob {
    pub id: Uuid,
    pub state: JobState,
    pub episodes_requested: usize,
    pub episodes_completed: usize,
    /// Partial for cancelled and timed-out jobs.
    pub result: Option<TrainingResult>,
    pub error: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

type WorkerHandle = JoinHandle<Option<TrainingJob>>;

struct JobEntry {
    job: TrainingJob,
    control: TrainingControl,
    /// Taken by the first caller to `wait`.
    handle: Option<WorkerHandle>,
}

pub struct TrainingJobManager {
    simulator: Arc<EpisodeSimulator>,
    jobs: Arc<DashMap<Uuid, JobEntry>>,
    timeout: Duration,
    max_retained_jobs: usize,
}

impl TrainingJobManager {
    pub fn new(
        simulator: Arc<EpisodeSimulator>,
        timeout: Duration,
        max_retained_jobs: usize,
    ) -> Self {
        Self {
            simulator,
            jobs: Arc::new(DashMap::new()),
            timeout,
            max_retained_jobs: max_retained_jobs.max(1),
        }
    }

    /// Validate and queue a training run on the blocking pool. Must be called
    /// from within a Tokio runtime.
    pub fn submit(&self, request: TrainingRequest, seed: u64) -> PricingResult<Uuid> {
        self.simulator.validate(&request)?;
        self.simulator.eligible_listings(&request)?;

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| PricingError::Internal(anyhow::anyhow!("no tokio runtime: {e}")))?;

        let id = Uuid::new_v4();
        let episodes = request.episodes;
        let control = TrainingControl::with_deadline(Instant::now() + self.timeout);
        self.jobs.insert(
            id,
            JobEntry {
                job: TrainingJob {
                    id,
                    state: JobState::Queued,
                    episodes_requested: episodes,
                    episodes_completed: 0,
                    result: None,
                    error: None,
                    submitted_at: Utc::now(),
                    finished_at: None,
                },
                control: control.clone(),
                handle: None,
            },
        );

        let jobs = self.jobs.clone();
        let simulator = self.simulator.clone();
        let keep = self.max_retained_jobs;
        let handle = runtime.spawn_blocking(move || {
            match jobs.get_mut(&id) {
                Some(mut entry) if entry.job.state == JobState::Queued => {
                    entry.job.state = JobState::Running;
                }
                // Cancelled while still queued.
                Some(entry) => return Some(entry.job.clone()),
                None => return None,
            }

            let mut rng = StdRng::seed_from_u64(seed);
            let outcome = simulator.train_with_control(&request, &control, &mut rng);

            let finished = {
                let mut entry = jobs.get_mut(&id)?;
                let job = &mut entry.job;
                match outcome {
                    Ok(run) => {
                        job.state = match run.stopped {
                            None => JobState::Completed,
                            Some(StopReason::Cancelled) => JobState::Cancelled,
                            Some(StopReason::TimedOut) => JobState::TimedOut,
                        };
                        job.episodes_completed = run.result.episodes_completed;
                        job.result = Some(run.result);
                    }
                    Err(e) => {
                        error!(job_id = %id, error = %e, "training job failed");
                        job.state = JobState::Failed;
                        job.episodes_completed = control.episodes_completed.load(Ordering::SeqCst);
                        job.error = Some(e.to_string());
                    }
                }
                job.finished_at = Some(Utc::now());
                job.clone()
            };

            metrics::counter!("rl.training.jobs", "state" => finished.state.as_str()).increment(1);
            info!(
                job_id = %id,
                state = finished.state.as_str(),
                episodes_completed = finished.episodes_completed,
                "training job finished"
            );
            prune_finished(&jobs, keep);
            Some(finished)
        });
        if let Some(mut entry) = self.jobs.get_mut(&id) {
            entry.handle = Some(handle);
        }

        info!(job_id = %id, episodes, "training job queued");
        Ok(id)
    }

    pub fn status(&self, id: &Uuid) -> PricingResult<TrainingJob> {
        let entry = self
            .jobs
            .get(id)
            .ok_or_else(|| PricingError::not_found(format!("training job {id}")))?;
        let mut job = entry.job.clone();
        if job.state == JobState::Running {
            job.episodes_completed = entry.control.episodes_completed.load(Ordering::SeqCst);
        }
        Ok(job)
    }

    /// Request cancellation. A queued job is cancelled immediately; a running
    /// job stops after its current episode. Terminal jobs are left as they are.
    pub fn cancel(&self, id: &Uuid) -> PricingResult<TrainingJob> {
        {
            let mut entry = self
                .jobs
                .get_mut(id)
                .ok_or_else(|| PricingError::not_found(format!("training job {id}")))?;
            match entry.job.state {
                JobState::Queued => {
                    entry.job.state = JobState::Cancelled;
                    entry.job.finished_at = Some(Utc::now());
                    entry.control.cancel();
                }
                JobState::Running => entry.control.cancel(),
                _ => warn!(
                    job_id = %id,
                    state = entry.job.state.as_str(),
                    "cancel on finished job ignored"
                ),
            }
        }
        self.status(id)
    }

    /// Wait for the job to finish and return its final status. The first
    /// waiter joins the worker; later waiters poll until the job is terminal.
    pub async fn wait(&self, id: &Uuid) -> PricingResult<TrainingJob> {
        let handle = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| PricingError::not_found(format!("training job {id}")))?
            .handle
            .take();

        match handle {
            Some(handle) => match handle.await {
                Ok(Some(job)) => Ok(job),
                Ok(None) => self.status(id),
                Err(e) => {
                    error!(job_id = %id, error = %e, "training worker panicked");
                    if let Some(mut entry) = self.jobs.get_mut(id) {
                        entry.job.state = JobState::Failed;
                        entry.job.error = Some(format!("training worker panicked: {e}"));
                        entry.job.finished_at = Some(Utc::now());
                    }
                    Err(PricingError::Internal(anyhow::anyhow!(
                        "training worker panicked: {e}"
                    )))
                }
            },
            None => loop {
                let job = self.status(id)?;
                if job.state.is_terminal() {
                    return Ok(job);
                }
                tokio::time::sleep(WAIT_POLL_INTERVAL).await;
            },
        }
    }

    /// Retained jobs, newest first.
    pub fn list(&self) -> Vec<TrainingJob> {
        let mut jobs: Vec<TrainingJob> = self.jobs.iter().map(|e| e.job.clone()).collect();
        jobs.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        jobs
    }
}

/// Drop the oldest finished jobs beyond `keep`. Queued and running jobs are
/// never dropped.
fn prune_finished(jobs: &DashMap<Uuid, JobEntry>, keep: usize) {
    let mut finished: Vec<(DateTime<Utc>, Uuid)> = jobs
        .iter()
        .filter(|e| e.job.state.is_terminal())
        .filter_map(|e| e.job.finished_at.map(|at| (at, *e.key())))
        .collect();
    if finished.len() <= keep {
        return;
    }
    finished.sort();
    let excess = finished.len() - keep;
    for (_, id) in finished.into_iter().take(excess) {
        jobs.remove(&id);
    }
    debug!(pruned = excess, retained = keep, "finished training jobs pruned");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::q_policy::QPolicy;
    use chrono::Duration as ChronoDuration;
    use pricing_core::config::{QLearningConfig, TrainingConfig};
    use pricing_core::store::InMemoryStore;
    use pricing_core::types::{ListingSnapshot, ListingStatus};

    fn manager_with(
        timeout: Duration,
        training: TrainingConfig,
        max_retained_jobs: usize,
    ) -> TrainingJobManager {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        store.upsert_listing(ListingSnapshot {
            id: "l1".into(),
            user_id: "seller-1".into(),
            category_id: Some("shoes".into()),
            brand: None,
            status: ListingStatus::Active,
            current_price: 40.0,
            original_price: 45.0,
            views: 200,
            watchers: 12,
            competitor_prices: vec![42.0],
            price_history: vec![45.0],
            listed_at: now - ChronoDuration::days(3),
            updated_at: now,
        });
        let policy = Arc::new(QPolicy::new(
            store.clone(),
            store.clone(),
            QLearningConfig::default(),
        ));
        let simulator = Arc::new(EpisodeSimulator::new(policy, store, training, 1000));
        TrainingJobManager::new(simulator, timeout, max_retained_jobs)
    }

    fn manager(timeout: Duration) -> TrainingJobManager {
        manager_with(timeout, TrainingConfig::default(), 100)
    }

    fn request(episodes: usize) -> TrainingRequest {
        TrainingRequest {
            episodes,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_job_runs_to_completion() {
        let manager = manager(Duration::from_secs(60));
        let id = manager.submit(request(30), 7).unwrap();
        let job = manager.wait(&id).await.unwrap();

        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.episodes_completed, 30);
        assert!(job.finished_at.is_some());
        let result = job.result.unwrap();
        assert_eq!(result.episodes_completed, 30);
        assert!(result.model_performance.q_table_size > 0);
    }

    #[tokio::test]
    async fn test_zero_timeout_marks_job_timed_out() {
        let manager = manager(Duration::ZERO);
        let id = manager.submit(request(100), 1).unwrap();
        let job = manager.wait(&id).await.unwrap();
        assert_eq!(job.state, JobState::TimedOut);
        assert!(job.result.is_some());
    }

    #[tokio::test]
    async fn test_invalid_request_rejected_synchronously() {
        let manager = manager(Duration::from_secs(60));
        let err = manager.submit(request(0), 1).unwrap_err();
        assert!(matches!(err, PricingError::InvalidArgument(_)));

        let err = manager
            .submit(
                TrainingRequest {
                    episodes: 5,
                    category_id: Some("bags".into()),
                    ..Default::default()
                },
                1,
            )
            .unwrap_err();
        assert!(matches!(err, PricingError::InvalidArgument(_)));
        assert!(manager.list().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_reaches_terminal_state() {
        let manager = manager(Duration::from_secs(60));
        let id = manager.submit(request(1000), 3).unwrap();
        manager.cancel(&id).unwrap();
        let job = manager.wait(&id).await.unwrap();

        // The worker may have finished before the cancel landed.
        assert!(matches!(job.state, JobState::Cancelled | JobState::Completed));
        assert!(job.state.is_terminal());
        assert!(job.episodes_completed <= 1000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_running_job_keeps_partial_result() {
        let training = TrainingConfig {
            max_episodes: 1_000_000,
            ..Default::default()
        };
        let manager = manager_with(Duration::from_secs(60), training, 100);
        let id = manager.submit(request(1_000_000), 11).unwrap();

        let started = Instant::now();
        loop {
            let job = manager.status(&id).unwrap();
            if job.state == JobState::Running && job.episodes_completed > 0 {
                break;
            }
            assert!(!job.state.is_terminal(), "job ended before it was cancelled");
            assert!(started.elapsed() < Duration::from_secs(10), "job never started");
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        manager.cancel(&id).unwrap();
        let job = manager.wait(&id).await.unwrap();
        assert_eq!(job.state, JobState::Cancelled);
        assert!(job.episodes_completed > 0);
        assert!(job.episodes_completed < job.episodes_requested);
        let result = job.result.expect("cancelled job keeps its partial result");
        assert_eq!(result.episodes_completed, job.episodes_completed);
        assert_eq!(manager.status(&id).unwrap().state, JobState::Cancelled);
    }

    #[tokio::test]
    async fn test_second_waiter_polls_to_the_same_outcome() {
        let manager = manager(Duration::from_secs(60));
        let id = manager.submit(request(20), 5).unwrap();
        let (first, second) = tokio::join!(manager.wait(&id), manager.wait(&id));
        assert_eq!(first.unwrap().state, JobState::Completed);
        assert_eq!(second.unwrap().state, JobState::Completed);
    }

    #[tokio::test]
    async fn test_only_recent_finished_jobs_are_retained() {
        let manager = manager_with(Duration::from_secs(60), TrainingConfig::default(), 2);
        let mut ids = Vec::new();
        for seed in 0..3 {
            let id = manager.submit(request(5), seed).unwrap();
            assert_eq!(manager.wait(&id).await.unwrap().state, JobState::Completed);
            ids.push(id);
        }

        let retained: Vec<Uuid> = manager.list().into_iter().map(|j| j.id).collect();
        assert_eq!(retained, vec![ids[2], ids[1]]);
        assert!(matches!(
            manager.status(&ids[0]).unwrap_err(),
            PricingError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let manager = manager(Duration::from_secs(60));
        let missing = Uuid::new_v4();
        assert!(matches!(
            manager.status(&missing).unwrap_err(),
            PricingError::NotFound(_)
        ));
        assert!(matches!(
            manager.cancel(&missing).unwrap_err(),
            PricingError::NotFound(_)
        ));
        assert!(matches!(
            manager.wait(&missing).await.unwrap_err(),
            PricingError::NotFound(_)
        ));
    }

    #[test]
    fn test_submit_outside_runtime_is_internal_error() {
        let manager = manager(Duration::from_secs(60));
        let err = manager.submit(request(5), 1).unwrap_err();
        assert!(matches!(err, PricingError::Internal(_)));
    }
}
