//! Job manager: admission, single-flight dispatch, retries and the watchdog.

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::{Job, JobStatus, JobView};
use crate::analysis::{AnalysisInput, AnalysisMode, AnalysisOutcome, StepObserver, StrategyDispatcher};
use crate::config::{AdvisorConfig, Config, JobsConfig};
use crate::db::{Database, NewJob, RetryOutcome};
use crate::error::{Error, Result};
use crate::inference::{InferenceGateway, VisionProvider};
use crate::retrieval::{ImageFeatureEmbedder, RetrievalEngine};

const EVENT_BUS_CAPACITY: usize = 256;

pub struct SubmitRequest {
    pub advisor_id: String,
    pub mode: AnalysisMode,
    pub image: Vec<u8>,
}

/// Stops the background loops started by [`JobManager::start`].
pub struct JobManagerHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl JobManagerHandle {
    /// Signal the loops to stop and wait for them. Jobs in flight are left as
    /// they are; the next start fails them as interrupted.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!(error = ?e, "Job manager task panicked");
                }
            }
        }
        info!("Job manager stopped");
    }
}

enum Dispatch {
    /// A job already holds the inference slot.
    Busy,
    /// Nothing claimable.
    Idle,
    Started,
    /// The head of the queue was failed before it could start.
    Rejected,
}

struct Inner {
    db: Arc<Database>,
    dispatcher: StrategyDispatcher,
    config: JobsConfig,
    advisors: HashMap<String, AdvisorConfig>,
    upload_dir: PathBuf,
    events: broadcast::Sender<JobView>,
    wake: Notify,
    running: Mutex<HashMap<String, (u32, AbortHandle)>>,
}

#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

impl JobManager {
    pub fn new(
        db: Arc<Database>,
        dispatcher: StrategyDispatcher,
        config: JobsConfig,
        advisors: Vec<AdvisorConfig>,
        upload_dir: PathBuf,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                db,
                dispatcher,
                config,
                advisors: advisors.into_iter().map(|a| (a.id.clone(), a)).collect(),
                upload_dir,
                events,
                wake: Notify::new(),
                running: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Wire the gateway, retrieval engine and dispatcher from configuration.
    pub fn from_config(
        config: &Config,
        db: Arc<Database>,
        provider: Arc<dyn VisionProvider>,
    ) -> Self {
        let gateway = InferenceGateway::new(provider, config.inference.max_tokens);
        let retrieval = Arc::new(RetrievalEngine::new(
            Arc::clone(&db),
            Arc::new(ImageFeatureEmbedder),
            config.retrieval.clone(),
        ));
        let dispatcher = StrategyDispatcher::new(
            gateway,
            retrieval,
            Arc::clone(&db),
            config.inference.timeouts.clone(),
        );
        Self::new(
            db,
            dispatcher,
            config.jobs.clone(),
            config.advisors.clone(),
            config.storage.upload_dir.clone(),
        )
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.inner.db
    }

    pub fn advisor(&self, advisor_id: &str) -> Option<&AdvisorConfig> {
        self.inner.advisors.get(advisor_id)
    }

    /// Every job transition, as it happens.
    pub fn subscribe(&self) -> broadcast::Receiver<JobView> {
        self.inner.events.subscribe()
    }

    /// Validate, store the image, and queue a job. Returns the job id.
    #[instrument(skip(self, request), fields(advisor = %request.advisor_id, mode = %request.mode))]
    pub fn submit(&self, request: SubmitRequest) -> Result<String> {
        if !self.inner.advisors.contains_key(&request.advisor_id) {
            return Err(Error::Validation(format!(
                "unknown advisor '{}'",
                request.advisor_id
            )));
        }
        if request.image.is_empty() {
            return Err(Error::Validation("no image uploaded".to_string()));
        }
        let format = image::guess_format(&request.image)
            .map_err(|e| Error::Validation(format!("unreadable image: {}", e)))?;
        image::load_from_memory_with_format(&request.image, format)
            .map_err(|e| Error::Validation(format!("unreadable image: {}", e)))?;

        let sha256 = format!("{:x}", Sha256::digest(&request.image));
        let job_id = Uuid::new_v4().to_string();
        let extension = format.extensions_str().first().copied().unwrap_or("img");

        std::fs::create_dir_all(&self.inner.upload_dir)?;
        let image_path = self
            .inner
            .upload_dir
            .join(format!("{}.{}", job_id, extension));
        std::fs::write(&image_path, &request.image)?;

        let now = Utc::now();
        let db = &self.inner.db;
        let queued = db
            .insert_job(
                &NewJob {
                    id: &job_id,
                    advisor_id: &request.advisor_id,
                    mode: request.mode,
                    image_path: &image_path,
                    image_sha256: &sha256,
                },
                now,
            )
            .and_then(|()| db.enqueue_job(&job_id, now));
        if let Err(e) = queued {
            if let Err(remove_err) = std::fs::remove_file(&image_path) {
                warn!(path = %image_path.display(), error = %remove_err, "Failed to remove orphaned upload");
            }
            return Err(e);
        }

        info!(job_id = %job_id, sha256 = %sha256, "Job queued");
        self.publish(&job_id);
        self.inner.wake.notify_one();
        Ok(job_id)
    }

    pub fn get_job(&self, job_id: &str) -> Result<Job> {
        self.inner
            .db
            .get_job(job_id)?
            .ok_or_else(|| Error::NotFound(format!("job {}", job_id)))
    }

    pub fn get_status(&self, job_id: &str) -> Result<JobView> {
        Ok(self.get_job(job_id)?.view())
    }

    pub fn list(&self, limit: usize) -> Result<Vec<JobView>> {
        Ok(self
            .inner
            .db
            .list_jobs(limit)?
            .iter()
            .map(Job::view)
            .collect())
    }

    /// Live jobs idle for longer than the stall threshold.
    pub fn stalled(&self) -> Result<Vec<JobView>> {
        let cutoff = Utc::now() - self.inner.config.stall_threshold();
        Ok(self
            .inner
            .db
            .stalled_jobs(cutoff)?
            .iter()
            .map(Job::view)
            .collect())
    }

    /// Forcefully abandon a job. The inference call it started, if any, keeps
    /// the engine until it returns on its own.
    #[instrument(skip(self))]
    pub fn cancel(&self, job_id: &str) -> Result<JobView> {
        let job = self.get_job(job_id)?;
        if !self
            .inner
            .db
            .fail_job(job_id, None, "cancelled by operator", Utc::now())?
        {
            let current = self.get_job(job_id)?;
            return Err(Error::InvalidTransition {
                job_id: job_id.to_string(),
                from: current.status.to_string(),
                to: JobStatus::Failed.to_string(),
            });
        }

        self.abort_running(job_id, None);
        warn!(job_id, from = %job.status, "Job cancelled by operator");
        self.publish(job_id);
        self.inner.wake.notify_one();
        self.get_status(job_id)
    }

    /// Operator retry: a processing job goes back through the bounded retry
    /// edge; a queued job waiting out its backoff becomes claimable now.
    #[instrument(skip(self))]
    pub fn retry(&self, job_id: &str) -> Result<JobView> {
        let job = self.get_job(job_id)?;
        let now = Utc::now();
        let invalid = |from: JobStatus| Error::InvalidTransition {
            job_id: job_id.to_string(),
            from: from.to_string(),
            to: JobStatus::Queued.to_string(),
        };

        match job.status {
            JobStatus::Processing => {
                let outcome = self.inner.db.requeue_job(
                    job_id,
                    Some(job.attempt),
                    "retried by operator",
                    self.inner.config.max_retries,
                    |_| Duration::ZERO,
                    now,
                )?;
                match outcome {
                    RetryOutcome::Abandoned => {
                        let current = self.get_job(job_id)?;
                        return Err(invalid(current.status));
                    }
                    RetryOutcome::Requeued(n) => {
                        info!(job_id, retry_count = n, "Job re-queued by operator")
                    }
                    RetryOutcome::Exhausted(n) => {
                        warn!(job_id, retry_count = n, "Operator retry exhausted the retry budget")
                    }
                }
                self.abort_running(job_id, Some(job.attempt));
            }
            JobStatus::Queued => {
                if !self.inner.db.nudge_job(job_id, now)? {
                    let current = self.get_job(job_id)?;
                    return Err(invalid(current.status));
                }
                info!(job_id, "Queued job made claimable by operator");
            }
            other => return Err(invalid(other)),
        }

        self.publish(job_id);
        self.inner.wake.notify_one();
        self.get_status(job_id)
    }

    /// Recover from a previous run, then start the dispatcher and watchdog.
    pub fn start(&self) -> Result<JobManagerHandle> {
        let interrupted = self.inner.db.fail_interrupted_jobs(Utc::now())?;
        for job_id in &interrupted {
            warn!(job_id = %job_id, "Job was running when the previous process stopped; failed");
            self.publish(job_id);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = tokio::spawn(self.clone().run_dispatcher(shutdown_rx.clone()));
        let watchdog = tokio::spawn(self.clone().run_watchdog(shutdown_rx));

        info!(
            max_retries = self.inner.config.max_retries,
            stall_threshold_secs = self.inner.config.stall_threshold_secs,
            recovered = interrupted.len(),
            "Job manager started"
        );

        Ok(JobManagerHandle {
            shutdown_tx,
            tasks: vec![dispatcher, watchdog],
        })
    }

    fn publish(&self, job_id: &str) {
        match self.inner.db.get_job(job_id) {
            Ok(Some(job)) => {
                // No subscribers is fine.
                let _ = self.inner.events.send(job.view());
            }
            Ok(None) => {}
            Err(e) => error!(job_id, error = %e, "Failed to load job for event"),
        }
    }

    /// Abort the executor for `job_id`; with `attempt`, only that claim.
    fn abort_running(&self, job_id: &str, attempt: Option<u32>) {
        let mut running = self.inner.running.lock().unwrap_or_else(|e| e.into_inner());
        if running
            .get(job_id)
            .is_some_and(|(a, _)| attempt.map_or(true, |expected| *a == expected))
        {
            if let Some((attempt, handle)) = running.remove(job_id) {
                handle.abort();
                debug!(job_id, attempt, "Aborted executor");
            }
        }
    }

    async fn run_dispatcher(self, mut shutdown: watch::Receiver<bool>) {
        let poll = Duration::from_millis(self.inner.config.poll_interval_ms.max(1));

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.try_dispatch() {
                Ok(Dispatch::Rejected) => continue,
                Ok(Dispatch::Started) | Ok(Dispatch::Busy) | Ok(Dispatch::Idle) => {}
                Err(e) => error!(error = %e, "Dispatch failed"),
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = self.inner.wake.notified() => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// Claim the oldest ready job if the slot is free.
    fn try_dispatch(&self) -> Result<Dispatch> {
        let db = &self.inner.db;
        let now = Utc::now();

        if db.count_active()? > 0 {
            return Ok(Dispatch::Busy);
        }
        let Some(job) = db.next_claimable(now)? else {
            return Ok(Dispatch::Idle);
        };

        if job.mode.needs_adapter() && !db.adapter_available(&job.advisor_id)? {
            let err = Error::AdapterUnavailable(job.advisor_id.clone());
            if db.fail_job(&job.id, None, &err.to_string(), now)? {
                warn!(job_id = %job.id, mode = %job.mode, "{}", err);
                self.publish(&job.id);
            }
            return Ok(Dispatch::Rejected);
        }

        let Some(attempt) = db.claim_job(&job.id, now)? else {
            return Ok(Dispatch::Busy);
        };
        info!(job_id = %job.id, attempt, mode = %job.mode, "Job claimed");
        self.publish(&job.id);

        let mut running = self.inner.running.lock().unwrap_or_else(|e| e.into_inner());
        let job_id = job.id.clone();
        let task = tokio::spawn(self.clone().execute(job, attempt));
        running.insert(job_id, (attempt, task.abort_handle()));
        Ok(Dispatch::Started)
    }

    async fn execute(self, job: Job, attempt: u32) {
        let observer = JobObserver {
            manager: self.clone(),
            job_id: job.id.clone(),
            attempt,
        };
        let outcome = self.run_analysis(&job, &observer).await;
        let db = &self.inner.db;
        let now = Utc::now();

        let settled = match outcome {
            Ok(outcome) => db
                .complete_job(
                    &job.id,
                    attempt,
                    &outcome.result,
                    outcome.retrieved_profile_ids.as_deref(),
                    now,
                )
                .map(|written| {
                    if written {
                        info!(
                            job_id = %job.id,
                            overall_score = outcome.result.overall_score,
                            citations = outcome.result.image_citation_count() + outcome.result.quote_citation_count(),
                            "Job completed"
                        );
                    } else {
                        warn!(job_id = %job.id, attempt, "Result discarded; job moved on");
                    }
                }),
            Err(err) if err.is_transient() => self.handle_transient(&job, attempt, &err),
            Err(err) => db.fail_job(&job.id, Some(attempt), &err.to_string(), now).map(|written| {
                if written {
                    warn!(job_id = %job.id, error = %err, code = err.code(), "Job failed");
                }
            }),
        };
        if let Err(e) = settled {
            error!(job_id = %job.id, error = %e, "Failed to record job outcome");
        }

        self.publish(&job.id);
        {
            let mut running = self.inner.running.lock().unwrap_or_else(|e| e.into_inner());
            if running.get(&job.id).is_some_and(|(a, _)| *a == attempt) {
                running.remove(&job.id);
            }
        }
        self.inner.wake.notify_one();
    }

    fn handle_transient(&self, job: &Job, attempt: u32, err: &Error) -> Result<()> {
        let config = &self.inner.config;
        let now = Utc::now();
        let outcome = self.inner.db.requeue_job(
            &job.id,
            Some(attempt),
            &err.to_string(),
            config.max_retries,
            |n| config.backoff_for(n),
            now,
        )?;

        match outcome {
            RetryOutcome::Requeued(n) => warn!(
                job_id = %job.id,
                retry_count = n,
                backoff = ?config.backoff_for(n),
                error = %err,
                "Transient failure; job re-queued"
            ),
            RetryOutcome::Exhausted(n) => warn!(
                job_id = %job.id,
                retry_count = n,
                error = %err,
                "Retries exhausted; job failed"
            ),
            RetryOutcome::Abandoned => {
                // Not in processing: the failure came before the inference call.
                if self
                    .inner
                    .db
                    .fail_job(&job.id, Some(attempt), &err.to_string(), now)?
                {
                    warn!(job_id = %job.id, error = %err, "Job failed before inference");
                }
            }
        }
        Ok(())
    }

    async fn run_analysis(&self, job: &Job, observer: &JobObserver) -> Result<AnalysisOutcome> {
        observer.step("loading image", 10)?;
        let image = tokio::fs::read(&job.image_path).await?;
        let advisor = self
            .inner
            .advisors
            .get(&job.advisor_id)
            .cloned()
            .ok_or_else(|| {
                Error::Validation(format!("advisor '{}' is no longer configured", job.advisor_id))
            })?;

        let input = AnalysisInput {
            job_id: job.id.clone(),
            advisor,
            image: Arc::new(image),
        };
        self.inner
            .dispatcher
            .analyze(job.mode, input, observer)
            .await
    }

    async fn run_watchdog(self, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs(self.inner.config.watchdog_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.inspect(),
            }
        }
    }

    /// Report stuck jobs. Never changes job state.
    fn inspect(&self) {
        match self.stalled() {
            Ok(stalled) => {
                let now = Utc::now();
                for job in stalled {
                    warn!(
                        job_id = %job.job_id,
                        status = %job.status,
                        step = %job.current_step,
                        idle_secs = (now - job.last_activity).num_seconds(),
                        "Job appears stuck; retry or cancel it"
                    );
                }
            }
            Err(e) => error!(error = %e, "Watchdog scan failed"),
        }

        let gateway = self.inner.dispatcher.gateway();
        if gateway.is_busy() && matches!(self.inner.db.count_active(), Ok(0)) {
            warn!(
                provider = gateway.provider_name(),
                "Inference engine still held by an abandoned call"
            );
        }
    }
}

/// Writes progress for one claimed attempt.
struct JobObserver {
    manager: JobManager,
    job_id: String,
    attempt: u32,
}

impl JobObserver {
    fn lost(&self) -> Error {
        Error::Internal(format!(
            "job {} attempt {} no longer holds the inference slot",
            self.job_id, self.attempt
        ))
    }
}

impl StepObserver for JobObserver {
    fn step(&self, label: &str, progress: u8) -> Result<()> {
        let written = self.manager.inner.db.update_job_step(
            &self.job_id,
            self.attempt,
            label,
            progress,
            Utc::now(),
        )?;
        if !written {
            return Err(self.lost());
        }
        debug!(job_id = %self.job_id, step = label, progress, "Job step");
        self.manager.publish(&self.job_id);
        Ok(())
    }

    fn inference_started(&self, label: &str, progress: u8) -> Result<()> {
        let written = self.manager.inner.db.mark_job_processing(
            &self.job_id,
            self.attempt,
            label,
            progress,
            Utc::now(),
        )?;
        if !written {
            return Err(self.lost());
        }
        self.manager.publish(&self.job_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimeoutConfig;
    use crate::inference::mock::{test_image, MockProvider, MockResponse};
    use tempfile::TempDir;

    struct Harness {
        manager: JobManager,
        provider: Arc<MockProvider>,
        uploads: TempDir,
    }

    fn harness_with(timeout_secs: f64) -> Harness {
        harness_with_timeouts(TimeoutConfig {
            baseline_secs: timeout_secs,
            adapter_secs: timeout_secs,
            rag_secs: timeout_secs,
            rag_adapter_secs: timeout_secs,
        })
    }

    fn harness_with_timeouts(timeouts: TimeoutConfig) -> Harness {
        let uploads = TempDir::new().unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.initialize().unwrap();
        let provider = Arc::new(MockProvider::new());

        let mut config = Config::default();
        config.storage.upload_dir = uploads.path().to_path_buf();
        config.inference.timeouts = timeouts;
        config.jobs = JobsConfig {
            max_retries: 3,
            retry_backoff_ms: 0,
            poll_interval_ms: 10,
            ..JobsConfig::default()
        };
        config.advisors.push(AdvisorConfig {
            id: "adams".into(),
            name: Some("Ansel Adams".into()),
            persona: "You are Ansel Adams.".into(),
        });

        let manager = JobManager::from_config(&config, db, provider.clone());
        Harness {
            manager,
            provider,
            uploads,
        }
    }

    fn harness() -> Harness {
        harness_with(5.0)
    }

    fn request(mode: AnalysisMode) -> SubmitRequest {
        SubmitRequest {
            advisor_id: "adams".into(),
            mode,
            image: test_image(),
        }
    }

    async fn wait_for(manager: &JobManager, job_id: &str, pred: impl Fn(&JobView) -> bool) -> JobView {
        for _ in 0..500 {
            let view = manager.get_status(job_id).unwrap();
            if pred(&view) {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached the expected state", job_id);
    }

    async fn wait_terminal(manager: &JobManager, job_id: &str) -> JobView {
        wait_for(manager, job_id, |v| v.status.is_terminal()).await
    }

    #[tokio::test]
    async fn test_submit_rejects_unknown_advisor_and_bad_image() {
        let h = harness();
        let err = h
            .manager
            .submit(SubmitRequest {
                advisor_id: "nobody".into(),
                ..request(AnalysisMode::Baseline)
            })
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = h
            .manager
            .submit(SubmitRequest {
                image: b"definitely not a jpeg".to_vec(),
                ..request(AnalysisMode::Baseline)
            })
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        assert!(h.manager.list(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_baseline_job_completes_without_retrieval() {
        let h = harness();
        let handle = h.manager.start().unwrap();

        let job_id = h.manager.submit(request(AnalysisMode::Baseline)).unwrap();
        let view = wait_terminal(&h.manager, &job_id).await;
        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.progress_percentage, 100);

        let job = h.manager.get_job(&job_id).unwrap();
        assert!(!job.enable_retrieval);
        assert!(job.retrieved_profile_ids.is_none());
        assert!(job.result.is_some());
        assert!(job.image_path.exists());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_sequence_follows_the_graph() {
        let h = harness();
        let mut events = h.manager.subscribe();
        let handle = h.manager.start().unwrap();

        let job_id = h.manager.submit(request(AnalysisMode::Rag)).unwrap();
        wait_terminal(&h.manager, &job_id).await;

        let mut views = Vec::new();
        while let Ok(view) = events.try_recv() {
            if view.job_id == job_id {
                views.push(view);
            }
        }
        let statuses: Vec<JobStatus> = views.iter().map(|v| v.status).collect();
        assert!(statuses.contains(&JobStatus::Analyzing));
        assert!(statuses.contains(&JobStatus::Processing));
        assert_eq!(statuses.last(), Some(&JobStatus::Completed));
        for pair in statuses.windows(2) {
            assert!(
                pair[0] == pair[1] || pair[0].can_transition_to(pair[1]),
                "{} -> {}",
                pair[0],
                pair[1]
            );
        }
        assert!(views.windows(2).all(|w| w[0].last_activity <= w[1].last_activity));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_adapter_unavailable_fails_without_analyzing() {
        let h = harness();
        let mut events = h.manager.subscribe();
        let handle = h.manager.start().unwrap();

        let job_id = h.manager.submit(request(AnalysisMode::Adapter)).unwrap();
        let view = wait_terminal(&h.manager, &job_id).await;
        assert_eq!(view.status, JobStatus::Failed);
        assert!(view.error.unwrap().contains("no adapter"));

        let job = h.manager.get_job(&job_id).unwrap();
        assert_eq!(job.attempt, 0);
        assert!(job.started_at.is_none());
        while let Ok(view) = events.try_recv() {
            assert!(!view.status.is_active(), "job entered {}", view.status);
        }
        assert!(h.provider.calls().is_empty());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_repeated_timeouts_exhaust_retries() {
        let h = harness_with(0.05);
        for _ in 0..3 {
            h.provider.push(MockResponse::Hang(Duration::from_millis(120)));
        }
        let handle = h.manager.start().unwrap();

        let job_id = h.manager.submit(request(AnalysisMode::Baseline)).unwrap();
        let view = wait_terminal(&h.manager, &job_id).await;
        assert_eq!(view.status, JobStatus::Failed);
        assert_eq!(view.retry_count, 3);
        assert!(view.error.as_deref().is_some_and(|e| !e.is_empty()));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let h = harness();
        h.provider.push(MockResponse::Unreachable);
        let handle = h.manager.start().unwrap();

        let job_id = h.manager.submit(request(AnalysisMode::Baseline)).unwrap();
        let view = wait_terminal(&h.manager, &job_id).await;
        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.retry_count, 1);
        assert_eq!(view.error, None);
        assert_eq!(h.provider.calls().len(), 2);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_engine_error_is_not_retried() {
        let h = harness();
        h.provider.push(MockResponse::Failed("HTTP 500: model crashed".into()));
        let handle = h.manager.start().unwrap();

        let job_id = h.manager.submit(request(AnalysisMode::Baseline)).unwrap();
        let view = wait_terminal(&h.manager, &job_id).await;
        assert_eq!(view.status, JobStatus::Failed);
        assert_eq!(view.retry_count, 0);
        assert!(view.error.unwrap().contains("model crashed"));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_at_most_one_active_job() {
        let h = harness();
        for _ in 0..3 {
            h.provider.push(MockResponse::Slow(Duration::from_millis(40)));
        }
        let handle = h.manager.start().unwrap();

        let ids: Vec<String> = (0..3)
            .map(|_| h.manager.submit(request(AnalysisMode::Baseline)).unwrap())
            .collect();

        let mut max_active = 0;
        loop {
            max_active = max_active.max(h.manager.db().count_active().unwrap());
            let views: Vec<_> = ids.iter().map(|id| h.manager.get_status(id).unwrap()).collect();
            if views.iter().all(|v| v.status.is_terminal()) {
                assert!(views.iter().all(|v| v.status == JobStatus::Completed));
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(max_active <= 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_is_forceful_and_final() {
        let h = harness();
        h.provider.push(MockResponse::Slow(Duration::from_millis(300)));
        let handle = h.manager.start().unwrap();

        let job_id = h.manager.submit(request(AnalysisMode::Baseline)).unwrap();
        wait_for(&h.manager, &job_id, |v| v.status == JobStatus::Processing).await;

        let view = h.manager.cancel(&job_id).unwrap();
        assert_eq!(view.status, JobStatus::Failed);
        assert_eq!(view.error.as_deref(), Some("cancelled by operator"));

        tokio::time::sleep(Duration::from_millis(400)).await;
        let view = h.manager.get_status(&job_id).unwrap();
        assert_eq!(view.status, JobStatus::Failed);

        assert!(matches!(
            h.manager.cancel(&job_id),
            Err(Error::InvalidTransition { .. })
        ));
        assert!(matches!(h.manager.cancel("missing"), Err(Error::NotFound(_))));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_job_after_cancel_waits_for_orphaned_call() {
        let h = harness_with_timeouts(TimeoutConfig {
            baseline_secs: 0.1,
            adapter_secs: 2.0,
            rag_secs: 2.0,
            rag_adapter_secs: 2.0,
        });
        h.manager.db().register_adapter("adams", "adams-lora").unwrap();
        h.provider.push(MockResponse::Slow(Duration::from_millis(500)));
        let handle = h.manager.start().unwrap();

        let slow_id = h.manager.submit(request(AnalysisMode::Adapter)).unwrap();
        wait_for(&h.manager, &slow_id, |v| v.status == JobStatus::Processing).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.manager.cancel(&slow_id).unwrap();

        // The next job's own timeout is far shorter than the orphaned call.
        let job_id = h.manager.submit(request(AnalysisMode::Baseline)).unwrap();
        let view = wait_terminal(&h.manager, &job_id).await;
        assert_eq!(view.status, JobStatus::Completed, "{:?}", view.error);
        assert_eq!(view.retry_count, 0);
        assert_eq!(h.provider.calls().len(), 2);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_insert_removes_uploaded_image() {
        let h = harness();
        h.manager
            .db()
            .conn()
            .execute_batch("DROP TABLE jobs;")
            .unwrap();

        assert!(h.manager.submit(request(AnalysisMode::Baseline)).is_err());
        let leftovers = std::fs::read_dir(h.uploads.path()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_operator_retry_requeues_processing_job() {
        let h = harness();
        h.provider.push(MockResponse::Slow(Duration::from_millis(200)));
        let handle = h.manager.start().unwrap();

        let job_id = h.manager.submit(request(AnalysisMode::Baseline)).unwrap();
        wait_for(&h.manager, &job_id, |v| v.status == JobStatus::Processing).await;

        let view = h.manager.retry(&job_id).unwrap();
        assert_eq!(view.retry_count, 1);

        let view = wait_terminal(&h.manager, &job_id).await;
        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.retry_count, 1);
        assert_eq!(h.manager.get_job(&job_id).unwrap().attempt, 2);

        assert!(matches!(
            h.manager.retry(&job_id),
            Err(Error::InvalidTransition { .. })
        ));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_fails_jobs_left_running() {
        let h = harness();
        let job_id = h.manager.submit(request(AnalysisMode::Baseline)).unwrap();
        h.manager.db().claim_job(&job_id, Utc::now()).unwrap();

        let handle = h.manager.start().unwrap();
        let view = h.manager.get_status(&job_id).unwrap();
        assert_eq!(view.status, JobStatus::Failed);
        assert_eq!(view.error.as_deref(), Some("interrupted by restart"));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_stalled_lists_idle_jobs_without_touching_them() {
        let mut h = harness();
        let inner = Arc::get_mut(&mut h.manager.inner).unwrap();
        inner.config.stall_threshold_secs = 0;

        let job_id = h.manager.submit(request(AnalysisMode::Baseline)).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let stalled = h.manager.stalled().unwrap();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].job_id, job_id);
        h.manager.inspect();
        assert_eq!(
            h.manager.get_status(&job_id).unwrap().status,
            JobStatus::Queued
        );
    }
}
