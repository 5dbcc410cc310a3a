//! Job records. Every mutating call is guarded by the expected status and,
//! for executor writes, by the claim attempt, so late writes from an
//! abandoned executor are dropped instead of clobbering newer state.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{get_opt_timestamp, get_timestamp, timestamp, Database};
use crate::analysis::{AnalysisMode, AnalysisResult};
use crate::error::{Error, Result};
use crate::jobs::{Job, JobStatus};

const JOB_COLUMNS: &str = r#"
    id, advisor_id, mode, enable_retrieval, status, current_step,
    progress_percentage, retry_count, attempt, error, image_path, image_sha256,
    result, retrieved_profile_ids, created_at, started_at, completed_at,
    last_activity, available_at
"#;

const ACTIVE_STATUSES: &str = "('analyzing', 'processing')";
const LIVE_STATUSES: &str = "('pending', 'queued', 'analyzing', 'processing')";

#[derive(Debug, Clone)]
pub struct NewJob<'a> {
    pub id: &'a str,
    pub advisor_id: &'a str,
    pub mode: AnalysisMode,
    pub image_path: &'a Path,
    pub image_sha256: &'a str,
}

/// What happened when a transient failure tried to re-queue a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Parked in `queued` with this retry count.
    Requeued(u32),
    /// Retry budget spent; the job is now `failed` with this retry count.
    Exhausted(u32),
    /// The job moved on (cancelled, re-claimed) before the retry landed.
    Abandoned,
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, message.into())
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let mode: String = row.get(2)?;
    let mode = mode
        .parse::<AnalysisMode>()
        .map_err(|e| conversion_error(2, e.to_string()))?;
    let status: String = row.get(4)?;
    let status = JobStatus::from_str(&status)
        .ok_or_else(|| conversion_error(4, format!("unknown job status '{}'", status)))?;

    let result: Option<String> = row.get(12)?;
    let result = result
        .map(|json| serde_json::from_str::<AnalysisResult>(&json))
        .transpose()
        .map_err(|e| conversion_error(12, e.to_string()))?;
    let retrieved: Option<String> = row.get(13)?;
    let retrieved = retrieved
        .map(|json| serde_json::from_str::<Vec<i64>>(&json))
        .transpose()
        .map_err(|e| conversion_error(13, e.to_string()))?;
    let image_path: String = row.get(10)?;

    Ok(Job {
        id: row.get(0)?,
        advisor_id: row.get(1)?,
        mode,
        enable_retrieval: row.get(3)?,
        status,
        current_step: row.get(5)?,
        progress_percentage: row.get::<_, i64>(6)?.clamp(0, 100) as u8,
        retry_count: row.get(7)?,
        attempt: row.get(8)?,
        error: row.get(9)?,
        image_path: PathBuf::from(image_path),
        image_sha256: row.get(11)?,
        result,
        retrieved_profile_ids: retrieved,
        created_at: get_timestamp(row, 14)?,
        started_at: get_opt_timestamp(row, 15)?,
        completed_at: get_opt_timestamp(row, 16)?,
        last_activity: get_timestamp(row, 17)?,
        available_at: get_timestamp(row, 18)?,
    })
}

fn check_edge(job_id: &str, from: JobStatus, to: JobStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            job_id: job_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

impl Database {
    pub fn insert_job(&self, job: &NewJob<'_>, now: DateTime<Utc>) -> Result<()> {
        let now = timestamp(now);
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO jobs (
                id, advisor_id, mode, enable_retrieval, status, current_step,
                progress_percentage, image_path, image_sha256,
                created_at, last_activity, available_at
            )
            VALUES (?1, ?2, ?3, ?4, 'pending', 'validated', 0, ?5, ?6, ?7, ?7, ?7)
            "#,
            params![
                job.id,
                job.advisor_id,
                job.mode.as_str(),
                job.mode.uses_retrieval(),
                job.image_path.to_string_lossy(),
                job.image_sha256,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let conn = self.conn();
        let job = conn
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS),
                [job_id],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// Most recent jobs first.
    pub fn list_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM jobs ORDER BY created_at DESC, id LIMIT ?",
            JOB_COLUMNS
        ))?;
        let jobs = stmt
            .query_map([limit as i64], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    pub fn count_active(&self) -> Result<i64> {
        let conn = self.conn();
        let count = conn.query_row(
            &format!("SELECT COUNT(*) FROM jobs WHERE status IN {}", ACTIVE_STATUSES),
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Oldest queued job whose backoff has elapsed.
    pub fn next_claimable(&self, now: DateTime<Utc>) -> Result<Option<Job>> {
        let conn = self.conn();
        let job = conn
            .query_row(
                &format!(
                    r#"
                    SELECT {} FROM jobs
                    WHERE status = 'queued' AND available_at <= ?
                    ORDER BY created_at, id
                    LIMIT 1
                    "#,
                    JOB_COLUMNS
                ),
                [timestamp(now)],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// `pending -> queued`.
    pub fn enqueue_job(&self, job_id: &str, now: DateTime<Utc>) -> Result<bool> {
        check_edge(job_id, JobStatus::Pending, JobStatus::Queued)?;
        let conn = self.conn();
        let changed = conn.execute(
            r#"
            UPDATE jobs
            SET status = 'queued', current_step = 'queued',
                last_activity = MAX(last_activity, ?2)
            WHERE id = ?1 AND status = 'pending'
            "#,
            params![job_id, timestamp(now)],
        )?;
        Ok(changed == 1)
    }

    /// Take the single inference slot for a queued job.
    ///
    /// Succeeds only if no other job is analyzing or processing; the check
    /// and the update are one statement. Returns the new attempt token.
    pub fn claim_job(&self, job_id: &str, now: DateTime<Utc>) -> Result<Option<u32>> {
        check_edge(job_id, JobStatus::Queued, JobStatus::Analyzing)?;
        let now = timestamp(now);
        let conn = self.conn();
        let attempt = conn
            .query_row(
                &format!(
                    r#"
                    UPDATE jobs
                    SET status = 'analyzing',
                        attempt = attempt + 1,
                        current_step = 'claimed',
                        progress_percentage = 5,
                        started_at = COALESCE(started_at, ?2),
                        last_activity = MAX(last_activity, ?2)
                    WHERE id = ?1
                      AND status = 'queued'
                      AND available_at <= ?2
                      AND NOT EXISTS (SELECT 1 FROM jobs WHERE status IN {})
                    RETURNING attempt
                    "#,
                    ACTIVE_STATUSES
                ),
                params![job_id, now],
                |row| row.get(0),
            )
            .optional()?;
        Ok(attempt)
    }

    /// Record progress for the active attempt. Progress never moves backwards
    /// within an attempt.
    pub fn update_job_step(
        &self,
        job_id: &str,
        attempt: u32,
        step: &str,
        progress: u8,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            &format!(
                r#"
                UPDATE jobs
                SET current_step = ?3,
                    progress_percentage = MAX(progress_percentage, ?4),
                    last_activity = MAX(last_activity, ?5)
                WHERE id = ?1 AND attempt = ?2 AND status IN {}
                "#,
                ACTIVE_STATUSES
            ),
            params![job_id, attempt, step, progress.min(100), timestamp(now)],
        )?;
        Ok(changed == 1)
    }

    /// `analyzing -> processing`, marking the start of the inference call.
    pub fn mark_job_processing(
        &self,
        job_id: &str,
        attempt: u32,
        step: &str,
        progress: u8,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        check_edge(job_id, JobStatus::Analyzing, JobStatus::Processing)?;
        let conn = self.conn();
        let changed = conn.execute(
            r#"
            UPDATE jobs
            SET status = 'processing',
                current_step = ?3,
                progress_percentage = MAX(progress_percentage, ?4),
                last_activity = MAX(last_activity, ?5)
            WHERE id = ?1 AND attempt = ?2 AND status = 'analyzing'
            "#,
            params![job_id, attempt, step, progress.min(100), timestamp(now)],
        )?;
        Ok(changed == 1)
    }

    /// `processing -> completed`, storing the result.
    pub fn complete_job(
        &self,
        job_id: &str,
        attempt: u32,
        result: &AnalysisResult,
        retrieved_profile_ids: Option<&[i64]>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        check_edge(job_id, JobStatus::Processing, JobStatus::Completed)?;
        let result_json = serde_json::to_string(result)?;
        let retrieved_json = retrieved_profile_ids
            .map(serde_json::to_string)
            .transpose()?;
        let now = timestamp(now);

        let conn = self.conn();
        let changed = conn.execute(
            r#"
            UPDATE jobs
            SET status = 'completed',
                current_step = 'done',
                progress_percentage = 100,
                error = NULL,
                result = ?3,
                retrieved_profile_ids = ?4,
                completed_at = ?5,
                last_activity = MAX(last_activity, ?5)
            WHERE id = ?1 AND attempt = ?2 AND status = 'processing'
            "#,
            params![job_id, attempt, result_json, retrieved_json, now],
        )?;
        Ok(changed == 1)
    }

    /// Fail a live job. With `attempt`, only the executor holding that claim
    /// may fail it; operator calls pass `None`.
    pub fn fail_job(
        &self,
        job_id: &str,
        attempt: Option<u32>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let now = timestamp(now);
        let conn = self.conn();
        let changed = conn.execute(
            &format!(
                r#"
                UPDATE jobs
                SET status = 'failed',
                    current_step = 'failed',
                    error = ?3,
                    completed_at = ?4,
                    last_activity = MAX(last_activity, ?4)
                WHERE id = ?1
                  AND status IN {}
                  AND (?2 IS NULL OR attempt = ?2)
                "#,
                LIVE_STATUSES
            ),
            params![job_id, attempt, error, now],
        )?;
        Ok(changed == 1)
    }

    /// Send a processing job back through the bounded retry edge.
    ///
    /// Increments `retry_count`; when that reaches `max_retries` the job fails
    /// with `error` instead. `backoff` maps the new retry count to the delay
    /// before the job becomes claimable again.
    pub fn requeue_job(
        &self,
        job_id: &str,
        attempt: Option<u32>,
        error: &str,
        max_retries: u32,
        backoff: impl Fn(u32) -> Duration,
        now: DateTime<Utc>,
    ) -> Result<RetryOutcome> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let current: Option<(String, u32, u32)> = tx
            .query_row(
                "SELECT status, retry_count, attempt FROM jobs WHERE id = ?",
                [job_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((status, retry_count, current_attempt)) = current else {
            return Err(Error::NotFound(format!("job {}", job_id)));
        };
        if status != JobStatus::Processing.as_str()
            || attempt.is_some_and(|a| a != current_attempt)
        {
            return Ok(RetryOutcome::Abandoned);
        }

        let retries = retry_count + 1;
        let stamp = timestamp(now);
        let outcome = if retries >= max_retries {
            tx.execute(
                r#"
                UPDATE jobs
                SET status = 'failed',
                    current_step = 'failed',
                    retry_count = ?2,
                    error = ?3,
                    completed_at = ?4,
                    last_activity = MAX(last_activity, ?4)
                WHERE id = ?1
                "#,
                params![job_id, retries, error, stamp],
            )?;
            RetryOutcome::Exhausted(retries)
        } else {
            let delay = chrono::Duration::from_std(backoff(retries))
                .unwrap_or_else(|_| chrono::Duration::zero());
            tx.execute(
                r#"
                UPDATE jobs
                SET status = 'queued',
                    current_step = ?5,
                    progress_percentage = 0,
                    retry_count = ?2,
                    error = ?3,
                    available_at = ?6,
                    last_activity = MAX(last_activity, ?4)
                WHERE id = ?1
                "#,
                params![
                    job_id,
                    retries,
                    error,
                    stamp,
                    format!("retry {} of {} scheduled", retries, max_retries - 1),
                    timestamp(now + delay),
                ],
            )?;
            RetryOutcome::Requeued(retries)
        };

        tx.commit()?;
        Ok(outcome)
    }

    /// Make a queued job claimable immediately, skipping any backoff.
    pub fn nudge_job(&self, job_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let now = timestamp(now);
        let conn = self.conn();
        let changed = conn.execute(
            r#"
            UPDATE jobs
            SET available_at = ?2, last_activity = MAX(last_activity, ?2)
            WHERE id = ?1 AND status = 'queued'
            "#,
            params![job_id, now],
        )?;
        Ok(changed == 1)
    }

    /// Live jobs idle since before `cutoff`.
    pub fn stalled_jobs(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {} FROM jobs
            WHERE status IN ('queued', 'analyzing', 'processing') AND last_activity < ?
            ORDER BY last_activity
            "#,
            JOB_COLUMNS
        ))?;
        let jobs = stmt
            .query_map([timestamp(cutoff)], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// Fail jobs a previous process left holding the inference slot.
    pub fn fail_interrupted_jobs(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let now = timestamp(now);
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            r#"
            UPDATE jobs
            SET status = 'failed',
                current_step = 'failed',
                error = 'interrupted by restart',
                completed_at = ?1,
                last_activity = MAX(last_activity, ?1)
            WHERE status IN {}
            RETURNING id
            "#,
            ACTIVE_STATUSES
        ))?;
        let ids = stmt
            .query_map([now], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }
}
