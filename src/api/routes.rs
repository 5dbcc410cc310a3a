use axum::{
    extract::{Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Response, Sse,
    },
    Json,
};
use chrono::{DateTime, Utc};
use futures::{future, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;

use super::render::{analysis_markdown, summary_text};
use super::{ApiError, AppState};
use crate::analysis::{AnalysisMode, AnalysisResult};
use crate::db::Coverage;
use crate::error::Error;
use crate::jobs::{JobStatus, JobView, SubmitRequest};

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

/// Lenient boolean for form fields.
pub(crate) fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "y" | "t" => Some(true),
        "0" | "false" | "no" | "off" | "n" | "f" | "" => Some(false),
        _ => None,
    }
}

async fn read_text(field: axum::extract::multipart::Field<'_>) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|e| ApiError::bad_request(format!("Read error: {}", e)))
}

pub async fn health(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let active = state.jobs.db().count_active()?;
    Ok(Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "active_jobs": active,
    })))
}

/// `POST /jobs`. Multipart fields: `image` (or `file`), `advisor`, `mode`,
/// `enable_rag`.
pub async fn submit_job(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let mut image: Option<Vec<u8>> = None;
    let mut advisor: Option<String> = None;
    let mut mode: Option<String> = None;
    let mut enable_rag: Option<bool> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Multipart error: {}", e)))?
    {
        let name = field.name().map(|n| n.to_string());
        match name.as_deref() {
            Some("image") | Some("file") => {
                image = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| ApiError::bad_request(format!("Read error: {}", e)))?
                        .to_vec(),
                );
            }
            Some("advisor") | Some("advisor_id") => {
                advisor = Some(read_text(field).await?.trim().to_string());
            }
            Some("mode") => mode = Some(read_text(field).await?),
            Some("enable_rag") => {
                let raw = read_text(field).await?;
                enable_rag = Some(parse_flag(&raw).ok_or_else(|| {
                    ApiError::bad_request(format!("enable_rag: '{}' is not a boolean", raw))
                })?);
            }
            _ => {}
        }
    }

    let image = image.ok_or_else(|| ApiError::bad_request("Missing image in multipart form"))?;
    let advisor_id = advisor
        .filter(|a| !a.is_empty())
        .ok_or_else(|| ApiError::bad_request("Missing advisor"))?;
    let mode = AnalysisMode::resolve(mode.as_deref(), enable_rag)?;

    let manager = state.jobs.clone();
    let job_id = tokio::task::spawn_blocking(move || {
        manager.submit(SubmitRequest {
            advisor_id,
            mode,
            image,
        })
    })
    .await
    .map_err(|e| Error::Internal(format!("submit task panicked: {}", e)))??;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "job_id": job_id, "mode": mode })),
    ))
}

pub async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    Ok(Json(state.jobs.get_status(&job_id)?))
}

/// Current status first, then every change until the job is terminal.
pub async fn status_stream(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    // Subscribe before the snapshot so no transition falls in between.
    let rx = state.jobs.subscribe();
    let initial = state.jobs.get_status(&job_id)?;

    let updates = BroadcastStream::new(rx).filter_map(move |event| {
        // Lagged receivers skip ahead; the next event carries full state.
        future::ready(event.ok().filter(|view| view.job_id == job_id))
    });

    let stream = futures::stream::unfold(
        (Some(initial), updates.boxed(), false),
        |(pending, mut updates, finished)| async move {
            if finished {
                return None;
            }
            let view = match pending {
                Some(view) => view,
                None => updates.next().await?,
            };
            let finished = view.status.is_terminal();
            Some((view, (None, updates, finished)))
        },
    )
    .map(|view| Event::default().event("status").json_data(view));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Deserialize)]
pub struct FormatQuery {
    pub format: Option<String>,
}

#[derive(Debug, Serialize)]
struct JobSummary {
    job_id: String,
    status: JobStatus,
    advisor: String,
    mode: AnalysisMode,
    enable_retrieval: bool,
    current_step: String,
    progress_percentage: u8,
    retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    overall_score: Option<f32>,
    image_citations: usize,
    quote_citations: usize,
}

fn text_response(content_type: &'static str, body: String) -> Response {
    ([(header::CONTENT_TYPE, content_type)], body).into_response()
}

pub async fn job_summary(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<FormatQuery>,
) -> Result<Response, ApiError> {
    let job = state.jobs.get_job(&job_id)?;
    let advisor_name = state
        .jobs
        .advisor(&job.advisor_id)
        .map(|a| a.display_name().to_string())
        .unwrap_or_else(|| job.advisor_id.clone());

    match query.format.as_deref().unwrap_or("json") {
        "json" => {
            let result = job.result.as_ref();
            let summary = JobSummary {
                overall_score: result.map(|r| r.overall_score),
                image_citations: result.map_or(0, AnalysisResult::image_citation_count),
                quote_citations: result.map_or(0, AnalysisResult::quote_citation_count),
                job_id: job.id,
                status: job.status,
                advisor: job.advisor_id,
                mode: job.mode,
                enable_retrieval: job.enable_retrieval,
                current_step: job.current_step,
                progress_percentage: job.progress_percentage,
                retry_count: job.retry_count,
                error: job.error,
                created_at: job.created_at,
                completed_at: job.completed_at,
            };
            Ok(Json(summary).into_response())
        }
        "text" => Ok(text_response(
            "text/plain; charset=utf-8",
            summary_text(&job, &advisor_name),
        )),
        other => Err(ApiError::bad_request(format!(
            "unknown format '{}'; use json or text",
            other
        ))),
    }
}

#[derive(Debug, Serialize)]
struct AnalysisResponse<'a> {
    job_id: &'a str,
    advisor: &'a str,
    mode: AnalysisMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    retrieved_profile_ids: Option<&'a [i64]>,
    analysis: &'a AnalysisResult,
}

pub async fn job_analysis(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<FormatQuery>,
) -> Result<Response, ApiError> {
    let job = state.jobs.get_job(&job_id)?;
    let result = match (&job.status, &job.result) {
        (JobStatus::Completed, Some(result)) => result,
        _ => {
            return Err(Error::NotReady(format!("{} ({})", job.id, job.status)).into());
        }
    };

    match query.format.as_deref().unwrap_or("json") {
        "json" => Ok(Json(AnalysisResponse {
            job_id: &job.id,
            advisor: &job.advisor_id,
            mode: job.mode,
            retrieved_profile_ids: job.retrieved_profile_ids.as_deref(),
            analysis: result,
        })
        .into_response()),
        "markdown" | "md" => {
            let advisor_name = state
                .jobs
                .advisor(&job.advisor_id)
                .map(|a| a.display_name().to_string())
                .unwrap_or_else(|| job.advisor_id.clone());
            Ok(text_response(
                "text/markdown; charset=utf-8",
                analysis_markdown(&job, result, &advisor_name),
            ))
        }
        other => Err(ApiError::bad_request(format!(
            "unknown format '{}'; use json or markdown",
            other
        ))),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<JobView>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    Ok(Json(state.jobs.list(limit)?))
}

pub async fn stalled_jobs(State(state): State<AppState>) -> Result<Json<Vec<JobView>>, ApiError> {
    Ok(Json(state.jobs.stalled()?))
}

pub async fn retry_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    let view = state.jobs.retry(&job_id)?;
    info!(job_id = %job_id, "Retry requested over HTTP");
    Ok(Json(view))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    let view = state.jobs.cancel(&job_id)?;
    info!(job_id = %job_id, "Cancel requested over HTTP");
    Ok(Json(view))
}

#[derive(Debug, Serialize)]
struct CoverageResponse {
    advisor_id: String,
    #[serde(flatten)]
    coverage: Coverage,
    complete: bool,
    passages: i64,
    adapter: Option<String>,
}

pub async fn advisor_coverage(
    State(state): State<AppState>,
    Path(advisor_id): Path<String>,
) -> Result<Response, ApiError> {
    if state.jobs.advisor(&advisor_id).is_none() {
        return Err(Error::NotFound(format!("advisor '{}'", advisor_id)).into());
    }
    let db = state.jobs.db();
    let coverage = db.verify_coverage(&advisor_id)?;
    let response = CoverageResponse {
        complete: coverage.is_complete(),
        passages: db.count_passages(&advisor_id)?,
        adapter: db.adapter_model(&advisor_id)?,
        advisor_id,
        coverage,
    };
    Ok(Json(response).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flag_spellings() {
        for truthy in ["1", "true", "TRUE", "yes", "on", "y", "t", " True "] {
            assert_eq!(parse_flag(truthy), Some(true), "{}", truthy);
        }
        for falsy in ["0", "false", "no", "off", "n", "f", ""] {
            assert_eq!(parse_flag(falsy), Some(false), "{}", falsy);
        }
        assert_eq!(parse_flag("maybe"), None);
    }
}
