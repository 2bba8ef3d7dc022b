//! Job submission and status routes.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | POST | `/separate` | Submit a URL for separation |
//! | GET | `/status/{job_id}` | Current state of a job |
//! | GET | `/jobs` | Newest-first job listing (credential required) |

use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    routing::{get, post},
};
use chrono::Utc;

use crate::api::error::{ApiError, ApiResult};
use crate::api::middleware::{ClientIdentity, Credential};
use crate::api::models::{
    JobListQuery, JobListResponse, SeparateRequest, SeparateResponse, StatusResponse, status_url,
};
use crate::api::server::AppState;
use crate::database::repositories::{JobFilter, MAX_LIST_LIMIT};
use crate::domain::JobStatus;
use crate::services::JobService;

const DEFAULT_LIST_LIMIT: i64 = 20;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/separate", post(submit))
        .route("/status/{job_id}", get(status))
        .route("/jobs", get(list_jobs))
}

fn job_service(state: &AppState) -> ApiResult<&JobService> {
    state
        .job_service
        .as_deref()
        .ok_or_else(|| ApiError::service_unavailable("Job service not available"))
}

/// Admit, deduplicate and enqueue a submission.
async fn submit(
    State(state): State<AppState>,
    ClientIdentity(client): ClientIdentity,
    credential: Credential,
    body: Result<Json<SeparateRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<SeparateResponse>)> {
    let service = job_service(&state)?;
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            // A bad credential is a 401 whatever the payload.
            service.admission().authenticate(credential.as_deref())?;
            return Err(ApiError::invalid_input(rejection.body_text()));
        }
    };

    let submission = service
        .submit(&client, credential.as_deref(), &request.url)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SeparateResponse {
            status_url: status_url(&submission.job_id),
            job_id: submission.job_id,
            status: submission.status,
            deduplicated: !submission.is_new,
        }),
    ))
}

async fn status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<StatusResponse>> {
    let job = job_service(&state)?.status(&job_id).await?;
    Ok(Json(StatusResponse::from_job(job, Utc::now())))
}

async fn list_jobs(
    State(state): State<AppState>,
    credential: Credential,
    Query(query): Query<JobListQuery>,
) -> ApiResult<Json<JobListResponse>> {
    let service = job_service(&state)?;
    service.admission().authenticate(credential.as_deref())?;

    let status = match query.status.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => Some(
            JobStatus::parse(&raw.to_ascii_lowercase())
                .ok_or_else(|| ApiError::invalid_input(format!("unknown status '{raw}'")))?,
        ),
        None => None,
    };
    let filter = JobFilter {
        status,
        owner_client: None,
        limit: query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT),
        offset: query.offset.unwrap_or(0).max(0),
    };

    let jobs = service.list(&filter).await?;
    Ok(Json(JobListResponse {
        items: jobs.into_iter().map(Into::into).collect(),
        limit: filter.limit,
        offset: filter.offset,
    }))
}
