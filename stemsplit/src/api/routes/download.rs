//! Artifact download route.

use axum::{
    Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderValue, header},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::Utc;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::artifacts::parse_job_id;

pub fn router() -> Router<AppState> {
    Router::new().route("/download/{job_id}/{name}", get(download))
}

/// Content type for an artifact file extension.
fn content_type(extension: Option<&str>) -> &'static str {
    match extension.map(str::to_ascii_lowercase).as_deref() {
        Some("wav") => "audio/wav",
        Some("mp3") => "audio/mpeg",
        Some("flac") => "audio/flac",
        _ => "application/octet-stream",
    }
}

/// Stream one recorded artifact of a completed job.
///
/// `name` is only ever compared against the job's artifact list; it never
/// becomes part of a path.
async fn download(
    State(state): State<AppState>,
    Path((job_id, name)): Path<(String, String)>,
) -> ApiResult<Response> {
    let (Some(jobs), Some(artifacts)) = (&state.job_repository, &state.artifacts) else {
        return Err(ApiError::service_unavailable("Artifact storage not available"));
    };

    let job_id = parse_job_id(&job_id)?;
    let job = jobs.get_job(&job_id).await?;
    let artifact = artifacts.resolve(&job, &name, Utc::now()).await?;

    let file = tokio::fs::File::open(&artifact.path)
        .await
        .map_err(crate::Error::from)?;
    let extension = artifact.path.extension().and_then(|e| e.to_str());
    let filename = match extension {
        Some(ext) => format!("{}.{}", artifact.name, ext),
        None => artifact.name.clone(),
    };
    debug!(job_id = %job_id, artifact = %artifact.name, size = artifact.size, "Streaming artifact");

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type(extension)),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(artifact.size));
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{filename}\"")) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}
