//! Work API endpoint handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;

use crate::models::{JobStatus, WorkItemUpdate};
use crate::repository::{JobListFilter, RepositoryError};

use super::AppState;

/// Health check endpoint for container orchestration.
pub async fn health() -> impl IntoResponse {
    StatusCode::OK
}

/// Translate store errors to status codes.
pub(crate) struct ApiError(RepositoryError);

impl From<RepositoryError> for ApiError {
    fn from(e: RepositoryError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RepositoryError::NotFound(_) => StatusCode::NOT_FOUND,
            RepositoryError::IllegalStateTransition { .. } | RepositoryError::Conflict(_) => {
                StatusCode::CONFLICT
            }
            RepositoryError::Validation(_) => StatusCode::BAD_REQUEST,
            RepositoryError::Database(_)
            | RepositoryError::Serialization(_)
            | RepositoryError::System(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("work api error: {}", self.0);
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Query parameters for `GET /work`.
#[derive(Debug, Deserialize)]
pub struct GetWorkParams {
    #[serde(rename = "serviceID")]
    pub service_id: String,
}

/// `GET /work?serviceID=...`: claim one item for a service.
pub async fn get_work(
    State(state): State<AppState>,
    Query(params): Query<GetWorkParams>,
) -> Result<Response, ApiError> {
    match state.dispatcher.get_work(&params.service_id).await? {
        Some(message) => Ok(Json(message).into_response()),
        None => Ok(StatusCode::NOT_FOUND.into_response()),
    }
}

/// `PUT /work/:id`: accept a worker's status report.
///
/// The update is validated against the current item (404 unknown, 409
/// already terminal) and then queued; processing is asynchronous.
pub async fn update_work(
    State(state): State<AppState>,
    Path(id): Path<i32>,
    Json(mut update): Json<WorkItemUpdate>,
) -> Result<StatusCode, ApiError> {
    update.work_item_id = id;
    let item = state.ctx.work_items.get(id).await?;
    if item.status.is_terminal() {
        return Err(RepositoryError::Conflict(format!(
            "work item {id} is already {}",
            item.status.as_str()
        ))
        .into());
    }
    state.updater.enqueue(&update).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Query parameters for `GET /jobs`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListJobsParams {
    pub username: Option<String>,
    pub status: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

/// `GET /jobs`: list jobs, optionally for one user or status.
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<ListJobsParams>,
) -> Result<Response, ApiError> {
    let mut filter = JobListFilter::page(params.page.unwrap_or(1), params.per_page.unwrap_or(25));
    if let Some(status) = &params.status {
        let status = JobStatus::from_str(status).ok_or_else(|| {
            RepositoryError::Validation(format!("unknown job status {status:?}"))
        })?;
        filter = filter.with_status(status);
    }
    let page = match &params.username {
        Some(username) => state.orchestrator.list_jobs(username, &filter).await?,
        None => state.orchestrator.list_all_jobs(&filter).await?,
    };
    Ok(Json(serde_json::json!({
        "jobs": page.jobs,
        "total": page.total,
        "page": page.page,
        "perPage": page.per_page,
    }))
    .into_response())
}

/// `GET /jobs/:job_id`: one job with links, errors, and step counters.
pub async fn job_detail(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let job = state.orchestrator.get_job(&job_id).await?;
    let steps = state.orchestrator.job_steps(&job_id).await?;
    Ok(Json(serde_json::json!({ "job": job, "steps": steps })).into_response())
}

/// `GET /jobs/:job_id/items`: a job's work items.
pub async fn job_items(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    // 404 for unknown jobs rather than an empty list.
    state.orchestrator.get_job(&job_id).await?;
    let items = state.orchestrator.job_items(&job_id).await?;
    Ok(Json(serde_json::json!({ "items": items })).into_response())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::config::Settings;
    use crate::models::WorkflowStep;
    use crate::queue::MemoryQueueProvider;
    use crate::repository::{migrations, SqlitePool};
    use crate::server::{create_router, AppState};
    use crate::services::{CoreContext, JobRequest};

    use super::*;

    async fn setup() -> (axum::Router, AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = SqlitePool::from_path(&dir.path().join("test.db"));
        migrations::ensure_schema(&pool).await.unwrap();
        let ctx = CoreContext::new(
            Settings::default(),
            pool,
            Arc::new(MemoryQueueProvider::new()),
        );
        let state = AppState::new(ctx);
        (create_router(state.clone()), state, dir)
    }

    #[tokio::test]
    async fn get_work_is_404_when_idle() {
        let (app, _state, _dir) = setup().await;
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/work?serviceID=ghcr.io/example/subsetter:1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn get_work_returns_claimed_item() {
        let (app, state, _dir) = setup().await;
        state
            .orchestrator
            .create_job(JobRequest {
                username: "ada".to_string(),
                request_url: "https://example.com/req".to_string(),
                ignore_errors: false,
                num_input_granules: 1,
                collection_ids: vec![],
                steps: vec![WorkflowStep::new(1, "query-cmr", "{}").input_producer()],
                preview: false,
            })
            .await
            .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/work?serviceID=query-cmr")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn update_for_unknown_item_is_404() {
        let (app, _state, _dir) = setup().await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/work/999")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"status":"successful"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
