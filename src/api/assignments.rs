use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use uuid::Uuid;
use validator::Validate;

use crate::api::errors::ApiError;
use crate::api::guards::CurrentOwner;
use crate::core::redis::ThrottledAction;
use crate::core::state::AppState;
use crate::schemas::assignment::{
    AssignmentCreate, AssignmentListEntry, AssignmentResponse, AssignmentUpdate, BatchResponse,
    EssayResponse, ProgressResponse, UploadResponse,
};
use crate::schemas::review::ExportResponse;
use crate::services::ingestion::{self, UploadedFile};
use crate::services::{assignments, review};
use crate::tasks::grading;

/// Multipart overhead allowed on top of the total upload size.
const MULTIPART_SLACK_BYTES: usize = 1024 * 1024;

pub(crate) fn router(state: &AppState) -> Router<AppState> {
    let upload_limit = usize::try_from(state.settings().storage().max_total_upload_bytes())
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_SLACK_BYTES);

    Router::new()
        .route("/", get(list_assignments).post(create_assignment))
        .route(
            "/:assignment_id",
            get(get_assignment).patch(update_assignment).delete(delete_assignment),
        )
        .route(
            "/:assignment_id/essays",
            get(list_essays).post(upload_essays).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route(
            "/:assignment_id/grading",
            get(grading_progress).post(start_grading).delete(cancel_grading),
        )
        .route("/:assignment_id/export", get(export_assignment))
}

async fn create_assignment(
    CurrentOwner(owner_id): CurrentOwner,
    State(state): State<AppState>,
    Json(payload): Json<AssignmentCreate>,
) -> Result<(StatusCode, Json<AssignmentResponse>), ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let assignment = assignments::create_assignment(&state, owner_id, payload.into_draft()).await?;
    Ok((StatusCode::CREATED, Json(AssignmentResponse::from(assignment))))
}

async fn list_assignments(
    CurrentOwner(owner_id): CurrentOwner,
    State(state): State<AppState>,
) -> Result<Json<Vec<AssignmentListEntry>>, ApiError> {
    let items = assignments::list_assignments(&state, owner_id).await?;
    Ok(Json(items.into_iter().map(AssignmentListEntry::from).collect()))
}

async fn get_assignment(
    Path(assignment_id): Path<Uuid>,
    CurrentOwner(owner_id): CurrentOwner,
    State(state): State<AppState>,
) -> Result<Json<AssignmentResponse>, ApiError> {
    let assignment = assignments::get_assignment(&state, owner_id, assignment_id).await?;
    Ok(Json(AssignmentResponse::from(assignment)))
}

async fn update_assignment(
    Path(assignment_id): Path<Uuid>,
    CurrentOwner(owner_id): CurrentOwner,
    State(state): State<AppState>,
    Json(payload): Json<AssignmentUpdate>,
) -> Result<Json<AssignmentResponse>, ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let assignment =
        assignments::update_assignment(&state, owner_id, assignment_id, payload.into_patch())
            .await?;
    Ok(Json(AssignmentResponse::from(assignment)))
}

async fn delete_assignment(
    Path(assignment_id): Path<Uuid>,
    CurrentOwner(owner_id): CurrentOwner,
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    assignments::delete_assignment(&state, owner_id, assignment_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_essays(
    Path(assignment_id): Path<Uuid>,
    CurrentOwner(owner_id): CurrentOwner,
    State(state): State<AppState>,
) -> Result<Json<Vec<EssayResponse>>, ApiError> {
    let essays = assignments::list_essays(&state, owner_id, assignment_id).await?;
    Ok(Json(essays.into_iter().map(EssayResponse::from).collect()))
}

async fn upload_essays(
    Path(assignment_id): Path<Uuid>,
    CurrentOwner(owner_id): CurrentOwner,
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), ApiError> {
    let per_minute = state.settings().storage().upload_limit_per_minute;
    if !state.redis().allow(ThrottledAction::Upload, owner_id, per_minute).await {
        return Err(ApiError::TooManyRequests("Too many uploads, try again in a minute"));
    }

    let mut files = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| ApiError::BadRequest("Invalid multipart data".to_string()))?
    {
        let Some(name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let content_type = field.content_type().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|_| ApiError::BadRequest("Failed to read uploaded file".to_string()))?;
        files.push(UploadedFile { name, content_type, bytes: bytes.to_vec() });
    }

    let report = ingestion::ingest(&state, owner_id, assignment_id, files).await?;
    tracing::info!(
        %owner_id,
        assignment_id = %assignment_id,
        created = report.created.len(),
        skipped = report.skipped.len(),
        "Essays uploaded"
    );
    Ok((StatusCode::CREATED, Json(UploadResponse::from(report))))
}

async fn start_grading(
    Path(assignment_id): Path<Uuid>,
    CurrentOwner(owner_id): CurrentOwner,
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<BatchResponse>), ApiError> {
    let per_minute = state.settings().grading().batch_start_limit_per_minute;
    if !state.redis().allow(ThrottledAction::BatchStart, owner_id, per_minute).await {
        return Err(ApiError::TooManyRequests("Too many grading runs, try again in a minute"));
    }

    let handle = grading::run_batch(&state, owner_id, assignment_id).await?;
    Ok((StatusCode::ACCEPTED, Json(BatchResponse::from(handle))))
}

async fn grading_progress(
    Path(assignment_id): Path<Uuid>,
    CurrentOwner(owner_id): CurrentOwner,
    State(state): State<AppState>,
) -> Result<Json<ProgressResponse>, ApiError> {
    let progress = grading::batch_progress(&state, owner_id, assignment_id).await?;
    Ok(Json(ProgressResponse::from(progress)))
}

async fn cancel_grading(
    Path(assignment_id): Path<Uuid>,
    CurrentOwner(owner_id): CurrentOwner,
    State(state): State<AppState>,
) -> Result<Json<AssignmentResponse>, ApiError> {
    let assignment = grading::cancel_batch(&state, owner_id, assignment_id).await?;
    Ok(Json(AssignmentResponse::from(assignment)))
}

async fn export_assignment(
    Path(assignment_id): Path<Uuid>,
    CurrentOwner(owner_id): CurrentOwner,
    State(state): State<AppState>,
) -> Result<Json<ExportResponse>, ApiError> {
    let sheet = review::export_assignment(&state, owner_id, assignment_id).await?;
    Ok(Json(ExportResponse::from(sheet)))
}
