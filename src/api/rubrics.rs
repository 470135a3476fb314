use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use uuid::Uuid;
use validator::Validate;

use crate::api::errors::ApiError;
use crate::api::guards::CurrentOwner;
use crate::core::state::AppState;
use crate::schemas::rubric::{ReorderRequest, RubricPayload, RubricResponse, RubricSummary};
use crate::services::rubrics;

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_rubrics).post(create_rubric))
        .route("/:rubric_id", get(get_rubric).put(update_rubric).delete(delete_rubric))
        .route("/:rubric_id/reorder", post(reorder_criteria))
}

async fn create_rubric(
    CurrentOwner(owner_id): CurrentOwner,
    State(state): State<AppState>,
    Json(payload): Json<RubricPayload>,
) -> Result<(StatusCode, Json<RubricResponse>), ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let snapshot = rubrics::create_rubric(&state, owner_id, payload.into_draft()).await?;
    Ok((StatusCode::CREATED, Json(RubricResponse::from(snapshot))))
}

async fn list_rubrics(
    CurrentOwner(owner_id): CurrentOwner,
    State(state): State<AppState>,
) -> Result<Json<Vec<RubricSummary>>, ApiError> {
    let rubrics = rubrics::list_rubrics(&state, owner_id).await?;
    Ok(Json(rubrics.into_iter().map(RubricSummary::from).collect()))
}

async fn get_rubric(
    Path(rubric_id): Path<Uuid>,
    CurrentOwner(owner_id): CurrentOwner,
    State(state): State<AppState>,
) -> Result<Json<RubricResponse>, ApiError> {
    let snapshot = rubrics::get_rubric(&state, owner_id, rubric_id).await?;
    Ok(Json(RubricResponse::from(snapshot)))
}

async fn update_rubric(
    Path(rubric_id): Path<Uuid>,
    CurrentOwner(owner_id): CurrentOwner,
    State(state): State<AppState>,
    Json(payload): Json<RubricPayload>,
) -> Result<Json<RubricResponse>, ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let snapshot =
        rubrics::update_rubric(&state, owner_id, rubric_id, payload.into_draft()).await?;
    Ok(Json(RubricResponse::from(snapshot)))
}

async fn reorder_criteria(
    Path(rubric_id): Path<Uuid>,
    CurrentOwner(owner_id): CurrentOwner,
    State(state): State<AppState>,
    Json(payload): Json<ReorderRequest>,
) -> Result<Json<RubricResponse>, ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let snapshot =
        rubrics::reorder_criteria(&state, owner_id, rubric_id, &payload.criterion_ids).await?;
    Ok(Json(RubricResponse::from(snapshot)))
}

async fn delete_rubric(
    Path(rubric_id): Path<Uuid>,
    CurrentOwner(owner_id): CurrentOwner,
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    rubrics::delete_rubric(&state, owner_id, rubric_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
