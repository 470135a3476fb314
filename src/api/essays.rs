use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use uuid::Uuid;
use validator::Validate;

use crate::api::errors::ApiError;
use crate::api::guards::CurrentOwner;
use crate::core::state::AppState;
use crate::schemas::assignment::EssayResponse;
use crate::schemas::review::{
    AnnotationListQuery, AnnotationRequest, AnnotationResponse, EssayReviewResponse,
};
use crate::services::{assignments, review};
use crate::tasks::grading;

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/:essay_id", get(get_essay).delete(delete_essay))
        .route("/:essay_id/retry", post(retry_essay))
        .route("/:essay_id/approve", post(approve_essay))
        .route("/:essay_id/annotations", get(list_annotations).post(add_annotation))
}

async fn get_essay(
    Path(essay_id): Path<Uuid>,
    CurrentOwner(owner_id): CurrentOwner,
    State(state): State<AppState>,
) -> Result<Json<EssayReviewResponse>, ApiError> {
    let view = review::essay_review(&state, owner_id, essay_id).await?;
    Ok(Json(EssayReviewResponse::from(view)))
}

async fn delete_essay(
    Path(essay_id): Path<Uuid>,
    CurrentOwner(owner_id): CurrentOwner,
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    assignments::delete_essay(&state, owner_id, essay_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn retry_essay(
    Path(essay_id): Path<Uuid>,
    CurrentOwner(owner_id): CurrentOwner,
    State(state): State<AppState>,
) -> Result<Json<EssayResponse>, ApiError> {
    let essay = grading::retry_essay(&state, owner_id, essay_id).await?;
    Ok(Json(EssayResponse::from(essay)))
}

async fn approve_essay(
    Path(essay_id): Path<Uuid>,
    CurrentOwner(owner_id): CurrentOwner,
    State(state): State<AppState>,
) -> Result<Json<EssayResponse>, ApiError> {
    let essay = review::approve(&state, owner_id, essay_id).await?;
    Ok(Json(EssayResponse::from(essay)))
}

async fn add_annotation(
    Path(essay_id): Path<Uuid>,
    CurrentOwner(owner_id): CurrentOwner,
    State(state): State<AppState>,
    Json(payload): Json<AnnotationRequest>,
) -> Result<(StatusCode, Json<AnnotationResponse>), ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let annotation = review::add_annotation(&state, owner_id, essay_id, payload.into()).await?;
    Ok((StatusCode::CREATED, Json(AnnotationResponse::from(annotation))))
}

async fn list_annotations(
    Path(essay_id): Path<Uuid>,
    Query(query): Query<AnnotationListQuery>,
    CurrentOwner(owner_id): CurrentOwner,
    State(state): State<AppState>,
) -> Result<Json<Vec<AnnotationResponse>>, ApiError> {
    let annotations =
        review::list_annotations(&state, owner_id, essay_id, query.include_removed).await?;
    Ok(Json(annotations.into_iter().map(AnnotationResponse::from).collect()))
}
