use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::patch,
    Json, Router,
};
use uuid::Uuid;
use validator::Validate;

use crate::api::errors::ApiError;
use crate::api::guards::CurrentOwner;
use crate::core::state::AppState;
use crate::schemas::review::{
    AnnotationRequest, AnnotationResponse, CriterionScoreResponse, OverrideRequest,
};
use crate::services::review;

pub(crate) fn scores_router() -> Router<AppState> {
    Router::new().route("/:score_id", patch(override_score))
}

pub(crate) fn annotations_router() -> Router<AppState> {
    Router::new().route("/:annotation_id", patch(update_annotation).delete(remove_annotation))
}

async fn override_score(
    Path(score_id): Path<Uuid>,
    CurrentOwner(owner_id): CurrentOwner,
    State(state): State<AppState>,
    Json(payload): Json<OverrideRequest>,
) -> Result<Json<CriterionScoreResponse>, ApiError> {
    let score = review::apply_override(&state, owner_id, score_id, payload.into()).await?;
    Ok(Json(CriterionScoreResponse::from(score)))
}

async fn update_annotation(
    Path(annotation_id): Path<Uuid>,
    CurrentOwner(owner_id): CurrentOwner,
    State(state): State<AppState>,
    Json(payload): Json<AnnotationRequest>,
) -> Result<Json<AnnotationResponse>, ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let annotation =
        review::update_annotation(&state, owner_id, annotation_id, payload.into()).await?;
    Ok(Json(AnnotationResponse::from(annotation)))
}

async fn remove_annotation(
    Path(annotation_id): Path<Uuid>,
    CurrentOwner(owner_id): CurrentOwner,
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    review::remove_annotation(&state, owner_id, annotation_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::db::models::Essay;
    use crate::db::types::{AssignmentStatus, EssayStatus};
    use crate::store::RubricSnapshot;
    use crate::test_support::{
        self, assignment_fixture, bearer_token, essay_fixture, graded_fixture, json_request,
        read_json, rubric_fixture, Harness,
    };

    async fn graded_essay(owner: Uuid) -> (Harness, RubricSnapshot, Essay) {
        let harness = test_support::harness().await;
        let rubric = rubric_fixture(owner, &[&[0, 1, 2]]);
        let mut assignment = assignment_fixture(&rubric);
        assignment.status = AssignmentStatus::Review;
        let mut essay = essay_fixture(&assignment, "ada.txt");
        essay.status = EssayStatus::Graded;
        essay.extracted_text = Some("Uniforms flatten expression.".to_string());
        harness.store.seed_rubric(rubric.clone());
        harness.store.seed_assignment(assignment);
        harness.store.seed_essay(essay.clone());
        harness.store.seed_graded(graded_fixture(&essay, &rubric, 0));
        (harness, rubric, essay)
    }

    #[tokio::test]
    async fn override_keeps_the_automated_slot() {
        let owner = Uuid::new_v4();
        let (harness, rubric, essay) = graded_essay(owner).await;
        let token = bearer_token(owner, harness.state.settings());
        let score = harness.store.graded(essay.id).scores[0].clone();
        let top_level = rubric.criteria[0].levels[2].id;

        let uri = format!("/api/v1/criterion-scores/{}", score.id);
        let response = harness
            .app()
            .oneshot(json_request(
                Method::PATCH,
                &uri,
                Some(&token),
                Some(json!({"teacher_level_id": top_level, "teacher_feedback": "Stronger than it looks"})),
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let json = read_json(response).await;
        assert_eq!(json["effective_level_id"], top_level.to_string());
        assert_eq!(json["ai_level_id"], score.ai_level_id.to_string());
        assert_eq!(json["ai_feedback"], score.ai_feedback);
        assert_eq!(json["overridden"], true);
    }

    #[tokio::test]
    async fn ai_annotation_cannot_be_edited_but_can_be_removed() {
        let owner = Uuid::new_v4();
        let (harness, _rubric, essay) = graded_essay(owner).await;
        let token = bearer_token(owner, harness.state.settings());
        let annotation = harness.store.seed_ai_annotation(&essay, 0, 8);

        let uri = format!("/api/v1/annotations/{}", annotation.id);
        let response = harness
            .app()
            .oneshot(json_request(
                Method::PATCH,
                &uri,
                Some(&token),
                Some(json!({"kind": "highlight", "start_offset": 1, "end_offset": 4})),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = harness
            .app()
            .oneshot(json_request(Method::DELETE, &uri, Some(&token), None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let list_uri = format!("/api/v1/essays/{}/annotations?include_removed=true", essay.id);
        let response = harness
            .app()
            .oneshot(json_request(Method::GET, &list_uri, Some(&token), None))
            .await
            .expect("response");
        let listed = read_json(response).await;
        assert_eq!(listed[0]["removed"], true);
        assert_eq!(listed[0]["removed_by"], owner.to_string());
    }
}
