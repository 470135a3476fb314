use uuid::Uuid;

use crate::core::state::AppState;
use crate::db::models::{Assignment, AssignmentListItem, Essay};
use crate::db::types::{AssignmentStatus, EssayStatus};
use crate::services::errors::ServiceError;
use crate::services::{rubric_validation, rubrics};
use crate::store::AssignmentChanges;
use crate::tasks::grading;

#[derive(Debug, Clone)]
pub(crate) struct AssignmentDraft {
    pub(crate) rubric_id: Uuid,
    pub(crate) title: String,
    pub(crate) prompt: String,
    pub(crate) source_text: Option<String>,
}

/// Fields left as `None` are unchanged. `source_text: Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub(crate) struct AssignmentPatch {
    pub(crate) title: Option<String>,
    pub(crate) prompt: Option<String>,
    pub(crate) source_text: Option<Option<String>>,
    pub(crate) rubric_id: Option<Uuid>,
}

fn require_text(value: &str, field: &str) -> Result<String, ServiceError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ServiceError::validation(format!("{field} must not be empty")));
    }
    Ok(trimmed.to_string())
}

pub(crate) async fn create_assignment(
    state: &AppState,
    owner_id: Uuid,
    draft: AssignmentDraft,
) -> Result<Assignment, ServiceError> {
    let title = require_text(&draft.title, "title")?;
    let prompt = require_text(&draft.prompt, "prompt")?;

    let rubric = rubrics::get_rubric(state, owner_id, draft.rubric_id).await?;
    rubric_validation::validate(&rubric)?;

    let now = state.now();
    let assignment = Assignment {
        id: Uuid::new_v4(),
        owner_id,
        rubric_id: rubric.rubric.id,
        title,
        prompt,
        source_text: draft.source_text.filter(|text| !text.trim().is_empty()),
        status: AssignmentStatus::Draft,
        created_at: now,
        updated_at: now,
    };
    state.store().insert_assignment(&assignment).await?;

    tracing::info!(%owner_id, assignment_id = %assignment.id, rubric_id = %assignment.rubric_id, "Assignment created");
    Ok(assignment)
}

pub(crate) async fn get_assignment(
    state: &AppState,
    owner_id: Uuid,
    assignment_id: Uuid,
) -> Result<Assignment, ServiceError> {
    state
        .store()
        .find_assignment(owner_id, assignment_id)
        .await?
        .ok_or(ServiceError::NotFound("assignment"))
}

pub(crate) async fn list_assignments(
    state: &AppState,
    owner_id: Uuid,
) -> Result<Vec<AssignmentListItem>, ServiceError> {
    Ok(state.store().list_assignments(owner_id).await?)
}

pub(crate) async fn update_assignment(
    state: &AppState,
    owner_id: Uuid,
    assignment_id: Uuid,
    patch: AssignmentPatch,
) -> Result<Assignment, ServiceError> {
    let title = patch.title.as_deref().map(|value| require_text(value, "title")).transpose()?;
    let prompt = patch.prompt.as_deref().map(|value| require_text(value, "prompt")).transpose()?;

    if let Some(rubric_id) = patch.rubric_id {
        let rubric = rubrics::get_rubric(state, owner_id, rubric_id).await?;
        rubric_validation::validate(&rubric)?;
    }

    let changes = AssignmentChanges {
        title,
        prompt,
        source_text: patch
            .source_text
            .map(|value| value.filter(|text| !text.trim().is_empty())),
        rubric_id: patch.rubric_id,
        updated_at: state.now(),
    };

    state
        .store()
        .update_assignment(owner_id, assignment_id, &changes)
        .await?
        .ok_or(ServiceError::NotFound("assignment"))
}

pub(crate) async fn delete_assignment(
    state: &AppState,
    owner_id: Uuid,
    assignment_id: Uuid,
) -> Result<(), ServiceError> {
    if !state.store().delete_assignment(owner_id, assignment_id).await? {
        return Err(ServiceError::NotFound("assignment"));
    }
    tracing::info!(%owner_id, assignment_id = %assignment_id, "Assignment deleted");
    Ok(())
}

pub(crate) async fn list_essays(
    state: &AppState,
    owner_id: Uuid,
    assignment_id: Uuid,
) -> Result<Vec<Essay>, ServiceError> {
    get_assignment(state, owner_id, assignment_id).await?;
    Ok(state.store().list_essays(owner_id, assignment_id).await?)
}

/// Removes an essay, its grading data and its stored file. Essays being graded right now
/// cannot be removed.
pub(crate) async fn delete_essay(
    state: &AppState,
    owner_id: Uuid,
    essay_id: Uuid,
) -> Result<(), ServiceError> {
    let essay =
        state.store().find_essay(owner_id, essay_id).await?.ok_or(ServiceError::NotFound("essay"))?;

    if essay.status == EssayStatus::Processing {
        return Err(ServiceError::Conflict("essay is being graded".to_string()));
    }

    let deleted = state
        .store()
        .delete_essay(owner_id, essay_id)
        .await?
        .ok_or_else(|| ServiceError::Conflict("essay is being graded".to_string()))?;

    if let (Some(key), Some(storage)) = (deleted.storage_key.as_deref(), state.storage()) {
        if let Err(err) = storage.delete(key).await {
            tracing::warn!(error = %err, essay_id = %essay_id, storage_key = key, "Failed to delete essay file");
        }
    }

    grading::recompute_assignment_status(state, deleted.assignment_id).await?;
    tracing::info!(%owner_id, essay_id = %essay_id, assignment_id = %deleted.assignment_id, "Essay deleted");
    Ok(())
}
