//! Teacher review: score overrides, approval, annotations and the export gate.
//!
//! The automated slot of a criterion score is never rewritten here. Everything a teacher does
//! lands in the teacher slot or in teacher-origin annotations, and only while the essay is
//! `graded`; approval freezes it.

use std::collections::HashMap;

use uuid::Uuid;

use crate::core::state::AppState;
use crate::db::models::{
    Annotation, Assignment, CriterionLevel, CriterionScore, Essay, GradingResult,
};
use crate::db::types::{AnnotationKind, AnnotationOrigin, AssignmentStatus, EssayStatus};
use crate::services::errors::ServiceError;
use crate::services::grader::validate_span;
use crate::store::{AnnotationChanges, RubricSnapshot};
use crate::tasks::grading::recompute_assignment_status;

#[derive(Debug, Clone)]
pub(crate) struct OverrideInput {
    pub(crate) teacher_level_id: Option<Uuid>,
    pub(crate) teacher_feedback: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct AnnotationInput {
    pub(crate) kind: AnnotationKind,
    pub(crate) start_offset: i32,
    pub(crate) end_offset: i32,
    pub(crate) comment: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct CriterionReview {
    pub(crate) criterion_id: Uuid,
    pub(crate) name: String,
    pub(crate) max_score: i32,
    pub(crate) score: CriterionScore,
    pub(crate) ai_level: Option<CriterionLevel>,
    pub(crate) teacher_level: Option<CriterionLevel>,
    pub(crate) effective_level: Option<CriterionLevel>,
}

#[derive(Debug, Clone)]
pub(crate) struct EssayReview {
    pub(crate) essay: Essay,
    pub(crate) result: Option<GradingResult>,
    pub(crate) criteria: Vec<CriterionReview>,
    pub(crate) total_score: Option<i64>,
    pub(crate) max_score: i64,
    pub(crate) annotations: Vec<Annotation>,
}

#[derive(Debug, Clone)]
pub(crate) struct ExportColumn {
    pub(crate) criterion_id: Uuid,
    pub(crate) name: String,
    pub(crate) max_score: i32,
}

#[derive(Debug, Clone)]
pub(crate) struct ExportCell {
    pub(crate) criterion_id: Uuid,
    pub(crate) score: i32,
    pub(crate) feedback: String,
}

#[derive(Debug, Clone)]
pub(crate) struct ExportRow {
    pub(crate) essay_id: Uuid,
    pub(crate) student_name: String,
    pub(crate) file_name: String,
    pub(crate) cells: Vec<ExportCell>,
    pub(crate) total: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct ExportSheet {
    pub(crate) assignment: Assignment,
    pub(crate) columns: Vec<ExportColumn>,
    pub(crate) rows: Vec<ExportRow>,
    pub(crate) max_total: i64,
}

async fn owned_essay(state: &AppState, owner_id: Uuid, essay_id: Uuid) -> Result<Essay, ServiceError> {
    state.store().find_essay(owner_id, essay_id).await?.ok_or(ServiceError::NotFound("essay"))
}

async fn rubric_for(state: &AppState, essay: &Essay) -> Result<RubricSnapshot, ServiceError> {
    let assignment = state
        .store()
        .find_assignment(essay.owner_id, essay.assignment_id)
        .await?
        .ok_or(ServiceError::NotFound("assignment"))?;
    state
        .store()
        .find_rubric(essay.owner_id, assignment.rubric_id)
        .await?
        .ok_or(ServiceError::NotFound("rubric"))
}

fn require_graded(essay: &Essay) -> Result<(), ServiceError> {
    if essay.status != EssayStatus::Graded {
        return Err(ServiceError::Conflict(format!(
            "essay is {}; review edits are accepted only while it is graded",
            essay.status.as_str()
        )));
    }
    Ok(())
}

fn normalized_comment(comment: Option<String>) -> Option<String> {
    comment.map(|text| text.trim().to_string()).filter(|text| !text.is_empty())
}

/// Writes the teacher slot of one criterion score. Passing `None` for both fields clears the
/// override.
pub(crate) async fn apply_override(
    state: &AppState,
    owner_id: Uuid,
    score_id: Uuid,
    input: OverrideInput,
) -> Result<CriterionScore, ServiceError> {
    let (score, essay) = state
        .store()
        .find_criterion_score(owner_id, score_id)
        .await?
        .ok_or(ServiceError::NotFound("criterion score"))?;
    require_graded(&essay)?;

    if let Some(level_id) = input.teacher_level_id {
        let rubric = rubric_for(state, &essay).await?;
        let criterion = rubric
            .criterion(score.criterion_id)
            .ok_or(ServiceError::NotFound("criterion"))?;
        if criterion.level(level_id).is_none() {
            return Err(ServiceError::validation(format!(
                "level {level_id} is not declared for criterion '{}'",
                criterion.criterion.name
            )));
        }
    }

    let feedback = normalized_comment(input.teacher_feedback);
    let updated = state
        .store()
        .apply_override(score_id, input.teacher_level_id, feedback, state.now())
        .await?
        .ok_or_else(|| ServiceError::Conflict("essay left review while overriding".to_string()))?;

    tracing::info!(
        %owner_id,
        essay_id = %essay.id,
        score_id = %score_id,
        overridden = updated.is_overridden(),
        "Criterion score override applied"
    );
    Ok(updated)
}

/// Moves a graded essay to `reviewed`. Every criterion must resolve to a declared level.
pub(crate) async fn approve(
    state: &AppState,
    owner_id: Uuid,
    essay_id: Uuid,
) -> Result<Essay, ServiceError> {
    let essay = owned_essay(state, owner_id, essay_id).await?;
    if essay.status != EssayStatus::Graded {
        return Err(ServiceError::IncompleteReview(format!(
            "essay is {}; only graded essays can be approved",
            essay.status.as_str()
        )));
    }

    let graded = state
        .store()
        .find_grading_result(essay_id)
        .await?
        .ok_or_else(|| ServiceError::IncompleteReview("essay has no grading result".to_string()))?;
    let rubric = rubric_for(state, &essay).await?;

    for entry in &rubric.criteria {
        let resolved = graded
            .scores
            .iter()
            .find(|score| score.criterion_id == entry.criterion.id)
            .and_then(|score| entry.level(score.effective_level_id()));
        if resolved.is_none() {
            return Err(ServiceError::IncompleteReview(format!(
                "criterion '{}' has no effective level",
                entry.criterion.name
            )));
        }
    }

    if !state.store().approve_essay(owner_id, essay_id, owner_id, state.now()).await? {
        return Err(ServiceError::Conflict("essay changed while approving".to_string()));
    }

    let assignment_status = recompute_assignment_status(state, essay.assignment_id).await?;
    tracing::info!(
        %owner_id,
        %essay_id,
        assignment_id = %essay.assignment_id,
        assignment_status = assignment_status.as_str(),
        "Essay approved"
    );
    metrics::counter!("essays_approved_total").increment(1);

    owned_essay(state, owner_id, essay_id).await
}

pub(crate) async fn essay_review(
    state: &AppState,
    owner_id: Uuid,
    essay_id: Uuid,
) -> Result<EssayReview, ServiceError> {
    let essay = owned_essay(state, owner_id, essay_id).await?;
    let rubric = rubric_for(state, &essay).await?;
    let graded = state.store().find_grading_result(essay_id).await?;
    let annotations = state.store().list_annotations(essay_id, false).await?;

    let Some(graded) = graded else {
        return Ok(EssayReview {
            essay,
            result: None,
            criteria: Vec::new(),
            total_score: None,
            max_score: rubric.max_total(),
            annotations,
        });
    };

    let mut scores: HashMap<Uuid, CriterionScore> =
        graded.scores.into_iter().map(|score| (score.criterion_id, score)).collect();
    let mut criteria = Vec::with_capacity(rubric.criteria.len());
    let mut total = 0i64;

    for entry in &rubric.criteria {
        let Some(score) = scores.remove(&entry.criterion.id) else {
            continue;
        };
        let ai_level = entry.level(score.ai_level_id).cloned();
        let teacher_level = score.teacher_level_id.and_then(|id| entry.level(id)).cloned();
        let effective_level = entry.level(score.effective_level_id()).cloned();
        total += effective_level.as_ref().map(|level| i64::from(level.score)).unwrap_or(0);

        criteria.push(CriterionReview {
            criterion_id: entry.criterion.id,
            name: entry.criterion.name.clone(),
            max_score: entry.max_score(),
            score,
            ai_level,
            teacher_level,
            effective_level,
        });
    }

    Ok(EssayReview {
        essay,
        result: Some(graded.result),
        criteria,
        total_score: Some(total),
        max_score: rubric.max_total(),
        annotations,
    })
}

pub(crate) async fn add_annotation(
    state: &AppState,
    owner_id: Uuid,
    essay_id: Uuid,
    input: AnnotationInput,
) -> Result<Annotation, ServiceError> {
    let essay = owned_essay(state, owner_id, essay_id).await?;
    require_graded(&essay)?;
    let comment = normalized_comment(input.comment);
    check_span(&essay, input.kind, input.start_offset, input.end_offset, comment.as_deref())?;

    let now = state.now();
    let annotation = Annotation {
        id: Uuid::new_v4(),
        essay_id,
        origin: AnnotationOrigin::Teacher,
        kind: input.kind,
        start_offset: input.start_offset,
        end_offset: input.end_offset,
        comment,
        created_at: now,
        updated_at: now,
        removed_at: None,
        removed_by: None,
    };
    state.store().insert_annotation(&annotation).await?;

    tracing::info!(%owner_id, %essay_id, annotation_id = %annotation.id, "Annotation added");
    Ok(annotation)
}

pub(crate) async fn update_annotation(
    state: &AppState,
    owner_id: Uuid,
    annotation_id: Uuid,
    input: AnnotationInput,
) -> Result<Annotation, ServiceError> {
    let (annotation, essay) = state
        .store()
        .find_annotation(owner_id, annotation_id)
        .await?
        .ok_or(ServiceError::NotFound("annotation"))?;

    if annotation.origin == AnnotationOrigin::Ai {
        return Err(ServiceError::Conflict(
            "automated annotations cannot be edited; remove it instead".to_string(),
        ));
    }
    if !annotation.is_active() {
        return Err(ServiceError::Conflict("annotation was removed".to_string()));
    }
    require_graded(&essay)?;

    let comment = normalized_comment(input.comment);
    check_span(&essay, input.kind, input.start_offset, input.end_offset, comment.as_deref())?;

    let changes = AnnotationChanges {
        kind: input.kind,
        start_offset: input.start_offset,
        end_offset: input.end_offset,
        comment,
        updated_at: state.now(),
    };
    state
        .store()
        .update_annotation(annotation_id, &changes)
        .await?
        .ok_or_else(|| ServiceError::Conflict("annotation changed concurrently".to_string()))
}

/// Soft removal: the annotation stays listable with who removed it and when.
pub(crate) async fn remove_annotation(
    state: &AppState,
    owner_id: Uuid,
    annotation_id: Uuid,
) -> Result<(), ServiceError> {
    let (annotation, essay) = state
        .store()
        .find_annotation(owner_id, annotation_id)
        .await?
        .ok_or(ServiceError::NotFound("annotation"))?;
    if !annotation.is_active() {
        return Err(ServiceError::Conflict("annotation was already removed".to_string()));
    }
    require_graded(&essay)?;

    if !state.store().remove_annotation(annotation_id, owner_id, state.now()).await? {
        return Err(ServiceError::Conflict("annotation was already removed".to_string()));
    }

    tracing::info!(
        %owner_id,
        essay_id = %essay.id,
        %annotation_id,
        origin = ?annotation.origin,
        "Annotation removed"
    );
    Ok(())
}

pub(crate) async fn list_annotations(
    state: &AppState,
    owner_id: Uuid,
    essay_id: Uuid,
    include_removed: bool,
) -> Result<Vec<Annotation>, ServiceError> {
    owned_essay(state, owner_id, essay_id).await?;
    Ok(state.store().list_annotations(essay_id, include_removed).await?)
}

fn check_span(
    essay: &Essay,
    kind: AnnotationKind,
    start_offset: i32,
    end_offset: i32,
    comment: Option<&str>,
) -> Result<(), ServiceError> {
    let text = essay
        .extracted_text
        .as_deref()
        .ok_or_else(|| ServiceError::Conflict("essay text is no longer available".to_string()))?;
    validate_span(kind, start_offset, end_offset, comment, text.chars().count())
        .map_err(ServiceError::validation)
}

/// Effective scores of a completed assignment, one row per essay in file-name order and one
/// cell per criterion in rubric order.
pub(crate) async fn export_assignment(
    state: &AppState,
    owner_id: Uuid,
    assignment_id: Uuid,
) -> Result<ExportSheet, ServiceError> {
    let assignment = state
        .store()
        .find_assignment(owner_id, assignment_id)
        .await?
        .ok_or(ServiceError::NotFound("assignment"))?;
    let essays = state.store().list_essays(owner_id, assignment_id).await?;

    let unreviewed: Vec<Uuid> = essays
        .iter()
        .filter(|essay| essay.status != EssayStatus::Reviewed)
        .map(|essay| essay.id)
        .collect();
    if assignment.status != AssignmentStatus::Completed || !unreviewed.is_empty() {
        return Err(ServiceError::ReviewIncomplete { unreviewed });
    }

    let rubric = state
        .store()
        .find_rubric(owner_id, assignment.rubric_id)
        .await?
        .ok_or(ServiceError::NotFound("rubric"))?;
    let columns: Vec<ExportColumn> = rubric
        .criteria
        .iter()
        .map(|entry| ExportColumn {
            criterion_id: entry.criterion.id,
            name: entry.criterion.name.clone(),
            max_score: entry.max_score(),
        })
        .collect();

    let mut rows = Vec::with_capacity(essays.len());
    for essay in essays {
        let graded = state.store().find_grading_result(essay.id).await?.ok_or_else(|| {
            ServiceError::Store(anyhow::anyhow!("reviewed essay {} has no grading result", essay.id))
        })?;

        let mut cells = Vec::with_capacity(rubric.criteria.len());
        for entry in &rubric.criteria {
            let score = graded
                .scores
                .iter()
                .find(|score| score.criterion_id == entry.criterion.id)
                .ok_or_else(|| ServiceError::IncompleteReview(format!(
                    "essay {} has no score for '{}'",
                    essay.file_name, entry.criterion.name
                )))?;
            let level = entry.level(score.effective_level_id()).ok_or_else(|| {
                ServiceError::IncompleteReview(format!(
                    "essay {} has no effective level for '{}'",
                    essay.file_name, entry.criterion.name
                ))
            })?;
            cells.push(ExportCell {
                criterion_id: entry.criterion.id,
                score: level.score,
                feedback: score.effective_feedback().to_string(),
            });
        }

        let total = cells.iter().map(|cell| i64::from(cell.score)).sum();
        rows.push(ExportRow {
            essay_id: essay.id,
            student_name: essay.student_name,
            file_name: essay.file_name,
            cells,
            total,
        });
    }

    tracing::info!(%owner_id, %assignment_id, rows = rows.len(), "Assignment exported");
    Ok(ExportSheet { assignment, columns, rows, max_total: rubric.max_total() })
}
