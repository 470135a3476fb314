use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::core::time::{format_optional, format_primitive};
use crate::db::models::{Annotation, CriterionLevel, CriterionScore, GradingResult};
use crate::db::types::{AnnotationKind, AnnotationOrigin};
use crate::schemas::assignment::{AssignmentResponse, EssayResponse};
use crate::schemas::rubric::LevelResponse;
use crate::services::review::{
    AnnotationInput, CriterionReview, EssayReview, ExportSheet, OverrideInput,
};

/// Both fields `null` clears the override.
#[derive(Debug, Deserialize)]
pub(crate) struct OverrideRequest {
    #[serde(default, alias = "teacherLevelId")]
    pub(crate) teacher_level_id: Option<Uuid>,
    #[serde(default, alias = "teacherFeedback")]
    pub(crate) teacher_feedback: Option<String>,
}

impl From<OverrideRequest> for OverrideInput {
    fn from(request: OverrideRequest) -> Self {
        Self { teacher_level_id: request.teacher_level_id, teacher_feedback: request.teacher_feedback }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct AnnotationRequest {
    pub(crate) kind: AnnotationKind,
    #[serde(alias = "startOffset")]
    #[validate(range(min = 0, message = "start_offset must be non-negative"))]
    pub(crate) start_offset: i32,
    #[serde(alias = "endOffset")]
    #[validate(range(min = 0, message = "end_offset must be non-negative"))]
    pub(crate) end_offset: i32,
    #[serde(default)]
    pub(crate) comment: Option<String>,
}

impl From<AnnotationRequest> for AnnotationInput {
    fn from(request: AnnotationRequest) -> Self {
        Self {
            kind: request.kind,
            start_offset: request.start_offset,
            end_offset: request.end_offset,
            comment: request.comment,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct AnnotationListQuery {
    #[serde(default)]
    pub(crate) include_removed: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct AnnotationResponse {
    pub(crate) id: Uuid,
    pub(crate) essay_id: Uuid,
    pub(crate) origin: AnnotationOrigin,
    pub(crate) kind: AnnotationKind,
    pub(crate) start_offset: i32,
    pub(crate) end_offset: i32,
    pub(crate) comment: Option<String>,
    pub(crate) removed: bool,
    pub(crate) removed_at: Option<String>,
    pub(crate) removed_by: Option<Uuid>,
    pub(crate) created_at: String,
    pub(crate) updated_at: String,
}

impl From<Annotation> for AnnotationResponse {
    fn from(annotation: Annotation) -> Self {
        Self {
            id: annotation.id,
            essay_id: annotation.essay_id,
            origin: annotation.origin,
            kind: annotation.kind,
            start_offset: annotation.start_offset,
            end_offset: annotation.end_offset,
            removed: !annotation.is_active(),
            comment: annotation.comment,
            removed_at: format_optional(annotation.removed_at),
            removed_by: annotation.removed_by,
            created_at: format_primitive(annotation.created_at),
            updated_at: format_primitive(annotation.updated_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct CriterionScoreResponse {
    pub(crate) id: Uuid,
    pub(crate) criterion_id: Uuid,
    pub(crate) ai_level_id: Uuid,
    pub(crate) ai_feedback: String,
    pub(crate) teacher_level_id: Option<Uuid>,
    pub(crate) teacher_feedback: Option<String>,
    pub(crate) effective_level_id: Uuid,
    pub(crate) effective_feedback: String,
    pub(crate) overridden: bool,
    pub(crate) updated_at: String,
}

impl From<CriterionScore> for CriterionScoreResponse {
    fn from(score: CriterionScore) -> Self {
        Self {
            effective_level_id: score.effective_level_id(),
            effective_feedback: score.effective_feedback().to_string(),
            overridden: score.is_overridden(),
            id: score.id,
            criterion_id: score.criterion_id,
            ai_level_id: score.ai_level_id,
            ai_feedback: score.ai_feedback,
            teacher_level_id: score.teacher_level_id,
            teacher_feedback: score.teacher_feedback,
            updated_at: format_primitive(score.updated_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct CriterionReviewResponse {
    pub(crate) criterion_id: Uuid,
    pub(crate) name: String,
    pub(crate) max_score: i32,
    pub(crate) score: CriterionScoreResponse,
    pub(crate) ai_level: Option<LevelResponse>,
    pub(crate) teacher_level: Option<LevelResponse>,
    pub(crate) effective_level: Option<LevelResponse>,
}

impl From<CriterionReview> for CriterionReviewResponse {
    fn from(review: CriterionReview) -> Self {
        let level = |level: Option<CriterionLevel>| level.map(LevelResponse::from);
        Self {
            criterion_id: review.criterion_id,
            name: review.name,
            max_score: review.max_score,
            score: CriterionScoreResponse::from(review.score),
            ai_level: level(review.ai_level),
            teacher_level: level(review.teacher_level),
            effective_level: level(review.effective_level),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct GradingResultResponse {
    pub(crate) id: Uuid,
    pub(crate) rubric_id: Uuid,
    pub(crate) rubric_version: i32,
    pub(crate) teacher_approved: bool,
    pub(crate) approved_at: Option<String>,
    pub(crate) approved_by: Option<Uuid>,
    pub(crate) created_at: String,
}

impl From<GradingResult> for GradingResultResponse {
    fn from(result: GradingResult) -> Self {
        Self {
            id: result.id,
            rubric_id: result.rubric_id,
            rubric_version: result.rubric_version,
            teacher_approved: result.teacher_approved,
            approved_at: format_optional(result.approved_at),
            approved_by: result.approved_by,
            created_at: format_primitive(result.created_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct EssayReviewResponse {
    pub(crate) essay: EssayResponse,
    pub(crate) result: Option<GradingResultResponse>,
    pub(crate) criteria: Vec<CriterionReviewResponse>,
    pub(crate) total_score: Option<i64>,
    pub(crate) max_score: i64,
    pub(crate) annotations: Vec<AnnotationResponse>,
}

impl From<EssayReview> for EssayReviewResponse {
    fn from(review: EssayReview) -> Self {
        Self {
            essay: EssayResponse::from(review.essay),
            result: review.result.map(GradingResultResponse::from),
            criteria: review.criteria.into_iter().map(CriterionReviewResponse::from).collect(),
            total_score: review.total_score,
            max_score: review.max_score,
            annotations: review.annotations.into_iter().map(AnnotationResponse::from).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ExportColumnResponse {
    pub(crate) criterion_id: Uuid,
    pub(crate) name: String,
    pub(crate) max_score: i32,
}

#[derive(Debug, Serialize)]
pub(crate) struct ExportCellResponse {
    pub(crate) criterion_id: Uuid,
    pub(crate) score: i32,
    pub(crate) feedback: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct ExportRowResponse {
    pub(crate) essay_id: Uuid,
    pub(crate) student_name: String,
    pub(crate) file_name: String,
    pub(crate) cells: Vec<ExportCellResponse>,
    pub(crate) total: i64,
}

#[derive(Debug, Serialize)]
pub(crate) struct ExportResponse {
    pub(crate) assignment: AssignmentResponse,
    pub(crate) columns: Vec<ExportColumnResponse>,
    pub(crate) rows: Vec<ExportRowResponse>,
    pub(crate) max_total: i64,
}

impl From<ExportSheet> for ExportResponse {
    fn from(sheet: ExportSheet) -> Self {
        Self {
            assignment: AssignmentResponse::from(sheet.assignment),
            columns: sheet
                .columns
                .into_iter()
                .map(|column| ExportColumnResponse {
                    criterion_id: column.criterion_id,
                    name: column.name,
                    max_score: column.max_score,
                })
                .collect(),
            rows: sheet
                .rows
                .into_iter()
                .map(|row| ExportRowResponse {
                    essay_id: row.essay_id,
                    student_name: row.student_name,
                    file_name: row.file_name,
                    cells: row
                        .cells
                        .into_iter()
                        .map(|cell| ExportCellResponse {
                            criterion_id: cell.criterion_id,
                            score: cell.score,
                            feedback: cell.feedback,
                        })
                        .collect(),
                    total: row.total,
                })
                .collect(),
            max_total: sheet.max_total,
        }
    }
}
