use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::PrimitiveDateTime;
use uuid::Uuid;

use crate::db::types::{
    AnnotationKind, AnnotationOrigin, AssignmentStatus, EssayStatus, FailureKind,
};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct Rubric {
    pub(crate) id: Uuid,
    pub(crate) owner_id: Uuid,
    pub(crate) title: String,
    pub(crate) description: Option<String>,
    pub(crate) version: i32,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct RubricCriterion {
    pub(crate) id: Uuid,
    pub(crate) rubric_id: Uuid,
    pub(crate) name: String,
    pub(crate) position: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct CriterionLevel {
    pub(crate) id: Uuid,
    pub(crate) criterion_id: Uuid,
    pub(crate) score: i32,
    pub(crate) descriptor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct Assignment {
    pub(crate) id: Uuid,
    pub(crate) owner_id: Uuid,
    pub(crate) rubric_id: Uuid,
    pub(crate) title: String,
    pub(crate) prompt: String,
    pub(crate) source_text: Option<String>,
    pub(crate) status: AssignmentStatus,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct AssignmentListItem {
    #[sqlx(flatten)]
    pub(crate) assignment: Assignment,
    pub(crate) essay_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct Essay {
    pub(crate) id: Uuid,
    pub(crate) assignment_id: Uuid,
    pub(crate) owner_id: Uuid,
    pub(crate) file_name: String,
    pub(crate) student_name: String,
    pub(crate) content_type: String,
    pub(crate) storage_key: Option<String>,
    pub(crate) content_hash: String,
    pub(crate) extracted_text: Option<String>,
    pub(crate) status: EssayStatus,
    pub(crate) attempt_count: i32,
    pub(crate) next_attempt_at: PrimitiveDateTime,
    pub(crate) lease_id: Option<Uuid>,
    pub(crate) claimed_at: Option<PrimitiveDateTime>,
    pub(crate) last_error: Option<String>,
    pub(crate) failure_kind: Option<FailureKind>,
    pub(crate) graded_at: Option<PrimitiveDateTime>,
    pub(crate) reviewed_at: Option<PrimitiveDateTime>,
    pub(crate) delete_after: Option<PrimitiveDateTime>,
    pub(crate) content_purged_at: Option<PrimitiveDateTime>,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct GradingResult {
    pub(crate) id: Uuid,
    pub(crate) essay_id: Uuid,
    pub(crate) rubric_id: Uuid,
    pub(crate) rubric_version: i32,
    pub(crate) grading_key: String,
    pub(crate) teacher_approved: bool,
    pub(crate) approved_at: Option<PrimitiveDateTime>,
    pub(crate) approved_by: Option<Uuid>,
    pub(crate) created_at: PrimitiveDateTime,
}

/// Per-criterion score with an immutable automated slot and an optional teacher slot.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct CriterionScore {
    pub(crate) id: Uuid,
    pub(crate) grading_result_id: Uuid,
    pub(crate) criterion_id: Uuid,
    pub(crate) ai_level_id: Uuid,
    pub(crate) ai_feedback: String,
    pub(crate) teacher_level_id: Option<Uuid>,
    pub(crate) teacher_feedback: Option<String>,
    pub(crate) updated_at: PrimitiveDateTime,
}

impl CriterionScore {
    pub(crate) fn effective_level_id(&self) -> Uuid {
        self.teacher_level_id.unwrap_or(self.ai_level_id)
    }

    /// Teacher feedback wins only when the teacher actually wrote some.
    pub(crate) fn effective_feedback(&self) -> &str {
        self.teacher_feedback.as_deref().unwrap_or(&self.ai_feedback)
    }

    pub(crate) fn is_overridden(&self) -> bool {
        self.teacher_level_id.is_some() || self.teacher_feedback.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct Annotation {
    pub(crate) id: Uuid,
    pub(crate) essay_id: Uuid,
    pub(crate) origin: AnnotationOrigin,
    pub(crate) kind: AnnotationKind,
    pub(crate) start_offset: i32,
    pub(crate) end_offset: i32,
    pub(crate) comment: Option<String>,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
    pub(crate) removed_at: Option<PrimitiveDateTime>,
    pub(crate) removed_by: Option<Uuid>,
}

impl Annotation {
    pub(crate) fn is_active(&self) -> bool {
        self.removed_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn score(teacher_level: Option<Uuid>, teacher_feedback: Option<&str>) -> CriterionScore {
        CriterionScore {
            id: Uuid::new_v4(),
            grading_result_id: Uuid::new_v4(),
            criterion_id: Uuid::new_v4(),
            ai_level_id: Uuid::from_u128(1),
            ai_feedback: "ai says".to_string(),
            teacher_level_id: teacher_level,
            teacher_feedback: teacher_feedback.map(str::to_string),
            updated_at: datetime!(2025-01-01 00:00:00),
        }
    }

    #[test]
    fn effective_slot_prefers_teacher() {
        let plain = score(None, None);
        assert_eq!(plain.effective_level_id(), Uuid::from_u128(1));
        assert_eq!(plain.effective_feedback(), "ai says");
        assert!(!plain.is_overridden());

        let overridden = score(Some(Uuid::from_u128(2)), Some("teacher says"));
        assert_eq!(overridden.effective_level_id(), Uuid::from_u128(2));
        assert_eq!(overridden.effective_feedback(), "teacher says");
        assert_eq!(overridden.ai_level_id, Uuid::from_u128(1));
    }

    #[test]
    fn feedback_only_override_keeps_ai_level() {
        let overridden = score(None, Some("reworded"));
        assert_eq!(overridden.effective_level_id(), Uuid::from_u128(1));
        assert_eq!(overridden.effective_feedback(), "reworded");
        assert!(overridden.is_overridden());
    }
}
