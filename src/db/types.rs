use serde::{Deserialize, Serialize};
use sqlx::Type;

/// Lifecycle of an assignment. Forward-only except for owner cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "assignmentstatus", rename_all = "lowercase")]
pub(crate) enum AssignmentStatus {
    Draft,
    Grading,
    Review,
    Completed,
}

impl AssignmentStatus {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Grading => "grading",
            Self::Review => "review",
            Self::Completed => "completed",
        }
    }

    /// `Grading -> Draft` is the cancellation edge; every other backward move is illegal.
    pub(crate) fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Draft, Self::Grading)
                | (Self::Grading, Self::Review)
                | (Self::Review, Self::Completed)
                | (Self::Grading, Self::Draft)
        )
    }

    /// Essays may only be added before the batch settles into review.
    pub(crate) fn accepts_uploads(self) -> bool {
        matches!(self, Self::Draft | Self::Grading)
    }

    /// Pending essays of an assignment in these states may be claimed by workers.
    pub(crate) fn is_claimable(self) -> bool {
        matches!(self, Self::Grading | Self::Review)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "essaystatus", rename_all = "lowercase")]
pub(crate) enum EssayStatus {
    Pending,
    Processing,
    Graded,
    Reviewed,
    Failed,
}

impl EssayStatus {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Graded => "graded",
            Self::Reviewed => "reviewed",
            Self::Failed => "failed",
        }
    }

    pub(crate) fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Pending)
                | (Self::Processing, Self::Graded)
                | (Self::Processing, Self::Failed)
                | (Self::Failed, Self::Pending)
                | (Self::Graded, Self::Reviewed)
        )
    }

    /// Terminal for the grading run: nothing more happens without a human.
    pub(crate) fn is_settled(self) -> bool {
        matches!(self, Self::Graded | Self::Reviewed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "failurekind", rename_all = "snake_case")]
pub(crate) enum FailureKind {
    ExtractionExhausted,
    GradingExhausted,
    ContractViolation,
    MissingContent,
}

impl FailureKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::ExtractionExhausted => "extraction_exhausted",
            Self::GradingExhausted => "grading_exhausted",
            Self::ContractViolation => "contract_violation",
            Self::MissingContent => "missing_content",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "annotationkind", rename_all = "lowercase")]
pub(crate) enum AnnotationKind {
    Highlight,
    Strikethrough,
    Comment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "annotationorigin", rename_all = "lowercase")]
pub(crate) enum AnnotationOrigin {
    Ai,
    Teacher,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ASSIGNMENT_STATES: [AssignmentStatus; 4] = [
        AssignmentStatus::Draft,
        AssignmentStatus::Grading,
        AssignmentStatus::Review,
        AssignmentStatus::Completed,
    ];

    const ESSAY_STATES: [EssayStatus; 5] = [
        EssayStatus::Pending,
        EssayStatus::Processing,
        EssayStatus::Graded,
        EssayStatus::Reviewed,
        EssayStatus::Failed,
    ];

    #[test]
    fn assignment_transitions_are_forward_only_except_cancel() {
        let allowed: Vec<_> = ASSIGNMENT_STATES
            .iter()
            .flat_map(|from| ASSIGNMENT_STATES.iter().map(move |to| (*from, *to)))
            .filter(|(from, to)| from.can_transition_to(*to))
            .collect();

        assert_eq!(
            allowed,
            vec![
                (AssignmentStatus::Draft, AssignmentStatus::Grading),
                (AssignmentStatus::Grading, AssignmentStatus::Draft),
                (AssignmentStatus::Grading, AssignmentStatus::Review),
                (AssignmentStatus::Review, AssignmentStatus::Completed),
            ]
        );
    }

    #[test]
    fn reviewed_and_graded_never_return_to_processing() {
        for to in ESSAY_STATES {
            assert!(!EssayStatus::Reviewed.can_transition_to(to));
        }
        assert!(!EssayStatus::Graded.can_transition_to(EssayStatus::Processing));
        assert!(!EssayStatus::Pending.can_transition_to(EssayStatus::Graded));
        assert!(EssayStatus::Failed.can_transition_to(EssayStatus::Pending));
    }

    #[test]
    fn status_names_match_serde() {
        for status in ESSAY_STATES {
            let json = serde_json::to_value(status).expect("serialize");
            assert_eq!(json, serde_json::Value::String(status.as_str().to_string()));
        }
        let kind = serde_json::to_value(FailureKind::ContractViolation).expect("serialize");
        assert_eq!(kind, "contract_violation");
    }
}
