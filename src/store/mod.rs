//! Persistence seam for the grading pipeline.
//!
//! Every conditional write is a compare-and-set on the current status (and, for worker writes,
//! on the lease id handed out by [`GradingStore::claim_next_essay`]). A `false`/`None` result
//! means the row was not in the expected state and nothing changed.

mod postgres;

pub(crate) use postgres::PgGradingStore;

use async_trait::async_trait;
use thiserror::Error;
use time::PrimitiveDateTime;
use uuid::Uuid;

use crate::db::models::{
    Annotation, Assignment, AssignmentListItem, CriterionLevel, CriterionScore, Essay,
    GradingResult, Rubric, RubricCriterion,
};
use crate::db::types::{AnnotationKind, AssignmentStatus, EssayStatus, FailureKind};

#[derive(Debug, Error)]
pub(crate) enum StoreError {
    #[error("{0} is still referenced")]
    Referenced(&'static str),
    #[error("conflicting write: {0}")]
    Conflict(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Backend(anyhow::Error::new(err))
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CriterionWithLevels {
    pub(crate) criterion: RubricCriterion,
    /// Ordered by ascending score.
    pub(crate) levels: Vec<CriterionLevel>,
}

impl CriterionWithLevels {
    pub(crate) fn level(&self, level_id: Uuid) -> Option<&CriterionLevel> {
        self.levels.iter().find(|level| level.id == level_id)
    }

    pub(crate) fn max_score(&self) -> i32 {
        self.levels.iter().map(|level| level.score).max().unwrap_or(0)
    }
}

/// A rubric with its criteria ordered by position.
#[derive(Debug, Clone)]
pub(crate) struct RubricSnapshot {
    pub(crate) rubric: Rubric,
    pub(crate) criteria: Vec<CriterionWithLevels>,
}

impl RubricSnapshot {
    pub(crate) fn criterion(&self, criterion_id: Uuid) -> Option<&CriterionWithLevels> {
        self.criteria.iter().find(|entry| entry.criterion.id == criterion_id)
    }

    pub(crate) fn max_total(&self) -> i64 {
        self.criteria.iter().map(|entry| i64::from(entry.max_score())).sum()
    }

    pub(crate) fn sort(&mut self) {
        self.criteria.sort_by_key(|entry| entry.criterion.position);
        for entry in &mut self.criteria {
            entry.levels.sort_by_key(|level| level.score);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct EssayStatusCounts {
    pub(crate) pending: i64,
    pub(crate) processing: i64,
    pub(crate) graded: i64,
    pub(crate) reviewed: i64,
    pub(crate) failed: i64,
}

impl EssayStatusCounts {
    pub(crate) fn total(&self) -> i64 {
        self.pending + self.processing + self.graded + self.reviewed + self.failed
    }

    pub(crate) fn add(&mut self, status: EssayStatus, count: i64) {
        match status {
            EssayStatus::Pending => self.pending += count,
            EssayStatus::Processing => self.processing += count,
            EssayStatus::Graded => self.graded += count,
            EssayStatus::Reviewed => self.reviewed += count,
            EssayStatus::Failed => self.failed += count,
        }
    }

    /// Every essay reached a grading outcome.
    pub(crate) fn all_settled(&self) -> bool {
        self.total() > 0 && self.pending == 0 && self.processing == 0
    }

    pub(crate) fn all_reviewed(&self) -> bool {
        self.total() > 0 && self.reviewed == self.total()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct AssignmentChanges {
    pub(crate) title: Option<String>,
    pub(crate) prompt: Option<String>,
    pub(crate) source_text: Option<Option<String>>,
    pub(crate) rubric_id: Option<Uuid>,
    pub(crate) updated_at: PrimitiveDateTime,
}

/// Everything written when an essay moves `processing -> graded`.
#[derive(Debug, Clone)]
pub(crate) struct GradingCompletion {
    pub(crate) essay_id: Uuid,
    pub(crate) lease_id: Uuid,
    pub(crate) result: GradingResult,
    pub(crate) scores: Vec<CriterionScore>,
    pub(crate) annotations: Vec<Annotation>,
    pub(crate) graded_at: PrimitiveDateTime,
    pub(crate) delete_after: PrimitiveDateTime,
}

#[derive(Debug, Clone)]
pub(crate) struct GradedEssay {
    pub(crate) result: GradingResult,
    pub(crate) scores: Vec<CriterionScore>,
}

#[derive(Debug, Clone)]
pub(crate) struct AnnotationChanges {
    pub(crate) kind: AnnotationKind,
    pub(crate) start_offset: i32,
    pub(crate) end_offset: i32,
    pub(crate) comment: Option<String>,
    pub(crate) updated_at: PrimitiveDateTime,
}

#[async_trait]
pub(crate) trait GradingStore: Send + Sync {
    async fn health(&self) -> Result<(), StoreError>;

    async fn insert_rubric(&self, snapshot: &RubricSnapshot) -> Result<(), StoreError>;
    async fn find_rubric(
        &self,
        owner_id: Uuid,
        rubric_id: Uuid,
    ) -> Result<Option<RubricSnapshot>, StoreError>;
    async fn list_rubrics(&self, owner_id: Uuid) -> Result<Vec<Rubric>, StoreError>;
    /// Replaces title, description, version and the whole criteria tree. Fails with
    /// `Referenced` while any assignment using the rubric has essays.
    async fn replace_rubric(&self, snapshot: &RubricSnapshot) -> Result<bool, StoreError>;
    /// Fails with `Referenced` while any assignment uses the rubric.
    async fn delete_rubric(&self, owner_id: Uuid, rubric_id: Uuid) -> Result<bool, StoreError>;

    async fn insert_assignment(&self, assignment: &Assignment) -> Result<(), StoreError>;
    async fn find_assignment(
        &self,
        owner_id: Uuid,
        assignment_id: Uuid,
    ) -> Result<Option<Assignment>, StoreError>;
    async fn find_assignment_by_id(
        &self,
        assignment_id: Uuid,
    ) -> Result<Option<Assignment>, StoreError>;
    async fn list_assignments(&self, owner_id: Uuid)
        -> Result<Vec<AssignmentListItem>, StoreError>;
    /// A rubric change fails with `Conflict` once essays exist.
    async fn update_assignment(
        &self,
        owner_id: Uuid,
        assignment_id: Uuid,
        changes: &AssignmentChanges,
    ) -> Result<Option<Assignment>, StoreError>;
    /// Fails with `Referenced` while essays exist.
    async fn delete_assignment(
        &self,
        owner_id: Uuid,
        assignment_id: Uuid,
    ) -> Result<bool, StoreError>;
    /// Compare-and-set on the assignment status. Moving to `review` or `completed` also
    /// requires the essay aggregate to allow it at write time.
    async fn transition_assignment(
        &self,
        assignment_id: Uuid,
        from: AssignmentStatus,
        to: AssignmentStatus,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError>;
    async fn essay_status_counts(&self, assignment_id: Uuid)
        -> Result<EssayStatusCounts, StoreError>;

    /// All-or-nothing insert of one assignment's essays. Fails with `Conflict` on a duplicate
    /// content hash, or when the assignment no longer accepts uploads at insert time.
    async fn insert_essays(&self, essays: &[Essay]) -> Result<(), StoreError>;
    async fn content_hashes(&self, assignment_id: Uuid) -> Result<Vec<String>, StoreError>;
    async fn find_essay(&self, owner_id: Uuid, essay_id: Uuid)
        -> Result<Option<Essay>, StoreError>;
    /// Ordered by file name.
    async fn list_essays(
        &self,
        owner_id: Uuid,
        assignment_id: Uuid,
    ) -> Result<Vec<Essay>, StoreError>;
    /// Atomically moves one eligible essay `pending -> processing`, stamping a fresh lease
    /// and incrementing its attempt counter.
    async fn claim_next_essay(&self, now: PrimitiveDateTime) -> Result<Option<Essay>, StoreError>;
    async fn set_extracted_text(
        &self,
        essay_id: Uuid,
        lease_id: Uuid,
        text: &str,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError>;
    async fn release_essay(
        &self,
        essay_id: Uuid,
        lease_id: Uuid,
        error: &str,
        next_attempt_at: PrimitiveDateTime,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError>;
    async fn fail_essay(
        &self,
        essay_id: Uuid,
        lease_id: Uuid,
        kind: FailureKind,
        error: &str,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError>;
    async fn complete_grading(&self, completion: &GradingCompletion) -> Result<bool, StoreError>;
    async fn requeue_failed_essay(
        &self,
        owner_id: Uuid,
        essay_id: Uuid,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError>;
    async fn list_stale_processing(
        &self,
        claimed_before: PrimitiveDateTime,
    ) -> Result<Vec<Essay>, StoreError>;
    /// Removes an essay that is not being processed, returning the deleted row.
    async fn delete_essay(&self, owner_id: Uuid, essay_id: Uuid)
        -> Result<Option<Essay>, StoreError>;
    async fn approve_essay(
        &self,
        owner_id: Uuid,
        essay_id: Uuid,
        approved_by: Uuid,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError>;

    async fn find_grading_result(&self, essay_id: Uuid) -> Result<Option<GradedEssay>, StoreError>;
    async fn find_criterion_score(
        &self,
        owner_id: Uuid,
        score_id: Uuid,
    ) -> Result<Option<(CriterionScore, Essay)>, StoreError>;
    /// Writes only the teacher slot, and only while the essay is `graded`.
    async fn apply_override(
        &self,
        score_id: Uuid,
        teacher_level_id: Option<Uuid>,
        teacher_feedback: Option<String>,
        now: PrimitiveDateTime,
    ) -> Result<Option<CriterionScore>, StoreError>;

    async fn insert_annotation(&self, annotation: &Annotation) -> Result<(), StoreError>;
    async fn find_annotation(
        &self,
        owner_id: Uuid,
        annotation_id: Uuid,
    ) -> Result<Option<(Annotation, Essay)>, StoreError>;
    /// Only active teacher-origin annotations can change.
    async fn update_annotation(
        &self,
        annotation_id: Uuid,
        changes: &AnnotationChanges,
    ) -> Result<Option<Annotation>, StoreError>;
    async fn remove_annotation(
        &self,
        annotation_id: Uuid,
        removed_by: Uuid,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError>;
    /// Ordered by start offset.
    async fn list_annotations(
        &self,
        essay_id: Uuid,
        include_removed: bool,
    ) -> Result<Vec<Annotation>, StoreError>;

    async fn list_due_for_purge(
        &self,
        now: PrimitiveDateTime,
        limit: u32,
    ) -> Result<Vec<Essay>, StoreError>;
    /// Clears stored content references, extracted text and annotations. Scores stay.
    async fn purge_essay_content(
        &self,
        essay_id: Uuid,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError>;
}
