use anyhow::Context;
use async_trait::async_trait;
use sqlx::PgPool;
use time::PrimitiveDateTime;
use uuid::Uuid;

use crate::db::models::{
    Annotation, Assignment, AssignmentListItem, CriterionScore, Essay, Rubric,
};
use crate::db::types::{AssignmentStatus, FailureKind};
use crate::db::{is_constraint_violation, FOREIGN_KEY_VIOLATION, UNIQUE_VIOLATION};
use crate::repositories::{annotations, assignments, essays, grading_results, rubrics};
use crate::store::{
    AnnotationChanges, AssignmentChanges, EssayStatusCounts, GradedEssay, GradingCompletion,
    GradingStore, RubricSnapshot, StoreError,
};

/// [`GradingStore`] backed by the Postgres schema in `migrations/`.
#[derive(Clone)]
pub(crate) struct PgGradingStore {
    pool: PgPool,
}

impl PgGradingStore {
    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn referenced_or_backend(err: sqlx::Error, what: &'static str) -> StoreError {
    if is_constraint_violation(&err, FOREIGN_KEY_VIOLATION) {
        StoreError::Referenced(what)
    } else {
        StoreError::from(err)
    }
}

fn conflict_or_backend(err: sqlx::Error, message: &str) -> StoreError {
    if is_constraint_violation(&err, UNIQUE_VIOLATION) {
        StoreError::Conflict(message.to_string())
    } else {
        StoreError::from(err)
    }
}

#[async_trait]
impl GradingStore for PgGradingStore {
    async fn health(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await.context("database ping failed")?;
        Ok(())
    }

    async fn insert_rubric(&self, snapshot: &RubricSnapshot) -> Result<(), StoreError> {
        rubrics::insert(&self.pool, snapshot)
            .await
            .map_err(|err| conflict_or_backend(err, "rubric structure violates a constraint"))
    }

    async fn find_rubric(
        &self,
        owner_id: Uuid,
        rubric_id: Uuid,
    ) -> Result<Option<RubricSnapshot>, StoreError> {
        Ok(rubrics::find(&self.pool, owner_id, rubric_id).await?)
    }

    async fn list_rubrics(&self, owner_id: Uuid) -> Result<Vec<Rubric>, StoreError> {
        Ok(rubrics::list_by_owner(&self.pool, owner_id).await?)
    }

    async fn replace_rubric(&self, snapshot: &RubricSnapshot) -> Result<bool, StoreError> {
        match rubrics::replace(&self.pool, snapshot).await {
            Ok(None) => Ok(false),
            Ok(Some(false)) => Err(StoreError::Referenced("rubric")),
            Ok(Some(true)) => Ok(true),
            Err(err) => Err(referenced_or_backend(err, "rubric")),
        }
    }

    async fn delete_rubric(&self, owner_id: Uuid, rubric_id: Uuid) -> Result<bool, StoreError> {
        match rubrics::delete(&self.pool, owner_id, rubric_id).await {
            Ok(None) => Ok(false),
            Ok(Some(false)) => Err(StoreError::Referenced("rubric")),
            Ok(Some(true)) => Ok(true),
            Err(err) => Err(referenced_or_backend(err, "rubric")),
        }
    }

    async fn insert_assignment(&self, assignment: &Assignment) -> Result<(), StoreError> {
        Ok(assignments::insert(&self.pool, assignment).await?)
    }

    async fn find_assignment(
        &self,
        owner_id: Uuid,
        assignment_id: Uuid,
    ) -> Result<Option<Assignment>, StoreError> {
        Ok(assignments::find_for_owner(&self.pool, owner_id, assignment_id).await?)
    }

    async fn find_assignment_by_id(
        &self,
        assignment_id: Uuid,
    ) -> Result<Option<Assignment>, StoreError> {
        Ok(assignments::find_by_id(&self.pool, assignment_id).await?)
    }

    async fn list_assignments(
        &self,
        owner_id: Uuid,
    ) -> Result<Vec<AssignmentListItem>, StoreError> {
        Ok(assignments::list_with_counts(&self.pool, owner_id).await?)
    }

    async fn update_assignment(
        &self,
        owner_id: Uuid,
        assignment_id: Uuid,
        changes: &AssignmentChanges,
    ) -> Result<Option<Assignment>, StoreError> {
        match assignments::update(&self.pool, owner_id, assignment_id, changes).await? {
            assignments::UpdateOutcome::Missing => Ok(None),
            assignments::UpdateOutcome::RubricLocked => Err(StoreError::Conflict(
                "rubric cannot change once essays exist".to_string(),
            )),
            assignments::UpdateOutcome::Updated(assignment) => Ok(Some(assignment)),
        }
    }

    async fn delete_assignment(
        &self,
        owner_id: Uuid,
        assignment_id: Uuid,
    ) -> Result<bool, StoreError> {
        match assignments::delete(&self.pool, owner_id, assignment_id).await {
            Ok(None) => Ok(false),
            Ok(Some(false)) => Err(StoreError::Referenced("assignment")),
            Ok(Some(true)) => Ok(true),
            Err(err) => Err(referenced_or_backend(err, "assignment")),
        }
    }

    async fn transition_assignment(
        &self,
        assignment_id: Uuid,
        from: AssignmentStatus,
        to: AssignmentStatus,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError> {
        Ok(assignments::transition(&self.pool, assignment_id, from, to, now).await?)
    }

    async fn essay_status_counts(
        &self,
        assignment_id: Uuid,
    ) -> Result<EssayStatusCounts, StoreError> {
        Ok(assignments::essay_status_counts(&self.pool, assignment_id).await?)
    }

    async fn insert_essays(&self, batch: &[Essay]) -> Result<(), StoreError> {
        let inserted = essays::insert_many(&self.pool, batch)
            .await
            .map_err(|err| conflict_or_backend(err, "essay content already uploaded"))?;
        if inserted {
            Ok(())
        } else {
            Err(StoreError::Conflict("assignment no longer accepts essays".to_string()))
        }
    }

    async fn content_hashes(&self, assignment_id: Uuid) -> Result<Vec<String>, StoreError> {
        Ok(essays::content_hashes(&self.pool, assignment_id).await?)
    }

    async fn find_essay(
        &self,
        owner_id: Uuid,
        essay_id: Uuid,
    ) -> Result<Option<Essay>, StoreError> {
        Ok(essays::find_for_owner(&self.pool, owner_id, essay_id).await?)
    }

    async fn list_essays(
        &self,
        owner_id: Uuid,
        assignment_id: Uuid,
    ) -> Result<Vec<Essay>, StoreError> {
        Ok(essays::list_by_assignment(&self.pool, owner_id, assignment_id).await?)
    }

    async fn claim_next_essay(&self, now: PrimitiveDateTime) -> Result<Option<Essay>, StoreError> {
        Ok(essays::claim_next(&self.pool, Uuid::new_v4(), now).await?)
    }

    async fn set_extracted_text(
        &self,
        essay_id: Uuid,
        lease_id: Uuid,
        text: &str,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError> {
        Ok(essays::set_extracted_text(&self.pool, essay_id, lease_id, text, now).await?)
    }

    async fn release_essay(
        &self,
        essay_id: Uuid,
        lease_id: Uuid,
        error: &str,
        next_attempt_at: PrimitiveDateTime,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError> {
        Ok(essays::release(&self.pool, essay_id, lease_id, error, next_attempt_at, now).await?)
    }

    async fn fail_essay(
        &self,
        essay_id: Uuid,
        lease_id: Uuid,
        kind: FailureKind,
        error: &str,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError> {
        Ok(essays::fail(&self.pool, essay_id, lease_id, kind, error, now).await?)
    }

    async fn complete_grading(&self, completion: &GradingCompletion) -> Result<bool, StoreError> {
        grading_results::complete(&self.pool, completion)
            .await
            .map_err(|err| conflict_or_backend(err, "essay already has a grading result"))
    }

    async fn requeue_failed_essay(
        &self,
        owner_id: Uuid,
        essay_id: Uuid,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError> {
        Ok(essays::requeue_failed(&self.pool, owner_id, essay_id, now).await?)
    }

    async fn list_stale_processing(
        &self,
        claimed_before: PrimitiveDateTime,
    ) -> Result<Vec<Essay>, StoreError> {
        Ok(essays::list_stale_processing(&self.pool, claimed_before).await?)
    }

    async fn delete_essay(
        &self,
        owner_id: Uuid,
        essay_id: Uuid,
    ) -> Result<Option<Essay>, StoreError> {
        Ok(essays::delete_unless_processing(&self.pool, owner_id, essay_id).await?)
    }

    async fn approve_essay(
        &self,
        owner_id: Uuid,
        essay_id: Uuid,
        approved_by: Uuid,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError> {
        Ok(essays::approve(&self.pool, owner_id, essay_id, approved_by, now).await?)
    }

    async fn find_grading_result(&self, essay_id: Uuid) -> Result<Option<GradedEssay>, StoreError> {
        Ok(grading_results::find_for_essay(&self.pool, essay_id).await?)
    }

    async fn find_criterion_score(
        &self,
        owner_id: Uuid,
        score_id: Uuid,
    ) -> Result<Option<(CriterionScore, Essay)>, StoreError> {
        Ok(grading_results::find_score_for_owner(&self.pool, owner_id, score_id).await?)
    }

    async fn apply_override(
        &self,
        score_id: Uuid,
        teacher_level_id: Option<Uuid>,
        teacher_feedback: Option<String>,
        now: PrimitiveDateTime,
    ) -> Result<Option<CriterionScore>, StoreError> {
        Ok(grading_results::apply_override(
            &self.pool,
            score_id,
            teacher_level_id,
            teacher_feedback,
            now,
        )
        .await?)
    }

    async fn insert_annotation(&self, annotation: &Annotation) -> Result<(), StoreError> {
        Ok(annotations::insert(&self.pool, annotation).await?)
    }

    async fn find_annotation(
        &self,
        owner_id: Uuid,
        annotation_id: Uuid,
    ) -> Result<Option<(Annotation, Essay)>, StoreError> {
        Ok(annotations::find_for_owner(&self.pool, owner_id, annotation_id).await?)
    }

    async fn update_annotation(
        &self,
        annotation_id: Uuid,
        changes: &AnnotationChanges,
    ) -> Result<Option<Annotation>, StoreError> {
        Ok(annotations::update(&self.pool, annotation_id, changes).await?)
    }

    async fn remove_annotation(
        &self,
        annotation_id: Uuid,
        removed_by: Uuid,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError> {
        Ok(annotations::remove(&self.pool, annotation_id, removed_by, now).await?)
    }

    async fn list_annotations(
        &self,
        essay_id: Uuid,
        include_removed: bool,
    ) -> Result<Vec<Annotation>, StoreError> {
        Ok(annotations::list_for_essay(&self.pool, essay_id, include_removed).await?)
    }

    async fn list_due_for_purge(
        &self,
        now: PrimitiveDateTime,
        limit: u32,
    ) -> Result<Vec<Essay>, StoreError> {
        Ok(essays::list_due_for_purge(&self.pool, now, limit).await?)
    }

    async fn purge_essay_content(
        &self,
        essay_id: Uuid,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError> {
        Ok(essays::purge_content(&self.pool, essay_id, now).await?)
    }
}
