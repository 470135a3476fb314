use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use thiserror::Error;
use tokio::time::timeout;
use uuid::Uuid;

use crate::core::config::Settings;
use crate::core::state::AppState;
use crate::core::time::add_std;
use crate::db::models::{Annotation, CriterionScore, Essay, GradingResult};
use crate::db::types::{AnnotationOrigin, FailureKind};
use crate::services::extraction::{EssayFile, ExtractionError, RoutingExtractor, TextExtractor};
use crate::services::grader::{
    validate_output, EssayGrader, GraderError, GradingRequest, OpenAiEssayGrader,
};
use crate::services::retention;
use crate::store::{GradingCompletion, RubricSnapshot, StoreError};

use super::batch::recompute_assignment_status;

/// The two external collaborators an essay passes through.
#[derive(Clone)]
pub(crate) struct Pipeline {
    extractor: Arc<dyn TextExtractor>,
    grader: Arc<dyn EssayGrader>,
}

impl Pipeline {
    pub(crate) fn new(extractor: Arc<dyn TextExtractor>, grader: Arc<dyn EssayGrader>) -> Self {
        Self { extractor, grader }
    }

    pub(crate) fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        Ok(Self::new(
            Arc::new(RoutingExtractor::from_settings(settings)?),
            Arc::new(OpenAiEssayGrader::from_settings(settings)?),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessingStage {
    Extraction,
    Grading,
}

impl ProcessingStage {
    fn as_str(self) -> &'static str {
        match self {
            Self::Extraction => "extraction",
            Self::Grading => "grading",
        }
    }

    fn exhausted(self) -> FailureKind {
        match self {
            Self::Extraction => FailureKind::ExtractionExhausted,
            Self::Grading => FailureKind::GradingExhausted,
        }
    }
}

#[derive(Debug, Error)]
pub(crate) enum ProcessingError {
    #[error("{} failed: {reason}", stage.as_str())]
    Retryable { stage: ProcessingStage, reason: String },
    #[error("{reason}")]
    Terminal { kind: FailureKind, reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ProcessingError {
    fn retryable(stage: ProcessingStage, reason: impl Into<String>) -> Self {
        Self::Retryable { stage, reason: reason.into() }
    }

    fn terminal(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self::Terminal { kind, reason: reason.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EssayOutcome {
    Graded,
    Retrying,
    Failed(FailureKind),
    /// Another writer moved the essay out of our claim; nothing was written.
    LeaseLost,
}

impl EssayOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Graded => "graded",
            Self::Retrying => "retrying",
            Self::Failed(_) => "failed",
            Self::LeaseLost => "lease_lost",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct EssayProcessed {
    pub(crate) essay_id: Uuid,
    pub(crate) assignment_id: Uuid,
    pub(crate) attempt: i32,
    pub(crate) outcome: EssayOutcome,
}

/// Claims one eligible essay and drives it to its next status.
///
/// Returns `Ok(None)` when nothing is claimable. A store failure after the claim leaves the
/// essay in `processing`; stale-claim recovery returns it to the queue once the lease expires.
pub(crate) async fn process_next(
    state: &AppState,
    pipeline: &Pipeline,
) -> anyhow::Result<Option<EssayProcessed>> {
    let Some(essay) =
        state.store().claim_next_essay(state.now()).await.context("Failed to claim essay")?
    else {
        return Ok(None);
    };
    let lease_id = essay.lease_id.context("Claimed essay has no lease")?;
    let started = Instant::now();

    tracing::debug!(
        essay_id = %essay.id,
        assignment_id = %essay.assignment_id,
        attempt = essay.attempt_count,
        "Essay claimed"
    );

    let outcome = match grade_claimed(state, pipeline, &essay, lease_id).await {
        Ok(true) => EssayOutcome::Graded,
        Ok(false) => EssayOutcome::LeaseLost,
        Err(ProcessingError::Store(err)) => {
            return Err(anyhow::Error::new(err).context("Store failed while grading essay"));
        }
        Err(ProcessingError::Retryable { stage, reason }) => {
            settle_retryable(state, &essay, lease_id, stage, &reason).await?
        }
        Err(ProcessingError::Terminal { kind, reason }) => {
            tracing::warn!(essay_id = %essay.id, failure_kind = kind.as_str(), reason = %reason, "Essay failed");
            if state.store().fail_essay(essay.id, lease_id, kind, &reason, state.now()).await? {
                EssayOutcome::Failed(kind)
            } else {
                EssayOutcome::LeaseLost
            }
        }
    };

    metrics::counter!("grading_jobs_total", "status" => outcome.as_str()).increment(1);
    metrics::histogram!("grading_duration_seconds").record(started.elapsed().as_secs_f64());

    if outcome != EssayOutcome::LeaseLost {
        recompute_assignment_status(state, essay.assignment_id)
            .await
            .context("Failed to recompute assignment status")?;
    } else {
        tracing::info!(essay_id = %essay.id, "Essay lease lost; result discarded");
    }

    Ok(Some(EssayProcessed {
        essay_id: essay.id,
        assignment_id: essay.assignment_id,
        attempt: essay.attempt_count,
        outcome,
    }))
}

/// Releases a retryable failure back to the queue, or fails the essay once its attempts are used.
pub(super) async fn settle_retryable(
    state: &AppState,
    essay: &Essay,
    lease_id: Uuid,
    stage: ProcessingStage,
    reason: &str,
) -> Result<EssayOutcome, StoreError> {
    let grading = state.settings().grading();
    let now = state.now();
    let attempt = u32::try_from(essay.attempt_count).unwrap_or(0);

    if attempt >= grading.max_attempts {
        let kind = stage.exhausted();
        tracing::warn!(
            essay_id = %essay.id,
            attempt,
            failure_kind = kind.as_str(),
            reason,
            "Essay exhausted its attempts"
        );
        return Ok(if state.store().fail_essay(essay.id, lease_id, kind, reason, now).await? {
            EssayOutcome::Failed(kind)
        } else {
            EssayOutcome::LeaseLost
        });
    }

    let next_attempt_at = add_std(now, grading.backoff_for(attempt));
    tracing::info!(
        essay_id = %essay.id,
        attempt,
        stage = stage.as_str(),
        reason,
        next_attempt_at = %next_attempt_at,
        "Essay released for retry"
    );
    Ok(if state.store().release_essay(essay.id, lease_id, reason, next_attempt_at, now).await? {
        EssayOutcome::Retrying
    } else {
        EssayOutcome::LeaseLost
    })
}

/// `Ok(false)` means the lease was lost somewhere along the way.
async fn grade_claimed(
    state: &AppState,
    pipeline: &Pipeline,
    essay: &Essay,
    lease_id: Uuid,
) -> Result<bool, ProcessingError> {
    let assignment = state
        .store()
        .find_assignment_by_id(essay.assignment_id)
        .await?
        .ok_or_else(|| StoreError::Backend(anyhow::anyhow!("assignment {} vanished", essay.assignment_id)))?;
    let rubric = state
        .store()
        .find_rubric(assignment.owner_id, assignment.rubric_id)
        .await?
        .ok_or_else(|| StoreError::Backend(anyhow::anyhow!("rubric {} vanished", assignment.rubric_id)))?;

    let text = match essay.extracted_text.clone() {
        Some(text) => text,
        None => {
            let text = extract_text(state, pipeline, essay).await?;
            if !state.store().set_extracted_text(essay.id, lease_id, &text, state.now()).await? {
                return Ok(false);
            }
            text
        }
    };

    let request = GradingRequest {
        essay_id: essay.id,
        essay_text: &text,
        rubric: &rubric,
        prompt: &assignment.prompt,
        source_text: assignment.source_text.as_deref(),
    };
    let output = match timeout(state.settings().grading().grader_timeout(), pipeline.grader.score(request)).await {
        Err(_) | Ok(Err(GraderError::Timeout)) => {
            return Err(ProcessingError::retryable(ProcessingStage::Grading, "grader timed out"));
        }
        Ok(Err(GraderError::Failed(reason))) => {
            return Err(ProcessingError::retryable(ProcessingStage::Grading, reason));
        }
        Ok(Err(GraderError::ContractViolation(reason))) => {
            return Err(ProcessingError::terminal(FailureKind::ContractViolation, reason));
        }
        Ok(Ok(output)) => output,
    };

    let text_len = text.chars().count();
    validate_output(&rubric, &output, text_len).map_err(|reason| {
        ProcessingError::terminal(FailureKind::ContractViolation, format!("grader output rejected: {reason}"))
    })?;

    let completion = build_completion(state, essay, lease_id, &rubric, output);
    match state.store().complete_grading(&completion).await {
        Ok(applied) => Ok(applied),
        Err(StoreError::Conflict(reason)) => {
            tracing::warn!(essay_id = %essay.id, reason = %reason, "Grading result already recorded");
            Ok(false)
        }
        Err(err) => Err(err.into()),
    }
}

async fn extract_text(
    state: &AppState,
    pipeline: &Pipeline,
    essay: &Essay,
) -> Result<String, ProcessingError> {
    let key = essay.storage_key.as_deref().ok_or_else(|| {
        ProcessingError::terminal(FailureKind::MissingContent, "stored file is no longer available")
    })?;
    let storage = state.storage().ok_or_else(|| {
        ProcessingError::retryable(ProcessingStage::Extraction, "object storage is not configured")
    })?;
    let bytes = storage.get(key).await.map_err(|err| {
        ProcessingError::retryable(ProcessingStage::Extraction, format!("failed to read stored file: {err:#}"))
    })?;

    let file = EssayFile {
        file_name: essay.file_name.clone(),
        content_type: essay.content_type.clone(),
        bytes,
    };
    let text = match timeout(state.settings().grading().extract_timeout(), pipeline.extractor.extract(&file)).await {
        Err(_) => {
            return Err(ProcessingError::retryable(ProcessingStage::Extraction, "extraction timed out"));
        }
        Ok(Err(ExtractionError::Failed { reason })) => {
            return Err(ProcessingError::retryable(ProcessingStage::Extraction, reason));
        }
        Ok(Err(ExtractionError::Unreadable { reason })) => {
            return Err(ProcessingError::terminal(FailureKind::MissingContent, reason));
        }
        Ok(Ok(text)) => text,
    };

    if text.trim().is_empty() {
        return Err(ProcessingError::terminal(FailureKind::MissingContent, "no text could be extracted"));
    }
    Ok(text)
}

fn build_completion(
    state: &AppState,
    essay: &Essay,
    lease_id: Uuid,
    rubric: &RubricSnapshot,
    output: crate::services::grader::GraderOutput,
) -> GradingCompletion {
    let graded_at = state.now();
    let result = GradingResult {
        id: Uuid::new_v4(),
        essay_id: essay.id,
        rubric_id: rubric.rubric.id,
        rubric_version: rubric.rubric.version,
        grading_key: format!("{}:{}", essay.id, rubric.rubric.version),
        teacher_approved: false,
        approved_at: None,
        approved_by: None,
        created_at: graded_at,
    };

    let scores = output
        .scores
        .into_iter()
        .map(|selection| CriterionScore {
            id: Uuid::new_v4(),
            grading_result_id: result.id,
            criterion_id: selection.criterion_id,
            ai_level_id: selection.level_id,
            ai_feedback: selection.feedback,
            teacher_level_id: None,
            teacher_feedback: None,
            updated_at: graded_at,
        })
        .collect();

    let annotations = output
        .annotations
        .into_iter()
        .map(|draft| Annotation {
            id: Uuid::new_v4(),
            essay_id: essay.id,
            origin: AnnotationOrigin::Ai,
            kind: draft.kind,
            start_offset: draft.start_offset,
            end_offset: draft.end_offset,
            comment: draft.comment,
            created_at: graded_at,
            updated_at: graded_at,
            removed_at: None,
            removed_by: None,
        })
        .collect();

    GradingCompletion {
        essay_id: essay.id,
        lease_id,
        result,
        scores,
        annotations,
        graded_at,
        delete_after: retention::schedule_deletion(graded_at, state.settings()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::db::types::{AnnotationKind, AssignmentStatus, EssayStatus};
    use crate::services::grader::{AnnotationDraft, GraderOutput, LevelSelection};
    use crate::tasks::grading::run_batch;
    use crate::test_support::{
        self, assignment_fixture, essay_fixture, rubric_fixture, FakeExtractor, FakeGrader,
        Harness,
    };

    struct Scenario {
        harness: Harness,
        rubric: RubricSnapshot,
        essay: Essay,
    }

    async fn scenario(text: &str) -> Scenario {
        let harness = test_support::harness().await;
        let owner = Uuid::new_v4();
        let rubric = rubric_fixture(owner, &[&[0, 1, 2], &[0, 5]]);
        let mut assignment = assignment_fixture(&rubric);
        assignment.status = AssignmentStatus::Grading;
        harness.store.seed_rubric(rubric.clone());
        harness.store.seed_assignment(assignment.clone());

        let essay = essay_fixture(&assignment, "alice.txt");
        harness.storage.seed(essay.storage_key.as_deref().expect("key"), text.as_bytes().to_vec());
        harness.store.seed_essay(essay.clone());
        Scenario { harness, rubric, essay }
    }

    fn full_marks(rubric: &RubricSnapshot) -> GraderOutput {
        GraderOutput {
            scores: rubric
                .criteria
                .iter()
                .map(|entry| LevelSelection {
                    criterion_id: entry.criterion.id,
                    level_id: entry.levels.last().expect("level").id,
                    feedback: format!("{} is strong", entry.criterion.name),
                })
                .collect(),
            annotations: vec![AnnotationDraft {
                kind: AnnotationKind::Highlight,
                start_offset: 0,
                end_offset: 5,
                comment: Some("good opening".to_string()),
            }],
        }
    }

    fn pipeline(extractor: FakeExtractor, grader: FakeGrader) -> Pipeline {
        Pipeline::new(Arc::new(extractor), Arc::new(grader))
    }

    #[tokio::test]
    async fn returns_none_when_queue_is_empty() {
        let harness = test_support::harness().await;
        let pipeline = pipeline(FakeExtractor::passthrough(), FakeGrader::scripted(vec![]));
        assert!(process_next(&harness.state, &pipeline).await.expect("process").is_none());
    }

    #[tokio::test]
    async fn grades_essay_and_moves_assignment_to_review() {
        let Scenario { harness, rubric, essay } = scenario("Hello world, this is my essay.").await;
        let grader = FakeGrader::scripted(vec![Ok(full_marks(&rubric))]);
        let pipeline = pipeline(FakeExtractor::passthrough(), grader);

        let processed = process_next(&harness.state, &pipeline).await.expect("process").expect("claimed");
        assert_eq!(processed.outcome, EssayOutcome::Graded);
        assert_eq!(processed.attempt, 1);

        let stored = harness.store.essay(essay.id);
        assert_eq!(stored.status, EssayStatus::Graded);
        assert!(stored.lease_id.is_none());
        assert_eq!(stored.extracted_text.as_deref(), Some("Hello world, this is my essay."));
        assert!(stored.delete_after.is_some());

        let graded = harness.store.graded(essay.id);
        assert_eq!(graded.scores.len(), 2);
        assert_eq!(graded.result.grading_key, format!("{}:{}", essay.id, rubric.rubric.version));
        assert!(graded.scores.iter().all(|score| score.teacher_level_id.is_none()));

        let annotations = harness.store.annotations_for(essay.id);
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations[0].origin, AnnotationOrigin::Ai);

        assert_eq!(harness.store.assignment(essay.assignment_id).status, AssignmentStatus::Review);
    }

    #[tokio::test]
    async fn duplicate_batch_starts_grade_each_essay_once() {
        let Scenario { harness, rubric, essay } = scenario("Essay text").await;
        harness.store.set_assignment_status(essay.assignment_id, AssignmentStatus::Draft);
        let owner = essay.owner_id;

        let (first, second) = tokio::join!(
            run_batch(&harness.state, owner, essay.assignment_id),
            run_batch(&harness.state, owner, essay.assignment_id),
        );
        assert_eq!(first.expect("first start").status, AssignmentStatus::Grading);
        assert_eq!(second.expect("second start").status, AssignmentStatus::Grading);

        let grader = FakeGrader::scripted(vec![Ok(full_marks(&rubric))]);
        let pipeline = pipeline(FakeExtractor::passthrough(), grader);
        let (left, right) = tokio::join!(
            process_next(&harness.state, &pipeline),
            process_next(&harness.state, &pipeline),
        );
        let outcomes: Vec<Option<EssayOutcome>> = [left, right]
            .into_iter()
            .map(|result| result.expect("process").map(|processed| processed.outcome))
            .collect();

        let graded = outcomes.iter().filter(|outcome| **outcome == Some(EssayOutcome::Graded));
        assert_eq!(graded.count(), 1);
        assert_eq!(outcomes.iter().filter(|outcome| outcome.is_none()).count(), 1);
        assert_eq!(harness.store.grading_result_count(), 1);
        assert_eq!(harness.store.essay(essay.id).attempt_count, 1);
    }

    #[tokio::test]
    async fn grader_failure_is_retried_with_backoff() {
        let Scenario { harness, rubric, essay } = scenario("Essay text").await;
        let grader = FakeGrader::scripted(vec![
            Err(GraderError::Failed("upstream 503".to_string())),
            Ok(full_marks(&rubric)),
        ]);
        let pipeline = pipeline(FakeExtractor::passthrough(), grader);

        let first = process_next(&harness.state, &pipeline).await.expect("process").expect("claimed");
        assert_eq!(first.outcome, EssayOutcome::Retrying);
        let released = harness.store.essay(essay.id);
        assert_eq!(released.status, EssayStatus::Pending);
        assert_eq!(released.last_error.as_deref(), Some("upstream 503"));
        assert!(released.next_attempt_at > harness.state.now());

        assert!(process_next(&harness.state, &pipeline).await.expect("process").is_none());

        let backoff = harness.state.settings().grading().backoff_for(1);
        harness.clock.advance(backoff);
        let second = process_next(&harness.state, &pipeline).await.expect("process").expect("claimed");
        assert_eq!(second.outcome, EssayOutcome::Graded);
        assert_eq!(second.attempt, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_exhaust_attempts_and_fail_the_essay() {
        let Scenario { harness, essay, .. } = scenario("Essay text").await;
        let pipeline = pipeline(FakeExtractor::passthrough(), FakeGrader::hanging());
        let max_attempts = harness.state.settings().grading().max_attempts;

        for attempt in 1..=max_attempts {
            let processed =
                process_next(&harness.state, &pipeline).await.expect("process").expect("claimed");
            if attempt < max_attempts {
                assert_eq!(processed.outcome, EssayOutcome::Retrying);
                harness.clock.advance(Duration::from_secs(24 * 3600));
            } else {
                assert_eq!(processed.outcome, EssayOutcome::Failed(FailureKind::GradingExhausted));
            }
        }

        let failed = harness.store.essay(essay.id);
        assert_eq!(failed.status, EssayStatus::Failed);
        assert_eq!(failed.attempt_count as u32, max_attempts);
        assert_eq!(failed.failure_kind, Some(FailureKind::GradingExhausted));
        assert_eq!(harness.store.assignment(essay.assignment_id).status, AssignmentStatus::Review);
    }

    #[tokio::test]
    async fn unknown_level_is_a_contract_violation() {
        let Scenario { harness, rubric, essay } = scenario("Essay text").await;
        let mut output = full_marks(&rubric);
        output.scores[0].level_id = Uuid::new_v4();
        let pipeline = pipeline(FakeExtractor::passthrough(), FakeGrader::scripted(vec![Ok(output)]));

        let processed = process_next(&harness.state, &pipeline).await.expect("process").expect("claimed");
        assert_eq!(processed.outcome, EssayOutcome::Failed(FailureKind::ContractViolation));
        assert!(harness.store.graded_opt(essay.id).is_none());
    }

    #[tokio::test]
    async fn contract_violation_leaves_siblings_graded() {
        let Scenario { harness, rubric, essay } = scenario("First essay").await;
        let assignment = harness.store.assignment(essay.assignment_id);
        let sibling = essay_fixture(&assignment, "bob.txt");
        harness
            .storage
            .seed(sibling.storage_key.as_deref().expect("key"), b"Second essay".to_vec());
        harness.store.seed_essay(sibling.clone());

        let mut broken = full_marks(&rubric);
        broken.scores[1].level_id = rubric.criteria[0].levels[0].id;
        let grader = FakeGrader::scripted(vec![Ok(broken), Ok(full_marks(&rubric))]);
        let pipeline = pipeline(FakeExtractor::passthrough(), grader);

        let first = process_next(&harness.state, &pipeline).await.expect("process").expect("claimed");
        let second = process_next(&harness.state, &pipeline).await.expect("process").expect("claimed");
        assert_eq!(first.outcome, EssayOutcome::Failed(FailureKind::ContractViolation));
        assert_eq!(second.outcome, EssayOutcome::Graded);

        let statuses = [harness.store.essay(essay.id).status, harness.store.essay(sibling.id).status];
        assert!(statuses.contains(&EssayStatus::Failed));
        assert!(statuses.contains(&EssayStatus::Graded));
        assert_eq!(harness.store.assignment(assignment.id).status, AssignmentStatus::Review);
    }

    #[tokio::test]
    async fn out_of_range_annotation_is_rejected() {
        let Scenario { harness, rubric, essay } = scenario("short").await;
        let mut output = full_marks(&rubric);
        output.annotations[0].end_offset = 50;
        let pipeline = pipeline(FakeExtractor::passthrough(), FakeGrader::scripted(vec![Ok(output)]));

        let processed = process_next(&harness.state, &pipeline).await.expect("process").expect("claimed");
        assert_eq!(processed.outcome, EssayOutcome::Failed(FailureKind::ContractViolation));
        assert_eq!(harness.store.essay(essay.id).status, EssayStatus::Failed);
    }

    #[tokio::test]
    async fn unreadable_file_fails_without_retry() {
        let Scenario { harness, essay, .. } = scenario("Essay text").await;
        let pipeline = pipeline(FakeExtractor::unreadable(), FakeGrader::scripted(vec![]));

        let processed = process_next(&harness.state, &pipeline).await.expect("process").expect("claimed");
        assert_eq!(processed.outcome, EssayOutcome::Failed(FailureKind::MissingContent));
        assert_eq!(harness.store.essay(essay.id).attempt_count, 1);
    }

    #[tokio::test]
    async fn blank_extraction_is_missing_content() {
        let Scenario { harness, .. } = scenario("   \n  ").await;
        let pipeline = pipeline(FakeExtractor::passthrough(), FakeGrader::scripted(vec![]));

        let processed = process_next(&harness.state, &pipeline).await.expect("process").expect("claimed");
        assert_eq!(processed.outcome, EssayOutcome::Failed(FailureKind::MissingContent));
    }

    #[tokio::test]
    async fn draft_assignments_are_not_claimed() {
        let Scenario { harness, rubric, essay } = scenario("Essay text").await;
        harness.store.set_assignment_status(essay.assignment_id, AssignmentStatus::Draft);
        let pipeline =
            pipeline(FakeExtractor::passthrough(), FakeGrader::scripted(vec![Ok(full_marks(&rubric))]));

        assert!(process_next(&harness.state, &pipeline).await.expect("process").is_none());
        assert_eq!(harness.store.essay(essay.id).status, EssayStatus::Pending);
    }
}
