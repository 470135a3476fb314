use uuid::Uuid;

use crate::core::state::AppState;
use crate::db::models::{Assignment, Essay};
use crate::db::types::{AssignmentStatus, EssayStatus, FailureKind};
use crate::services::assignments::get_assignment;
use crate::services::errors::ServiceError;
use crate::store::EssayStatusCounts;

/// Bound on compare-and-set retries when several writers race on one assignment.
const RECOMPUTE_ROUNDS: usize = 4;

#[derive(Debug, Clone)]
pub(crate) struct BatchHandle {
    pub(crate) assignment_id: Uuid,
    pub(crate) status: AssignmentStatus,
    pub(crate) pending: i64,
    pub(crate) resumed: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct FailedEssay {
    pub(crate) essay_id: Uuid,
    pub(crate) file_name: String,
    pub(crate) attempt_count: i32,
    pub(crate) failure_kind: Option<FailureKind>,
    pub(crate) last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct BatchProgress {
    pub(crate) assignment: Assignment,
    pub(crate) counts: EssayStatusCounts,
    pub(crate) failed: Vec<FailedEssay>,
}

fn invalid_transition(from: AssignmentStatus, to: AssignmentStatus) -> ServiceError {
    ServiceError::InvalidTransition { entity: "assignment", from: from.as_str(), to: to.as_str() }
}

/// Applies every automatic assignment transition the current essay statuses allow.
///
/// Computed from a fresh aggregate on every call, so concurrent completions converge on the
/// same answer. A lost compare-and-set just means another writer moved first.
pub(crate) async fn recompute_assignment_status(
    state: &AppState,
    assignment_id: Uuid,
) -> Result<AssignmentStatus, ServiceError> {
    let mut status = AssignmentStatus::Draft;

    for _ in 0..RECOMPUTE_ROUNDS {
        let assignment = state
            .store()
            .find_assignment_by_id(assignment_id)
            .await?
            .ok_or(ServiceError::NotFound("assignment"))?;
        status = assignment.status;

        let counts = state.store().essay_status_counts(assignment_id).await?;
        let next = match status {
            AssignmentStatus::Grading if counts.all_settled() => AssignmentStatus::Review,
            AssignmentStatus::Review if counts.all_reviewed() => AssignmentStatus::Completed,
            _ => return Ok(status),
        };

        if state.store().transition_assignment(assignment_id, status, next, state.now()).await? {
            tracing::info!(
                %assignment_id,
                from = status.as_str(),
                to = next.as_str(),
                graded = counts.graded,
                failed = counts.failed,
                reviewed = counts.reviewed,
                "Assignment status advanced"
            );
        }
    }

    Ok(status)
}

/// Starts (or resumes) grading every pending essay of an assignment.
///
/// Idempotent while the assignment is already grading.
pub(crate) async fn run_batch(
    state: &AppState,
    owner_id: Uuid,
    assignment_id: Uuid,
) -> Result<BatchHandle, ServiceError> {
    let assignment = get_assignment(state, owner_id, assignment_id).await?;
    let counts = state.store().essay_status_counts(assignment_id).await?;

    match assignment.status {
        AssignmentStatus::Grading => {
            return Ok(BatchHandle {
                assignment_id,
                status: AssignmentStatus::Grading,
                pending: counts.pending,
                resumed: false,
            });
        }
        AssignmentStatus::Review | AssignmentStatus::Completed => {
            return Err(invalid_transition(assignment.status, AssignmentStatus::Grading));
        }
        AssignmentStatus::Draft => {}
    }

    if counts.total() == 0 {
        return Err(ServiceError::validation("assignment has no essays to grade"));
    }
    let resumed = counts.total() > counts.pending;
    if counts.pending == 0 && !resumed {
        return Err(ServiceError::validation("assignment has no pending essays"));
    }

    let moved = state
        .store()
        .transition_assignment(
            assignment_id,
            AssignmentStatus::Draft,
            AssignmentStatus::Grading,
            state.now(),
        )
        .await?;

    if !moved {
        let current = get_assignment(state, owner_id, assignment_id).await?;
        if current.status != AssignmentStatus::Grading {
            return Err(invalid_transition(current.status, AssignmentStatus::Grading));
        }
    }

    let status = recompute_assignment_status(state, assignment_id).await?;
    metrics::counter!("grading_batches_started_total").increment(1);
    tracing::info!(
        %owner_id,
        %assignment_id,
        pending = counts.pending,
        resumed,
        status = status.as_str(),
        "Grading batch started"
    );

    Ok(BatchHandle { assignment_id, status, pending: counts.pending, resumed })
}

/// Stops new claims for the batch. In-flight essays finish their current attempt.
pub(crate) async fn cancel_batch(
    state: &AppState,
    owner_id: Uuid,
    assignment_id: Uuid,
) -> Result<Assignment, ServiceError> {
    let assignment = get_assignment(state, owner_id, assignment_id).await?;
    if assignment.status != AssignmentStatus::Grading {
        return Err(invalid_transition(assignment.status, AssignmentStatus::Draft));
    }

    let moved = state
        .store()
        .transition_assignment(
            assignment_id,
            AssignmentStatus::Grading,
            AssignmentStatus::Draft,
            state.now(),
        )
        .await?;

    let current = get_assignment(state, owner_id, assignment_id).await?;
    if !moved && current.status != AssignmentStatus::Draft {
        return Err(invalid_transition(current.status, AssignmentStatus::Draft));
    }

    tracing::info!(%owner_id, %assignment_id, "Grading batch cancelled");
    Ok(current)
}

pub(crate) async fn batch_progress(
    state: &AppState,
    owner_id: Uuid,
    assignment_id: Uuid,
) -> Result<BatchProgress, ServiceError> {
    let assignment = get_assignment(state, owner_id, assignment_id).await?;
    let counts = state.store().essay_status_counts(assignment_id).await?;
    let failed = state
        .store()
        .list_essays(owner_id, assignment_id)
        .await?
        .into_iter()
        .filter(|essay| essay.status == EssayStatus::Failed)
        .map(|essay| FailedEssay {
            essay_id: essay.id,
            file_name: essay.file_name,
            attempt_count: essay.attempt_count,
            failure_kind: essay.failure_kind,
            last_error: essay.last_error,
        })
        .collect();

    Ok(BatchProgress { assignment, counts, failed })
}

/// Manual retry of a failed essay with a fresh attempt budget.
pub(crate) async fn retry_essay(
    state: &AppState,
    owner_id: Uuid,
    essay_id: Uuid,
) -> Result<Essay, ServiceError> {
    let essay =
        state.store().find_essay(owner_id, essay_id).await?.ok_or(ServiceError::NotFound("essay"))?;

    if essay.status != EssayStatus::Failed {
        return Err(ServiceError::InvalidTransition {
            entity: "essay",
            from: essay.status.as_str(),
            to: EssayStatus::Pending.as_str(),
        });
    }

    let assignment = get_assignment(state, owner_id, essay.assignment_id).await?;
    if assignment.status == AssignmentStatus::Completed {
        return Err(ServiceError::Conflict("assignment is already completed".to_string()));
    }

    if !state.store().requeue_failed_essay(owner_id, essay_id, state.now()).await? {
        return Err(ServiceError::Conflict("essay changed while retrying".to_string()));
    }

    tracing::info!(%owner_id, %essay_id, assignment_id = %essay.assignment_id, "Failed essay requeued");
    state.store().find_essay(owner_id, essay_id).await?.ok_or(ServiceError::NotFound("essay"))
}
