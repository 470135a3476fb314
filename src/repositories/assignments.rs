use sqlx::PgPool;
use time::PrimitiveDateTime;
use uuid::Uuid;

use crate::db::models::{Assignment, AssignmentListItem};
use crate::db::types::{AssignmentStatus, EssayStatus};
use crate::store::{AssignmentChanges, EssayStatusCounts};

pub(crate) const COLUMNS: &str =
    "id, owner_id, rubric_id, title, prompt, source_text, status, created_at, updated_at";

pub(crate) async fn insert(pool: &PgPool, assignment: &Assignment) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO assignments (
            id, owner_id, rubric_id, title, prompt, source_text, status, created_at, updated_at
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(assignment.id)
    .bind(assignment.owner_id)
    .bind(assignment.rubric_id)
    .bind(&assignment.title)
    .bind(&assignment.prompt)
    .bind(&assignment.source_text)
    .bind(assignment.status)
    .bind(assignment.created_at)
    .bind(assignment.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub(crate) async fn find_for_owner(
    pool: &PgPool,
    owner_id: Uuid,
    assignment_id: Uuid,
) -> Result<Option<Assignment>, sqlx::Error> {
    sqlx::query_as::<_, Assignment>(&format!(
        "SELECT {COLUMNS} FROM assignments WHERE id = $1 AND owner_id = $2"
    ))
    .bind(assignment_id)
    .bind(owner_id)
    .fetch_optional(pool)
    .await
}

pub(crate) async fn find_by_id(
    pool: &PgPool,
    assignment_id: Uuid,
) -> Result<Option<Assignment>, sqlx::Error> {
    sqlx::query_as::<_, Assignment>(&format!("SELECT {COLUMNS} FROM assignments WHERE id = $1"))
        .bind(assignment_id)
        .fetch_optional(pool)
        .await
}

pub(crate) async fn list_with_counts(
    pool: &PgPool,
    owner_id: Uuid,
) -> Result<Vec<AssignmentListItem>, sqlx::Error> {
    sqlx::query_as::<_, AssignmentListItem>(
        "SELECT a.id, a.owner_id, a.rubric_id, a.title, a.prompt, a.source_text, a.status,
                a.created_at, a.updated_at,
                (SELECT COUNT(*) FROM essays e WHERE e.assignment_id = a.id) AS essay_count
         FROM assignments a
         WHERE a.owner_id = $1
         ORDER BY a.created_at DESC",
    )
    .bind(owner_id)
    .fetch_all(pool)
    .await
}

pub(crate) async fn has_essays(
    executor: impl sqlx::PgExecutor<'_>,
    assignment_id: Uuid,
) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM essays WHERE assignment_id = $1)")
        .bind(assignment_id)
        .fetch_one(executor)
        .await
}

pub(crate) enum UpdateOutcome {
    Missing,
    RubricLocked,
    Updated(Assignment),
}

pub(crate) async fn update(
    pool: &PgPool,
    owner_id: Uuid,
    assignment_id: Uuid,
    changes: &AssignmentChanges,
) -> Result<UpdateOutcome, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let current = sqlx::query_as::<_, Assignment>(&format!(
        "SELECT {COLUMNS} FROM assignments WHERE id = $1 AND owner_id = $2 FOR UPDATE"
    ))
    .bind(assignment_id)
    .bind(owner_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(current) = current else {
        return Ok(UpdateOutcome::Missing);
    };

    let rubric_changes =
        changes.rubric_id.is_some_and(|rubric_id| rubric_id != current.rubric_id);
    if rubric_changes && has_essays(&mut *tx, assignment_id).await? {
        return Ok(UpdateOutcome::RubricLocked);
    }

    let (set_source_text, source_text) = match &changes.source_text {
        Some(value) => (true, value.clone()),
        None => (false, None),
    };

    let updated = sqlx::query_as::<_, Assignment>(&format!(
        "UPDATE assignments
         SET title = COALESCE($1, title),
             prompt = COALESCE($2, prompt),
             source_text = CASE WHEN $3 THEN $4 ELSE source_text END,
             rubric_id = COALESCE($5, rubric_id),
             updated_at = $6
         WHERE id = $7
         RETURNING {COLUMNS}"
    ))
    .bind(&changes.title)
    .bind(&changes.prompt)
    .bind(set_source_text)
    .bind(source_text)
    .bind(changes.rubric_id)
    .bind(changes.updated_at)
    .bind(assignment_id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(UpdateOutcome::Updated(updated))
}

/// Returns `Ok(None)` when missing and `Ok(Some(false))` while essays exist.
pub(crate) async fn delete(
    pool: &PgPool,
    owner_id: Uuid,
    assignment_id: Uuid,
) -> Result<Option<bool>, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let exists = sqlx::query_scalar::<_, Uuid>(
        "SELECT id FROM assignments WHERE id = $1 AND owner_id = $2 FOR UPDATE",
    )
    .bind(assignment_id)
    .bind(owner_id)
    .fetch_optional(&mut *tx)
    .await?;

    if exists.is_none() {
        return Ok(None);
    }

    if has_essays(&mut *tx, assignment_id).await? {
        return Ok(Some(false));
    }

    sqlx::query("DELETE FROM assignments WHERE id = $1")
        .bind(assignment_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(Some(true))
}

/// Moves the assignment `from -> to` under a row lock. The settle edges (`review`,
/// `completed`) re-check the essay aggregate inside the same transaction, so they serialize
/// with `essays::insert_many`.
pub(crate) async fn transition(
    pool: &PgPool,
    assignment_id: Uuid,
    from: AssignmentStatus,
    to: AssignmentStatus,
    now: PrimitiveDateTime,
) -> Result<bool, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let current = sqlx::query_scalar::<_, AssignmentStatus>(
        "SELECT status FROM assignments WHERE id = $1 FOR UPDATE",
    )
    .bind(assignment_id)
    .fetch_optional(&mut *tx)
    .await?;
    if current != Some(from) {
        return Ok(false);
    }

    let ready = match to {
        AssignmentStatus::Review => {
            essay_status_counts(&mut *tx, assignment_id).await?.all_settled()
        }
        AssignmentStatus::Completed => {
            essay_status_counts(&mut *tx, assignment_id).await?.all_reviewed()
        }
        AssignmentStatus::Draft | AssignmentStatus::Grading => true,
    };
    if !ready {
        return Ok(false);
    }

    sqlx::query("UPDATE assignments SET status = $1, updated_at = $2 WHERE id = $3")
        .bind(to)
        .bind(now)
        .bind(assignment_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    Ok(true)
}

pub(crate) async fn essay_status_counts(
    executor: impl sqlx::PgExecutor<'_>,
    assignment_id: Uuid,
) -> Result<EssayStatusCounts, sqlx::Error> {
    let rows = sqlx::query_as::<_, (EssayStatus, i64)>(
        "SELECT status, COUNT(*) FROM essays WHERE assignment_id = $1 GROUP BY status",
    )
    .bind(assignment_id)
    .fetch_all(executor)
    .await?;

    let mut counts = EssayStatusCounts::default();
    for (status, count) in rows {
        counts.add(status, count);
    }
    Ok(counts)
}
