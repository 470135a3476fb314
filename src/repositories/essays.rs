use sqlx::{PgPool, QueryBuilder};
use time::PrimitiveDateTime;
use uuid::Uuid;

use crate::db::models::Essay;
use crate::db::types::{AssignmentStatus, EssayStatus, FailureKind};
use crate::repositories::qualified;

pub(crate) const COLUMNS: &str = "\
    id, assignment_id, owner_id, file_name, student_name, content_type, storage_key, \
    content_hash, extracted_text, status, attempt_count, next_attempt_at, lease_id, claimed_at, \
    last_error, failure_kind, graded_at, reviewed_at, delete_after, content_purged_at, \
    created_at, updated_at";

/// Inserts one upload's essays while holding the assignment row lock. Returns `false`
/// without inserting once the assignment has left `draft`/`grading`.
pub(crate) async fn insert_many(pool: &PgPool, essays: &[Essay]) -> Result<bool, sqlx::Error> {
    let Some(first) = essays.first() else {
        return Ok(true);
    };

    let mut tx = pool.begin().await?;
    let status = sqlx::query_scalar::<_, AssignmentStatus>(
        "SELECT status FROM assignments WHERE id = $1 FOR UPDATE",
    )
    .bind(first.assignment_id)
    .fetch_optional(&mut *tx)
    .await?;
    if !status.is_some_and(AssignmentStatus::accepts_uploads) {
        return Ok(false);
    }

    let mut builder = QueryBuilder::new(
        "INSERT INTO essays (
            id, assignment_id, owner_id, file_name, student_name, content_type, storage_key,
            content_hash, status, attempt_count, next_attempt_at, created_at, updated_at
         ) ",
    );
    builder.push_values(essays, |mut row, essay| {
        row.push_bind(essay.id)
            .push_bind(essay.assignment_id)
            .push_bind(essay.owner_id)
            .push_bind(&essay.file_name)
            .push_bind(&essay.student_name)
            .push_bind(&essay.content_type)
            .push_bind(&essay.storage_key)
            .push_bind(&essay.content_hash)
            .push_bind(essay.status)
            .push_bind(essay.attempt_count)
            .push_bind(essay.next_attempt_at)
            .push_bind(essay.created_at)
            .push_bind(essay.updated_at);
    });

    builder.build().execute(&mut *tx).await?;
    tx.commit().await?;
    Ok(true)
}

pub(crate) async fn content_hashes(
    pool: &PgPool,
    assignment_id: Uuid,
) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>("SELECT content_hash FROM essays WHERE assignment_id = $1")
        .bind(assignment_id)
        .fetch_all(pool)
        .await
}

pub(crate) async fn find_for_owner(
    pool: &PgPool,
    owner_id: Uuid,
    essay_id: Uuid,
) -> Result<Option<Essay>, sqlx::Error> {
    sqlx::query_as::<_, Essay>(&format!(
        "SELECT {COLUMNS} FROM essays WHERE id = $1 AND owner_id = $2"
    ))
    .bind(essay_id)
    .bind(owner_id)
    .fetch_optional(pool)
    .await
}

pub(crate) async fn list_by_assignment(
    pool: &PgPool,
    owner_id: Uuid,
    assignment_id: Uuid,
) -> Result<Vec<Essay>, sqlx::Error> {
    sqlx::query_as::<_, Essay>(&format!(
        "SELECT {COLUMNS}
         FROM essays
         WHERE assignment_id = $1 AND owner_id = $2
         ORDER BY file_name, created_at"
    ))
    .bind(assignment_id)
    .bind(owner_id)
    .fetch_all(pool)
    .await
}

/// Oldest eligible essay first. The row lock plus `SKIP LOCKED` lets concurrent workers
/// each take a different essay without blocking.
pub(crate) async fn claim_next(
    pool: &PgPool,
    lease_id: Uuid,
    now: PrimitiveDateTime,
) -> Result<Option<Essay>, sqlx::Error> {
    sqlx::query_as::<_, Essay>(&format!(
        "WITH candidate AS (
            SELECT e.id
            FROM essays e
            JOIN assignments a ON a.id = e.assignment_id
            WHERE e.status = $1
              AND e.next_attempt_at <= $2
              AND a.status IN ($3, $4)
            ORDER BY e.next_attempt_at, e.created_at
            FOR UPDATE OF e SKIP LOCKED
            LIMIT 1
        )
        UPDATE essays
        SET status = $5,
            lease_id = $6,
            claimed_at = $2,
            attempt_count = essays.attempt_count + 1,
            updated_at = $2
        FROM candidate
        WHERE essays.id = candidate.id
        RETURNING {}",
        qualified(COLUMNS, "essays")
    ))
    .bind(EssayStatus::Pending)
    .bind(now)
    .bind(AssignmentStatus::Grading)
    .bind(AssignmentStatus::Review)
    .bind(EssayStatus::Processing)
    .bind(lease_id)
    .fetch_optional(pool)
    .await
}

pub(crate) async fn set_extracted_text(
    pool: &PgPool,
    essay_id: Uuid,
    lease_id: Uuid,
    text: &str,
    now: PrimitiveDateTime,
) -> Result<bool, sqlx::Error> {
    let updated = sqlx::query(
        "UPDATE essays
         SET extracted_text = $1, updated_at = $2
         WHERE id = $3 AND status = $4 AND lease_id = $5",
    )
    .bind(text)
    .bind(now)
    .bind(essay_id)
    .bind(EssayStatus::Processing)
    .bind(lease_id)
    .execute(pool)
    .await?;

    Ok(updated.rows_affected() > 0)
}

pub(crate) async fn release(
    pool: &PgPool,
    essay_id: Uuid,
    lease_id: Uuid,
    error: &str,
    next_attempt_at: PrimitiveDateTime,
    now: PrimitiveDateTime,
) -> Result<bool, sqlx::Error> {
    let updated = sqlx::query(
        "UPDATE essays
         SET status = $1,
             lease_id = NULL,
             claimed_at = NULL,
             last_error = $2,
             next_attempt_at = $3,
             updated_at = $4
         WHERE id = $5 AND status = $6 AND lease_id = $7",
    )
    .bind(EssayStatus::Pending)
    .bind(error)
    .bind(next_attempt_at)
    .bind(now)
    .bind(essay_id)
    .bind(EssayStatus::Processing)
    .bind(lease_id)
    .execute(pool)
    .await?;

    Ok(updated.rows_affected() > 0)
}

pub(crate) async fn fail(
    pool: &PgPool,
    essay_id: Uuid,
    lease_id: Uuid,
    kind: FailureKind,
    error: &str,
    now: PrimitiveDateTime,
) -> Result<bool, sqlx::Error> {
    let updated = sqlx::query(
        "UPDATE essays
         SET status = $1,
             lease_id = NULL,
             claimed_at = NULL,
             failure_kind = $2,
             last_error = $3,
             updated_at = $4
         WHERE id = $5 AND status = $6 AND lease_id = $7",
    )
    .bind(EssayStatus::Failed)
    .bind(kind)
    .bind(error)
    .bind(now)
    .bind(essay_id)
    .bind(EssayStatus::Processing)
    .bind(lease_id)
    .execute(pool)
    .await?;

    Ok(updated.rows_affected() > 0)
}

pub(crate) async fn requeue_failed(
    pool: &PgPool,
    owner_id: Uuid,
    essay_id: Uuid,
    now: PrimitiveDateTime,
) -> Result<bool, sqlx::Error> {
    let updated = sqlx::query(
        "UPDATE essays
         SET status = $1,
             attempt_count = 0,
             failure_kind = NULL,
             last_error = NULL,
             next_attempt_at = $2,
             updated_at = $2
         WHERE id = $3 AND owner_id = $4 AND status = $5",
    )
    .bind(EssayStatus::Pending)
    .bind(now)
    .bind(essay_id)
    .bind(owner_id)
    .bind(EssayStatus::Failed)
    .execute(pool)
    .await?;

    Ok(updated.rows_affected() > 0)
}

pub(crate) async fn list_stale_processing(
    pool: &PgPool,
    claimed_before: PrimitiveDateTime,
) -> Result<Vec<Essay>, sqlx::Error> {
    sqlx::query_as::<_, Essay>(&format!(
        "SELECT {COLUMNS}
         FROM essays
         WHERE status = $1 AND claimed_at < $2
         ORDER BY claimed_at
         LIMIT 200"
    ))
    .bind(EssayStatus::Processing)
    .bind(claimed_before)
    .fetch_all(pool)
    .await
}

pub(crate) async fn delete_unless_processing(
    pool: &PgPool,
    owner_id: Uuid,
    essay_id: Uuid,
) -> Result<Option<Essay>, sqlx::Error> {
    sqlx::query_as::<_, Essay>(&format!(
        "DELETE FROM essays
         WHERE id = $1 AND owner_id = $2 AND status <> $3
         RETURNING {COLUMNS}"
    ))
    .bind(essay_id)
    .bind(owner_id)
    .bind(EssayStatus::Processing)
    .fetch_optional(pool)
    .await
}

pub(crate) async fn approve(
    pool: &PgPool,
    owner_id: Uuid,
    essay_id: Uuid,
    approved_by: Uuid,
    now: PrimitiveDateTime,
) -> Result<bool, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let updated = sqlx::query(
        "UPDATE essays
         SET status = $1, reviewed_at = $2, updated_at = $2
         WHERE id = $3 AND owner_id = $4 AND status = $5",
    )
    .bind(EssayStatus::Reviewed)
    .bind(now)
    .bind(essay_id)
    .bind(owner_id)
    .bind(EssayStatus::Graded)
    .execute(&mut *tx)
    .await?;

    if updated.rows_affected() == 0 {
        return Ok(false);
    }

    sqlx::query(
        "UPDATE grading_results
         SET teacher_approved = TRUE, approved_at = $1, approved_by = $2
         WHERE essay_id = $3",
    )
    .bind(now)
    .bind(approved_by)
    .bind(essay_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(true)
}

pub(crate) async fn list_due_for_purge(
    pool: &PgPool,
    now: PrimitiveDateTime,
    limit: u32,
) -> Result<Vec<Essay>, sqlx::Error> {
    sqlx::query_as::<_, Essay>(&format!(
        "SELECT {COLUMNS}
         FROM essays
         WHERE delete_after IS NOT NULL
           AND delete_after <= $1
           AND content_purged_at IS NULL
         ORDER BY delete_after
         LIMIT $2"
    ))
    .bind(now)
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await
}

pub(crate) async fn purge_content(
    pool: &PgPool,
    essay_id: Uuid,
    now: PrimitiveDateTime,
) -> Result<bool, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let updated = sqlx::query(
        "UPDATE essays
         SET storage_key = NULL,
             extracted_text = NULL,
             content_purged_at = $1,
             updated_at = $1
         WHERE id = $2 AND content_purged_at IS NULL",
    )
    .bind(now)
    .bind(essay_id)
    .execute(&mut *tx)
    .await?;

    if updated.rows_affected() == 0 {
        return Ok(false);
    }

    sqlx::query("DELETE FROM annotations WHERE essay_id = $1")
        .bind(essay_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(true)
}
