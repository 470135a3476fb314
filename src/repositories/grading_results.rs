use sqlx::PgPool;
use time::PrimitiveDateTime;
use uuid::Uuid;

use crate::db::models::{CriterionScore, Essay, GradingResult};
use crate::db::types::EssayStatus;
use crate::repositories::{annotations, essays, qualified};
use crate::store::{GradedEssay, GradingCompletion};

pub(crate) const COLUMNS: &str = "id, essay_id, rubric_id, rubric_version, grading_key, \
     teacher_approved, approved_at, approved_by, created_at";

pub(crate) const SCORE_COLUMNS: &str = "id, grading_result_id, criterion_id, ai_level_id, \
     ai_feedback, teacher_level_id, teacher_feedback, updated_at";

/// Moves the essay to `graded` and writes its result, scores and AI annotations in one
/// transaction. Returns `false` when the lease no longer matches.
pub(crate) async fn complete(
    pool: &PgPool,
    completion: &GradingCompletion,
) -> Result<bool, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let updated = sqlx::query(
        "UPDATE essays
         SET status = $1,
             lease_id = NULL,
             claimed_at = NULL,
             last_error = NULL,
             failure_kind = NULL,
             graded_at = $2,
             delete_after = $3,
             updated_at = $2
         WHERE id = $4 AND status = $5 AND lease_id = $6",
    )
    .bind(EssayStatus::Graded)
    .bind(completion.graded_at)
    .bind(completion.delete_after)
    .bind(completion.essay_id)
    .bind(EssayStatus::Processing)
    .bind(completion.lease_id)
    .execute(&mut *tx)
    .await?;

    if updated.rows_affected() == 0 {
        return Ok(false);
    }

    let result = &completion.result;
    sqlx::query(
        "INSERT INTO grading_results (
            id, essay_id, rubric_id, rubric_version, grading_key, teacher_approved, created_at
         ) VALUES ($1, $2, $3, $4, $5, FALSE, $6)",
    )
    .bind(result.id)
    .bind(result.essay_id)
    .bind(result.rubric_id)
    .bind(result.rubric_version)
    .bind(&result.grading_key)
    .bind(result.created_at)
    .execute(&mut *tx)
    .await?;

    for score in &completion.scores {
        sqlx::query(
            "INSERT INTO criterion_scores (
                id, grading_result_id, criterion_id, ai_level_id, ai_feedback, updated_at
             ) VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(score.id)
        .bind(result.id)
        .bind(score.criterion_id)
        .bind(score.ai_level_id)
        .bind(&score.ai_feedback)
        .bind(score.updated_at)
        .execute(&mut *tx)
        .await?;
    }

    for annotation in &completion.annotations {
        annotations::insert(&mut *tx, annotation).await?;
    }

    tx.commit().await?;
    Ok(true)
}

pub(crate) async fn find_for_essay(
    pool: &PgPool,
    essay_id: Uuid,
) -> Result<Option<GradedEssay>, sqlx::Error> {
    let result = sqlx::query_as::<_, GradingResult>(&format!(
        "SELECT {COLUMNS} FROM grading_results WHERE essay_id = $1"
    ))
    .bind(essay_id)
    .fetch_optional(pool)
    .await?;

    let Some(result) = result else {
        return Ok(None);
    };

    let scores = sqlx::query_as::<_, CriterionScore>(&format!(
        "SELECT {SCORE_COLUMNS} FROM criterion_scores WHERE grading_result_id = $1"
    ))
    .bind(result.id)
    .fetch_all(pool)
    .await?;

    Ok(Some(GradedEssay { result, scores }))
}

pub(crate) async fn find_score_for_owner(
    pool: &PgPool,
    owner_id: Uuid,
    score_id: Uuid,
) -> Result<Option<(CriterionScore, Essay)>, sqlx::Error> {
    let score = sqlx::query_as::<_, CriterionScore>(&format!(
        "SELECT {SCORE_COLUMNS} FROM criterion_scores WHERE id = $1"
    ))
    .bind(score_id)
    .fetch_optional(pool)
    .await?;

    let Some(score) = score else {
        return Ok(None);
    };

    let essay = sqlx::query_as::<_, Essay>(&format!(
        "SELECT {} FROM essays e
         JOIN grading_results r ON r.essay_id = e.id
         WHERE r.id = $1 AND e.owner_id = $2",
        qualified(essays::COLUMNS, "e")
    ))
    .bind(score.grading_result_id)
    .bind(owner_id)
    .fetch_optional(pool)
    .await?;

    Ok(essay.map(|essay| (score, essay)))
}

/// Writes only the teacher slot, guarded on the owning essay still being `graded`.
pub(crate) async fn apply_override(
    pool: &PgPool,
    score_id: Uuid,
    teacher_level_id: Option<Uuid>,
    teacher_feedback: Option<String>,
    now: PrimitiveDateTime,
) -> Result<Option<CriterionScore>, sqlx::Error> {
    sqlx::query_as::<_, CriterionScore>(&format!(
        "UPDATE criterion_scores s
         SET teacher_level_id = $1, teacher_feedback = $2, updated_at = $3
         FROM grading_results r
         JOIN essays e ON e.id = r.essay_id
         WHERE s.id = $4 AND r.id = s.grading_result_id AND e.status = $5
         RETURNING {}",
        qualified(SCORE_COLUMNS, "s")
    ))
    .bind(teacher_level_id)
    .bind(teacher_feedback)
    .bind(now)
    .bind(score_id)
    .bind(EssayStatus::Graded)
    .fetch_optional(pool)
    .await
}
