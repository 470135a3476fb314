use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::db::models::{CriterionLevel, Rubric, RubricCriterion};
use crate::store::{CriterionWithLevels, RubricSnapshot};

pub(crate) const COLUMNS: &str =
    "id, owner_id, title, description, version, created_at, updated_at";

pub(crate) async fn insert(pool: &PgPool, snapshot: &RubricSnapshot) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    let rubric = &snapshot.rubric;

    sqlx::query(
        "INSERT INTO rubrics (id, owner_id, title, description, version, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(rubric.id)
    .bind(rubric.owner_id)
    .bind(&rubric.title)
    .bind(&rubric.description)
    .bind(rubric.version)
    .bind(rubric.created_at)
    .bind(rubric.updated_at)
    .execute(&mut *tx)
    .await?;

    insert_criteria(&mut tx, snapshot).await?;
    tx.commit().await
}

pub(crate) async fn find(
    pool: &PgPool,
    owner_id: Uuid,
    rubric_id: Uuid,
) -> Result<Option<RubricSnapshot>, sqlx::Error> {
    let rubric = sqlx::query_as::<_, Rubric>(&format!(
        "SELECT {COLUMNS} FROM rubrics WHERE id = $1 AND owner_id = $2"
    ))
    .bind(rubric_id)
    .bind(owner_id)
    .fetch_optional(pool)
    .await?;

    let Some(rubric) = rubric else {
        return Ok(None);
    };

    let criteria = sqlx::query_as::<_, RubricCriterion>(
        "SELECT id, rubric_id, name, position
         FROM rubric_criteria
         WHERE rubric_id = $1
         ORDER BY position",
    )
    .bind(rubric.id)
    .fetch_all(pool)
    .await?;

    let levels = sqlx::query_as::<_, CriterionLevel>(
        "SELECT l.id, l.criterion_id, l.score, l.descriptor
         FROM criterion_levels l
         JOIN rubric_criteria c ON c.id = l.criterion_id
         WHERE c.rubric_id = $1
         ORDER BY l.score",
    )
    .bind(rubric.id)
    .fetch_all(pool)
    .await?;

    let criteria = criteria
        .into_iter()
        .map(|criterion| {
            let levels = levels
                .iter()
                .filter(|level| level.criterion_id == criterion.id)
                .cloned()
                .collect();
            CriterionWithLevels { criterion, levels }
        })
        .collect();

    Ok(Some(RubricSnapshot { rubric, criteria }))
}

pub(crate) async fn list_by_owner(
    pool: &PgPool,
    owner_id: Uuid,
) -> Result<Vec<Rubric>, sqlx::Error> {
    sqlx::query_as::<_, Rubric>(&format!(
        "SELECT {COLUMNS} FROM rubrics WHERE owner_id = $1 ORDER BY created_at DESC"
    ))
    .bind(owner_id)
    .fetch_all(pool)
    .await
}

/// True when an assignment using this rubric already has essays.
pub(crate) async fn is_locked(
    executor: impl sqlx::PgExecutor<'_>,
    rubric_id: Uuid,
) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS (
            SELECT 1 FROM essays e
            JOIN assignments a ON a.id = e.assignment_id
            WHERE a.rubric_id = $1
         )",
    )
    .bind(rubric_id)
    .fetch_one(executor)
    .await
}

pub(crate) async fn is_referenced(
    executor: impl sqlx::PgExecutor<'_>,
    rubric_id: Uuid,
) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM assignments WHERE rubric_id = $1)")
        .bind(rubric_id)
        .fetch_one(executor)
        .await
}

/// Returns `Ok(None)` when the rubric is missing and `Ok(Some(false))` when it is locked.
pub(crate) async fn replace(
    pool: &PgPool,
    snapshot: &RubricSnapshot,
) -> Result<Option<bool>, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let rubric = &snapshot.rubric;

    let exists = sqlx::query_scalar::<_, Uuid>(
        "SELECT id FROM rubrics WHERE id = $1 AND owner_id = $2 FOR UPDATE",
    )
    .bind(rubric.id)
    .bind(rubric.owner_id)
    .fetch_optional(&mut *tx)
    .await?;

    if exists.is_none() {
        return Ok(None);
    }

    if is_locked(&mut *tx, rubric.id).await? {
        return Ok(Some(false));
    }

    sqlx::query(
        "UPDATE rubrics
         SET title = $1, description = $2, version = $3, updated_at = $4
         WHERE id = $5",
    )
    .bind(&rubric.title)
    .bind(&rubric.description)
    .bind(rubric.version)
    .bind(rubric.updated_at)
    .bind(rubric.id)
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM rubric_criteria WHERE rubric_id = $1")
        .bind(rubric.id)
        .execute(&mut *tx)
        .await?;

    insert_criteria(&mut tx, snapshot).await?;
    tx.commit().await?;
    Ok(Some(true))
}

/// Returns `Ok(None)` when the rubric is missing and `Ok(Some(false))` when referenced.
pub(crate) async fn delete(
    pool: &PgPool,
    owner_id: Uuid,
    rubric_id: Uuid,
) -> Result<Option<bool>, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let exists = sqlx::query_scalar::<_, Uuid>(
        "SELECT id FROM rubrics WHERE id = $1 AND owner_id = $2 FOR UPDATE",
    )
    .bind(rubric_id)
    .bind(owner_id)
    .fetch_optional(&mut *tx)
    .await?;

    if exists.is_none() {
        return Ok(None);
    }

    if is_referenced(&mut *tx, rubric_id).await? {
        return Ok(Some(false));
    }

    sqlx::query("DELETE FROM rubrics WHERE id = $1").bind(rubric_id).execute(&mut *tx).await?;
    tx.commit().await?;
    Ok(Some(true))
}

async fn insert_criteria(
    tx: &mut Transaction<'_, Postgres>,
    snapshot: &RubricSnapshot,
) -> Result<(), sqlx::Error> {
    for entry in &snapshot.criteria {
        sqlx::query(
            "INSERT INTO rubric_criteria (id, rubric_id, name, position) VALUES ($1, $2, $3, $4)",
        )
        .bind(entry.criterion.id)
        .bind(snapshot.rubric.id)
        .bind(&entry.criterion.name)
        .bind(entry.criterion.position)
        .execute(&mut **tx)
        .await?;

        for level in &entry.levels {
            sqlx::query(
                "INSERT INTO criterion_levels (id, criterion_id, score, descriptor)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(level.id)
            .bind(entry.criterion.id)
            .bind(level.score)
            .bind(&level.descriptor)
            .execute(&mut **tx)
            .await?;
        }
    }

    Ok(())
}
