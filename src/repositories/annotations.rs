use sqlx::PgPool;
use time::PrimitiveDateTime;
use uuid::Uuid;

use crate::db::models::{Annotation, Essay};
use crate::db::types::AnnotationOrigin;
use crate::repositories::{essays, qualified};
use crate::store::AnnotationChanges;

pub(crate) const COLUMNS: &str = "id, essay_id, origin, kind, start_offset, end_offset, comment, \
     created_at, updated_at, removed_at, removed_by";

pub(crate) async fn insert(
    executor: impl sqlx::PgExecutor<'_>,
    annotation: &Annotation,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO annotations (
            id, essay_id, origin, kind, start_offset, end_offset, comment, created_at, updated_at
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(annotation.id)
    .bind(annotation.essay_id)
    .bind(annotation.origin)
    .bind(annotation.kind)
    .bind(annotation.start_offset)
    .bind(annotation.end_offset)
    .bind(&annotation.comment)
    .bind(annotation.created_at)
    .bind(annotation.updated_at)
    .execute(executor)
    .await?;

    Ok(())
}

pub(crate) async fn find_for_owner(
    pool: &PgPool,
    owner_id: Uuid,
    annotation_id: Uuid,
) -> Result<Option<(Annotation, Essay)>, sqlx::Error> {
    let annotation = sqlx::query_as::<_, Annotation>(&format!(
        "SELECT {COLUMNS} FROM annotations WHERE id = $1"
    ))
    .bind(annotation_id)
    .fetch_optional(pool)
    .await?;

    let Some(annotation) = annotation else {
        return Ok(None);
    };

    let essay = essays::find_for_owner(pool, owner_id, annotation.essay_id).await?;
    Ok(essay.map(|essay| (annotation, essay)))
}

pub(crate) async fn update(
    pool: &PgPool,
    annotation_id: Uuid,
    changes: &AnnotationChanges,
) -> Result<Option<Annotation>, sqlx::Error> {
    sqlx::query_as::<_, Annotation>(&format!(
        "UPDATE annotations
         SET kind = $1, start_offset = $2, end_offset = $3, comment = $4, updated_at = $5
         WHERE id = $6 AND origin = $7 AND removed_at IS NULL
         RETURNING {COLUMNS}"
    ))
    .bind(changes.kind)
    .bind(changes.start_offset)
    .bind(changes.end_offset)
    .bind(&changes.comment)
    .bind(changes.updated_at)
    .bind(annotation_id)
    .bind(AnnotationOrigin::Teacher)
    .fetch_optional(pool)
    .await
}

pub(crate) async fn remove(
    pool: &PgPool,
    annotation_id: Uuid,
    removed_by: Uuid,
    now: PrimitiveDateTime,
) -> Result<bool, sqlx::Error> {
    let updated = sqlx::query(
        "UPDATE annotations
         SET removed_at = $1, removed_by = $2, updated_at = $1
         WHERE id = $3 AND removed_at IS NULL",
    )
    .bind(now)
    .bind(removed_by)
    .bind(annotation_id)
    .execute(pool)
    .await?;

    Ok(updated.rows_affected() > 0)
}

pub(crate) async fn list_for_essay(
    pool: &PgPool,
    essay_id: Uuid,
    include_removed: bool,
) -> Result<Vec<Annotation>, sqlx::Error> {
    sqlx::query_as::<_, Annotation>(&format!(
        "SELECT {}
         FROM annotations a
         WHERE a.essay_id = $1 AND ($2 OR a.removed_at IS NULL)
         ORDER BY a.start_offset, a.created_at",
        qualified(COLUMNS, "a")
    ))
    .bind(essay_id)
    .bind(include_removed)
    .fetch_all(pool)
    .await
}
