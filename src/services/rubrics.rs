use std::collections::HashSet;

use uuid::Uuid;

use crate::core::state::AppState;
use crate::db::models::{CriterionLevel, Rubric, RubricCriterion};
use crate::services::errors::ServiceError;
use crate::services::rubric_validation;
use crate::store::{CriterionWithLevels, RubricSnapshot};

#[derive(Debug, Clone)]
pub(crate) struct LevelDraft {
    pub(crate) score: i32,
    pub(crate) descriptor: String,
}

#[derive(Debug, Clone)]
pub(crate) struct CriterionDraft {
    pub(crate) name: String,
    pub(crate) levels: Vec<LevelDraft>,
}

/// Criteria are positioned in the order given.
#[derive(Debug, Clone)]
pub(crate) struct RubricDraft {
    pub(crate) title: String,
    pub(crate) description: Option<String>,
    pub(crate) criteria: Vec<CriterionDraft>,
}

fn build_criteria(rubric_id: Uuid, drafts: &[CriterionDraft]) -> Vec<CriterionWithLevels> {
    drafts
        .iter()
        .enumerate()
        .map(|(index, draft)| {
            let criterion_id = Uuid::new_v4();
            let mut levels: Vec<CriterionLevel> = draft
                .levels
                .iter()
                .map(|level| CriterionLevel {
                    id: Uuid::new_v4(),
                    criterion_id,
                    score: level.score,
                    descriptor: level.descriptor.trim().to_string(),
                })
                .collect();
            levels.sort_by_key(|level| level.score);

            CriterionWithLevels {
                criterion: RubricCriterion {
                    id: criterion_id,
                    rubric_id,
                    name: draft.name.trim().to_string(),
                    position: index as i32,
                },
                levels,
            }
        })
        .collect()
}

pub(crate) async fn create_rubric(
    state: &AppState,
    owner_id: Uuid,
    draft: RubricDraft,
) -> Result<RubricSnapshot, ServiceError> {
    let now = state.now();
    let rubric_id = Uuid::new_v4();
    let snapshot = RubricSnapshot {
        rubric: Rubric {
            id: rubric_id,
            owner_id,
            title: draft.title.trim().to_string(),
            description: draft.description,
            version: 1,
            created_at: now,
            updated_at: now,
        },
        criteria: build_criteria(rubric_id, &draft.criteria),
    };

    rubric_validation::validate(&snapshot)?;
    state.store().insert_rubric(&snapshot).await?;

    tracing::info!(%owner_id, rubric_id = %rubric_id, criteria = snapshot.criteria.len(), "Rubric created");
    Ok(snapshot)
}

pub(crate) async fn get_rubric(
    state: &AppState,
    owner_id: Uuid,
    rubric_id: Uuid,
) -> Result<RubricSnapshot, ServiceError> {
    state
        .store()
        .find_rubric(owner_id, rubric_id)
        .await?
        .ok_or(ServiceError::NotFound("rubric"))
}

pub(crate) async fn list_rubrics(
    state: &AppState,
    owner_id: Uuid,
) -> Result<Vec<Rubric>, ServiceError> {
    Ok(state.store().list_rubrics(owner_id).await?)
}

/// Replaces the whole criteria tree. Criterion and level ids are regenerated.
pub(crate) async fn update_rubric(
    state: &AppState,
    owner_id: Uuid,
    rubric_id: Uuid,
    draft: RubricDraft,
) -> Result<RubricSnapshot, ServiceError> {
    let current = get_rubric(state, owner_id, rubric_id).await?;

    let snapshot = RubricSnapshot {
        rubric: Rubric {
            title: draft.title.trim().to_string(),
            description: draft.description,
            version: current.rubric.version + 1,
            updated_at: state.now(),
            ..current.rubric
        },
        criteria: build_criteria(rubric_id, &draft.criteria),
    };

    rubric_validation::validate(&snapshot)?;
    if !state.store().replace_rubric(&snapshot).await? {
        return Err(ServiceError::NotFound("rubric"));
    }

    tracing::info!(%owner_id, rubric_id = %rubric_id, version = snapshot.rubric.version, "Rubric updated");
    Ok(snapshot)
}

/// Reorders criteria without changing their ids. `order` must be a permutation of the
/// rubric's criterion ids.
pub(crate) async fn reorder_criteria(
    state: &AppState,
    owner_id: Uuid,
    rubric_id: Uuid,
    order: &[Uuid],
) -> Result<RubricSnapshot, ServiceError> {
    let mut snapshot = get_rubric(state, owner_id, rubric_id).await?;

    let known: HashSet<Uuid> = snapshot.criteria.iter().map(|entry| entry.criterion.id).collect();
    let requested: HashSet<Uuid> = order.iter().copied().collect();
    if order.len() != known.len() || requested != known {
        return Err(ServiceError::validation(
            "order must list every criterion of the rubric exactly once",
        ));
    }

    for entry in &mut snapshot.criteria {
        if let Some(position) = order.iter().position(|id| *id == entry.criterion.id) {
            entry.criterion.position = position as i32;
        }
    }
    snapshot.sort();
    snapshot.rubric.version += 1;
    snapshot.rubric.updated_at = state.now();

    if !state.store().replace_rubric(&snapshot).await? {
        return Err(ServiceError::NotFound("rubric"));
    }

    Ok(snapshot)
}

pub(crate) async fn delete_rubric(
    state: &AppState,
    owner_id: Uuid,
    rubric_id: Uuid,
) -> Result<(), ServiceError> {
    if !state.store().delete_rubric(owner_id, rubric_id).await? {
        return Err(ServiceError::NotFound("rubric"));
    }
    tracing::info!(%owner_id, rubric_id = %rubric_id, "Rubric deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::assignments::{self, AssignmentDraft};
    use crate::test_support::{self, essay_fixture};

    fn draft(levels: &[&[i32]]) -> RubricDraft {
        RubricDraft {
            title: "Argument essay".to_string(),
            description: None,
            criteria: levels
                .iter()
                .enumerate()
                .map(|(index, scores)| CriterionDraft {
                    name: format!("Criterion {index}"),
                    levels: scores
                        .iter()
                        .map(|score| LevelDraft { score: *score, descriptor: format!("{score}") })
                        .collect(),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn create_assigns_positions_and_version_one() {
        let harness = test_support::harness().await;
        let owner = Uuid::new_v4();

        let rubric =
            create_rubric(&harness.state, owner, draft(&[&[2, 0, 1], &[0, 4]])).await.expect("create");

        assert_eq!(rubric.rubric.version, 1);
        let positions: Vec<i32> = rubric.criteria.iter().map(|c| c.criterion.position).collect();
        assert_eq!(positions, vec![0, 1]);
        let scores: Vec<i32> = rubric.criteria[0].levels.iter().map(|l| l.score).collect();
        assert_eq!(scores, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn invalid_rubric_is_not_stored() {
        let harness = test_support::harness().await;
        let owner = Uuid::new_v4();

        let err = create_rubric(&harness.state, owner, draft(&[&[1, 1]])).await.expect_err("invalid");
        assert!(matches!(err, ServiceError::Validation { .. }));
        assert!(list_rubrics(&harness.state, owner).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn other_owner_sees_not_found() {
        let harness = test_support::harness().await;
        let rubric =
            create_rubric(&harness.state, Uuid::new_v4(), draft(&[&[1]])).await.expect("create");

        let err = get_rubric(&harness.state, Uuid::new_v4(), rubric.rubric.id)
            .await
            .expect_err("hidden");
        assert!(matches!(err, ServiceError::NotFound("rubric")));
    }

    #[tokio::test]
    async fn update_bumps_version_until_essays_exist() {
        let harness = test_support::harness().await;
        let owner = Uuid::new_v4();
        let rubric = create_rubric(&harness.state, owner, draft(&[&[1]])).await.expect("create");

        let updated = update_rubric(&harness.state, owner, rubric.rubric.id, draft(&[&[1], &[2]]))
            .await
            .expect("update");
        assert_eq!(updated.rubric.version, 2);
        assert_eq!(updated.criteria.len(), 2);

        let assignment = assignments::create_assignment(
            &harness.state,
            owner,
            AssignmentDraft {
                rubric_id: rubric.rubric.id,
                title: "Essay".to_string(),
                prompt: "Discuss".to_string(),
                source_text: None,
            },
        )
        .await
        .expect("assignment");
        harness.store.seed_essay(essay_fixture(&assignment, "alice.txt"));

        let err = update_rubric(&harness.state, owner, rubric.rubric.id, draft(&[&[3]]))
            .await
            .expect_err("locked");
        assert!(matches!(err, ServiceError::ReferencedResource("rubric")));
    }

    #[tokio::test]
    async fn reorder_keeps_ids_and_rejects_partial_orders() {
        let harness = test_support::harness().await;
        let owner = Uuid::new_v4();
        let rubric =
            create_rubric(&harness.state, owner, draft(&[&[1], &[2], &[3]])).await.expect("create");
        let ids: Vec<Uuid> = rubric.criteria.iter().map(|c| c.criterion.id).collect();

        let reversed: Vec<Uuid> = ids.iter().rev().copied().collect();
        let reordered = reorder_criteria(&harness.state, owner, rubric.rubric.id, &reversed)
            .await
            .expect("reorder");
        let new_order: Vec<Uuid> = reordered.criteria.iter().map(|c| c.criterion.id).collect();
        assert_eq!(new_order, reversed);
        assert_eq!(reordered.rubric.version, 2);

        let err = reorder_criteria(&harness.state, owner, rubric.rubric.id, &ids[..2])
            .await
            .expect_err("partial");
        assert!(matches!(err, ServiceError::Validation { .. }));
    }

    #[tokio::test]
    async fn delete_is_blocked_while_referenced() {
        let harness = test_support::harness().await;
        let owner = Uuid::new_v4();
        let used = create_rubric(&harness.state, owner, draft(&[&[1]])).await.expect("create");
        let unused = create_rubric(&harness.state, owner, draft(&[&[1]])).await.expect("create");

        assignments::create_assignment(
            &harness.state,
            owner,
            AssignmentDraft {
                rubric_id: used.rubric.id,
                title: "Essay".to_string(),
                prompt: "Discuss".to_string(),
                source_text: None,
            },
        )
        .await
        .expect("assignment");

        let err = delete_rubric(&harness.state, owner, used.rubric.id).await.expect_err("blocked");
        assert!(matches!(err, ServiceError::ReferencedResource("rubric")));

        delete_rubric(&harness.state, owner, unused.rubric.id).await.expect("delete");
        let err = get_rubric(&harness.state, owner, unused.rubric.id).await.expect_err("gone");
        assert!(matches!(err, ServiceError::NotFound(_)));
    }
}
