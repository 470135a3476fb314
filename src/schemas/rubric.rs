use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::core::time::format_primitive;
use crate::db::models::{CriterionLevel, Rubric};
use crate::services::rubrics::{CriterionDraft, LevelDraft, RubricDraft};
use crate::store::{CriterionWithLevels, RubricSnapshot};

#[derive(Debug, Serialize, Deserialize, Validate)]
pub(crate) struct LevelInput {
    #[validate(range(min = 0, message = "score must be non-negative"))]
    pub(crate) score: i32,
    #[serde(default)]
    pub(crate) descriptor: String,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub(crate) struct CriterionInput {
    #[validate(length(min = 1, message = "criterion name must not be empty"))]
    pub(crate) name: String,
    #[validate(length(min = 1, message = "criterion needs at least one level"), nested)]
    pub(crate) levels: Vec<LevelInput>,
}

/// Body of both create and full replace.
#[derive(Debug, Deserialize, Validate)]
pub(crate) struct RubricPayload {
    #[validate(length(min = 1, message = "title must not be empty"))]
    pub(crate) title: String,
    #[serde(default)]
    pub(crate) description: Option<String>,
    #[validate(length(min = 1, message = "rubric needs at least one criterion"), nested)]
    pub(crate) criteria: Vec<CriterionInput>,
}

impl RubricPayload {
    pub(crate) fn into_draft(self) -> RubricDraft {
        RubricDraft {
            title: self.title,
            description: self.description,
            criteria: self
                .criteria
                .into_iter()
                .map(|criterion| CriterionDraft {
                    name: criterion.name,
                    levels: criterion
                        .levels
                        .into_iter()
                        .map(|level| LevelDraft { score: level.score, descriptor: level.descriptor })
                        .collect(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct ReorderRequest {
    #[validate(length(min = 1, message = "criterion_ids must not be empty"))]
    #[serde(alias = "criterionIds")]
    pub(crate) criterion_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub(crate) struct LevelResponse {
    pub(crate) id: Uuid,
    pub(crate) score: i32,
    pub(crate) descriptor: String,
}

impl From<CriterionLevel> for LevelResponse {
    fn from(level: CriterionLevel) -> Self {
        Self { id: level.id, score: level.score, descriptor: level.descriptor }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct CriterionResponse {
    pub(crate) id: Uuid,
    pub(crate) name: String,
    pub(crate) position: i32,
    pub(crate) max_score: i32,
    pub(crate) levels: Vec<LevelResponse>,
}

impl From<CriterionWithLevels> for CriterionResponse {
    fn from(entry: CriterionWithLevels) -> Self {
        let max_score = entry.max_score();
        Self {
            id: entry.criterion.id,
            name: entry.criterion.name,
            position: entry.criterion.position,
            max_score,
            levels: entry.levels.into_iter().map(LevelResponse::from).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct RubricSummary {
    pub(crate) id: Uuid,
    pub(crate) title: String,
    pub(crate) description: Option<String>,
    pub(crate) version: i32,
    pub(crate) created_at: String,
    pub(crate) updated_at: String,
}

impl From<Rubric> for RubricSummary {
    fn from(rubric: Rubric) -> Self {
        Self {
            id: rubric.id,
            title: rubric.title,
            description: rubric.description,
            version: rubric.version,
            created_at: format_primitive(rubric.created_at),
            updated_at: format_primitive(rubric.updated_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct RubricResponse {
    #[serde(flatten)]
    pub(crate) rubric: RubricSummary,
    pub(crate) max_total: i64,
    pub(crate) criteria: Vec<CriterionResponse>,
}

impl From<RubricSnapshot> for RubricResponse {
    fn from(snapshot: RubricSnapshot) -> Self {
        let max_total = snapshot.max_total();
        Self {
            rubric: RubricSummary::from(snapshot.rubric),
            max_total,
            criteria: snapshot.criteria.into_iter().map(CriterionResponse::from).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use validator::Validate;

    use super::RubricPayload;

    fn payload(score: i32) -> RubricPayload {
        serde_json::from_value(json!({
            "title": "Argument essay",
            "criteria": [{"name": "Thesis", "levels": [{"score": score, "descriptor": "Clear"}]}]
        }))
        .expect("payload")
    }

    #[test]
    fn level_scores_are_validated_through_criteria() {
        assert!(payload(2).validate().is_ok());

        let errors = payload(-1).validate().expect_err("negative score");
        assert!(errors.errors().contains_key("criteria"));
    }
}
