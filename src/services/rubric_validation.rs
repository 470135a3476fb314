use std::collections::HashSet;

use crate::services::errors::ServiceError;
use crate::store::RubricSnapshot;

/// Structural checks every rubric must pass before it is stored or used for grading.
pub(crate) fn validate(snapshot: &RubricSnapshot) -> Result<(), ServiceError> {
    if snapshot.rubric.title.trim().is_empty() {
        return Err(ServiceError::validation("rubric title must not be empty"));
    }

    if snapshot.criteria.is_empty() {
        return Err(ServiceError::validation("rubric must have at least one criterion"));
    }

    let mut positions = HashSet::new();
    for entry in &snapshot.criteria {
        let name = entry.criterion.name.trim();
        if name.is_empty() {
            return Err(ServiceError::validation("criterion name must not be empty"));
        }

        if !positions.insert(entry.criterion.position) {
            return Err(ServiceError::validation(format!(
                "duplicate criterion position {}",
                entry.criterion.position
            )));
        }

        if entry.levels.is_empty() {
            return Err(ServiceError::validation(format!(
                "criterion '{name}' must have at least one level"
            )));
        }

        let mut scores = HashSet::new();
        for level in &entry.levels {
            if level.score < 0 {
                return Err(ServiceError::validation(format!(
                    "criterion '{name}' has a negative level score"
                )));
            }
            if !scores.insert(level.score) {
                return Err(ServiceError::validation(format!(
                    "criterion '{name}' has duplicate level score {}",
                    level.score
                )));
            }
        }
    }

    Ok(())
}
