use anyhow::{Context, Result};

use crate::core::state::AppState;
use crate::core::time::sub_std;

use super::batch::recompute_assignment_status;
use super::worker::{settle_retryable, EssayOutcome, ProcessingStage};

/// Returns essays whose claim outlived the lease to the queue.
///
/// The abandoned attempt counts against the essay's budget, so a worker that keeps crashing on
/// the same essay eventually leaves it failed rather than looping forever.
pub(crate) async fn recover_stale_claims(state: &AppState) -> Result<usize> {
    let cutoff = sub_std(state.now(), state.settings().grading().lease_duration());
    let stale = state
        .store()
        .list_stale_processing(cutoff)
        .await
        .context("Failed to list stale essays")?;

    let mut recovered = 0usize;
    for essay in stale {
        let Some(lease_id) = essay.lease_id else {
            tracing::warn!(essay_id = %essay.id, "Processing essay without a lease");
            continue;
        };
        let stage = if essay.extracted_text.is_some() {
            ProcessingStage::Grading
        } else {
            ProcessingStage::Extraction
        };

        let outcome = settle_retryable(state, &essay, lease_id, stage, "claim expired before completion")
            .await
            .with_context(|| format!("Failed to recover essay {}", essay.id))?;
        if outcome == EssayOutcome::LeaseLost {
            continue;
        }

        recovered += 1;
        recompute_assignment_status(state, essay.assignment_id)
            .await
            .context("Failed to recompute assignment status")?;
    }

    if recovered > 0 {
        metrics::counter!("stale_claims_recovered_total").increment(recovered as u64);
        tracing::warn!(recovered, "Recovered stale essay claims");
    }

    Ok(recovered)
}
