use time::PrimitiveDateTime;

use crate::core::config::Settings;
use crate::core::state::AppState;
use crate::core::time::days;
use crate::store::StoreError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SweepReport {
    pub(crate) purged: usize,
    pub(crate) failed: usize,
}

/// Deadline after which a graded essay's stored file and extracted text are purged.
pub(crate) fn schedule_deletion(graded_at: PrimitiveDateTime, settings: &Settings) -> PrimitiveDateTime {
    graded_at.saturating_add(days(settings.retention().days))
}

/// Purges content of every essay past its deletion deadline, in bounded pages.
///
/// Scores and approvals survive. A failure on one essay is logged and the sweep moves on;
/// the essay stays due and is picked up again next time.
pub(crate) async fn sweep(state: &AppState) -> Result<SweepReport, StoreError> {
    let retention = state.settings().retention();
    let now = state.now();
    let mut report = SweepReport::default();

    for _ in 0..retention.sweep_max_pages.max(1) {
        let due = state.store().list_due_for_purge(now, retention.sweep_batch_size).await?;
        if due.is_empty() {
            break;
        }

        let mut purged_this_page = 0;
        for essay in &due {
            if let (Some(key), Some(storage)) = (essay.storage_key.as_deref(), state.storage()) {
                if let Err(err) = storage.delete(key).await {
                    tracing::warn!(
                        essay_id = %essay.id,
                        storage_key = key,
                        error = %err,
                        "Failed to delete essay file during retention sweep"
                    );
                    report.failed += 1;
                    continue;
                }
            }

            match state.store().purge_essay_content(essay.id, now).await {
                Ok(true) => {
                    report.purged += 1;
                    purged_this_page += 1;
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(essay_id = %essay.id, error = %err, "Failed to purge essay content");
                    report.failed += 1;
                }
            }
        }

        if purged_this_page == 0 || due.len() < retention.sweep_batch_size as usize {
            break;
        }
    }

    if report.purged > 0 {
        metrics::counter!("retention_purged_total").increment(report.purged as u64);
    }
    if report.failed > 0 {
        metrics::counter!("retention_purge_failures_total").increment(report.failed as u64);
    }
    if report.purged > 0 || report.failed > 0 {
        tracing::info!(purged = report.purged, failed = report.failed, "Retention sweep finished");
    }

    Ok(report)
}
