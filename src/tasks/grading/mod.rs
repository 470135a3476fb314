mod batch;
mod maintenance;
mod worker;

pub(crate) use batch::{
    batch_progress, cancel_batch, recompute_assignment_status, retry_essay, run_batch,
    BatchHandle, BatchProgress, FailedEssay,
};
pub(crate) use maintenance::recover_stale_claims;
pub(crate) use worker::{process_next, EssayOutcome, EssayProcessed, Pipeline};
