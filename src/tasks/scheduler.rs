use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};

use crate::core::shutdown::{shutdown_channel, shutdown_signal, wait_for_shutdown};
use crate::core::state::AppState;
use crate::services::retention;
use crate::tasks::grading::{self, Pipeline};

pub(crate) async fn run(state: AppState, pipeline: Pipeline) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    let handles = spawn(&state, &pipeline, shutdown_rx);

    tracing::info!(
        workers = state.settings().grading().worker_concurrency,
        "Grading workers started"
    );

    shutdown_signal().await;
    if shutdown_tx.send(true).is_err() {
        tracing::warn!("Failed to broadcast shutdown signal to background tasks");
    }

    for handle in handles {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "Background task join failed");
        }
    }

    Ok(())
}

/// Starts the essay workers and the periodic maintenance loops.
pub(crate) fn spawn(
    state: &AppState,
    pipeline: &Pipeline,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let concurrency = state.settings().grading().worker_concurrency.max(1);
    let mut handles = Vec::with_capacity(concurrency + 2);

    for worker_id in 0..concurrency {
        handles.push(tokio::spawn(essay_worker(
            worker_id,
            state.clone(),
            pipeline.clone(),
            shutdown.clone(),
        )));
    }

    handles.push(tokio::spawn(stale_claims_loop(state.clone(), shutdown.clone())));
    handles.push(tokio::spawn(retention_loop(state.clone(), shutdown)));
    handles
}

async fn essay_worker(
    worker_id: usize,
    state: AppState,
    pipeline: Pipeline,
    mut shutdown: watch::Receiver<bool>,
) {
    let idle = state.settings().grading().idle_poll();

    loop {
        if *shutdown.borrow() {
            break;
        }

        match grading::process_next(&state, &pipeline).await {
            Ok(Some(processed)) => {
                tracing::debug!(
                    worker_id,
                    essay_id = %processed.essay_id,
                    assignment_id = %processed.assignment_id,
                    attempt = processed.attempt,
                    outcome = ?processed.outcome,
                    "Essay processed"
                );
                continue;
            }
            Ok(None) => {}
            Err(err) => tracing::error!(worker_id, error = %err, "Essay worker iteration failed"),
        }

        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            _ = sleep(idle) => {}
        }
    }
}

async fn stale_claims_loop(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_secs(state.settings().grading().stale_check_interval_seconds.max(1));
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            _ = tick.tick() => {
                if let Err(err) = grading::recover_stale_claims(&state).await {
                    tracing::error!(error = %err, "recover_stale_claims failed");
                }
            }
        }
    }
}

async fn retention_loop(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_secs(state.settings().retention().sweep_interval_seconds.max(1));
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            _ = tick.tick() => {
                if let Err(err) = retention::sweep(&state).await {
                    tracing::error!(error = %err, "retention sweep failed");
                }
            }
        }
    }
}
