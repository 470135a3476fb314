pub(crate) mod api;
pub(crate) mod core;
pub(crate) mod db;
pub(crate) mod repositories;
pub(crate) mod schemas;
pub(crate) mod services;
pub(crate) mod store;
pub(crate) mod tasks;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use anyhow::Context;

use crate::core::{config::Settings, redis::RedisHandle, state::AppState, telemetry};
use crate::services::storage::{ObjectStorage, StorageService};
use crate::store::PgGradingStore;
use crate::tasks::grading::Pipeline;

async fn bootstrap(component: &'static str) -> anyhow::Result<(AppState, RedisHandle)> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    telemetry::init_tracing(&settings, component)?;
    core::metrics::init(&settings)?;

    let db_pool = db::init_pool(&settings).await.context("connect to Postgres")?;
    db::run_migrations(&db_pool).await.context("apply migrations")?;

    let redis = RedisHandle::new(settings.redis().redis_url());
    if let Err(err) = redis.connect().await {
        tracing::error!(error = %err, "Failed to connect to Redis; continuing without rate limits");
    } else {
        tracing::info!("Redis connected successfully");
    }

    let storage = StorageService::from_settings(&settings)
        .await?
        .map(|service| Arc::new(service) as Arc<dyn ObjectStorage>);
    if storage.is_none() {
        tracing::warn!("Object storage is not configured; uploads and grading are unavailable");
    }

    let store = Arc::new(PgGradingStore::new(db_pool));
    let state = AppState::new(settings, store, redis.clone(), storage);
    Ok((state, redis))
}

pub async fn run() -> anyhow::Result<()> {
    let (state, redis) = bootstrap("api").await?;

    let app = api::router::router(state.clone());
    let listener = tokio::net::TcpListener::bind(state.settings().server_addr()).await?;

    tracing::info!(
        host = %state.settings().server_host(),
        port = state.settings().server_port(),
        environment = %state.settings().runtime().environment.as_str(),
        "Essay grader API listening"
    );

    let result =
        axum::serve(listener, app).with_graceful_shutdown(core::shutdown::shutdown_signal()).await;

    redis.disconnect().await;
    tracing::info!("Redis disconnected");

    result?;

    Ok(())
}

pub async fn run_worker() -> anyhow::Result<()> {
    let (state, redis) = bootstrap("worker").await?;

    let pipeline = Pipeline::from_settings(state.settings())?;
    let result = tasks::scheduler::run(state, pipeline).await;

    redis.disconnect().await;
    tracing::info!("Redis disconnected");

    result?;

    Ok(())
}
