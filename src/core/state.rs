use std::sync::Arc;

use time::PrimitiveDateTime;

use crate::core::time::{Clock, SystemClock};
use crate::core::{config::Settings, redis::RedisHandle};
use crate::services::storage::ObjectStorage;
use crate::store::GradingStore;

#[derive(Clone)]
pub(crate) struct AppState {
    inner: Arc<InnerState>,
}

struct InnerState {
    settings: Settings,
    store: Arc<dyn GradingStore>,
    redis: RedisHandle,
    storage: Option<Arc<dyn ObjectStorage>>,
    clock: Arc<dyn Clock>,
}

impl AppState {
    pub(crate) fn new(
        settings: Settings,
        store: Arc<dyn GradingStore>,
        redis: RedisHandle,
        storage: Option<Arc<dyn ObjectStorage>>,
    ) -> Self {
        Self::with_clock(settings, store, redis, storage, Arc::new(SystemClock))
    }

    pub(crate) fn with_clock(
        settings: Settings,
        store: Arc<dyn GradingStore>,
        redis: RedisHandle,
        storage: Option<Arc<dyn ObjectStorage>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { inner: Arc::new(InnerState { settings, store, redis, storage, clock }) }
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub(crate) fn store(&self) -> &dyn GradingStore {
        self.inner.store.as_ref()
    }

    pub(crate) fn redis(&self) -> &RedisHandle {
        &self.inner.redis
    }

    pub(crate) fn storage(&self) -> Option<&dyn ObjectStorage> {
        self.inner.storage.as_deref()
    }

    pub(crate) fn now(&self) -> PrimitiveDateTime {
        self.inner.clock.now()
    }
}
