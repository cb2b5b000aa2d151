//! Shared application state for the migration server.

use std::sync::Arc;

use sqlx::PgPool;

use crate::config::MigrationConfig;
use crate::jobs::JobManager;
use crate::progress::ProgressStore;
use crate::staging::StagingStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<MigrationConfig>,
    pub manager: Arc<JobManager>,
    pub progress: ProgressStore,
    pub staging: StagingStore,
    pub pool: PgPool,
}

impl AppState {
    pub fn new(config: Arc<MigrationConfig>, pool: PgPool, manager: Arc<JobManager>) -> Self {
        Self {
            config,
            manager,
            progress: ProgressStore::new(pool.clone()),
            staging: StagingStore::new(pool.clone()),
            pool,
        }
    }
}
