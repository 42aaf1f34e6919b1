use std::sync::Arc;

use crate::shared::utils::DbPool;

/// State shared by the HTTP handlers. The classification worker holds its own
/// handles; requests only ever touch the pool and the job queue.
#[derive(Clone)]
pub struct AppState {
    pub conn: DbPool,
    pub cache: Arc<redis::Client>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("conn", &"DbPool")
            .field("cache", &"RedisClient")
            .finish()
    }
}
