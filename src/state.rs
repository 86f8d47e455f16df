// src/state.rs
use std::sync::Arc;

use sqlx::PgPool;

use crate::upload::UploadStore;

#[derive(Clone)]
pub struct AppState {
    pub db_pool: PgPool,
    pub uploads: Arc<UploadStore>,
}

impl AppState {
    pub fn new(db_pool: PgPool, uploads: UploadStore) -> Self {
        Self {
            db_pool,
            uploads: Arc::new(uploads),
        }
    }
}
