use std::sync::Arc;

use crate::detect::engine::DetectionEngine;
use crate::storage::SqliteStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SqliteStore>,
    pub engine: Arc<DetectionEngine<SqliteStore>>,
}

impl AppState {
    pub fn new(store: Arc<SqliteStore>, config: crate::config::DetectorConfig) -> Self {
        let engine = Arc::new(DetectionEngine::new(store.clone(), config));
        Self { store, engine }
    }
}
