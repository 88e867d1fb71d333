//! Shared application state for all routes.

use crate::metadata::ModelRegistry;
use crate::schema::SchemaGenerator;
use sqlx::PgPool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub registry: Arc<ModelRegistry>,
    /// Process-wide descriptor cache; read-mostly after warm-up.
    pub schemas: Arc<SchemaGenerator>,
}

impl AppState {
    pub fn new(pool: PgPool, registry: Arc<ModelRegistry>) -> Self {
        let schemas = Arc::new(SchemaGenerator::new(registry.clone()));
        AppState {
            pool,
            registry,
            schemas,
        }
    }
}
