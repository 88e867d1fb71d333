//! Demo server: a small task-tracker model exposed end to end.
//!
//! Expects the `tasks`/`attachments` tables (and the `task_type` enum) to
//! exist already; schema management is out of scope for the library.

use axum::Router;
use entity_rest::{
    common_routes, entity_routes, AppState, Cardinality, EntityId, EntityMeta, FieldMeta,
    ModelRegistry, RelationshipMeta, TypeTag,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn model() -> Result<ModelRegistry, entity_rest::ApiError> {
    ModelRegistry::new(vec![
        EntityMeta::new("Task", "tasks")
            .field(FieldMeta::new("id", TypeTag::Integer).primary_key())
            .field(FieldMeta::new("name", TypeTag::Text))
            .field(FieldMeta::new("finished_by", TypeTag::Date).nullable())
            .field(FieldMeta::new(
                "type",
                TypeTag::Enum {
                    name: "task_type".into(),
                    variants: vec!["Task".into(), "Chore".into(), "Errand".into()],
                },
            ))
            .field(FieldMeta::new("payload", TypeTag::Binary).nullable())
            .relationship(RelationshipMeta {
                name: "attachments".into(),
                target: EntityId::new("Attachment"),
                cardinality: Cardinality::Many,
                our_key: "id".into(),
                their_key: "task_id".into(),
            }),
        EntityMeta::new("Attachment", "attachments")
            .field(FieldMeta::new("id", TypeTag::Integer).primary_key())
            .field(
                FieldMeta::new("task_id", TypeTag::Integer).foreign_key(EntityId::new("Task")),
            )
            .field(FieldMeta::new("location", TypeTag::Text))
            .relationship(RelationshipMeta {
                name: "task".into(),
                target: EntityId::new("Task"),
                cardinality: Cardinality::One,
                our_key: "task_id".into(),
                their_key: "id".into(),
            }),
    ])
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("entity_rest=debug".parse()?),
        )
        .init();

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://localhost/entity_rest".into());
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;

    let registry = Arc::new(model()?);
    let state = AppState::new(pool, registry);

    let app = Router::new()
        .merge(common_routes())
        .merge(entity_routes(state));

    let listener = TcpListener::bind("0.0.0.0:3000").await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}
