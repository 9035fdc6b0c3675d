pub mod graphql;
pub mod http;

use std::sync::Arc;

use strata::{Config, Coordinator, GaugeRegistry};

pub use graphql::build_schema;
pub use http::{router, AppState};

/// Wires the coordinator, metrics registry, GraphQL schema and router
/// together for the given configuration.
pub async fn build_app(config: &Config) -> strata::Result<(Arc<Coordinator>, axum::Router)> {
    let registry = Arc::new(GaugeRegistry::default());
    let coordinator =
        Arc::new(Coordinator::from_config(config, registry.clone()).await?);
    let schema = build_schema(coordinator.clone());
    let state = AppState {
        coordinator: coordinator.clone(),
        registry,
        schema,
    };
    Ok((coordinator, router(state)))
}
