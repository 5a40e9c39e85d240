//! HTTP surface of the order payment orchestrator.
//!
//! Storefront checkout, provider callbacks and operator endpoints, with
//! structured logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use event_store::{
    EventStore, InMemoryEventStore, InMemoryReceiptStore, PostgresEventStore,
    PostgresReceiptStore,
};
use metrics_exporter_prometheus::PrometheusHandle;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use config::{Config, ConfigError};
pub use error::ApiError;
pub use state::{AppState, Providers, StartupError};

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: EventStore + 'static>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::system::metrics))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::system::health::<S>))
        .route("/orders", post(routes::orders::place::<S>))
        .route("/orders/{id}", get(routes::orders::get::<S>))
        .route(
            "/payments/{provider}/create-order",
            post(routes::payments::create_order::<S>),
        )
        .route(
            "/payments/{provider}/capture",
            post(routes::payments::capture::<S>),
        )
        .route(
            "/payments/{provider}/callback",
            post(routes::payments::callback::<S>),
        )
        .route(
            "/payments/{provider}/status/{order_id}",
            get(routes::payments::status::<S>),
        )
        .route(
            "/admin/orders/{id}/status",
            post(routes::admin::override_status::<S>),
        )
        .route("/admin/orders/{id}/cancel", post(routes::admin::cancel::<S>))
        .route(
            "/admin/orders/{id}/payment",
            post(routes::admin::record_payment::<S>),
        )
        .route(
            "/admin/orders/{id}/shipment/retry",
            post(routes::admin::retry_shipment::<S>),
        )
        .route(
            "/admin/orders/{id}/shipment/track",
            post(routes::admin::track_shipment::<S>),
        )
        .route(
            "/admin/reconciliation/sweep",
            post(routes::admin::sweep::<S>),
        )
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// In-memory stores; everything is lost on restart.
pub fn create_memory_state(
    config: &Config,
    providers: Providers,
) -> Arc<AppState<InMemoryEventStore>> {
    Arc::new(AppState::new(
        InMemoryEventStore::new(),
        Arc::new(InMemoryReceiptStore::new()),
        providers,
        config,
    ))
}

/// PostgreSQL event and receipt stores. Runs the migrations first.
pub async fn create_postgres_state(
    database_url: &str,
    config: &Config,
    providers: Providers,
) -> Result<Arc<AppState<PostgresEventStore>>, StartupError> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    let store = PostgresEventStore::new(pool.clone());
    store.run_migrations().await?;

    Ok(Arc::new(AppState::new(
        store,
        Arc::new(PostgresReceiptStore::new(pool)),
        providers,
        config,
    )))
}
