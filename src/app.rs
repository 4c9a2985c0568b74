use std::sync::Arc;

use axum::http::Method;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::Router;
use sqlx::SqlitePool;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::authz::{self, permissions, AuthorizationManager, PermissionResolver};
use crate::cache::build_cache;
use crate::config::AppConfig;
use crate::errors::AppError;
use crate::events::{register_default_handlers, EventBus, EventMetrics, EventStore, LogNotifier};
use crate::jwt::JwtConfig;
use crate::routes::{admin, check, health, rbac};
use crate::storage::{SqliteStorage, StorageGateway};

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub jwt: Arc<JwtConfig>,
    pub storage: Arc<SqliteStorage>,
    pub authz: AuthorizationManager,
    pub events: Arc<EventBus>,
    pub metrics: Arc<EventMetrics>,
}

impl AppState {
    /// Wire storage, cache, manager and event bus over one pool.
    pub async fn build(pool: SqlitePool, jwt: JwtConfig, config: AppConfig) -> Result<Self, AppError> {
        let storage = Arc::new(SqliteStorage::new(pool.clone()));
        let cache = build_cache(&config.cache).await?;

        let gateway: Arc<dyn StorageGateway> = storage.clone();
        let authz = AuthorizationManager::new(PermissionResolver::new(gateway), cache, config.cache.ttl);

        let metrics = Arc::new(EventMetrics::new());
        let events = EventBus::new(config.event_concurrency)
            .with_store(EventStore::new(pool.clone()))
            .with_metrics(metrics.clone());
        register_default_handlers(
            &events,
            authz.clone(),
            pool.clone(),
            metrics.clone(),
            Arc::new(LogNotifier),
        )
        .await;

        Ok(Self {
            pool,
            jwt: Arc::new(jwt),
            storage,
            authz,
            events: Arc::new(events),
            metrics,
        })
    }
}

pub async fn create_app(pool: SqlitePool) -> Result<Router, AppError> {
    let jwt_config = JwtConfig::from_env()?;
    let config = AppConfig::from_env()?;
    let state = AppState::build(pool, jwt_config, config).await?;
    Ok(router(state))
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_origin(Any)
        .allow_headers(Any);

    let health_route = get(health::health).route_layer(from_fn_with_state(
        authz::optional_permission(&state, permissions::RBAC, permissions::READ),
        authz::enforce,
    ));

    Router::new()
        .route("/api/health", health_route)
        .route("/authz/check", post(check::check_permission))
        .nest("/rbac", rbac::routes(&state))
        .nest("/admin", admin::routes(&state))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
