use axum::extract::State;
use axum::{Extension, Json};
use serde::Serialize;
use utoipa::ToSchema;

use crate::app::AppState;
use crate::authz::AuthorizationResult;
use crate::errors::AppResult;

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub db_ok: bool,
    pub cache_backend: &'static str,
    pub cache_ok: bool,
    /// Only filled in for callers allowed to read the rbac surface.
    pub errors: Option<Vec<String>>,
}

#[utoipa::path(
    get,
    path = "/api/health",
    tag = "Health",
    responses((status = 200, description = "Health check", body = HealthResponse))
)]
pub async fn health(
    State(state): State<AppState>,
    authorized: Option<Extension<AuthorizationResult>>,
) -> AppResult<Json<HealthResponse>> {
    let mut errors = Vec::new();

    let db_ok = match state.storage.ping().await {
        Ok(()) => true,
        Err(e) => {
            errors.push(format!("database: {e}"));
            false
        }
    };

    let cache = state.authz.cache();
    let cache_ok = match cache.health().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(backend = cache.backend(), error = %e, "cache health check failed");
            errors.push(format!("cache: {e}"));
            false
        }
    };

    let detailed = authorized.is_some_and(|Extension(result)| result.allowed);

    Ok(Json(HealthResponse {
        status: if db_ok && cache_ok { "ok" } else { "degraded" },
        db_ok,
        cache_backend: cache.backend(),
        cache_ok,
        errors: detailed.then_some(errors),
    }))
}
