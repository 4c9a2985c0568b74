//! Operator endpoints: cache invalidation, matrix inspection, event counters.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware::from_fn_with_state,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::app::AppState;
use crate::routes::ApiJson;
use crate::authz::{self, roles};
use crate::errors::AppError;
use crate::events::{AuthzEvent, EventMetricsSnapshot, EventType, RequestContext};
use crate::jwt::AuthUser;
use crate::models::rbac::UserPermissionMatrix;

pub fn routes(state: &AppState) -> Router<AppState> {
    let operator = Router::new()
        .route("/cache/invalidate", post(invalidate_cache))
        .route("/event-metrics", get(event_metrics))
        .route_layer(from_fn_with_state(
            authz::require_role(state, [roles::ADMIN]),
            authz::enforce,
        ));

    // Users may inspect their own matrix; others need user:<id>:manage.
    let matrix = Router::new()
        .route("/users/:user_id/matrix", get(user_matrix))
        .route_layer(from_fn_with_state(
            authz::require_ownership(state, "user"),
            authz::enforce,
        ));

    operator.merge(matrix)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum InvalidationScope {
    User,
    Role,
    Group,
}

impl InvalidationScope {
    fn as_str(&self) -> &'static str {
        match self {
            InvalidationScope::User => "user",
            InvalidationScope::Role => "role",
            InvalidationScope::Group => "group",
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct InvalidateRequest {
    #[serde(rename = "type")]
    pub scope: InvalidationScope,
    pub id: Uuid,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct InvalidateResponse {
    #[serde(rename = "type")]
    pub scope: InvalidationScope,
    pub id: Uuid,
    pub invalidated: bool,
}

/// Force cache invalidation for a user, role or group
#[utoipa::path(
    post,
    path = "/admin/cache/invalidate",
    tag = "Admin",
    request_body = InvalidateRequest,
    responses(
        (status = 200, description = "Invalidated", body = InvalidateResponse),
        (status = 403, description = "Caller is not an admin"),
        (status = 500, description = "Cache invalidation failed"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn invalidate_cache(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    ApiJson(req): ApiJson<InvalidateRequest>,
) -> Result<(StatusCode, Json<InvalidateResponse>), AppError> {
    let event = AuthzEvent::new(EventType::CacheInvalidation, Some(auth.user_id))
        .with_target(req.scope.as_str(), req.id.to_string())
        .with_metadata("scope", req.scope.as_str())
        .with_context(RequestContext::from_headers(&headers));
    state.events.publish_event(event).await?;

    tracing::info!(scope = req.scope.as_str(), id = %req.id, actor = %auth.user_id, "cache invalidated");
    Ok((
        StatusCode::OK,
        Json(InvalidateResponse {
            scope: req.scope,
            id: req.id,
            invalidated: true,
        }),
    ))
}

#[derive(Debug, Default, Deserialize)]
pub struct MatrixQuery {
    #[serde(default)]
    pub refresh: bool,
}

/// Inspect a user's permission matrix
#[utoipa::path(
    get,
    path = "/admin/users/{user_id}/matrix",
    tag = "Admin",
    params(
        ("user_id" = Uuid, Path, description = "User id"),
        ("refresh" = Option<bool>, Query, description = "Recompute instead of reading the cache"),
    ),
    responses(
        (status = 200, description = "Permission matrix", body = UserPermissionMatrix),
        (status = 403, description = "Not the caller's matrix and no user manage permission"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn user_matrix(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<MatrixQuery>,
) -> Result<Json<UserPermissionMatrix>, AppError> {
    let matrix = if query.refresh {
        state.authz.refresh_user_matrix(user_id).await?
    } else {
        state.authz.get_user_matrix(user_id).await?
    };
    Ok(Json(matrix))
}

/// Per-event-type counters and handler failures
#[utoipa::path(
    get,
    path = "/admin/event-metrics",
    tag = "Admin",
    responses((status = 200, description = "Event counters", body = EventMetricsSnapshot)),
    security(("bearerAuth" = []))
)]
pub async fn event_metrics(State(state): State<AppState>) -> Json<EventMetricsSnapshot> {
    Json(state.metrics.snapshot())
}
