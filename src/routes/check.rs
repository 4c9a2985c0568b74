use std::collections::HashMap;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use utoipa::ToSchema;

use crate::app::AppState;
use crate::routes::ApiJson;
use crate::authz::AuthorizationResult;
use crate::errors::AppError;
use crate::jwt::AuthUser;
use crate::models::rbac::WILDCARD_RESOURCE;

#[derive(Debug, Deserialize, ToSchema)]
pub struct CheckRequest {
    pub resource_type: String,
    /// Defaults to `*`.
    pub resource_id: Option<String>,
    pub action: String,
    #[schema(value_type = Option<Object>)]
    pub attributes: Option<HashMap<String, Value>>,
}

/// Check a permission for the authenticated caller
#[utoipa::path(
    post,
    path = "/authz/check",
    tag = "Authorization",
    request_body = CheckRequest,
    responses(
        (status = 200, description = "Decision with evaluation trace", body = AuthorizationResult),
        (status = 400, description = "Missing resource type or action"),
        (status = 401, description = "Missing or invalid token"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn check_permission(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(req): ApiJson<CheckRequest>,
) -> Result<Json<AuthorizationResult>, AppError> {
    let resource_id = req
        .resource_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| WILDCARD_RESOURCE.to_string());
    let attributes = req.attributes.unwrap_or_default();

    let result = state
        .authz
        .check_permission(auth.user_id, &req.resource_type, &resource_id, &req.action, Some(&attributes))
        .await?;

    tracing::debug!(user_id = %auth.user_id, trace = %result.trace, "explicit check");
    Ok(Json(result))
}
