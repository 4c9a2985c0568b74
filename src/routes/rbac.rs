//! RBAC Admin API Routes
//!
//! Endpoints for managing roles, permissions, groups and assignments.
//! Every mutation publishes the matching event; the event bus takes care of
//! cache invalidation and the audit trail.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    middleware::from_fn_with_state,
    routing::{delete, get, patch, post},
    Json, Router,
};
use uuid::Uuid;

use crate::app::AppState;
use crate::routes::ApiJson;
use crate::authz::{self, permissions};
use crate::errors::AppError;
use crate::events::{AuthzEvent, EventType, RequestContext};
use crate::jwt::AuthUser;
use crate::models::rbac::*;
use crate::storage::StorageGateway;

// =============================================================================
// ROUTER
// =============================================================================

pub fn routes(state: &AppState) -> Router<AppState> {
    let read = Router::new()
        .route("/roles", get(list_roles))
        .route("/roles/:role_id", get(get_role))
        .route("/roles/:role_id/permissions", get(list_role_permissions))
        .route("/permissions", get(list_permissions))
        .route("/users/:user_id/roles", get(list_user_roles))
        .route("/groups", get(list_groups))
        .route("/groups/:group_id/members", get(list_group_members))
        .route("/groups/:group_id/roles", get(list_group_roles))
        .route_layer(from_fn_with_state(
            authz::require_permission(state, permissions::RBAC, permissions::READ),
            authz::enforce,
        ));

    let manage = Router::new()
        // Roles
        .route("/roles", post(create_role))
        .route("/roles/:role_id", patch(update_role).delete(delete_role))
        .route("/roles/:role_id/permissions", post(assign_permission_to_role))
        .route(
            "/roles/:role_id/permissions/:permission_id",
            delete(revoke_permission_from_role),
        )
        // Permissions
        .route("/permissions", post(create_permission))
        .route(
            "/permissions/:permission_id",
            patch(update_permission).delete(delete_permission),
        )
        // User role assignments
        .route("/users/:user_id/roles", post(assign_role_to_user))
        .route("/users/:user_id/roles/:role_id", delete(revoke_role_from_user))
        // Groups
        .route("/groups", post(create_group))
        .route("/groups/:group_id", delete(delete_group))
        .route("/groups/:group_id/members", post(add_group_member))
        .route("/groups/:group_id/members/:user_id", delete(remove_group_member))
        .route("/groups/:group_id/roles", post(assign_role_to_group))
        .route("/groups/:group_id/roles/:role_id", delete(revoke_role_from_group))
        .route_layer(from_fn_with_state(
            authz::require_permission(state, permissions::RBAC, permissions::MANAGE),
            authz::enforce,
        ));

    read.merge(manage)
}

async fn publish(state: &AppState, headers: &HeaderMap, event: AuthzEvent) -> Result<(), AppError> {
    state
        .events
        .publish_event(event.with_context(RequestContext::from_headers(headers)))
        .await
}

// =============================================================================
// ROLE ENDPOINTS
// =============================================================================

/// List all roles
#[utoipa::path(
    get,
    path = "/rbac/roles",
    tag = "RBAC",
    responses(
        (status = 200, description = "List of roles", body = Vec<Role>),
    ),
    security(("bearerAuth" = []))
)]
pub async fn list_roles(State(state): State<AppState>) -> Result<Json<Vec<Role>>, AppError> {
    Ok(Json(state.storage.list_roles().await?))
}

/// Create a new role
#[utoipa::path(
    post,
    path = "/rbac/roles",
    tag = "RBAC",
    request_body = RoleCreateRequest,
    responses(
        (status = 201, description = "Role created", body = Role),
        (status = 400, description = "Unknown parent role"),
        (status = 409, description = "Role name already exists"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn create_role(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    ApiJson(req): ApiJson<RoleCreateRequest>,
) -> Result<(StatusCode, Json<Role>), AppError> {
    let role = state.storage.create_role(req, false).await?;

    let event = AuthzEvent::for_entity(EventType::RoleCreated, Some(auth.user_id), &role)
        .with_metadata("role_id", role.id.to_string());
    publish(&state, &headers, event).await?;

    Ok((StatusCode::CREATED, Json(role)))
}

/// Get a role by id
#[utoipa::path(
    get,
    path = "/rbac/roles/{role_id}",
    tag = "RBAC",
    params(("role_id" = Uuid, Path, description = "Role id")),
    responses(
        (status = 200, description = "Role", body = Role),
        (status = 404, description = "Role not found"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn get_role(State(state): State<AppState>, Path(role_id): Path<Uuid>) -> Result<Json<Role>, AppError> {
    Ok(Json(state.storage.get_role_by_id(role_id).await?))
}

/// Partially update a role
#[utoipa::path(
    patch,
    path = "/rbac/roles/{role_id}",
    tag = "RBAC",
    params(("role_id" = Uuid, Path, description = "Role id")),
    request_body = RoleUpdateRequest,
    responses(
        (status = 200, description = "Role updated", body = Role),
        (status = 400, description = "Invalid parent or cycle"),
        (status = 403, description = "System roles are immutable"),
        (status = 404, description = "Role not found"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn update_role(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(role_id): Path<Uuid>,
    ApiJson(req): ApiJson<RoleUpdateRequest>,
) -> Result<Json<Role>, AppError> {
    let (before, role) = state.storage.update_role(role_id, req).await?;

    let event = AuthzEvent::for_entity(EventType::RoleUpdated, Some(auth.user_id), &role)
        .with_metadata("role_id", role.id.to_string())
        .with_metadata("before", serde_json::to_value(&before)?);
    publish(&state, &headers, event).await?;

    Ok(Json(role))
}

/// Delete a role no subject holds
#[utoipa::path(
    delete,
    path = "/rbac/roles/{role_id}",
    tag = "RBAC",
    params(("role_id" = Uuid, Path, description = "Role id")),
    responses(
        (status = 204, description = "Role deleted"),
        (status = 403, description = "System roles cannot be deleted"),
        (status = 404, description = "Role not found"),
        (status = 409, description = "Role is still held or has child roles"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn delete_role(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(role_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let role = state.storage.delete_role(role_id).await?;

    let event = AuthzEvent::for_entity(EventType::RoleDeleted, Some(auth.user_id), &role)
        .with_metadata("role_id", role.id.to_string());
    publish(&state, &headers, event).await?;

    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// ROLE PERMISSIONS
// =============================================================================

/// List the permissions attached to a role
#[utoipa::path(
    get,
    path = "/rbac/roles/{role_id}/permissions",
    tag = "RBAC",
    params(("role_id" = Uuid, Path, description = "Role id")),
    responses((status = 200, description = "Role permissions", body = Vec<Permission>)),
    security(("bearerAuth" = []))
)]
pub async fn list_role_permissions(
    State(state): State<AppState>,
    Path(role_id): Path<Uuid>,
) -> Result<Json<Vec<Permission>>, AppError> {
    Ok(Json(state.storage.list_role_permissions(role_id).await?))
}

/// Attach a permission to a role
#[utoipa::path(
    post,
    path = "/rbac/roles/{role_id}/permissions",
    tag = "RBAC",
    params(("role_id" = Uuid, Path, description = "Role id")),
    request_body = AssignPermissionToRoleRequest,
    responses(
        (status = 201, description = "Permission attached", body = RolePermission),
        (status = 404, description = "Role or permission not found"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn assign_permission_to_role(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(role_id): Path<Uuid>,
    ApiJson(req): ApiJson<AssignPermissionToRoleRequest>,
) -> Result<(StatusCode, Json<RolePermission>), AppError> {
    let link = state.storage.assign_permission_to_role(role_id, req.permission_id).await?;

    let event = AuthzEvent::for_entity(EventType::RolePermissionAssigned, Some(auth.user_id), &link)
        .with_metadata("role_id", role_id.to_string())
        .with_metadata("permission_id", req.permission_id.to_string());
    publish(&state, &headers, event).await?;

    Ok((StatusCode::CREATED, Json(link)))
}

/// Detach a permission from a role
#[utoipa::path(
    delete,
    path = "/rbac/roles/{role_id}/permissions/{permission_id}",
    tag = "RBAC",
    params(
        ("role_id" = Uuid, Path, description = "Role id"),
        ("permission_id" = Uuid, Path, description = "Permission id"),
    ),
    responses(
        (status = 204, description = "Permission detached"),
        (status = 404, description = "Permission not attached to role"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn revoke_permission_from_role(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path((role_id, permission_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, AppError> {
    let link = state.storage.revoke_permission_from_role(role_id, permission_id).await?;

    let event = AuthzEvent::for_entity(EventType::RolePermissionRevoked, Some(auth.user_id), &link)
        .with_metadata("role_id", role_id.to_string())
        .with_metadata("permission_id", permission_id.to_string());
    publish(&state, &headers, event).await?;

    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// PERMISSION ENDPOINTS
// =============================================================================

/// List all permissions
#[utoipa::path(
    get,
    path = "/rbac/permissions",
    tag = "RBAC",
    responses((status = 200, description = "List of permissions", body = Vec<Permission>)),
    security(("bearerAuth" = []))
)]
pub async fn list_permissions(State(state): State<AppState>) -> Result<Json<Vec<Permission>>, AppError> {
    Ok(Json(state.storage.list_permissions().await?))
}

/// Create a permission
#[utoipa::path(
    post,
    path = "/rbac/permissions",
    tag = "RBAC",
    request_body = PermissionCreateRequest,
    responses(
        (status = 201, description = "Permission created", body = Permission),
        (status = 400, description = "Invalid resource type, action or conditions"),
        (status = 409, description = "Permission name already exists"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn create_permission(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    ApiJson(req): ApiJson<PermissionCreateRequest>,
) -> Result<(StatusCode, Json<Permission>), AppError> {
    let permission = state.storage.create_permission(req).await?;

    let event = AuthzEvent::for_entity(EventType::PermissionCreated, Some(auth.user_id), &permission);
    publish(&state, &headers, event).await?;

    Ok((StatusCode::CREATED, Json(permission)))
}

/// Partially update a permission
#[utoipa::path(
    patch,
    path = "/rbac/permissions/{permission_id}",
    tag = "RBAC",
    params(("permission_id" = Uuid, Path, description = "Permission id")),
    request_body = PermissionUpdateRequest,
    responses(
        (status = 200, description = "Permission updated", body = Permission),
        (status = 404, description = "Permission not found"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn update_permission(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(permission_id): Path<Uuid>,
    ApiJson(req): ApiJson<PermissionUpdateRequest>,
) -> Result<Json<Permission>, AppError> {
    let (_, permission) = state.storage.update_permission(permission_id, req).await?;
    let role_ids = state.storage.roles_with_permission(permission_id).await?;

    let event = AuthzEvent::for_entity(EventType::PermissionUpdated, Some(auth.user_id), &permission)
        .with_metadata("role_ids", uuid_list(&role_ids));
    publish(&state, &headers, event).await?;

    Ok(Json(permission))
}

/// Delete a permission
#[utoipa::path(
    delete,
    path = "/rbac/permissions/{permission_id}",
    tag = "RBAC",
    params(("permission_id" = Uuid, Path, description = "Permission id")),
    responses(
        (status = 204, description = "Permission deleted"),
        (status = 404, description = "Permission not found"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn delete_permission(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(permission_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let (permission, role_ids) = state.storage.delete_permission(permission_id).await?;

    let event = AuthzEvent::for_entity(EventType::PermissionDeleted, Some(auth.user_id), &permission)
        .with_metadata("role_ids", uuid_list(&role_ids));
    publish(&state, &headers, event).await?;

    Ok(StatusCode::NO_CONTENT)
}

fn uuid_list(ids: &[Uuid]) -> serde_json::Value {
    serde_json::Value::Array(ids.iter().map(|id| id.to_string().into()).collect())
}

// =============================================================================
// USER ROLE ASSIGNMENTS
// =============================================================================

/// List a user's role assignments
#[utoipa::path(
    get,
    path = "/rbac/users/{user_id}/roles",
    tag = "RBAC",
    params(("user_id" = Uuid, Path, description = "User id")),
    responses((status = 200, description = "Role assignments", body = Vec<RoleAssignment>)),
    security(("bearerAuth" = []))
)]
pub async fn list_user_roles(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<Vec<RoleAssignment>>, AppError> {
    Ok(Json(state.storage.list_assignments(SubjectKind::User, user_id).await?))
}

/// Assign a role to a user
#[utoipa::path(
    post,
    path = "/rbac/users/{user_id}/roles",
    tag = "RBAC",
    params(("user_id" = Uuid, Path, description = "User id")),
    request_body = AssignRoleRequest,
    responses(
        (status = 201, description = "Role assigned", body = RoleAssignment),
        (status = 404, description = "Role not found"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn assign_role_to_user(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(user_id): Path<Uuid>,
    ApiJson(req): ApiJson<AssignRoleRequest>,
) -> Result<(StatusCode, Json<RoleAssignment>), AppError> {
    let assignment = state
        .storage
        .assign_role(SubjectKind::User, user_id, req, Some(auth.user_id))
        .await?;

    let event = AuthzEvent::for_entity(EventType::RoleAssigned, Some(auth.user_id), &assignment)
        .with_metadata("user_id", user_id.to_string())
        .with_metadata("role_id", assignment.role_id.to_string());
    publish(&state, &headers, event).await?;

    Ok((StatusCode::CREATED, Json(assignment)))
}

/// Revoke a role from a user
#[utoipa::path(
    delete,
    path = "/rbac/users/{user_id}/roles/{role_id}",
    tag = "RBAC",
    params(
        ("user_id" = Uuid, Path, description = "User id"),
        ("role_id" = Uuid, Path, description = "Role id"),
    ),
    responses(
        (status = 204, description = "Role revoked"),
        (status = 404, description = "Role not assigned"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn revoke_role_from_user(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path((user_id, role_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, AppError> {
    let removed = state.storage.revoke_role(SubjectKind::User, user_id, role_id).await?;

    let event = AuthzEvent::new(EventType::RoleRevoked, Some(auth.user_id))
        .with_target("role_assignment", user_id.to_string())
        .with_metadata("user_id", user_id.to_string())
        .with_metadata("role_id", role_id.to_string())
        .with_metadata("removed", removed.len() as u64);
    publish(&state, &headers, event).await?;

    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// GROUPS
// =============================================================================

/// List all groups
#[utoipa::path(
    get,
    path = "/rbac/groups",
    tag = "RBAC",
    responses((status = 200, description = "List of groups", body = Vec<Group>)),
    security(("bearerAuth" = []))
)]
pub async fn list_groups(State(state): State<AppState>) -> Result<Json<Vec<Group>>, AppError> {
    Ok(Json(state.storage.list_groups().await?))
}

/// Create a group
#[utoipa::path(
    post,
    path = "/rbac/groups",
    tag = "RBAC",
    request_body = GroupCreateRequest,
    responses(
        (status = 201, description = "Group created", body = Group),
        (status = 409, description = "Group name already exists"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn create_group(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    ApiJson(req): ApiJson<GroupCreateRequest>,
) -> Result<(StatusCode, Json<Group>), AppError> {
    let group = state.storage.create_group(req).await?;

    let event = AuthzEvent::for_entity(EventType::GroupCreated, Some(auth.user_id), &group);
    publish(&state, &headers, event).await?;

    Ok((StatusCode::CREATED, Json(group)))
}

/// Delete a group, its memberships and its role assignments
#[utoipa::path(
    delete,
    path = "/rbac/groups/{group_id}",
    tag = "RBAC",
    params(("group_id" = Uuid, Path, description = "Group id")),
    responses(
        (status = 204, description = "Group deleted"),
        (status = 404, description = "Group not found"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn delete_group(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(group_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let (group, members) = state.storage.delete_group(group_id).await?;

    let event = AuthzEvent::for_entity(EventType::GroupDeleted, Some(auth.user_id), &group)
        .with_metadata("group_id", group_id.to_string())
        .with_metadata("member_ids", uuid_list(&members));
    publish(&state, &headers, event).await?;

    Ok(StatusCode::NO_CONTENT)
}

/// List group members
#[utoipa::path(
    get,
    path = "/rbac/groups/{group_id}/members",
    tag = "RBAC",
    params(("group_id" = Uuid, Path, description = "Group id")),
    responses((status = 200, description = "Group members", body = Vec<GroupMember>)),
    security(("bearerAuth" = []))
)]
pub async fn list_group_members(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
) -> Result<Json<Vec<GroupMember>>, AppError> {
    state.storage.get_group(group_id).await?;
    Ok(Json(state.storage.list_group_members(group_id).await?))
}

/// Add a user to a group
#[utoipa::path(
    post,
    path = "/rbac/groups/{group_id}/members",
    tag = "RBAC",
    params(("group_id" = Uuid, Path, description = "Group id")),
    request_body = AddGroupMemberRequest,
    responses(
        (status = 201, description = "Member added", body = GroupMember),
        (status = 404, description = "Group not found"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn add_group_member(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(group_id): Path<Uuid>,
    ApiJson(req): ApiJson<AddGroupMemberRequest>,
) -> Result<(StatusCode, Json<GroupMember>), AppError> {
    let member = state.storage.add_group_member(group_id, req.user_id).await?;

    let event = AuthzEvent::for_entity(EventType::GroupMemberAdded, Some(auth.user_id), &member)
        .with_metadata("group_id", group_id.to_string())
        .with_metadata("user_id", req.user_id.to_string());
    publish(&state, &headers, event).await?;

    Ok((StatusCode::CREATED, Json(member)))
}

/// Remove a user from a group
#[utoipa::path(
    delete,
    path = "/rbac/groups/{group_id}/members/{user_id}",
    tag = "RBAC",
    params(
        ("group_id" = Uuid, Path, description = "Group id"),
        ("user_id" = Uuid, Path, description = "User id"),
    ),
    responses(
        (status = 204, description = "Member removed"),
        (status = 404, description = "User is not a member"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn remove_group_member(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path((group_id, user_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, AppError> {
    let member = state.storage.remove_group_member(group_id, user_id).await?;

    let event = AuthzEvent::for_entity(EventType::GroupMemberRemoved, Some(auth.user_id), &member)
        .with_metadata("group_id", group_id.to_string())
        .with_metadata("user_id", user_id.to_string());
    publish(&state, &headers, event).await?;

    Ok(StatusCode::NO_CONTENT)
}

/// List a group's role assignments
#[utoipa::path(
    get,
    path = "/rbac/groups/{group_id}/roles",
    tag = "RBAC",
    params(("group_id" = Uuid, Path, description = "Group id")),
    responses((status = 200, description = "Role assignments", body = Vec<RoleAssignment>)),
    security(("bearerAuth" = []))
)]
pub async fn list_group_roles(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
) -> Result<Json<Vec<RoleAssignment>>, AppError> {
    state.storage.get_group(group_id).await?;
    Ok(Json(state.storage.list_assignments(SubjectKind::Group, group_id).await?))
}

/// Assign a role to a group
#[utoipa::path(
    post,
    path = "/rbac/groups/{group_id}/roles",
    tag = "RBAC",
    params(("group_id" = Uuid, Path, description = "Group id")),
    request_body = AssignRoleRequest,
    responses(
        (status = 201, description = "Role assigned", body = RoleAssignment),
        (status = 404, description = "Group or role not found"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn assign_role_to_group(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(group_id): Path<Uuid>,
    ApiJson(req): ApiJson<AssignRoleRequest>,
) -> Result<(StatusCode, Json<RoleAssignment>), AppError> {
    let assignment = state
        .storage
        .assign_role(SubjectKind::Group, group_id, req, Some(auth.user_id))
        .await?;

    let event = AuthzEvent::for_entity(EventType::GroupRoleAssigned, Some(auth.user_id), &assignment)
        .with_metadata("group_id", group_id.to_string())
        .with_metadata("role_id", assignment.role_id.to_string());
    publish(&state, &headers, event).await?;

    Ok((StatusCode::CREATED, Json(assignment)))
}

/// Revoke a role from a group
#[utoipa::path(
    delete,
    path = "/rbac/groups/{group_id}/roles/{role_id}",
    tag = "RBAC",
    params(
        ("group_id" = Uuid, Path, description = "Group id"),
        ("role_id" = Uuid, Path, description = "Role id"),
    ),
    responses(
        (status = 204, description = "Role revoked"),
        (status = 404, description = "Role not assigned"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn revoke_role_from_group(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path((group_id, role_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, AppError> {
    state.storage.revoke_role(SubjectKind::Group, group_id, role_id).await?;

    let event = AuthzEvent::new(EventType::GroupRoleRevoked, Some(auth.user_id))
        .with_target("role_assignment", group_id.to_string())
        .with_metadata("group_id", group_id.to_string())
        .with_metadata("role_id", role_id.to_string());
    publish(&state, &headers, event).await?;

    Ok(StatusCode::NO_CONTENT)
}
