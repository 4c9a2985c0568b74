use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::SqliteConnection;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::StorageGateway;
use crate::db::row_parsers::{assignment_from_row, group_from_row, permission_from_row, role_from_row};
use crate::errors::{AppError, AppResult};
use crate::models::rbac::{
    AssignRoleRequest, Effect, Group, GroupCreateRequest, GroupMember, Permission,
    PermissionCreateRequest, PermissionUpdateRequest, Role, RoleAssignment, RoleCreateRequest,
    RoleGrant, RolePermission, RoleUpdateRequest, SubjectKind, WILDCARD_RESOURCE,
};

const ROLE_COLUMNS: &str =
    "r.id, r.name, r.description, r.parent_id, r.level, r.is_system, r.is_active, r.created_at, r.updated_at";
const PERMISSION_COLUMNS: &str =
    "p.id, p.name, p.resource_type, p.action, p.effect, p.conditions, p.is_active, p.created_at, p.updated_at";
const GROUP_COLUMNS: &str = "g.id, g.name, g.description, g.created_at, g.updated_at";
const ASSIGNMENT_COLUMNS: &str = "ra.id AS ra_id, ra.subject_kind AS ra_subject_kind, \
     ra.subject_id AS ra_subject_id, ra.role_id AS ra_role_id, ra.resource_id AS ra_resource_id, \
     ra.expires_at AS ra_expires_at, ra.is_active AS ra_is_active, ra.granted_by AS ra_granted_by, \
     ra.created_at AS ra_created_at";

// Guards the recursive ancestor walk against corrupted parent links.
const MAX_HIERARCHY_DEPTH: i64 = 64;

/// SQLite-backed storage: the gateway read side plus the administrative
/// write side used by the management API.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

/// Outages become `StorageUnavailable`; a missing row becomes `NotFound`.
fn gateway_error(err: sqlx::Error) -> AppError {
    match err {
        sqlx::Error::RowNotFound => AppError::not_found("row not found"),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            AppError::storage_unavailable(err.to_string())
        }
        other => AppError::Database(other),
    }
}

fn write_error(err: sqlx::Error, what: &str) -> AppError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            AppError::conflict(format!("{what} already exists"))
        }
        _ => gateway_error(err),
    }
}

/// Key segments may not contain the `:` separator.
fn validate_segment(value: &str, field: &str) -> AppResult<()> {
    if value.trim().is_empty() {
        return Err(AppError::bad_request(format!("{field} must not be empty")));
    }
    if value.contains(':') {
        return Err(AppError::bad_request(format!("{field} must not contain ':'")));
    }
    Ok(())
}

/// Conditions must be a flat JSON object of scalar values.
fn normalize_conditions(conditions: Option<Value>) -> AppResult<Option<String>> {
    match conditions {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) if map.is_empty() => Ok(None),
        Some(Value::Object(map)) => {
            if map.values().any(|v| v.is_object() || v.is_array()) {
                return Err(AppError::bad_request("conditions must be a flat key/value map"));
            }
            Ok(Some(Value::Object(map).to_string()))
        }
        Some(_) => Err(AppError::bad_request("conditions must be a JSON object")),
    }
}

async fn fetch_role(conn: &mut SqliteConnection, role_id: Uuid) -> AppResult<Role> {
    let sql = format!("SELECT {ROLE_COLUMNS} FROM roles r WHERE r.id = ?");
    let row = sqlx::query(&sql)
        .bind(role_id.to_string())
        .fetch_optional(&mut *conn)
        .await
        .map_err(gateway_error)?
        .ok_or_else(|| AppError::not_found(format!("role {role_id} not found")))?;
    role_from_row(&row)
}

async fn fetch_ancestors(conn: &mut SqliteConnection, role_id: Uuid) -> AppResult<Vec<Role>> {
    let sql = format!(
        r#"
        WITH RECURSIVE ancestors(id, depth) AS (
            SELECT parent_id, 1 FROM roles WHERE id = ? AND parent_id IS NOT NULL
            UNION
            SELECT r.parent_id, a.depth + 1
            FROM roles r INNER JOIN ancestors a ON r.id = a.id
            WHERE r.parent_id IS NOT NULL AND a.depth < ?
        )
        SELECT {ROLE_COLUMNS}
        FROM roles r INNER JOIN ancestors a ON r.id = a.id
        ORDER BY a.depth
        "#
    );
    let rows = sqlx::query(&sql)
        .bind(role_id.to_string())
        .bind(MAX_HIERARCHY_DEPTH)
        .fetch_all(&mut *conn)
        .await
        .map_err(gateway_error)?;

    let mut chain: Vec<Role> = Vec::with_capacity(rows.len());
    for row in &rows {
        let role = role_from_row(row)?;
        if role.id == role_id || chain.iter().any(|r| r.id == role.id) {
            break;
        }
        chain.push(role);
    }
    Ok(chain)
}

/// Re-derive levels below `root` after its level changed.
async fn relevel_descendants(conn: &mut SqliteConnection, root: Uuid, root_level: i64) -> AppResult<()> {
    let mut queue = VecDeque::from([(root, root_level)]);
    while let Some((parent_id, parent_level)) = queue.pop_front() {
        let children: Vec<String> = sqlx::query_scalar("SELECT id FROM roles WHERE parent_id = ?")
            .bind(parent_id.to_string())
            .fetch_all(&mut *conn)
            .await?;

        for child in children {
            let child_id = Uuid::parse_str(&child)
                .map_err(|e| AppError::internal(format!("invalid role id {child}: {e}")))?;
            sqlx::query("UPDATE roles SET level = ?, updated_at = ? WHERE id = ?")
                .bind(parent_level + 1)
                .bind(Utc::now())
                .bind(&child)
                .execute(&mut *conn)
                .await?;
            queue.push_back((child_id, parent_level + 1));
        }
    }
    Ok(())
}

async fn fetch_assignments_for_role(conn: &mut SqliteConnection, role_id: Uuid) -> AppResult<Vec<RoleAssignment>> {
    let sql = format!("SELECT {ASSIGNMENT_COLUMNS} FROM role_assignments ra WHERE ra.role_id = ?");
    let rows = sqlx::query(&sql)
        .bind(role_id.to_string())
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(assignment_from_row).collect()
}

impl SqliteStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn ping(&self) -> AppResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(gateway_error)?;
        Ok(())
    }

    async fn grants_for(&self, kind: SubjectKind, subject_id: Uuid) -> AppResult<Vec<RoleGrant>> {
        let sql = format!(
            r#"
            SELECT {ASSIGNMENT_COLUMNS}, {ROLE_COLUMNS}
            FROM role_assignments ra
            INNER JOIN roles r ON r.id = ra.role_id
            WHERE ra.subject_kind = ? AND ra.subject_id = ? AND ra.is_active = 1
            ORDER BY r.name
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(kind.as_str())
            .bind(subject_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(gateway_error)?;

        let now = Utc::now();
        let mut grants = Vec::with_capacity(rows.len());
        for row in &rows {
            let assignment = assignment_from_row(row)?;
            if !assignment.is_effective(now) {
                continue;
            }
            grants.push(RoleGrant {
                role: role_from_row(row)?,
                resource_id: assignment.resource_id,
                expires_at: assignment.expires_at,
            });
        }
        Ok(grants)
    }

    // -------------------------------------------------------------------------
    // Roles
    // -------------------------------------------------------------------------

    pub async fn list_roles(&self) -> AppResult<Vec<Role>> {
        let sql = format!("SELECT {ROLE_COLUMNS} FROM roles r ORDER BY r.level, r.name");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(role_from_row).collect()
    }

    pub async fn find_role_by_name(&self, name: &str) -> AppResult<Option<Role>> {
        let sql = format!("SELECT {ROLE_COLUMNS} FROM roles r WHERE r.name = ?");
        let row = sqlx::query(&sql).bind(name).fetch_optional(&self.pool).await?;
        row.as_ref().map(role_from_row).transpose()
    }

    pub async fn create_role(&self, req: RoleCreateRequest, is_system: bool) -> AppResult<Role> {
        if req.name.trim().is_empty() {
            return Err(AppError::bad_request("role name must not be empty"));
        }

        let mut conn = self.pool.acquire().await?;
        let mut role = Role::new(req.name.trim());
        role.description = req.description;
        role.is_system = is_system;

        if let Some(parent_id) = req.parent_id {
            let parent = fetch_role(&mut conn, parent_id).await.map_err(|err| {
                if err.is_not_found() {
                    AppError::bad_request(format!("parent role {parent_id} not found"))
                } else {
                    err
                }
            })?;
            role = role.with_parent(&parent);
        }

        sqlx::query(
            "INSERT INTO roles (id, name, description, parent_id, level, is_system, is_active, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(role.id.to_string())
        .bind(&role.name)
        .bind(&role.description)
        .bind(role.parent_id.map(|id| id.to_string()))
        .bind(role.level)
        .bind(role.is_system)
        .bind(role.is_active)
        .bind(role.created_at)
        .bind(role.updated_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| write_error(e, "role"))?;

        Ok(role)
    }

    /// Partial update. Returns `(before, after)`.
    pub async fn update_role(&self, role_id: Uuid, req: RoleUpdateRequest) -> AppResult<(Role, Role)> {
        let mut tx = self.pool.begin().await?;
        let old = fetch_role(&mut tx, role_id).await?;
        if old.is_system {
            return Err(AppError::forbidden("system roles are immutable"));
        }

        let mut role = old.clone();
        if let Some(name) = req.name {
            if name.trim().is_empty() {
                return Err(AppError::bad_request("role name must not be empty"));
            }
            role.name = name.trim().to_string();
        }
        if let Some(description) = req.description {
            role.description = Some(description);
        }
        if let Some(is_active) = req.is_active {
            role.is_active = is_active;
        }

        if req.detach_parent {
            role.parent_id = None;
            role.level = 0;
        } else if let Some(parent_id) = req.parent_id {
            if parent_id == role_id {
                return Err(AppError::bad_request("a role cannot be its own parent"));
            }
            let parent = fetch_role(&mut tx, parent_id).await.map_err(|err| {
                if err.is_not_found() {
                    AppError::bad_request(format!("parent role {parent_id} not found"))
                } else {
                    err
                }
            })?;
            let ancestors = fetch_ancestors(&mut tx, parent_id).await?;
            if ancestors.iter().any(|r| r.id == role_id) {
                return Err(AppError::bad_request("parent change would create a cycle"));
            }
            role.parent_id = Some(parent.id);
            role.level = parent.level + 1;
        }
        role.updated_at = Utc::now();

        sqlx::query(
            "UPDATE roles SET name = ?, description = ?, parent_id = ?, level = ?, is_active = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&role.name)
        .bind(&role.description)
        .bind(role.parent_id.map(|id| id.to_string()))
        .bind(role.level)
        .bind(role.is_active)
        .bind(role.updated_at)
        .bind(role_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|e| write_error(e, "role"))?;

        if role.level != old.level {
            relevel_descendants(&mut tx, role_id, role.level).await?;
        }

        tx.commit().await?;
        Ok((old, role))
    }

    /// Rejected for system roles, held roles, and roles with children.
    pub async fn delete_role(&self, role_id: Uuid) -> AppResult<Role> {
        let mut tx = self.pool.begin().await?;
        let role = fetch_role(&mut tx, role_id).await?;
        if role.is_system {
            return Err(AppError::forbidden("system roles cannot be deleted"));
        }

        let now = Utc::now();
        let holders = fetch_assignments_for_role(&mut tx, role_id)
            .await?
            .into_iter()
            .filter(|a| a.is_effective(now))
            .count();
        if holders > 0 {
            return Err(AppError::conflict(format!(
                "role {} is still held by {} subject(s)",
                role.name, holders
            )));
        }

        let children: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM roles WHERE parent_id = ?")
            .bind(role_id.to_string())
            .fetch_one(&mut *tx)
            .await?;
        if children > 0 {
            return Err(AppError::conflict(format!("role {} still has child roles", role.name)));
        }

        for sql in [
            "DELETE FROM role_assignments WHERE role_id = ?",
            "DELETE FROM role_permissions WHERE role_id = ?",
            "DELETE FROM roles WHERE id = ?",
        ] {
            sqlx::query(sql).bind(role_id.to_string()).execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(role)
    }

    /// Effective assignments of the role, users and groups alike.
    pub async fn role_holders(&self, role_id: Uuid) -> AppResult<Vec<RoleAssignment>> {
        let mut conn = self.pool.acquire().await?;
        let now = Utc::now();
        Ok(fetch_assignments_for_role(&mut conn, role_id)
            .await?
            .into_iter()
            .filter(|a| a.is_effective(now))
            .collect())
    }

    // -------------------------------------------------------------------------
    // Permissions
    // -------------------------------------------------------------------------

    pub async fn list_permissions(&self) -> AppResult<Vec<Permission>> {
        let sql = format!("SELECT {PERMISSION_COLUMNS} FROM permissions p ORDER BY p.resource_type, p.action, p.name");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(permission_from_row).collect()
    }

    pub async fn get_permission(&self, permission_id: Uuid) -> AppResult<Permission> {
        let sql = format!("SELECT {PERMISSION_COLUMNS} FROM permissions p WHERE p.id = ?");
        let row = sqlx::query(&sql)
            .bind(permission_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::not_found(format!("permission {permission_id} not found")))?;
        permission_from_row(&row)
    }

    pub async fn create_permission(&self, req: PermissionCreateRequest) -> AppResult<Permission> {
        validate_segment(&req.resource_type, "resource_type")?;
        validate_segment(&req.action, "action")?;

        let mut permission = Permission::new(req.resource_type.trim(), req.action.trim(), req.effect);
        permission.name = match req.name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ if req.effect == Effect::Deny => format!("{}.deny", permission.name),
            _ => permission.name,
        };
        permission.conditions = normalize_conditions(req.conditions)?;

        sqlx::query(
            "INSERT INTO permissions (id, name, resource_type, action, effect, conditions, is_active, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(permission.id.to_string())
        .bind(&permission.name)
        .bind(&permission.resource_type)
        .bind(&permission.action)
        .bind(permission.effect.as_str())
        .bind(&permission.conditions)
        .bind(permission.is_active)
        .bind(permission.created_at)
        .bind(permission.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| write_error(e, "permission"))?;

        Ok(permission)
    }

    pub async fn update_permission(
        &self,
        permission_id: Uuid,
        req: PermissionUpdateRequest,
    ) -> AppResult<(Permission, Permission)> {
        let old = self.get_permission(permission_id).await?;
        let mut permission = old.clone();

        if let Some(name) = req.name {
            if name.trim().is_empty() {
                return Err(AppError::bad_request("permission name must not be empty"));
            }
            permission.name = name.trim().to_string();
        }
        if let Some(effect) = req.effect {
            permission.effect = effect;
        }
        if req.clear_conditions {
            permission.conditions = None;
        } else if req.conditions.is_some() {
            permission.conditions = normalize_conditions(req.conditions)?;
        }
        if let Some(is_active) = req.is_active {
            permission.is_active = is_active;
        }
        permission.updated_at = Utc::now();

        sqlx::query(
            "UPDATE permissions SET name = ?, effect = ?, conditions = ?, is_active = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&permission.name)
        .bind(permission.effect.as_str())
        .bind(&permission.conditions)
        .bind(permission.is_active)
        .bind(permission.updated_at)
        .bind(permission_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| write_error(e, "permission"))?;

        Ok((old, permission))
    }

    /// Returns the deleted permission and the roles that carried it.
    pub async fn delete_permission(&self, permission_id: Uuid) -> AppResult<(Permission, Vec<Uuid>)> {
        let permission = self.get_permission(permission_id).await?;
        let role_ids = self.roles_with_permission(permission_id).await?;

        let mut tx = self.pool.begin().await?;
        for sql in [
            "DELETE FROM role_permissions WHERE permission_id = ?",
            "DELETE FROM permissions WHERE id = ?",
        ] {
            sqlx::query(sql).bind(permission_id.to_string()).execute(&mut *tx).await?;
        }
        tx.commit().await?;

        Ok((permission, role_ids))
    }

    pub async fn roles_with_permission(&self, permission_id: Uuid) -> AppResult<Vec<Uuid>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT role_id FROM role_permissions WHERE permission_id = ? ORDER BY role_id",
        )
        .bind(permission_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        ids.iter()
            .map(|id| Uuid::parse_str(id).map_err(|e| AppError::internal(format!("invalid role id {id}: {e}"))))
            .collect()
    }

    /// All permissions attached to a role, including inactive ones.
    pub async fn list_role_permissions(&self, role_id: Uuid) -> AppResult<Vec<Permission>> {
        let sql = format!(
            r#"
            SELECT {PERMISSION_COLUMNS}
            FROM permissions p
            INNER JOIN role_permissions rp ON p.id = rp.permission_id
            WHERE rp.role_id = ?
            ORDER BY p.resource_type, p.action
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(role_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(permission_from_row).collect()
    }

    pub async fn assign_permission_to_role(&self, role_id: Uuid, permission_id: Uuid) -> AppResult<RolePermission> {
        let mut conn = self.pool.acquire().await?;
        fetch_role(&mut conn, role_id).await?;
        drop(conn);
        self.get_permission(permission_id).await?;

        let assignment = RolePermission {
            role_id,
            permission_id,
            created_at: Utc::now(),
        };

        sqlx::query("INSERT OR IGNORE INTO role_permissions (role_id, permission_id, created_at) VALUES (?, ?, ?)")
            .bind(role_id.to_string())
            .bind(permission_id.to_string())
            .bind(assignment.created_at)
            .execute(&self.pool)
            .await?;

        Ok(assignment)
    }

    pub async fn revoke_permission_from_role(&self, role_id: Uuid, permission_id: Uuid) -> AppResult<RolePermission> {
        let result = sqlx::query("DELETE FROM role_permissions WHERE role_id = ? AND permission_id = ?")
            .bind(role_id.to_string())
            .bind(permission_id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found("permission is not assigned to role"));
        }

        Ok(RolePermission {
            role_id,
            permission_id,
            created_at: Utc::now(),
        })
    }

    // -------------------------------------------------------------------------
    // Role assignments
    // -------------------------------------------------------------------------

    pub async fn list_assignments(&self, kind: SubjectKind, subject_id: Uuid) -> AppResult<Vec<RoleAssignment>> {
        let sql = format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM role_assignments ra \
             WHERE ra.subject_kind = ? AND ra.subject_id = ? ORDER BY ra.created_at"
        );
        let rows = sqlx::query(&sql)
            .bind(kind.as_str())
            .bind(subject_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(assignment_from_row).collect()
    }

    /// Grant a role to a user or group. Re-granting reactivates the assignment.
    pub async fn assign_role(
        &self,
        kind: SubjectKind,
        subject_id: Uuid,
        req: AssignRoleRequest,
        granted_by: Option<Uuid>,
    ) -> AppResult<RoleAssignment> {
        let mut conn = self.pool.acquire().await?;
        let role = fetch_role(&mut conn, req.role_id).await?;
        drop(conn);
        if kind == SubjectKind::Group {
            self.get_group(subject_id).await?;
        }

        let resource_id = req
            .resource_id
            .map(|r| r.trim().to_string())
            .unwrap_or_else(|| WILDCARD_RESOURCE.to_string());
        validate_segment(&resource_id, "resource_id")?;

        let mut assignment = match kind {
            SubjectKind::User => RoleAssignment::for_user(subject_id, role.id),
            SubjectKind::Group => RoleAssignment::for_group(subject_id, role.id),
        }
        .scoped_to(resource_id);
        assignment.expires_at = req.expires_at;
        assignment.granted_by = granted_by;

        sqlx::query(
            r#"
            INSERT INTO role_assignments (id, subject_kind, subject_id, role_id, resource_id, expires_at, is_active, granted_by, created_at)
            VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)
            ON CONFLICT (subject_kind, subject_id, role_id, resource_id)
            DO UPDATE SET is_active = 1, expires_at = excluded.expires_at, granted_by = excluded.granted_by
            "#,
        )
        .bind(assignment.id.to_string())
        .bind(kind.as_str())
        .bind(subject_id.to_string())
        .bind(role.id.to_string())
        .bind(&assignment.resource_id)
        .bind(assignment.expires_at)
        .bind(granted_by.map(|id| id.to_string()))
        .bind(assignment.created_at)
        .execute(&self.pool)
        .await?;

        let sql = format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM role_assignments ra \
             WHERE ra.subject_kind = ? AND ra.subject_id = ? AND ra.role_id = ? AND ra.resource_id = ?"
        );
        let row = sqlx::query(&sql)
            .bind(kind.as_str())
            .bind(subject_id.to_string())
            .bind(role.id.to_string())
            .bind(&assignment.resource_id)
            .fetch_one(&self.pool)
            .await?;
        assignment_from_row(&row)
    }

    /// Remove every assignment of `role_id` to the subject, whatever its scope.
    pub async fn revoke_role(&self, kind: SubjectKind, subject_id: Uuid, role_id: Uuid) -> AppResult<Vec<RoleAssignment>> {
        let removed: Vec<RoleAssignment> = self
            .list_assignments(kind, subject_id)
            .await?
            .into_iter()
            .filter(|a| a.role_id == role_id)
            .collect();
        if removed.is_empty() {
            return Err(AppError::not_found("role is not assigned to subject"));
        }

        sqlx::query("DELETE FROM role_assignments WHERE subject_kind = ? AND subject_id = ? AND role_id = ?")
            .bind(kind.as_str())
            .bind(subject_id.to_string())
            .bind(role_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(removed)
    }

    // -------------------------------------------------------------------------
    // Groups
    // -------------------------------------------------------------------------

    pub async fn list_groups(&self) -> AppResult<Vec<Group>> {
        let sql = format!("SELECT {GROUP_COLUMNS} FROM user_groups g ORDER BY g.name");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(group_from_row).collect()
    }

    pub async fn get_group(&self, group_id: Uuid) -> AppResult<Group> {
        let sql = format!("SELECT {GROUP_COLUMNS} FROM user_groups g WHERE g.id = ?");
        let row = sqlx::query(&sql)
            .bind(group_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(gateway_error)?
            .ok_or_else(|| AppError::not_found(format!("group {group_id} not found")))?;
        group_from_row(&row)
    }

    pub async fn create_group(&self, req: GroupCreateRequest) -> AppResult<Group> {
        if req.name.trim().is_empty() {
            return Err(AppError::bad_request("group name must not be empty"));
        }
        let mut group = Group::new(req.name.trim());
        group.description = req.description;

        sqlx::query("INSERT INTO user_groups (id, name, description, created_at, updated_at) VALUES (?, ?, ?, ?, ?)")
            .bind(group.id.to_string())
            .bind(&group.name)
            .bind(&group.description)
            .bind(group.created_at)
            .bind(group.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| write_error(e, "group"))?;

        Ok(group)
    }

    /// Deletes the group with its memberships and role assignments.
    /// Returns the group and its former members.
    pub async fn delete_group(&self, group_id: Uuid) -> AppResult<(Group, Vec<Uuid>)> {
        let group = self.get_group(group_id).await?;
        let members: Vec<Uuid> = self
            .list_group_members(group_id)
            .await?
            .into_iter()
            .map(|m| m.user_id)
            .collect();

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM role_assignments WHERE subject_kind = 'group' AND subject_id = ?")
            .bind(group_id.to_string())
            .execute(&mut *tx)
            .await?;
        for sql in [
            "DELETE FROM group_members WHERE group_id = ?",
            "DELETE FROM user_groups WHERE id = ?",
        ] {
            sqlx::query(sql).bind(group_id.to_string()).execute(&mut *tx).await?;
        }
        tx.commit().await?;

        Ok((group, members))
    }

    pub async fn list_group_members(&self, group_id: Uuid) -> AppResult<Vec<GroupMember>> {
        let rows = sqlx::query(
            "SELECT group_id, user_id, created_at FROM group_members WHERE group_id = ? ORDER BY created_at",
        )
        .bind(group_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let user_id: String = row.try_get("user_id")?;
                let created_at: String = row.try_get("created_at")?;
                Ok(GroupMember {
                    group_id,
                    user_id: Uuid::parse_str(&user_id)
                        .map_err(|e| AppError::internal(format!("invalid user id {user_id}: {e}")))?,
                    created_at: crate::db::row_parsers::parse_datetime(&created_at)?,
                })
            })
            .collect()
    }

    pub async fn add_group_member(&self, group_id: Uuid, user_id: Uuid) -> AppResult<GroupMember> {
        self.get_group(group_id).await?;
        let member = GroupMember {
            group_id,
            user_id,
            created_at: Utc::now(),
        };

        sqlx::query("INSERT OR IGNORE INTO group_members (group_id, user_id, created_at) VALUES (?, ?, ?)")
            .bind(group_id.to_string())
            .bind(user_id.to_string())
            .bind(member.created_at)
            .execute(&self.pool)
            .await?;

        Ok(member)
    }

    pub async fn remove_group_member(&self, group_id: Uuid, user_id: Uuid) -> AppResult<GroupMember> {
        let result = sqlx::query("DELETE FROM group_members WHERE group_id = ? AND user_id = ?")
            .bind(group_id.to_string())
            .bind(user_id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found("user is not a member of the group"));
        }

        Ok(GroupMember {
            group_id,
            user_id,
            created_at: Utc::now(),
        })
    }
}

#[async_trait]
impl StorageGateway for SqliteStorage {
    async fn get_role_by_id(&self, role_id: Uuid) -> AppResult<Role> {
        let mut conn = self.pool.acquire().await.map_err(gateway_error)?;
        fetch_role(&mut conn, role_id).await
    }

    async fn get_roles_by_user_id(&self, user_id: Uuid) -> AppResult<Vec<RoleGrant>> {
        self.grants_for(SubjectKind::User, user_id).await
    }

    async fn get_roles_by_group_id(&self, group_id: Uuid) -> AppResult<Vec<RoleGrant>> {
        self.get_group(group_id).await?;
        self.grants_for(SubjectKind::Group, group_id).await
    }

    async fn get_role_hierarchy(&self, role_id: Uuid) -> AppResult<Vec<Role>> {
        let mut conn = self.pool.acquire().await.map_err(gateway_error)?;
        fetch_role(&mut conn, role_id).await?;
        fetch_ancestors(&mut conn, role_id).await
    }

    async fn get_permissions_by_role_id(&self, role_id: Uuid) -> AppResult<Vec<Permission>> {
        let sql = format!(
            r#"
            SELECT {PERMISSION_COLUMNS}
            FROM permissions p
            INNER JOIN role_permissions rp ON p.id = rp.permission_id
            WHERE rp.role_id = ? AND p.is_active = 1
            ORDER BY p.resource_type, p.action, p.id
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(role_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(gateway_error)?;
        rows.iter().map(permission_from_row).collect()
    }

    async fn get_user_groups(&self, user_id: Uuid) -> AppResult<Vec<Group>> {
        let sql = format!(
            r#"
            SELECT {GROUP_COLUMNS}
            FROM user_groups g
            INNER JOIN group_members gm ON gm.group_id = g.id
            WHERE gm.user_id = ?
            ORDER BY g.id
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(user_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(gateway_error)?;
        rows.iter().map(group_from_row).collect()
    }
}
