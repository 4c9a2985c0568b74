//! Read contract the authorization engine needs from persistence.
//!
//! All lookups may fail with [`AppError::NotFound`](crate::errors::AppError::NotFound),
//! which the resolver treats as a missing edge rather than an outage.

use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::AppResult;
use crate::models::rbac::{Group, Permission, Role, RoleGrant};

mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

#[async_trait]
pub trait StorageGateway: Send + Sync {
    async fn get_role_by_id(&self, role_id: Uuid) -> AppResult<Role>;

    /// Roles held through active, unexpired direct assignments.
    async fn get_roles_by_user_id(&self, user_id: Uuid) -> AppResult<Vec<RoleGrant>>;

    /// Roles held through active, unexpired group assignments.
    async fn get_roles_by_group_id(&self, group_id: Uuid) -> AppResult<Vec<RoleGrant>>;

    /// Ancestor chain of a role, nearest parent first. Excludes the role itself.
    async fn get_role_hierarchy(&self, role_id: Uuid) -> AppResult<Vec<Role>>;

    /// Active permissions attached to the role.
    async fn get_permissions_by_role_id(&self, role_id: Uuid) -> AppResult<Vec<Permission>>;

    async fn get_user_groups(&self, user_id: Uuid) -> AppResult<Vec<Group>>;
}
