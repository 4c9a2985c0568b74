use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::StorageGateway;
use crate::errors::{AppError, AppResult};
use crate::models::rbac::{Group, Permission, Role, RoleAssignment, RoleGrant};

#[derive(Debug, Default)]
struct MemoryState {
    roles: HashMap<Uuid, Role>,
    permissions: HashMap<Uuid, Permission>,
    role_permissions: HashMap<Uuid, Vec<Uuid>>,
    groups: HashMap<Uuid, Group>,
    memberships: HashMap<Uuid, HashSet<Uuid>>,
    assignments: Vec<RoleAssignment>,
    outage: bool,
    faults: HashSet<Uuid>,
    missing: HashSet<Uuid>,
}

impl MemoryState {
    fn check(&self, id: Uuid) -> AppResult<()> {
        if self.outage || self.faults.contains(&id) {
            return Err(AppError::storage_unavailable(format!("lookup for {id} failed")));
        }
        if self.missing.contains(&id) {
            return Err(AppError::not_found(format!("{id} not found")));
        }
        Ok(())
    }

    fn grants_for(&self, subject_id: Uuid) -> Vec<RoleGrant> {
        let now = Utc::now();
        self.assignments
            .iter()
            .filter(|a| a.subject_id == subject_id && a.is_effective(now))
            .filter_map(|a| {
                self.roles.get(&a.role_id).map(|role| RoleGrant {
                    role: role.clone(),
                    resource_id: a.resource_id.clone(),
                    expires_at: a.expires_at,
                })
            })
            .collect()
    }
}

/// In-process storage gateway, for tests and embedded use.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: RwLock<MemoryState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_role(&self, role: Role) -> Role {
        self.state.write().await.roles.insert(role.id, role.clone());
        role
    }

    /// Create `permission` and attach it to `role_id`.
    pub async fn add_permission(&self, role_id: Uuid, permission: Permission) -> Permission {
        let mut state = self.state.write().await;
        state.permissions.insert(permission.id, permission.clone());
        state.role_permissions.entry(role_id).or_default().push(permission.id);
        permission
    }

    pub async fn add_group(&self, group: Group) -> Group {
        self.state.write().await.groups.insert(group.id, group.clone());
        group
    }

    pub async fn add_group_member(&self, group_id: Uuid, user_id: Uuid) {
        self.state
            .write()
            .await
            .memberships
            .entry(user_id)
            .or_default()
            .insert(group_id);
    }

    pub async fn remove_group_member(&self, group_id: Uuid, user_id: Uuid) {
        if let Some(groups) = self.state.write().await.memberships.get_mut(&user_id) {
            groups.remove(&group_id);
        }
    }

    pub async fn assign(&self, assignment: RoleAssignment) {
        self.state.write().await.assignments.push(assignment);
    }

    pub async fn unassign(&self, subject_id: Uuid, role_id: Uuid) {
        self.state
            .write()
            .await
            .assignments
            .retain(|a| !(a.subject_id == subject_id && a.role_id == role_id));
    }

    /// Make every lookup fail as if the backend were down.
    pub async fn set_outage(&self, outage: bool) {
        self.state.write().await.outage = outage;
    }

    /// Make lookups keyed by `id` (a role or group) fail.
    pub async fn inject_fault(&self, id: Uuid) {
        self.state.write().await.faults.insert(id);
    }

    /// Make lookups keyed by `id` report not found, as for a dangling edge.
    pub async fn inject_missing(&self, id: Uuid) {
        self.state.write().await.missing.insert(id);
    }
}

#[async_trait]
impl StorageGateway for MemoryStorage {
    async fn get_role_by_id(&self, role_id: Uuid) -> AppResult<Role> {
        let state = self.state.read().await;
        state.check(role_id)?;
        state
            .roles
            .get(&role_id)
            .cloned()
            .ok_or_else(|| AppError::not_found(format!("role {role_id} not found")))
    }

    async fn get_roles_by_user_id(&self, user_id: Uuid) -> AppResult<Vec<RoleGrant>> {
        let state = self.state.read().await;
        state.check(user_id)?;
        Ok(state.grants_for(user_id))
    }

    async fn get_roles_by_group_id(&self, group_id: Uuid) -> AppResult<Vec<RoleGrant>> {
        let state = self.state.read().await;
        state.check(group_id)?;
        if !state.groups.contains_key(&group_id) {
            return Err(AppError::not_found(format!("group {group_id} not found")));
        }
        Ok(state.grants_for(group_id))
    }

    async fn get_role_hierarchy(&self, role_id: Uuid) -> AppResult<Vec<Role>> {
        let state = self.state.read().await;
        state.check(role_id)?;
        let role = state
            .roles
            .get(&role_id)
            .ok_or_else(|| AppError::not_found(format!("role {role_id} not found")))?;

        let mut chain = Vec::new();
        let mut seen = HashSet::from([role_id]);
        let mut next = role.parent_id;
        while let Some(parent_id) = next {
            if !seen.insert(parent_id) {
                break;
            }
            match state.roles.get(&parent_id) {
                Some(parent) => {
                    next = parent.parent_id;
                    chain.push(parent.clone());
                }
                None => break,
            }
        }
        Ok(chain)
    }

    async fn get_permissions_by_role_id(&self, role_id: Uuid) -> AppResult<Vec<Permission>> {
        let state = self.state.read().await;
        state.check(role_id)?;
        Ok(state
            .role_permissions
            .get(&role_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.permissions.get(id))
                    .filter(|p| p.is_active)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_user_groups(&self, user_id: Uuid) -> AppResult<Vec<Group>> {
        let state = self.state.read().await;
        state.check(user_id)?;
        let mut groups: Vec<Group> = state
            .memberships
            .get(&user_id)
            .map(|ids| ids.iter().filter_map(|id| state.groups.get(id)).cloned().collect())
            .unwrap_or_default();
        groups.sort_by_key(|g| g.id);
        Ok(groups)
    }
}
