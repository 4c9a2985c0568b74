use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::permission_key;
use crate::errors::AppResult;
use crate::models::rbac::{Effect, Permission, PermissionDecision, Role, RoleGrant, UserPermissionMatrix};
use crate::storage::StorageGateway;

/// One role reached by the user, with the resource scope of the assignment
/// that reached it.
#[derive(Debug, Clone)]
struct Contribution {
    role: Role,
    scope: String,
    expires_at: Option<DateTime<Utc>>,
    source: String,
}

/// Folds direct, group and inherited roles into one permission matrix.
#[derive(Clone)]
pub struct PermissionResolver {
    storage: Arc<dyn StorageGateway>,
}

impl PermissionResolver {
    pub fn new(storage: Arc<dyn StorageGateway>) -> Self {
        Self { storage }
    }

    pub async fn compute_user_permission_matrix(&self, user_id: Uuid) -> AppResult<UserPermissionMatrix> {
        let mut matrix = UserPermissionMatrix::empty(user_id);
        let mut contributions: Vec<Contribution> = Vec::new();

        // 1. direct roles
        let mut direct = match self.storage.get_roles_by_user_id(user_id).await {
            Ok(grants) => grants,
            Err(err) if err.is_not_found() => Vec::new(),
            Err(err) => {
                tracing::error!(user_id = %user_id, error = %err, "failed to load direct roles");
                return Err(err);
            }
        };
        sort_grants(&mut direct);
        for grant in direct {
            matrix.direct_roles.push(grant.role.id);
            contributions.push(Contribution {
                source: format!("direct:{}", grant.role.name),
                role: grant.role,
                scope: grant.resource_id,
                expires_at: grant.expires_at,
            });
        }

        // 2. group roles
        let mut groups = match self.storage.get_user_groups(user_id).await {
            Ok(groups) => groups,
            Err(err) if err.is_not_found() => Vec::new(),
            Err(err) => {
                tracing::error!(user_id = %user_id, error = %err, "failed to load user groups");
                return Err(err);
            }
        };
        groups.sort_by_key(|g| g.id);
        for group in groups {
            matrix.group_ids.push(group.id);
            let mut grants = match self.storage.get_roles_by_group_id(group.id).await {
                Ok(grants) => grants,
                Err(err) if err.is_not_found() => {
                    tracing::warn!(user_id = %user_id, group_id = %group.id, error = %err, "skipping missing group");
                    continue;
                }
                Err(err) => {
                    tracing::error!(user_id = %user_id, group_id = %group.id, error = %err, "failed to load group roles");
                    return Err(err);
                }
            };
            sort_grants(&mut grants);
            for grant in grants {
                matrix.group_roles.push(grant.role.id);
                contributions.push(Contribution {
                    source: format!("group:{}:{}", group.name, grant.role.name),
                    role: grant.role,
                    scope: grant.resource_id,
                    expires_at: grant.expires_at,
                });
            }
        }

        // 3. ancestors of every held role, carrying the holder's scope
        let held: Vec<(Uuid, String, Option<DateTime<Utc>>)> = contributions
            .iter()
            .map(|c| (c.role.id, c.scope.clone(), c.expires_at))
            .collect();
        let mut hierarchy_cache: HashMap<Uuid, Vec<Role>> = HashMap::new();
        for (role_id, scope, expires_at) in held {
            if !hierarchy_cache.contains_key(&role_id) {
                match self.storage.get_role_hierarchy(role_id).await {
                    Ok(chain) => {
                        hierarchy_cache.insert(role_id, chain);
                    }
                    Err(err) if err.is_not_found() => {
                        tracing::warn!(user_id = %user_id, role_id = %role_id, error = %err, "skipping missing role hierarchy");
                        continue;
                    }
                    Err(err) => {
                        tracing::error!(user_id = %user_id, role_id = %role_id, error = %err, "failed to load role hierarchy");
                        return Err(err);
                    }
                }
            }
            let chain = hierarchy_cache.get(&role_id).cloned().unwrap_or_default();
            for ancestor in chain {
                matrix.inherited_roles.push(ancestor.id);
                contributions.push(Contribution {
                    source: format!("inherited:{}", ancestor.name),
                    role: ancestor,
                    scope: scope.clone(),
                    expires_at,
                });
            }
        }

        for contribution in &contributions {
            matrix
                .role_names
                .insert(contribution.role.id, contribution.role.name.clone());
        }
        matrix.expires_at = contributions.iter().filter_map(|c| c.expires_at).min();

        // 4-5. fold permissions
        let mut seen: HashSet<(Uuid, String)> = HashSet::new();
        let mut permission_cache: HashMap<Uuid, Vec<Permission>> = HashMap::new();
        for contribution in contributions {
            if !seen.insert((contribution.role.id, contribution.scope.clone())) {
                continue;
            }
            if !contribution.role.is_active {
                tracing::debug!(role_id = %contribution.role.id, "skipping inactive role");
                continue;
            }

            let permissions = match permission_cache.get(&contribution.role.id) {
                Some(cached) => cached.clone(),
                None => match self.storage.get_permissions_by_role_id(contribution.role.id).await {
                    Ok(permissions) => {
                        permission_cache.insert(contribution.role.id, permissions.clone());
                        permissions
                    }
                    Err(err) if err.is_not_found() => {
                        tracing::warn!(
                            user_id = %user_id,
                            role_id = %contribution.role.id,
                            error = %err,
                            "skipping role permissions"
                        );
                        continue;
                    }
                    Err(err) => {
                        tracing::error!(user_id = %user_id, role_id = %contribution.role.id, error = %err, "failed to load role permissions");
                        return Err(err);
                    }
                },
            };

            for permission in permissions.iter().filter(|p| p.is_active) {
                fold(&mut matrix.final_permissions, decision_for(permission, &contribution));
            }
        }

        // 6. determinism
        for ids in [&mut matrix.direct_roles, &mut matrix.group_roles, &mut matrix.inherited_roles, &mut matrix.group_ids] {
            ids.sort();
            ids.dedup();
        }
        matrix.computed_at = Utc::now();

        tracing::debug!(
            user_id = %user_id,
            direct = matrix.direct_roles.len(),
            group = matrix.group_roles.len(),
            inherited = matrix.inherited_roles.len(),
            permissions = matrix.final_permissions.len(),
            "permission matrix computed"
        );

        Ok(matrix)
    }
}

fn sort_grants(grants: &mut [RoleGrant]) {
    grants.sort_by(|a, b| (a.role.id, &a.resource_id).cmp(&(b.role.id, &b.resource_id)));
}

fn decision_for(permission: &Permission, contribution: &Contribution) -> PermissionDecision {
    let verb = match permission.effect {
        Effect::Allow => "granted",
        Effect::Deny => "denied",
    };
    PermissionDecision {
        resource_type: permission.resource_type.clone(),
        resource_id: contribution.scope.clone(),
        action: permission.action.clone(),
        effect: permission.effect,
        source: contribution.source.clone(),
        reason: format!("{verb} by {} via {}", permission.name, contribution.source),
        condition: permission.conditions.clone(),
    }
}

/// Deny overwrites allow; nothing else overwrites an existing decision.
pub(crate) fn fold(map: &mut BTreeMap<String, PermissionDecision>, mut candidate: PermissionDecision) {
    let key = permission_key(&candidate.resource_type, &candidate.resource_id, &candidate.action);
    match map.get(&key) {
        None => {
            map.insert(key, candidate);
        }
        Some(existing) if existing.effect == Effect::Allow && candidate.effect == Effect::Deny => {
            candidate.reason = format!("{}; overridden by deny from {}", existing.reason, candidate.source);
            map.insert(key, candidate);
        }
        Some(_) => {}
    }
}
