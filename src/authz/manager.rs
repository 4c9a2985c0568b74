use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use super::condition::{Attributes, ConditionEvaluator};
use super::resolver::PermissionResolver;
use super::{permission_key, wildcard_key};
use crate::cache::PermissionCache;
use crate::errors::{AppError, AppResult};
use crate::models::rbac::{Effect, PermissionDecision, UserPermissionMatrix, WILDCARD_RESOURCE};

pub const NO_EXPLICIT_GRANT: &str = "no explicit grant";
pub const CONDITION_NOT_SATISFIED: &str = "condition not satisfied";

/// Attributes for condition evaluation, installed as a request extension by
/// an upstream layer.
#[derive(Debug, Clone, Default)]
pub struct RequestAttributes(pub Attributes);

/// Why a check ended the way it did, without exposing the matrix itself.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct EvaluationTrace {
    pub user_id: Uuid,
    pub direct_roles: Vec<Uuid>,
    pub inherited_roles: Vec<Uuid>,
    pub group_roles: Vec<Uuid>,
    pub cache_hit: bool,
    /// Keys tried, in order
    pub keys_tried: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_key: Option<String>,
    pub effect: Effect,
    pub reason: String,
}

impl fmt::Display for EvaluationTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "user={} direct={} inherited={} group={} cache_hit={} tried=[{}] matched={} effect={} reason={}",
            self.user_id,
            self.direct_roles.len(),
            self.inherited_roles.len(),
            self.group_roles.len(),
            self.cache_hit,
            self.keys_tried.join(", "),
            self.matched_key.as_deref().unwrap_or("-"),
            self.effect,
            self.reason,
        )
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AuthorizationResult {
    pub allowed: bool,
    pub decision: PermissionDecision,
    pub trace: EvaluationTrace,
}

/// Facade for request handlers: cache lookup, resolver fallback, condition
/// evaluation, decision.
#[derive(Clone)]
pub struct AuthorizationManager {
    resolver: PermissionResolver,
    cache: Arc<dyn PermissionCache>,
    conditions: ConditionEvaluator,
    ttl: Duration,
}

impl AuthorizationManager {
    pub fn new(resolver: PermissionResolver, cache: Arc<dyn PermissionCache>, ttl: Duration) -> Self {
        Self {
            resolver,
            cache,
            conditions: ConditionEvaluator::new(),
            ttl,
        }
    }

    pub fn cache(&self) -> &Arc<dyn PermissionCache> {
        &self.cache
    }

    pub async fn check_permission(
        &self,
        user_id: Uuid,
        resource_type: &str,
        resource_id: &str,
        action: &str,
        attributes: Option<&Attributes>,
    ) -> AppResult<AuthorizationResult> {
        if resource_type.trim().is_empty() || action.trim().is_empty() {
            return Err(AppError::bad_request("resource_type and action are required"));
        }
        let resource_id = match resource_id.trim() {
            "" => WILDCARD_RESOURCE,
            id => id,
        };

        let (matrix, cache_hit) = self.load_matrix(user_id).await?;

        let exact = permission_key(resource_type, resource_id, action);
        let mut keys_tried = vec![exact.clone()];
        let mut matched_key = None;

        let mut decision = match matrix.final_permissions.get(&exact) {
            Some(found) => {
                matched_key = Some(exact.clone());
                found.clone()
            }
            None => PermissionDecision {
                resource_type: resource_type.to_string(),
                resource_id: resource_id.to_string(),
                action: action.to_string(),
                effect: Effect::Deny,
                source: "default".to_string(),
                reason: NO_EXPLICIT_GRANT.to_string(),
                condition: None,
            },
        };

        if resource_id != WILDCARD_RESOURCE {
            let wildcard = wildcard_key(resource_type, action);
            keys_tried.push(wildcard.clone());
            if let Some(found) = matrix.final_permissions.get(&wildcard) {
                // a wildcard deny still beats a resource-specific allow
                let overrides = matched_key.is_none() || (decision.effect.is_allow() && !found.effect.is_allow());
                if overrides {
                    decision = PermissionDecision {
                        resource_id: resource_id.to_string(),
                        ..found.clone()
                    };
                    matched_key = Some(wildcard);
                }
            }
        }

        if let Some(condition) = decision.condition.clone() {
            let empty = Attributes::new();
            match self.conditions.evaluate(Some(&condition), attributes.unwrap_or(&empty)) {
                Ok(true) => {}
                Ok(false) => {
                    decision.effect = Effect::Deny;
                    decision.reason = CONDITION_NOT_SATISFIED.to_string();
                }
                Err(err) => {
                    tracing::warn!(user_id = %user_id, error = %err, "condition evaluation failed");
                    decision.effect = Effect::Deny;
                    decision.reason = format!("condition evaluation failed: {err}");
                }
            }
        }

        let allowed = decision.effect.is_allow();
        let trace = EvaluationTrace {
            user_id,
            direct_roles: matrix.direct_roles.clone(),
            inherited_roles: matrix.inherited_roles.clone(),
            group_roles: matrix.group_roles.clone(),
            cache_hit,
            keys_tried,
            matched_key,
            effect: decision.effect,
            reason: decision.reason.clone(),
        };

        tracing::debug!(
            user_id = %user_id,
            permission_key = %exact,
            allowed,
            trace = %trace,
            "authorization check"
        );

        Ok(AuthorizationResult {
            allowed,
            decision,
            trace,
        })
    }

    /// Cached matrix, computing and storing it on a miss.
    pub async fn get_user_matrix(&self, user_id: Uuid) -> AppResult<UserPermissionMatrix> {
        Ok(self.load_matrix(user_id).await?.0)
    }

    /// Recompute bypassing the cache, then store the fresh matrix.
    pub async fn refresh_user_matrix(&self, user_id: Uuid) -> AppResult<UserPermissionMatrix> {
        self.compute_and_store(user_id).await
    }

    pub async fn has_any_role(&self, user_id: Uuid, role_names: &[String]) -> AppResult<bool> {
        let matrix = self.get_user_matrix(user_id).await?;
        Ok(role_names.iter().any(|name| matrix.holds_role_named(name)))
    }

    pub async fn invalidate_user(&self, user_id: Uuid) -> AppResult<()> {
        self.cache.invalidate_user(user_id).await.map_err(|err| {
            tracing::error!(user_id = %user_id, error = %err, "user cache invalidation failed");
            err
        })?;
        tracing::info!(user_id = %user_id, "user permissions invalidated");
        Ok(())
    }

    /// Returns how many cached users were dropped.
    pub async fn invalidate_role(&self, role_id: Uuid) -> AppResult<usize> {
        let users = self.cache.invalidate_role(role_id).await.map_err(|err| {
            tracing::error!(role_id = %role_id, error = %err, "role cache invalidation failed");
            err
        })?;
        tracing::info!(role_id = %role_id, users = users.len(), "role holders invalidated");
        Ok(users.len())
    }

    pub async fn invalidate_group(&self, group_id: Uuid) -> AppResult<usize> {
        let users = self.cache.invalidate_group(group_id).await.map_err(|err| {
            tracing::error!(group_id = %group_id, error = %err, "group cache invalidation failed");
            err
        })?;
        tracing::info!(group_id = %group_id, users = users.len(), "group members invalidated");
        Ok(users.len())
    }

    async fn load_matrix(&self, user_id: Uuid) -> AppResult<(UserPermissionMatrix, bool)> {
        match self.cache.get(user_id).await {
            Ok(Some(matrix)) => return Ok((matrix, true)),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(user_id = %user_id, error = %err, "cache read failed, recomputing");
            }
        }

        Ok((self.compute_and_store(user_id).await?, false))
    }

    /// The generation is read before storage, so an invalidation that lands
    /// while the matrix is computed keeps it out of the cache.
    async fn compute_and_store(&self, user_id: Uuid) -> AppResult<UserPermissionMatrix> {
        let generation = match self.cache.generation().await {
            Ok(generation) => Some(generation),
            Err(err) => {
                tracing::warn!(user_id = %user_id, error = %err, "cache generation unavailable, continuing uncached");
                None
            }
        };

        let matrix = self.resolver.compute_user_permission_matrix(user_id).await?;

        let ttl = matrix.cache_ttl(self.ttl, Utc::now());
        let Some(generation) = generation.filter(|_| !ttl.is_zero()) else {
            return Ok(matrix);
        };
        match self.cache.set_if_current(user_id, &matrix, ttl, generation).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(user_id = %user_id, "invalidated while computing, matrix not cached");
            }
            Err(err) => {
                tracing::warn!(user_id = %user_id, error = %err, "cache write failed, continuing uncached");
            }
        }
        Ok(matrix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryPermissionCache;
    use crate::models::rbac::{Group, Permission, Role, RoleAssignment};
    use crate::storage::{MemoryStorage, StorageGateway};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::{Notify, Semaphore};

    const TTL: Duration = Duration::from_secs(1800);

    fn manager_over(storage: Arc<MemoryStorage>, cache: Arc<dyn PermissionCache>) -> AuthorizationManager {
        AuthorizationManager::new(PermissionResolver::new(storage), cache, TTL)
    }

    fn memory_cache() -> Arc<dyn PermissionCache> {
        Arc::new(MemoryPermissionCache::new(TTL * 2))
    }

    /// Every operation fails, as if the backend were unreachable.
    struct BrokenCache;

    #[async_trait]
    impl PermissionCache for BrokenCache {
        fn backend(&self) -> &'static str {
            "broken"
        }
        async fn get(&self, _: Uuid) -> AppResult<Option<UserPermissionMatrix>> {
            Err(AppError::cache("down"))
        }
        async fn set(&self, _: Uuid, _: &UserPermissionMatrix, _: Duration) -> AppResult<()> {
            Err(AppError::cache("down"))
        }
        async fn generation(&self) -> AppResult<u64> {
            Err(AppError::cache("down"))
        }
        async fn set_if_current(&self, _: Uuid, _: &UserPermissionMatrix, _: Duration, _: u64) -> AppResult<bool> {
            Err(AppError::cache("down"))
        }
        async fn invalidate_user(&self, _: Uuid) -> AppResult<()> {
            Err(AppError::cache("down"))
        }
        async fn invalidate_role(&self, _: Uuid) -> AppResult<Vec<Uuid>> {
            Err(AppError::cache("down"))
        }
        async fn invalidate_group(&self, _: Uuid) -> AppResult<Vec<Uuid>> {
            Err(AppError::cache("down"))
        }
        async fn health(&self) -> AppResult<()> {
            Err(AppError::cache("down"))
        }
    }

    /// Pauses the next permission lookup until released.
    struct GatedStorage {
        inner: Arc<MemoryStorage>,
        armed: AtomicBool,
        reached: Notify,
        release: Semaphore,
    }

    impl GatedStorage {
        fn new(inner: Arc<MemoryStorage>) -> Self {
            Self {
                inner,
                armed: AtomicBool::new(false),
                reached: Notify::new(),
                release: Semaphore::new(0),
            }
        }
    }

    #[async_trait]
    impl StorageGateway for GatedStorage {
        async fn get_role_by_id(&self, role_id: Uuid) -> AppResult<Role> {
            self.inner.get_role_by_id(role_id).await
        }
        async fn get_roles_by_user_id(&self, user_id: Uuid) -> AppResult<Vec<crate::models::rbac::RoleGrant>> {
            self.inner.get_roles_by_user_id(user_id).await
        }
        async fn get_roles_by_group_id(&self, group_id: Uuid) -> AppResult<Vec<crate::models::rbac::RoleGrant>> {
            self.inner.get_roles_by_group_id(group_id).await
        }
        async fn get_role_hierarchy(&self, role_id: Uuid) -> AppResult<Vec<Role>> {
            self.inner.get_role_hierarchy(role_id).await
        }
        async fn get_permissions_by_role_id(&self, role_id: Uuid) -> AppResult<Vec<Permission>> {
            let permissions = self.inner.get_permissions_by_role_id(role_id).await;
            if self.armed.swap(false, Ordering::SeqCst) {
                self.reached.notify_one();
                self.release.acquire().await.unwrap().forget();
            }
            permissions
        }
        async fn get_user_groups(&self, user_id: Uuid) -> AppResult<Vec<Group>> {
            self.inner.get_user_groups(user_id).await
        }
    }

    #[tokio::test]
    async fn test_deny_from_group_wins() {
        let storage = Arc::new(MemoryStorage::new());
        let user = Uuid::new_v4();
        let viewer = storage.add_role(Role::new("viewer")).await;
        storage.add_permission(viewer.id, Permission::allow("doc", "read")).await;
        let auditor = storage.add_role(Role::new("auditor")).await;
        storage.add_permission(auditor.id, Permission::deny("doc", "read")).await;
        let group = storage.add_group(Group::new("audit")).await;
        storage.add_group_member(group.id, user).await;
        storage.assign(RoleAssignment::for_user(user, viewer.id)).await;
        storage.assign(RoleAssignment::for_group(group.id, auditor.id)).await;

        let manager = manager_over(storage, memory_cache());
        let result = manager.check_permission(user, "doc", "doc-1", "read", None).await.unwrap();

        assert!(!result.allowed);
        assert_eq!(result.decision.resource_id, "doc-1");
        assert_eq!(result.trace.matched_key.as_deref(), Some("doc:*:read"));
    }

    #[tokio::test]
    async fn test_wildcard_grant_substitutes_resource_id() {
        let storage = Arc::new(MemoryStorage::new());
        let user = Uuid::new_v4();
        let viewer = storage.add_role(Role::new("viewer")).await;
        storage.add_permission(viewer.id, Permission::allow("doc", "read")).await;
        let editor = storage.add_role(Role::new("editor").with_parent(&viewer)).await;
        storage.add_permission(editor.id, Permission::allow("doc", "write")).await;
        storage.assign(RoleAssignment::for_user(user, editor.id)).await;

        let manager = manager_over(storage, memory_cache());
        let write = manager.check_permission(user, "doc", "doc-7", "write", None).await.unwrap();
        assert!(write.allowed);
        assert_eq!(write.decision.resource_id, "doc-7");

        let read = manager.check_permission(user, "doc", "doc-7", "read", None).await.unwrap();
        assert!(read.allowed);
        assert!(read.trace.cache_hit);
    }

    #[tokio::test]
    async fn test_failed_condition_forces_deny() {
        let storage = Arc::new(MemoryStorage::new());
        let user = Uuid::new_v4();
        let role = storage.add_role(Role::new("eng_reader")).await;
        storage
            .add_permission(
                role.id,
                Permission::allow("doc", "read").with_conditions(r#"{"department":"eng"}"#),
            )
            .await;
        storage.assign(RoleAssignment::for_user(user, role.id)).await;
        let manager = manager_over(storage, memory_cache());

        let sales: Attributes = [("department".to_string(), json!("sales"))].into_iter().collect();
        let denied = manager.check_permission(user, "doc", "doc-1", "read", Some(&sales)).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.decision.reason, CONDITION_NOT_SATISFIED);

        let missing = manager.check_permission(user, "doc", "doc-1", "read", None).await.unwrap();
        assert!(!missing.allowed);

        let eng: Attributes = [("department".to_string(), json!("eng"))].into_iter().collect();
        let allowed = manager.check_permission(user, "doc", "doc-1", "read", Some(&eng)).await.unwrap();
        assert!(allowed.allowed);
    }

    #[tokio::test]
    async fn test_malformed_condition_denies() {
        let storage = Arc::new(MemoryStorage::new());
        let user = Uuid::new_v4();
        let role = storage.add_role(Role::new("broken")).await;
        storage
            .add_permission(role.id, Permission::allow("doc", "read").with_conditions("{oops"))
            .await;
        storage.assign(RoleAssignment::for_user(user, role.id)).await;

        let result = manager_over(storage, memory_cache())
            .check_permission(user, "doc", "doc-1", "read", None)
            .await
            .unwrap();
        assert!(!result.allowed);
        assert!(result.decision.reason.starts_with("condition evaluation failed"));
    }

    #[tokio::test]
    async fn test_default_deny_without_grant() {
        let storage = Arc::new(MemoryStorage::new());
        let user = Uuid::new_v4();
        let result = manager_over(storage, memory_cache())
            .check_permission(user, "doc", "doc-1", "delete", None)
            .await
            .unwrap();

        assert!(!result.allowed);
        assert_eq!(result.decision.reason, NO_EXPLICIT_GRANT);
        assert_eq!(result.trace.keys_tried, vec!["doc:doc-1:delete", "doc:*:delete"]);
        assert!(result.trace.matched_key.is_none());
    }

    #[tokio::test]
    async fn test_wildcard_deny_beats_scoped_allow() {
        let storage = Arc::new(MemoryStorage::new());
        let user = Uuid::new_v4();
        let owner = storage.add_role(Role::new("owner")).await;
        storage.add_permission(owner.id, Permission::allow("doc", "delete")).await;
        let frozen = storage.add_role(Role::new("frozen")).await;
        storage.add_permission(frozen.id, Permission::deny("doc", "delete")).await;
        storage
            .assign(RoleAssignment::for_user(user, owner.id).scoped_to("doc-3"))
            .await;
        storage.assign(RoleAssignment::for_user(user, frozen.id)).await;

        let result = manager_over(storage, memory_cache())
            .check_permission(user, "doc", "doc-3", "delete", None)
            .await
            .unwrap();
        assert!(!result.allowed);
    }

    #[tokio::test]
    async fn test_cache_failures_are_tolerated_on_check() {
        let storage = Arc::new(MemoryStorage::new());
        let user = Uuid::new_v4();
        let viewer = storage.add_role(Role::new("viewer")).await;
        storage.add_permission(viewer.id, Permission::allow("doc", "read")).await;
        storage.assign(RoleAssignment::for_user(user, viewer.id)).await;

        let manager = manager_over(storage, Arc::new(BrokenCache));
        let result = manager.check_permission(user, "doc", "doc-1", "read", None).await.unwrap();
        assert!(result.allowed);
        assert!(!result.trace.cache_hit);

        let err = manager.invalidate_user(user).await.unwrap_err();
        assert!(matches!(err, AppError::Cache(_)));
        assert!(manager.invalidate_role(viewer.id).await.is_err());
    }

    #[tokio::test]
    async fn test_storage_outage_is_an_error_not_a_deny() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set_outage(true).await;

        let err = manager_over(storage, memory_cache())
            .check_permission(Uuid::new_v4(), "doc", "doc-1", "read", None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::StorageUnavailable(_)));
    }

    #[tokio::test]
    async fn test_invalidate_role_forces_recompute() {
        let storage = Arc::new(MemoryStorage::new());
        let user = Uuid::new_v4();
        let viewer = storage.add_role(Role::new("viewer")).await;
        storage.add_permission(viewer.id, Permission::allow("doc", "read")).await;
        storage.assign(RoleAssignment::for_user(user, viewer.id)).await;
        let manager = manager_over(storage.clone(), memory_cache());

        assert!(manager.check_permission(user, "doc", "d", "read", None).await.unwrap().allowed);
        storage.unassign(user, viewer.id).await;
        // stale until invalidated
        assert!(manager.check_permission(user, "doc", "d", "read", None).await.unwrap().allowed);

        assert_eq!(manager.invalidate_role(viewer.id).await.unwrap(), 1);
        assert!(!manager.check_permission(user, "doc", "d", "read", None).await.unwrap().allowed);
        assert!(!manager.has_any_role(user, &["viewer".to_string()]).await.unwrap());
    }

    #[tokio::test]
    async fn test_matrix_computed_across_an_invalidation_is_not_cached() {
        let storage = Arc::new(MemoryStorage::new());
        let user = Uuid::new_v4();
        let viewer = storage.add_role(Role::new("viewer")).await;
        storage.add_permission(viewer.id, Permission::allow("doc", "read")).await;
        storage.assign(RoleAssignment::for_user(user, viewer.id)).await;

        let gated = Arc::new(GatedStorage::new(storage.clone()));
        let manager = AuthorizationManager::new(PermissionResolver::new(gated.clone()), memory_cache(), TTL);

        gated.armed.store(true, Ordering::SeqCst);
        let in_flight = tokio::spawn({
            let manager = manager.clone();
            async move { manager.check_permission(user, "doc", "d", "read", None).await }
        });
        gated.reached.notified().await;

        // the revocation and its invalidation complete while the check is paused
        storage.unassign(user, viewer.id).await;
        manager.invalidate_role(viewer.id).await.unwrap();
        manager.invalidate_user(user).await.unwrap();
        gated.release.add_permits(1);

        let stale = in_flight.await.unwrap().unwrap();
        assert!(stale.allowed);

        let next = manager.check_permission(user, "doc", "d", "read", None).await.unwrap();
        assert!(!next.allowed);
        assert!(!next.trace.cache_hit);
    }

    #[tokio::test]
    async fn test_cached_matrix_does_not_outlive_assignment_expiry() {
        let storage = Arc::new(MemoryStorage::new());
        let user = Uuid::new_v4();
        let viewer = storage.add_role(Role::new("viewer")).await;
        storage.add_permission(viewer.id, Permission::allow("doc", "read")).await;
        let expires_at = Utc::now() + chrono::Duration::milliseconds(300);
        storage
            .assign(RoleAssignment::for_user(user, viewer.id).expiring_at(expires_at))
            .await;
        let manager = manager_over(storage, memory_cache());

        assert!(manager.check_permission(user, "doc", "d", "read", None).await.unwrap().allowed);
        assert!(manager.check_permission(user, "doc", "d", "read", None).await.unwrap().trace.cache_hit);

        tokio::time::sleep(Duration::from_millis(400)).await;
        let after = manager.check_permission(user, "doc", "d", "read", None).await.unwrap();
        assert!(!after.allowed);
        assert!(!after.trace.cache_hit);
    }
}
