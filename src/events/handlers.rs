//! Canonical handlers: cache invalidation, audit log, metrics and notifications.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use sqlx::SqlitePool;
use utoipa::ToSchema;
use uuid::Uuid;

use super::{AuthzEvent, EventBus, EventHandler, EventType};
use crate::authz::AuthorizationManager;
use crate::errors::{AppError, AppResult};

// =============================================================================
// CACHE INVALIDATION
// =============================================================================

/// Maps "what changed" to "what must be forgotten".
///
/// Reads `role_id`, `role_ids`, `user_id`, `group_id` and `scope` from the
/// event metadata, falling back to the event target id.
pub struct CacheInvalidationHandler {
    authz: AuthorizationManager,
}

impl CacheInvalidationHandler {
    pub fn new(authz: AuthorizationManager) -> Self {
        Self { authz }
    }

    fn target_uuid(event: &AuthzEvent, key: &str) -> AppResult<Uuid> {
        event
            .metadata_uuid(key)
            .or_else(|| event.target_id.as_deref().and_then(|id| Uuid::parse_str(id).ok()))
            .ok_or_else(|| AppError::bad_request(format!("{} event carries no {key}", event.event_type)))
    }
}

#[async_trait]
impl EventHandler for CacheInvalidationHandler {
    fn name(&self) -> &'static str {
        "cache_invalidation"
    }

    async fn handle(&self, event: &AuthzEvent) -> AppResult<()> {
        match event.event_type {
            EventType::RoleUpdated
            | EventType::RoleDeleted
            | EventType::RolePermissionAssigned
            | EventType::RolePermissionRevoked => {
                self.authz.invalidate_role(Self::target_uuid(event, "role_id")?).await?;
            }
            EventType::PermissionUpdated | EventType::PermissionDeleted => {
                for role_id in event.metadata_uuids("role_ids") {
                    self.authz.invalidate_role(role_id).await?;
                }
            }
            EventType::RoleAssigned
            | EventType::RoleRevoked
            | EventType::GroupMemberAdded
            | EventType::GroupMemberRemoved => {
                self.authz.invalidate_user(Self::target_uuid(event, "user_id")?).await?;
            }
            EventType::GroupRoleAssigned | EventType::GroupRoleRevoked | EventType::GroupDeleted => {
                self.authz.invalidate_group(Self::target_uuid(event, "group_id")?).await?;
            }
            EventType::CacheInvalidation => {
                let id = event
                    .target_id
                    .as_deref()
                    .and_then(|id| Uuid::parse_str(id).ok())
                    .ok_or_else(|| AppError::bad_request("cache.invalidate event carries no target id"))?;
                match event.metadata_str("scope") {
                    Some("user") => self.authz.invalidate_user(id).await?,
                    Some("role") => {
                        self.authz.invalidate_role(id).await?;
                    }
                    Some("group") => {
                        self.authz.invalidate_group(id).await?;
                    }
                    other => {
                        return Err(AppError::bad_request(format!(
                            "unknown invalidation scope: {}",
                            other.unwrap_or("<none>")
                        )));
                    }
                }
            }
            EventType::RoleCreated
            | EventType::PermissionCreated
            | EventType::GroupCreated
            | EventType::PermissionDenied => {}
        }
        Ok(())
    }
}

// =============================================================================
// AUDIT
// =============================================================================

/// Writes one `activity_log` row per event.
pub struct AuditHandler {
    pool: SqlitePool,
}

impl AuditHandler {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn describe(event: &AuthzEvent) -> String {
        let actor = event
            .actor_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "system".to_string());
        match (&event.target_type, &event.target_id) {
            (Some(kind), Some(id)) => format!("{} {kind} {id} by {actor}", event.event_type),
            (None, Some(id)) => format!("{} {id} by {actor}", event.event_type),
            _ => format!("{} by {actor}", event.event_type),
        }
    }
}

#[async_trait]
impl EventHandler for AuditHandler {
    fn name(&self) -> &'static str {
        "audit"
    }

    async fn handle(&self, event: &AuthzEvent) -> AppResult<()> {
        let mut properties = event.metadata.clone();
        if let Some(context) = &event.context {
            properties.insert("context".to_string(), serde_json::to_value(context)?);
        }

        sqlx::query(
            r#"
            INSERT INTO activity_log (id, event_name, description, actor_id, target_id, occurred_at, properties, severity)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.id.to_string())
        .bind(event.event_type.as_str())
        .bind(Self::describe(event))
        .bind(event.actor_id.map(|id| id.to_string()))
        .bind(&event.target_id)
        .bind(event.occurred_at)
        .bind(serde_json::Value::Object(properties).to_string())
        .bind(event.severity.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// =============================================================================
// METRICS
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct EventMetricsSnapshot {
    pub events: BTreeMap<String, u64>,
    pub handler_failures: BTreeMap<String, u64>,
}

/// Per-event-type counters plus handler failure counts.
#[derive(Debug, Default)]
pub struct EventMetrics {
    events: DashMap<EventType, u64>,
    failures: DashMap<&'static str, u64>,
}

impl EventMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event_type: EventType) {
        *self.events.entry(event_type).or_insert(0) += 1;
    }

    pub fn record_failure(&self, handler: &'static str) {
        *self.failures.entry(handler).or_insert(0) += 1;
    }

    pub fn count(&self, event_type: EventType) -> u64 {
        self.events.get(&event_type).map(|c| *c).unwrap_or(0)
    }

    pub fn snapshot(&self) -> EventMetricsSnapshot {
        EventMetricsSnapshot {
            events: self
                .events
                .iter()
                .map(|e| (e.key().as_str().to_string(), *e.value()))
                .collect(),
            handler_failures: self
                .failures
                .iter()
                .map(|e| (e.key().to_string(), *e.value()))
                .collect(),
        }
    }
}

pub struct MetricsHandler {
    metrics: Arc<EventMetrics>,
}

impl MetricsHandler {
    pub fn new(metrics: Arc<EventMetrics>) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl EventHandler for MetricsHandler {
    fn name(&self) -> &'static str {
        "metrics"
    }

    async fn handle(&self, event: &AuthzEvent) -> AppResult<()> {
        self.metrics.record(event.event_type);
        Ok(())
    }
}

// =============================================================================
// NOTIFICATIONS
// =============================================================================

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &AuthzEvent) -> AppResult<()>;
}

/// Emits one structured log line per notification.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &AuthzEvent) -> AppResult<()> {
        tracing::info!(
            event = %event.event_type,
            actor_id = ?event.actor_id,
            target_id = ?event.target_id,
            severity = event.severity.as_str(),
            "authorization notification"
        );
        Ok(())
    }
}

/// Forwards important events to a [`Notifier`].
pub struct NotificationHandler {
    notifier: Arc<dyn Notifier>,
}

impl NotificationHandler {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl EventHandler for NotificationHandler {
    fn name(&self) -> &'static str {
        "notification"
    }

    async fn handle(&self, event: &AuthzEvent) -> AppResult<()> {
        if !event.event_type.is_important() {
            return Ok(());
        }
        self.notifier.notify(event).await
    }
}

/// Wire the four canonical handlers onto `bus`.
pub async fn register_default_handlers(
    bus: &EventBus,
    authz: AuthorizationManager,
    pool: SqlitePool,
    metrics: Arc<EventMetrics>,
    notifier: Arc<dyn Notifier>,
) {
    let cache: Arc<dyn EventHandler> = Arc::new(CacheInvalidationHandler::new(authz));
    let audit: Arc<dyn EventHandler> = Arc::new(AuditHandler::new(pool));
    let counters: Arc<dyn EventHandler> = Arc::new(MetricsHandler::new(metrics));
    let notify: Arc<dyn EventHandler> = Arc::new(NotificationHandler::new(notifier));

    let important: Vec<EventType> = EventType::ALL.into_iter().filter(|e| e.is_important()).collect();

    bus.register_for(&EventType::ALL, cache).await;
    bus.register_for(&EventType::ALL, audit).await;
    bus.register_for(&EventType::ALL, counters).await;
    bus.register_for(&important, notify).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::PermissionResolver;
    use crate::cache::{MemoryPermissionCache, PermissionCache};
    use crate::models::rbac::UserPermissionMatrix;
    use crate::storage::MemoryStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn manager_with(cache: Arc<MemoryPermissionCache>) -> AuthorizationManager {
        let resolver = PermissionResolver::new(Arc::new(MemoryStorage::new()));
        AuthorizationManager::new(resolver, cache, Duration::from_secs(60))
    }

    fn cached(user: Uuid, roles: &[Uuid], groups: &[Uuid]) -> UserPermissionMatrix {
        let mut matrix = UserPermissionMatrix::empty(user);
        matrix.direct_roles = roles.to_vec();
        matrix.group_ids = groups.to_vec();
        matrix
    }

    #[tokio::test]
    async fn test_permission_update_invalidates_every_carrying_role() {
        let cache = Arc::new(MemoryPermissionCache::new(Duration::from_secs(120)));
        let handler = CacheInvalidationHandler::new(manager_with(cache.clone()));
        let (r1, r2) = (Uuid::new_v4(), Uuid::new_v4());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        cache.set(a, &cached(a, &[r1], &[]), Duration::from_secs(60)).await.unwrap();
        cache.set(b, &cached(b, &[r2], &[]), Duration::from_secs(60)).await.unwrap();

        let event = AuthzEvent::new(EventType::PermissionUpdated, None)
            .with_metadata("role_ids", serde_json::json!([r1.to_string(), r2.to_string()]));
        handler.handle(&event).await.unwrap();

        assert!(cache.get(a).await.unwrap().is_none());
        assert!(cache.get(b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_membership_and_scope_events() {
        let cache = Arc::new(MemoryPermissionCache::new(Duration::from_secs(120)));
        let handler = CacheInvalidationHandler::new(manager_with(cache.clone()));
        let group = Uuid::new_v4();
        let (member, other) = (Uuid::new_v4(), Uuid::new_v4());
        cache.set(member, &cached(member, &[], &[group]), Duration::from_secs(60)).await.unwrap();
        cache.set(other, &cached(other, &[], &[]), Duration::from_secs(60)).await.unwrap();

        let removed = AuthzEvent::new(EventType::GroupMemberRemoved, None)
            .with_target("group_member", other.to_string())
            .with_metadata("group_id", group.to_string());
        handler.handle(&removed).await.unwrap();
        assert!(cache.get(other).await.unwrap().is_none());
        assert!(cache.get(member).await.unwrap().is_some());

        let explicit = AuthzEvent::new(EventType::CacheInvalidation, None)
            .with_target("group", group.to_string())
            .with_metadata("scope", "group");
        handler.handle(&explicit).await.unwrap();
        assert!(cache.get(member).await.unwrap().is_none());

        let bogus = AuthzEvent::new(EventType::CacheInvalidation, None)
            .with_target("tenant", Uuid::new_v4().to_string())
            .with_metadata("scope", "tenant");
        assert!(handler.handle(&bogus).await.is_err());
    }

    struct CountingNotifier(AtomicUsize);

    #[async_trait]
    impl Notifier for CountingNotifier {
        async fn notify(&self, _event: &AuthzEvent) -> AppResult<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_notifications_only_for_important_events() {
        let notifier = Arc::new(CountingNotifier(AtomicUsize::new(0)));
        let handler = NotificationHandler::new(notifier.clone());

        handler.handle(&AuthzEvent::new(EventType::RoleCreated, None)).await.unwrap();
        handler.handle(&AuthzEvent::new(EventType::RoleAssigned, None)).await.unwrap();
        handler.handle(&AuthzEvent::new(EventType::PermissionDenied, None)).await.unwrap();

        assert_eq!(notifier.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_metrics_count_events_and_failures() {
        let metrics = Arc::new(EventMetrics::new());
        let handler = MetricsHandler::new(metrics.clone());
        handler.handle(&AuthzEvent::new(EventType::RoleUpdated, None)).await.unwrap();
        handler.handle(&AuthzEvent::new(EventType::RoleUpdated, None)).await.unwrap();
        metrics.record_failure("audit");

        assert_eq!(metrics.count(EventType::RoleUpdated), 2);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.events["role.updated"], 2);
        assert_eq!(snapshot.handler_failures["audit"], 1);
    }
}
