//! Authorization event bus.
//!
//! Mutations to roles, permissions, groups and assignments are published as
//! [`AuthzEvent`]s. Each publish is durably logged (best effort) and then fanned
//! out to every handler registered for the event type. Handlers run
//! concurrently with a bounded width; the publisher waits for all of them and
//! gets back one combined error if any failed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::{AppError, AppResult};

pub mod handlers;
pub mod loggable;
pub mod store;

pub use handlers::{
    register_default_handlers, AuditHandler, CacheInvalidationHandler, EventMetrics, EventMetricsSnapshot,
    LogNotifier, MetricsHandler, NotificationHandler, Notifier,
};
pub use loggable::{Loggable, Severity};
pub use store::EventStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "role.created")]
    RoleCreated,
    #[serde(rename = "role.updated")]
    RoleUpdated,
    #[serde(rename = "role.deleted")]
    RoleDeleted,
    #[serde(rename = "permission.created")]
    PermissionCreated,
    #[serde(rename = "permission.updated")]
    PermissionUpdated,
    #[serde(rename = "permission.deleted")]
    PermissionDeleted,
    #[serde(rename = "role.permission_assigned")]
    RolePermissionAssigned,
    #[serde(rename = "role.permission_revoked")]
    RolePermissionRevoked,
    #[serde(rename = "user.role_assigned")]
    RoleAssigned,
    #[serde(rename = "user.role_revoked")]
    RoleRevoked,
    #[serde(rename = "group.created")]
    GroupCreated,
    #[serde(rename = "group.deleted")]
    GroupDeleted,
    #[serde(rename = "group.member_added")]
    GroupMemberAdded,
    #[serde(rename = "group.member_removed")]
    GroupMemberRemoved,
    #[serde(rename = "group.role_assigned")]
    GroupRoleAssigned,
    #[serde(rename = "group.role_revoked")]
    GroupRoleRevoked,
    #[serde(rename = "permission.denied")]
    PermissionDenied,
    #[serde(rename = "cache.invalidate")]
    CacheInvalidation,
}

impl EventType {
    pub const ALL: [EventType; 18] = [
        EventType::RoleCreated,
        EventType::RoleUpdated,
        EventType::RoleDeleted,
        EventType::PermissionCreated,
        EventType::PermissionUpdated,
        EventType::PermissionDeleted,
        EventType::RolePermissionAssigned,
        EventType::RolePermissionRevoked,
        EventType::RoleAssigned,
        EventType::RoleRevoked,
        EventType::GroupCreated,
        EventType::GroupDeleted,
        EventType::GroupMemberAdded,
        EventType::GroupMemberRemoved,
        EventType::GroupRoleAssigned,
        EventType::GroupRoleRevoked,
        EventType::PermissionDenied,
        EventType::CacheInvalidation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::RoleCreated => "role.created",
            EventType::RoleUpdated => "role.updated",
            EventType::RoleDeleted => "role.deleted",
            EventType::PermissionCreated => "permission.created",
            EventType::PermissionUpdated => "permission.updated",
            EventType::PermissionDeleted => "permission.deleted",
            EventType::RolePermissionAssigned => "role.permission_assigned",
            EventType::RolePermissionRevoked => "role.permission_revoked",
            EventType::RoleAssigned => "user.role_assigned",
            EventType::RoleRevoked => "user.role_revoked",
            EventType::GroupCreated => "group.created",
            EventType::GroupDeleted => "group.deleted",
            EventType::GroupMemberAdded => "group.member_added",
            EventType::GroupMemberRemoved => "group.member_removed",
            EventType::GroupRoleAssigned => "group.role_assigned",
            EventType::GroupRoleRevoked => "group.role_revoked",
            EventType::PermissionDenied => "permission.denied",
            EventType::CacheInvalidation => "cache.invalidate",
        }
    }

    /// The verb half of the event name ("created", "member_added", ...).
    pub fn action(&self) -> &'static str {
        let name = self.as_str();
        name.split_once('.').map(|(_, action)| action).unwrap_or(name)
    }

    pub fn severity(&self) -> Severity {
        match self {
            EventType::CacheInvalidation => Severity::Noise,
            EventType::GroupCreated | EventType::PermissionCreated | EventType::PermissionDenied => {
                Severity::Important
            }
            _ => Severity::Critical,
        }
    }

    /// Events the notifier forwards to humans.
    pub fn is_important(&self) -> bool {
        matches!(
            self,
            EventType::RoleAssigned
                | EventType::RoleRevoked
                | EventType::PermissionDenied
                | EventType::GroupMemberAdded
                | EventType::GroupMemberRemoved
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request context captured at the HTTP boundary (IP, User-Agent, request id).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extract context from Axum request headers
    pub fn from_headers(headers: &axum::http::HeaderMap) -> Self {
        let ip = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.split(',').next().unwrap_or(s).trim().to_string())
            .or_else(|| {
                headers
                    .get("x-real-ip")
                    .and_then(|v| v.to_str().ok())
                    .map(String::from)
            });

        let user_agent = headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        let request_id = headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        Self { ip, user_agent, request_id }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn with_user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthzEvent {
    pub id: Uuid,
    pub event_type: EventType,
    pub occurred_at: DateTime<Utc>,
    pub actor_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    pub metadata: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<RequestContext>,
    pub severity: Severity,
}

impl AuthzEvent {
    pub fn new(event_type: EventType, actor_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            occurred_at: Utc::now(),
            actor_id,
            target_type: None,
            target_id: None,
            metadata: Map::new(),
            context: None,
            severity: event_type.severity(),
        }
    }

    /// Event targeting a loggable entity, with its snapshot in the metadata.
    pub fn for_entity<T: Loggable>(event_type: EventType, actor_id: Option<Uuid>, entity: &T) -> Self {
        let mut event = Self::new(event_type, actor_id)
            .with_target(T::entity_type(), entity.subject_id().to_string());
        event.severity = event.severity.max(entity.severity_for_action(event_type.action()));
        event
            .metadata
            .insert("entity".to_string(), serde_json::to_value(entity).unwrap_or_default());
        event
    }

    pub fn with_target(mut self, target_type: impl Into<String>, target_id: impl Into<String>) -> Self {
        self.target_type = Some(target_type.into());
        self.target_id = Some(target_id.into());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// A UUID stored under `key` in the metadata.
    pub fn metadata_uuid(&self, key: &str) -> Option<Uuid> {
        self.metadata_str(key).and_then(|s| Uuid::parse_str(s).ok())
    }

    /// A list of UUIDs stored under `key`; unparseable entries are dropped.
    pub fn metadata_uuids(&self, key: &str) -> Vec<Uuid> {
        self.metadata
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .filter_map(|s| Uuid::parse_str(s).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &AuthzEvent) -> AppResult<()>;
}

pub struct EventBus {
    handlers: RwLock<HashMap<EventType, Vec<Arc<dyn EventHandler>>>>,
    store: Option<EventStore>,
    metrics: Option<Arc<EventMetrics>>,
    concurrency: usize,
}

impl EventBus {
    pub fn new(concurrency: usize) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            store: None,
            metrics: None,
            concurrency: concurrency.max(1),
        }
    }

    pub fn with_store(mut self, store: EventStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Count handler failures into `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<EventMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn register_handler(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        tracing::debug!(event = %event_type, handler = handler.name(), "registering event handler");
        self.handlers
            .write()
            .await
            .entry(event_type)
            .or_default()
            .push(handler);
    }

    pub async fn register_for(&self, event_types: &[EventType], handler: Arc<dyn EventHandler>) {
        for event_type in event_types {
            self.register_handler(*event_type, Arc::clone(&handler)).await;
        }
    }

    pub async fn handler_count(&self, event_type: EventType) -> usize {
        self.handlers
            .read()
            .await
            .get(&event_type)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Log the event, run every matching handler, and report all failures.
    pub async fn publish_event(&self, event: AuthzEvent) -> AppResult<()> {
        if let Some(store) = &self.store {
            if let Err(err) = store.append(&event).await {
                tracing::warn!(event = %event.event_type, error = %err, "failed to persist event, dispatching anyway");
            }
        }

        let handlers = self
            .handlers
            .read()
            .await
            .get(&event.event_type)
            .cloned()
            .unwrap_or_default();

        if handlers.is_empty() {
            tracing::debug!(event = %event.event_type, "no handlers registered");
            return Ok(());
        }

        let event = Arc::new(event);
        let tasks = handlers.into_iter().map(|handler| {
            let event = Arc::clone(&event);
            Box::pin(async move {
                let result = handler.handle(&event).await;
                (handler.name(), result)
            }) as BoxFuture<'static, (&'static str, AppResult<()>)>
        }).collect::<Vec<_>>();
        let outcomes: Vec<(&'static str, AppResult<()>)> = stream::iter(tasks)
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut failures = Vec::new();
        for (name, result) in outcomes {
            if let Err(err) = result {
                tracing::error!(handler = name, event = %event.event_type, error = %err, "event handler failed");
                if let Some(metrics) = &self.metrics {
                    metrics.record_failure(name);
                }
                failures.push(format!("{name}: {err}"));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(AppError::EventDispatch(failures))
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("concurrency", &self.concurrency)
            .field("durable", &self.store.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Counting {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventHandler for Counting {
        fn name(&self) -> &'static str { "counting" }

        async fn handle(&self, _event: &AuthzEvent) -> AppResult<()> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EventHandler for Failing {
        fn name(&self) -> &'static str { "failing" }

        async fn handle(&self, _event: &AuthzEvent) -> AppResult<()> {
            Err(AppError::cache("backend down"))
        }
    }

    #[tokio::test]
    async fn test_publish_waits_for_all_handlers() {
        let bus = EventBus::new(2);
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            bus.register_handler(EventType::RoleUpdated, Arc::new(Counting { calls: calls.clone() }))
                .await;
        }

        bus.publish_event(AuthzEvent::new(EventType::RoleUpdated, None))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_failures_are_aggregated_without_stopping_others() {
        let bus = EventBus::new(4);
        let calls = Arc::new(AtomicUsize::new(0));
        bus.register_handler(EventType::RoleDeleted, Arc::new(Failing)).await;
        bus.register_handler(EventType::RoleDeleted, Arc::new(Counting { calls: calls.clone() }))
            .await;
        bus.register_handler(EventType::RoleDeleted, Arc::new(Failing)).await;

        let err = bus
            .publish_event(AuthzEvent::new(EventType::RoleDeleted, None))
            .await
            .unwrap_err();
        match err {
            AppError::EventDispatch(failures) => {
                assert_eq!(failures.len(), 2);
                assert!(failures[0].starts_with("failing:"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_publish_runs_on_a_spawned_task() {
        let bus = Arc::new(EventBus::new(2));
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            bus.register_handler(EventType::GroupCreated, Arc::new(Counting { calls: calls.clone() }))
                .await;
        }

        let publish = tokio::spawn({
            let bus = Arc::clone(&bus);
            async move { bus.publish_event(AuthzEvent::new(EventType::GroupCreated, None)).await }
        });
        publish.await.unwrap().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_only_matching_type_is_dispatched() {
        let bus = EventBus::new(1);
        let calls = Arc::new(AtomicUsize::new(0));
        bus.register_handler(EventType::GroupCreated, Arc::new(Counting { calls: calls.clone() }))
            .await;

        bus.publish_event(AuthzEvent::new(EventType::GroupDeleted, None))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(bus.handler_count(EventType::GroupCreated).await, 1);
    }

    #[test]
    fn test_event_names_and_severity() {
        assert_eq!(EventType::GroupMemberAdded.action(), "member_added");
        assert_eq!(
            serde_json::to_value(EventType::RoleAssigned).unwrap(),
            Value::String("user.role_assigned".into())
        );
        assert_eq!(EventType::CacheInvalidation.severity(), Severity::Noise);
        assert!(EventType::PermissionDenied.is_important());
        assert!(!EventType::RoleCreated.is_important());
    }

    #[test]
    fn test_metadata_helpers() {
        let role = Uuid::new_v4();
        let event = AuthzEvent::new(EventType::PermissionUpdated, None)
            .with_metadata("role_ids", serde_json::json!([role.to_string(), "junk"]))
            .with_metadata("user_id", role.to_string());
        assert_eq!(event.metadata_uuids("role_ids"), vec![role]);
        assert_eq!(event.metadata_uuid("user_id"), Some(role));
        assert_eq!(event.metadata_uuid("missing"), None);
    }
}
