//! Request guards.
//!
//! Each factory returns a [`GuardState`] for [`enforce`]:
//!
//! ```ignore
//! router.route_layer(axum::middleware::from_fn_with_state(
//!     authz::require_permission(&state, "rbac", "manage"),
//!     authz::enforce,
//! ))
//! ```
//!
//! Guards must be installed with `route_layer` so path parameters are known.

use std::sync::Arc;

use axum::extract::{FromRequestParts, RawPathParams, Request, State};
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

use super::condition::Attributes;
use super::manager::{AuthorizationResult, RequestAttributes};
use crate::app::AppState;
use crate::errors::{AppError, AppResult};
use crate::events::{AuthzEvent, EventType, RequestContext};
use crate::jwt::AuthUser;
use crate::models::rbac::WILDCARD_RESOURCE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guard {
    Permission { resource_type: String, action: String },
    OptionalPermission { resource_type: String, action: String },
    Role(Vec<String>),
    Ownership { resource_type: String },
}

#[derive(Clone)]
pub struct GuardState {
    app: AppState,
    guard: Arc<Guard>,
}

impl GuardState {
    pub fn guard(&self) -> &Guard {
        &self.guard
    }
}

fn guard_state(state: &AppState, guard: Guard) -> GuardState {
    GuardState {
        app: state.clone(),
        guard: Arc::new(guard),
    }
}

pub fn require_permission(state: &AppState, resource_type: &str, action: &str) -> GuardState {
    guard_state(
        state,
        Guard::Permission {
            resource_type: resource_type.to_string(),
            action: action.to_string(),
        },
    )
}

/// Pass when the caller holds any of `role_names`, however acquired.
pub fn require_role<I, S>(state: &AppState, role_names: I) -> GuardState
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    guard_state(state, Guard::Role(role_names.into_iter().map(Into::into).collect()))
}

/// Pass when the path resource id is the caller's own id, or when the caller
/// may `manage` the resource.
pub fn require_ownership(state: &AppState, resource_type: &str) -> GuardState {
    guard_state(
        state,
        Guard::Ownership {
            resource_type: resource_type.to_string(),
        },
    )
}

/// Evaluate and stash the result, but never halt the request.
pub fn optional_permission(state: &AppState, resource_type: &str, action: &str) -> GuardState {
    guard_state(
        state,
        Guard::OptionalPermission {
            resource_type: resource_type.to_string(),
            action: action.to_string(),
        },
    )
}

struct Verdict {
    allowed: bool,
    resource_type: String,
    resource_id: String,
    action: String,
    reason: String,
    result: Option<AuthorizationResult>,
}

impl Verdict {
    fn from_check(result: AuthorizationResult, resource_type: &str, resource_id: &str, action: &str) -> Self {
        Self {
            allowed: result.allowed,
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            action: action.to_string(),
            reason: result.decision.reason.clone(),
            result: Some(result),
        }
    }
}

pub async fn enforce(State(guard): State<GuardState>, request: Request, next: Next) -> Result<Response, AppError> {
    let (mut parts, body) = request.into_parts();
    let optional = matches!(*guard.guard, Guard::OptionalPermission { .. });

    let user = match guard.app.jwt.authenticate(&parts.headers) {
        Ok(user) => user,
        Err(_) if optional => return Ok(next.run(Request::from_parts(parts, body)).await),
        Err(err) => return Err(err),
    };
    parts.extensions.insert(user.clone());

    let verdict = match evaluate(&guard, &user, &mut parts).await {
        Ok(verdict) => verdict,
        Err(err) if optional => {
            tracing::warn!(user_id = %user.user_id, error = %err, "optional permission check failed");
            return Ok(next.run(Request::from_parts(parts, body)).await);
        }
        Err(err) => return Err(err),
    };

    if let Some(result) = verdict.result.clone() {
        parts.extensions.insert(result);
    }

    if !verdict.allowed {
        publish_denied(&guard.app, user.user_id, &verdict, RequestContext::from_headers(&parts.headers));
        if !optional {
            tracing::info!(
                user_id = %user.user_id,
                resource_type = %verdict.resource_type,
                resource_id = %verdict.resource_id,
                action = %verdict.action,
                reason = %verdict.reason,
                "request denied"
            );
            return Err(AppError::access_denied(
                verdict.resource_type,
                verdict.resource_id,
                verdict.action,
                verdict.reason,
            ));
        }
    }

    Ok(next.run(Request::from_parts(parts, body)).await)
}

async fn evaluate(guard: &GuardState, user: &AuthUser, parts: &mut Parts) -> AppResult<Verdict> {
    let authz = &guard.app.authz;
    match &*guard.guard {
        Guard::Permission { resource_type, action } | Guard::OptionalPermission { resource_type, action } => {
            let resource_id = resource_id(parts, &guard.app, resource_type).await;
            let attributes = attributes(parts);
            let result = authz
                .check_permission(user.user_id, resource_type, &resource_id, action, Some(&attributes))
                .await?;
            Ok(Verdict::from_check(result, resource_type, &resource_id, action))
        }
        Guard::Role(names) => {
            let allowed = authz.has_any_role(user.user_id, names).await?;
            Ok(Verdict {
                allowed,
                resource_type: "role".to_string(),
                resource_id: WILDCARD_RESOURCE.to_string(),
                action: "assume".to_string(),
                reason: if allowed {
                    "role held".to_string()
                } else {
                    format!("requires one of roles: {}", names.join(", "))
                },
                result: None,
            })
        }
        Guard::Ownership { resource_type } => {
            let resource_id = resource_id(parts, &guard.app, resource_type).await;
            if Uuid::parse_str(&resource_id).ok() == Some(user.user_id) {
                return Ok(Verdict {
                    allowed: true,
                    resource_type: resource_type.clone(),
                    resource_id,
                    action: "own".to_string(),
                    reason: "caller owns the resource".to_string(),
                    result: None,
                });
            }
            let attributes = attributes(parts);
            let result = authz
                .check_permission(user.user_id, resource_type, &resource_id, "manage", Some(&attributes))
                .await?;
            Ok(Verdict::from_check(result, resource_type, &resource_id, "manage"))
        }
    }
}

/// `<resource_type>_id` or `id` from the matched path, else the wildcard.
async fn resource_id(parts: &mut Parts, state: &AppState, resource_type: &str) -> String {
    let Ok(params) = RawPathParams::from_request_parts(parts, state).await else {
        return WILDCARD_RESOURCE.to_string();
    };
    let specific = format!("{resource_type}_id");
    let found = params
        .iter()
        .find(|(key, _)| *key == specific)
        .or_else(|| params.iter().find(|(key, _)| *key == "id"));
    found
        .map(|(_, value)| value.to_string())
        .unwrap_or_else(|| WILDCARD_RESOURCE.to_string())
}

/// Attributes installed upstream as a [`RequestAttributes`] extension.
/// Nothing the caller sends (query, body, headers) is trusted here.
fn attributes(parts: &Parts) -> Attributes {
    parts
        .extensions
        .get::<RequestAttributes>()
        .map(|RequestAttributes(attributes)| attributes.clone())
        .unwrap_or_default()
}

fn publish_denied(state: &AppState, user_id: Uuid, verdict: &Verdict, context: RequestContext) {
    let event = AuthzEvent::new(EventType::PermissionDenied, Some(user_id))
        .with_target(verdict.resource_type.clone(), verdict.resource_id.clone())
        .with_metadata("user_id", user_id.to_string())
        .with_metadata("action", verdict.action.clone())
        .with_metadata("reason", verdict.reason.clone())
        .with_context(context);

    let events = state.events.clone();
    tokio::spawn(async move {
        if let Err(err) = events.publish_event(event).await {
            tracing::warn!(error = %err, "failed to publish permission.denied");
        }
    });
}
