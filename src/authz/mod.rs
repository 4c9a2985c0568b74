//! Authorization engine - resolver, condition evaluator, manager facade and
//! request guards.
//!
//! Decisions are keyed by `resourceType:resourceID:action`. Keys are only ever
//! built through [`permission_key`] so the resolver and the manager agree on
//! the format.

mod condition;
mod manager;
mod middleware;
mod resolver;

pub use condition::{Attributes, ConditionEvaluator};
pub use manager::{
    AuthorizationManager, AuthorizationResult, EvaluationTrace, RequestAttributes, CONDITION_NOT_SATISFIED,
    NO_EXPLICIT_GRANT,
};
pub use middleware::{
    enforce, optional_permission, require_ownership, require_permission, require_role, Guard, GuardState,
};
pub use resolver::PermissionResolver;

use crate::models::rbac::WILDCARD_RESOURCE;

pub fn permission_key(resource_type: &str, resource_id: &str, action: &str) -> String {
    format!("{resource_type}:{resource_id}:{action}")
}

pub fn wildcard_key(resource_type: &str, action: &str) -> String {
    permission_key(resource_type, WILDCARD_RESOURCE, action)
}

/// Well-known system role names
pub mod roles {
    pub const ADMIN: &str = "admin";
    pub const VIEWER: &str = "viewer";
}

/// Resource type and actions guarding the management API
pub mod permissions {
    pub const RBAC: &str = "rbac";
    pub const READ: &str = "read";
    pub const MANAGE: &str = "manage";
}
