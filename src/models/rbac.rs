use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::errors::AppError;
use crate::events::{Loggable, Severity};

/// Resource segment matching any resource id of a type.
pub const WILDCARD_RESOURCE: &str = "*";

// =============================================================================
// EFFECT
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
}

impl Effect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Effect::Allow => "allow",
            Effect::Deny => "deny",
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, Effect::Allow)
    }
}

impl Default for Effect {
    fn default() -> Self {
        Effect::Allow
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Effect {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "allow" => Ok(Effect::Allow),
            "deny" => Ok(Effect::Deny),
            other => Err(AppError::bad_request(format!("unknown effect: {other}"))),
        }
    }
}

// =============================================================================
// ROLE
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    /// 0 for roots, parent.level + 1 otherwise
    pub level: i64,
    pub is_system: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            parent_id: None,
            level: 0,
            is_system: false,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach under `parent`, deriving the level from it.
    pub fn with_parent(mut self, parent: &Role) -> Self {
        self.parent_id = Some(parent.id);
        self.level = parent.level + 1;
        self
    }

    pub fn system(mut self) -> Self {
        self.is_system = true;
        self
    }
}

impl Loggable for Role {
    fn entity_type() -> &'static str { "role" }
    fn subject_id(&self) -> Uuid { self.id }
    fn severity(&self) -> Severity { Severity::Critical }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RoleCreateRequest {
    #[schema(example = "project_editor")]
    pub name: String,
    #[schema(example = "Can edit project content")]
    pub description: Option<String>,
    pub parent_id: Option<Uuid>,
}

/// Partial update: only supplied fields change.
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct RoleUpdateRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub parent_id: Option<Uuid>,
    /// Move the role to the root of the hierarchy
    #[serde(default)]
    pub detach_parent: bool,
    pub is_active: Option<bool>,
}

// =============================================================================
// PERMISSION
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Permission {
    pub id: Uuid,
    pub name: String,
    pub resource_type: String,
    pub action: String,
    pub effect: Effect,
    /// Flat JSON equality map, stored verbatim
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Permission {
    pub fn new(resource_type: impl Into<String>, action: impl Into<String>, effect: Effect) -> Self {
        let resource_type = resource_type.into();
        let action = action.into();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: format!("{resource_type}.{action}"),
            resource_type,
            action,
            effect,
            conditions: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn allow(resource_type: impl Into<String>, action: impl Into<String>) -> Self {
        Self::new(resource_type, action, Effect::Allow)
    }

    pub fn deny(resource_type: impl Into<String>, action: impl Into<String>) -> Self {
        Self::new(resource_type, action, Effect::Deny)
    }

    pub fn with_conditions(mut self, conditions: impl Into<String>) -> Self {
        self.conditions = Some(conditions.into());
        self
    }
}

impl Loggable for Permission {
    fn entity_type() -> &'static str { "permission" }
    fn subject_id(&self) -> Uuid { self.id }
    fn severity(&self) -> Severity { Severity::Critical }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PermissionCreateRequest {
    #[schema(example = "document.read")]
    pub name: Option<String>,
    #[schema(example = "document")]
    pub resource_type: String,
    #[schema(example = "read")]
    pub action: String,
    #[serde(default)]
    pub effect: Effect,
    /// Optional equality conditions, e.g. {"department": "eng"}
    #[serde(default)]
    #[schema(value_type = Object)]
    pub conditions: Option<Value>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct PermissionUpdateRequest {
    pub name: Option<String>,
    pub effect: Option<Effect>,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub conditions: Option<Value>,
    #[serde(default)]
    pub clear_conditions: bool,
    pub is_active: Option<bool>,
}

// =============================================================================
// GROUP
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Group {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Loggable for Group {
    fn entity_type() -> &'static str { "group" }
    fn subject_id(&self) -> Uuid { self.id }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct GroupCreateRequest {
    #[schema(example = "auditors")]
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct GroupMember {
    pub group_id: Uuid,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Loggable for GroupMember {
    fn entity_type() -> &'static str { "group_member" }
    fn subject_id(&self) -> Uuid { self.user_id }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AddGroupMemberRequest {
    pub user_id: Uuid,
}

// =============================================================================
// ROLE ASSIGNMENTS (user or group subject)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SubjectKind {
    User,
    Group,
}

impl SubjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectKind::User => "user",
            SubjectKind::Group => "group",
        }
    }
}

/// Links a user or a group to a role. The only place roles become held.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RoleAssignment {
    pub id: Uuid,
    pub subject_kind: SubjectKind,
    pub subject_id: Uuid,
    pub role_id: Uuid,
    /// Specific resource id, or "*"
    pub resource_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub granted_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl RoleAssignment {
    pub fn for_user(user_id: Uuid, role_id: Uuid) -> Self {
        Self::new(SubjectKind::User, user_id, role_id)
    }

    pub fn for_group(group_id: Uuid, role_id: Uuid) -> Self {
        Self::new(SubjectKind::Group, group_id, role_id)
    }

    fn new(subject_kind: SubjectKind, subject_id: Uuid, role_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject_kind,
            subject_id,
            role_id,
            resource_id: WILDCARD_RESOURCE.to_string(),
            expires_at: None,
            is_active: true,
            granted_by: None,
            created_at: Utc::now(),
        }
    }

    pub fn scoped_to(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = resource_id.into();
        self
    }

    pub fn expiring_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Active and not past its expiry at `now`.
    pub fn is_effective(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.map(|exp| exp > now).unwrap_or(true)
    }
}

impl Loggable for RoleAssignment {
    fn entity_type() -> &'static str { "role_assignment" }
    fn subject_id(&self) -> Uuid { self.subject_id }
    fn severity(&self) -> Severity { Severity::Critical }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AssignRoleRequest {
    pub role_id: Uuid,
    /// Narrow the assignment to one resource id (defaults to "*")
    #[schema(example = "doc-1")]
    pub resource_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A held role as returned by the storage gateway: the role plus the
/// resource scope of the assignment that made it held.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleGrant {
    pub role: Role,
    pub resource_id: String,
    pub expires_at: Option<DateTime<Utc>>,
}

// =============================================================================
// ROLE-PERMISSION ASSIGNMENT
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RolePermission {
    pub role_id: Uuid,
    pub permission_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Loggable for RolePermission {
    fn entity_type() -> &'static str { "role_permission" }
    fn subject_id(&self) -> Uuid { self.role_id }
    fn severity(&self) -> Severity { Severity::Critical }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AssignPermissionToRoleRequest {
    pub permission_id: Uuid,
}

// =============================================================================
// RESOLVED PERMISSIONS (computed, never persisted)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PermissionDecision {
    pub resource_type: String,
    pub resource_id: String,
    pub action: String,
    pub effect: Effect,
    /// Which role/path produced the decision
    #[schema(example = "direct:viewer")]
    pub source: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct UserPermissionMatrix {
    pub user_id: Uuid,
    pub direct_roles: Vec<Uuid>,
    pub inherited_roles: Vec<Uuid>,
    pub group_roles: Vec<Uuid>,
    pub group_ids: Vec<Uuid>,
    #[schema(value_type = Object)]
    pub role_names: BTreeMap<Uuid, String>,
    /// Keyed by `resourceType:resourceID:action`
    pub final_permissions: BTreeMap<String, PermissionDecision>,
    pub computed_at: DateTime<Utc>,
    /// Earliest expiry among the assignments that contributed a role
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl UserPermissionMatrix {
    pub fn empty(user_id: Uuid) -> Self {
        Self {
            user_id,
            direct_roles: Vec::new(),
            inherited_roles: Vec::new(),
            group_roles: Vec::new(),
            group_ids: Vec::new(),
            role_names: BTreeMap::new(),
            final_permissions: BTreeMap::new(),
            computed_at: Utc::now(),
            expires_at: None,
        }
    }

    /// Every role that contributed to the matrix, deduplicated.
    pub fn all_role_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self
            .direct_roles
            .iter()
            .chain(self.group_roles.iter())
            .chain(self.inherited_roles.iter())
            .copied()
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn holds_role_named(&self, name: &str) -> bool {
        self.role_names.values().any(|n| n == name)
    }

    /// `ttl`, shortened so the entry never outlives a contributing assignment.
    pub fn cache_ttl(&self, ttl: std::time::Duration, now: DateTime<Utc>) -> std::time::Duration {
        match self.expires_at {
            Some(expires_at) => (expires_at - now).to_std().unwrap_or_default().min(ttl),
            None => ttl,
        }
    }
}
