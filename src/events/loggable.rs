use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Retention class attached to every audited event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Aggressively trimmed (cache bookkeeping)
    Noise,
    /// Medium-term retention (default)
    Important,
    /// Long-term retention, never auto-deleted (privilege changes)
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Important => "important",
            Severity::Noise => "noise",
        }
    }
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Important
    }
}

/// Entities that can be the target of an authorization event.
pub trait Loggable: Serialize + Send + Sync {
    /// Target type recorded on the event ("role", "permission", ...)
    fn entity_type() -> &'static str;

    fn subject_id(&self) -> Uuid;

    fn severity(&self) -> Severity {
        Severity::Important
    }

    /// Removals are always critical; everything else uses the entity default.
    fn severity_for_action(&self, action: &str) -> Severity {
        match action {
            "deleted" | "revoked" | "member_removed" | "role_revoked" | "permission_revoked" => {
                Severity::Critical
            }
            _ => self.severity(),
        }
    }
}
