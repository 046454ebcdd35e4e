use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TenantId;

/// Durable per-tenant portal session.
///
/// Records are never deleted; a dead session is marked `is_valid = false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalSession {
    pub tenant_id: TenantId,

    /// Serialized `Cookie` header value. Replaced as a whole, never patched.
    #[serde(default)]
    pub cookie_jar: String,

    #[serde(default)]
    pub last_login_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub last_activity_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub is_valid: bool,

    #[serde(default)]
    pub consecutive_failure_count: u32,
}

impl PortalSession {
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            cookie_jar: String::new(),
            last_login_at: None,
            last_activity_at: None,
            is_valid: false,
            consecutive_failure_count: 0,
        }
    }

    pub fn has_cookie(&self) -> bool {
        !self.cookie_jar.trim().is_empty()
    }

    pub fn logged_in_on(&self, day: chrono::NaiveDate) -> bool {
        self.last_login_at
            .map(|at| at.date_naive() == day)
            .unwrap_or(false)
    }
}
