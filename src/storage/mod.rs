mod json_file;
mod memory;

pub use json_file::JsonFileSessionStore;
pub use memory::MemorySessionStore;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::models::{PortalSession, TenantId};

/// Durable keyed store of portal sessions.
///
/// Implementations must replace `cookie_jar` as a whole: a reader never sees
/// half of an old jar and half of a new one.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    async fn list_sessions(&self) -> Result<Vec<PortalSession>>;
    async fn get_session(&self, tenant: &TenantId) -> Result<Option<PortalSession>>;

    /// Replace the stored cookie, creating the session record if needed.
    async fn replace_cookie(&self, tenant: &TenantId, cookie_jar: &str) -> Result<()>;

    /// A login completed: the session is valid again.
    async fn record_login(&self, tenant: &TenantId, at: DateTime<Utc>) -> Result<()>;

    /// An authenticated request succeeded.
    async fn touch(&self, tenant: &TenantId, at: DateTime<Utc>) -> Result<()>;

    async fn record_failure(&self, tenant: &TenantId, consecutive_failures: u32) -> Result<()>;

    async fn mark_invalid(&self, tenant: &TenantId) -> Result<()>;
}

/// Apply a mutation to a session, shared by the store implementations.
pub(crate) fn apply(session: &mut PortalSession, change: &SessionChange<'_>) {
    match change {
        SessionChange::Cookie(jar) => session.cookie_jar = (*jar).to_string(),
        SessionChange::Login(at) => {
            session.last_login_at = Some(*at);
            session.last_activity_at = Some(*at);
            session.is_valid = true;
            session.consecutive_failure_count = 0;
        }
        SessionChange::Touch(at) => {
            session.last_activity_at = Some(*at);
            session.consecutive_failure_count = 0;
        }
        SessionChange::Failure(count) => session.consecutive_failure_count = *count,
        SessionChange::Invalid => session.is_valid = false,
    }
}

pub(crate) enum SessionChange<'a> {
    Cookie(&'a str),
    Login(DateTime<Utc>),
    Touch(DateTime<Utc>),
    Failure(u32),
    Invalid,
}
