//! In-memory session store for tests and embedding.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::models::{PortalSession, TenantId};

use super::{apply, SessionChange, SessionStore};

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<TenantId, PortalSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a session as-is (tests use this to stage store contents).
    pub async fn insert(&self, session: PortalSession) {
        let mut sessions = self.sessions.lock().await;
        sessions.insert(session.tenant_id.clone(), session);
    }

    async fn change(&self, tenant: &TenantId, change: SessionChange<'_>) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .entry(tenant.clone())
            .or_insert_with(|| PortalSession::new(tenant.clone()));
        apply(session, &change);
        Ok(())
    }
}

#[async_trait::async_trait]
impl SessionStore for MemorySessionStore {
    async fn list_sessions(&self) -> Result<Vec<PortalSession>> {
        let sessions = self.sessions.lock().await;
        let mut all: Vec<PortalSession> = sessions.values().cloned().collect();
        all.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        Ok(all)
    }

    async fn get_session(&self, tenant: &TenantId) -> Result<Option<PortalSession>> {
        let sessions = self.sessions.lock().await;
        Ok(sessions.get(tenant).cloned())
    }

    async fn replace_cookie(&self, tenant: &TenantId, cookie_jar: &str) -> Result<()> {
        self.change(tenant, SessionChange::Cookie(cookie_jar)).await
    }

    async fn record_login(&self, tenant: &TenantId, at: DateTime<Utc>) -> Result<()> {
        self.change(tenant, SessionChange::Login(at)).await
    }

    async fn touch(&self, tenant: &TenantId, at: DateTime<Utc>) -> Result<()> {
        self.change(tenant, SessionChange::Touch(at)).await
    }

    async fn record_failure(&self, tenant: &TenantId, consecutive_failures: u32) -> Result<()> {
        self.change(tenant, SessionChange::Failure(consecutive_failures))
            .await
    }

    async fn mark_invalid(&self, tenant: &TenantId) -> Result<()> {
        self.change(tenant, SessionChange::Invalid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replace_cookie_creates_then_replaces_whole_value() -> Result<()> {
        let store = MemorySessionStore::new();
        let tenant = TenantId::new("school-1")?;

        store.replace_cookie(&tenant, "a=1; b=2").await?;
        store.replace_cookie(&tenant, "c=3").await?;

        let session = store.get_session(&tenant).await?.expect("session");
        assert_eq!(session.cookie_jar, "c=3");
        assert!(!session.is_valid);
        Ok(())
    }

    #[tokio::test]
    async fn login_resets_failures_and_invalid_is_kept() -> Result<()> {
        let store = MemorySessionStore::new();
        let tenant = TenantId::new("school-1")?;
        let at = Utc::now();

        store.record_failure(&tenant, 2).await?;
        store.record_login(&tenant, at).await?;
        let session = store.get_session(&tenant).await?.expect("session");
        assert!(session.is_valid);
        assert_eq!(session.consecutive_failure_count, 0);
        assert_eq!(session.last_login_at, Some(at));

        store.mark_invalid(&tenant).await?;
        let session = store.get_session(&tenant).await?.expect("session");
        assert!(!session.is_valid);
        assert_eq!(store.list_sessions().await?.len(), 1);
        Ok(())
    }
}
