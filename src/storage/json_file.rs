use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::warn;

use crate::models::{PortalSession, TenantId};

use super::{apply, SessionChange, SessionStore};

/// JSON file-based session store.
///
/// Directory structure:
/// ```text
/// data/
///   sessions/
///     {tenant}.json
/// ```
///
/// Writes go to a temporary file that is renamed over the old one, so a
/// session file always holds one complete record.
pub struct JsonFileSessionStore {
    base_path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileSessionStore {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    fn sessions_dir(&self) -> PathBuf {
        self.base_path.join("sessions")
    }

    fn session_file(&self, tenant: &TenantId) -> PathBuf {
        self.sessions_dir().join(format!("{tenant}.json"))
    }

    async fn read_session(&self, path: &Path) -> Result<Option<PortalSession>> {
        match fs::read_to_string(path).await {
            Ok(content) => {
                let session = serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse session file {}", path.display()))?;
                Ok(Some(session))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    async fn write_session(&self, session: &PortalSession) -> Result<()> {
        let dir = self.sessions_dir();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let path = self.session_file(&session.tenant_id);
        let tmp = dir.join(format!(".{}.json.tmp", session.tenant_id));
        let content = serde_json::to_string_pretty(session).context("Failed to serialize session")?;
        fs::write(&tmp, content)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to move session file into {}", path.display()))?;
        Ok(())
    }

    async fn change(&self, tenant: &TenantId, change: SessionChange<'_>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.session_file(tenant);
        let mut session = self
            .read_session(&path)
            .await?
            .unwrap_or_else(|| PortalSession::new(tenant.clone()));
        apply(&mut session, &change);
        self.write_session(&session).await
    }
}

#[async_trait::async_trait]
impl SessionStore for JsonFileSessionStore {
    async fn list_sessions(&self) -> Result<Vec<PortalSession>> {
        let dir = self.sessions_dir();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("Failed to list {}", dir.display())),
        };

        let mut sessions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
            let is_hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with('.'))
                .unwrap_or(true);
            if !is_json || is_hidden {
                continue;
            }

            match self.read_session(&path).await {
                Ok(Some(session)) => sessions.push(session),
                Ok(None) => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable session file");
                }
            }
        }

        sessions.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        Ok(sessions)
    }

    async fn get_session(&self, tenant: &TenantId) -> Result<Option<PortalSession>> {
        self.read_session(&self.session_file(tenant)).await
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
