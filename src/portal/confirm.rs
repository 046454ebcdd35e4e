//! Out-of-band login confirmation.
//!
//! The portal's second factor is approved on another device. The flow is:
//! emit a request event on the real-time channel, get a peer id back, send
//! `{token, verify}` to the verify endpoint, then wait for a push event
//! carrying one parameter. [`ConfirmationHub`] turns that push into a
//! future keyed by the peer id, which either resolves on the matching event
//! or fails once the timeout elapses.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::PortalError;
use crate::models::TenantId;

use super::cookies::CookieJar;

/// The channel side that can emit events and return the acknowledgement.
#[async_trait::async_trait]
pub trait ConfirmationTransport: Send + Sync {
    /// Emit `event` for `tenant`; resolves with the peer id from the ack.
    async fn request_confirmation(&self, tenant: &TenantId, event: &str)
        -> Result<String, PortalError>;
}

/// An inbound push event as the channel delivers it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChannelEvent {
    pub event: String,
    /// Peer id the event is addressed to.
    pub id: String,
    #[serde(default)]
    pub param: Option<String>,
}

/// Correlates push events with the logins waiting for them.
pub struct ConfirmationHub {
    proceed_event: String,
    waiters: Mutex<HashMap<String, oneshot::Sender<String>>>,
}

impl ConfirmationHub {
    pub fn new(proceed_event: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            proceed_event: proceed_event.into(),
            waiters: Mutex::new(HashMap::new()),
        })
    }

    /// Start waiting for the push event addressed to `correlation_id`.
    ///
    /// Registering the same id twice replaces the first waiter, which then
    /// sees its channel closed.
    pub fn register(self: &Arc<Self>, correlation_id: &str) -> ConfirmationWaiter {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut waiters) = self.waiters.lock() {
            waiters.insert(correlation_id.to_string(), tx);
        }
        ConfirmationWaiter {
            correlation_id: correlation_id.to_string(),
            rx: Some(rx),
            hub: Arc::clone(self),
        }
    }

    /// Resolve the waiter for `correlation_id`. Returns false if nobody waits.
    pub fn deliver(&self, correlation_id: &str, param: impl Into<String>) -> bool {
        let sender = match self.waiters.lock() {
            Ok(mut waiters) => waiters.remove(correlation_id),
            Err(_) => None,
        };
        match sender {
            Some(tx) => tx.send(param.into()).is_ok(),
            None => {
                debug!(correlation_id, "push event without a waiter");
                false
            }
        }
    }

    /// Route a decoded channel event. Only the proceed event resolves waiters.
    pub fn handle_event(&self, event: &ChannelEvent) -> bool {
        if event.event != self.proceed_event {
            return false;
        }
        self.deliver(&event.id, event.param.clone().unwrap_or_default())
    }

    pub fn waiting(&self) -> usize {
        self.waiters.lock().map(|w| w.len()).unwrap_or(0)
    }

    fn forget(&self, correlation_id: &str) {
        if let Ok(mut waiters) = self.waiters.lock() {
            // Only drop our own registration; a closed sender means it was ours.
            if waiters
                .get(correlation_id)
                .map(|tx| tx.is_closed())
                .unwrap_or(false)
            {
                waiters.remove(correlation_id);
            }
        }
    }
}

/// A registered wait; dropping it unregisters from the hub.
pub struct ConfirmationWaiter {
    correlation_id: String,
    rx: Option<oneshot::Receiver<String>>,
    hub: Arc<ConfirmationHub>,
}

impl ConfirmationWaiter {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Wait for the push event's parameter, at most `timeout`.
    pub async fn wait(mut self, tenant: &TenantId, timeout: Duration) -> Result<String, PortalError> {
        let timed_out = PortalError::ConfirmationTimeout {
            tenant: tenant.clone(),
            waited: timeout,
        };
        let Some(rx) = self.rx.take() else {
            return Err(timed_out);
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(param)) => Ok(param),
            // Replaced by a newer registration or timed out: either way this
            // login attempt is over.
            Ok(Err(_)) | Err(_) => Err(timed_out),
        }
    }
}

impl Drop for ConfirmationWaiter {
    fn drop(&mut self) {
        drop(self.rx.take());
        self.hub.forget(&self.correlation_id);
    }
}

/// Verification value the verify endpoint expects for a peer id.
///
/// Each character's code point is offset by its position modulo 10 and
/// written as three zero-padded decimal digits (wider if the code point
/// needs it). The endpoint checks this shape exactly; do not change it.
pub fn hide_id(peer_id: &str) -> String {
    peer_id
        .chars()
        .enumerate()
        .map(|(i, c)| format!("{:03}", c as u32 + (i as u32 % 10)))
        .collect()
}

/// Peer id as it may appear in logs: first and last two characters kept,
/// everything between replaced by `*`.
pub fn mask_peer_id(peer_id: &str) -> String {
    let chars: Vec<char> = peer_id.chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let mut masked = String::with_capacity(chars.len());
    masked.extend(&chars[..2]);
    masked.extend(std::iter::repeat('*').take(chars.len() - 4));
    masked.extend(&chars[chars.len() - 2..]);
    masked
}

/// A login waiting for its second factor.
#[derive(Debug)]
pub struct PendingConfirmation {
    pub confirmation_token: String,
    pub created_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    pub correlation_id: Option<String>,
    pub(crate) jar: CookieJar,
    pub(crate) code_attempts: u32,
    continuation: Option<JoinHandle<()>>,
}

impl PendingConfirmation {
    pub fn new(
        confirmation_token: String,
        jar: CookieJar,
        created_at: DateTime<Utc>,
        timeout: Duration,
    ) -> Self {
        let timeout_at = created_at
            + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            confirmation_token,
            created_at,
            timeout_at,
            correlation_id: None,
            jar,
            code_attempts: 0,
            continuation: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.timeout_at
    }

    fn cancel(&mut self) {
        if let Some(task) = self.continuation.take() {
            task.abort();
        }
    }
}

impl Drop for PendingConfirmation {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// At most one [`PendingConfirmation`] per tenant.
#[derive(Default)]
pub struct PendingConfirmations {
    inner: Mutex<HashMap<TenantId, PendingConfirmation>>,
}

impl PendingConfirmations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a pending confirmation, cancelling any earlier one.
    pub fn insert(&self, tenant: &TenantId, pending: PendingConfirmation) {
        let replaced = match self.inner.lock() {
            Ok(mut inner) => inner.insert(tenant.clone(), pending),
            Err(_) => None,
        };
        if replaced.is_some() {
            debug!(tenant = %tenant, "replaced earlier pending confirmation");
        }
        // `replaced` drops here, aborting its continuation.
    }

    /// Attach the task finishing this confirmation. If the confirmation is
    /// gone already, the task is aborted straight away.
    pub fn attach(&self, tenant: &TenantId, token: &str, task: JoinHandle<()>) {
        if let Ok(mut inner) = self.inner.lock() {
            if let Some(pending) = inner
                .get_mut(tenant)
                .filter(|p| p.confirmation_token == token)
            {
                pending.continuation = Some(task);
                return;
            }
        }
        task.abort();
    }

    pub fn set_correlation(&self, tenant: &TenantId, token: &str, correlation_id: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            if let Some(pending) = inner
                .get_mut(tenant)
                .filter(|p| p.confirmation_token == token)
            {
                pending.correlation_id = Some(correlation_id.to_string());
            }
        }
    }

    /// Jar and attempt count of a live confirmation; expired ones are dropped.
    pub(crate) fn snapshot(&self, tenant: &TenantId, now: DateTime<Utc>) -> Option<(String, CookieJar, u32)> {
        let mut inner = self.inner.lock().ok()?;
        if inner.get(tenant).map(|p| p.is_expired(now)).unwrap_or(false) {
            inner.remove(tenant);
            return None;
        }
        inner
            .get(tenant)
            .map(|p| (p.confirmation_token.clone(), p.jar.clone(), p.code_attempts))
    }

    /// Record a rejected code and the jar after the attempt.
    pub(crate) fn record_attempt(&self, tenant: &TenantId, token: &str, jar: CookieJar) -> u32 {
        let Ok(mut inner) = self.inner.lock() else {
            return 0;
        };
        match inner
            .get_mut(tenant)
            .filter(|p| p.confirmation_token == token)
        {
            Some(pending) => {
                pending.jar = jar;
                pending.code_attempts += 1;
                pending.code_attempts
            }
            None => 0,
        }
    }

    /// Remove the confirmation for `tenant` if it still carries `token`.
    /// Dropping the returned value aborts its continuation.
    pub(crate) fn take(&self, tenant: &TenantId, token: &str) -> Option<PendingConfirmation> {
        let mut inner = self.inner.lock().ok()?;
        if inner
            .get(tenant)
            .map(|p| p.confirmation_token == token)
            .unwrap_or(false)
        {
            return inner.remove(tenant);
        }
        None
    }

    /// Like [`take`](Self::take), but detaches the continuation instead of
    /// aborting it. Used by the continuation task itself.
    pub(crate) fn finish(&self, tenant: &TenantId, token: &str) -> bool {
        match self.take(tenant, token) {
            Some(mut pending) => {
                pending.continuation.take();
                true
            }
            None => false,
        }
    }

    /// Remove and cancel the confirmation for `tenant`.
    pub fn cancel(&self, tenant: &TenantId) -> bool {
        let removed = match self.inner.lock() {
            Ok(mut inner) => inner.remove(tenant),
            Err(_) => None,
        };
        removed.is_some()
    }

    pub fn contains(&self, tenant: &TenantId) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.contains_key(tenant))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant() -> TenantId {
        TenantId::new("school-1").unwrap()
    }

    #[test]
    fn hide_id_fixed_vectors() {
        assert_eq!(hide_id(""), "");
        // 'a'=97+0, 'b'=98+1, 'c'=99+2
        assert_eq!(hide_id("abc"), "097099101");
        // position offsets wrap every ten characters
        assert_eq!(hide_id("00000000000"), "048049050051052053054055056057048");
    }

    #[test]
    fn mask_peer_id_keeps_edges() {
        assert_eq!(mask_peer_id("Xy7_kQ9zAb"), "Xy******Ab");
        assert_eq!(mask_peer_id("abcd"), "****");
        assert_eq!(mask_peer_id(""), "");
    }

    #[tokio::test]
    async fn deliver_resolves_matching_waiter() {
        let hub = ConfirmationHub::new("devamEt");
        let waiter = hub.register("peer-1");
        assert_eq!(hub.waiting(), 1);

        assert!(!hub.deliver("peer-2", "nope"));
        assert!(hub.handle_event(&ChannelEvent {
            event: "devamEt".to_string(),
            id: "peer-1".to_string(),
            param: Some("p-77".to_string()),
        }));

        let param = waiter.wait(&tenant(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(param, "p-77");
        assert_eq!(hub.waiting(), 0);
    }

    #[tokio::test]
    async fn other_events_are_ignored() {
        let hub = ConfirmationHub::new("devamEt");
        let _waiter = hub.register("peer-1");
        assert!(!hub.handle_event(&ChannelEvent {
            event: "baska".to_string(),
            id: "peer-1".to_string(),
            param: None,
        }));
        assert_eq!(hub.waiting(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_and_unregisters() {
        let hub = ConfirmationHub::new("devamEt");
        let waiter = hub.register("peer-1");
        let err = waiter
            .wait(&tenant(), Duration::from_secs(150))
            .await
            .unwrap_err();
        assert!(matches!(err, PortalError::ConfirmationTimeout { .. }));
        assert_eq!(hub.waiting(), 0);
        assert!(!hub.deliver("peer-1", "late"));
    }

    #[tokio::test]
    async fn one_pending_per_tenant() {
        let pending = PendingConfirmations::new();
        let now = Utc::now();
        let first_task = tokio::spawn(std::future::pending::<()>());
        let first_abort = first_task.abort_handle();

        pending.insert(
            &tenant(),
            PendingConfirmation::new("t1".into(), CookieJar::new(), now, Duration::from_secs(150)),
        );
        pending.attach(&tenant(), "t1", first_task);
        pending.insert(
            &tenant(),
            PendingConfirmation::new("t2".into(), CookieJar::new(), now, Duration::from_secs(150)),
        );

        assert_eq!(pending.len(), 1);
        tokio::task::yield_now().await;
        assert!(first_abort.is_finished());
        let (token, _, attempts) = pending.snapshot(&tenant(), now).unwrap();
        assert_eq!(token, "t2");
        assert_eq!(attempts, 0);
        // A stale token can't finish the newer confirmation.
        assert!(!pending.finish(&tenant(), "t1"));
        assert!(pending.finish(&tenant(), "t2"));
        assert!(pending.is_empty());
    }

    #[test]
    fn expired_pending_is_dropped_on_snapshot() {
        let pending = PendingConfirmations::new();
        let now = Utc::now();
        pending.insert(
            &tenant(),
            PendingConfirmation::new("t1".into(), CookieJar::new(), now, Duration::from_secs(150)),
        );
        let later = now + chrono::Duration::seconds(151);
        assert!(pending.snapshot(&tenant(), later).is_none());
        assert!(!pending.contains(&tenant()));
    }
}
