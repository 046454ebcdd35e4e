//! Periodic keep-alive pings for every tracked portal session.
//!
//! Each session has its own timer task; the tasks share nothing but the
//! registry, and every registry change happens under its one lock. A task
//! carries the generation it was spawned for and stops as soon as its entry
//! was replaced or removed, so a late wake-up can never touch a newer entry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::KeepAliveConfig;
use crate::error::PortalError;
use crate::models::{PortalSession, TenantId};
use crate::portal::validity::{CheckOutcome, SessionCheck};
use crate::storage::SessionStore;

use super::registry::{jitter, KeepAliveEntry, KeepAliveRegistry};

/// What a rescan did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RescanReport {
    pub registered: usize,
    pub revalidated: usize,
    pub unchanged: usize,
    pub invalid: usize,
}

pub struct KeepAliveScheduler {
    inner: Arc<Inner>,
    rescan_task: StdMutex<Option<JoinHandle<()>>>,
}

struct Inner {
    checker: Arc<dyn SessionCheck>,
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    config: KeepAliveConfig,
    registry: Mutex<KeepAliveRegistry>,
    /// Abort handles of live timer tasks, reachable without the async lock.
    timers: StdMutex<Vec<AbortHandle>>,
    stopped: AtomicBool,
}

impl KeepAliveScheduler {
    pub fn new(
        checker: Arc<dyn SessionCheck>,
        store: Arc<dyn SessionStore>,
        clock: Arc<dyn Clock>,
        config: KeepAliveConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                checker,
                store,
                clock,
                config,
                registry: Mutex::new(KeepAliveRegistry::new()),
                timers: StdMutex::new(Vec::new()),
                stopped: AtomicBool::new(false),
            }),
            rescan_task: StdMutex::new(None),
        }
    }

    /// Bootstrap from the store, then rescan on the configured interval.
    pub async fn start(&self) -> Result<usize> {
        let registered = self.bootstrap().await?;

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let period = inner.config.rescan_interval.max(Duration::from_secs(1));
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately; bootstrap already ran.
            interval.tick().await;
            loop {
                interval.tick().await;
                match inner.rescan().await {
                    Ok(report) => info!(?report, "keep-alive rescan"),
                    Err(err) => warn!(error = %err, "keep-alive rescan failed"),
                }
            }
        });
        if let Ok(mut slot) = self.rescan_task.lock() {
            if let Some(previous) = slot.replace(task) {
                previous.abort();
            }
        }
        Ok(registered)
    }

    /// Validate and register sessions logged in today, or the most recently
    /// active ones if nobody logged in today.
    pub async fn bootstrap(&self) -> Result<usize> {
        self.inner.bootstrap().await
    }

    pub async fn rescan(&self) -> Result<RescanReport> {
        self.inner.rescan().await
    }

    /// Start pinging `tenant` with `cookie_jar`, replacing any earlier entry.
    pub async fn register(&self, tenant: &TenantId, cookie_jar: &str) -> bool {
        self.inner.register(tenant, cookie_jar).await
    }

    pub async fn remove(&self, tenant: &TenantId) -> bool {
        self.inner.registry.lock().await.remove(tenant)
    }

    pub async fn has(&self, tenant: &TenantId) -> bool {
        self.inner.registry.lock().await.has(tenant)
    }

    pub async fn len(&self) -> usize {
        self.inner.registry.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn tenants(&self) -> Vec<TenantId> {
        self.inner.registry.lock().await.tenants()
    }

    pub async fn offsets(&self) -> Vec<Duration> {
        self.inner.registry.lock().await.offsets()
    }

    pub async fn failure_count(&self, tenant: &TenantId) -> Option<u32> {
        self.inner
            .registry
            .lock()
            .await
            .get(tenant)
            .map(|e| e.failure_count)
    }

    /// Cancel the rescan timer and every session timer. Nothing fires after
    /// this returns.
    pub async fn shutdown(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        if let Ok(mut slot) = self.rescan_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
        let cancelled = self.inner.registry.lock().await.clear();
        self.inner.abort_timers();
        info!(cancelled, "keep-alive scheduler stopped");
    }
}

impl Drop for KeepAliveScheduler {
    fn drop(&mut self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        if let Ok(mut slot) = self.rescan_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
        // Timer tasks hold `inner`, so they must be aborted here; the async
        // registry lock may be held by one of them.
        self.inner.abort_timers();
        if let Ok(mut registry) = self.inner.registry.try_lock() {
            registry.clear();
        }
    }
}

impl Inner {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn track_timer(&self, handle: AbortHandle) {
        if let Ok(mut timers) = self.timers.lock() {
            timers.retain(|timer| !timer.is_finished());
            timers.push(handle);
        }
    }

    fn abort_timers(&self) {
        if let Ok(mut timers) = self.timers.lock() {
            for timer in timers.drain(..) {
                timer.abort();
            }
        }
    }

    async fn bootstrap(self: &Arc<Self>) -> Result<usize> {
        let sessions = self.store.list_sessions().await?;
        let candidates = bootstrap_candidates(
            sessions,
            self.clock.today(),
            self.config.bootstrap_limit,
        );
        info!(candidates = candidates.len(), "keep-alive bootstrap");

        let mut registered = 0;
        for (i, session) in candidates.iter().enumerate() {
            if self.is_stopped() {
                break;
            }
            if i > 0 {
                tokio::time::sleep(self.config.validation_delay).await;
            }
            if self.validate_and_register(session).await {
                registered += 1;
            }
        }
        Ok(registered)
    }

    async fn rescan(self: &Arc<Self>) -> Result<RescanReport> {
        let sessions = self.store.list_sessions().await?;
        let mut report = RescanReport::default();
        let mut validated_any = false;

        for session in sessions.iter().filter(|s| s.is_valid && s.has_cookie()) {
            if self.is_stopped() {
                break;
            }
            let tracked_cookie = self
                .registry
                .lock()
                .await
                .get(&session.tenant_id)
                .map(|e| e.cookie_jar.clone());
            if tracked_cookie.as_deref() == Some(session.cookie_jar.as_str()) {
                report.unchanged += 1;
                continue;
            }

            if validated_any {
                tokio::time::sleep(self.config.validation_delay).await;
            }
            validated_any = true;

            let registered = self.validate_and_register(session).await;
            match (registered, tracked_cookie.is_some()) {
                (true, true) => report.revalidated += 1,
                (true, false) => report.registered += 1,
                (false, _) => report.invalid += 1,
            }
        }
        Ok(report)
    }

    /// Check the stored cookie; register on success, retire on a clear
    /// "not authenticated". Transport errors leave the session alone.
    async fn validate_and_register(self: &Arc<Self>, session: &PortalSession) -> bool {
        let tenant = &session.tenant_id;
        match self.checker.validate(tenant, &session.cookie_jar).await {
            Ok(CheckOutcome {
                authenticated: true,
                cookie_jar,
            }) => {
                if let Err(err) = self.store.touch(tenant, self.clock.now()).await {
                    warn!(tenant = %tenant, error = %err, "failed to record activity");
                }
                self.register(tenant, &cookie_jar).await
            }
            Ok(_) => {
                info!(tenant = %tenant, "stored session no longer authenticated");
                self.registry.lock().await.remove(tenant);
                if let Err(err) = self.store.mark_invalid(tenant).await {
                    warn!(tenant = %tenant, error = %err, "failed to mark session invalid");
                }
                false
            }
            Err(err) => {
                warn!(tenant = %tenant, error = %err, "could not validate session");
                false
            }
        }
    }

    async fn register(self: &Arc<Self>, tenant: &TenantId, cookie_jar: &str) -> bool {
        let mut registry = self.registry.lock().await;
        if self.is_stopped() {
            return false;
        }
        let offset = registry.draw_offset(self.config.refresh_interval);
        let generation = registry.next_generation();
        let mut entry = KeepAliveEntry::new(
            tenant.clone(),
            cookie_jar.to_string(),
            offset,
            generation,
        );

        let inner = Arc::clone(self);
        let task_tenant = tenant.clone();
        let task = tokio::spawn(async move {
            inner.run_entry(task_tenant, generation, offset).await;
        });
        self.track_timer(task.abort_handle());
        entry.set_task(task);
        registry.insert(entry);
        debug!(tenant = %tenant, offset_ms = offset.as_millis() as u64, "keep-alive registered");
        true
    }

    async fn run_entry(self: Arc<Self>, tenant: TenantId, generation: u64, first_delay: Duration) {
        let mut delay = first_delay;
        loop {
            tokio::time::sleep(delay).await;

            let Some((cookie_jar, page)) = self.next_ping(&tenant, generation).await else {
                return;
            };
            let outcome = self.ping_with_retries(&tenant, &cookie_jar, &page).await;
            match self.record_outcome(&tenant, generation, &page, outcome).await {
                Some(next) => delay = next,
                None => return,
            }
        }
    }

    /// Cookie and rotation page for the next ping, advancing the rotation.
    async fn next_ping(&self, tenant: &TenantId, generation: u64) -> Option<(String, String)> {
        let mut registry = self.registry.lock().await;
        if self.is_stopped() || !registry.is_current(tenant, generation) {
            return None;
        }
        let entry = registry.get_mut(tenant)?;
        let pages = &self.config.pages;
        let page = if pages.is_empty() {
            "/".to_string()
        } else {
            pages[entry.page_index % pages.len()].clone()
        };
        entry.page_index = entry.page_index.wrapping_add(1);
        Some((entry.cookie_jar.clone(), page))
    }

    /// Retry connection-class errors along the configured delays; the whole
    /// sequence counts as one ping.
    async fn ping_with_retries(
        &self,
        tenant: &TenantId,
        cookie_jar: &str,
        page: &str,
    ) -> Result<CheckOutcome, PortalError> {
        let mut retries = self.config.retry_delays.iter();
        loop {
            match self.checker.ping(tenant, cookie_jar, page).await {
                Err(err) if err.is_connection_class() => match retries.next() {
                    Some(delay) => {
                        debug!(tenant = %tenant, page, error = %err, retry_in_ms = delay.as_millis() as u64, "keep-alive retry");
                        tokio::time::sleep(*delay).await;
                    }
                    None => return Err(err),
                },
                other => return other,
            }
        }
    }

    /// Apply a ping result. Returns the next delay, or `None` when the entry
    /// is gone.
    async fn record_outcome(
        &self,
        tenant: &TenantId,
        generation: u64,
        page: &str,
        outcome: Result<CheckOutcome, PortalError>,
    ) -> Option<Duration> {
        let refresh = self.config.refresh_interval;
        let mut registry = self.registry.lock().await;
        if self.is_stopped() || !registry.is_current(tenant, generation) {
            return None;
        }

        match outcome {
            Ok(CheckOutcome {
                authenticated: true,
                cookie_jar,
            }) => {
                if let Some(entry) = registry.get_mut(tenant) {
                    entry.failure_count = 0;
                    entry.cookie_jar = cookie_jar;
                }
                drop(registry);
                debug!(tenant = %tenant, page, "keep-alive ok");
                if let Err(err) = self.store.touch(tenant, self.clock.now()).await {
                    warn!(tenant = %tenant, error = %err, "failed to record activity");
                }
                Some(jitter(refresh / 2, refresh))
            }
            failed => {
                let failures = match registry.get_mut(tenant) {
                    Some(entry) => {
                        entry.failure_count += 1;
                        entry.failure_count
                    }
                    None => return None,
                };
                match &failed {
                    Ok(_) => warn!(tenant = %tenant, page, failures, "keep-alive page not authenticated"),
                    Err(err) => warn!(tenant = %tenant, page, failures, error = %err, "keep-alive ping failed"),
                }

                if failures >= self.config.failure_threshold {
                    registry.remove_current(tenant, generation);
                    drop(registry);
                    info!(tenant = %tenant, failures, "keep-alive evicted session");
                    if let Err(err) = self.store.record_failure(tenant, failures).await {
                        warn!(tenant = %tenant, error = %err, "failed to record failure");
                    }
                    if let Err(err) = self.store.mark_invalid(tenant).await {
                        warn!(tenant = %tenant, error = %err, "failed to mark session invalid");
                    }
                    return None;
                }

                drop(registry);
                if let Err(err) = self.store.record_failure(tenant, failures).await {
                    warn!(tenant = %tenant, error = %err, "failed to record failure");
                }
                Some(jitter(refresh / 2, refresh))
            }
        }
    }
}

/// Sessions to validate at startup: cookie-carrying, valid sessions that
/// logged in on `today`; if there are none, the `limit` most recently
/// active ones.
pub fn bootstrap_candidates(
    sessions: Vec<PortalSession>,
    today: chrono::NaiveDate,
    limit: usize,
) -> Vec<PortalSession> {
    let usable: Vec<PortalSession> = sessions
        .into_iter()
        .filter(|s| s.is_valid && s.has_cookie())
        .collect();

    let todays: Vec<PortalSession> = usable
        .iter()
        .filter(|s| s.logged_in_on(today))
        .cloned()
        .collect();
    if !todays.is_empty() {
        return todays;
    }

    let mut recent = usable;
    recent.sort_by(|a, b| {
        let a_at = a.last_activity_at.or(a.last_login_at);
        let b_at = b.last_activity_at.or(b.last_login_at);
        b_at.cmp(&a_at)
    });
    recent.truncate(limit);
    recent
}
