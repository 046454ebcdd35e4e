use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;

use crate::models::TenantId;

/// One tracked session.
#[derive(Debug)]
pub struct KeepAliveEntry {
    pub tenant_id: TenantId,
    /// Cookie the entry was registered or last pinged with.
    pub cookie_jar: String,
    pub failure_count: u32,
    /// Jitter drawn at registration.
    pub offset: Duration,
    pub(crate) page_index: usize,
    pub(crate) generation: u64,
    task: Option<JoinHandle<()>>,
}

impl KeepAliveEntry {
    pub(crate) fn new(tenant_id: TenantId, cookie_jar: String, offset: Duration, generation: u64) -> Self {
        Self {
            tenant_id,
            cookie_jar,
            failure_count: 0,
            offset,
            page_index: 0,
            generation,
            task: None,
        }
    }

    pub(crate) fn set_task(&mut self, task: JoinHandle<()>) {
        self.task = Some(task);
    }

    /// Forget the timer task without cancelling it.
    pub(crate) fn detach(&mut self) {
        self.task.take();
    }
}

impl Drop for KeepAliveEntry {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Tracked sessions by tenant.
///
/// Dropping an entry cancels its timer, so removing from the map is enough
/// to stop a session's pings.
#[derive(Debug, Default)]
pub struct KeepAliveRegistry {
    entries: HashMap<TenantId, KeepAliveEntry>,
    next_generation: u64,
}

impl KeepAliveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, tenant: &TenantId) -> bool {
        self.entries.contains_key(tenant)
    }

    pub fn get(&self, tenant: &TenantId) -> Option<&KeepAliveEntry> {
        self.entries.get(tenant)
    }

    pub(crate) fn get_mut(&mut self, tenant: &TenantId) -> Option<&mut KeepAliveEntry> {
        self.entries.get_mut(tenant)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn tenants(&self) -> Vec<TenantId> {
        let mut tenants: Vec<TenantId> = self.entries.keys().cloned().collect();
        tenants.sort();
        tenants
    }

    pub fn offsets(&self) -> Vec<Duration> {
        self.entries.values().map(|e| e.offset).collect()
    }

    pub(crate) fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Insert an entry, cancelling the timer of any entry it replaces.
    pub(crate) fn insert(&mut self, entry: KeepAliveEntry) {
        self.entries.insert(entry.tenant_id.clone(), entry);
    }

    /// Remove and cancel.
    pub(crate) fn remove(&mut self, tenant: &TenantId) -> bool {
        self.entries.remove(tenant).is_some()
    }

    /// Remove the entry if it still belongs to `generation`, leaving its
    /// timer task running. Used by the timer task itself.
    pub(crate) fn remove_current(&mut self, tenant: &TenantId, generation: u64) -> bool {
        if self.is_current(tenant, generation) {
            if let Some(mut entry) = self.entries.remove(tenant) {
                entry.detach();
                return true;
            }
        }
        false
    }

    pub(crate) fn is_current(&self, tenant: &TenantId, generation: u64) -> bool {
        self.entries
            .get(tenant)
            .map(|e| e.generation == generation)
            .unwrap_or(false)
    }

    /// Cancel every timer.
    pub(crate) fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    /// A jitter in `[0, range)` not used by another entry.
    pub(crate) fn draw_offset(&self, range: Duration) -> Duration {
        let taken = self.offsets();
        let mut offset = jitter(Duration::ZERO, range);
        for _ in 0..16 {
            if !taken.contains(&offset) {
                break;
            }
            offset = jitter(Duration::ZERO, range);
        }
        offset
    }
}

/// Uniform in `[min, max)` at millisecond resolution; `min` if the range is
/// empty.
pub fn jitter(min: Duration, max: Duration) -> Duration {
    let min_ms = min.as_millis().min(u128::from(u64::MAX)) as u64;
    let max_ms = max.as_millis().min(u128::from(u64::MAX)) as u64;
    if max_ms <= min_ms {
        return min;
    }
    Duration::from_millis(rand::thread_rng().gen_range(min_ms..max_ms))
}
