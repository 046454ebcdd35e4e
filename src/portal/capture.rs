//! Bounded, TTL-evicting store of captured portal pages.
//!
//! When a page fails to parse, the body is kept here under a fresh id so an
//! operator can inspect exactly what the portal served. The cache is owned by
//! whoever builds the [`PortalHttpClient`](super::PortalHttpClient) and is
//! shared by reference.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::error::Step;
use crate::models::TenantId;

#[derive(Debug, Clone)]
pub struct CapturedPage {
    pub id: Uuid,
    pub tenant: TenantId,
    pub step: Step,
    pub body: String,
    captured_at: Instant,
}

#[derive(Debug)]
pub struct CaptureCache {
    capacity: usize,
    ttl: Duration,
    entries: Mutex<VecDeque<CapturedPage>>,
}

impl CaptureCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Store a page and return its id. With zero capacity nothing is kept.
    pub fn capture(&self, tenant: &TenantId, step: Step, body: &str) -> Option<Uuid> {
        if self.capacity == 0 {
            return None;
        }

        let id = Uuid::new_v4();
        let mut entries = self.entries.lock().ok()?;
        Self::evict_expired(&mut entries, self.ttl);
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(CapturedPage {
            id,
            tenant: tenant.clone(),
            step,
            body: body.to_string(),
            captured_at: Instant::now(),
        });
        Some(id)
    }

    pub fn get(&self, id: &Uuid) -> Option<CapturedPage> {
        let mut entries = self.entries.lock().ok()?;
        Self::evict_expired(&mut entries, self.ttl);
        entries.iter().find(|page| &page.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        match self.entries.lock() {
            Ok(mut entries) => {
                Self::evict_expired(&mut entries, self.ttl);
                entries.len()
            }
            Err(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Entries are in insertion order, so expired ones are at the front.
    fn evict_expired(entries: &mut VecDeque<CapturedPage>, ttl: Duration) {
        while let Some(front) = entries.front() {
            if front.captured_at.elapsed() >= ttl {
                entries.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant() -> TenantId {
        TenantId::new("school-1").unwrap()
    }

    #[test]
    fn oldest_entry_is_dropped_at_capacity() {
        let cache = CaptureCache::new(2, Duration::from_secs(60));
        let first = cache.capture(&tenant(), Step::RecordsPostback, "<a/>").unwrap();
        let second = cache.capture(&tenant(), Step::RecordsPostback, "<b/>").unwrap();
        let third = cache.capture(&tenant(), Step::RecordsPostback, "<c/>").unwrap();

        assert!(cache.get(&first).is_none());
        assert_eq!(cache.get(&second).unwrap().body, "<b/>");
        assert_eq!(cache.get(&third).unwrap().body, "<c/>");
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = CaptureCache::new(4, Duration::from_millis(0));
        let id = cache.capture(&tenant(), Step::HomeCheck, "<html/>").unwrap();
        assert!(cache.get(&id).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn zero_capacity_keeps_nothing() {
        let cache = CaptureCache::new(0, Duration::from_secs(60));
        assert!(cache.capture(&tenant(), Step::HomeCheck, "x").is_none());
    }
}
