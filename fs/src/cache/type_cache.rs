//! Type cache: per-parent child-name → {file, directory}
//! tag, TTL + LRU, used to disambiguate a file-vs-directory name clash
//! before issuing a `stat` so the caller knows which object name
//! (`foo` or `foo/`) to probe.

use std::num::NonZeroUsize;
use std::time::Instant;

use lru::LruCache;
use parking_lot::Mutex;

use super::metadata_cache::Ttl;
use crate::clock::SharedClock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    File,
    Directory,
}

struct Slot {
    kind: EntryType,
    expires_at: Option<Instant>,
}

/// One LRU+TTL map per parent directory, so the "max entries per
/// directory" bound is enforced per-parent rather than
/// globally. A capacity of 0 means every lookup bypasses the cache.
pub struct TypeCache {
    per_parent: Mutex<std::collections::HashMap<u64, LruCache<String, Slot>>>,
    capacity_per_parent: usize,
    ttl: Ttl,
    clock: SharedClock,
}

impl TypeCache {
    pub fn new(capacity_per_parent: usize, ttl: Ttl, clock: SharedClock) -> Self {
        Self {
            per_parent: Mutex::new(std::collections::HashMap::new()),
            capacity_per_parent,
            ttl,
            clock,
        }
    }

    pub fn get(&self, parent: u64, name: &str) -> Option<EntryType> {
        if self.capacity_per_parent == 0 || matches!(self.ttl, Ttl::Disabled) {
            return None;
        }
        let mut guard = self.per_parent.lock();
        let cache = guard.get_mut(&parent)?;
        let now = self.clock.now();
        let expired = cache
            .peek(name)
            .map(|s| s.expires_at.is_some_and(|e| e <= now))
            .unwrap_or(false);
        if expired {
            cache.pop(name);
            return None;
        }
        cache.get(name).map(|s| s.kind)
    }

    pub fn put(&self, parent: u64, name: &str, kind: EntryType) {
        if self.capacity_per_parent == 0 || matches!(self.ttl, Ttl::Disabled) {
            return;
        }
        let expires_at = match self.ttl {
            Ttl::Disabled => unreachable!(),
            Ttl::Forever => None,
            Ttl::Duration(d) => Some(self.clock.now() + d),
        };
        let mut guard = self.per_parent.lock();
        let cap = NonZeroUsize::new(self.capacity_per_parent).unwrap();
        let cache = guard.entry(parent).or_insert_with(|| LruCache::new(cap));
        cache.put(name.to_string(), Slot { kind, expires_at });
    }

    pub fn invalidate(&self, parent: u64, name: &str) {
        if let Some(cache) = self.per_parent.lock().get_mut(&parent) {
            cache.pop(name);
        }
    }

    pub fn invalidate_parent(&self, parent: u64) {
        self.per_parent.lock().remove(&parent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use std::time::Duration;

    #[test]
    fn capacity_one_evicts_oldest() {
        let clock = FakeClock::new();
        let cache = TypeCache::new(1, Ttl::Duration(Duration::from_secs(30)), clock.clone());
        cache.put(1, "foo", EntryType::File);
        assert_eq!(cache.get(1, "foo"), Some(EntryType::File));

        cache.put(1, "bar", EntryType::File);
        assert_eq!(cache.get(1, "foo"), None);
        assert_eq!(cache.get(1, "bar"), Some(EntryType::File));

        cache.put(1, "foo", EntryType::Directory);
        assert_eq!(cache.get(1, "foo"), Some(EntryType::Directory));
    }

    #[test]
    fn ttl_expiry() {
        let clock = FakeClock::new();
        let cache = TypeCache::new(4, Ttl::Duration(Duration::from_secs(10)), clock.clone());
        cache.put(1, "foo", EntryType::File);
        clock.advance(Duration::from_secs(11));
        assert_eq!(cache.get(1, "foo"), None);
    }
}
