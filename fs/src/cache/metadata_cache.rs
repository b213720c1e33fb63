//! Metadata cache: per-parent child-name → kind,
//! generation, size, mtime, with TTL and a bounded entry count;
//! negative entries supported.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use crate::clock::SharedClock;
use fuser::FileType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataValue {
    pub kind: FileType,
    pub generation: u64,
    pub size: u64,
    pub mtime_unix: i64,
}

#[derive(Debug, Clone)]
enum Entry {
    Positive(MetadataValue),
    Negative,
}

struct Slot {
    entry: Entry,
    expires_at: Option<Instant>,
}

/// `ttl == 0` disables the cache outright (never inserts, never
/// returns a hit). `ttl < 0` means "never expires", represented here
/// as `expires_at = None`.
#[derive(Debug, Clone, Copy)]
pub enum Ttl {
    Disabled,
    Duration(Duration),
    Forever,
}

impl Ttl {
    pub fn from_seconds(secs: i64) -> Self {
        if secs == 0 {
            Ttl::Disabled
        } else if secs < 0 {
            Ttl::Forever
        } else {
            Ttl::Duration(Duration::from_secs(secs as u64))
        }
    }
}

pub struct MetadataCache {
    inner: Mutex<LruCache<(u64, String), Slot>>,
    ttl: Ttl,
    clock: SharedClock,
}

impl MetadataCache {
    pub fn new(capacity: usize, ttl: Ttl, clock: SharedClock) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Mutex::new(LruCache::new(cap)),
            ttl,
            clock,
        }
    }

    pub fn get(&self, parent: u64, name: &str) -> Option<Entry> {
        if matches!(self.ttl, Ttl::Disabled) {
            return None;
        }
        let mut guard = self.inner.lock();
        let key = (parent, name.to_string());
        let now = self.clock.now();
        let expired = guard
            .peek(&key)
            .map(|slot| slot.expires_at.is_some_and(|exp| exp <= now))
            .unwrap_or(false);
        if expired {
            guard.pop(&key);
            return None;
        }
        guard.get(&key).map(|slot| slot.entry.clone())
    }

    pub fn put_positive(&self, parent: u64, name: &str, value: MetadataValue) {
        self.insert(parent, name, Entry::Positive(value));
    }

    pub fn put_negative(&self, parent: u64, name: &str) {
        self.insert(parent, name, Entry::Negative);
    }

    fn insert(&self, parent: u64, name: &str, entry: Entry) {
        if matches!(self.ttl, Ttl::Disabled) {
            return;
        }
        let expires_at = match self.ttl {
            Ttl::Disabled => unreachable!(),
            Ttl::Forever => None,
            Ttl::Duration(d) => Some(self.clock.now() + d),
        };
        self.inner
            .lock()
            .put((parent, name.to_string()), Slot { entry, expires_at });
    }

    pub fn invalidate(&self, parent: u64, name: &str) {
        self.inner.lock().pop(&(parent, name.to_string()));
    }

    /// Invalidates every entry for a given parent, used when a
    /// directory's contents change (create/unlink/rename touch the
    /// parent's children set).
    pub fn invalidate_parent(&self, parent: u64) {
        let mut guard = self.inner.lock();
        let dead: Vec<_> = guard
            .iter()
            .filter(|((p, _), _)| *p == parent)
            .map(|(k, _)| k.clone())
            .collect();
        for k in dead {
            guard.pop(&k);
        }
    }
}

pub use Entry as MetadataEntry;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;

    fn value(generation: u64) -> MetadataValue {
        MetadataValue {
            kind: FileType::RegularFile,
            generation,
            size: 4096,
            mtime_unix: 0,
        }
    }

    #[test]
    fn positive_entry_round_trips() {
        let clock = FakeClock::new();
        let cache = MetadataCache::new(4, Ttl::Duration(Duration::from_secs(30)), clock);
        cache.put_positive(1, "foo", value(7));
        match cache.get(1, "foo") {
            Some(Entry::Positive(v)) => assert_eq!(v.generation, 7),
            other => panic!("expected positive entry, got {other:?}"),
        }
    }

    #[test]
    fn negative_entry_round_trips() {
        let clock = FakeClock::new();
        let cache = MetadataCache::new(4, Ttl::Duration(Duration::from_secs(30)), clock);
        cache.put_negative(1, "missing");
        assert!(matches!(cache.get(1, "missing"), Some(Entry::Negative)));
    }

    #[test]
    fn ttl_expiry_evicts_on_read() {
        let clock = FakeClock::new();
        let cache = MetadataCache::new(4, Ttl::Duration(Duration::from_secs(10)), clock.clone());
        cache.put_positive(1, "foo", value(1));
        clock.advance(Duration::from_secs(11));
        assert!(cache.get(1, "foo").is_none());
    }

    #[test]
    fn ttl_disabled_never_caches() {
        let clock = FakeClock::new();
        let cache = MetadataCache::new(4, Ttl::Disabled, clock);
        cache.put_positive(1, "foo", value(1));
        assert!(cache.get(1, "foo").is_none());
    }

    #[test]
    fn capacity_evicts_lru_entry() {
        let clock = FakeClock::new();
        let cache = MetadataCache::new(1, Ttl::Forever, clock);
        cache.put_positive(1, "foo", value(1));
        cache.put_positive(1, "bar", value(2));
        assert!(cache.get(1, "foo").is_none());
        assert!(matches!(cache.get(1, "bar"), Some(Entry::Positive(_))));
    }

    #[test]
    fn invalidate_parent_clears_only_that_parents_entries() {
        let clock = FakeClock::new();
        let cache = MetadataCache::new(8, Ttl::Forever, clock);
        cache.put_positive(1, "foo", value(1));
        cache.put_positive(2, "bar", value(2));
        cache.invalidate_parent(1);
        assert!(cache.get(1, "foo").is_none());
        assert!(cache.get(2, "bar").is_some());
    }
}
