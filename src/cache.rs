//! Listing cache
//!
//! Memoizes the last listing fetched per (profile, bucket, prefix). All
//! access goes through one mutex. Each (profile, bucket) pair carries an
//! epoch that every invalidation bumps; a fetch records the epoch before it
//! goes to the network and its result is discarded if the epoch moved, so an
//! invalidation always wins over a fetch that started before it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use crate::s3::types::{KeyPrefix, ListingEntry};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub profile: String,
    pub bucket: String,
    pub prefix: KeyPrefix,
}

impl CacheKey {
    pub fn new(profile: &str, bucket: &str, prefix: &KeyPrefix) -> Self {
        Self {
            profile: profile.to_string(),
            bucket: bucket.to_string(),
            prefix: prefix.clone(),
        }
    }
}

/// An immutable listing snapshot
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub entries: Arc<Vec<ListingEntry>>,
    pub fetched_at: SystemTime,
}

/// Proof of the bucket epoch observed when a fetch started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket(u64);

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<CacheKey, CacheEntry>,
    epochs: HashMap<(String, String), u64>,
    profile_epochs: HashMap<String, u64>,
}

impl Inner {
    /// Both counters only grow, so their sum changes whenever either does
    fn epoch(&self, profile: &str, bucket: &str) -> u64 {
        let bucket_epoch = self
            .epochs
            .get(&(profile.to_string(), bucket.to_string()))
            .copied()
            .unwrap_or(0);
        bucket_epoch + self.profile_epochs.get(profile).copied().unwrap_or(0)
    }

    fn bump(&mut self, profile: &str, bucket: &str) {
        *self
            .epochs
            .entry((profile.to_string(), bucket.to_string()))
            .or_insert(0) += 1;
    }
}

/// Shared listing cache. Clones refer to the same storage.
#[derive(Debug, Clone, Default)]
pub struct ListingCache {
    inner: Arc<Mutex<Inner>>,
}

impl ListingCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, profile: &str, bucket: &str, prefix: &KeyPrefix) -> Option<CacheEntry> {
        self.lock()
            .entries
            .get(&CacheKey::new(profile, bucket, prefix))
            .cloned()
    }

    /// Store a listing unconditionally, replacing any prior entry
    pub fn put(&self, profile: &str, bucket: &str, prefix: &KeyPrefix, entries: Vec<ListingEntry>) {
        self.lock().entries.insert(
            CacheKey::new(profile, bucket, prefix),
            CacheEntry {
                entries: Arc::new(entries),
                fetched_at: SystemTime::now(),
            },
        );
    }

    /// Record the current epoch before fetching a listing
    pub fn begin_fetch(&self, profile: &str, bucket: &str) -> FetchTicket {
        FetchTicket(self.lock().epoch(profile, bucket))
    }

    /// Store a fetched listing unless an invalidation happened since
    /// `ticket` was taken. Returns whether the listing was stored.
    pub fn put_fetched(
        &self,
        ticket: FetchTicket,
        profile: &str,
        bucket: &str,
        prefix: &KeyPrefix,
        entries: Vec<ListingEntry>,
    ) -> bool {
        let mut inner = self.lock();
        if inner.epoch(profile, bucket) != ticket.0 {
            tracing::debug!(
                "Discarding stale listing for {}/{} (invalidated during fetch)",
                bucket,
                prefix
            );
            return false;
        }
        inner.entries.insert(
            CacheKey::new(profile, bucket, prefix),
            CacheEntry {
                entries: Arc::new(entries),
                fetched_at: SystemTime::now(),
            },
        );
        true
    }

    /// Remove the entry for `prefix`; with `recursive`, also every entry
    /// below it.
    pub fn invalidate(&self, profile: &str, bucket: &str, prefix: &KeyPrefix, recursive: bool) {
        let mut inner = self.lock();
        inner.bump(profile, bucket);
        inner.entries.retain(|key, _| {
            let same_bucket = key.profile == profile && key.bucket == bucket;
            let hit = if recursive {
                prefix.contains(&key.prefix)
            } else {
                key.prefix == *prefix
            };
            !(same_bucket && hit)
        });
        tracing::debug!(
            "Invalidated {}/{}{}",
            bucket,
            prefix,
            if recursive { " (recursive)" } else { "" }
        );
    }

    /// Invalidate the level holding `key` and every level above it
    pub fn invalidate_key(&self, profile: &str, bucket: &str, key: &str) {
        for level in KeyPrefix::parent_of_key(key).ancestors() {
            self.invalidate(profile, bucket, &level, false);
        }
    }

    /// Invalidate everything under `prefix` and every level above it
    pub fn invalidate_tree(&self, profile: &str, bucket: &str, prefix: &KeyPrefix) {
        self.invalidate(profile, bucket, prefix, true);
        for level in prefix.ancestors().into_iter().skip(1) {
            self.invalidate(profile, bucket, &level, false);
        }
    }

    /// Drop everything cached for a profile
    pub fn clear_profile(&self, profile: &str) {
        let mut inner = self.lock();
        inner.entries.retain(|key, _| key.profile != profile);
        *inner.profile_epochs.entry(profile.to_string()).or_insert(0) += 1;
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::s3::types::FolderEntry;

    fn prefix(p: &str) -> KeyPrefix {
        KeyPrefix::parse(p).unwrap()
    }

    fn listing(name: &str) -> Vec<ListingEntry> {
        vec![ListingEntry::Folder(FolderEntry {
            name: name.to_string(),
            prefix: format!("{}/", name),
        })]
    }

    #[test]
    fn test_get_put_replace() {
        let cache = ListingCache::new();
        assert!(cache.get("work", "assets", &prefix("")).is_none());

        cache.put("work", "assets", &prefix(""), listing("a"));
        cache.put("work", "assets", &prefix(""), listing("b"));
        let hit = cache.get("work", "assets", &prefix("")).unwrap();
        assert_eq!(hit.entries[0].name(), "b");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_keys_are_scoped_by_profile_and_bucket() {
        let cache = ListingCache::new();
        cache.put("work", "assets", &prefix(""), listing("a"));
        assert!(cache.get("home", "assets", &prefix("")).is_none());
        assert!(cache.get("work", "other", &prefix("")).is_none());
    }

    #[test]
    fn test_invalidate_exact_only() {
        let cache = ListingCache::new();
        cache.put("work", "assets", &prefix("docs/"), listing("a"));
        cache.put("work", "assets", &prefix("docs/sub/"), listing("b"));
        cache.invalidate("work", "assets", &prefix("docs/"), false);
        assert!(cache.get("work", "assets", &prefix("docs/")).is_none());
        assert!(cache.get("work", "assets", &prefix("docs/sub/")).is_some());
    }

    #[test]
    fn test_invalidate_recursive_drops_descendants() {
        let cache = ListingCache::new();
        cache.put("work", "assets", &prefix("docs/"), listing("a"));
        cache.put("work", "assets", &prefix("docs/sub/"), listing("b"));
        cache.put("work", "assets", &prefix("docsets/"), listing("c"));
        cache.put("work", "assets", &prefix(""), listing("root"));
        cache.invalidate("work", "assets", &prefix("docs/"), true);
        assert!(cache.get("work", "assets", &prefix("docs/")).is_none());
        assert!(cache.get("work", "assets", &prefix("docs/sub/")).is_none());
        assert!(cache.get("work", "assets", &prefix("docsets/")).is_some());
        assert!(cache.get("work", "assets", &prefix("")).is_some());
    }

    #[test]
    fn test_invalidate_key_clears_ancestors() {
        let cache = ListingCache::new();
        cache.put("work", "assets", &prefix(""), listing("root"));
        cache.put("work", "assets", &prefix("a/"), listing("a"));
        cache.put("work", "assets", &prefix("a/b/"), listing("b"));
        cache.put("work", "assets", &prefix("a/b/c/"), listing("c"));
        cache.invalidate_key("work", "assets", "a/b/new.txt");
        assert!(cache.get("work", "assets", &prefix("")).is_none());
        assert!(cache.get("work", "assets", &prefix("a/")).is_none());
        assert!(cache.get("work", "assets", &prefix("a/b/")).is_none());
        assert!(cache.get("work", "assets", &prefix("a/b/c/")).is_some());
    }

    #[test]
    fn test_invalidation_wins_over_inflight_fetch() {
        let cache = ListingCache::new();
        let ticket = cache.begin_fetch("work", "assets");
        cache.invalidate("work", "assets", &prefix("docs/"), false);
        let stored = cache.put_fetched(ticket, "work", "assets", &prefix("docs/"), listing("stale"));
        assert!(!stored);
        assert!(cache.get("work", "assets", &prefix("docs/")).is_none());

        let fresh = cache.begin_fetch("work", "assets");
        assert!(cache.put_fetched(fresh, "work", "assets", &prefix("docs/"), listing("fresh")));
    }

    #[test]
    fn test_other_bucket_invalidation_does_not_block_fetch() {
        let cache = ListingCache::new();
        let ticket = cache.begin_fetch("work", "assets");
        cache.invalidate("work", "logs", &prefix(""), true);
        assert!(cache.put_fetched(ticket, "work", "assets", &prefix(""), listing("a")));
    }

    #[test]
    fn test_clear_profile() {
        let cache = ListingCache::new();
        cache.put("work", "assets", &prefix(""), listing("a"));
        cache.put("home", "assets", &prefix(""), listing("b"));
        let ticket = cache.begin_fetch("work", "assets");
        cache.clear_profile("work");
        assert!(cache.get("work", "assets", &prefix("")).is_none());
        assert!(cache.get("home", "assets", &prefix("")).is_some());
        assert!(!cache.put_fetched(ticket, "work", "assets", &prefix(""), listing("late")));
    }
}
