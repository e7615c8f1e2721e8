// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A size-bounded, strictly-promoting LRU cache for small file bodies.
//!
//! Worker-scoped: each worker process owns exactly one `FileCache`, sized to
//! `cache_size_mb * 1 MiB` from its [`crate::config::ServerConfig`]. It is never process-global
//! state; [`crate::worker::run`] holds it behind an `Arc` and passes it explicitly to each
//! handler invocation.

use std::sync::Mutex;

use lru::LruCache;

/// Hard per-entry cap. Files at or above this size are always served from disk.
pub const MAX_ENTRY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
struct Entry {
    bytes: std::sync::Arc<[u8]>,
}

/// Concurrent, size-bounded LRU cache mapping an absolute file path to its contents.
///
/// `get` always promotes a hit to most-recently-used; `put` always evicts from the
/// least-recently-used end until the total size invariant holds. Both operations take the same
/// exclusive lock: the cache is small and read-heavy workloads dominated by disk I/O elsewhere
/// make a single mutex simpler to reason about than split reader/writer paths, while still
/// satisfying every invariant in the contract (no torn reads, no two puts racing the same bucket).
pub struct FileCache {
    inner: Mutex<Inner>,
    max_bytes: usize,
}

struct Inner {
    entries: LruCache<String, Entry>,
    total_bytes: usize,
}

impl FileCache {
    /// Creates a cache bounded to `max_bytes` total resident content.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            // Capacity is a don't-care upper bound on entry *count*; eviction is driven by
            // `total_bytes` against `max_bytes`, so a generous unbounded-looking cap is fine.
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                total_bytes: 0,
            }),
            max_bytes,
        }
    }

    /// Looks up `path`, promoting it to most-recently-used on a hit.
    ///
    /// Returns an owned copy of the bytes so the caller never holds a reference into the cache:
    /// subsequent eviction cannot invalidate what was returned.
    pub fn get(&self, path: &str) -> Option<std::sync::Arc<[u8]>> {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.get(path).map(|e| e.bytes.clone())
    }

    /// Inserts or replaces `path`'s contents, then evicts LRU entries until the total size
    /// invariant holds.
    ///
    /// Rejects (silently, as the contract requires `put` to be advisory) an empty or
    /// oversized body.
    pub fn put(&self, path: String, bytes: std::sync::Arc<[u8]>) {
        let len = bytes.len();
        if len == 0 || len >= MAX_ENTRY_BYTES {
            return;
        }

        let mut inner = self.inner.lock().unwrap();

        if let Some(old) = inner.entries.put(path, Entry { bytes }) {
            inner.total_bytes -= old.bytes.len();
        }
        inner.total_bytes += len;

        while inner.total_bytes > self.max_bytes {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => inner.total_bytes -= evicted.bytes.len(),
                None => break,
            }
        }
    }

    /// Number of entries currently resident. Exposed for tests and diagnostics.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// Total resident bytes across all entries.
    pub fn total_bytes(&self) -> usize {
        self.inner.lock().unwrap().total_bytes
    }

    /// Releases every entry. Called once during worker shutdown.
    pub fn destroy(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.total_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn bytes(n: usize, fill: u8) -> Arc<[u8]> {
        vec![fill; n].into()
    }

    #[test]
    fn put_then_get_round_trips() {
        let cache = FileCache::new(1024 * 1024);
        cache.put("/a".into(), bytes(10, 1));
        assert_eq!(cache.get("/a").as_deref(), Some(&[1u8; 10][..]));
    }

    #[test]
    fn miss_reports_absence() {
        let cache = FileCache::new(1024);
        assert!(cache.get("/missing").is_none());
    }

    #[test]
    fn replacing_a_key_updates_total_size() {
        let cache = FileCache::new(1024 * 1024);
        cache.put("/a".into(), bytes(100, 1));
        cache.put("/a".into(), bytes(50, 2));
        assert_eq!(cache.total_bytes(), 50);
        assert_eq!(cache.get("/a").as_deref(), Some(&[2u8; 50][..]));
    }

    #[test]
    fn entries_at_or_over_one_mebibyte_are_never_cached() {
        let cache = FileCache::new(4 * 1024 * 1024);
        cache.put("/big".into(), bytes(MAX_ENTRY_BYTES, 7));
        assert!(cache.get("/big").is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn eviction_keeps_total_under_budget() {
        // Scenario from the spec: 3 MiB budget, three 512 KiB entries, then a 2 MiB entry.
        let half_mb = 512 * 1024;
        let cache = FileCache::new(3 * 1024 * 1024);

        cache.put("/a".into(), bytes(half_mb, b'a'));
        cache.put("/b".into(), bytes(half_mb, b'b'));
        cache.put("/c".into(), bytes(half_mb, b'c'));

        // Promote /a to most-recently-used.
        assert!(cache.get("/a").is_some());

        cache.put("/d".into(), bytes(2 * 1024 * 1024, b'd'));

        assert!(cache.total_bytes() <= 3 * 1024 * 1024);
        assert!(cache.get("/a").is_some());
        assert!(cache.get("/d").is_some());
        assert!(cache.get("/b").is_none());
        assert!(cache.get("/c").is_none());
    }

    #[test]
    fn zero_length_put_is_rejected() {
        let cache = FileCache::new(1024);
        cache.put("/empty".into(), bytes(0, 0));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn concurrent_put_and_get_never_tear() {
        use std::sync::Arc as StdArc;
        use std::thread;

        let cache = StdArc::new(FileCache::new(8 * 1024 * 1024));
        let mut handles = Vec::new();

        for t in 0..8 {
            let cache = cache.clone();
            handles.push(thread::spawn(move || {
                for i in 0..200 {
                    let key = format!("/file-{}", (t * 200 + i) % 32);
                    let fill = ((t + i) % 251) as u8;
                    cache.put(key.clone(), bytes(256, fill));
                    if let Some(body) = cache.get(&key) {
                        // Every byte in a returned copy must agree: a torn read would mix fills.
                        assert!(body.iter().all(|&b| b == body[0]));
                    }
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert!(cache.total_bytes() <= 8 * 1024 * 1024);
    }
}
