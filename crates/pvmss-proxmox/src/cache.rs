use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(120);

struct CacheEntry {
    value: serde_json::Value,
    at: Instant,
}

/// Per-path cache of decoded GET responses. Owned exclusively by the
/// shared [`crate::ProxmoxClient`]; writes invalidate synchronously so a
/// client that just mutated a path never reads its own stale entry.
pub struct ResponseCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Unexpired entry for `path`, if any. An expired entry encountered
    /// here is dropped rather than returned.
    pub fn get(&self, path: &str) -> Option<serde_json::Value> {
        {
            let entries = self.entries.read().expect("cache lock poisoned");
            match entries.get(path) {
                Some(entry) if entry.at.elapsed() < self.ttl => {
                    return Some(entry.value.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }
        // Stale: discard under the write lock.
        self.entries
            .write()
            .expect("cache lock poisoned")
            .remove(path);
        None
    }

    pub fn put(&self, path: &str, value: serde_json::Value) {
        self.entries
            .write()
            .expect("cache lock poisoned")
            .insert(path.to_string(), CacheEntry { value, at: Instant::now() });
    }

    /// Drops the exact path and its immediate parent collection, the pair a
    /// write dirties: mutating `/nodes/pve1/qemu/101/config` stales both
    /// that path and `/nodes/pve1/qemu/101`.
    pub fn invalidate_with_parent(&self, path: &str) {
        let mut entries = self.entries.write().expect("cache lock poisoned");
        entries.remove(path);
        if let Some(idx) = path.trim_end_matches('/').rfind('/') {
            if idx > 0 {
                entries.remove(&path[..idx]);
            }
        }
    }

    /// Drops every entry whose key starts with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) {
        self.entries
            .write()
            .expect("cache lock poisoned")
            .retain(|key, _| !key.starts_with(prefix));
    }

    pub fn invalidate(&self, path: &str) {
        self.entries
            .write()
            .expect("cache lock poisoned")
            .remove(path);
    }

    pub fn clear(&self) {
        self.entries.write().expect("cache lock poisoned").clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}
