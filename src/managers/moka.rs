use std::{fmt, io, sync::Arc};

use moka::{ops::compute::Op, sync::Cache as MokaCache};

use crate::{Cache, CacheEntry};

/// Default in-memory budget, in bytes of cached body data
const DEFAULT_MAX_CAPACITY: u64 = 5 * 1024 * 1024;

/// Implements [`Cache`] with [`moka`](https://github.com/moka-rs/moka) as
/// the backend.
#[cfg_attr(docsrs, doc(cfg(feature = "manager-moka")))]
#[derive(Clone)]
pub struct MokaManager {
    /// The instance of `moka::sync::Cache`
    pub cache: MokaCache<String, Arc<CacheEntry>>,
}

impl fmt::Debug for MokaManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MokaManager").finish_non_exhaustive()
    }
}

impl Default for MokaManager {
    fn default() -> Self {
        Self::new(
            MokaCache::builder()
                .weigher(|_key, entry: &Arc<CacheEntry>| {
                    entry.data.len().try_into().unwrap_or(u32::MAX)
                })
                .max_capacity(DEFAULT_MAX_CAPACITY)
                .build(),
        )
    }
}

impl MokaManager {
    /// Create a manager from a pre-configured cache
    pub fn new(cache: MokaCache<String, Arc<CacheEntry>>) -> Self {
        Self { cache }
    }
}

impl Cache for MokaManager {
    fn initialize(&self) -> io::Result<()> {
        Ok(())
    }

    fn get(&self, key: &str) -> io::Result<Option<CacheEntry>> {
        Ok(self.cache.get(key).map(|entry| (*entry).clone()))
    }

    fn put(&self, key: &str, entry: CacheEntry) -> io::Result<()> {
        self.cache.insert(key.to_owned(), Arc::new(entry));
        Ok(())
    }

    fn invalidate(&self, key: &str, full_expire: bool) -> io::Result<()> {
        // computed atomically under the cache's own entry lock; a concurrent
        // put must not land between the read and the write-back
        let _ = self.cache.entry(key.to_owned()).and_compute_with(|stored| {
            match stored {
                Some(stored) => {
                    let mut entry = (*stored.into_value()).clone();
                    entry.soft_ttl = 0;
                    if full_expire {
                        entry.ttl = 0;
                    }
                    Op::Put(Arc::new(entry))
                }
                None => Op::Nop,
            }
        });
        Ok(())
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        self.cache.invalidate(key);
        Ok(())
    }

    fn clear(&self) -> io::Result<()> {
        self.cache.invalidate_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn entry(body: &[u8]) -> CacheEntry {
        CacheEntry {
            data: body.to_vec(),
            etag: None,
            server_date: 0,
            last_modified: 0,
            ttl: crate::now_millis() + 60_000,
            soft_ttl: crate::now_millis() + 60_000,
            response_headers: HashMap::new(),
        }
    }

    #[test]
    fn put_get_remove() {
        let manager = MokaManager::default();
        manager.put("k", entry(b"v")).unwrap();
        assert_eq!(manager.get("k").unwrap().unwrap().data, b"v");
        manager.remove("k").unwrap();
        manager.cache.run_pending_tasks();
        assert!(manager.get("k").unwrap().is_none());
    }

    #[test]
    fn invalidate_zeroes_expiries() {
        let manager = MokaManager::default();
        manager.put("k", entry(b"v")).unwrap();
        manager.invalidate("k", true).unwrap();
        let stored = manager.get("k").unwrap().unwrap();
        assert_eq!(stored.ttl, 0);
        assert_eq!(stored.soft_ttl, 0);
    }
}
