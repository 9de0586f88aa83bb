//! In-memory cache backend, used by tests and cache-disabled runs that still
//! want per-run dedup.

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use crate::db::{CacheDb, CacheReader, CacheRecord, CacheWriter, Fingerprint};

#[derive(Clone, Default)]
pub struct InMemoryCache {
    inner: Arc<RwLock<HashMap<Fingerprint, CacheRecord>>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct Reader<'r>(RwLockReadGuard<'r, HashMap<Fingerprint, CacheRecord>>);

pub struct Writer<'w>(RwLockWriteGuard<'w, HashMap<Fingerprint, CacheRecord>>);

impl CacheDb for InMemoryCache {
    fn begin_read<'r>(&'r self) -> Box<dyn CacheReader + 'r> {
        Box::new(Reader(self.inner.read().unwrap()))
    }

    fn begin_write<'w>(&'w self) -> Box<dyn CacheWriter + 'w> {
        Box::new(Writer(self.inner.write().unwrap()))
    }
}

impl<'r> CacheReader for Reader<'r> {
    fn get(&self, fp: Fingerprint) -> Option<CacheRecord> {
        self.0.get(&fp).cloned()
    }
}

impl<'w> CacheWriter for Writer<'w> {
    fn put(&mut self, fp: Fingerprint, record: CacheRecord) {
        self.0.insert(fp, record);
    }

    fn invalidate(&mut self, fp: Fingerprint) {
        self.0.remove(&fp);
    }

    fn invalidate_input(&mut self, path: &Path) {
        self.0.retain(|_, rec| !rec.inputs.iter().any(|p| p == path));
    }

    fn commit(self: Box<Self>) {
        // No-op for the in-memory backend.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::CacheStatus;
    use std::path::PathBuf;
    use std::time::SystemTime;

    fn record(input: &str) -> CacheRecord {
        CacheRecord {
            recipe_hash: Fingerprint([1; 16]),
            inputs: vec![PathBuf::from(input)],
            outputs: vec![],
            status: CacheStatus::Success,
            timestamp: SystemTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn put_get_invalidate() {
        let db = InMemoryCache::new();
        let fp = Fingerprint([9; 16]);
        {
            let mut w = db.begin_write();
            w.put(fp, record("x.c"));
            w.commit();
        }
        assert!(db.begin_read().get(fp).is_some());
        {
            let mut w = db.begin_write();
            w.invalidate(fp);
            w.commit();
        }
        assert!(db.begin_read().get(fp).is_none());
    }

    #[test]
    fn invalidate_by_input_path() {
        let db = InMemoryCache::new();
        let fp1 = Fingerprint([1; 16]);
        let fp2 = Fingerprint([2; 16]);
        {
            let mut w = db.begin_write();
            w.put(fp1, record("x.c"));
            w.put(fp2, record("y.c"));
            w.commit();
        }
        {
            let mut w = db.begin_write();
            w.invalidate_input(Path::new("x.c"));
            w.commit();
        }
        assert!(db.begin_read().get(fp1).is_none());
        assert!(db.begin_read().get(fp2).is_some());
    }
}
