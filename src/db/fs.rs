//! On-disk cache backend: one JSON file per fingerprint under the configured
//! cache directory.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use crate::db::{CacheDb, CacheReader, CacheRecord, CacheWriter, Fingerprint};

pub struct FsCache {
    dir: PathBuf,
}

impl FsCache {
    /// Open (creating if needed) a cache rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn record_path(&self, fp: Fingerprint) -> PathBuf {
        self.dir.join(format!("{}.json", fp.to_hex()))
    }

    fn load(&self, path: &Path) -> Option<CacheRecord> {
        let text = fs::read_to_string(path).ok()?;
        match serde_json::from_str(&text) {
            Ok(rec) => Some(rec),
            Err(e) => {
                warn!("discarding malformed cache record {}: {e}", path.display());
                let _ = fs::remove_file(path);
                None
            }
        }
    }
}

enum Op {
    Put(Fingerprint, CacheRecord),
    Invalidate(Fingerprint),
    InvalidateInput(PathBuf),
}

pub struct Reader<'r> {
    db: &'r FsCache,
}

/// Buffers operations; nothing reaches disk until [`CacheWriter::commit`].
pub struct Writer<'w> {
    db: &'w FsCache,
    ops: Vec<Op>,
}

impl CacheDb for FsCache {
    fn begin_read<'r>(&'r self) -> Box<dyn CacheReader + 'r> {
        Box::new(Reader { db: self })
    }

    fn begin_write<'w>(&'w self) -> Box<dyn CacheWriter + 'w> {
        Box::new(Writer {
            db: self,
            ops: Vec::new(),
        })
    }
}

impl<'r> CacheReader for Reader<'r> {
    fn get(&self, fp: Fingerprint) -> Option<CacheRecord> {
        self.db.load(&self.db.record_path(fp))
    }
}

impl<'w> CacheWriter for Writer<'w> {
    fn put(&mut self, fp: Fingerprint, record: CacheRecord) {
        self.ops.push(Op::Put(fp, record));
    }

    fn invalidate(&mut self, fp: Fingerprint) {
        self.ops.push(Op::Invalidate(fp));
    }

    fn invalidate_input(&mut self, path: &Path) {
        self.ops.push(Op::InvalidateInput(path.to_path_buf()));
    }

    fn commit(self: Box<Self>) {
        let Writer { db, ops } = *self;

        // Scan the directory once if any input invalidation is pending.
        let mut by_input: HashMap<PathBuf, Vec<PathBuf>> = HashMap::new();
        if ops.iter().any(|op| matches!(op, Op::InvalidateInput(_)))
            && let Ok(entries) = fs::read_dir(&db.dir)
        {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_none_or(|e| e != "json") {
                    continue;
                }
                if let Some(rec) = db.load(&path) {
                    for input in rec.inputs {
                        by_input.entry(input).or_default().push(path.clone());
                    }
                }
            }
        }

        for op in ops {
            match op {
                Op::Put(fp, record) => {
                    let path = db.record_path(fp);
                    let tmp = path.with_extension("tmp");
                    let write = serde_json::to_string_pretty(&record)
                        .map_err(std::io::Error::other)
                        .and_then(|text| fs::write(&tmp, text))
                        .and_then(|()| fs::rename(&tmp, &path));
                    if let Err(e) = write {
                        warn!("failed to write cache record {}: {e}", path.display());
                    }
                }
                Op::Invalidate(fp) => {
                    let _ = fs::remove_file(db.record_path(fp));
                }
                Op::InvalidateInput(input) => {
                    for path in by_input.get(&input).into_iter().flatten() {
                        debug!("invalidating {} (input {})", path.display(), input.display());
                        let _ = fs::remove_file(path);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::CacheStatus;
    use std::time::SystemTime;

    fn temp_cache(tag: &str) -> FsCache {
        let dir = std::env::temp_dir().join(format!("smak-cache-test-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        FsCache::open(dir).unwrap()
    }

    fn record(input: &str) -> CacheRecord {
        CacheRecord {
            recipe_hash: Fingerprint([3; 16]),
            inputs: vec![PathBuf::from(input)],
            outputs: vec![PathBuf::from("out")],
            status: CacheStatus::Success,
            timestamp: SystemTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn round_trip_on_disk() {
        let db = temp_cache("rt");
        let fp = Fingerprint([8; 16]);
        let mut w = db.begin_write();
        w.put(fp, record("in.c"));
        w.commit();

        let rec = db.begin_read().get(fp).expect("record should exist");
        assert_eq!(rec.inputs, vec![PathBuf::from("in.c")]);
        assert_eq!(rec.status, CacheStatus::Success);
    }

    #[test]
    fn invalidate_input_removes_matching_records() {
        let db = temp_cache("inv");
        let fp1 = Fingerprint([1; 16]);
        let fp2 = Fingerprint([2; 16]);
        let mut w = db.begin_write();
        w.put(fp1, record("a.c"));
        w.put(fp2, record("b.c"));
        w.commit();

        let mut w = db.begin_write();
        w.invalidate_input(Path::new("a.c"));
        w.commit();

        assert!(db.begin_read().get(fp1).is_none());
        assert!(db.begin_read().get(fp2).is_some());
    }
}
