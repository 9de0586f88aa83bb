//! The artefact cache: completion records keyed by fingerprint.
//!
//! Phony targets never touch the cache; repeated invocations re-run their
//! recipes regardless of what is stored here.

pub mod fs;
pub mod in_memory;

use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// A 128-bit hash identifying one (recipe, prerequisite set, environment)
/// combination. Generate one with [`crate::graph::fingerprint_node`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Fingerprint(pub [u8; 16]);

impl Fingerprint {
    pub fn to_hex(self) -> String {
        let mut s = String::with_capacity(32);
        for byte in self.0 {
            s.push_str(&format!("{byte:02x}"));
        }
        s
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 32 {
            return None;
        }
        let mut out = [0u8; 16];
        for (i, chunk) in out.iter_mut().enumerate() {
            *chunk = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Self(out))
    }
}

impl Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Fingerprint::from_hex(&s)
            .ok_or_else(|| serde::de::Error::custom("malformed fingerprint hex"))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Success,
    Failed,
}

/// One cached completion, stored as a JSON file per fingerprint.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CacheRecord {
    pub recipe_hash: Fingerprint,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    pub status: CacheStatus,
    pub timestamp: SystemTime,
}

/// A trait for the database caching target completion records.
pub trait CacheDb: Send + Sync {
    /// Begin a read transaction. The database may block during this process.
    fn begin_read<'r>(&'r self) -> Box<dyn CacheReader + 'r>;

    /// Begin a write transaction. The database may block during this process.
    fn begin_write<'w>(&'w self) -> Box<dyn CacheWriter + 'w>;
}

pub trait CacheReader {
    fn get(&self, fp: Fingerprint) -> Option<CacheRecord>;
}

pub trait CacheWriter {
    fn put(&mut self, fp: Fingerprint, record: CacheRecord);
    fn invalidate(&mut self, fp: Fingerprint);
    /// Drop every record that lists `path` among its inputs. Used when the
    /// watcher reports a modified input.
    fn invalidate_input(&mut self, path: &Path);

    fn commit(self: Box<Self>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_hex_round_trip() {
        let fp = Fingerprint([
            0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 255,
        ]);
        let hex = fp.to_hex();
        assert_eq!(hex.len(), 32);
        assert_eq!(Fingerprint::from_hex(&hex), Some(fp));
        assert_eq!(Fingerprint::from_hex("zz"), None);
    }

    #[test]
    fn record_serializes_to_json() {
        let rec = CacheRecord {
            recipe_hash: Fingerprint([7; 16]),
            inputs: vec![PathBuf::from("a.c")],
            outputs: vec![PathBuf::from("a.o")],
            status: CacheStatus::Success,
            timestamp: SystemTime::UNIX_EPOCH,
        };
        let json = serde_json::to_string(&rec).unwrap();
        let back: CacheRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.recipe_hash, rec.recipe_hash);
        assert_eq!(back.inputs, rec.inputs);
        assert_eq!(back.status, CacheStatus::Success);
    }
}
