//! Fingerprinting of targets and their input sets.

use std::time::{SystemTime, UNIX_EPOCH};

use xxhash_rust::xxh3::Xxh3;

use crate::db::Fingerprint;
use crate::graph::CookedLine;

/// Fingerprint one target: recipe text, prerequisite fingerprints and the
/// exported environment subset.
///
/// The prerequisite and environment contributions are order-independent, so
/// the value is stable across graph layout changes between runs.
pub fn fingerprint_node(
    recipe: &[CookedLine],
    prereq_fps: &[Fingerprint],
    env: &[(String, String)],
) -> Fingerprint {
    let mut hasher = Xxh3::new();

    hasher.update(b"recipe\0");
    for line in recipe {
        hasher.update(line.text.as_bytes());
        hasher.update(&[0]);
    }

    let mut deps = Acc::default();
    for fp in prereq_fps {
        deps.accumulate(u128::from_be_bytes(fp.0));
    }
    hasher.update(b"deps\0");
    hasher.update(&deps.finalize());

    let mut envs = Acc::default();
    for (key, value) in env {
        let mut pair = Xxh3::new();
        pair.update(key.as_bytes());
        pair.update(&[0]);
        pair.update(value.as_bytes());
        envs.accumulate(pair.digest128());
    }
    hasher.update(b"env\0");
    hasher.update(&envs.finalize());

    Fingerprint(hasher.digest128().to_be_bytes())
}

/// Fingerprint of a source file that no rule builds: its name and stamp.
pub fn hash_file_stamp(name: &str, mtime: Option<SystemTime>) -> Fingerprint {
    let mut hasher = Xxh3::new();
    hasher.update(b"file\0");
    hasher.update(name.as_bytes());
    hasher.update(&[0]);
    let nanos = mtime
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    hasher.update(&nanos.to_be_bytes());
    Fingerprint(hasher.digest128().to_be_bytes())
}

/// The accumulator for collecting an order-independent hash of a set.
#[derive(Default)]
pub struct Acc {
    sum: u128,
    xor: u128,
    cnt: u64,
}

impl Acc {
    pub fn accumulate(&mut self, h: u128) {
        self.sum = self.sum.wrapping_add(h);
        self.xor ^= h;
        self.cnt += 1;
    }

    pub fn finalize(&self) -> [u8; 16] {
        let mut hasher = Xxh3::new();
        hasher.update(b"set\0");
        hasher.update(&self.sum.to_be_bytes());
        hasher.update(&self.xor.to_be_bytes());
        hasher.update(&self.cnt.to_be_bytes());
        hasher.digest128().to_be_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::cook_line;

    #[test]
    fn recipe_changes_change_the_fingerprint() {
        let a = fingerprint_node(&[cook_line("cc -c x.c")], &[], &[]);
        let b = fingerprint_node(&[cook_line("cc -O2 -c x.c")], &[], &[]);
        assert_ne!(a, b);
        let a2 = fingerprint_node(&[cook_line("cc -c x.c")], &[], &[]);
        assert_eq!(a, a2);
    }

    #[test]
    fn prereq_order_does_not_matter() {
        let p1 = hash_file_stamp("a.c", None);
        let p2 = hash_file_stamp("b.c", None);
        let fwd = fingerprint_node(&[], &[p1, p2], &[]);
        let rev = fingerprint_node(&[], &[p2, p1], &[]);
        assert_eq!(fwd, rev);
    }

    #[test]
    fn environment_subset_contributes() {
        let base = fingerprint_node(&[], &[], &[]);
        let with_env = fingerprint_node(&[], &[], &[("CC".into(), "clang".into())]);
        assert_ne!(base, with_env);
    }
}
