//! File-system watching for auto-rescan and the standalone scanner mode.
//!
//! The portable backend polls mtime snapshots through the [`World`] seam.
//! Event lines use the format `EVENT:<pid>:<path>`, with ` (via FUSE)`
//! appended only when a native notification backend reported the event; the
//! polling backend never does.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use indexmap::IndexMap;
use tracing::debug;

use crate::world::World;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEventKind {
    Create,
    Modify,
    Delete,
}

impl FsEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FsEventKind::Create => "CREATE",
            FsEventKind::Modify => "MODIFY",
            FsEventKind::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub kind: FsEventKind,
    pub path: PathBuf,
    /// Whether a native notification backend produced this event.
    pub native: bool,
}

impl FsEvent {
    /// The wire form consumed by the scanner tests.
    pub fn format(&self, pid: u32) -> String {
        let suffix = if self.native { " (via FUSE)" } else { "" };
        format!(
            "{}:{}:{}{}",
            self.kind.as_str(),
            pid,
            self.path.display(),
            suffix
        )
    }
}

/// Watches a fixed set of registered paths by mtime snapshot.
#[derive(Debug, Default)]
pub struct Watcher {
    snapshots: IndexMap<PathBuf, Option<SystemTime>>,
}

impl Watcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a path. The initial snapshot is taken on the first
    /// [`Self::poll`], so files created in between report CREATE.
    pub fn register(&mut self, path: impl Into<PathBuf>) {
        self.snapshots.entry(path.into()).or_insert(None);
    }

    /// Seed the snapshots with the current state so that only subsequent
    /// changes produce events.
    pub fn prime(&mut self, world: &dyn World) {
        for (path, stamp) in self.snapshots.iter_mut() {
            *stamp = world.mtime(path).ok();
        }
    }

    pub fn registered(&self) -> impl Iterator<Item = &Path> {
        self.snapshots.keys().map(PathBuf::as_path)
    }

    /// Compare the current state of every registered path against the last
    /// snapshot, emitting one event per changed path.
    pub fn poll(&mut self, world: &dyn World) -> Vec<FsEvent> {
        let mut events = Vec::new();
        for (path, stamp) in self.snapshots.iter_mut() {
            let current = world.mtime(path).ok();
            let kind = match (&stamp, &current) {
                (None, Some(_)) => Some(FsEventKind::Create),
                (Some(_), None) => Some(FsEventKind::Delete),
                (Some(old), Some(new)) if old != new => Some(FsEventKind::Modify),
                _ => None,
            };
            if let Some(kind) = kind {
                debug!(?kind, path = %path.display(), "fs event");
                events.push(FsEvent {
                    kind,
                    path: path.clone(),
                    native: false,
                });
            }
            *stamp = current;
        }
        events
    }
}

/// Standalone scanner mode: poll the given paths forever, printing events to
/// `out`. Exits only on signal (the process default disposition).
pub fn run_scanner(
    world: &dyn World,
    paths: &[PathBuf],
    interval: Duration,
    mut out: impl Write,
) -> std::io::Result<()> {
    let mut watcher = Watcher::new();
    for path in paths {
        watcher.register(path);
    }
    watcher.prime(world);

    let pid = std::process::id();
    loop {
        for event in watcher.poll(world) {
            writeln!(out, "{}", event.format(pid))?;
            out.flush()?;
        }
        std::thread::sleep(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct StampWorld {
        files: Mutex<HashMap<PathBuf, u64>>,
    }

    impl StampWorld {
        fn touch(&self, path: &str, epoch: u64) {
            self.files
                .lock()
                .unwrap()
                .insert(PathBuf::from(path), epoch);
        }

        fn remove(&self, path: &str) {
            self.files.lock().unwrap().remove(Path::new(path));
        }
    }

    impl World for StampWorld {
        fn exists(&self, path: &Path) -> bool {
            self.files.lock().unwrap().contains_key(path)
        }
        fn mtime(&self, path: &Path) -> std::io::Result<SystemTime> {
            self.files
                .lock()
                .unwrap()
                .get(path)
                .map(|&e| SystemTime::UNIX_EPOCH + Duration::from_secs(e))
                .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound))
        }
        fn now(&self) -> SystemTime {
            SystemTime::UNIX_EPOCH
        }
        fn read_file(&self, _: &Path) -> std::io::Result<String> {
            Err(std::io::Error::from(std::io::ErrorKind::NotFound))
        }
        fn run_shell(&self, _: &Path, _: &str) -> std::io::Result<crate::world::ShellOutput> {
            Ok(crate::world::ShellOutput {
                stdout: String::new(),
                status: 0,
            })
        }
        fn glob(&self, _: &Path, _: &str) -> Vec<String> {
            vec![]
        }
    }

    #[test]
    fn create_modify_delete_sequence() {
        let world = StampWorld::default();
        let mut watcher = Watcher::new();
        watcher.register("P");
        assert!(watcher.poll(&world).is_empty());

        world.touch("P", 1);
        let events = watcher.poll(&world);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, FsEventKind::Create);

        // Unchanged: no event.
        assert!(watcher.poll(&world).is_empty());

        world.touch("P", 2);
        assert_eq!(watcher.poll(&world)[0].kind, FsEventKind::Modify);

        world.remove("P");
        assert_eq!(watcher.poll(&world)[0].kind, FsEventKind::Delete);
        assert!(watcher.poll(&world).is_empty());
    }

    #[test]
    fn prime_suppresses_initial_create() {
        let world = StampWorld::default();
        world.touch("Q", 5);
        let mut watcher = Watcher::new();
        watcher.register("Q");
        watcher.prime(&world);
        assert!(watcher.poll(&world).is_empty());
    }

    #[test]
    fn event_line_format() {
        let event = FsEvent {
            kind: FsEventKind::Modify,
            path: PathBuf::from("src/lib.c"),
            native: false,
        };
        assert_eq!(event.format(42), "MODIFY:42:src/lib.c");

        let native = FsEvent {
            kind: FsEventKind::Create,
            path: PathBuf::from("x"),
            native: true,
        };
        assert_eq!(native.format(7), "CREATE:7:x (via FUSE)");
    }
}
