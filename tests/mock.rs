//! Test in a mock environment

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use smak::exec::TaskRunner;
use smak::progress::Progress;
use smak::worker::{TaskSpec, TaskStatus};
use smak::world::{ShellOutput, World};

/// A mock [`World`] implementation that works entirely in-memory.
pub struct MockWorld {
    inner: Mutex<MockWorldInner>,
}

struct MockWorldInner {
    /// A number that roughly represents a mocked system time. Increases every
    /// time a file is touched.
    epoch: u64,
    /// Map from in-memory file list to their modification epoch.
    files: HashMap<PathBuf, u64>,
    contents: HashMap<PathBuf, String>,
}

impl World for MockWorld {
    fn exists(&self, path: &Path) -> bool {
        self.inner.lock().unwrap().files.contains_key(path)
    }

    fn mtime(&self, path: &Path) -> std::io::Result<SystemTime> {
        let inner = self.inner.lock().unwrap();
        let epoch = inner
            .files
            .get(path)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"))?;
        Ok(UNIX_EPOCH + Duration::from_secs(*epoch))
    }

    fn now(&self) -> SystemTime {
        let inner = self.inner.lock().unwrap();
        UNIX_EPOCH + Duration::from_secs(inner.epoch)
    }

    fn read_file(&self, path: &Path) -> std::io::Result<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .contents
            .get(path)
            .cloned()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"))
    }

    fn run_shell(&self, _cwd: &Path, _cmd: &str) -> std::io::Result<ShellOutput> {
        Ok(ShellOutput {
            stdout: String::new(),
            status: 0,
        })
    }

    fn glob(&self, _cwd: &Path, _pattern: &str) -> Vec<String> {
        vec![]
    }
}

#[allow(unused)]
impl MockWorld {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MockWorldInner {
                epoch: 0,
                files: HashMap::new(),
                contents: HashMap::new(),
            }),
        }
    }

    /// Set a file as existing, updating its modification time to the current
    /// epoch.
    pub fn touch_file(&self, path: impl AsRef<Path>) {
        let mut inner = self.inner.lock().unwrap();
        inner.epoch += 1;
        let epoch = inner.epoch;
        inner.files.insert(path.as_ref().to_owned(), epoch);
    }

    /// Register a file with text content (a makefile, typically).
    pub fn write_file(&self, path: impl AsRef<Path>, content: &str) {
        let path = path.as_ref().to_owned();
        let mut inner = self.inner.lock().unwrap();
        inner.epoch += 1;
        let epoch = inner.epoch;
        inner.files.insert(path.clone(), epoch);
        inner.contents.insert(path, content.to_string());
    }

    pub fn remove_file(&self, path: impl AsRef<Path>) {
        let mut inner = self.inner.lock().unwrap();
        inner.files.remove(path.as_ref());
        inner.contents.remove(path.as_ref());
    }
}

impl Default for MockWorld {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`TaskRunner`] that records every dispatched line instead of spawning
/// anything. On success the target file is touched in the mock world, so
/// up-to-date checks behave as if the recipe produced its output.
pub struct MockRunner<'w> {
    world: &'w MockWorld,
    fail_marker: Mutex<Option<String>>,
    log: Mutex<Vec<String>>,
}

#[allow(unused)]
impl<'w> MockRunner<'w> {
    pub fn new(world: &'w MockWorld) -> Self {
        Self {
            world,
            fail_marker: Mutex::new(None),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Any dispatched line containing `marker` fails its task.
    pub fn fail_on(&self, marker: &str) {
        *self.fail_marker.lock().unwrap() = Some(marker.to_string());
    }

    /// Take and clear the execution log.
    pub fn take_log(&self) -> Vec<String> {
        std::mem::take(&mut self.log.lock().unwrap())
    }
}

impl TaskRunner for MockRunner<'_> {
    fn run_task(&self, spec: &TaskSpec, _progress: &dyn Progress) -> std::io::Result<TaskStatus> {
        let mut lines: Vec<String> = spec.external.iter().map(|l| l.text.clone()).collect();
        lines.extend(spec.builtins.iter().map(|b| b.descriptor()));

        let marker = self.fail_marker.lock().unwrap().clone();
        let failed = marker
            .as_deref()
            .is_some_and(|m| lines.iter().any(|l| l.contains(m)));

        self.log.lock().unwrap().extend(lines);

        if failed {
            return Ok(TaskStatus::Failed(2));
        }
        self.world.touch_file(spec.dir.join(&spec.target));
        Ok(TaskStatus::Success)
    }
}

#[allow(unused)]
pub fn assert_order(log: &[String], before: &str, after: &str) {
    let b = log
        .iter()
        .position(|l| l.contains(before))
        .unwrap_or_else(|| panic!("Expected '{before}' in log {log:?}"));
    let a = log
        .iter()
        .position(|l| l.contains(after))
        .unwrap_or_else(|| panic!("Expected '{after}' in log {log:?}"));
    assert!(
        b < a,
        "Expected '{before}' to execute before '{after}'. Got {log:?}"
    );
}

#[allow(unused)]
pub fn count_matching(log: &[String], needle: &str) -> usize {
    log.iter().filter(|l| l.contains(needle)).count()
}
