//! Build output reporting.
//!
//! Methods of this trait may be called from multiple threads, so
//! implementations must be thread-safe.

use std::io::Write;
use std::sync::Mutex;

pub trait Progress: Send + Sync {
    /// Echo of a recipe line about to run (or printed under dry-run).
    fn recipe_line(&self, target: &str, line: &str);

    /// A line of output produced by a running task.
    fn task_output(&self, target: &str, line: &str, is_err: bool);

    /// A target's recipe failed with the given exit code.
    fn target_failed(&self, target: &str, code: i32);

    /// Called once when the run is over.
    fn finish(&self) {}
}

/// Plain console reporting matching the reference tool's output contract.
pub struct ConsoleProgress;

impl Progress for ConsoleProgress {
    fn recipe_line(&self, _target: &str, line: &str) {
        println!("{line}");
    }

    fn task_output(&self, _target: &str, line: &str, is_err: bool) {
        if is_err {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
    }

    fn target_failed(&self, target: &str, code: i32) {
        eprintln!("smak: *** [{target}] Error {code}");
    }

    fn finish(&self) {
        let _ = std::io::stdout().flush();
    }
}

pub struct NoopProgress;
pub static NOOP_PROGRESS: NoopProgress = NoopProgress;

impl Progress for NoopProgress {
    fn recipe_line(&self, _: &str, _: &str) {}
    fn task_output(&self, _: &str, _: &str, _: bool) {}
    fn target_failed(&self, _: &str, _: i32) {}
}

/// Captures everything in memory. Used by `--check=quiet` and by tests.
#[derive(Default)]
pub struct CaptureProgress {
    lines: Mutex<Vec<String>>,
}

impl CaptureProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut self.lines.lock().unwrap())
    }
}

impl Progress for CaptureProgress {
    fn recipe_line(&self, _target: &str, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }

    fn task_output(&self, _target: &str, line: &str, _is_err: bool) {
        self.lines.lock().unwrap().push(line.to_string());
    }

    fn target_failed(&self, target: &str, code: i32) {
        self.lines
            .lock()
            .unwrap()
            .push(format!("smak: *** [{target}] Error {code}"));
    }
}
