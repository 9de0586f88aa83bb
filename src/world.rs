use std::{
    path::{Path, PathBuf},
    process::Command,
    time::SystemTime,
};

/// A trait that abstracts over how the engine interacts with the outside world.
///
/// All file, time and shell-capture operations go through this trait. You may
/// implement it to customize the view of the world as seen by the engine; for
/// example, a mock world is used to test the parser, the rule resolver and the
/// scheduler without touching the real filesystem.
///
/// Recipe execution is a separate seam, see [`crate::exec::TaskRunner`].
///
/// # Implementation notes
///
/// Methods of this trait may be called from the scheduler's thread pool, so
/// implementations must be thread-safe.
pub trait World: Send + Sync {
    /// Test whether a file exists.
    fn exists(&self, path: &Path) -> bool;

    /// Get the modification time of a file.
    fn mtime(&self, path: &Path) -> std::io::Result<SystemTime>;

    /// Get the current time. Implementations may return a mocked monotonic time.
    fn now(&self) -> SystemTime;

    /// Read a file to a string. Used for makefiles and `include`.
    fn read_file(&self, path: &Path) -> std::io::Result<String>;

    /// Run `cmd` under the POSIX shell in `cwd`, capturing stdout.
    ///
    /// Backs the `$(shell ...)` function.
    fn run_shell(&self, cwd: &Path, cmd: &str) -> std::io::Result<ShellOutput>;

    /// Expand a glob pattern relative to `cwd`, returning matches in sorted
    /// order with the `cwd` prefix stripped. Backs `$(wildcard ...)`.
    fn glob(&self, cwd: &Path, pattern: &str) -> Vec<String>;
}

/// Captured output of a `$(shell ...)` invocation.
#[derive(Debug, Clone)]
pub struct ShellOutput {
    pub stdout: String,
    pub status: i32,
}

/// The default implementation of [`World`], backed by the local filesystem.
pub struct LocalWorld;
pub static LOCAL_WORLD: LocalWorld = LocalWorld;

const SHELL: &str = "/bin/sh";

impl World for LocalWorld {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn mtime(&self, path: &Path) -> std::io::Result<SystemTime> {
        path.metadata()?.modified()
    }

    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn read_file(&self, path: &Path) -> std::io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn run_shell(&self, cwd: &Path, cmd: &str) -> std::io::Result<ShellOutput> {
        let out = Command::new(SHELL)
            .arg("-c")
            .arg(cmd)
            .current_dir(cwd)
            .output()?;
        Ok(ShellOutput {
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            status: out.status.code().unwrap_or(-1),
        })
    }

    fn glob(&self, cwd: &Path, pattern: &str) -> Vec<String> {
        let full = cwd.join(pattern);
        let Some(full) = full.to_str() else {
            return vec![];
        };
        let Ok(paths) = glob::glob(full) else {
            return vec![];
        };
        let mut out: Vec<String> = paths
            .flatten()
            .filter_map(|p| {
                let p = p.strip_prefix(cwd).unwrap_or(&p);
                p.to_str().map(str::to_owned)
            })
            .collect();
        out.sort();
        out
    }
}

/// Split a path string into its directory part, without a trailing slash.
/// `"."` when the path has no directory component.
pub fn dir_part(word: &str) -> &str {
    match word.rfind('/') {
        Some(0) => "/",
        Some(i) => &word[..i],
        None => ".",
    }
}

/// The part of a path string after the last slash.
pub fn file_part(word: &str) -> &str {
    match word.rfind('/') {
        Some(i) => &word[i + 1..],
        None => word,
    }
}
