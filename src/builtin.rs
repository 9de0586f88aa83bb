//! Recognition of trivial recipe lines that can run in-process instead of
//! being dispatched to a worker.
//!
//! The set is closed: `rm -f`, `mkdir -p`, `cp`, `touch`, `echo`, and the
//! recursive self-invocation form. A line containing shell metacharacters is
//! never a built-in; it goes to the shell unmodified.

use std::fs;
use std::path::Path;

use tracing::debug;

/// Characters that force a line through the shell.
const SHELL_META: &[char] = &[
    '|', '&', ';', '<', '>', '(', ')', '$', '`', '"', '\'', '*', '?', '[', ']', '#', '~', '!',
    '\n',
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuiltinCmd {
    /// `rm -f FILE...` — missing files are not an error.
    RmF(Vec<String>),
    /// `mkdir -p DIR`
    MkdirP(String),
    /// `cp SRC DST`
    Cp(String, String),
    /// `touch FILE`
    Touch(String),
    /// `echo TEXT`
    Echo(String),
    /// `<this-program> [-C dir] [-f file] [-j N] [targets...]`
    Recurse(RecurseSpec),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecurseSpec {
    pub directory: Option<String>,
    pub makefile: Option<String>,
    pub jobs: Option<usize>,
    pub targets: Vec<String>,
}

/// Try to recognise one recipe line. `self_names` are the program names that
/// mark a recursive self-invocation (argv0 basename and `smak`).
pub fn recognize(line: &str, self_names: &[&str]) -> Option<BuiltinCmd> {
    if line.contains(SHELL_META) {
        return None;
    }
    let words = shlex::split(line)?;
    let (head, rest) = words.split_first()?;

    let base = Path::new(head)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(head);
    if self_names.contains(&base) {
        return parse_recurse(rest).map(BuiltinCmd::Recurse);
    }

    match (base, rest) {
        ("rm", [flag, files @ ..]) if flag == "-f" && !files.is_empty() => {
            Some(BuiltinCmd::RmF(files.to_vec()))
        }
        ("mkdir", [flag, dir]) if flag == "-p" => Some(BuiltinCmd::MkdirP(dir.clone())),
        ("cp", [src, dst]) => Some(BuiltinCmd::Cp(src.clone(), dst.clone())),
        ("touch", [file]) => Some(BuiltinCmd::Touch(file.clone())),
        ("echo", _) => Some(BuiltinCmd::Echo(rest.join(" "))),
        _ => None,
    }
}

/// Whether a line is a recursive self-invocation. Checked before any line is
/// handed to an external worker.
pub fn is_self_invocation(line: &str, self_names: &[&str]) -> bool {
    matches!(recognize(line, self_names), Some(BuiltinCmd::Recurse(_)))
}

fn parse_recurse(args: &[String]) -> Option<RecurseSpec> {
    let mut spec = RecurseSpec::default();
    let mut it = args.iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-C" => spec.directory = Some(it.next()?.clone()),
            "-f" => spec.makefile = Some(it.next()?.clone()),
            "-j" => spec.jobs = it.next()?.parse().ok(),
            a if a.starts_with('-') => return None,
            _ => spec.targets.push(arg.clone()),
        }
    }
    Some(spec)
}

impl BuiltinCmd {
    /// The original-command form, used as the wire descriptor and for echo.
    pub fn descriptor(&self) -> String {
        match self {
            BuiltinCmd::RmF(files) => format!("rm -f {}", files.join(" ")),
            BuiltinCmd::MkdirP(dir) => format!("mkdir -p {dir}"),
            BuiltinCmd::Cp(src, dst) => format!("cp {src} {dst}"),
            BuiltinCmd::Touch(file) => format!("touch {file}"),
            BuiltinCmd::Echo(text) => format!("echo {text}"),
            BuiltinCmd::Recurse(spec) => {
                let mut parts = vec!["smak".to_string()];
                if let Some(d) = &spec.directory {
                    parts.push("-C".into());
                    parts.push(d.clone());
                }
                if let Some(f) = &spec.makefile {
                    parts.push("-f".into());
                    parts.push(f.clone());
                }
                if let Some(j) = spec.jobs {
                    parts.push("-j".into());
                    parts.push(j.to_string());
                }
                parts.extend(spec.targets.iter().cloned());
                parts.join(" ")
            }
        }
    }

    /// Execute in-process, relative to `dir`. Recursive invocations are the
    /// caller's job; they re-enter the engine rather than running here.
    pub fn execute(&self, dir: &Path, out: &mut dyn FnMut(&str)) -> std::io::Result<()> {
        debug!("builtin: {}", self.descriptor());
        match self {
            BuiltinCmd::RmF(files) => {
                for file in files {
                    match fs::remove_file(dir.join(file)) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            }
            BuiltinCmd::MkdirP(d) => fs::create_dir_all(dir.join(d)),
            BuiltinCmd::Cp(src, dst) => fs::copy(dir.join(src), dir.join(dst)).map(|_| ()),
            BuiltinCmd::Touch(file) => {
                let path = dir.join(file);
                match fs::OpenOptions::new().append(true).create(true).open(&path) {
                    Ok(f) => {
                        let now = std::time::SystemTime::now();
                        let _ = f.set_times(fs::FileTimes::new().set_modified(now));
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            BuiltinCmd::Echo(text) => {
                out(text);
                Ok(())
            }
            BuiltinCmd::Recurse(_) => Err(std::io::Error::other(
                "recursive invocation must re-enter the engine",
            )),
        }
    }
}
