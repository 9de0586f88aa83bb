//! The line-oriented wire protocol between the coordinator and its workers.
//!
//! After connect/spawn the worker emits `READY`; the coordinator answers with
//! the exported environment (`ENV_START` .. `ENV_END`). Each task is a `TASK`
//! frame carrying a working directory, the external command lines and any
//! trailing built-in descriptors. The worker streams `OUT`/`ERR` lines tagged
//! with the task id, terminates the task with `DONE <id> <code>` and reports
//! `READY` when idle again. `SHUTDOWN` ends the worker cleanly.
//!
//! This is the stable contract between the coordinator and every worker
//! implementation, local or remote.

pub mod pool;
pub mod serve;

use std::io::{BufRead, Write};
use std::path::PathBuf;

use crate::builtin::BuiltinCmd;
use crate::graph::CookedLine;

pub const READY: &str = "READY";
pub const ENV_START: &str = "ENV_START";
pub const ENV_END: &str = "ENV_END";
pub const SHUTDOWN: &str = "SHUTDOWN";

/// A unit of work dispatched to one executor: the recipe of a single target.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub id: u64,
    /// Target name, for output labelling. Not part of the wire format.
    pub target: String,
    pub dir: PathBuf,
    pub external: Vec<CookedLine>,
    pub builtins: Vec<BuiltinCmd>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Success,
    Failed(i32),
}

impl TaskStatus {
    pub fn success(self) -> bool {
        matches!(self, TaskStatus::Success)
    }

    pub fn code(self) -> i32 {
        match self {
            TaskStatus::Success => 0,
            TaskStatus::Failed(code) => code,
        }
    }
}

/// Coordinator → worker messages, as parsed by the worker side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordMsg {
    Env(Vec<(String, String)>),
    Task(WireTask),
    Shutdown,
}

/// The wire form of a task: command lines keep their `-` prefix so the worker
/// knows which exit statuses to ignore; `@` never reaches the wire (echo is
/// the coordinator's job).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WireTask {
    pub id: u64,
    pub dir: PathBuf,
    pub cmds: Vec<String>,
    pub builtins: Vec<String>,
}

/// Worker → coordinator replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerReply {
    Ready,
    Out { id: u64, text: String },
    Err { id: u64, text: String },
    Done { id: u64, code: i32 },
}

pub fn write_env(w: &mut dyn Write, env: &[(String, String)]) -> std::io::Result<()> {
    writeln!(w, "{ENV_START}")?;
    for (key, value) in env {
        writeln!(w, "{key}={value}")?;
    }
    writeln!(w, "{ENV_END}")?;
    w.flush()
}

pub fn write_task(w: &mut dyn Write, spec: &TaskSpec) -> std::io::Result<()> {
    writeln!(w, "TASK {}", spec.id)?;
    writeln!(w, "DIR {}", spec.dir.display())?;
    writeln!(w, "EXTERNAL_CMDS {}", spec.external.len())?;
    for line in &spec.external {
        let flag = if line.ignore_err { "-" } else { "" };
        writeln!(w, "{flag}{}", line.text)?;
    }
    writeln!(w, "TRAILING_BUILTINS {}", spec.builtins.len())?;
    for builtin in &spec.builtins {
        writeln!(w, "{}", builtin.descriptor())?;
    }
    w.flush()
}

pub fn write_shutdown(w: &mut dyn Write) -> std::io::Result<()> {
    writeln!(w, "{SHUTDOWN}")?;
    w.flush()
}

fn protocol_error(what: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("worker protocol violation: {what}"),
    )
}

fn read_line(r: &mut dyn BufRead) -> std::io::Result<Option<String>> {
    let mut line = String::new();
    if r.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    while line.ends_with(['\n', '\r']) {
        line.pop();
    }
    Ok(Some(line))
}

fn expect_line(r: &mut dyn BufRead) -> std::io::Result<String> {
    read_line(r)?.ok_or_else(|| protocol_error("unexpected end of stream"))
}

/// Read one coordinator message on the worker side. `None` means the stream
/// closed, which the worker treats like `SHUTDOWN`.
pub fn read_msg(r: &mut dyn BufRead) -> std::io::Result<Option<CoordMsg>> {
    let Some(line) = read_line(r)? else {
        return Ok(None);
    };
    if line == SHUTDOWN {
        return Ok(Some(CoordMsg::Shutdown));
    }
    if line == ENV_START {
        let mut env = Vec::new();
        loop {
            let entry = expect_line(r)?;
            if entry == ENV_END {
                break;
            }
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| protocol_error(format!("bad env line `{entry}'")))?;
            env.push((key.to_string(), value.to_string()));
        }
        return Ok(Some(CoordMsg::Env(env)));
    }
    if let Some(id) = line.strip_prefix("TASK ") {
        let id: u64 = id.parse().map_err(|_| protocol_error("bad task id"))?;
        let dir = expect_line(r)?
            .strip_prefix("DIR ")
            .map(PathBuf::from)
            .ok_or_else(|| protocol_error("expected DIR"))?;
        let cmds = read_counted(r, "EXTERNAL_CMDS")?;
        let builtins = read_counted(r, "TRAILING_BUILTINS")?;
        return Ok(Some(CoordMsg::Task(WireTask {
            id,
            dir,
            cmds,
            builtins,
        })));
    }
    Err(protocol_error(format!("unexpected line `{line}'")))
}

fn read_counted(r: &mut dyn BufRead, header: &str) -> std::io::Result<Vec<String>> {
    let line = expect_line(r)?;
    let count: usize = line
        .strip_prefix(header)
        .map(str::trim)
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| protocol_error(format!("expected `{header} <n>', got `{line}'")))?;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(expect_line(r)?);
    }
    Ok(out)
}

pub fn write_reply(w: &mut dyn Write, reply: &WorkerReply) -> std::io::Result<()> {
    match reply {
        WorkerReply::Ready => writeln!(w, "{READY}")?,
        WorkerReply::Out { id, text } => writeln!(w, "OUT {id} {text}")?,
        WorkerReply::Err { id, text } => writeln!(w, "ERR {id} {text}")?,
        WorkerReply::Done { id, code } => writeln!(w, "DONE {id} {code}")?,
    }
    w.flush()
}

pub fn parse_reply(line: &str) -> Option<WorkerReply> {
    if line == READY {
        return Some(WorkerReply::Ready);
    }
    let (kind, rest) = line.split_once(' ')?;
    match kind {
        "OUT" | "ERR" => {
            let (id, text) = match rest.split_once(' ') {
                Some((id, text)) => (id, text),
                None => (rest, ""),
            };
            let id = id.parse().ok()?;
            Some(if kind == "OUT" {
                WorkerReply::Out {
                    id,
                    text: text.to_string(),
                }
            } else {
                WorkerReply::Err {
                    id,
                    text: text.to_string(),
                }
            })
        }
        "DONE" => {
            let (id, code) = rest.split_once(' ')?;
            Some(WorkerReply::Done {
                id: id.parse().ok()?,
                code: code.parse().ok()?,
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::cook_line;
    use std::io::Cursor;

    fn spec() -> TaskSpec {
        TaskSpec {
            id: 7,
            target: "prog".into(),
            dir: PathBuf::from("/work"),
            external: vec![cook_line("cc -c x.c"), cook_line("-rm junk")],
            builtins: vec![crate::builtin::BuiltinCmd::Touch("stamp".into())],
        }
    }

    #[test]
    fn task_frame_round_trip() {
        let mut wire = Vec::new();
        write_task(&mut wire, &spec()).unwrap();
        let text = String::from_utf8(wire.clone()).unwrap();
        assert_eq!(
            text,
            "TASK 7\nDIR /work\nEXTERNAL_CMDS 2\ncc -c x.c\n-rm junk\nTRAILING_BUILTINS 1\ntouch stamp\n"
        );

        let mut r = Cursor::new(wire);
        let msg = read_msg(&mut r).unwrap().unwrap();
        let CoordMsg::Task(task) = msg else {
            panic!("expected task");
        };
        assert_eq!(task.id, 7);
        assert_eq!(task.dir, PathBuf::from("/work"));
        assert_eq!(task.cmds, vec!["cc -c x.c", "-rm junk"]);
        assert_eq!(task.builtins, vec!["touch stamp"]);
    }

    #[test]
    fn env_frame_round_trip() {
        let env = vec![
            ("CC".to_string(), "cc".to_string()),
            ("PATH".to_string(), "/bin:/usr/bin".to_string()),
        ];
        let mut wire = Vec::new();
        write_env(&mut wire, &env).unwrap();
        let mut r = Cursor::new(wire);
        assert_eq!(read_msg(&mut r).unwrap(), Some(CoordMsg::Env(env)));
    }

    #[test]
    fn shutdown_and_eof() {
        let mut wire = Vec::new();
        write_shutdown(&mut wire).unwrap();
        let mut r = Cursor::new(wire);
        assert_eq!(read_msg(&mut r).unwrap(), Some(CoordMsg::Shutdown));
        assert_eq!(read_msg(&mut r).unwrap(), None);
    }

    #[test]
    fn replies_round_trip() {
        for reply in [
            WorkerReply::Ready,
            WorkerReply::Out {
                id: 3,
                text: "building".into(),
            },
            WorkerReply::Err {
                id: 3,
                text: "warning: x".into(),
            },
            WorkerReply::Done { id: 3, code: 2 },
        ] {
            let mut wire = Vec::new();
            write_reply(&mut wire, &reply).unwrap();
            let line = String::from_utf8(wire).unwrap();
            assert_eq!(parse_reply(line.trim_end()), Some(reply));
        }
        assert_eq!(parse_reply("GARBAGE 1"), None);
    }

    #[test]
    fn malformed_frames_are_rejected() {
        let mut r = Cursor::new(b"TASK nope\n".to_vec());
        assert!(read_msg(&mut r).is_err());

        let mut r = Cursor::new(b"TASK 1\nEXTERNAL_CMDS 0\n".to_vec());
        assert!(read_msg(&mut r).is_err()); // DIR is mandatory
    }
}
