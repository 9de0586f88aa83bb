//! The worker side of the protocol: a long-lived loop that runs recipe lines
//! sequentially and streams their output back to the coordinator.

use std::io::{BufRead, Write};
use std::path::Path;
use std::process::Command;

use tracing::debug;

use crate::builtin;
use crate::worker::{CoordMsg, WireTask, WorkerReply, read_msg, write_reply};

const SHELL: &str = "/bin/sh";

/// Serve tasks until `SHUTDOWN` or end of stream.
pub fn serve(mut input: impl BufRead, mut output: impl Write) -> std::io::Result<()> {
    write_reply(&mut output, &WorkerReply::Ready)?;
    let mut env: Vec<(String, String)> = Vec::new();

    loop {
        match read_msg(&mut input)? {
            None | Some(CoordMsg::Shutdown) => return Ok(()),
            Some(CoordMsg::Env(e)) => env = e,
            Some(CoordMsg::Task(task)) => {
                let id = task.id;
                let code = run_task(&task, &env, &mut output)?;
                write_reply(&mut output, &WorkerReply::Done { id, code })?;
                write_reply(&mut output, &WorkerReply::Ready)?;
            }
        }
    }
}

fn run_task(
    task: &WireTask,
    env: &[(String, String)],
    output: &mut impl Write,
) -> std::io::Result<i32> {
    let mut status = 0;

    for raw in &task.cmds {
        let (cmd, ignore_err) = match raw.strip_prefix('-') {
            Some(rest) => (rest, true),
            None => (raw.as_str(), false),
        };
        debug!(id = task.id, cmd, "running recipe line");
        let code = run_shell_line(task.id, &task.dir, cmd, env, output)?;
        if code != 0 && !ignore_err {
            status = code;
            break;
        }
    }

    if status == 0 {
        for descriptor in &task.builtins {
            let Some(cmd) = builtin::recognize(descriptor, &["smak"]) else {
                stream(output, task.id, true, &format!("bad builtin `{descriptor}'"))?;
                status = 2;
                break;
            };
            let mut echo_err: std::io::Result<()> = Ok(());
            let result = cmd.execute(&task.dir, &mut |line| {
                if echo_err.is_ok() {
                    echo_err = stream(output, task.id, false, line);
                }
            });
            echo_err?;
            if let Err(e) = result {
                stream(output, task.id, true, &format!("{descriptor}: {e}"))?;
                status = 2;
                break;
            }
        }
    }

    Ok(status)
}

fn run_shell_line(
    id: u64,
    dir: &Path,
    cmd: &str,
    env: &[(String, String)],
    output: &mut impl Write,
) -> std::io::Result<i32> {
    // The line reaches the shell unmodified apart from prefix stripping; no
    // splitting, no re-quoting.
    let mut command = Command::new(SHELL);
    command.arg("-c").arg(cmd);
    if dir.as_os_str().len() > 0 {
        command.current_dir(dir);
    }
    for (key, value) in env {
        command.env(key, value);
    }

    let out = match command.output() {
        Ok(out) => out,
        Err(e) => {
            stream(output, id, true, &format!("{SHELL}: {e}"))?;
            return Ok(127);
        }
    };
    for line in String::from_utf8_lossy(&out.stdout).lines() {
        stream(output, id, false, line)?;
    }
    for line in String::from_utf8_lossy(&out.stderr).lines() {
        stream(output, id, true, line)?;
    }
    Ok(out.status.code().unwrap_or(-1))
}

fn stream(output: &mut impl Write, id: u64, is_err: bool, text: &str) -> std::io::Result<()> {
    let reply = if is_err {
        WorkerReply::Err {
            id,
            text: text.to_string(),
        }
    } else {
        WorkerReply::Out {
            id,
            text: text.to_string(),
        }
    };
    write_reply(output, &reply)
}

/// Loopback self-test of the serve loop, used by `--test-worker`. Feeds a
/// scripted conversation through [`serve`] and checks the replies.
pub fn self_test() -> std::io::Result<()> {
    let script = "ENV_START\nSMAK_SELF_TEST=1\nENV_END\n\
                  TASK 1\nDIR .\nEXTERNAL_CMDS 1\necho smak-worker-ok\nTRAILING_BUILTINS 0\n\
                  SHUTDOWN\n";
    let mut replies = Vec::new();
    serve(std::io::Cursor::new(script), &mut replies)?;

    let text = String::from_utf8_lossy(&replies);
    let lines: Vec<&str> = text.lines().collect();
    let expected = [
        "READY",
        "OUT 1 smak-worker-ok",
        "DONE 1 0",
        "READY",
    ];
    if lines != expected {
        return Err(std::io::Error::other(format!(
            "worker self-test failed: got {lines:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_then_shutdown() {
        let mut out = Vec::new();
        serve(std::io::Cursor::new("SHUTDOWN\n"), &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "READY\n");
    }

    #[test]
    fn eof_is_a_clean_exit() {
        let mut out = Vec::new();
        serve(std::io::Cursor::new(""), &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "READY\n");
    }

    #[test]
    fn builtin_task_runs_without_a_shell() {
        let dir = std::env::temp_dir().join(format!("smak-serve-test-{}", std::process::id()));
        let _ = std::fs::create_dir_all(&dir);
        let script = format!(
            "TASK 4\nDIR {}\nEXTERNAL_CMDS 0\nTRAILING_BUILTINS 2\necho from-builtin\ntouch serve-stamp\nSHUTDOWN\n",
            dir.display()
        );
        let mut out = Vec::new();
        serve(std::io::Cursor::new(script), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("OUT 4 from-builtin"));
        assert!(text.contains("DONE 4 0"));
        assert!(dir.join("serve-stamp").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn worker_self_test_passes() {
        self_test().unwrap();
    }
}
