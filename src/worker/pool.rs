//! The coordinator-side worker table: long-lived local (fork/exec) and remote
//! (stdio over SSH) workers, leased one task at a time.

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::progress::Progress;
use crate::worker::{self, TaskSpec, TaskStatus, WorkerReply};

/// How long a worker may keep running after `SHUTDOWN` before it is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of workers, i.e. the `-j` parallelism.
    pub jobs: usize,
    /// Remote hosts; empty means local workers only.
    pub ssh_hosts: Vec<String>,
    /// Program to re-exec for local workers.
    pub program: PathBuf,
    /// How many dead workers may be replaced before giving up.
    pub retry_budget: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            jobs: 1,
            ssh_hosts: Vec::new(),
            program: PathBuf::from("smak"),
            retry_budget: 3,
        }
    }
}

struct Worker {
    child: Child,
    tx: ChildStdin,
    rx: BufReader<ChildStdout>,
    desc: String,
}

#[derive(Default)]
struct PoolInner {
    idle: Vec<Worker>,
    /// Workers currently alive, leased or idle.
    live: usize,
    replacements: usize,
    next_host: usize,
}

/// Spawns workers lazily up to the configured parallelism and leases them to
/// the scheduler's task threads. Each worker runs recipes sequentially.
pub struct WorkerPool {
    cfg: WorkerConfig,
    env: Vec<(String, String)>,
    inner: Mutex<PoolInner>,
    available: Condvar,
}

impl WorkerPool {
    /// Create the pool. The environment is snapshotted here; `export`
    /// directives seen later only affect freshly spawned workers of a new
    /// pool.
    pub fn new(cfg: WorkerConfig, env: Vec<(String, String)>) -> Self {
        Self {
            cfg,
            env,
            inner: Mutex::new(PoolInner::default()),
            available: Condvar::new(),
        }
    }

    /// Run one task's external commands and trailing built-ins on a leased
    /// worker, streaming output to `progress`.
    ///
    /// A worker that dies mid-task fails the task and is replaced; exhausting
    /// the replacement budget is fatal.
    pub fn run_task(&self, spec: &TaskSpec, progress: &dyn Progress) -> std::io::Result<TaskStatus> {
        let mut worker = self.lease()?;
        match drive(&mut worker, spec, progress) {
            Ok(status) => {
                self.release(worker);
                Ok(status)
            }
            Err(e) => {
                warn!("worker {} lost during task {}: {e}", worker.desc, spec.id);
                let _ = worker.child.kill();
                let _ = worker.child.wait();
                let exhausted = {
                    let mut inner = self.inner.lock().unwrap();
                    inner.live -= 1;
                    inner.replacements += 1;
                    inner.replacements > self.cfg.retry_budget
                };
                self.available.notify_one();
                if exhausted {
                    return Err(std::io::Error::other(format!(
                        "worker replacement budget ({}) exhausted: {e}",
                        self.cfg.retry_budget
                    )));
                }
                Ok(TaskStatus::Failed(2))
            }
        }
    }

    fn lease(&self) -> std::io::Result<Worker> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(worker) = inner.idle.pop() {
                return Ok(worker);
            }
            if inner.live < self.cfg.jobs.max(1) {
                inner.live += 1;
                let host = inner.next_host;
                inner.next_host += 1;
                drop(inner);
                return self.spawn_worker(host).inspect_err(|_| {
                    self.inner.lock().unwrap().live -= 1;
                    self.available.notify_one();
                });
            }
            inner = self.available.wait(inner).unwrap();
        }
    }

    fn release(&self, worker: Worker) {
        self.inner.lock().unwrap().idle.push(worker);
        self.available.notify_one();
    }

    fn spawn_worker(&self, index: usize) -> std::io::Result<Worker> {
        let (mut command, desc) = if self.cfg.ssh_hosts.is_empty() {
            let mut c = Command::new(&self.cfg.program);
            c.arg("--worker");
            (c, format!("local#{index}"))
        } else {
            let host = &self.cfg.ssh_hosts[index % self.cfg.ssh_hosts.len()];
            let mut c = Command::new("ssh");
            c.arg(host).arg("smak").arg("--worker");
            (c, format!("ssh:{host}#{index}"))
        };
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        info!("spawning worker {desc}");
        let mut child = command.spawn()?;
        let mut tx = child.stdin.take().expect("stdin was piped");
        let mut rx = BufReader::new(child.stdout.take().expect("stdout was piped"));

        // Handshake: READY, then the exported environment snapshot.
        let mut line = String::new();
        rx.read_line(&mut line)?;
        if line.trim_end() != worker::READY {
            let _ = child.kill();
            return Err(std::io::Error::other(format!(
                "worker {desc} did not report READY (got `{}')",
                line.trim_end()
            )));
        }
        worker::write_env(&mut tx, &self.env)?;

        Ok(Worker {
            child,
            tx,
            rx,
            desc,
        })
    }

    /// Send `SHUTDOWN` to every idle worker and reap them, escalating to kill
    /// after a bounded grace period.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        for mut worker in inner.idle.drain(..) {
            let _ = worker::write_shutdown(&mut worker.tx);
            wait_with_grace(&mut worker.child, SHUTDOWN_GRACE);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn drive(worker: &mut Worker, spec: &TaskSpec, progress: &dyn Progress) -> std::io::Result<TaskStatus> {
    worker::write_task(&mut worker.tx, spec)?;
    let mut status = TaskStatus::Success;

    loop {
        let mut line = String::new();
        if worker.rx.read_line(&mut line)? == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "worker stream closed mid-task",
            ));
        }
        let line = line.trim_end_matches(['\n', '\r']);
        match worker::parse_reply(line) {
            Some(WorkerReply::Out { text, .. }) => {
                progress.task_output(&spec.target, &text, false);
            }
            Some(WorkerReply::Err { text, .. }) => {
                progress.task_output(&spec.target, &text, true);
            }
            Some(WorkerReply::Done { code, .. }) => {
                if code != 0 {
                    status = TaskStatus::Failed(code);
                }
            }
            Some(WorkerReply::Ready) => {
                debug!(id = spec.id, ?status, "task finished, worker idle");
                return Ok(status);
            }
            None => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unparseable worker reply `{line}'"),
                ));
            }
        }
    }
}

/// Bounded wait: poll with `try_wait`, then escalate to kill. Never blocks on
/// a process that has already exited.
fn wait_with_grace(child: &mut Child, grace: Duration) {
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(20));
            }
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return;
            }
        }
    }
}
