//! Build scheduling: topological dispatch over the target graph.
//!
//! # The state machine
//!
//! The coordinator tracks the state of each materialised target node. Rules
//! for initialisation, with graph edges pointing from the dependent to its
//! dependency:
//!
//! - Each node reachable from the requested goals is tracked.
//! - A node starts out fresh; its pending-input count is its out-degree.
//!
//! Rules for driving the states forward:
//!
//! - A fresh node with no pending inputs joins the ready set. Ready nodes are
//!   dispatched by rule declaration order, ties broken lexicographically,
//!   while fewer than `parallelism` tasks are running.
//! - A successfully finished node (built or up-to-date) decrements the
//!   pending-input count of each dependent; a count reaching zero makes the
//!   dependent ready. This transition happens before the dependent can start.
//! - A failed node marks all transitive dependents skipped. Without `-k` the
//!   coordinator additionally stops dispatching, awaits the tasks already
//!   running and exits; with `-k` independent ready nodes keep running.
//!
//! An in-progress prerequisite therefore can never be re-queued: dependents
//! only leave the pending state after the prerequisite has finished.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, RwLock, mpsc};

use indexmap::IndexSet;
use petgraph::visit::{Dfs, Reversed};
use rayon::Scope;
use smol_str::SmolStr;
use tracing::{debug, info};

use crate::builtin::{self, BuiltinCmd};
use crate::db::{CacheDb, CacheRecord, CacheStatus, Fingerprint};
use crate::graph::{NodeId, TargetGraph, TargetNode, fingerprint_node, hash_file_stamp};
use crate::progress::Progress;
use crate::worker::{TaskSpec, TaskStatus};
use crate::world::World;

/// The seam through which recipes actually run. Implemented by the engine
/// (worker pool plus in-process built-ins) and by test mocks.
pub trait TaskRunner: Send + Sync {
    fn run_task(&self, spec: &TaskSpec, progress: &dyn Progress) -> std::io::Result<TaskStatus>;
}

#[derive(Debug, Clone)]
pub struct ExecConfig {
    /// The maximum number of tasks that can execute in parallel (`-j`).
    pub parallelism: usize,
    /// `-k`: keep building independent subtrees after a failure.
    pub keep_going: bool,
    /// `-n`: print recipes without executing (`+` lines still run).
    pub dry_run: bool,
    /// Echo even `@`-prefixed lines.
    pub echo_all: bool,
    pub use_cache: bool,
    /// Recognise trivial recipe lines and run them in-process.
    pub builtins_enabled: bool,
    /// Abort if a recursive self-invocation would reach an external worker.
    pub assert_no_spawn: bool,
    /// Program names that count as a recursive self-invocation.
    pub self_names: Vec<String>,
    /// Working directory tasks run in.
    pub dir: PathBuf,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            parallelism: 1,
            keep_going: false,
            dry_run: false,
            echo_all: false,
            use_cache: false,
            builtins_enabled: true,
            assert_no_spawn: false,
            self_names: vec!["smak".to_string()],
            dir: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatusKind {
    /// Not yet ready to run.
    Fresh,
    /// In the ready set, waiting for a dispatch slot.
    Queued,
    /// Dispatched to the thread pool.
    Started,
    /// Nothing to do; the target was current.
    UpToDate,
    /// The recipe ran and succeeded.
    Succeeded,
    Failed,
    /// Not run because a dependency failed.
    Skipped,
}

impl NodeStatusKind {
    fn is_finished(self) -> bool {
        matches!(
            self,
            NodeStatusKind::UpToDate
                | NodeStatusKind::Failed
                | NodeStatusKind::Succeeded
                | NodeStatusKind::Skipped
        )
    }

    fn is_successful(self) -> bool {
        matches!(self, NodeStatusKind::UpToDate | NodeStatusKind::Succeeded)
    }
}

#[derive(Debug, Clone)]
struct NodeStatus {
    kind: NodeStatusKind,
    /// Dependencies of this node that have yet to finish successfully.
    pending_inputs: usize,
}

/// Shared state handed to each build task.
struct SharedState<'a> {
    cfg: &'a ExecConfig,
    graph: &'a TargetGraph,
    world: &'a dyn World,
    db: Option<&'a dyn CacheDb>,
    runner: &'a dyn TaskRunner,
    progress: &'a dyn Progress,
    pool: rayon::ThreadPool,
    /// Exported environment subset, part of every fingerprint.
    env: Vec<(String, String)>,
    /// Nodes whose recipes actually ran this session. A dependent of such a
    /// node is out-of-date regardless of mtimes.
    ran: RwLock<HashSet<NodeId>>,
    fingerprints: RwLock<HashMap<NodeId, Fingerprint>>,
}

#[derive(Debug, Default)]
pub struct ExecSummary {
    /// Targets whose recipes failed, in completion order.
    pub failed: Vec<SmolStr>,
    pub ran: usize,
    pub up_to_date: usize,
}

impl ExecSummary {
    pub fn success(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug)]
struct NodeResult {
    id: NodeId,
    /// Only `Err` when a coordinator-side error must abort the run.
    result: std::io::Result<NodeStatusKind>,
}

pub struct Executor<'a> {
    state: Arc<SharedState<'a>>,

    /// Nodes that can be started as soon as a slot frees up.
    pending: IndexSet<NodeId>,
    builds: HashMap<NodeId, NodeStatus>,

    running: usize,
    finished: usize,
    summary: ExecSummary,
    /// Set on failure without `-k`: stop dispatching, drain running tasks.
    halting: bool,

    build_started: bool,
}

impl<'a> Executor<'a> {
    pub fn new(
        cfg: &'a ExecConfig,
        graph: &'a TargetGraph,
        world: &'a dyn World,
        db: Option<&'a dyn CacheDb>,
        runner: &'a dyn TaskRunner,
        progress: &'a dyn Progress,
        env: Vec<(String, String)>,
    ) -> Self {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(cfg.parallelism.max(1))
            .build()
            .expect("failed to build scheduler thread pool");

        let state = SharedState {
            cfg,
            graph,
            world,
            db,
            runner,
            progress,
            pool,
            env,
            ran: RwLock::new(HashSet::new()),
            fingerprints: RwLock::new(HashMap::new()),
        };
        Self {
            state: Arc::new(state),
            pending: IndexSet::new(),
            builds: HashMap::new(),
            running: 0,
            finished: 0,
            summary: ExecSummary::default(),
            halting: false,
            build_started: false,
        }
    }

    /// Track `goals` and their dependency closure. Returns the number of
    /// nodes affected. Must be called before [`Self::run`].
    #[tracing::instrument(skip_all)]
    pub fn want(&mut self, goals: impl IntoIterator<Item = NodeId>) -> usize {
        if self.build_started {
            panic!("cannot call want() after run()");
        }

        let mut affected = 0usize;
        let mut dfs_stack: Vec<NodeId> = goals.into_iter().collect();

        while let Some(id) = dfs_stack.pop() {
            if self.builds.contains_key(&id) {
                continue;
            }
            affected += 1;

            let mut input_count = 0usize;
            for dep in self.state.graph.dependencies(id) {
                input_count += 1;
                dfs_stack.push(dep);
            }
            let kind = if input_count == 0 {
                self.pending.insert(id);
                NodeStatusKind::Queued
            } else {
                NodeStatusKind::Fresh
            };
            self.builds.insert(
                id,
                NodeStatus {
                    kind,
                    pending_inputs: input_count,
                },
            );
        }
        affected
    }

    /// Perform the build.
    #[tracing::instrument(skip_all)]
    pub fn run(mut self) -> Result<ExecSummary, std::io::Error> {
        self.build_started = true;

        let state = self.state.clone();
        let (tx, rx) = mpsc::channel::<NodeResult>();
        state
            .pool
            .in_place_scope(|pool| self.run_inner(pool, tx, &rx))?;
        drop(rx);

        self.state.progress.finish();
        Ok(self.summary)
    }

    fn run_inner<'scope>(
        &mut self,
        pool: &Scope<'scope>,
        tx: mpsc::Sender<NodeResult>,
        rx: &mpsc::Receiver<NodeResult>,
    ) -> Result<(), std::io::Error>
    where
        'a: 'scope,
    {
        loop {
            debug!(
                running = self.running,
                pending = self.pending.len(),
                finished = self.finished,
                total = self.builds.len(),
                failed = self.summary.failed.len(),
                "scheduler iteration"
            );

            // Fill free slots in deterministic order.
            while !self.halting && self.running < self.state.cfg.parallelism.max(1) {
                let Some(id) = self.pop_ready() else { break };
                self.start_node(pool, tx.clone(), id);
            }

            if self.finished == self.builds.len() {
                info!("all targets finished");
                break;
            }
            if self.running == 0 {
                if self.halting {
                    break;
                }
                panic!("no tasks in progress, but not all targets finished. This is a bug.");
            }

            let msg = rx.recv().expect("completion channel cannot close here");
            debug!(?msg, "task finished");
            self.node_finished(msg)?;
        }
        Ok(())
    }

    /// The ready node with the best (declaration order, name) priority.
    fn pop_ready(&mut self) -> Option<NodeId> {
        let best = self
            .pending
            .iter()
            .copied()
            .min_by_key(|&id| {
                let node = self.state.graph.node(id);
                (node.seq, node.name.clone())
            })?;
        self.pending.shift_remove(&best);
        Some(best)
    }

    fn start_node<'scope>(
        &mut self,
        pool: &Scope<'scope>,
        tx: mpsc::Sender<NodeResult>,
        id: NodeId,
    ) where
        'a: 'scope,
    {
        info!(?id, target = %self.state.graph.node(id).name, "starting");
        self.builds.get_mut(&id).expect("node is tracked").kind = NodeStatusKind::Started;
        self.running += 1;

        let state = self.state.clone();
        pool.spawn(move |_| run_node(state, id, tx));
    }

    fn node_finished(&mut self, msg: NodeResult) -> Result<(), std::io::Error> {
        let id = msg.id;
        let kind = msg.result?;
        if !kind.is_finished() {
            panic!("node {id:?} reported non-final status {kind:?}. This is a bug.");
        }

        self.running -= 1;
        self.finished += 1;

        let status = self.builds.get_mut(&id).expect("node is tracked");
        if status.kind.is_finished() {
            panic!("node {id:?} finished twice. This is a bug.");
        }
        status.kind = kind;

        match kind {
            NodeStatusKind::Succeeded | NodeStatusKind::UpToDate => {
                if kind == NodeStatusKind::Succeeded {
                    self.summary.ran += 1;
                    self.write_cache_record(id);
                } else {
                    self.summary.up_to_date += 1;
                }
                for dependent in self.state.graph.dependents(id) {
                    let Some(dep) = self.builds.get_mut(&dependent) else {
                        continue;
                    };
                    if dep.kind.is_finished() {
                        // Already failed or skipped through another path.
                        continue;
                    }
                    dep.pending_inputs -= 1;
                    if dep.pending_inputs == 0 && dep.kind == NodeStatusKind::Fresh {
                        dep.kind = NodeStatusKind::Queued;
                        self.pending.insert(dependent);
                    }
                }
            }
            NodeStatusKind::Failed => {
                let node = self.state.graph.node(id);
                self.summary.failed.push(node.name.clone());
                self.invalidate_cache_record(id);
                self.skip_dependents(id);
                if !self.state.cfg.keep_going {
                    self.halting = true;
                }
            }
            NodeStatusKind::Skipped => unreachable!("tasks never report Skipped"),
            NodeStatusKind::Fresh | NodeStatusKind::Queued | NodeStatusKind::Started => {
                unreachable!("checked by is_finished")
            }
        }
        Ok(())
    }

    /// Mark every transitive dependent of `id` skipped.
    fn skip_dependents(&mut self, id: NodeId) {
        let reversed = Reversed(&self.state.graph.graph);
        let mut dfs = Dfs::new(reversed, id);
        dfs.next(reversed); // skip `id` itself
        while let Some(dependent) = dfs.next(reversed) {
            let Some(dep) = self.builds.get_mut(&dependent) else {
                continue;
            };
            if dep.kind.is_finished() {
                continue;
            }
            if dep.kind == NodeStatusKind::Queued {
                self.pending.shift_remove(&dependent);
            }
            debug!(?dependent, "skipped: dependency failed");
            dep.kind = NodeStatusKind::Skipped;
            self.finished += 1;
        }
    }

    fn write_cache_record(&self, id: NodeId) {
        let state = &self.state;
        if !state.cfg.use_cache || state.cfg.dry_run {
            return;
        }
        let node = state.graph.node(id);
        if node.phony || node.recipe.is_empty() {
            // Phony completions are never cached (they always re-run).
            return;
        }
        let Some(db) = state.db else { return };
        let fp = compute_fingerprint(state, id);
        // Inputs are recorded by resolved path so that watcher events can
        // invalidate the records they touch.
        let record = CacheRecord {
            recipe_hash: fp,
            inputs: node
                .prereqs
                .iter()
                .map(|&dep| state.graph.node(dep).resolved_path.clone())
                .collect(),
            outputs: vec![PathBuf::from(node.name.as_str())],
            status: CacheStatus::Success,
            timestamp: state.world.now(),
        };
        let mut txn = db.begin_write();
        txn.put(fp, record);
        txn.commit();
    }

    fn invalidate_cache_record(&self, id: NodeId) {
        let state = &self.state;
        if !state.cfg.use_cache {
            return;
        }
        let Some(db) = state.db else { return };
        let fp = compute_fingerprint(state, id);
        let mut txn = db.begin_write();
        txn.invalidate(fp);
        txn.commit();
    }
}

/// Decide whether a node needs its recipe run, then run it. Executes on the
/// scheduler's thread pool.
fn run_node(state: Arc<SharedState<'_>>, id: NodeId, report: mpsc::Sender<NodeResult>) {
    let node = state.graph.node(id);

    let span = tracing::info_span!("run_node", ?id, target = %node.name);
    let _guard = span.enter();

    let result = if !is_outdated(&state, id, node) {
        debug!("up to date");
        Ok(NodeStatusKind::UpToDate)
    } else {
        execute_node(&state, id, node)
    };

    report
        .send(NodeResult { id, result })
        .expect("coordinator dropped the completion channel");
}

/// The up-to-date decision. A target is out-of-date iff it is phony, does not
/// exist, any non-order-only prerequisite is newer or was rebuilt this run,
/// or (with caching enabled) the fingerprint lookup misses.
fn is_outdated(state: &SharedState<'_>, id: NodeId, node: &TargetNode) -> bool {
    if !node.has_rule {
        return false;
    }
    if node.phony {
        return true;
    }
    let target_mtime = match state.world.mtime(&node.resolved_path) {
        Ok(t) => t,
        Err(_) => {
            debug!("outdated: target does not exist");
            return true;
        }
    };

    {
        let ran = state.ran.read().unwrap();
        if node.prereqs.iter().any(|dep| ran.contains(dep)) {
            debug!("outdated: a prerequisite was rebuilt");
            return true;
        }
    }

    for &dep in &node.prereqs {
        let dep_node = state.graph.node(dep);
        if dep_node.phony {
            continue;
        }
        match state.world.mtime(&dep_node.resolved_path) {
            Ok(dep_mtime) if dep_mtime > target_mtime => {
                debug!(prereq = %dep_node.name, "outdated: prerequisite is newer");
                return true;
            }
            Ok(_) => {}
            Err(_) => {
                debug!(prereq = %dep_node.name, "outdated: prerequisite missing");
                return true;
            }
        }
    }

    if state.cfg.use_cache
        && let Some(db) = state.db
    {
        let fp = compute_fingerprint(state, id);
        let hit = db
            .begin_read()
            .get(fp)
            .is_some_and(|rec| rec.status == CacheStatus::Success);
        if !hit {
            debug!("outdated: cache miss for {fp:?}");
            return true;
        }
    }

    false
}

fn execute_node(
    state: &SharedState<'_>,
    id: NodeId,
    node: &TargetNode,
) -> std::io::Result<NodeStatusKind> {
    let cfg = state.cfg;

    if node.recipe.is_empty() {
        if node.phony {
            // A phony prerequisite always counts as remade.
            state.ran.write().unwrap().insert(id);
        }
        return Ok(NodeStatusKind::Succeeded);
    }

    // Echo. `@` suppresses a line unless --echo; dry-run prints everything.
    for line in &node.recipe {
        let visible = cfg.dry_run || cfg.echo_all || (!line.silent && !node.silent);
        if visible {
            state.progress.recipe_line(&node.name, &line.text);
        }
    }

    // Dry-run: nothing executes except `+` lines, but dependents must still
    // see this node as rebuilt.
    if cfg.dry_run {
        let always: Vec<crate::graph::CookedLine> =
            node.recipe.iter().filter(|l| l.always).cloned().collect();
        if !always.is_empty() {
            let spec = TaskSpec {
                id: id.0 as u64,
                target: node.name.to_string(),
                dir: cfg.dir.clone(),
                external: always,
                builtins: Vec::new(),
            };
            let status = state.runner.run_task(&spec, state.progress)?;
            if !status.success() {
                state.progress.target_failed(&node.name, status.code());
                return Ok(NodeStatusKind::Failed);
            }
        }
        state.ran.write().unwrap().insert(id);
        return Ok(NodeStatusKind::Succeeded);
    }

    // Recognise trailing built-ins; anything before the last external line
    // stays external to preserve ordering.
    let self_names: Vec<&str> = cfg.self_names.iter().map(String::as_str).collect();
    let recognized: Vec<Option<BuiltinCmd>> = if cfg.builtins_enabled {
        node.recipe
            .iter()
            .map(|l| builtin::recognize(&l.text, &self_names))
            .collect()
    } else {
        node.recipe.iter().map(|_| None).collect()
    };
    let split = recognized
        .iter()
        .rposition(|r| r.is_none())
        .map(|i| i + 1)
        .unwrap_or(0);

    let external: Vec<crate::graph::CookedLine> = node.recipe[..split].to_vec();
    let builtins: Vec<BuiltinCmd> = recognized[split..]
        .iter()
        .map(|r| r.clone().expect("suffix is fully recognized"))
        .collect();

    if cfg.assert_no_spawn {
        for line in &external {
            if builtin::is_self_invocation(&line.text, &self_names) {
                return Err(std::io::Error::other(format!(
                    "SMAK_ASSERT_NO_SPAWN: recursive invocation `{}' would spawn an external worker",
                    line.text
                )));
            }
        }
    }

    let spec = TaskSpec {
        id: id.0 as u64,
        target: node.name.to_string(),
        dir: cfg.dir.clone(),
        external,
        builtins,
    };
    let status = state.runner.run_task(&spec, state.progress)?;

    if status.success() {
        state.ran.write().unwrap().insert(id);
        Ok(NodeStatusKind::Succeeded)
    } else {
        state.progress.target_failed(&node.name, status.code());
        Ok(NodeStatusKind::Failed)
    }
}

/// Memoized fingerprint of a node: recipe text, prerequisite fingerprints
/// and the exported environment subset.
fn compute_fingerprint(state: &SharedState<'_>, id: NodeId) -> Fingerprint {
    if let Some(fp) = state.fingerprints.read().unwrap().get(&id) {
        return *fp;
    }
    let node = state.graph.node(id);
    let prereq_fps: Vec<Fingerprint> = node
        .prereqs
        .iter()
        .map(|&dep| {
            let dep_node = state.graph.node(dep);
            if dep_node.has_rule {
                compute_fingerprint(state, dep)
            } else {
                hash_file_stamp(
                    &dep_node.name,
                    state.world.mtime(&dep_node.resolved_path).ok(),
                )
            }
        })
        .collect();
    let fp = fingerprint_node(&node.recipe, &prereq_fps, &state.env);
    state.fingerprints.write().unwrap().insert(id, fp);
    fp
}
