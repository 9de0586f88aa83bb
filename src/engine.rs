//! The driver tying the stores together: parse the makefiles, pick the goals,
//! materialise the graph and run the scheduler.
//!
//! Recursive self-invocations re-enter [`build`] with a fresh variable store
//! and rule database scoped to the sub-directory, sharing the worker pool of
//! the enclosing run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use smol_str::SmolStr;
use tracing::{debug, info};

use crate::builtin::{BuiltinCmd, RecurseSpec};
use crate::db::CacheDb;
use crate::exec::{ExecConfig, Executor, TaskRunner};
use crate::graph::{GraphError, NodeId, TargetGraph, materialize};
use crate::parse::{ParseError, Parser};
use crate::progress::Progress;
use crate::rules::{RuleError, RuleSet};
use crate::vars::{Expander, Flavor, Origin, VarStore};
use crate::watch::{FsEventKind, Watcher};
use crate::worker::pool::{WorkerConfig, WorkerPool};
use crate::worker::{TaskSpec, TaskStatus};
use crate::world::World;

/// Makefile names tried in order when `-f` is not given.
const DEFAULT_MAKEFILES: &[&str] = &["Smakfile", "Makefile", "makefile"];

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// `-f FILE`, repeatable. Empty means search the default names.
    pub makefiles: Vec<PathBuf>,
    /// Working directory, after `-C`.
    pub directory: PathBuf,
    pub goals: Vec<String>,
    pub jobs: usize,
    pub keep_going: bool,
    pub dry_run: bool,
    pub silent: bool,
    pub echo_all: bool,
    /// `--no-builtins`: skip the built-in implicit rules.
    pub no_builtin_rules: bool,
    /// Recognise trivial recipe lines and run them in-process.
    pub builtin_cmds: bool,
    pub cache_dir: Option<PathBuf>,
    /// `VAR=value` overrides from the command line.
    pub cmdline_vars: Vec<(String, String)>,
    /// Environment snapshot imported into the variable store.
    pub env: Vec<(String, String)>,
    pub assert_no_spawn: bool,
    /// argv0, used for `$(MAKE)` and self-invocation detection.
    pub program: String,
    pub ssh_hosts: Vec<String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            makefiles: Vec::new(),
            directory: PathBuf::from("."),
            goals: Vec::new(),
            jobs: 1,
            keep_going: false,
            dry_run: false,
            silent: false,
            echo_all: false,
            no_builtin_rules: false,
            builtin_cmds: true,
            cache_dir: None,
            cmdline_vars: Vec::new(),
            env: Vec::new(),
            assert_no_spawn: false,
            program: "smak".to_string(),
            ssh_hosts: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error("no makefile found (tried {DEFAULT_MAKEFILES:?})")]
    NoMakefile,

    #[error("no targets specified and no default goal")]
    NoGoal,

    #[error(transparent)]
    Exec(#[from] std::io::Error),
}

#[derive(Debug, Default)]
pub struct BuildOutcome {
    pub failed: Vec<SmolStr>,
    pub ran: usize,
    pub up_to_date: usize,
}

impl BuildOutcome {
    pub fn success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 2 }
    }
}

/// Everything needed to run one build: the parsed stores plus the
/// materialised graph for the selected goals.
pub struct Plan {
    pub vars: VarStore,
    pub rules: RuleSet,
    pub graph: TargetGraph,
    pub goal_ids: Vec<NodeId>,
    pub goals: Vec<String>,
}

/// Parse the makefiles into fresh stores.
pub fn load(opts: &EngineOptions, world: &dyn World) -> Result<(VarStore, RuleSet), EngineError> {
    let mut vars = VarStore::with_defaults();
    vars.import_env(opts.env.iter().cloned());
    vars.assign(
        "MAKE",
        opts.program.clone(),
        Flavor::Recursive,
        Origin::Default,
    );
    for (name, value) in &opts.cmdline_vars {
        vars.assign(name, value.clone(), Flavor::Recursive, Origin::CommandLine);
    }

    let mut rules = if opts.no_builtin_rules {
        RuleSet::new()
    } else {
        RuleSet::with_builtins()
    };

    let files: Vec<PathBuf> = if opts.makefiles.is_empty() {
        let found = DEFAULT_MAKEFILES
            .iter()
            .map(PathBuf::from)
            .find(|f| world.exists(&opts.directory.join(f)));
        vec![found.ok_or(EngineError::NoMakefile)?]
    } else {
        opts.makefiles.clone()
    };

    {
        let mut parser = Parser::new(&mut vars, &mut rules, world, &opts.directory);
        for file in &files {
            info!("reading {}", file.display());
            parser.parse_file(file)?;
        }
    }

    let mut ex = Expander::new(&vars, world, &opts.directory);
    rules.finalize(&mut ex)?;
    Ok((vars, rules))
}

/// Load and materialise the dependency closure of the requested goals.
pub fn plan(opts: &EngineOptions, world: &dyn World) -> Result<Plan, EngineError> {
    let (vars, mut rules) = load(opts, world)?;
    if opts.silent {
        rules.set_all_silent();
    }

    let goals: Vec<String> = if opts.goals.is_empty() {
        let goal = rules.default_goal().ok_or(EngineError::NoGoal)?;
        vec![goal.to_string()]
    } else {
        opts.goals.clone()
    };
    debug!(?goals, "selected goals");

    let (graph, goal_ids) = materialize(&rules, &vars, world, &opts.directory, &goals)?;
    Ok(Plan {
        vars,
        rules,
        graph,
        goal_ids,
        goals,
    })
}

/// Run a prepared plan through the scheduler.
pub fn run_plan(
    opts: &EngineOptions,
    plan: &Plan,
    world: &dyn World,
    db: Option<&dyn CacheDb>,
    runner: &dyn TaskRunner,
    progress: &dyn Progress,
) -> Result<BuildOutcome, EngineError> {
    let self_name = Path::new(&opts.program)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(&opts.program)
        .to_string();
    let mut self_names = vec![self_name];
    if !self_names.contains(&"smak".to_string()) {
        self_names.push("smak".to_string());
    }

    let cfg = ExecConfig {
        parallelism: opts.jobs.max(1),
        keep_going: opts.keep_going,
        dry_run: opts.dry_run,
        echo_all: opts.echo_all,
        use_cache: db.is_some(),
        builtins_enabled: opts.builtin_cmds,
        assert_no_spawn: opts.assert_no_spawn,
        self_names,
        dir: opts.directory.clone(),
    };
    let env = exported_env(&plan.vars, world, &opts.directory);

    let mut executor = Executor::new(&cfg, &plan.graph, world, db, runner, progress, env);
    executor.want(plan.goal_ids.iter().copied());
    let summary = executor.run()?;

    Ok(BuildOutcome {
        failed: summary.failed,
        ran: summary.ran,
        up_to_date: summary.up_to_date,
    })
}

/// Parse, plan and build in one call.
pub fn build(
    opts: &EngineOptions,
    world: &dyn World,
    db: Option<&dyn CacheDb>,
    runner: &dyn TaskRunner,
    progress: &dyn Progress,
) -> Result<BuildOutcome, EngineError> {
    let plan = plan(opts, world)?;
    run_plan(opts, &plan, world, db, runner, progress)
}

/// The exported environment subset handed to workers and folded into every
/// fingerprint, with recursive values expanded.
pub fn exported_env(vars: &VarStore, world: &dyn World, cwd: &Path) -> Vec<(String, String)> {
    let names: Vec<SmolStr> = vars.exported().map(|(n, _)| n.clone()).collect();
    let mut ex = Expander::new(vars, world, cwd);
    names
        .iter()
        .filter_map(|name| {
            ex.value_of(name)
                .ok()
                .map(|value| (name.to_string(), value))
        })
        .collect()
}

/// Auto-rescan: build, then watch every graph path and rebuild on changes.
/// `max_cycles` bounds the number of rebuild rounds (`None` = until signal).
pub fn watch_loop(
    opts: &EngineOptions,
    world: &dyn World,
    db: Option<&dyn CacheDb>,
    runner: &dyn TaskRunner,
    progress: &dyn Progress,
    interval: Duration,
    max_cycles: Option<usize>,
) -> Result<BuildOutcome, EngineError> {
    let mut cycles = 0usize;
    loop {
        let plan = plan(opts, world)?;
        let outcome = run_plan(opts, &plan, world, db, runner, progress)?;

        cycles += 1;
        if max_cycles.is_some_and(|max| cycles >= max) {
            return Ok(outcome);
        }

        let mut watcher = Watcher::new();
        for (_, node) in plan.graph.nodes() {
            watcher.register(&node.resolved_path);
        }
        watcher.prime(world);

        // Block until something changes, then reparse and go again.
        'waiting: loop {
            let events = watcher.poll(world);
            if !events.is_empty() {
                for event in &events {
                    info!("{}", event.format(std::process::id()));
                    if event.kind == FsEventKind::Modify
                        && let Some(db) = db
                    {
                        let mut txn = db.begin_write();
                        txn.invalidate_input(&event.path);
                        txn.commit();
                    }
                }
                break 'waiting;
            }
            std::thread::sleep(interval);
        }
    }
}

/// The production [`TaskRunner`]: external lines go to the worker pool,
/// built-ins run in-process, and recursive self-invocations re-enter the
/// engine with this same runner (and therefore the same pool).
pub struct BuildRunner<'e> {
    pool: WorkerPool,
    opts: &'e EngineOptions,
    world: &'e dyn World,
    db: Option<&'e dyn CacheDb>,
}

impl<'e> BuildRunner<'e> {
    /// `env` is the exported-variable snapshot sent to each worker at
    /// handshake time.
    pub fn new(
        opts: &'e EngineOptions,
        world: &'e dyn World,
        db: Option<&'e dyn CacheDb>,
        env: Vec<(String, String)>,
    ) -> Self {
        let pool = WorkerPool::new(
            WorkerConfig {
                jobs: opts.jobs.max(1),
                ssh_hosts: opts.ssh_hosts.clone(),
                program: PathBuf::from(&opts.program),
                retry_budget: 3,
            },
            env,
        );
        Self {
            pool,
            opts,
            world,
            db,
        }
    }

    fn recurse_options(&self, spec: &RecurseSpec) -> EngineOptions {
        let mut opts = self.opts.clone();
        opts.goals = spec.targets.clone();
        if let Some(dir) = &spec.directory {
            opts.directory = self.opts.directory.join(dir);
        }
        opts.makefiles = spec
            .makefile
            .as_ref()
            .map(|f| vec![PathBuf::from(f)])
            .unwrap_or_default();
        if let Some(jobs) = spec.jobs {
            opts.jobs = jobs;
        }
        opts
    }
}

impl TaskRunner for BuildRunner<'_> {
    fn run_task(&self, spec: &TaskSpec, progress: &dyn Progress) -> std::io::Result<TaskStatus> {
        let mut status = TaskStatus::Success;

        if !spec.external.is_empty() {
            let wire = TaskSpec {
                builtins: Vec::new(),
                ..spec.clone()
            };
            status = self.pool.run_task(&wire, progress)?;
        }

        if status.success() {
            for cmd in &spec.builtins {
                match cmd {
                    BuiltinCmd::Recurse(rec) => {
                        debug!(?rec, "recursive invocation, re-entering in-process");
                        let sub_opts = self.recurse_options(rec);
                        match build(&sub_opts, self.world, self.db, self, progress) {
                            Ok(outcome) if outcome.success() => {}
                            Ok(_) => {
                                status = TaskStatus::Failed(2);
                                break;
                            }
                            Err(e) => {
                                progress.task_output(&spec.target, &format!("smak: {e}"), true);
                                status = TaskStatus::Failed(2);
                                break;
                            }
                        }
                    }
                    other => {
                        let mut sink =
                            |line: &str| progress.task_output(&spec.target, line, false);
                        if let Err(e) = other.execute(&spec.dir, &mut sink) {
                            progress.task_output(
                                &spec.target,
                                &format!("{}: {e}", other.descriptor()),
                                true,
                            );
                            status = TaskStatus::Failed(2);
                            break;
                        }
                    }
                }
            }
        }

        Ok(status)
    }
}
