use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use smak::db::fs::FsCache;
use smak::engine::{self, BuildRunner, EngineOptions};
use smak::progress::{CaptureProgress, ConsoleProgress, Progress};
use smak::watch;
use smak::worker::serve;
use smak::world::{LOCAL_WORLD, World};

use crate::cli::{Args, preprocess_args, split_goals};

mod cli;
mod repl;

const EXIT_USAGE: i32 = 64;

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let raw: Vec<String> = std::env::args().collect();
    let argv = assemble_argv(&raw);

    let args = match Args::try_parse_from(&argv) {
        Ok(args) => args,
        Err(e) => {
            use clap::error::ErrorKind;
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => EXIT_USAGE,
            };
            let _ = e.print();
            return code;
        }
    };

    init_tracing();

    // Worker and scanner modes never touch a makefile.
    if args.worker {
        let stdin = std::io::stdin();
        let stdout = std::io::stdout();
        return match serve::serve(stdin.lock(), stdout.lock()) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("smak: worker: {e}");
                2
            }
        };
    }
    if args.test_worker {
        return match serve::self_test() {
            Ok(()) => {
                println!("worker self-test: ok");
                0
            }
            Err(e) => {
                eprintln!("smak: {e}");
                2
            }
        };
    }
    if !args.scanner.is_empty() {
        let stdout = std::io::stdout();
        return match watch::run_scanner(
            &LOCAL_WORLD,
            &args.scanner,
            watch::DEFAULT_POLL_INTERVAL,
            stdout.lock(),
        ) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("smak: scanner: {e}");
                2
            }
        };
    }

    let (mut goals, cmdline_vars) = split_goals(&args.goals);

    // `-Ks FILE` takes its script from the first positional argument.
    let mut repl_script: Option<PathBuf> = None;
    let mut repl_interactive = false;
    match args.kmode.as_deref() {
        Some("d") => repl_interactive = true,
        Some("s") => {
            if goals.is_empty() {
                eprintln!("smak: -Ks requires a script file");
                return EXIT_USAGE;
            }
            repl_script = Some(PathBuf::from(goals.remove(0)));
        }
        Some(other) => {
            eprintln!("smak: unknown -K mode `{other}'");
            return EXIT_USAGE;
        }
        None => {
            if let Ok(script) = std::env::var("USR_SMAK_SCRIPT")
                && !script.is_empty()
            {
                repl_script = Some(PathBuf::from(script));
            }
        }
    }

    let directory = args
        .directory
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    let program = std::env::current_exe()
        .ok()
        .and_then(|p| p.to_str().map(str::to_string))
        .unwrap_or_else(|| raw[0].clone());

    let cache_dir = match std::env::var("SMAK_CACHE_DIR") {
        Ok(dir) if !dir.is_empty() && dir != "0" => Some(PathBuf::from(dir)),
        _ => None,
    };

    let opts = EngineOptions {
        makefiles: args.makefile.clone(),
        directory,
        goals,
        jobs: args.jobs.unwrap_or(1).max(1),
        keep_going: args.keep_going,
        dry_run: args.dry_run,
        silent: args.silent,
        echo_all: args.echo,
        no_builtin_rules: args.no_builtins,
        builtin_cmds: std::env::var_os("SMAK_NO_BUILTINS").is_none(),
        cache_dir: cache_dir.clone(),
        cmdline_vars,
        env: std::env::vars().collect(),
        assert_no_spawn: std::env::var("SMAK_ASSERT_NO_SPAWN").as_deref() == Ok("1"),
        program,
        ssh_hosts: args
            .ssh
            .as_deref()
            .map(|s| s.split(',').map(str::to_string).collect())
            .unwrap_or_default(),
    };

    if repl_interactive || repl_script.is_some() {
        return repl::run(&opts, repl_script.as_deref());
    }
    if args.check.as_deref() == Some("quiet") {
        return check_quiet(&opts);
    }

    let cache;
    let db: Option<&dyn smak::db::CacheDb> = match &cache_dir {
        Some(dir) => match FsCache::open(dir) {
            Ok(open) => {
                cache = open;
                Some(&cache)
            }
            Err(e) => {
                eprintln!("smak: cannot open cache {}: {e}", dir.display());
                None
            }
        },
        None => None,
    };

    let world = &LOCAL_WORLD;
    let progress = ConsoleProgress;

    if args.watch {
        let runner_env = vec![];
        let runner = BuildRunner::new(&opts, world, db, runner_env);
        return match engine::watch_loop(
            &opts,
            world,
            db,
            &runner,
            &progress,
            Duration::from_millis(200),
            None,
        ) {
            Ok(outcome) => outcome.exit_code(),
            Err(e) => report_fatal(&e),
        };
    }

    match build_once(&opts, world, db, &progress) {
        Ok(code) => code,
        Err(e) => report_fatal(&e),
    }
}

fn build_once(
    opts: &EngineOptions,
    world: &'static dyn World,
    db: Option<&dyn smak::db::CacheDb>,
    progress: &dyn Progress,
) -> Result<i32, engine::EngineError> {
    let plan = engine::plan(opts, world)?;
    let env = engine::exported_env(&plan.vars, world, &opts.directory);
    let runner = BuildRunner::new(opts, world, db, env);
    let outcome = engine::run_plan(opts, &plan, world, db, &runner, progress)?;
    Ok(outcome.exit_code())
}

/// `--check=quiet`: compare our dry-run line stream with the reference
/// tool's `-n` output, modulo whitespace.
fn check_quiet(opts: &EngineOptions) -> i32 {
    let world = &LOCAL_WORLD;
    let mut dry = opts.clone();
    dry.dry_run = true;

    let capture = CaptureProgress::new();
    if let Err(e) = build_once(&dry, world, None, &capture) {
        return report_fatal(&e);
    }
    let ours: Vec<String> = capture
        .take()
        .into_iter()
        .map(|l| normalize_ws(&l))
        .filter(|l| !l.is_empty())
        .collect();

    let mut reference_cmd = String::from("make -n");
    for file in &opts.makefiles {
        reference_cmd.push_str(&format!(" -f {}", file.display()));
    }
    for goal in &opts.goals {
        reference_cmd.push(' ');
        reference_cmd.push_str(goal);
    }
    let theirs: Vec<String> = match world.run_shell(&opts.directory, &reference_cmd) {
        Ok(out) => out
            .stdout
            .lines()
            .map(normalize_ws)
            .filter(|l| !l.is_empty() && !l.starts_with("make:"))
            .collect(),
        Err(e) => {
            eprintln!("smak: cannot run reference tool: {e}");
            return 2;
        }
    };

    if ours == theirs {
        println!("check: ok ({} lines)", ours.len());
        0
    } else {
        eprintln!("check: MISMATCH");
        eprintln!("  ours:   {ours:?}");
        eprintln!("  theirs: {theirs:?}");
        1
    }
}

fn normalize_ws(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn report_fatal(e: &engine::EngineError) -> i32 {
    eprintln!("smak: *** {e}.  Stop.");
    let _ = std::io::stderr().flush();
    2
}

/// Final argv: program, rc-file options, `USR_SMAK_OPT`, then the real
/// command line (single-dash long options translated).
fn assemble_argv(raw: &[String]) -> Vec<String> {
    let skip_rc = raw.iter().any(|a| a == "-norc" || a == "--norc");

    let mut argv = vec![raw[0].clone()];
    if !skip_rc {
        for word in rc_options() {
            argv.push(word);
        }
    }
    if let Ok(extra) = std::env::var("USR_SMAK_OPT") {
        argv.extend(extra.split_whitespace().map(str::to_string));
    }
    argv.extend(preprocess_args(raw[1..].iter().cloned()));
    argv
}

/// Options from `SMAK_RCFILE` (or `~/.smakrc`), one or more per line, `#`
/// comments allowed.
fn rc_options() -> Vec<String> {
    let path = match std::env::var("SMAK_RCFILE") {
        Ok(p) if !p.is_empty() => PathBuf::from(p),
        _ => match std::env::var("HOME") {
            Ok(home) => PathBuf::from(home).join(".smakrc"),
            Err(_) => return vec![],
        },
    };
    let Ok(text) = std::fs::read_to_string(&path) else {
        return vec![];
    };
    text.lines()
        .map(|l| l.split('#').next().unwrap_or(""))
        .flat_map(|l| l.split_whitespace())
        .map(str::to_string)
        .collect()
}

fn init_tracing() {
    let filter = if std::env::var_os("SMAK_DEBUG").is_some() {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
