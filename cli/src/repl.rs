//! The line-oriented rule debugger (`-Kd` / `-Ks FILE`).
//!
//! Commands: `print`, `add-rule LINE`, `mod-rule LINE`, `del-rule TARGET`,
//! `save [FILE]`, `build [TARGET...]`, `quit`. Rule edits happen between
//! builds; the databases are never mutated while a build is running.

use std::io::{BufRead, Write};
use std::path::Path;

use smak::engine::{self, BuildRunner, EngineOptions, Plan};
use smak::graph::materialize;
use smak::parse::Parser;
use smak::progress::ConsoleProgress;
use smak::rules::RuleSet;
use smak::vars::{Expander, VarStore};
use smak::world::{LOCAL_WORLD, World};

pub fn run(opts: &EngineOptions, script: Option<&Path>) -> i32 {
    let world: &'static dyn World = &LOCAL_WORLD;
    let (mut vars, mut rules) = match engine::load(opts, world) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("smak: *** {e}.  Stop.");
            return 2;
        }
    };

    let input: Box<dyn BufRead> = match script {
        Some(path) => match std::fs::File::open(path) {
            Ok(f) => Box::new(std::io::BufReader::new(f)),
            Err(e) => {
                eprintln!("smak: cannot read {}: {e}", path.display());
                return 2;
            }
        },
        None => Box::new(std::io::BufReader::new(std::io::stdin())),
    };
    let interactive = script.is_none();
    let mut status = 0;
    let mut input = input;

    loop {
        if interactive {
            print!("smak> ");
            let _ = std::io::stdout().flush();
        }
        let mut line = String::new();
        match input.read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (cmd, rest) = match line.split_once(char::is_whitespace) {
            Some((c, r)) => (c, r.trim()),
            None => (line, ""),
        };

        match cmd {
            "quit" | "exit" => break,
            "print" => print!("{}", rules.render()),
            "add-rule" => {
                if let Err(e) = parse_rule_text(&mut vars, &mut rules, world, opts, rest) {
                    eprintln!("smak: add-rule: {e}");
                    status = 2;
                }
            }
            "mod-rule" => {
                let target = rest.split([':', ' ']).next().unwrap_or("").trim();
                if target.is_empty() {
                    eprintln!("smak: mod-rule: missing target");
                    status = 2;
                    continue;
                }
                rules.remove_target(target);
                if let Err(e) = parse_rule_text(&mut vars, &mut rules, world, opts, rest) {
                    eprintln!("smak: mod-rule: {e}");
                    status = 2;
                }
            }
            "del-rule" => {
                let removed = rules.remove_target(rest);
                if removed == 0 {
                    eprintln!("smak: del-rule: no rule for `{rest}'");
                    status = 2;
                }
            }
            "save" => {
                let path = if rest.is_empty() {
                    default_save_path(opts)
                } else {
                    rest.to_string()
                };
                match std::fs::write(&path, rules.render()) {
                    Ok(()) => println!("saved {path}"),
                    Err(e) => {
                        eprintln!("smak: save: {e}");
                        status = 2;
                    }
                }
            }
            "build" => {
                let goals: Vec<String> = if rest.is_empty() {
                    match rules.default_goal() {
                        Some(goal) => vec![goal.to_string()],
                        None => {
                            eprintln!("smak: build: no default goal");
                            status = 2;
                            continue;
                        }
                    }
                } else {
                    rest.split_whitespace().map(str::to_string).collect()
                };
                match run_build(opts, world, vars, rules, goals) {
                    Ok((v, r, code)) => {
                        vars = v;
                        rules = r;
                        if code != 0 {
                            status = code;
                        }
                    }
                    Err(e) => {
                        eprintln!("smak: *** {e}.");
                        return 2;
                    }
                }
            }
            other => {
                eprintln!("smak: unknown command `{other}'");
                status = 2;
            }
        }
    }
    status
}

/// `add-rule target: prereqs ; recipe` — parsed exactly like a makefile line.
fn parse_rule_text(
    vars: &mut VarStore,
    rules: &mut RuleSet,
    world: &'static dyn World,
    opts: &EngineOptions,
    text: &str,
) -> Result<(), smak::parse::ParseError> {
    let mut parser = Parser::new(vars, rules, world, &opts.directory);
    parser.parse_str(text, "<repl>")?;
    let mut ex = Expander::new(vars, world, &opts.directory);
    rules
        .finalize(&mut ex)
        .map_err(|e| smak::parse::ParseError::Syntax {
            file: "<repl>".into(),
            line: 0,
            msg: e.to_string(),
        })
}

fn default_save_path(opts: &EngineOptions) -> String {
    let base = opts
        .makefiles
        .first()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "Makefile".to_string());
    format!("{base}-smak")
}

fn run_build(
    opts: &EngineOptions,
    world: &'static dyn World,
    vars: VarStore,
    rules: RuleSet,
    goals: Vec<String>,
) -> Result<(VarStore, RuleSet, i32), engine::EngineError> {
    let (graph, goal_ids) = materialize(&rules, &vars, world, &opts.directory, &goals)?;
    let plan = Plan {
        vars,
        rules,
        graph,
        goal_ids,
        goals,
    };
    let env = engine::exported_env(&plan.vars, world, &opts.directory);
    let runner = BuildRunner::new(opts, world, None, env);
    let progress = ConsoleProgress;
    let outcome = engine::run_plan(opts, &plan, world, None, &runner, &progress)?;
    let Plan { vars, rules, .. } = plan;
    Ok((vars, rules, outcome.exit_code()))
}
