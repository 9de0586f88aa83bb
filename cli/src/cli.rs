use std::path::PathBuf;

#[derive(Debug, clap::Parser)]
#[clap(name = "smak", version, about = "A parallel, caching make replacement")]
pub struct Args {
    /// Targets to build; `VAR=value` words become command-line variables
    pub goals: Vec<String>,

    /// Read FILE as a makefile (repeatable)
    #[clap(short = 'f', value_name = "FILE")]
    pub makefile: Vec<PathBuf>,

    /// Change to DIR before doing anything else
    #[clap(short = 'C', value_name = "DIR")]
    pub directory: Option<PathBuf>,

    /// Run N recipes in parallel
    #[clap(short = 'j', value_name = "N")]
    pub jobs: Option<usize>,

    /// Keep going when some targets fail
    #[clap(short = 'k', long = "keep-going")]
    pub keep_going: bool,

    /// Print recipes without executing them
    #[clap(short = 'n', long = "dry-run")]
    pub dry_run: bool,

    /// Do not echo recipes
    #[clap(short = 's', long = "silent")]
    pub silent: bool,

    /// Echo every recipe line, including `@`-prefixed ones
    #[clap(long = "echo")]
    pub echo: bool,

    /// Interactive rule debugger: `-Kd` for a prompt, `-Ks FILE` to run a
    /// script (the file is taken from the first positional argument)
    #[clap(short = 'K', value_name = "MODE")]
    pub kmode: Option<String>,

    /// Skip rc-file loading
    #[clap(long = "norc")]
    pub norc: bool,

    /// Disable the built-in implicit rules
    #[clap(long = "no-builtins")]
    pub no_builtins: bool,

    /// `--check=quiet`: compare dry-run output against the reference tool
    #[clap(long = "check", value_name = "MODE")]
    pub check: Option<String>,

    /// Standalone file-watcher mode; exits only on signal
    #[clap(long = "scanner", num_args = 1.., value_name = "PATH")]
    pub scanner: Vec<PathBuf>,

    /// Run the built-in worker self-test
    #[clap(long = "test-worker")]
    pub test_worker: bool,

    /// Serve as a worker on stdin/stdout (spawned by a coordinator)
    #[clap(long = "worker", hide = true)]
    pub worker: bool,

    /// Spawn workers over SSH on the given hosts
    #[clap(long = "ssh", value_name = "HOST[,HOST]")]
    pub ssh: Option<String>,

    /// Rebuild automatically when tracked inputs change
    #[clap(long = "watch")]
    pub watch: bool,
}

/// Translate the historical single-dash long options to their double-dash
/// forms before clap sees them.
pub fn preprocess_args(args: impl IntoIterator<Item = String>) -> Vec<String> {
    args.into_iter()
        .map(|a| match a.as_str() {
            "-norc" => "--norc".to_string(),
            "-scanner" => "--scanner".to_string(),
            _ => a,
        })
        .collect()
}

/// Split positional words into goals and `VAR=value` command-line variables.
pub fn split_goals(words: &[String]) -> (Vec<String>, Vec<(String, String)>) {
    let mut goals = Vec::new();
    let mut vars = Vec::new();
    for word in words {
        match word.split_once('=') {
            Some((name, value)) if !name.is_empty() && !name.contains(char::is_whitespace) => {
                vars.push((name.to_string(), value.to_string()));
            }
            _ => goals.push(word.clone()),
        }
    }
    (goals, vars)
}
