//! Built-in text functions.
//!
//! The function set is a sealed enum; the evaluator pattern-matches the
//! variant. There is no open extension point.

use smol_str::SmolStr;

use crate::vars::expand::{ExpandError, Expander};
use crate::world::{dir_part, file_part};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextFn {
    Subst,
    Patsubst,
    Strip,
    Findstring,
    Filter,
    FilterOut,
    Sort,
    Word,
    Words,
    Wordlist,
    Firstword,
    Lastword,
    Dir,
    Notdir,
    Suffix,
    Basename,
    Addsuffix,
    Addprefix,
    Wildcard,
    Shell,
    If,
    Or,
    And,
    Foreach,
    Call,
    Eval,
    Origin,
    Flavor,
    Error,
    Warning,
    Info,
}

impl TextFn {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "subst" => Self::Subst,
            "patsubst" => Self::Patsubst,
            "strip" => Self::Strip,
            "findstring" => Self::Findstring,
            "filter" => Self::Filter,
            "filter-out" => Self::FilterOut,
            "sort" => Self::Sort,
            "word" => Self::Word,
            "words" => Self::Words,
            "wordlist" => Self::Wordlist,
            "firstword" => Self::Firstword,
            "lastword" => Self::Lastword,
            "dir" => Self::Dir,
            "notdir" => Self::Notdir,
            "suffix" => Self::Suffix,
            "basename" => Self::Basename,
            "addsuffix" => Self::Addsuffix,
            "addprefix" => Self::Addprefix,
            "wildcard" => Self::Wildcard,
            "shell" => Self::Shell,
            "if" => Self::If,
            "or" => Self::Or,
            "and" => Self::And,
            "foreach" => Self::Foreach,
            "call" => Self::Call,
            "eval" => Self::Eval,
            "origin" => Self::Origin,
            "flavor" => Self::Flavor,
            "error" => Self::Error,
            "warning" => Self::Warning,
            "info" => Self::Info,
            _ => return None,
        })
    }
}

/// Recognise `func args...` at the start of a reference body.
pub(crate) fn parse_call(body: &str) -> Option<(TextFn, &str)> {
    let split = body.find([' ', '\t'])?;
    let func = TextFn::from_name(&body[..split])?;
    Some((func, body[split + 1..].trim_start_matches([' ', '\t'])))
}

/// Evaluate one function call. `raw` is the argument text, unexpanded.
pub(crate) fn eval(ex: &mut Expander, func: TextFn, raw: &str) -> Result<String, ExpandError> {
    use TextFn::*;
    match func {
        // Lazy-argument forms first: these control which text gets expanded.
        If => {
            let args = split_args(raw, 3);
            let cond = ex.expand_fragment(args.first().copied().unwrap_or(""))?;
            if !cond.trim().is_empty() {
                ex.expand_fragment(args.get(1).copied().unwrap_or(""))
            } else {
                ex.expand_fragment(args.get(2).copied().unwrap_or(""))
            }
        }
        Or => {
            for arg in split_args(raw, 0) {
                let value = ex.expand_fragment(arg.trim())?;
                if !value.is_empty() {
                    return Ok(value);
                }
            }
            Ok(String::new())
        }
        And => {
            let mut last = String::new();
            for arg in split_args(raw, 0) {
                last = ex.expand_fragment(arg.trim())?;
                if last.is_empty() {
                    return Ok(String::new());
                }
            }
            Ok(last)
        }
        Foreach => {
            let args = split_args(raw, 3);
            if args.len() != 3 {
                return Err(ExpandError::BadArgument("wrong number of arguments", "foreach"));
            }
            let var = ex.expand_fragment(args[0])?.trim().to_string();
            let list = ex.expand_fragment(args[1])?;
            let body = args[2];
            let mut results = Vec::new();
            for word in split_words(&list) {
                ex.locals.push((SmolStr::new(&var), word.to_string()));
                let result = ex.expand_fragment(body);
                ex.locals.pop();
                results.push(result?);
            }
            Ok(results.join(" "))
        }
        Call => {
            let args = split_args(raw, 0);
            let mut expanded = Vec::with_capacity(args.len());
            for arg in &args {
                expanded.push(ex.expand_fragment(arg)?);
            }
            let name = expanded[0].trim().to_string();
            let depth = ex.locals.len();
            ex.locals.push((SmolStr::new("0"), name.clone()));
            for (i, value) in expanded.iter().enumerate().skip(1) {
                ex.locals
                    .push((SmolStr::new(i.to_string()), value.clone()));
            }
            let result = ex.var_value_expanded(&name);
            ex.locals.truncate(depth);
            result
        }
        Eval => {
            let text = ex.expand_fragment(raw)?;
            ex.evals.push(text);
            Ok(String::new())
        }

        // Everything else expands all arguments up front.
        Subst => {
            let [from, to, text] = expand_n(ex, raw)?;
            Ok(text.replace(&from, &to))
        }
        Patsubst => {
            let [pat, repl, text] = expand_n(ex, raw)?;
            Ok(map_words(&text, |w| {
                pattern_subst(&pat, &repl, w).unwrap_or_else(|| w.to_string())
            }))
        }
        Strip => {
            let text = ex.expand_fragment(raw)?;
            Ok(split_words(&text).collect::<Vec<_>>().join(" "))
        }
        Findstring => {
            let [needle, haystack] = expand_n(ex, raw)?;
            Ok(if haystack.contains(&needle) { needle } else { String::new() })
        }
        Filter | FilterOut => {
            let [pats, text] = expand_n(ex, raw)?;
            let pats: Vec<&str> = split_words(&pats).collect();
            let keep = func == Filter;
            Ok(split_words(&text)
                .filter(|w| pats.iter().any(|p| word_matches(p, w)) == keep)
                .collect::<Vec<_>>()
                .join(" "))
        }
        Sort => {
            let text = ex.expand_fragment(raw)?;
            let mut words: Vec<&str> = split_words(&text).collect();
            words.sort_unstable();
            words.dedup();
            Ok(words.join(" "))
        }
        Word => {
            let [n, text] = expand_n(ex, raw)?;
            let n: usize = n
                .trim()
                .parse()
                .map_err(|_| ExpandError::BadArgument("non-numeric first argument", "word"))?;
            if n == 0 {
                return Err(ExpandError::BadArgument("first argument must be greater than 0", "word"));
            }
            Ok(split_words(&text).nth(n - 1).unwrap_or("").to_string())
        }
        Words => {
            let text = ex.expand_fragment(raw)?;
            Ok(split_words(&text).count().to_string())
        }
        Wordlist => {
            let [s, e, text] = expand_n(ex, raw)?;
            let s: usize = s
                .trim()
                .parse()
                .map_err(|_| ExpandError::BadArgument("non-numeric first argument", "wordlist"))?;
            let e: usize = e
                .trim()
                .parse()
                .map_err(|_| ExpandError::BadArgument("non-numeric second argument", "wordlist"))?;
            if s == 0 {
                return Err(ExpandError::BadArgument(
                    "first argument must be greater than 0",
                    "wordlist",
                ));
            }
            let words: Vec<&str> = split_words(&text).collect();
            let lo = s - 1;
            let hi = e.min(words.len());
            Ok(if lo >= hi { String::new() } else { words[lo..hi].join(" ") })
        }
        Firstword => {
            let text = ex.expand_fragment(raw)?;
            Ok(split_words(&text).next().unwrap_or("").to_string())
        }
        Lastword => {
            let text = ex.expand_fragment(raw)?;
            Ok(split_words(&text).last().unwrap_or("").to_string())
        }
        Dir => {
            let text = ex.expand_fragment(raw)?;
            Ok(map_words(&text, |w| match w.rfind('/') {
                Some(i) => w[..=i].to_string(),
                None => "./".to_string(),
            }))
        }
        Notdir => {
            let text = ex.expand_fragment(raw)?;
            Ok(map_words(&text, |w| file_part(w).to_string()))
        }
        Suffix => {
            let text = ex.expand_fragment(raw)?;
            let parts: Vec<&str> = split_words(&text)
                .filter_map(|w| file_part(w).rfind('.').map(|i| &file_part(w)[i..]))
                .collect();
            Ok(parts.join(" "))
        }
        Basename => {
            let text = ex.expand_fragment(raw)?;
            Ok(map_words(&text, |w| match file_part(w).rfind('.') {
                Some(i) => w[..w.len() - (file_part(w).len() - i)].to_string(),
                None => w.to_string(),
            }))
        }
        Addsuffix => {
            let [suffix, text] = expand_n(ex, raw)?;
            Ok(map_words(&text, |w| format!("{w}{suffix}")))
        }
        Addprefix => {
            let [prefix, text] = expand_n(ex, raw)?;
            Ok(map_words(&text, |w| format!("{prefix}{w}")))
        }
        Wildcard => {
            let text = ex.expand_fragment(raw)?;
            let mut matches = Vec::new();
            for pat in split_words(&text) {
                matches.extend(ex.world().glob(ex.cwd(), pat));
            }
            Ok(matches.join(" "))
        }
        Shell => {
            let cmd = ex.expand_fragment(raw)?;
            let out = ex
                .world()
                .run_shell(ex.cwd(), &cmd)
                .map_err(ExpandError::Shell)?;
            ex.shell_status.set(Some(out.status));
            let trimmed = out.stdout.trim_end_matches('\n');
            Ok(trimmed.replace('\n', " "))
        }
        Origin => {
            let name = ex.expand_fragment(raw)?;
            let name = name.trim();
            Ok(if ex.is_local_or_auto(name) {
                "automatic".to_string()
            } else {
                match ex.store().get(name) {
                    Some(def) => def.origin.as_str().to_string(),
                    None => "undefined".to_string(),
                }
            })
        }
        Flavor => {
            let name = ex.expand_fragment(raw)?;
            Ok(match ex.store().get(name.trim()) {
                Some(def) => def.flavor.as_str().to_string(),
                None => "undefined".to_string(),
            })
        }
        Error => {
            let text = ex.expand_fragment(raw)?;
            Err(ExpandError::User(text))
        }
        Warning => {
            let text = ex.expand_fragment(raw)?;
            eprintln!("smak: warning: {text}");
            Ok(String::new())
        }
        Info => {
            let text = ex.expand_fragment(raw)?;
            println!("{text}");
            Ok(String::new())
        }
    }
}

/// Expand exactly N comma-separated arguments.
fn expand_n<const N: usize>(ex: &mut Expander, raw: &str) -> Result<[String; N], ExpandError> {
    let args = split_args(raw, N);
    let mut out: [String; N] = std::array::from_fn(|_| String::new());
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = ex.expand_fragment(args.get(i).copied().unwrap_or(""))?;
    }
    Ok(out)
}

/// Split argument text on top-level commas. Commas inside `(...)` or `{...}`
/// groups do not split. With `max > 0`, at most `max` pieces are produced and
/// the final piece keeps its commas.
pub(crate) fn split_args(raw: &str, max: usize) -> Vec<&str> {
    let mut args = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in raw.char_indices() {
        match c {
            '(' | '{' => depth += 1,
            ')' | '}' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                if max == 0 || args.len() + 1 < max {
                    args.push(&raw[start..i]);
                    start = i + 1;
                }
            }
            _ => {}
        }
    }
    args.push(&raw[start..]);
    args
}

pub(crate) fn split_words(s: &str) -> impl Iterator<Item = &str> {
    s.split_ascii_whitespace()
}

fn map_words(text: &str, f: impl Fn(&str) -> String) -> String {
    split_words(text).map(f).collect::<Vec<_>>().join(" ")
}

/// Match `word` against a `%`-pattern, returning the stem. A pattern without
/// `%` never matches here; see [`word_matches`] for literal matching.
pub(crate) fn pattern_match<'w>(pat: &str, word: &'w str) -> Option<&'w str> {
    let percent = pat.find('%')?;
    let (prefix, suffix) = (&pat[..percent], &pat[percent + 1..]);
    if word.len() < prefix.len() + suffix.len() {
        return None;
    }
    if word.starts_with(prefix) && word.ends_with(suffix) {
        Some(&word[prefix.len()..word.len() - suffix.len()])
    } else {
        None
    }
}

/// `filter`-style matching: `%`-patterns match by stem, plain patterns match
/// literally.
pub(crate) fn word_matches(pat: &str, word: &str) -> bool {
    if pat.contains('%') {
        pattern_match(pat, word).is_some()
    } else {
        pat == word
    }
}

/// Substitute one word through a pattern pair, as `patsubst` does.
pub(crate) fn pattern_subst(pat: &str, repl: &str, word: &str) -> Option<String> {
    if pat.contains('%') {
        let stem = pattern_match(pat, word)?;
        Some(match repl.find('%') {
            Some(i) => format!("{}{}{}", &repl[..i], stem, &repl[i + 1..]),
            None => repl.to_string(),
        })
    } else if pat == word {
        Some(repl.to_string())
    } else {
        None
    }
}

/// Apply a `$(VAR:from=to)` substitution reference to a word list. A `from`
/// without `%` replaces at the end of each word only.
pub(crate) fn subst_ref(from: &str, to: &str, text: &str) -> String {
    if from.contains('%') {
        map_words(text, |w| {
            pattern_subst(from, to, w).unwrap_or_else(|| w.to_string())
        })
    } else {
        map_words(text, |w| match w.strip_suffix(from) {
            Some(rest) => format!("{rest}{to}"),
            None => w.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vars::{Flavor, Origin, VarStore};
    use crate::world::{ShellOutput, World};
    use std::path::Path;

    struct FnWorld;
    impl World for FnWorld {
        fn exists(&self, _: &Path) -> bool {
            false
        }
        fn mtime(&self, _: &Path) -> std::io::Result<std::time::SystemTime> {
            Err(std::io::Error::from(std::io::ErrorKind::NotFound))
        }
        fn now(&self) -> std::time::SystemTime {
            std::time::UNIX_EPOCH
        }
        fn read_file(&self, _: &Path) -> std::io::Result<String> {
            Err(std::io::Error::from(std::io::ErrorKind::NotFound))
        }
        fn run_shell(&self, _: &Path, cmd: &str) -> std::io::Result<ShellOutput> {
            Ok(ShellOutput {
                stdout: format!("ran:{cmd}\n"),
                status: 0,
            })
        }
        fn glob(&self, _: &Path, pattern: &str) -> Vec<String> {
            match pattern {
                "*.c" => vec!["a.c".into(), "b.c".into()],
                _ => vec![],
            }
        }
    }

    fn eval_with(vars: &VarStore, text: &str) -> String {
        let world = FnWorld;
        let cwd = Path::new(".");
        Expander::new(vars, &world, cwd).expand(text).unwrap()
    }

    fn eval(text: &str) -> String {
        eval_with(&VarStore::new(), text)
    }

    #[test]
    fn word_functions() {
        assert_eq!(eval("$(word 2, a b c)"), "b");
        assert_eq!(eval("$(words  a b c )"), "3");
        assert_eq!(eval("$(wordlist 2, 3, a b c d)"), "b c");
        assert_eq!(eval("$(firstword a b)"), "a");
        assert_eq!(eval("$(lastword a b)"), "b");
        assert_eq!(eval("$(word 9, a b)"), "");
    }

    #[test]
    fn text_functions() {
        assert_eq!(eval("$(subst ee,EE,feet street)"), "fEEt strEEt");
        assert_eq!(eval("$(patsubst %.c,%.o,a.c b.h c.c)"), "a.o b.h c.o");
        assert_eq!(eval("$(strip   a   b  )"), "a b");
        assert_eq!(eval("$(findstring a,abc)"), "a");
        assert_eq!(eval("$(findstring z,abc)"), "");
        assert_eq!(eval("$(filter %.c %.h,a.c b.o c.h)"), "a.c c.h");
        assert_eq!(eval("$(filter-out %.c,a.c b.o)"), "b.o");
        assert_eq!(eval("$(sort c b a b)"), "a b c");
    }

    #[test]
    fn path_functions() {
        assert_eq!(eval("$(dir src/foo.c bar.c)"), "src/ ./");
        assert_eq!(eval("$(notdir src/foo.c bar.c)"), "foo.c bar.c");
        assert_eq!(eval("$(suffix src/foo.c bar)"), ".c");
        assert_eq!(eval("$(basename src/foo.c bar.o)"), "src/foo bar");
        assert_eq!(eval("$(addsuffix .o,a b)"), "a.o b.o");
        assert_eq!(eval("$(addprefix src/,a b)"), "src/a src/b");
    }

    #[test]
    fn conditional_functions() {
        assert_eq!(eval("$(if yes,then,else)"), "then");
        assert_eq!(eval("$(if ,then,else)"), "else");
        assert_eq!(eval("$(or ,,x,y)"), "x");
        assert_eq!(eval("$(and a,b)"), "b");
        assert_eq!(eval("$(and a,,b)"), "");
    }

    #[test]
    fn foreach_binds_words() {
        assert_eq!(eval("$(foreach f,a b c,[$(f)])"), "[a] [b] [c]");
    }

    #[test]
    fn call_binds_numbered_args() {
        let mut vars = VarStore::new();
        vars.assign(
            "swap",
            "$(2) $(1)".into(),
            Flavor::Recursive,
            Origin::File,
        );
        assert_eq!(eval_with(&vars, "$(call swap,x,y)"), "y x");
    }

    #[test]
    fn shell_capture_and_status() {
        assert_eq!(eval("$(shell uname)"), "ran:uname");
        assert_eq!(eval("$(shell uname)$(.SHELLSTATUS)"), "ran:uname0");
    }

    #[test]
    fn wildcard_uses_world() {
        assert_eq!(eval("$(wildcard *.c)"), "a.c b.c");
        assert_eq!(eval("$(wildcard *.zz)"), "");
    }

    #[test]
    fn origin_and_flavor() {
        let mut vars = VarStore::new();
        vars.assign("S", "v".into(), Flavor::Simple, Origin::CommandLine);
        assert_eq!(eval_with(&vars, "$(origin S)"), "command line");
        assert_eq!(eval_with(&vars, "$(flavor S)"), "simple");
        assert_eq!(eval_with(&vars, "$(origin NOPE)"), "undefined");
    }

    #[test]
    fn error_function_is_fatal() {
        let vars = VarStore::new();
        let world = FnWorld;
        let cwd = Path::new(".");
        let err = Expander::new(&vars, &world, cwd)
            .expand("$(error boom)")
            .unwrap_err();
        assert!(matches!(err, ExpandError::User(ref t) if t == "boom"));
    }

    #[test]
    fn eval_collects_fragments() {
        let vars = VarStore::new();
        let world = FnWorld;
        let cwd = Path::new(".");
        let mut ex = Expander::new(&vars, &world, cwd);
        assert_eq!(ex.expand("$(eval X = 1)").unwrap(), "");
        assert_eq!(ex.evals, vec!["X = 1".to_string()]);
    }

    #[test]
    fn nested_call_args_do_not_split() {
        assert_eq!(eval("$(word 1, $(subst b,c, a b))"), "a");
    }
}
