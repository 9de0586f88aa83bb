//! The work-stack expander for `$(...)` references and function calls.
//!
//! Expansion is iterative: a recursive variable's value is pushed as a new
//! input layer rather than expanded by recursion, and every reference
//! resolution bumps a counter. Hitting the counter limit fails the expansion
//! with a diagnostic naming the variable, so self-referential definitions like
//! `X = $(X)` terminate instead of overflowing the stack.

use std::cell::Cell;
use std::path::Path;

use smol_str::SmolStr;

use crate::vars::{AutoVars, Flavor, VarStore, funcs};
use crate::world::World;

/// Default bound on reference resolutions within one top-level expansion.
pub const DEFAULT_ITERATION_LIMIT: usize = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum ExpandError {
    #[error("expansion of `{0}` exceeded {1} iterations, assuming divergence")]
    Divergent(SmolStr, usize),

    #[error("unterminated variable reference `{0}`")]
    Unterminated(String),

    #[error("{0}")]
    User(String),

    #[error("{0} to `{1}' function")]
    BadArgument(&'static str, &'static str),

    #[error("shell function failed: {0}")]
    Shell(std::io::Error),
}

/// One pending input on the expansion work-stack.
struct Layer {
    text: String,
    pos: usize,
}

impl Layer {
    fn new(text: String) -> Self {
        Self { text, pos: 0 }
    }

    fn next_char(&mut self) -> Option<char> {
        let c = self.text[self.pos..].chars().next()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }
}

enum Step {
    Eof,
    Literal(char),
    Dollar,
    Ref(String),
    Single(char),
}

/// Expands template text against a [`VarStore`], automatic variables and
/// `foreach`/`call` bindings.
pub struct Expander<'a> {
    vars: &'a VarStore,
    world: &'a dyn World,
    cwd: &'a Path,
    auto: Option<&'a AutoVars>,
    /// Innermost bindings last; consulted before the store.
    pub(super) locals: Vec<(SmolStr, String)>,
    /// `$(eval ...)` fragments awaiting the parser.
    pub evals: Vec<String>,
    pub(super) shell_status: Cell<Option<i32>>,
    steps: usize,
    limit: usize,
}

impl<'a> Expander<'a> {
    pub fn new(vars: &'a VarStore, world: &'a dyn World, cwd: &'a Path) -> Self {
        Self {
            vars,
            world,
            cwd,
            auto: None,
            locals: Vec::new(),
            evals: Vec::new(),
            shell_status: Cell::new(None),
            steps: 0,
            limit: vars.iteration_limit.max(1),
        }
    }

    pub fn with_auto(mut self, auto: &'a AutoVars) -> Self {
        self.auto = Some(auto);
        self
    }

    pub fn set_auto(&mut self, auto: Option<&'a AutoVars>) {
        self.auto = auto;
    }

    pub(super) fn world(&self) -> &'a dyn World {
        self.world
    }

    pub(super) fn cwd(&self) -> &'a Path {
        self.cwd
    }

    pub(super) fn store(&self) -> &'a VarStore {
        self.vars
    }

    /// Expand a top-level template. Resets the iteration counter.
    pub fn expand(&mut self, text: &str) -> Result<String, ExpandError> {
        self.steps = 0;
        self.expand_fragment(text)
    }

    /// The fully expanded value of one variable, as a top-level `$(NAME)`
    /// would produce.
    pub fn value_of(&mut self, name: &str) -> Result<String, ExpandError> {
        self.steps = 0;
        self.var_value_expanded(name)
    }

    /// Expand a nested fragment, sharing the counter of the enclosing
    /// top-level expansion.
    pub(super) fn expand_fragment(&mut self, text: &str) -> Result<String, ExpandError> {
        if !text.contains('$') {
            return Ok(text.to_string());
        }
        let mut out = String::with_capacity(text.len());
        let mut layers = vec![Layer::new(text.to_string())];

        loop {
            let step = {
                let Some(layer) = layers.last_mut() else {
                    break;
                };
                match layer.next_char() {
                    None => Step::Eof,
                    Some('$') => match layer.peek() {
                        None => Step::Dollar,
                        Some('$') => {
                            layer.next_char();
                            Step::Dollar
                        }
                        Some(open @ ('(' | '{')) => {
                            layer.next_char();
                            Step::Ref(take_balanced(layer, open)?)
                        }
                        Some(c) => {
                            layer.next_char();
                            Step::Single(c)
                        }
                    },
                    Some(c) => Step::Literal(c),
                }
            };
            match step {
                Step::Eof => {
                    layers.pop();
                }
                Step::Literal(c) => out.push(c),
                Step::Dollar => out.push('$'),
                Step::Ref(body) => self.resolve_ref(&body, &mut out, &mut layers)?,
                Step::Single(c) => {
                    let mut buf = [0u8; 4];
                    let name = c.encode_utf8(&mut buf);
                    self.resolve_name(name, &mut out, &mut layers)?;
                }
            }
        }
        Ok(out)
    }

    /// Handle the body of a `$(...)` or `${...}` reference.
    fn resolve_ref(
        &mut self,
        body: &str,
        out: &mut String,
        layers: &mut Vec<Layer>,
    ) -> Result<(), ExpandError> {
        if let Some((func, raw_args)) = funcs::parse_call(body) {
            let value = funcs::eval(self, func, raw_args)?;
            out.push_str(&value);
            return Ok(());
        }

        // Computed names: `$($(X))`.
        let name;
        let name = if body.contains('$') {
            name = self.expand_fragment(body)?;
            name.as_str()
        } else {
            body
        };

        // Substitution reference: `$(VAR:from=to)`.
        if let Some((base, from, to)) = split_subst_ref(name) {
            let value = self.var_value_expanded(base)?;
            out.push_str(&funcs::subst_ref(from, to, &value));
            return Ok(());
        }

        self.resolve_name(name, out, layers)
    }

    /// Resolve a plain variable name and either emit its value or push it as
    /// a new layer when it needs further expansion.
    fn resolve_name(
        &mut self,
        name: &str,
        out: &mut String,
        layers: &mut Vec<Layer>,
    ) -> Result<(), ExpandError> {
        self.bump(name)?;

        if name == ".SHELLSTATUS"
            && let Some(status) = self.shell_status.get()
        {
            out.push_str(&status.to_string());
            return Ok(());
        }
        if let Some(value) = self.local(name) {
            out.push_str(value);
            return Ok(());
        }
        if let Some(value) = self.auto.and_then(|a| a.lookup(name)) {
            out.push_str(&value);
            return Ok(());
        }
        match self.vars.get(name) {
            Some(def) if def.flavor == Flavor::Recursive && def.value.contains('$') => {
                layers.push(Layer::new(def.value.clone()));
            }
            Some(def) => out.push_str(&def.value),
            None => {}
        }
        Ok(())
    }

    /// The fully expanded value of one variable, bypassing layering. Used by
    /// substitution references and by `$(call ...)`.
    pub(super) fn var_value_expanded(&mut self, name: &str) -> Result<String, ExpandError> {
        self.bump(name)?;
        if let Some(value) = self.local(name) {
            return Ok(value.to_string());
        }
        if let Some(value) = self.auto.and_then(|a| a.lookup(name)) {
            return Ok(value);
        }
        match self.vars.get(name) {
            Some(def) if def.flavor == Flavor::Recursive => {
                let template = def.value.clone();
                self.expand_fragment(&template)
            }
            Some(def) => Ok(def.value.clone()),
            None => Ok(String::new()),
        }
    }

    fn local(&self, name: &str) -> Option<&str> {
        self.locals
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub(super) fn is_local_or_auto(&self, name: &str) -> bool {
        self.local(name).is_some() || self.auto.is_some_and(|a| a.lookup(name).is_some())
    }

    fn bump(&mut self, name: &str) -> Result<(), ExpandError> {
        self.steps += 1;
        if self.steps > self.limit {
            return Err(ExpandError::Divergent(SmolStr::new(name), self.limit));
        }
        Ok(())
    }
}

/// Consume chars up to the delimiter matching `open`, counting nesting.
fn take_balanced(layer: &mut Layer, open: char) -> Result<String, ExpandError> {
    let close = if open == '(' { ')' } else { '}' };
    let mut depth = 1usize;
    let mut body = String::new();
    while let Some(c) = layer.next_char() {
        if c == open {
            depth += 1;
        } else if c == close {
            depth -= 1;
            if depth == 0 {
                return Ok(body);
            }
        }
        body.push(c);
    }
    Err(ExpandError::Unterminated(format!("${open}{body}")))
}

/// Split `VAR:from=to` into its parts. The name must already be expanded.
fn split_subst_ref(name: &str) -> Option<(&str, &str, &str)> {
    let colon = name.find(':')?;
    let eq = name[colon + 1..].find('=')?;
    let base = &name[..colon];
    let from = &name[colon + 1..colon + 1 + eq];
    let to = &name[colon + 2 + eq..];
    if base.is_empty() {
        return None;
    }
    Some((base, from, to))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vars::Origin;

    struct NullWorld;
    impl World for NullWorld {
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
        fn run_shell(&self, _: &Path, _: &str) -> std::io::Result<crate::world::ShellOutput> {
            Ok(crate::world::ShellOutput {
                stdout: String::new(),
                status: 0,
            })
        }
        fn glob(&self, _: &Path, _: &str) -> Vec<String> {
            vec![]
        }
    }

    fn store(pairs: &[(&str, &str)]) -> VarStore {
        let mut s = VarStore::new();
        for (k, v) in pairs {
            s.assign(k, v.to_string(), Flavor::Recursive, Origin::File);
        }
        s
    }

    fn expand(vars: &VarStore, text: &str) -> String {
        let world = NullWorld;
        let cwd = Path::new(".");
        Expander::new(vars, &world, cwd).expand(text).unwrap()
    }

    #[test]
    fn plain_and_braced_references() {
        let vars = store(&[("A", "VALUE A"), ("LONG", "VALUE B")]);
        assert_eq!(expand(&vars, "$A rest"), "VALUE A rest");
        assert_eq!(expand(&vars, "$(LONG) and ${LONG}"), "VALUE B and VALUE B");
        assert_eq!(expand(&vars, "no refs"), "no refs");
    }

    #[test]
    fn dollar_escape() {
        let vars = store(&[("A", "B")]);
        assert_eq!(expand(&vars, "$$A"), "$A");
        assert_eq!(expand(&vars, "$$$(A)"), "$B");
    }

    #[test]
    fn undefined_expands_empty() {
        let vars = store(&[]);
        assert_eq!(expand(&vars, "a$(NOPE)b"), "ab");
    }

    #[test]
    fn computed_names() {
        let vars = store(&[("A", "B"), ("B", "VALUE1"), ("CD", "VALUE2"), ("E", "D")]);
        assert_eq!(expand(&vars, "This is $($(A))!"), "This is VALUE1!");
        assert_eq!(expand(&vars, "This is ${C$(E)}!"), "This is VALUE2!");
    }

    #[test]
    fn chained_recursive_values() {
        let vars = store(&[("A", "B"), ("C", "$(A)"), ("D", "${C}")]);
        assert_eq!(expand(&vars, "Test $(D)"), "Test B");
    }

    #[test]
    fn objext_prerequisite() {
        let vars = store(&[("OBJEXT", "o")]);
        assert_eq!(expand(&vars, "src/lib.$(OBJEXT)"), "src/lib.o");
    }

    #[test]
    fn self_reference_diverges_with_name() {
        let vars = store(&[("LOOP", "x$(LOOP)")]);
        let world = NullWorld;
        let cwd = Path::new(".");
        let err = Expander::new(&vars, &world, cwd)
            .expand("$(LOOP)")
            .unwrap_err();
        match err {
            ExpandError::Divergent(name, _) => assert_eq!(name, "LOOP"),
            other => panic!("expected divergence, got {other}"),
        }
    }

    #[test]
    fn mutual_recursion_diverges() {
        let vars = store(&[("P", "$(Q)"), ("Q", "$(P)")]);
        let world = NullWorld;
        let cwd = Path::new(".");
        assert!(
            Expander::new(&vars, &world, cwd)
                .expand("$(P)")
                .is_err()
        );
    }

    #[test]
    fn unterminated_reference() {
        let vars = store(&[("TEST", "Value")]);
        let world = NullWorld;
        let cwd = Path::new(".");
        assert!(matches!(
            Expander::new(&vars, &world, cwd).expand("${TEST"),
            Err(ExpandError::Unterminated(_))
        ));
    }

    #[test]
    fn substitution_reference() {
        let vars = store(&[("SRCS", "a.c b.c lib/c.c")]);
        assert_eq!(expand(&vars, "$(SRCS:.c=.o)"), "a.o b.o lib/c.o");
        assert_eq!(expand(&vars, "$(SRCS:%.c=%.x)"), "a.x b.x lib/c.x");
    }

    #[test]
    fn auto_vars_take_priority() {
        let vars = store(&[("@", "shadowed")]);
        let auto = AutoVars {
            target: "prog".into(),
            first: "main.o".into(),
            all: vec!["main.o".into(), "util.o".into()],
            all_plus: vec!["main.o".into(), "util.o".into()],
            newer: vec![],
            stem: "".into(),
        };
        let world = NullWorld;
        let cwd = Path::new(".");
        let mut ex = Expander::new(&vars, &world, cwd).with_auto(&auto);
        assert_eq!(ex.expand("$@: $< ($(^F))").unwrap(), "prog: main.o (main.o util.o)");
    }

    #[test]
    fn simple_flavor_is_not_reexpanded() {
        let mut vars = store(&[("A", "B")]);
        vars.assign("C", "$(A)".into(), Flavor::Simple, Origin::File);
        assert_eq!(expand(&vars, "Test ${C}"), "Test $(A)");
    }
}
