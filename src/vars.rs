//! The variable store: named bindings with flavour, origin and export state.

use indexmap::IndexMap;
use smol_str::SmolStr;

use crate::world::{dir_part, file_part};

mod expand;
pub mod funcs;
pub use expand::{DEFAULT_ITERATION_LIMIT, ExpandError, Expander};

/// How a variable's value is evaluated.
///
/// Recursive variables (`=`) keep their template text and are re-expanded on
/// every read; simple variables (`:=`) are expanded once at assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Recursive,
    Simple,
}

impl Flavor {
    pub fn as_str(self) -> &'static str {
        match self {
            Flavor::Recursive => "recursive",
            Flavor::Simple => "simple",
        }
    }
}

/// Where a variable definition came from. Later variants outrank earlier ones:
/// an assignment from a lower-ranked origin never replaces a higher-ranked
/// definition (except `Override`, which replaces anything).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Origin {
    Default,
    File,
    Environment,
    CommandLine,
    Override,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Origin::Default => "default",
            Origin::File => "file",
            Origin::Environment => "environment",
            Origin::CommandLine => "command line",
            Origin::Override => "override",
        }
    }
}

/// A single variable binding.
#[derive(Debug, Clone)]
pub struct VarDef {
    pub value: String,
    pub flavor: Flavor,
    pub origin: Origin,
    pub exported: bool,
}

/// All named variables of one engine instance.
///
/// The store itself never expands anything; expansion is the job of
/// [`Expander`], which borrows the store immutably.
#[derive(Debug, Default)]
pub struct VarStore {
    map: IndexMap<SmolStr, VarDef>,
    /// Upper bound on reference resolutions within one top-level expansion.
    pub iteration_limit: usize,
    export_all: bool,
}

impl VarStore {
    pub fn new() -> Self {
        Self {
            map: IndexMap::new(),
            iteration_limit: DEFAULT_ITERATION_LIMIT,
            export_all: false,
        }
    }

    /// A store preloaded with the default tool variables used by the built-in
    /// implicit rules.
    pub fn with_defaults() -> Self {
        let mut store = Self::new();
        for (name, value) in [
            ("CC", "cc"),
            ("CXX", "g++"),
            ("AR", "ar"),
            ("RM", "rm -f"),
            ("SHELL", "/bin/sh"),
            ("CFLAGS", ""),
            ("CXXFLAGS", ""),
            ("LDFLAGS", ""),
        ] {
            store.map.insert(
                SmolStr::new(name),
                VarDef {
                    value: value.to_string(),
                    flavor: Flavor::Recursive,
                    origin: Origin::Default,
                    exported: false,
                },
            );
        }
        store
    }

    /// Import process environment variables. Environment definitions outrank
    /// makefile assignments and are exported to workers.
    pub fn import_env(&mut self, env: impl IntoIterator<Item = (String, String)>) {
        for (name, value) in env {
            if name.is_empty() || name.contains(['=', '#']) {
                continue;
            }
            self.map.insert(
                SmolStr::new(&name),
                VarDef {
                    value,
                    flavor: Flavor::Recursive,
                    origin: Origin::Environment,
                    exported: true,
                },
            );
        }
    }

    pub fn get(&self, name: &str) -> Option<&VarDef> {
        self.map.get(name)
    }

    /// The stored (unexpanded) value, or `""` for undefined variables.
    pub fn raw_value(&self, name: &str) -> &str {
        self.map.get(name).map(|d| d.value.as_str()).unwrap_or("")
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    /// Assign a variable, honouring origin precedence. Returns whether the
    /// assignment took effect.
    pub fn assign(&mut self, name: &str, value: String, flavor: Flavor, origin: Origin) -> bool {
        if let Some(existing) = self.map.get(name)
            && existing.origin > origin
            && origin != Origin::Override
        {
            return false;
        }
        let exported = self.export_all
            || self
                .map
                .get(name)
                .map(|d| d.exported)
                .unwrap_or(false);
        self.map.insert(
            SmolStr::new(name),
            VarDef {
                value,
                flavor,
                origin,
                exported,
            },
        );
        true
    }

    /// `?=`: assign only when the variable is currently undefined.
    pub fn assign_conditional(
        &mut self,
        name: &str,
        value: String,
        flavor: Flavor,
        origin: Origin,
    ) -> bool {
        if self.map.contains_key(name) {
            return false;
        }
        self.assign(name, value, flavor, origin)
    }

    /// `+=`: append with a separating space, keeping the existing flavour.
    /// An append to an undefined variable creates a recursive one.
    ///
    /// The caller is responsible for pre-expanding `text` when the existing
    /// variable is simple.
    pub fn append(&mut self, name: &str, text: &str, origin: Origin) -> bool {
        match self.map.get_mut(name) {
            Some(def) => {
                if def.origin > origin && origin != Origin::Override {
                    return false;
                }
                if !def.value.is_empty() {
                    def.value.push(' ');
                }
                def.value.push_str(text);
                true
            }
            None => self.assign(name, text.to_string(), Flavor::Recursive, origin),
        }
    }

    pub fn unset(&mut self, name: &str) {
        self.map.shift_remove(name);
    }

    pub fn set_exported(&mut self, name: &str, exported: bool) {
        if let Some(def) = self.map.get_mut(name) {
            def.exported = exported;
        } else if exported {
            // `export NAME` before any assignment still marks the name.
            self.map.insert(
                SmolStr::new(name),
                VarDef {
                    value: String::new(),
                    flavor: Flavor::Recursive,
                    origin: Origin::File,
                    exported: true,
                },
            );
        }
    }

    pub fn set_export_all(&mut self, export_all: bool) {
        self.export_all = export_all;
    }

    /// Names and definitions of all exported variables, in definition order.
    pub fn exported(&self) -> impl Iterator<Item = (&SmolStr, &VarDef)> {
        self.map
            .iter()
            .filter(move |(_, d)| d.exported || self.export_all)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SmolStr, &VarDef)> {
        self.map.iter()
    }
}

/// The automatic variables of one recipe invocation (`$@`, `$<`, `$^`, `$?`,
/// `$*`, `$+`), resolved by the expander ahead of the store.
#[derive(Debug, Clone, Default)]
pub struct AutoVars {
    /// `$@` — the target name.
    pub target: String,
    /// `$<` — the first prerequisite.
    pub first: String,
    /// `$^` — all prerequisites, deduplicated.
    pub all: Vec<String>,
    /// `$+` — all prerequisites, duplicates kept.
    pub all_plus: Vec<String>,
    /// `$?` — prerequisites newer than the target.
    pub newer: Vec<String>,
    /// `$*` — the pattern stem.
    pub stem: String,
}

impl AutoVars {
    /// Resolve an automatic variable by name, including the `D`/`F` variants.
    pub fn lookup(&self, name: &str) -> Option<String> {
        let (base, part) = match name.len() {
            1 => (name, None),
            2 if name.ends_with('D') => (&name[..1], Some(dir_part as fn(&str) -> &str)),
            2 if name.ends_with('F') => (&name[..1], Some(file_part as fn(&str) -> &str)),
            _ => return None,
        };
        let apply = |s: &str| part.map(|f| f(s).to_string()).unwrap_or_else(|| s.to_string());
        let join = |words: &[String]| {
            words
                .iter()
                .map(|w| apply(w))
                .collect::<Vec<_>>()
                .join(" ")
        };
        match base {
            "@" => Some(apply(&self.target)),
            "<" => Some(apply(&self.first)),
            "*" => Some(apply(&self.stem)),
            "^" => Some(join(&self.all)),
            "+" => Some(join(&self.all_plus)),
            "?" => Some(join(&self.newer)),
            _ => None,
        }
    }
}
