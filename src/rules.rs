//! The rule database: explicit, pattern, static-pattern and double-colon
//! rules, the phony set, vpath search paths and default-goal selection.

use std::fmt;
use std::path::{Path, PathBuf};

use indexmap::{IndexMap, IndexSet};
use smol_str::SmolStr;
use tracing::{debug, warn};

use crate::vars::funcs::{pattern_match, split_words, word_matches};
use crate::vars::{ExpandError, Expander};
use crate::world::World;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLoc {
    pub file: SmolStr,
    pub line: u32,
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleKind {
    Explicit,
    /// Target(s) contain `%`. Suffix rules are translated into this kind at
    /// parse time.
    Pattern,
    StaticPattern {
        target_pat: String,
        prereq_pats: Vec<String>,
    },
}

/// One parsed rule. Prerequisite text is kept unexpanded; expansion is
/// deferred to resolution so that `all: $(TARGETS)` works with `TARGETS`
/// assigned later in the makefile.
#[derive(Debug, Clone)]
pub struct Rule {
    pub targets: Vec<SmolStr>,
    pub prereqs_raw: String,
    pub order_only_raw: String,
    /// Recipe lines, verbatim (prefix flags are cooked at graph build).
    pub recipe: Vec<String>,
    pub kind: RuleKind,
    pub double_colon: bool,
    pub builtin: bool,
    pub loc: SourceLoc,
}

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("{loc}: target `{target}' given both `:' and `::' entries")]
    MixedColon { loc: SourceLoc, target: SmolStr },

    #[error(transparent)]
    Expand(#[from] ExpandError),
}

/// A `vpath pattern dir...` entry. Affects file-existence lookup only; the
/// name stored in the graph is always the unmodified target string.
#[derive(Debug, Clone)]
pub struct VpathEntry {
    pub pattern: SmolStr,
    pub dirs: Vec<PathBuf>,
}

/// The rule(s) governing one concrete target, after pattern matching and
/// prerequisite expansion.
#[derive(Debug, Clone)]
pub struct ResolvedRule {
    pub recipe: Vec<String>,
    pub prereqs: Vec<String>,
    pub order_only: Vec<String>,
    pub stem: String,
    /// Declaration order of the governing rule, for dispatch priority.
    pub seq: usize,
    pub loc: Option<SourceLoc>,
}

const DEFAULT_SUFFIXES: &[&str] = &[".o", ".c", ".cc", ".cpp", ".cxx", ".s", ".a"];

/// All rules of one engine instance. Populated during parsing and immutable
/// while a build is running; the REPL mutates it between builds.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
    /// Explicit rule indices per target, in declaration order.
    explicit: IndexMap<SmolStr, Vec<usize>>,
    patterns: Vec<usize>,
    builtin_patterns: Vec<usize>,
    statics: Vec<usize>,
    suffixes: Vec<SmolStr>,
    /// `.PHONY` prerequisite texts, expanded in [`Self::finalize`].
    pending_phony: Vec<String>,
    phony: IndexSet<SmolStr>,
    silent_targets: IndexSet<SmolStr>,
    all_silent: bool,
    vpaths: Vec<VpathEntry>,
    default_goal: Option<SmolStr>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self {
            suffixes: DEFAULT_SUFFIXES.iter().map(|s| SmolStr::new(s)).collect(),
            ..Default::default()
        }
    }

    /// A rule set preloaded with the built-in implicit rules.
    pub fn with_builtins() -> Self {
        let mut set = Self::new();
        for (target, prereq, recipe) in [
            ("%.o", "%.c", "$(CC) $(CFLAGS) -c $< -o $@"),
            ("%.o", "%.cc", "$(CXX) $(CXXFLAGS) -c $< -o $@"),
            ("%.o", "%.cpp", "$(CXX) $(CXXFLAGS) -c $< -o $@"),
            ("%.o", "%.cxx", "$(CXX) $(CXXFLAGS) -c $< -o $@"),
            ("%", "%.o", "$(CC) $(LDFLAGS) $^ -o $@"),
        ] {
            let idx = set.rules.len();
            set.rules.push(Rule {
                targets: vec![SmolStr::new(target)],
                prereqs_raw: prereq.to_string(),
                order_only_raw: String::new(),
                recipe: vec![recipe.to_string()],
                kind: RuleKind::Pattern,
                double_colon: false,
                builtin: true,
                loc: SourceLoc {
                    file: SmolStr::new("<builtin>"),
                    line: 0,
                },
            });
            set.builtin_patterns.push(idx);
        }
        set
    }

    pub fn add_rule(&mut self, rule: Rule) -> Result<usize, RuleError> {
        let idx = self.rules.len();
        match &rule.kind {
            RuleKind::StaticPattern { .. } => self.statics.push(idx),
            RuleKind::Pattern => self.patterns.push(idx),
            RuleKind::Explicit => {
                for target in &rule.targets {
                    if let Some(entries) = self.explicit.get(target)
                        && let Some(&first) = entries.first()
                        && self.rules[first].double_colon != rule.double_colon
                    {
                        return Err(RuleError::MixedColon {
                            loc: rule.loc.clone(),
                            target: target.clone(),
                        });
                    }
                    self.explicit.entry(target.clone()).or_default().push(idx);
                }
            }
        }
        self.rules.push(rule);
        Ok(idx)
    }

    pub fn push_recipe_line(&mut self, idx: usize, line: String) {
        self.rules[idx].recipe.push(line);
    }

    pub fn rule(&self, idx: usize) -> &Rule {
        &self.rules[idx]
    }

    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(|r| !r.targets.is_empty())
    }

    pub fn has_explicit(&self, target: &str) -> bool {
        self.explicit.contains_key(target)
    }

    pub fn add_phony_raw(&mut self, text: String) {
        self.pending_phony.push(text);
    }

    pub fn is_phony(&self, target: &str) -> bool {
        self.phony.contains(target)
    }

    pub fn phony_targets(&self) -> impl Iterator<Item = &SmolStr> {
        self.phony.iter()
    }

    pub fn clear_suffixes(&mut self) {
        self.suffixes.clear();
    }

    pub fn add_suffixes(&mut self, list: impl IntoIterator<Item = SmolStr>) {
        for s in list {
            if !self.suffixes.contains(&s) {
                self.suffixes.push(s);
            }
        }
    }

    pub fn suffixes(&self) -> &[SmolStr] {
        &self.suffixes
    }

    pub fn set_all_silent(&mut self) {
        self.all_silent = true;
    }

    pub fn add_silent_target(&mut self, target: SmolStr) {
        self.silent_targets.insert(target);
    }

    pub fn is_silent(&self, target: &str) -> bool {
        self.all_silent || self.silent_targets.contains(target)
    }

    pub fn add_vpath(&mut self, pattern: SmolStr, dirs: Vec<PathBuf>) {
        self.vpaths.push(VpathEntry { pattern, dirs });
    }

    pub fn clear_vpath(&mut self, pattern: Option<&str>) {
        match pattern {
            None => self.vpaths.clear(),
            Some(pat) => self.vpaths.retain(|v| v.pattern != pat),
        }
    }

    pub fn default_goal(&self) -> Option<&SmolStr> {
        self.default_goal.as_ref()
    }

    /// Translate a `.x.y` (or single-suffix `.x`) target into the equivalent
    /// pattern pair, consulting the live `.SUFFIXES` list.
    pub fn translate_suffix_target(&self, target: &str) -> Option<(String, String)> {
        if !target.starts_with('.') {
            return None;
        }
        for from in &self.suffixes {
            if let Some(rest) = target.strip_prefix(from.as_str()) {
                if rest.is_empty() {
                    return Some(("%".to_string(), format!("%{from}")));
                }
                if self.suffixes.iter().any(|s| s == rest) {
                    return Some((format!("%{rest}"), format!("%{from}")));
                }
            }
        }
        None
    }

    /// Expand pending `.PHONY` declarations and pick the default goal. Called
    /// once after parsing (and again after REPL edits).
    pub fn finalize(&mut self, ex: &mut Expander) -> Result<(), RuleError> {
        for text in std::mem::take(&mut self.pending_phony) {
            let expanded = ex.expand(&text)?;
            for word in split_words(&expanded) {
                self.phony.insert(SmolStr::new(word));
            }
        }

        self.default_goal = None;
        for rule in &self.rules {
            if rule.builtin || matches!(rule.kind, RuleKind::Pattern) {
                continue;
            }
            let Some(target) = rule.targets.first() else {
                continue;
            };
            if target.contains('$') || target.contains('%') {
                continue;
            }
            if target.starts_with('.') && !self.phony.contains(target) {
                continue;
            }
            self.default_goal = Some(target.clone());
            break;
        }
        Ok(())
    }

    /// Locate a file by name, searching the current directory and then every
    /// vpath directory whose pattern matches. The returned path is for stat
    /// and read only; bookkeeping always uses the unmodified name.
    pub fn resolve_path(&self, world: &dyn World, cwd: &Path, name: &str) -> (PathBuf, bool) {
        let direct = cwd.join(name);
        if world.exists(&direct) {
            return (direct, true);
        }
        for vp in &self.vpaths {
            if !word_matches(&vp.pattern, name) {
                continue;
            }
            for dir in &vp.dirs {
                let candidate = cwd.join(dir).join(name);
                if world.exists(&candidate) {
                    return (candidate, true);
                }
            }
        }
        (direct, false)
    }

    /// Resolve the rule(s) governing `target`.
    ///
    /// Returns one entry per double-colon rule, a single entry otherwise, or
    /// an empty vector when no rule applies. Resolution order: exact explicit
    /// rule, static-pattern rule, pattern rules (user-declared before
    /// built-in). A recipe-less explicit rule contributes its prerequisites
    /// and falls through to the pattern search for the recipe.
    pub fn resolve(
        &self,
        target: &str,
        ex: &mut Expander,
        world: &dyn World,
        cwd: &Path,
    ) -> Result<Vec<ResolvedRule>, RuleError> {
        let mut extra_prereqs: Vec<String> = Vec::new();
        let mut extra_order_only: Vec<String> = Vec::new();
        let mut bare_seq: Option<usize> = None;
        let mut bare_loc: Option<SourceLoc> = None;

        if let Some(entries) = self.explicit.get(target) {
            if self.rules[entries[0]].double_colon {
                let mut out = Vec::with_capacity(entries.len());
                for &idx in entries {
                    let rule = &self.rules[idx];
                    out.push(ResolvedRule {
                        recipe: rule.recipe.clone(),
                        prereqs: self.expand_prereqs(ex, &rule.prereqs_raw)?,
                        order_only: self.expand_prereqs(ex, &rule.order_only_raw)?,
                        stem: String::new(),
                        seq: idx,
                        loc: Some(rule.loc.clone()),
                    });
                }
                return Ok(out);
            }

            let mut recipe: Option<(&Rule, usize)> = None;
            for &idx in entries {
                let rule = &self.rules[idx];
                extra_prereqs.extend(self.expand_prereqs(ex, &rule.prereqs_raw)?);
                extra_order_only.extend(self.expand_prereqs(ex, &rule.order_only_raw)?);
                if !rule.recipe.is_empty() {
                    if let Some((prev, _)) = recipe
                        && prev.loc.file == rule.loc.file
                    {
                        warn!(
                            "{}: overriding recipe for target `{}' (from {})",
                            rule.loc, target, prev.loc
                        );
                    }
                    recipe = Some((rule, idx));
                }
            }
            if let Some((rule, idx)) = recipe {
                return Ok(vec![ResolvedRule {
                    recipe: rule.recipe.clone(),
                    prereqs: extra_prereqs,
                    order_only: extra_order_only,
                    stem: String::new(),
                    seq: entries[0],
                    loc: Some(rule.loc.clone()),
                }]);
            }
            bare_seq = Some(entries[0]);
            bare_loc = Some(self.rules[entries[0]].loc.clone());
        }

        for &idx in &self.statics {
            let rule = &self.rules[idx];
            let RuleKind::StaticPattern {
                target_pat,
                prereq_pats,
            } = &rule.kind
            else {
                continue;
            };
            if !rule.targets.iter().any(|t| t == target) {
                continue;
            }
            let Some(stem) = pattern_match(target_pat, target) else {
                warn!(
                    "{}: target `{}' doesn't match the target pattern",
                    rule.loc, target
                );
                continue;
            };
            let mut prereqs = extra_prereqs.clone();
            prereqs.extend(prereq_pats.iter().map(|p| p.replacen('%', stem, 1)));
            return Ok(vec![ResolvedRule {
                recipe: rule.recipe.clone(),
                prereqs,
                order_only: extra_order_only.clone(),
                stem: stem.to_string(),
                seq: bare_seq.unwrap_or(idx),
                loc: Some(rule.loc.clone()),
            }]);
        }

        // Pattern rules, user-declared before built-in. Applicable when every
        // implied prerequisite has a rule or exists (possibly via vpath);
        // ties break on an existing first source, then declaration order.
        let mut fallback: Option<ResolvedRule> = None;
        for &idx in self.patterns.iter().chain(&self.builtin_patterns) {
            let rule = &self.rules[idx];
            for tpat in &rule.targets {
                let Some(stem) = pattern_match(tpat, target) else {
                    continue;
                };
                let implied: Vec<String> = self
                    .expand_prereqs(ex, &rule.prereqs_raw)?
                    .into_iter()
                    .map(|p| p.replacen('%', stem, 1))
                    .collect();
                let order_only: Vec<String> = self
                    .expand_prereqs(ex, &rule.order_only_raw)?
                    .into_iter()
                    .map(|p| p.replacen('%', stem, 1))
                    .collect();
                let applicable = implied.iter().all(|p| {
                    self.explicit.contains_key(p.as_str())
                        || self.resolve_path(world, cwd, p).1
                });
                if !applicable {
                    debug!(target, rule = %rule.loc, "pattern rule not applicable");
                    continue;
                }
                let source_exists = implied
                    .first()
                    .map(|p| self.resolve_path(world, cwd, p).1)
                    .unwrap_or(false);
                let mut prereqs = extra_prereqs.clone();
                prereqs.extend(implied);
                let mut order_only_all = extra_order_only.clone();
                order_only_all.extend(order_only);
                let resolved = ResolvedRule {
                    recipe: rule.recipe.clone(),
                    prereqs,
                    order_only: order_only_all,
                    stem: stem.to_string(),
                    seq: bare_seq.unwrap_or(idx),
                    loc: Some(rule.loc.clone()),
                };
                if source_exists {
                    return Ok(vec![resolved]);
                }
                if fallback.is_none() {
                    fallback = Some(resolved);
                }
            }
        }
        if let Some(resolved) = fallback {
            return Ok(vec![resolved]);
        }

        // A bare explicit rule (prerequisites, no recipe anywhere).
        if let Some(seq) = bare_seq {
            return Ok(vec![ResolvedRule {
                recipe: Vec::new(),
                prereqs: extra_prereqs,
                order_only: extra_order_only,
                stem: String::new(),
                seq,
                loc: bare_loc,
            }]);
        }
        Ok(vec![])
    }

    fn expand_prereqs(&self, ex: &mut Expander, raw: &str) -> Result<Vec<String>, RuleError> {
        if raw.is_empty() {
            return Ok(vec![]);
        }
        let expanded = ex.expand(raw)?;
        Ok(split_words(&expanded)
            .filter(|w| {
                if w.contains('=') {
                    warn!("ignoring target-specific variable `{w}'");
                    return false;
                }
                true
            })
            .map(str::to_string)
            .collect())
    }

    /// Remove every rule for `target`, returning how many were dropped. Used
    /// by the REPL's `del-rule` and `mod-rule`.
    pub fn remove_target(&mut self, target: &str) -> usize {
        let Some(entries) = self.explicit.shift_remove(target) else {
            return 0;
        };
        for &idx in &entries {
            let rule = &mut self.rules[idx];
            rule.targets.retain(|t| t != target);
            if rule.targets.is_empty() {
                rule.recipe.clear();
                rule.prereqs_raw.clear();
                rule.order_only_raw.clear();
            }
        }
        entries.len()
    }

    /// Serialize the database back to makefile text. Reparsing the output
    /// yields an equivalent database.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.phony.is_empty() {
            out.push_str(".PHONY:");
            for p in &self.phony {
                out.push(' ');
                out.push_str(p);
            }
            out.push('\n');
        }
        for vp in &self.vpaths {
            out.push_str("vpath ");
            out.push_str(&vp.pattern);
            for d in &vp.dirs {
                out.push(' ');
                out.push_str(&d.display().to_string());
            }
            out.push('\n');
        }
        for rule in self.rules() {
            if rule.builtin {
                continue;
            }
            out.push('\n');
            out.push_str(&rule.targets.join(" "));
            out.push_str(if rule.double_colon { "::" } else { ":" });
            if let RuleKind::StaticPattern {
                target_pat,
                prereq_pats,
            } = &rule.kind
            {
                out.push(' ');
                out.push_str(target_pat);
                out.push(':');
                for p in prereq_pats {
                    out.push(' ');
                    out.push_str(p);
                }
            } else {
                if !rule.prereqs_raw.is_empty() {
                    out.push(' ');
                    out.push_str(rule.prereqs_raw.trim());
                }
                if !rule.order_only_raw.is_empty() {
                    out.push_str(" | ");
                    out.push_str(rule.order_only_raw.trim());
                }
            }
            out.push('\n');
            for line in &rule.recipe {
                out.push('\t');
                out.push_str(line);
                out.push('\n');
            }
        }
        out
    }
}
