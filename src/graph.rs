//! Target nodes and the dependency graph.
//!
//! Nodes are materialised on demand from the rule database when a build is
//! requested and discarded at run end. The graph is immutable once built;
//! edges point from the dependent to its dependency.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use indexmap::IndexMap;
use petgraph::prelude::DiGraphMap;
use smol_str::SmolStr;
use tracing::warn;

use crate::rules::{RuleError, RuleSet, SourceLoc};
use crate::vars::{AutoVars, Expander, VarStore};
use crate::world::World;

mod hash;
pub use hash::{Acc, fingerprint_node, hash_file_stamp};

/// An index that uniquely identifies a target node in the graph.
///
/// Double-colon rules produce multiple nodes sharing one target name, so a
/// name maps to a list of ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

/// One recipe line with its prefix flags stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookedLine {
    pub text: String,
    /// `@` — do not echo.
    pub silent: bool,
    /// `-` — ignore the exit status.
    pub ignore_err: bool,
    /// `+` — run even under dry-run.
    pub always: bool,
}

/// Strip the `@`/`-`/`+` prefix flags from an expanded recipe line.
pub fn cook_line(raw: &str) -> CookedLine {
    let mut text = raw;
    let mut silent = false;
    let mut ignore_err = false;
    let mut always = false;
    loop {
        match text.chars().next() {
            Some('@') => silent = true,
            Some('-') => ignore_err = true,
            Some('+') => always = true,
            _ => break,
        }
        text = &text[1..];
    }
    CookedLine {
        text: text.to_string(),
        silent,
        ignore_err,
        always,
    }
}

#[derive(Debug)]
pub struct TargetNode {
    /// The unmodified target name as it appeared in the rule.
    pub name: SmolStr,
    /// Where to stat the target, after vpath search. Never replaces `name`
    /// in any bookkeeping.
    pub resolved_path: PathBuf,
    pub exists: bool,
    pub mtime: Option<SystemTime>,
    pub recipe: Vec<CookedLine>,
    pub has_rule: bool,
    pub phony: bool,
    pub silent: bool,
    /// Non-order-only prerequisites, in declaration order.
    pub prereqs: Vec<NodeId>,
    pub order_only: Vec<NodeId>,
    /// Names of the non-order-only prerequisites as written.
    pub prereq_names: Vec<SmolStr>,
    /// Rule declaration order, for deterministic dispatch.
    pub seq: usize,
    pub loc: Option<SourceLoc>,
}

#[derive(Debug, Default)]
pub struct TargetGraph {
    nodes: Vec<TargetNode>,
    by_name: IndexMap<SmolStr, Vec<NodeId>>,
    pub(crate) graph: DiGraphMap<NodeId, ()>,
}

impl TargetGraph {
    pub fn node(&self, id: NodeId) -> &TargetNode {
        &self.nodes[id.0]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &TargetNode)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    pub fn lookup(&self, name: &str) -> &[NodeId] {
        self.by_name.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn dependencies(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.graph
            .neighbors_directed(id, petgraph::Direction::Outgoing)
    }

    pub fn dependents(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.graph
            .neighbors_directed(id, petgraph::Direction::Incoming)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("no rule to make target `{target}'{}", match needed_by {
        Some(n) => format!(", needed by `{n}'"),
        None => String::new(),
    })]
    NoRule {
        target: SmolStr,
        needed_by: Option<SmolStr>,
    },

    #[error("dependency cycle detected: {0}")]
    Cycle(String),

    #[error(transparent)]
    Rule(#[from] RuleError),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    Grey,
    Black,
}

/// Materialise the dependency closure of `goals`.
pub fn materialize(
    rules: &RuleSet,
    vars: &VarStore,
    world: &dyn World,
    cwd: &Path,
    goals: &[String],
) -> Result<(TargetGraph, Vec<NodeId>), GraphError> {
    let mut builder = Builder {
        rules,
        vars,
        world,
        cwd,
        graph: TargetGraph::default(),
        colors: IndexMap::new(),
        stack: Vec::new(),
    };
    let mut goal_ids = Vec::new();
    for goal in goals {
        goal_ids.extend(builder.build_target(goal, None)?);
    }
    Ok((builder.graph, goal_ids))
}

struct Builder<'a> {
    rules: &'a RuleSet,
    vars: &'a VarStore,
    world: &'a dyn World,
    cwd: &'a Path,
    graph: TargetGraph,
    colors: IndexMap<SmolStr, Color>,
    stack: Vec<SmolStr>,
}

impl<'a> Builder<'a> {
    fn build_target(
        &mut self,
        name: &str,
        needed_by: Option<&SmolStr>,
    ) -> Result<Vec<NodeId>, GraphError> {
        match self.colors.get(name) {
            Some(Color::Black) => {
                return Ok(self.graph.by_name.get(name).cloned().unwrap_or_default());
            }
            Some(Color::Grey) => return self.handle_cycle(name),
            None => {}
        }
        self.colors.insert(SmolStr::new(name), Color::Grey);
        self.stack.push(SmolStr::new(name));

        let result = self.build_target_inner(name, needed_by);

        self.stack.pop();
        self.colors.insert(SmolStr::new(name), Color::Black);
        result
    }

    fn build_target_inner(
        &mut self,
        name: &str,
        needed_by: Option<&SmolStr>,
    ) -> Result<Vec<NodeId>, GraphError> {
        let entries = {
            let mut ex = Expander::new(self.vars, self.world, self.cwd);
            self.rules.resolve(name, &mut ex, self.world, self.cwd)?
        };
        let phony = self.rules.is_phony(name);
        let (resolved_path, exists) = self.rules.resolve_path(self.world, self.cwd, name);

        if entries.is_empty() {
            if exists && !phony {
                // A plain source file: a leaf node with no rule.
                let id = self.push_node(TargetNode {
                    name: SmolStr::new(name),
                    mtime: self.world.mtime(&resolved_path).ok(),
                    resolved_path,
                    exists: true,
                    recipe: Vec::new(),
                    has_rule: false,
                    phony: false,
                    silent: false,
                    prereqs: Vec::new(),
                    order_only: Vec::new(),
                    prereq_names: Vec::new(),
                    seq: usize::MAX,
                    loc: None,
                });
                return Ok(vec![id]);
            }
            return Err(GraphError::NoRule {
                target: SmolStr::new(name),
                needed_by: needed_by.cloned(),
            });
        }

        let self_name = SmolStr::new(name);
        let mut ids = Vec::with_capacity(entries.len());
        for entry in entries {
            let mut prereq_ids = Vec::new();
            let mut order_only_ids = Vec::new();
            for p in &entry.prereqs {
                prereq_ids.extend(self.build_target(p, Some(&self_name))?);
            }
            for p in &entry.order_only {
                order_only_ids.extend(self.build_target(p, Some(&self_name))?);
            }

            let mtime = exists.then(|| self.world.mtime(&resolved_path).ok()).flatten();
            let auto = self.auto_vars(name, &entry, mtime);
            let mut recipe = Vec::with_capacity(entry.recipe.len());
            {
                let mut ex = Expander::new(self.vars, self.world, self.cwd).with_auto(&auto);
                for raw in &entry.recipe {
                    let expanded = ex.expand(raw).map_err(RuleError::Expand)?;
                    let cooked = cook_line(&expanded);
                    if cooked.text.trim().is_empty() {
                        continue;
                    }
                    recipe.push(cooked);
                }
            }

            let id = self.push_node(TargetNode {
                name: self_name.clone(),
                resolved_path: resolved_path.clone(),
                exists,
                mtime,
                recipe,
                has_rule: true,
                phony,
                silent: self.rules.is_silent(name),
                prereqs: prereq_ids.clone(),
                order_only: order_only_ids.clone(),
                prereq_names: entry.prereqs.iter().map(SmolStr::new).collect(),
                seq: entry.seq,
                loc: entry.loc.clone(),
            });
            for dep in prereq_ids.iter().chain(&order_only_ids) {
                self.graph.graph.add_edge(id, *dep, ());
            }
            ids.push(id);
        }
        Ok(ids)
    }

    fn auto_vars(
        &self,
        name: &str,
        entry: &crate::rules::ResolvedRule,
        target_mtime: Option<SystemTime>,
    ) -> AutoVars {
        let mut all = Vec::new();
        for p in &entry.prereqs {
            if !all.contains(p) {
                all.push(p.clone());
            }
        }
        let newer = entry
            .prereqs
            .iter()
            .filter(|p| {
                let (path, exists) = self.rules.resolve_path(self.world, self.cwd, p);
                if !exists {
                    return true;
                }
                match (target_mtime, self.world.mtime(&path).ok()) {
                    (Some(t), Some(p)) => p > t,
                    (None, _) => true,
                    (_, None) => true,
                }
            })
            .cloned()
            .collect();
        AutoVars {
            target: name.to_string(),
            first: entry.prereqs.first().cloned().unwrap_or_default(),
            all,
            all_plus: entry.prereqs.clone(),
            newer,
            stem: entry.stem.clone(),
        }
    }

    fn handle_cycle(&mut self, name: &str) -> Result<Vec<NodeId>, GraphError> {
        let start = self.stack.iter().position(|n| n == name).unwrap_or(0);
        let chain: Vec<&SmolStr> = self.stack[start..].iter().collect();
        if chain.iter().all(|n| self.rules.is_phony(n)) {
            warn!(
                "circular {} <- {} dependency dropped",
                name,
                self.stack.last().map(|s| s.as_str()).unwrap_or("?")
            );
            return Ok(vec![]);
        }
        let mut text = chain
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(" -> ");
        text.push_str(" -> ");
        text.push_str(name);
        Err(GraphError::Cycle(text))
    }

    fn push_node(&mut self, node: TargetNode) -> NodeId {
        let id = NodeId(self.graph.nodes.len());
        self.graph
            .by_name
            .entry(node.name.clone())
            .or_default()
            .push(id);
        self.graph.nodes.push(node);
        self.graph.graph.add_node(id);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cook_line_flags() {
        let c = cook_line("@echo hi");
        assert!(c.silent && !c.ignore_err);
        assert_eq!(c.text, "echo hi");

        let c = cook_line("-rm -f junk");
        assert!(c.ignore_err);
        assert_eq!(c.text, "rm -f junk");

        let c = cook_line("@-+cmd");
        assert!(c.silent && c.ignore_err && c.always);
        assert_eq!(c.text, "cmd");

        let c = cook_line("echo plain");
        assert!(!c.silent && !c.ignore_err && !c.always);
    }
}
