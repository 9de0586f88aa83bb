//! The makefile reader: logical-line joining, line classification,
//! conditionals, `include`, `define` and the directive set.
//!
//! Parsing populates a [`VarStore`] and a [`RuleSet`]; nothing is executed
//! here. Rule prerequisite text is registered unexpanded (see
//! [`RuleSet::resolve`]), while targets and assignments expand at the moments
//! their flavour prescribes.

use std::path::{Path, PathBuf};

use smol_str::SmolStr;
use tracing::debug;

use crate::rules::{Rule, RuleError, RuleKind, RuleSet, SourceLoc};
use crate::vars::funcs::split_words;
use crate::vars::{ExpandError, Expander, Flavor, Origin, VarStore};
use crate::world::World;

mod lex;
use lex::{AssignOp, scan_line};

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("{file}:{line}: {msg}")]
    Syntax {
        file: SmolStr,
        line: u32,
        msg: String,
    },

    #[error("{file}:{line}: {source}")]
    Expand {
        file: SmolStr,
        line: u32,
        #[source]
        source: ExpandError,
    },

    #[error("{file}:{line}: {source}")]
    Rule {
        file: SmolStr,
        line: u32,
        #[source]
        source: RuleError,
    },

    #[error("cannot read {}: {source}", file.display())]
    Io {
        file: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

struct CondFrame {
    /// Whether the enclosing context was active when this frame opened.
    parent_active: bool,
    /// Whether the current branch emits constructs.
    active: bool,
    /// Whether any branch of this conditional has been taken.
    taken: bool,
    seen_else: bool,
}

pub struct Parser<'a> {
    vars: &'a mut VarStore,
    rules: &'a mut RuleSet,
    world: &'a dyn World,
    cwd: PathBuf,
    conds: Vec<CondFrame>,
    /// Rule index receiving tab-indented recipe lines.
    cur_rule: Option<usize>,
    file: SmolStr,
    line: u32,
}

impl<'a> Parser<'a> {
    pub fn new(
        vars: &'a mut VarStore,
        rules: &'a mut RuleSet,
        world: &'a dyn World,
        cwd: impl Into<PathBuf>,
    ) -> Self {
        Self {
            vars,
            rules,
            world,
            cwd: cwd.into(),
            conds: Vec::new(),
            cur_rule: None,
            file: SmolStr::new("<none>"),
            line: 0,
        }
    }

    pub fn parse_file(&mut self, path: &Path) -> Result<(), ParseError> {
        let full = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.cwd.join(path)
        };
        let text = self.world.read_file(&full).map_err(|source| ParseError::Io {
            file: full.clone(),
            source,
        })?;
        self.parse_source(&text, &path.display().to_string())
    }

    pub fn parse_str(&mut self, text: &str, display_name: &str) -> Result<(), ParseError> {
        self.parse_source(text, display_name)
    }

    fn parse_source(&mut self, text: &str, display_name: &str) -> Result<(), ParseError> {
        let saved_file = std::mem::replace(&mut self.file, SmolStr::new(display_name));
        let saved_line = self.line;
        let saved_rule = self.cur_rule.take();
        self.line = 0;

        let result = self.parse_lines(text);

        self.file = saved_file;
        self.line = saved_line;
        self.cur_rule = saved_rule;
        result
    }

    fn parse_lines(&mut self, text: &str) -> Result<(), ParseError> {
        let lines: Vec<&str> = text.lines().collect();
        let mut i = 0usize;
        let depth_at_entry = self.conds.len();

        while i < lines.len() {
            let first = lines[i];
            i += 1;
            self.line += 1;
            let is_recipe = first.starts_with('\t');

            // Join backslash continuations. Recipe continuations splice
            // directly (the shell would do the same); other lines join with a
            // single space.
            let mut logical = first.to_string();
            while ends_with_continuation(&logical) && i < lines.len() {
                logical.pop();
                let next = lines[i];
                i += 1;
                self.line += 1;
                if is_recipe {
                    logical.push_str(next.strip_prefix('\t').unwrap_or(next));
                } else {
                    logical = format!("{} {}", logical.trim_end(), next.trim_start());
                }
            }

            if is_recipe {
                self.handle_recipe_line(&logical)?;
                continue;
            }

            let stripped = strip_comment(&logical);
            let trimmed = stripped.trim();
            let (word, rest) = first_word(trimmed);

            // `define` swallows its body up to the matching `endef` whether or
            // not the current branch is active.
            let define_name = match word {
                "define" => Some((rest, Origin::File)),
                "override" if first_word(rest.trim()).0 == "define" => {
                    Some((first_word(rest.trim()).1, Origin::Override))
                }
                _ => None,
            };
            if let Some((name_part, origin)) = define_name {
                let body = self.collect_define_body(&lines, &mut i)?;
                if self.active() {
                    let name = self.expand(name_part.trim().trim_end_matches('=').trim_end())?;
                    if name.trim().is_empty() {
                        return Err(self.syntax("empty variable name in `define'"));
                    }
                    self.vars
                        .assign(name.trim(), body, Flavor::Recursive, origin);
                }
                continue;
            }

            self.handle_line(trimmed)?;
        }

        if self.conds.len() > depth_at_entry {
            return Err(self.syntax("missing `endif'"));
        }
        Ok(())
    }

    fn collect_define_body(
        &mut self,
        lines: &[&str],
        i: &mut usize,
    ) -> Result<String, ParseError> {
        let mut body = String::new();
        let mut depth = 1usize;
        while *i < lines.len() {
            let line = lines[*i];
            *i += 1;
            self.line += 1;
            match first_word(line.trim()).0 {
                "define" => depth += 1,
                "endef" => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(body);
                    }
                }
                _ => {}
            }
            if !body.is_empty() {
                body.push('\n');
            }
            body.push_str(line);
        }
        Err(self.syntax("missing `endef', unterminated `define'"))
    }

    fn handle_recipe_line(&mut self, logical: &str) -> Result<(), ParseError> {
        if !self.active() {
            return Ok(());
        }
        let body = logical.strip_prefix('\t').unwrap_or(logical);
        match self.cur_rule {
            Some(idx) => {
                self.rules.push_recipe_line(idx, body.to_string());
                Ok(())
            }
            None if body.trim().is_empty() => Ok(()),
            None => Err(self.syntax("recipe commences before first target")),
        }
    }

    fn handle_line(&mut self, logical: &str) -> Result<(), ParseError> {
        let line = strip_comment(logical);
        let line = line.trim();
        if line.is_empty() {
            return Ok(());
        }

        let (word, rest) = first_word(line);

        // Conditionals are tracked even in skipped branches.
        match word {
            "ifdef" | "ifndef" | "ifeq" | "ifneq" => return self.handle_if(word, rest),
            "else" => return self.handle_else(rest),
            "endif" => return self.handle_endif(rest),
            _ => {}
        }

        if !self.active() {
            return Ok(());
        }

        // Any non-recipe construct ends the current recipe context.
        self.cur_rule = None;

        match word {
            "endef" => return Err(self.syntax("extraneous `endef'")),
            "include" | "-include" | "sinclude" => {
                return self.handle_include(rest, word != "include");
            }
            "vpath" => return self.handle_vpath(rest),
            "override" => return self.handle_override(rest),
            "export" => return self.handle_export(rest, true),
            "unexport" => return self.handle_export(rest, false),
            _ => {}
        }

        let shape = scan_line(line);
        if let Some((op, start, end)) = shape.assign {
            return self.handle_assignment(line, op, start, end, Origin::File);
        }
        if let Some((colon, double)) = shape.colon {
            return self.handle_rule_line(line, colon, double, &shape);
        }

        Err(self.syntax("missing separator"))
    }

    // --- conditionals -----------------------------------------------------

    fn handle_if(&mut self, word: &str, rest: &str) -> Result<(), ParseError> {
        let parent_active = self.active();
        let cond = if parent_active {
            self.eval_condition(word, rest)?
        } else {
            false
        };
        self.conds.push(CondFrame {
            parent_active,
            active: parent_active && cond,
            taken: cond,
            seen_else: false,
        });
        Ok(())
    }

    fn handle_else(&mut self, rest: &str) -> Result<(), ParseError> {
        let rest = rest.trim();
        let nested = if rest.is_empty() {
            None
        } else {
            let (word, tail) = first_word(rest);
            match word {
                "ifdef" | "ifndef" | "ifeq" | "ifneq" => Some((word.to_string(), tail.to_string())),
                _ => return Err(self.syntax("extraneous text after `else' directive")),
            }
        };

        let parent_active = self
            .conds
            .last()
            .map(|f| f.parent_active)
            .ok_or_else(|| self.syntax("extraneous `else'"))?;
        let taken = self.conds.last().map(|f| f.taken).unwrap_or(false);
        if self.conds.last().is_some_and(|f| f.seen_else) {
            return Err(self.syntax("only one `else' per conditional"));
        }

        let (active, new_taken, seen_else) = match nested {
            None => (parent_active && !taken, true, true),
            Some((word, tail)) => {
                let cond = if parent_active && !taken {
                    self.eval_condition(&word, &tail)?
                } else {
                    false
                };
                (parent_active && !taken && cond, taken || cond, false)
            }
        };
        let frame = self.conds.last_mut().expect("checked above");
        frame.active = active;
        frame.taken = new_taken;
        frame.seen_else = seen_else;
        Ok(())
    }

    fn handle_endif(&mut self, rest: &str) -> Result<(), ParseError> {
        if !rest.trim().is_empty() {
            return Err(self.syntax("extraneous text after `endif' directive"));
        }
        self.conds
            .pop()
            .map(|_| ())
            .ok_or_else(|| self.syntax("extraneous `endif'"))
    }

    fn eval_condition(&mut self, word: &str, rest: &str) -> Result<bool, ParseError> {
        match word {
            "ifdef" | "ifndef" => {
                let name = self.expand(rest.trim())?;
                let defined = !self.vars.raw_value(name.trim()).is_empty();
                Ok(defined == (word == "ifdef"))
            }
            _ => {
                let (a, b) = self.split_condition_args(rest.trim())?;
                let a = self.expand(&a)?;
                let b = self.expand(&b)?;
                Ok((a == b) == (word == "ifeq"))
            }
        }
    }

    /// `(a,b)`, `"a" "b"` or `'a' 'b'` argument forms of ifeq/ifneq.
    fn split_condition_args(&self, rest: &str) -> Result<(String, String), ParseError> {
        if let Some(body) = rest.strip_prefix('(') {
            let Some(body) = body.strip_suffix(')') else {
                return Err(self.syntax("unterminated conditional arguments"));
            };
            let mut depth = 0usize;
            for (i, c) in body.char_indices() {
                match c {
                    '(' | '{' => depth += 1,
                    ')' | '}' => depth = depth.saturating_sub(1),
                    ',' if depth == 0 => {
                        return Ok((
                            body[..i].trim().to_string(),
                            body[i + 1..].trim().to_string(),
                        ));
                    }
                    _ => {}
                }
            }
            return Err(self.syntax("missing `,' in conditional arguments"));
        }

        let mut parts = Vec::new();
        let mut rest = rest.trim();
        for _ in 0..2 {
            let quote = rest.chars().next();
            let Some(quote @ ('"' | '\'')) = quote else {
                return Err(self.syntax("invalid conditional arguments"));
            };
            let Some(end) = rest[1..].find(quote) else {
                return Err(self.syntax("unterminated quoted string"));
            };
            parts.push(rest[1..1 + end].to_string());
            rest = rest[2 + end..].trim_start();
        }
        Ok((parts[0].clone(), parts[1].clone()))
    }

    // --- include ----------------------------------------------------------

    fn handle_include(&mut self, rest: &str, optional: bool) -> Result<(), ParseError> {
        let expanded = self.expand(rest)?;
        self.cur_rule = None;
        for word in split_words(&expanded).map(str::to_string).collect::<Vec<_>>() {
            let matched: Vec<String> = if word.contains(['*', '?', '[']) {
                self.world.glob(&self.cwd, &word)
            } else {
                vec![word.clone()]
            };
            if matched.is_empty() && !optional {
                return Err(self.syntax(&format!("included makefile `{word}' not found")));
            }
            for name in matched {
                match self.parse_file(Path::new(&name)) {
                    Ok(()) => {}
                    Err(ParseError::Io { file, source }) if optional => {
                        debug!("skipping missing include {}: {source}", file.display());
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    // --- directives -------------------------------------------------------

    fn handle_vpath(&mut self, rest: &str) -> Result<(), ParseError> {
        let expanded = self.expand(rest)?;
        let mut words = split_words(&expanded);
        let Some(pattern) = words.next() else {
            self.rules.clear_vpath(None);
            return Ok(());
        };
        let dirs: Vec<PathBuf> = words
            .flat_map(|w| w.split(':'))
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect();
        if dirs.is_empty() {
            self.rules.clear_vpath(Some(pattern));
        } else {
            self.rules.add_vpath(SmolStr::new(pattern), dirs);
        }
        Ok(())
    }

    fn handle_override(&mut self, rest: &str) -> Result<(), ParseError> {
        let rest = rest.trim();
        let shape = scan_line(rest);
        let Some((op, start, end)) = shape.assign else {
            return Err(self.syntax("invalid `override' directive"));
        };
        self.handle_assignment(rest, op, start, end, Origin::Override)
    }

    fn handle_export(&mut self, rest: &str, export: bool) -> Result<(), ParseError> {
        let rest = rest.trim();
        if rest.is_empty() {
            self.vars.set_export_all(export);
            return Ok(());
        }
        let shape = scan_line(rest);
        if let Some((op, start, end)) = shape.assign {
            self.handle_assignment(rest, op, start, end, Origin::File)?;
            let name = self.expand(rest[..start].trim())?;
            self.vars.set_exported(name.trim(), export);
            return Ok(());
        }
        let names = self.expand(rest)?;
        for name in split_words(&names) {
            self.vars.set_exported(name, export);
        }
        Ok(())
    }

    // --- assignments ------------------------------------------------------

    fn handle_assignment(
        &mut self,
        line: &str,
        op: AssignOp,
        start: usize,
        end: usize,
        origin: Origin,
    ) -> Result<(), ParseError> {
        let name = self.expand(line[..start].trim())?;
        let name = name.trim();
        if name.is_empty() {
            return Err(self.syntax("empty variable name"));
        }
        let rhs = line[end..].trim_start();

        match op {
            AssignOp::Recursive => {
                self.vars
                    .assign(name, rhs.to_string(), Flavor::Recursive, origin);
            }
            AssignOp::Simple => {
                let value = self.expand(rhs)?;
                self.vars.assign(name, value, Flavor::Simple, origin);
            }
            AssignOp::Conditional => {
                self.vars
                    .assign_conditional(name, rhs.to_string(), Flavor::Recursive, origin);
            }
            AssignOp::Append => {
                let text = match self.vars.get(name).map(|d| d.flavor) {
                    Some(Flavor::Simple) => self.expand(rhs)?,
                    _ => rhs.to_string(),
                };
                self.vars.append(name, &text, origin);
            }
        }
        Ok(())
    }

    // --- rules ------------------------------------------------------------

    fn handle_rule_line(
        &mut self,
        line: &str,
        colon: usize,
        double: bool,
        shape: &lex::LineShape,
    ) -> Result<(), ParseError> {
        let target_text = self.expand(line[..colon].trim())?;
        let targets: Vec<SmolStr> = split_words(&target_text).map(SmolStr::new).collect();
        let after_colon = colon + if double { 2 } else { 1 };

        // The rest of the line, with an optional inline recipe split off.
        let (body_end, inline_recipe) = match shape.semi {
            Some(semi) => (semi, Some(line[semi + 1..].trim_start().to_string())),
            None => (line.len(), None),
        };
        let body = &line[after_colon..body_end];

        if targets.is_empty() {
            // The whole target list expanded away (`$(VERBOSE).SILENT:`).
            return Ok(());
        }

        // Special targets configure the database instead of adding rules.
        if targets.len() == 1 {
            match targets[0].as_str() {
                ".PHONY" => {
                    self.rules.add_phony_raw(body.trim().to_string());
                    self.cur_rule = None;
                    return Ok(());
                }
                ".SUFFIXES" => {
                    let list = self.expand(body.trim())?;
                    if list.trim().is_empty() {
                        self.rules.clear_suffixes();
                    } else {
                        self.rules
                            .add_suffixes(split_words(&list).map(SmolStr::new));
                    }
                    self.cur_rule = None;
                    return Ok(());
                }
                ".SILENT" => {
                    let list = self.expand(body.trim())?;
                    if list.trim().is_empty() {
                        self.rules.set_all_silent();
                    } else {
                        for t in split_words(&list) {
                            self.rules.add_silent_target(SmolStr::new(t));
                        }
                    }
                    self.cur_rule = None;
                    return Ok(());
                }
                ".EXPORT_ALL_VARIABLES" => {
                    self.vars.set_export_all(true);
                    self.cur_rule = None;
                    return Ok(());
                }
                _ => {}
            }
        }

        let loc = SourceLoc {
            file: self.file.clone(),
            line: self.line,
        };

        // Static pattern rule: `targets: target-pat: prereq-pats`.
        let rule = if let Some(second) = shape.second_colon.filter(|&s| s < body_end) {
            let target_pat = self.expand(line[after_colon..second].trim())?;
            let prereq_text = self.expand(line[second + 1..body_end].trim())?;
            Rule {
                targets,
                prereqs_raw: String::new(),
                order_only_raw: String::new(),
                recipe: Vec::new(),
                kind: RuleKind::StaticPattern {
                    target_pat: target_pat.trim().to_string(),
                    prereq_pats: split_words(&prereq_text).map(str::to_string).collect(),
                },
                double_colon: double,
                builtin: false,
                loc,
            }
        } else {
            let (prereqs_raw, order_only_raw) = match shape.pipe.filter(|&p| p < body_end) {
                Some(pipe) => (
                    line[after_colon..pipe].trim().to_string(),
                    line[pipe + 1..body_end].trim().to_string(),
                ),
                None => (body.trim().to_string(), String::new()),
            };

            // Suffix rules (`.c.o:`) become pattern rules here.
            let translated = if targets.len() == 1 && prereqs_raw.is_empty() {
                self.rules.translate_suffix_target(&targets[0])
            } else {
                None
            };
            match translated {
                Some((target_pat, prereq_pat)) => Rule {
                    targets: vec![SmolStr::new(&target_pat)],
                    prereqs_raw: prereq_pat,
                    order_only_raw,
                    recipe: Vec::new(),
                    kind: RuleKind::Pattern,
                    double_colon: double,
                    builtin: false,
                    loc,
                },
                None => {
                    let kind = if targets.iter().any(|t| t.contains('%')) {
                        RuleKind::Pattern
                    } else {
                        RuleKind::Explicit
                    };
                    Rule {
                        targets,
                        prereqs_raw,
                        order_only_raw,
                        recipe: Vec::new(),
                        kind,
                        double_colon: double,
                        builtin: false,
                        loc,
                    }
                }
            }
        };

        let idx = self
            .rules
            .add_rule(rule)
            .map_err(|source| ParseError::Rule {
                file: self.file.clone(),
                line: self.line,
                source,
            })?;
        if let Some(recipe) = inline_recipe
            && !recipe.is_empty()
        {
            self.rules.push_recipe_line(idx, recipe);
        }
        self.cur_rule = Some(idx);
        Ok(())
    }

    // --- helpers ----------------------------------------------------------

    fn active(&self) -> bool {
        self.conds.iter().all(|f| f.active)
    }

    fn expand(&mut self, text: &str) -> Result<String, ParseError> {
        let (value, evals) = {
            let mut ex = Expander::new(self.vars, self.world, &self.cwd);
            let value = ex.expand(text).map_err(|source| ParseError::Expand {
                file: self.file.clone(),
                line: self.line,
                source,
            })?;
            (value, std::mem::take(&mut ex.evals))
        };
        for fragment in evals {
            self.parse_str(&fragment, "<eval>")?;
        }
        Ok(value)
    }

    fn syntax(&self, msg: &str) -> ParseError {
        ParseError::Syntax {
            file: self.file.clone(),
            line: self.line,
            msg: msg.to_string(),
        }
    }
}

fn ends_with_continuation(line: &str) -> bool {
    (line.len() - line.trim_end_matches('\\').len()) % 2 == 1
}

/// Strip a `#` comment, honouring the `\#` escape. Not applied to recipes.
fn strip_comment(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'#') => {
                chars.next();
                out.push('#');
            }
            '#' => break,
            _ => out.push(c),
        }
    }
    out
}

fn first_word(line: &str) -> (&str, &str) {
    match line.find([' ', '\t']) {
        Some(i) => (&line[..i], &line[i + 1..]),
        None => (line, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleKind;
    use std::collections::HashMap;
    use std::time::SystemTime;

    struct FileWorld {
        files: HashMap<PathBuf, String>,
    }

    impl FileWorld {
        fn new(files: &[(&str, &str)]) -> Self {
            Self {
                files: files
                    .iter()
                    .map(|(k, v)| (PathBuf::from(k), v.to_string()))
                    .collect(),
            }
        }
    }

    impl World for FileWorld {
        fn exists(&self, path: &Path) -> bool {
            self.files.contains_key(path)
        }
        fn mtime(&self, _: &Path) -> std::io::Result<SystemTime> {
            Ok(SystemTime::UNIX_EPOCH)
        }
        fn now(&self) -> SystemTime {
            SystemTime::UNIX_EPOCH
        }
        fn read_file(&self, path: &Path) -> std::io::Result<String> {
            self.files
                .get(path)
                .cloned()
                .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound))
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

    fn parse(text: &str) -> (VarStore, RuleSet) {
        parse_in(text, &FileWorld::new(&[]))
    }

    fn parse_in(text: &str, world: &FileWorld) -> (VarStore, RuleSet) {
        let mut vars = VarStore::new();
        let mut rules = RuleSet::new();
        Parser::new(&mut vars, &mut rules, world, "/w")
            .parse_str(text, "Makefile")
            .unwrap();
        (vars, rules)
    }

    #[test]
    fn assignment_flavours() {
        let (vars, _) = parse("A = one\nB := $(A)\nC ?= yes\nC ?= no\nA += two\n");
        assert_eq!(vars.raw_value("A"), "one two");
        assert_eq!(vars.raw_value("B"), "one");
        assert_eq!(vars.get("B").unwrap().flavor, Flavor::Simple);
        assert_eq!(vars.raw_value("C"), "yes");
    }

    #[test]
    fn continuation_lines_join() {
        let (vars, _) = parse("LIST = a \\\n\tb \\\n\tc\n");
        assert_eq!(vars.raw_value("LIST"), "a b c");
    }

    #[test]
    fn comments_are_stripped() {
        let (vars, _) = parse("A = value # trailing\n# whole line\nB = \\#lit\n");
        assert_eq!(vars.raw_value("A"), "value");
        assert_eq!(vars.raw_value("B"), "#lit");
    }

    #[test]
    fn conditional_blocks() {
        let text = "A = 1\nifeq ($(A),1)\nX = yes\nelse\nX = no\nendif\n\
                    ifdef MISSING\nY = bad\nendif\n";
        let (vars, _) = parse(text);
        assert_eq!(vars.raw_value("X"), "yes");
        assert!(!vars.is_defined("Y"));
    }

    #[test]
    fn else_if_chains() {
        let text = "A = 2\nifeq ($(A),1)\nX = one\nelse ifeq ($(A),2)\nX = two\nelse\nX = other\nendif\n";
        let (vars, _) = parse(text);
        assert_eq!(vars.raw_value("X"), "two");
    }

    #[test]
    fn nested_skipped_conditionals() {
        let text = "ifdef MISSING\nifdef ALSO\nX = 1\nendif\nX = 2\nendif\nY = ok\n";
        let (vars, _) = parse(text);
        assert!(!vars.is_defined("X"));
        assert_eq!(vars.raw_value("Y"), "ok");
    }

    #[test]
    fn unbalanced_endif_is_an_error() {
        let mut vars = VarStore::new();
        let mut rules = RuleSet::new();
        let world = FileWorld::new(&[]);
        let err = Parser::new(&mut vars, &mut rules, &world, "/w")
            .parse_str("ifdef A\n", "Makefile")
            .unwrap_err();
        assert!(err.to_string().contains("endif"));
    }

    #[test]
    fn define_multiline() {
        let text = "define SCRIPT\necho one\necho two\nendef\n";
        let (vars, _) = parse(text);
        assert_eq!(vars.raw_value("SCRIPT"), "echo one\necho two");
        assert_eq!(vars.get("SCRIPT").unwrap().flavor, Flavor::Recursive);
    }

    #[test]
    fn define_in_skipped_branch_is_swallowed() {
        let text = "ifdef MISSING\ndefine S\nX = inside\nendef\nendif\n";
        let (vars, _) = parse(text);
        assert!(!vars.is_defined("S"));
        assert!(!vars.is_defined("X"));
    }

    #[test]
    fn rule_with_recipe_lines() {
        let (_, rules) = parse("all: a b\n\techo one\n\t@echo two\n");
        let rule = rules.rules().next().unwrap();
        assert_eq!(rule.targets, vec![SmolStr::new("all")]);
        assert_eq!(rule.prereqs_raw, "a b");
        assert_eq!(rule.recipe, vec!["echo one", "@echo two"]);
    }

    #[test]
    fn prerequisites_stay_unexpanded() {
        let (_, rules) = parse("all: $(TARGETS)\nTARGETS = t1 t2 t3\n");
        let rule = rules.rules().next().unwrap();
        assert_eq!(rule.prereqs_raw, "$(TARGETS)");
    }

    #[test]
    fn order_only_prerequisites() {
        let (_, rules) = parse("out/a.o: a.c | out\n");
        let rule = rules.rules().next().unwrap();
        assert_eq!(rule.prereqs_raw, "a.c");
        assert_eq!(rule.order_only_raw, "out");
    }

    #[test]
    fn inline_recipe_after_semicolon() {
        let (_, rules) = parse(".c.o: ; gcc -c $< -o $@\n");
        let rule = rules.rules().next().unwrap();
        assert_eq!(rule.targets, vec![SmolStr::new("%.o")]);
        assert_eq!(rule.prereqs_raw, "%.c");
        assert_eq!(rule.recipe, vec!["gcc -c $< -o $@"]);
        assert_eq!(rule.kind, RuleKind::Pattern);
    }

    #[test]
    fn static_pattern_rule() {
        let (_, rules) = parse("a.o b.o: %.o: %.c\n\tcc -c $<\n");
        let rule = rules.rules().next().unwrap();
        match &rule.kind {
            RuleKind::StaticPattern {
                target_pat,
                prereq_pats,
            } => {
                assert_eq!(target_pat, "%.o");
                assert_eq!(prereq_pats, &vec!["%.c".to_string()]);
            }
            other => panic!("expected static pattern, got {other:?}"),
        }
    }

    #[test]
    fn double_colon_rules() {
        let (_, rules) = parse("log:: a\n\techo a\nlog:: b\n\techo b\n");
        let both: Vec<_> = rules.rules().collect();
        assert_eq!(both.len(), 2);
        assert!(both.iter().all(|r| r.double_colon));
    }

    #[test]
    fn mixing_colon_kinds_fails() {
        let mut vars = VarStore::new();
        let mut rules = RuleSet::new();
        let world = FileWorld::new(&[]);
        let err = Parser::new(&mut vars, &mut rules, &world, "/w")
            .parse_str("t: a\nt:: b\n", "Makefile")
            .unwrap_err();
        assert!(err.to_string().contains("::"));
    }

    #[test]
    fn bare_rule_registers() {
        // A target with neither prerequisites nor recipe still records a rule.
        let (_, rules) = parse("standalone:\n");
        let rule = rules.rules().next().unwrap();
        assert_eq!(rule.targets, vec![SmolStr::new("standalone")]);
        assert!(rule.recipe.is_empty());
        assert!(rules.has_explicit("standalone"));
    }

    #[test]
    fn phony_and_suffixes_directives() {
        let world = FileWorld::new(&[]);
        let (vars, mut rules) = parse_in(
            ".PHONY: clean $(EXTRA)\nEXTRA = dist\n.SUFFIXES:\n.SUFFIXES: .c .o\n",
            &world,
        );
        let mut ex = Expander::new(&vars, &world, Path::new("/w"));
        rules.finalize(&mut ex).unwrap();
        assert!(rules.is_phony("clean"));
        assert!(rules.is_phony("dist"));
        assert_eq!(rules.suffixes(), &[SmolStr::new(".c"), SmolStr::new(".o")]);
    }

    #[test]
    fn conditional_silent_special() {
        // `$(VERBOSE).SILENT:` enables .SILENT only when VERBOSE is empty.
        let (_, rules) = parse("$(VERBOSE).SILENT:\nt:\n\techo hi\n");
        assert!(rules.is_silent("t"));

        let (_, rules) = parse("VERBOSE = 1\n$(VERBOSE).SILENT:\nt:\n\techo hi\n");
        assert!(!rules.is_silent("t"));
    }

    #[test]
    fn include_parses_other_files(){
        let world = FileWorld::new(&[("/w/extra.mk", "FROM_INCLUDE = yes\n")]);
        let (vars, _) = parse_in("include extra.mk\nA = $(FROM_INCLUDE)\n", &world);
        assert_eq!(vars.raw_value("FROM_INCLUDE"), "yes");
    }

    #[test]
    fn missing_include_tolerated_only_with_dash() {
        let world = FileWorld::new(&[]);
        let mut vars = VarStore::new();
        let mut rules = RuleSet::new();
        assert!(
            Parser::new(&mut vars, &mut rules, &world, "/w")
                .parse_str("-include nope.mk\nA = ok\n", "Makefile")
                .is_ok()
        );
        assert_eq!(vars.raw_value("A"), "ok");

        let mut vars = VarStore::new();
        let mut rules = RuleSet::new();
        assert!(
            Parser::new(&mut vars, &mut rules, &world, "/w")
                .parse_str("include nope.mk\n", "Makefile")
                .is_err()
        );
    }

    #[test]
    fn vpath_directive() {
        let (_, rules) = parse("vpath %.c src:lib\n");
        let world = FileWorld::new(&[("/w/src/x.c", "")]);
        let (path, exists) = rules.resolve_path(&world, Path::new("/w"), "x.c");
        assert!(exists);
        assert_eq!(path, PathBuf::from("/w/src/x.c"));
    }

    #[test]
    fn export_and_override() {
        let (vars, _) = parse("export A = 1\nB = 2\nexport B\noverride A = 3\n");
        assert!(vars.get("A").unwrap().exported);
        assert!(vars.get("B").unwrap().exported);
        assert_eq!(vars.raw_value("A"), "3");
        assert_eq!(vars.get("A").unwrap().origin, Origin::Override);
    }

    #[test]
    fn eval_function_defines_rules() {
        // A simple assignment expands immediately, running the eval fragment
        // through the parser.
        let (vars, rules) = parse("Y := $(eval extra: ; touch extra)\nall:\n");
        assert_eq!(vars.raw_value("Y"), "");
        assert!(rules.has_explicit("extra"));
    }

    #[test]
    fn missing_separator_is_reported_with_position() {
        let mut vars = VarStore::new();
        let mut rules = RuleSet::new();
        let world = FileWorld::new(&[]);
        let err = Parser::new(&mut vars, &mut rules, &world, "/w")
            .parse_str("A = ok\njust some words\n", "Makefile")
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Makefile:2: missing separator"
        );
    }
}
