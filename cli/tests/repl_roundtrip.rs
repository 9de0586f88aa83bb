//! Parse → `save` → reparse must yield an equivalent rule database.

use std::path::Path;

use expect_test::expect;

use smak::parse::Parser;
use smak::rules::RuleSet;
use smak::vars::{Expander, VarStore};
use smak::world::{ShellOutput, World};

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
    fn run_shell(&self, _: &Path, _: &str) -> std::io::Result<ShellOutput> {
        Ok(ShellOutput {
            stdout: String::new(),
            status: 0,
        })
    }
    fn glob(&self, _: &Path, _: &str) -> Vec<String> {
        vec![]
    }
}

fn parse_and_render(text: &str) -> String {
    let world = NullWorld;
    let mut vars = VarStore::new();
    let mut rules = RuleSet::new();
    Parser::new(&mut vars, &mut rules, &world, "/w")
        .parse_str(text, "Makefile")
        .expect("parse failed");
    let mut ex = Expander::new(&vars, &world, Path::new("/w"));
    rules.finalize(&mut ex).expect("finalize failed");
    rules.render()
}

#[test]
fn render_is_a_fixed_point() {
    let makefile = "\
.PHONY: all clean
vpath %.c src

all: prog

prog: main.o util.o | out
\tcc -o prog main.o util.o

%.o: %.c
\tcc -c $< -o $@

clean:
\trm -f prog *.o
";
    let first = parse_and_render(makefile);
    let second = parse_and_render(&first);
    assert_eq!(first, second, "render must be stable under reparse");
}

#[test]
fn render_snapshot() {
    let makefile = "\
.PHONY: clean
objs = main.o

prog: $(objs)
\tcc -o $@ $(objs)

clean: ; rm -f prog
";
    let rendered = parse_and_render(makefile);
    expect![[r#"
        .PHONY: clean

        prog: $(objs)
        	cc -o $@ $(objs)

        clean:
        	rm -f prog
    "#]]
    .assert_eq(&rendered);
}
