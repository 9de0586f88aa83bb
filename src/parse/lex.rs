//! Token-level scan used to classify one logical makefile line.
//!
//! The scanner only locates the structural split points of a line (assignment
//! operator, rule separator, order-only pipe, inline-recipe semicolon) while
//! tracking `$(...)`/`${...}` nesting so that delimiters inside references do
//! not count. Text is never reconstructed from tokens; the classifier slices
//! the original line at the reported byte positions.

use logos::Logos;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Logos)]
pub(crate) enum Tok {
    #[token("$(")]
    DollarOpen,
    #[token("${")]
    DollarBraceOpen,
    #[token("(")]
    Open,
    #[token("{")]
    BraceOpen,
    #[token(")")]
    Close,
    #[token("}")]
    BraceClose,

    #[token("::")]
    DoubleColon,
    #[token(":=")]
    ColonEq,
    #[token("?=")]
    QuestionEq,
    #[token("+=")]
    PlusEq,
    #[token("=")]
    Eq,
    #[token(":")]
    Colon,
    #[token("|")]
    Pipe,
    #[token(";")]
    Semi,

    #[token("$")]
    Dollar,
    #[token("?")]
    Question,
    #[token("+")]
    Plus,
    #[regex(r"[ \t]+")]
    Space,
    #[regex(r"[^ \t$:=?+|;(){}]+")]
    Text,
}

/// Which assignment operator a line uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AssignOp {
    Recursive,
    Simple,
    Conditional,
    Append,
}

/// Structural split points of one logical line, all as byte offsets into the
/// original text. `colon` is the first top-level rule separator; `assign` is
/// only reported when the operator appears before any separator.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct LineShape {
    pub assign: Option<(AssignOp, usize, usize)>,
    pub colon: Option<(usize, bool)>,
    pub second_colon: Option<usize>,
    pub pipe: Option<usize>,
    pub semi: Option<usize>,
}

pub(crate) fn scan_line(line: &str) -> LineShape {
    let mut shape = LineShape::default();
    let mut depth = 0usize;
    let mut lexer = Tok::lexer(line);

    while let Some(tok) = lexer.next() {
        let Ok(tok) = tok else { continue };
        let span = lexer.span();
        match tok {
            Tok::DollarOpen | Tok::DollarBraceOpen | Tok::Open | Tok::BraceOpen => depth += 1,
            Tok::Close | Tok::BraceClose => depth = depth.saturating_sub(1),
            _ if depth > 0 => {}

            Tok::ColonEq | Tok::QuestionEq | Tok::PlusEq | Tok::Eq
                if shape.assign.is_none() && shape.colon.is_none() =>
            {
                let op = match tok {
                    Tok::ColonEq => AssignOp::Simple,
                    Tok::QuestionEq => AssignOp::Conditional,
                    Tok::PlusEq => AssignOp::Append,
                    _ => AssignOp::Recursive,
                };
                shape.assign = Some((op, span.start, span.end));
            }
            Tok::Colon | Tok::DoubleColon => {
                if shape.assign.is_some() {
                    // Part of the assigned value.
                } else if shape.colon.is_none() {
                    shape.colon = Some((span.start, tok == Tok::DoubleColon));
                } else if shape.second_colon.is_none() && shape.semi.is_none() {
                    shape.second_colon = Some(span.start);
                }
            }
            Tok::Pipe if shape.colon.is_some() && shape.pipe.is_none() && shape.semi.is_none() => {
                shape.pipe = Some(span.start);
            }
            Tok::Semi if shape.colon.is_some() && shape.semi.is_none() => {
                shape.semi = Some(span.start);
                // Everything after `;` is recipe text; stop interpreting.
                break;
            }
            _ => {}
        }
    }
    shape
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignment_operators() {
        assert_eq!(
            scan_line("VAR = val").assign,
            Some((AssignOp::Recursive, 4, 5))
        );
        assert_eq!(
            scan_line("VAR := val").assign,
            Some((AssignOp::Simple, 4, 6))
        );
        assert_eq!(
            scan_line("VAR ?= val").assign,
            Some((AssignOp::Conditional, 4, 6))
        );
        assert_eq!(
            scan_line("VAR += val").assign,
            Some((AssignOp::Append, 4, 6))
        );
    }

    #[test]
    fn rule_separator_wins_when_first() {
        let shape = scan_line("all: a b");
        assert_eq!(shape.colon, Some((3, false)));
        assert_eq!(shape.assign, None);

        // An `=` after the separator belongs to the prerequisite text.
        let shape = scan_line("all: FLAG=1");
        assert_eq!(shape.colon, Some((3, false)));
        assert_eq!(shape.assign, None);
    }

    #[test]
    fn assignment_value_may_contain_colon() {
        let shape = scan_line("PATHS = a:b:c");
        assert_eq!(shape.assign.map(|a| a.0), Some(AssignOp::Recursive));
        assert_eq!(shape.colon, None);
    }

    #[test]
    fn references_hide_delimiters() {
        let shape = scan_line("lib/libnvc.a: src/lib.$(OBJEXT)");
        assert_eq!(shape.colon, Some((12, false)));
        assert_eq!(shape.second_colon, None);

        let shape = scan_line("X = $(subst a,b,c:d)");
        assert_eq!(shape.assign.map(|a| a.0), Some(AssignOp::Recursive));
        assert_eq!(shape.colon, None);
    }

    #[test]
    fn double_colon_and_order_only() {
        let shape = scan_line("log:: dep | dir");
        assert_eq!(shape.colon, Some((3, true)));
        assert_eq!(shape.pipe, Some(10));
    }

    #[test]
    fn inline_recipe_stops_the_scan() {
        let shape = scan_line(".c.o: ; gcc -c $< -o $@");
        assert_eq!(shape.colon, Some((4, false)));
        assert_eq!(shape.semi, Some(6));
        // The colon inside the recipe text is not a second separator.
        let shape = scan_line("t: ; echo a:b");
        assert_eq!(shape.second_colon, None);
    }

    #[test]
    fn static_pattern_rule() {
        let shape = scan_line("$(OBJS): %.o: %.c");
        assert_eq!(shape.colon.map(|c| c.1), Some(false));
        assert!(shape.second_colon.is_some());
    }
}
