//! The surface AST produced by [crate::parser::GrammarParser], consumed by the normalizer.
//!
//! Expressions are an exhaustive enum: every consumer matches on all variants. Structural
//! equality (ignoring spans) is provided through [Expr::canon], which renders an expression to a
//! canonical string usable as a cheap memoization key.

use std::fmt;

use crate::{term::Assoc, GrammarError, GrammarErrorKind, Span};

/// A dotted tree label, e.g. `variable.name`, with optional `key="value"` properties.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Tag {
    pub parts: Vec<String>,
    pub props: Vec<(String, String)>,
}

impl Tag {
    pub fn new(parts: Vec<String>) -> Self {
        Tag {
            parts,
            props: Vec::new(),
        }
    }

    pub fn from_name(name: &str) -> Self {
        Tag::new(name.split('.').map(|s| s.to_string()).collect())
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.parts.join("."))?;
        for (k, v) in &self.props {
            write!(f, " {}={:?}", k, v)?;
        }
        Ok(())
    }
}

/// A conflict marker written at a position inside a sequence: `~name` (ambiguity) or `!name`
/// (precedence reference).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Marker {
    pub ambig: bool,
    pub name: String,
    pub span: Span,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RepeatKind {
    ZeroOrMore,
    OneOrMore,
    Optional,
}

#[derive(Clone, Debug)]
pub enum Expr {
    /// A literal string, matched verbatim.
    Literal { value: String, span: Span },
    /// `_`: any single character.
    AnyChar { span: Span },
    /// A character set, as inclusive code point ranges. `^` inversion is resolved by the parser.
    Set { ranges: Vec<(u32, u32)>, span: Span },
    /// A (possibly namespaced, possibly parameterized) reference: `id`, `ns.id`, `id<args>`.
    Ref {
        space: Option<String>,
        name: String,
        args: Vec<Expr>,
        span: Span,
    },
    /// A sequence. `markers` has one entry per inter-element position including both ends, so
    /// `markers.len() == exprs.len() + 1`.
    Seq {
        exprs: Vec<Expr>,
        markers: Vec<Vec<Marker>>,
        span: Span,
    },
    Choice { exprs: Vec<Expr>, span: Span },
    Repeat {
        expr: Box<Expr>,
        kind: RepeatKind,
        span: Span,
    },
    /// An expression with an inline tag: `expr = name` or `tagged(expr)`.
    Tagged {
        expr: Box<Expr>,
        tag: Tag,
        span: Span,
    },
    /// `@specialize<token, "lit">` / `@extend<token, "lit">`.
    Specialize {
        token: Box<Expr>,
        value: String,
        extend: bool,
        span: Span,
    },
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::Literal { span, .. }
            | Expr::AnyChar { span }
            | Expr::Set { span, .. }
            | Expr::Ref { span, .. }
            | Expr::Seq { span, .. }
            | Expr::Choice { span, .. }
            | Expr::Repeat { span, .. }
            | Expr::Tagged { span, .. }
            | Expr::Specialize { span, .. } => *span,
        }
    }

    /// Render this expression to a canonical string: two expressions are structurally equal iff
    /// their canonical strings are equal. Spans are excluded.
    pub fn canon(&self) -> String {
        let mut s = String::new();
        self.canon_into(&mut s);
        s
    }

    fn canon_into(&self, out: &mut String) {
        match self {
            Expr::Literal { value, .. } => {
                out.push_str(&format!("lit{:?}", value));
            }
            Expr::AnyChar { .. } => out.push_str("any"),
            Expr::Set { ranges, .. } => {
                out.push_str("set[");
                for (lo, hi) in ranges {
                    out.push_str(&format!("{:x}-{:x},", lo, hi));
                }
                out.push(']');
            }
            Expr::Ref {
                space, name, args, ..
            } => {
                if let Some(sp) = space {
                    out.push_str(sp);
                    out.push('.');
                }
                out.push_str(name);
                if !args.is_empty() {
                    out.push('<');
                    for a in args {
                        a.canon_into(out);
                        out.push(',');
                    }
                    out.push('>');
                }
            }
            Expr::Seq { exprs, markers, .. } => {
                out.push_str("seq(");
                for (i, e) in exprs.iter().enumerate() {
                    for m in &markers[i] {
                        out.push(if m.ambig { '~' } else { '!' });
                        out.push_str(&m.name);
                        out.push(' ');
                    }
                    e.canon_into(out);
                    out.push(' ');
                }
                for m in markers.last().unwrap() {
                    out.push(if m.ambig { '~' } else { '!' });
                    out.push_str(&m.name);
                    out.push(' ');
                }
                out.push(')');
            }
            Expr::Choice { exprs, .. } => {
                out.push_str("choice(");
                for e in exprs {
                    e.canon_into(out);
                    out.push('|');
                }
                out.push(')');
            }
            Expr::Repeat { expr, kind, .. } => {
                expr.canon_into(out);
                out.push(match kind {
                    RepeatKind::ZeroOrMore => '*',
                    RepeatKind::OneOrMore => '+',
                    RepeatKind::Optional => '?',
                });
            }
            Expr::Tagged { expr, tag, .. } => {
                out.push_str("tag(");
                out.push_str(&tag.to_string());
                out.push(':');
                expr.canon_into(out);
                out.push(')');
            }
            Expr::Specialize {
                token,
                value,
                extend,
                ..
            } => {
                out.push_str(if *extend { "extend(" } else { "specialize(" });
                token.canon_into(out);
                out.push_str(&format!(",{:?})", value));
            }
        }
    }
}

/// A named rule declaration: `[@export] Id[<params>] [= name] [[props]] { expr }`. Used both for
/// grammar rules and for rules inside `@tokens`.
#[derive(Clone, Debug)]
pub struct RuleDecl {
    pub exported: bool,
    pub name: String,
    pub name_span: Span,
    pub params: Vec<String>,
    pub tag: Option<Tag>,
    pub expr: Expr,
    pub span: Span,
}

/// One entry of a top-level `@precedence { ... }` block.
#[derive(Clone, Debug)]
pub struct PrecTerm {
    pub name: String,
    pub assoc: Assoc,
    pub cut: bool,
    pub span: Span,
}

#[derive(Clone, Debug, Default)]
pub struct TokensDecl {
    pub rules: Vec<RuleDecl>,
    /// Each `@precedence { a, b, ... }` block inside `@tokens`, earlier entries taking priority.
    pub precedences: Vec<Vec<(String, Span)>>,
}

/// `@skip { expr }` (global when `rules` is empty) or `@skip { expr } { rules }` (scoped).
#[derive(Clone, Debug)]
pub struct SkipDecl {
    pub expr: Expr,
    pub rules: Vec<RuleDecl>,
    pub span: Span,
}

#[derive(Clone, Debug)]
pub struct ExternalTokensDecl {
    pub name: String,
    pub source: String,
    pub tokens: Vec<(String, Option<Tag>, Span)>,
    pub span: Span,
}

#[derive(Clone, Debug)]
pub struct ExternalGrammarDecl {
    pub name: String,
    pub alias: Option<String>,
    pub source: Option<String>,
    pub span: Span,
}

#[derive(Clone, Debug, Default)]
pub struct TagsDecl {
    /// `term = :tag;`
    pub assigns: Vec<(String, Tag, Span)>,
    /// `@export name :tag;` — introduces a preserved non-terminal.
    pub exports: Vec<(String, Tag, Span)>,
    /// `@punctuation "()[]";`
    pub punctuation: Vec<(String, Span)>,
    pub detect_delim: bool,
}

/// All top-level declarations of a grammar file.
#[derive(Clone, Debug, Default)]
pub struct GrammarRoot {
    pub top: Option<(Expr, Span)>,
    pub rules: Vec<RuleDecl>,
    pub tokens: TokensDecl,
    pub precedences: Vec<Vec<PrecTerm>>,
    pub skips: Vec<SkipDecl>,
    pub external_tokens: Vec<ExternalTokensDecl>,
    pub external_grammars: Vec<ExternalGrammarDecl>,
    pub tags: TagsDecl,
}

impl GrammarRoot {
    pub fn get_rule(&self, name: &str) -> Option<&RuleDecl> {
        self.rules.iter().find(|r| r.name == name)
    }

    pub fn get_token_rule(&self, name: &str) -> Option<&RuleDecl> {
        self.tokens.rules.iter().find(|r| r.name == name)
    }

    /// Static validation run after parsing: the `@top` invariant and name-clash checks that do
    /// not need the normalizer's environment.
    pub fn validate(&self) -> Result<(), GrammarError> {
        if self.top.is_none() {
            return Err(GrammarError {
                kind: GrammarErrorKind::MissingTop,
                spans: vec![Span::new(0, 0)],
            });
        }
        for (i, r) in self.rules.iter().enumerate() {
            if let Some(dup) = self.rules[i + 1..].iter().find(|r2| r2.name == r.name) {
                return Err(GrammarError {
                    kind: GrammarErrorKind::DuplicateRule(r.name.clone()),
                    spans: vec![r.name_span, dup.name_span],
                });
            }
            if let Some(tok) = self.get_token_rule(&r.name) {
                return Err(GrammarError {
                    kind: GrammarErrorKind::NamespaceCollision(r.name.clone()),
                    spans: vec![r.name_span, tok.name_span],
                });
            }
        }
        for (i, r) in self.tokens.rules.iter().enumerate() {
            if let Some(dup) = self.tokens.rules[i + 1..].iter().find(|r2| r2.name == r.name) {
                return Err(GrammarError {
                    kind: GrammarErrorKind::DuplicateRule(r.name.clone()),
                    spans: vec![r.name_span, dup.name_span],
                });
            }
        }
        for eg in &self.external_grammars {
            let name = eg.alias.as_ref().unwrap_or(&eg.name);
            if let Some(r) = self.get_rule(name) {
                return Err(GrammarError {
                    kind: GrammarErrorKind::NamespaceCollision(name.clone()),
                    spans: vec![eg.span, r.name_span],
                });
            }
        }
        Ok(())
    }
}
