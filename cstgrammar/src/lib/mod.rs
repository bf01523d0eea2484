//! A library for turning grammar files into normalized context-free grammars: the term/rule
//! model, the surface-syntax parser, and the normalization passes (expansion, inlining,
//! merging) that bridge the two.
//!
//! Terminology:
//!
//!   * A *term* is a grammar symbol, terminal or non-terminal; both live in one namespace.
//!   * A *rule* is one production: a mapping from a non-terminal to an ordered sequence of
//!     terms, annotated with per-position conflict information.
//!   * The *normalizer* expands the surface expression tree (choice, repetition, templates)
//!     into a flat rule list, then simplifies it by inlining and merging.
//!
//! The crate guarantees that after normalization terms are numbered `0..terms.len()` in
//! creation order, rules with the same left-hand side are adjacent, and exactly one term each
//! carries the `top`, `eof` and `error` flags.

use std::{error::Error, fmt};

pub mod ast;
mod idxnewtype;
pub mod normalize;
pub mod parser;
mod rule;
mod span;
pub mod term;

pub use idxnewtype::{RuleIdx, SkipIdx, TermIdx};
pub use rule::{ConflictSpec, Rule};
pub use span::{NewlineCache, Span};
pub use term::{Assoc, Precedence, Term, TermSet, EOF, ERROR, PRESERVE, REPEATED, TERMINAL, TOP};

/// The various errors the surface parser and the normalizer can produce.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum GrammarErrorKind {
    // Surface syntax.
    UnexpectedToken(String),
    UnterminatedString,
    UnterminatedComment,
    InvalidEscape,
    InvalidCharSet,
    ExpectedIdent,
    Expected(char),
    PrematureEnd,
    UnknownDeclaration(String),
    DuplicateTopDeclaration,
    /// A rule named `as` or `from` directly after `@external-grammar` is rejected rather than
    /// misparsed as part of the declaration.
    ReservedAfterExternalGrammar(String),
    // Static validation.
    MissingTop,
    DuplicateRule(String),
    NamespaceCollision(String),
    UnknownRule(String),
    UnknownNamespace(String),
    UnknownPrecedence(String),
    WrongArgCount {
        name: String,
        expected: usize,
        got: usize,
    },
    ArgsToParameter(String),
    InvalidArgShape(String),
    SpecializeExtendClash(String),
    UnknownExternalGrammar(String),
}

/// Any error from this crate returns an instance of this struct.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct GrammarError {
    pub kind: GrammarErrorKind,
    /// At least one span; for duplication errors the first span is the original definition.
    pub spans: Vec<Span>,
}

impl Error for GrammarError {}

impl fmt::Display for GrammarError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

impl fmt::Display for GrammarErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            GrammarErrorKind::UnexpectedToken(t) => return write!(f, "Unexpected token '{}'", t),
            GrammarErrorKind::UnterminatedString => "Unterminated string literal",
            GrammarErrorKind::UnterminatedComment => "Unterminated block comment",
            GrammarErrorKind::InvalidEscape => "Invalid escape sequence",
            GrammarErrorKind::InvalidCharSet => "Invalid character set",
            GrammarErrorKind::ExpectedIdent => "Expected an identifier",
            GrammarErrorKind::Expected(c) => return write!(f, "Expected '{}'", c),
            GrammarErrorKind::PrematureEnd => "File ends prematurely",
            GrammarErrorKind::UnknownDeclaration(d) => {
                return write!(f, "Unknown declaration '@{}'", d)
            }
            GrammarErrorKind::DuplicateTopDeclaration => "Duplicate @top declaration",
            GrammarErrorKind::ReservedAfterExternalGrammar(n) => {
                return write!(
                    f,
                    "Rule name '{}' is ambiguous directly after @external-grammar; rename it or \
                     reorder the declarations",
                    n
                )
            }
            GrammarErrorKind::MissingTop => "Missing @top declaration",
            GrammarErrorKind::DuplicateRule(n) => return write!(f, "Rule '{}' defined twice", n),
            GrammarErrorKind::NamespaceCollision(n) => {
                return write!(f, "Name '{}' defined in multiple namespaces", n)
            }
            GrammarErrorKind::UnknownRule(n) => return write!(f, "Unknown rule '{}'", n),
            GrammarErrorKind::UnknownNamespace(n) => {
                return write!(f, "Unknown namespace '{}'", n)
            }
            GrammarErrorKind::UnknownPrecedence(n) => {
                return write!(f, "Unknown precedence '{}'", n)
            }
            GrammarErrorKind::WrongArgCount {
                name,
                expected,
                got,
            } => {
                return write!(
                    f,
                    "Wrong number of arguments for '{}' (expected {}, got {})",
                    name, expected, got
                )
            }
            GrammarErrorKind::ArgsToParameter(n) => {
                return write!(
                    f,
                    "Passing arguments to a parameter that already has arguments ('{}')",
                    n
                )
            }
            GrammarErrorKind::InvalidArgShape(n) => {
                return write!(f, "Invalid argument to '{}'", n)
            }
            GrammarErrorKind::SpecializeExtendClash(v) => {
                return write!(
                    f,
                    "Value {:?} declared as both @specialize and @extend",
                    v
                )
            }
            GrammarErrorKind::UnknownExternalGrammar(n) => {
                return write!(f, "No @external-grammar declaration for '{}'", n)
            }
        };
        write!(f, "{}", s)
    }
}

/// Non-fatal conditions, routed through an injected sink rather than a global logger.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum BuildWarningKind {
    UnusedRule(String),
    PrecedenceForUnknownToken(String),
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct BuildWarning {
    pub kind: BuildWarningKind,
    pub span: Span,
}

impl fmt::Display for BuildWarning {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            BuildWarningKind::UnusedRule(n) => write!(f, "Unused rule '{}'", n),
            BuildWarningKind::PrecedenceForUnknownToken(n) => {
                write!(f, "Precedence specified for unknown token '{}'", n)
            }
        }
    }
}
