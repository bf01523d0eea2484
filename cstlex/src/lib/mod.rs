//! The tokenizer builder: compiles token-rule expressions into an NFA over UTF-16 code units,
//! determinizes it, and reports token conflicts. Character ranges above the BMP are lowered to
//! surrogate-pair transitions, so the automata themselves never see a value above `0xFFFF`.

use std::{error::Error, fmt};

use cstgrammar::{idx_newtype, normalize::NormalGrammar, Span, TermIdx};

pub mod dfa;
pub mod nfa;

pub use dfa::{conflicts, determinize, minimize, precedence_ranks, Dfa, DfaState};
pub use nfa::{Nfa, NfaBuilder, NfaNode};

idx_newtype!(
    /// An index into an [Nfa]'s node arena.
    NfaIdx
);
idx_newtype!(
    /// An index into a [Dfa]'s state array.
    DfaIdx
);

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum LexErrorKind {
    /// The tokenizer's start state accepts: some token matches the empty string.
    ZeroLengthToken(String),
    /// A token rule recursed anywhere but tail position; the chain lists the rules involved.
    NonTailRecursion(Vec<String>),
    CyclicTokenPrecedence(String),
    UnknownTokenRule(String),
    WrongArgCount {
        name: String,
        expected: usize,
        got: usize,
    },
    /// An expression form that cannot appear inside token rules (e.g. `@specialize`).
    InvalidTokenExpr(String),
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct LexBuildError {
    pub kind: LexErrorKind,
    pub spans: Vec<Span>,
}

impl Error for LexBuildError {}

impl fmt::Display for LexBuildError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

impl fmt::Display for LexErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LexErrorKind::ZeroLengthToken(n) => {
                write!(f, "Token '{}' can match the empty string", n)
            }
            LexErrorKind::NonTailRecursion(chain) => {
                write!(f, "Invalid non-tail recursion in token rules: {}", chain.join(" -> "))
            }
            LexErrorKind::CyclicTokenPrecedence(n) => {
                write!(f, "Cyclic token precedence involving '{}'", n)
            }
            LexErrorKind::UnknownTokenRule(n) => write!(f, "Unknown token rule '{}'", n),
            LexErrorKind::WrongArgCount {
                name,
                expected,
                got,
            } => write!(
                f,
                "Wrong number of arguments for token rule '{}' (expected {}, got {})",
                name, expected, got
            ),
            LexErrorKind::InvalidTokenExpr(what) => {
                write!(f, "{} cannot appear inside token rules", what)
            }
        }
    }
}

pub type LexBuildResult<T> = Result<T, LexBuildError>;

/// The facade downstream layers use: builds per-token-set DFAs against one grammar.
pub struct TokenDfaBuilder<'a> {
    grammar: &'a NormalGrammar,
    ranks: fnv::FnvHashMap<TermIdx, usize>,
}

impl<'a> TokenDfaBuilder<'a> {
    pub fn new(grammar: &'a NormalGrammar) -> LexBuildResult<Self> {
        let ranks = precedence_ranks(&grammar.token_precedences, &grammar.terms)?;
        Ok(TokenDfaBuilder { grammar, ranks })
    }

    /// The terminals this builder can match with a DFA, in term order.
    pub fn dfa_terms(&self) -> Vec<TermIdx> {
        self.grammar.token_roots.iter().map(|(t, _)| *t).collect()
    }

    /// The linear token priority list produced by topologically sorting the precedence
    /// declarations.
    pub fn rank_order(&self) -> Vec<TermIdx> {
        let mut order: Vec<(usize, TermIdx)> =
            self.ranks.iter().map(|(&t, &r)| (r, t)).collect();
        order.sort_unstable();
        order.into_iter().map(|(_, t)| t).collect()
    }

    /// Build the (minimized, zero-length-checked) DFA recognizing exactly `terms`.
    pub fn build_dfa(&self, terms: &[TermIdx]) -> LexBuildResult<Dfa> {
        let mut builder = NfaBuilder::new(&self.grammar.token_rules);
        let mut roots = Vec::new();
        for (t, e) in &self.grammar.token_roots {
            if terms.contains(t) {
                roots.push((*t, e));
            }
        }
        let nfa = builder.build(&roots)?;
        let dfa = minimize(&determinize(&nfa, &self.ranks));
        if let Some(&t) = dfa.states[0].accept.first() {
            return Err(LexBuildError {
                kind: LexErrorKind::ZeroLengthToken(self.grammar.terms.name(t).to_string()),
                spans: vec![Span::new(0, 0)],
            });
        }
        Ok(dfa)
    }

    /// Build a DFA matching a single ad-hoc expression (used for nested-grammar end tokens).
    pub fn build_expr_dfa(
        &self,
        term: TermIdx,
        expr: &cstgrammar::ast::Expr,
    ) -> LexBuildResult<Dfa> {
        let mut builder = NfaBuilder::new(&self.grammar.token_rules);
        let nfa = builder.build(&[(term, expr)])?;
        Ok(minimize(&determinize(&nfa, &self.ranks)))
    }

    /// Pairs of terminals that cannot coexist in one tokenizer context: some input is accepted
    /// as both and the precedence order does not separate them.
    pub fn all_conflicts(&self) -> LexBuildResult<Vec<(TermIdx, TermIdx)>> {
        let mut builder = NfaBuilder::new(&self.grammar.token_rules);
        let roots: Vec<_> = self
            .grammar
            .token_roots
            .iter()
            .map(|(t, e)| (*t, e))
            .collect();
        let nfa = builder.build(&roots)?;
        let dfa = determinize(&nfa, &self.ranks);
        Ok(conflicts(&dfa, &self.ranks))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use cstgrammar::{normalize::normalize, parser::GrammarParser};

    fn grammar(src: &str) -> NormalGrammar {
        let ast = GrammarParser::new(src).parse().unwrap();
        normalize(&ast, &mut |_| ()).unwrap()
    }

    #[test]
    fn specialize_scenario() {
        // The literal "if" tokenizes to the specialized terminal, plain identifiers to `id`.
        let g = grammar(
            "@top { (id | @specialize<id, \"if\">) \"x\" } @tokens { id { [a-z]+ } }",
        );
        let b = TokenDfaBuilder::new(&g).unwrap();
        let dfa = b.build_dfa(&b.dfa_terms()).unwrap();
        let id = g.token_roots[0].0;
        assert_eq!(dfa.run("foo"), Some((3, id)));
        // The specialized terminal never appears in the DFA; the runtime looks the lexeme up
        // in the specialize table after matching the base token.
        assert_eq!(dfa.run("if"), Some((2, id)));
        assert_eq!(g.specializations.len(), 1);
        assert_eq!(g.specializations[0].value, "if");
        assert_eq!(g.token_origin(g.specializations[0].term), id);
    }

    #[test]
    fn zero_length_token_fatal() {
        let g = grammar("@top { sp \"y\" \"z\" } @tokens { sp { \"x\"* } }");
        let b = TokenDfaBuilder::new(&g).unwrap();
        match b.build_dfa(&b.dfa_terms()) {
            Err(LexBuildError {
                kind: LexErrorKind::ZeroLengthToken(n),
                ..
            }) => assert_eq!(n, "sp"),
            r => panic!("unexpected result {:?}", r.map(|_| ())),
        }
    }

    #[test]
    fn nested_end_token_dfa() {
        let g = grammar("@top { nest.js<:block, \"}\"> } @external-grammar js from \"./js\"");
        let b = TokenDfaBuilder::new(&g).unwrap();
        let n = &g.nested[0];
        let dfa = b
            .build_expr_dfa(n.term, n.end_token.as_ref().unwrap())
            .unwrap();
        assert_eq!(dfa.run("}"), Some((1, n.term)));
        assert_eq!(dfa.run("x"), None);
        assert_eq!(dfa.run("}}"), Some((1, n.term)));
    }

    #[test]
    fn grammar_level_precedence_feeds_ranks() {
        let g = grammar(
            "@top { id kw \"~\" } @tokens { id { [a-z]+ } kw { \"if\" } @precedence { kw, id } }",
        );
        let b = TokenDfaBuilder::new(&g).unwrap();
        assert!(b.all_conflicts().unwrap().is_empty());
        let dfa = b.build_dfa(&b.dfa_terms()).unwrap();
        let kw = g.terms.lookup("kw").unwrap();
        assert_eq!(dfa.run("if"), Some((2, kw)));
    }

    #[test]
    fn conflicting_tokens_reported() {
        let g = grammar("@top { id kw \"~\" } @tokens { id { [a-z]+ } kw { \"if\" } }");
        let b = TokenDfaBuilder::new(&g).unwrap();
        let cs = b.all_conflicts().unwrap();
        assert_eq!(cs.len(), 1);
    }
}
