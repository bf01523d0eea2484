//! Construction of the LR(1) automaton, its LALR-style collapse, token-group partitioning,
//! and the final packing into flat 16-bit tables.
//!
//! The pipeline is: [stategraph::build_stategraph] explores the canonical LR(1) automaton from
//! a normalized grammar, [collapse::collapse] merges states that share an item core (reverting
//! merges that would manufacture conflicts), [groups::assign_groups] gives every state a
//! tokenizer context, and [statetable::pack] serializes the result.

use std::{error::Error, fmt};

use cstgrammar::idx_newtype;

pub mod collapse;
pub mod firsts;
pub mod groups;
pub mod itemset;
pub mod stategraph;
pub mod statetable;

pub use firsts::Firsts;
pub use itemset::Pos;
pub use stategraph::{Action, ActionEntry, State, StateGraph};
pub use statetable::StateTable;

idx_newtype!(
    /// An index into a [StateGraph]'s state array.
    StIdx
);
idx_newtype!(
    /// A token-group number; at most 16 exist.
    GrpIdx
);

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum TableErrorKind {
    /// A shift/reduce conflict not resolved by precedence. Carries the reduce item's textual
    /// form and the lookahead.
    ShiftReduceConflict { item: String, lookahead: String },
    ReduceReduceConflict {
        item: String,
        other: String,
        lookahead: String,
    },
    TooManyTokenGroups,
    /// Token groups plus external and nested tokenizers exceed the 16-bit selection mask.
    TooManyTokenizers,
    /// Two conflicting tokens are both expected in a single parse state, so no group
    /// assignment can separate them.
    OverlappingTokensInContext(String, String),
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TableError {
    pub kind: TableErrorKind,
}

impl Error for TableError {}

impl fmt::Display for TableError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            TableErrorKind::ShiftReduceConflict { item, lookahead } => {
                write!(f, "shift/reduce conflict at [{}] on '{}'", item, lookahead)
            }
            TableErrorKind::ReduceReduceConflict {
                item,
                other,
                lookahead,
            } => write!(
                f,
                "reduce/reduce conflict between [{}] and [{}] on '{}'",
                item, other, lookahead
            ),
            TableErrorKind::TooManyTokenGroups => {
                write!(f, "Too many token groups (more than 16)")
            }
            TableErrorKind::TooManyTokenizers => {
                write!(f, "Too many tokenizers (token groups plus external tokenizers exceed 16)")
            }
            TableErrorKind::OverlappingTokensInContext(a, b) => {
                write!(f, "Overlapping tokens '{}' and '{}' used in the same context", a, b)
            }
        }
    }
}

/// Per-non-terminal production lists over a normalized grammar's flat rule vector.
pub struct RuleIndex {
    prods_for: Vec<Vec<cstgrammar::RuleIdx>>,
}

impl RuleIndex {
    pub fn new(g: &cstgrammar::normalize::NormalGrammar) -> Self {
        let mut prods_for = vec![Vec::new(); g.terms.len()];
        for (i, r) in g.rules.iter().enumerate() {
            prods_for[usize::from(r.lhs)].push(cstgrammar::RuleIdx::from(i));
        }
        RuleIndex { prods_for }
    }

    pub fn prods(&self, nt: cstgrammar::TermIdx) -> &[cstgrammar::RuleIdx] {
        &self.prods_for[usize::from(nt)]
    }
}
