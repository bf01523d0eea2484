//! Terms are grammar symbols. Terminals and non-terminals share one namespace and live in a
//! single flat arena, the [TermSet]; everything else refers to them by [TermIdx].

use indexmap::IndexMap;

use crate::{ast::Tag, TermIdx};

/// Flag bits of a [Term].
pub const TERMINAL: u8 = 0b000001;
pub const EOF: u8 = 0b000010;
pub const ERROR: u8 = 0b000100;
pub const TOP: u8 = 0b001000;
pub const REPEATED: u8 = 0b010000;
pub const PRESERVE: u8 = 0b100000;

/// Associativity of a precedence entry.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Assoc {
    Left,
    Right,
    None,
}

/// A precedence entry attached to a position within a rule. `group` identifies the
/// `@precedence` block the entry came from: only entries sharing a group are comparable. Within
/// a group, a higher `level` wins; a negative level marks an intentional, silenced conflict.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Precedence {
    pub group: String,
    pub level: i32,
    pub assoc: Assoc,
    pub cut: bool,
}

impl Precedence {
    pub fn new(group: &str, level: i32, assoc: Assoc) -> Self {
        Precedence {
            group: group.to_string(),
            level,
            assoc,
            cut: false,
        }
    }
}

/// A grammar symbol.
#[derive(Clone, Debug)]
pub struct Term {
    pub name: String,
    pub flags: u8,
    pub tag: Option<Tag>,
}

impl Term {
    pub fn is_terminal(&self) -> bool {
        self.flags & TERMINAL != 0
    }

    /// A term is "interesting" when it carries a tag: it will be visible in output trees, and
    /// the inliner must leave it alone.
    pub fn interesting(&self) -> bool {
        self.tag.is_some()
    }
}

/// The term arena. Interns by name; iteration order is creation order, which the rest of the
/// generator relies on for deterministic output.
#[derive(Debug)]
pub struct TermSet {
    terms: Vec<Term>,
    by_name: IndexMap<String, TermIdx>,
    eof: TermIdx,
    error: TermIdx,
    top: Option<TermIdx>,
}

impl TermSet {
    pub fn new() -> Self {
        let mut ts = TermSet {
            terms: Vec::new(),
            by_name: IndexMap::new(),
            eof: TermIdx(0),
            error: TermIdx(0),
            top: None,
        };
        ts.eof = ts.intern("%eof", TERMINAL | EOF);
        ts.error = ts.intern("%error", TERMINAL | ERROR);
        ts
    }

    /// Return the term named `name`, creating it with `flags` if it does not exist. Panics if an
    /// existing term's terminal-ness disagrees with `flags`: terminals and non-terminals are
    /// disjoint.
    pub fn intern(&mut self, name: &str, flags: u8) -> TermIdx {
        if let Some(&tidx) = self.by_name.get(name) {
            assert_eq!(
                self.terms[usize::from(tidx)].flags & TERMINAL,
                flags & TERMINAL,
                "term {} interned as both terminal and non-terminal",
                name
            );
            return tidx;
        }
        let tidx = TermIdx::from(self.terms.len());
        self.terms.push(Term {
            name: name.to_string(),
            flags,
            tag: None,
        });
        self.by_name.insert(name.to_string(), tidx);
        tidx
    }

    /// Create a term with a fresh name derived from `base` (suffixing a counter on collision).
    pub fn fresh(&mut self, base: &str, flags: u8) -> TermIdx {
        if !self.by_name.contains_key(base) {
            return self.intern(base, flags);
        }
        let mut n = 1;
        loop {
            let name = format!("{}.{}", base, n);
            if !self.by_name.contains_key(&name) {
                return self.intern(&name, flags);
            }
            n += 1;
        }
    }

    pub fn get(&self, tidx: TermIdx) -> &Term {
        &self.terms[usize::from(tidx)]
    }

    pub fn get_mut(&mut self, tidx: TermIdx) -> &mut Term {
        &mut self.terms[usize::from(tidx)]
    }

    pub fn lookup(&self, name: &str) -> Option<TermIdx> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn iter_idxs(&self) -> impl Iterator<Item = TermIdx> {
        (0..self.terms.len()).map(TermIdx::from)
    }

    pub fn name(&self, tidx: TermIdx) -> &str {
        &self.terms[usize::from(tidx)].name
    }

    pub fn is_terminal(&self, tidx: TermIdx) -> bool {
        self.get(tidx).is_terminal()
    }

    pub fn eof_idx(&self) -> TermIdx {
        self.eof
    }

    pub fn error_idx(&self) -> TermIdx {
        self.error
    }

    /// Mark `tidx` as the top term. There is exactly one; a second call panics.
    pub fn set_top(&mut self, tidx: TermIdx) {
        assert!(self.top.is_none(), "top term set twice");
        self.get_mut(tidx).flags |= TOP;
        self.top = Some(tidx);
    }

    pub fn top_idx(&self) -> TermIdx {
        self.top.expect("top term not set")
    }
}

impl Default for TermSet {
    fn default() -> Self {
        Self::new()
    }
}
