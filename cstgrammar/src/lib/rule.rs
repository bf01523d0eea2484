use crate::{
    term::{Precedence, TermSet},
    SkipIdx, TermIdx,
};

/// The conflict annotations attached to one inter-term position of a rule (including both
/// ends).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConflictSpec {
    /// Precedence entries (`!name` markers, resolved).
    pub prec: Vec<Precedence>,
    /// Ambiguity group names (`~name` markers).
    pub ambig: Vec<String>,
    /// A cut marker was present at this position.
    pub cut: bool,
}

impl ConflictSpec {
    pub fn empty() -> Self {
        ConflictSpec::default()
    }

    pub fn is_empty(&self) -> bool {
        self.prec.is_empty() && self.ambig.is_empty() && !self.cut
    }

    /// Merge `other` into `self`, deduplicating entries. Used when splicing rules together
    /// (inlining, sequence bridging).
    pub fn merge(&mut self, other: &ConflictSpec) {
        for p in &other.prec {
            if !self.prec.contains(p) {
                self.prec.push(p.clone());
            }
        }
        for a in &other.ambig {
            if !self.ambig.contains(a) {
                self.ambig.push(a.clone());
            }
        }
        self.cut |= other.cut;
    }

    /// All precedence entries of this position, with ambiguity groups folded in as
    /// negative-level entries so the automaton's resolution ladder sees them uniformly.
    pub fn entries(&self) -> Vec<Precedence> {
        let mut out = self.prec.clone();
        for a in &self.ambig {
            out.push(Precedence {
                group: format!("~{}", a),
                level: -1,
                assoc: crate::term::Assoc::None,
                cut: false,
            });
        }
        out
    }

    /// Lax equality used by the merging pass: two positions compare equal when their ambiguity
    /// groups match and one precedence list is a prefix of the other (trailing entries are
    /// ignored).
    pub fn eq_lax(&self, other: &ConflictSpec) -> bool {
        if self.ambig != other.ambig || self.cut != other.cut {
            return false;
        }
        let n = self.prec.len().min(other.prec.len());
        self.prec[..n] == other.prec[..n]
    }
}

/// A normalized grammar rule: one production of `lhs`.
#[derive(Clone, Debug)]
pub struct Rule {
    pub lhs: TermIdx,
    pub parts: Vec<TermIdx>,
    /// `conflicts.len() == parts.len() + 1`: one entry per inter-term position including both
    /// ends.
    pub conflicts: Vec<ConflictSpec>,
    /// The skip scope active inside this production.
    pub skip: SkipIdx,
}

impl Rule {
    pub fn new(lhs: TermIdx, parts: Vec<TermIdx>, conflicts: Vec<ConflictSpec>, skip: SkipIdx) -> Self {
        assert_eq!(conflicts.len(), parts.len() + 1);
        Rule {
            lhs,
            parts,
            conflicts,
            skip,
        }
    }

    /// The union of every position's conflict annotations: the precedence context a reduction
    /// of this rule carries.
    pub fn aggregate_conflicts(&self) -> ConflictSpec {
        let mut agg = ConflictSpec::empty();
        for c in &self.conflicts {
            agg.merge(c);
        }
        agg
    }

    pub fn pp(&self, terms: &TermSet) -> String {
        let mut s = format!("{} ->", terms.name(self.lhs));
        for &p in &self.parts {
            s.push(' ');
            s.push_str(terms.name(p));
        }
        s
    }

    /// Pretty-print this rule as an item with the dot at `dot`, for conflict messages.
    pub fn pp_item(&self, terms: &TermSet, dot: usize) -> String {
        let mut s = format!("{} ->", terms.name(self.lhs));
        for (i, &p) in self.parts.iter().enumerate() {
            if i == dot {
                s.push_str(" .");
            }
            s.push(' ');
            s.push_str(terms.name(p));
        }
        if dot == self.parts.len() {
            s.push_str(" .");
        }
        s
    }

    /// Termwise body equality under the merging pass's lax conflict comparison.
    pub fn same_body_lax(&self, other: &Rule) -> bool {
        self.skip == other.skip
            && self.parts == other.parts
            && self
                .conflicts
                .iter()
                .zip(other.conflicts.iter())
                .all(|(a, b)| a.eq_lax(b))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::term::{Assoc, Precedence, TermSet, TERMINAL};
    use crate::SkipIdx;

    #[test]
    fn pp_item_dots() {
        let mut ts = TermSet::new();
        let e = ts.intern("Expr", 0);
        let plus = ts.intern("+", TERMINAL);
        let r = Rule::new(
            e,
            vec![e, plus, e],
            vec![ConflictSpec::empty(); 4],
            SkipIdx(0),
        );
        assert_eq!(r.pp_item(&ts, 0), "Expr -> . Expr + Expr");
        assert_eq!(r.pp_item(&ts, 2), "Expr -> Expr + . Expr");
        assert_eq!(r.pp_item(&ts, 3), "Expr -> Expr + Expr .");
    }

    #[test]
    fn lax_conflict_equality() {
        let p1 = Precedence::new("g", 1, Assoc::Left);
        let p2 = Precedence::new("g", 2, Assoc::Left);
        let a = ConflictSpec {
            prec: vec![p1.clone()],
            ambig: vec![],
            cut: false,
        };
        let b = ConflictSpec {
            prec: vec![p1.clone(), p2.clone()],
            ambig: vec![],
            cut: false,
        };
        let c = ConflictSpec {
            prec: vec![p2],
            ambig: vec![],
            cut: false,
        };
        assert!(a.eq_lax(&b));
        assert!(b.eq_lax(&a));
        assert!(!a.eq_lax(&c));
    }

    #[test]
    fn aggregate_unions_positions() {
        let mut ts = TermSet::new();
        let e = ts.intern("E", 0);
        let t = ts.intern("t", TERMINAL);
        let p = Precedence::new("g", 3, Assoc::Right);
        let mut c0 = ConflictSpec::empty();
        c0.prec.push(p.clone());
        let mut c2 = ConflictSpec::empty();
        c2.ambig.push("x".to_string());
        let r = Rule::new(e, vec![t, t], vec![c0, ConflictSpec::empty(), c2], SkipIdx(0));
        let agg = r.aggregate_conflicts();
        assert_eq!(agg.prec, vec![p]);
        assert_eq!(agg.ambig, vec!["x".to_string()]);
    }
}
