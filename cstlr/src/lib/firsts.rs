//! FIRST sets, computed by a naive fixpoint over the productions. For each non-terminal the
//! set of terminals that can begin one of its derivations, plus an epsilon bit for
//! non-terminals that derive the empty string.

use vob::Vob;

use cstgrammar::{normalize::NormalGrammar, TermIdx};

use crate::RuleIndex;

#[derive(Debug)]
pub struct Firsts {
    firsts: Vec<Vob>,
    epsilons: Vob,
}

impl Firsts {
    /// Generate the firsts sets for `g`. Loops until a pass changes nothing.
    pub fn new(g: &NormalGrammar, idx: &RuleIndex) -> Self {
        let terms_len = g.terms.len();
        let mut firsts = Firsts {
            firsts: (0..terms_len).map(|_| Vob::from_elem(false, terms_len)).collect(),
            epsilons: Vob::from_elem(false, terms_len),
        };
        // Terminals trivially begin with themselves, which lets first_of_seq treat parts
        // uniformly.
        for t in g.terms.iter_idxs() {
            if g.terms.is_terminal(t) {
                firsts.firsts[usize::from(t)].set(usize::from(t), true);
            }
        }
        loop {
            let mut changed = false;
            for nt in g.terms.iter_idxs() {
                if g.terms.is_terminal(nt) {
                    continue;
                }
                for &ridx in idx.prods(nt) {
                    let rule = &g.rules[usize::from(ridx)];
                    if rule.parts.is_empty() {
                        if !firsts.is_epsilon_set(nt) {
                            firsts.epsilons.set(usize::from(nt), true);
                            changed = true;
                        }
                        continue;
                    }
                    let mut nullable = true;
                    for &sym in &rule.parts {
                        if g.terms.is_terminal(sym) {
                            if !firsts.set(nt, sym) {
                                changed = true;
                            }
                            nullable = false;
                            break;
                        }
                        for t in 0..terms_len {
                            if firsts.firsts[usize::from(sym)][t]
                                && !firsts.set(nt, TermIdx::from(t))
                            {
                                changed = true;
                            }
                        }
                        if !firsts.is_epsilon_set(sym) {
                            nullable = false;
                            break;
                        }
                    }
                    if nullable && !firsts.is_epsilon_set(nt) {
                        firsts.epsilons.set(usize::from(nt), true);
                        changed = true;
                    }
                }
            }
            if !changed {
                return firsts;
            }
        }
    }

    /// Is terminal `t` in FIRST(`nt`)?
    pub fn is_set(&self, nt: TermIdx, t: TermIdx) -> bool {
        self.firsts[usize::from(nt)][usize::from(t)]
    }

    pub fn firsts(&self, nt: TermIdx) -> &Vob {
        &self.firsts[usize::from(nt)]
    }

    pub fn is_epsilon_set(&self, nt: TermIdx) -> bool {
        self.epsilons[usize::from(nt)]
    }

    /// Set the firsts bit for (`nt`, `t`). Returns true if it was already set.
    fn set(&mut self, nt: TermIdx, t: TermIdx) -> bool {
        let row = &mut self.firsts[usize::from(nt)];
        if row[usize::from(t)] {
            true
        } else {
            row.set(usize::from(t), true);
            false
        }
    }

    /// FIRST of a symbol sequence followed by the lookahead `tail`: the lookahead set a
    /// closure item gets for a non-terminal with suffix `parts`.
    pub fn first_of_seq(&self, parts: &[TermIdx], tail: TermIdx) -> Vec<TermIdx> {
        let mut out: Vec<TermIdx> = Vec::new();
        let mut nullable = true;
        for &sym in parts {
            for t in self.firsts[usize::from(sym)].iter_set_bits(..) {
                let tidx = TermIdx::from(t);
                if !out.contains(&tidx) {
                    out.push(tidx);
                }
            }
            if !self.is_epsilon_set(sym) {
                nullable = false;
                break;
            }
        }
        if nullable && !out.contains(&tail) {
            out.push(tail);
        }
        out.sort_unstable();
        out
    }
}
