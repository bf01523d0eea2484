//! LR(1) items and the closure/goto operations over sorted item vectors.

use fnv::FnvHashSet;

use cstgrammar::{normalize::NormalGrammar, Precedence, RuleIdx, TermIdx};

use crate::{Firsts, RuleIndex};

/// One LR(1) item: a rule, a dot position, a single lookahead term, and the precedence stack
/// accumulated on the way here. Two items are *core-equal* when they agree on `(rule, dot)`
/// alone.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Pos {
    pub rule: RuleIdx,
    pub dot: u32,
    pub ahead: TermIdx,
    pub prec: Vec<Precedence>,
}

impl Pos {
    pub fn new(rule: RuleIdx, dot: u32, ahead: TermIdx, prec: Vec<Precedence>) -> Self {
        Pos {
            rule,
            dot,
            ahead,
            prec,
        }
    }

    /// The symbol after the dot, or `None` at the end of the rule.
    pub fn next_sym(&self, g: &NormalGrammar) -> Option<TermIdx> {
        g.rules[usize::from(self.rule)]
            .parts
            .get(self.dot as usize)
            .copied()
    }

    pub fn pp(&self, g: &NormalGrammar) -> String {
        format!(
            "{}, {}",
            g.rules[usize::from(self.rule)].pp_item(&g.terms, self.dot as usize),
            g.terms.name(self.ahead)
        )
    }
}

/// Merge `extra` into `base`, deduplicating. The order of `base` is preserved so closure
/// inheritance stays deterministic.
fn merge_prec(base: &[Precedence], extra: &[Precedence]) -> Vec<Precedence> {
    let mut out = base.to_vec();
    for p in extra {
        if !out.contains(p) {
            out.push(p.clone());
        }
    }
    out
}

/// Close a kernel: for every item `[A -> α · B β, a]` with `B` a non-terminal, add
/// `[B -> · γ, b]` for every production of `B` and every `b ∈ FIRST(β a)`, inheriting the
/// precedence attached to `B`'s position in `A`. The result is sorted canonically.
pub fn closure(
    g: &NormalGrammar,
    idx: &RuleIndex,
    firsts: &Firsts,
    kernel: Vec<Pos>,
) -> Vec<Pos> {
    let mut items = kernel;
    let mut seen: FnvHashSet<Pos> = items.iter().cloned().collect();
    let mut i = 0;
    while i < items.len() {
        let item = items[i].clone();
        let rule = &g.rules[usize::from(item.rule)];
        if let Some(b) = rule.parts.get(item.dot as usize).copied() {
            if !g.terms.is_terminal(b) {
                let suffix = &rule.parts[item.dot as usize + 1..];
                let lookaheads = firsts.first_of_seq(suffix, item.ahead);
                let child_prec = merge_prec(
                    &item.prec,
                    &rule.conflicts[item.dot as usize].entries(),
                );
                for &prod in idx.prods(b) {
                    for &la in &lookaheads {
                        let child = Pos::new(prod, 0, la, child_prec.clone());
                        if seen.insert(child.clone()) {
                            items.push(child);
                        }
                    }
                }
            }
        }
        i += 1;
    }
    items.sort_unstable();
    items
}

/// The kernel reached by advancing the dot over `sym` in every item that has `sym` next.
pub fn goto(g: &NormalGrammar, items: &[Pos], sym: TermIdx) -> Vec<Pos> {
    let mut out = Vec::new();
    for item in items {
        if item.next_sym(g) == Some(sym) {
            out.push(Pos::new(
                item.rule,
                item.dot + 1,
                item.ahead,
                item.prec.clone(),
            ));
        }
    }
    out.sort_unstable();
    out.dedup();
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use cstgrammar::{normalize::normalize, parser::GrammarParser};

    fn setup(src: &str) -> (NormalGrammar, RuleIndex) {
        let ast = GrammarParser::new(src).parse().unwrap();
        let g = normalize(&ast, &mut |_| ()).unwrap();
        let idx = RuleIndex::new(&g);
        (g, idx)
    }

    fn start_kernel(g: &NormalGrammar, idx: &RuleIndex) -> Vec<Pos> {
        idx.prods(g.top_term)
            .iter()
            .map(|&r| Pos::new(r, 0, g.terms.eof_idx(), Vec::new()))
            .collect()
    }

    fn item_exists(g: &NormalGrammar, items: &[Pos], lhs: &str, prod_off: usize, dot: u32, la: &[&str]) {
        let lhs_t = g.terms.lookup(lhs).unwrap_or_else(|| {
            if lhs == "%top" {
                g.top_term
            } else {
                panic!("no term {}", lhs)
            }
        });
        let prods: Vec<usize> = g
            .rules
            .iter()
            .enumerate()
            .filter(|(_, r)| r.lhs == lhs_t)
            .map(|(i, _)| i)
            .collect();
        let rule = RuleIdx::from(prods[prod_off]);
        for t in g.terms.iter_idxs() {
            let present = items
                .iter()
                .any(|p| p.rule == rule && p.dot == dot && p.ahead == t);
            let expected = la.iter().any(|n| {
                if *n == "$" {
                    t == g.terms.eof_idx()
                } else {
                    g.terms.name(t) == *n
                }
            });
            assert_eq!(
                present,
                expected,
                "lookahead {} for {} prod {} dot {}",
                g.terms.name(t),
                lhs,
                prod_off,
                dot
            );
        }
    }

    // The "dragon book" grammar via http://binarysculpting.com/2012/02/04/computing-lr1-closure
    //   S: L = R | R;  L: * R | id;  R: L;
    #[test]
    fn dragon_closure() {
        let (g, idx) = setup(
            "@top { S } \
             S = s { L \"=\" R | R } \
             L = l { \"*\" R | \"id\" } \
             R = r { L }",
        );
        let firsts = Firsts::new(&g, &idx);
        let cls = closure(&g, &idx, &firsts, start_kernel(&g, &idx));
        item_exists(&g, &cls, "%top", 0, 0, &["$"]);
        item_exists(&g, &cls, "S", 0, 0, &["$"]);
        item_exists(&g, &cls, "S", 1, 0, &["$"]);
        item_exists(&g, &cls, "L", 0, 0, &["$", "="]);
        item_exists(&g, &cls, "L", 1, 0, &["$", "="]);
        item_exists(&g, &cls, "R", 0, 0, &["$"]);
    }

    #[test]
    fn goto_advances_dot() {
        let (g, idx) = setup(
            "@top { S } \
             S = s { S \"b\" | \"b\" A \"a\" } \
             A = a { \"a\" S \"c\" | \"a\" | \"a\" S \"b\" }",
        );
        let firsts = Firsts::new(&g, &idx);
        let cls = closure(&g, &idx, &firsts, start_kernel(&g, &idx));
        let s = g.terms.lookup("S").unwrap();
        let after_s = closure(&g, &idx, &firsts, goto(&g, &cls, s));
        item_exists(&g, &after_s, "%top", 0, 1, &["$"]);
        item_exists(&g, &after_s, "S", 0, 1, &["$", "b"]);

        let b = g.terms.lookup("b").unwrap();
        let after_b = closure(&g, &idx, &firsts, goto(&g, &cls, b));
        item_exists(&g, &after_b, "S", 1, 1, &["$", "b"]);
        let a_tok = g.terms.lookup("a").unwrap();
        let after_ba = closure(&g, &idx, &firsts, goto(&g, &after_b, a_tok));
        item_exists(&g, &after_ba, "A", 1, 1, &["a"]);
        item_exists(&g, &after_ba, "A", 2, 1, &["a"]);
    }

    #[test]
    fn closure_inherits_position_precedence() {
        let (g, idx) = setup(
            "@precedence { p @left } \
             @top { E } \
             E = e { !p E \"+\" E | \"x\" }",
        );
        let firsts = Firsts::new(&g, &idx);
        let cls = closure(&g, &idx, &firsts, start_kernel(&g, &idx));
        // Closing over E at a marked position hands the marker down to the child items.
        let marked: Vec<&Pos> = cls.iter().filter(|p| !p.prec.is_empty()).collect();
        assert!(!marked.is_empty());
        assert!(marked.iter().all(|p| p.prec[0].group == "%0"));
        // The unmarked alternative's kernel-level items stay clean.
        assert!(cls.iter().any(|p| p.prec.is_empty()));
    }
}
