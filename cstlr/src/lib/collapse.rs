//! LALR-style collapse of the canonical LR(1) automaton: states sharing an item core are
//! merged, except where merging would manufacture a conflict that neither source state had. A
//! conflict discovered during a merge records the offending state pair as a witness and
//! restarts the partitioning with those states kept apart, so each restart strictly refines
//! the partitioning; the worst case returns the LR(1) automaton unchanged.

use fnv::{FnvHashMap, FnvHashSet};

use cstgrammar::{RuleIdx, TermIdx};

use crate::{
    itemset::Pos,
    stategraph::{add_action, Action, ActionEntry, AddOutcome, State, StateGraph},
    StIdx,
};

fn pair(a: usize, b: usize) -> (usize, usize) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

fn core_of(state: &State) -> Vec<(RuleIdx, u32)> {
    let mut core: Vec<(RuleIdx, u32)> = state.items.iter().map(|p| (p.rule, p.dot)).collect();
    core.sort_unstable();
    core.dedup();
    core
}

fn remap_action(a: Action, part_of: &[usize]) -> Action {
    match a {
        Action::Shift(t) => Action::Shift(StIdx::from(part_of[usize::from(t)])),
        Action::Reduce(r) => Action::Reduce(r),
    }
}

/// Collapse `sg`. The input graph is conflict-free (construction would have failed otherwise),
/// so any conflict that appears during a union is merge-induced and reverts that merge.
pub fn collapse(sg: &StateGraph) -> StateGraph {
    let n = sg.states.len();
    let mut witnesses: FnvHashSet<(usize, usize)> = FnvHashSet::default();

    'restart: loop {
        // Partition by core, keeping witness pairs apart. Scanning states in id order makes
        // partition ids follow exploration order.
        let mut partitions: Vec<Vec<usize>> = Vec::new();
        let mut part_of: Vec<usize> = vec![usize::MAX; n];
        let mut by_core: FnvHashMap<Vec<(RuleIdx, u32)>, Vec<usize>> = FnvHashMap::default();
        for s in 0..n {
            let core = core_of(&sg.states[s]);
            let pids = by_core.entry(core).or_default();
            let mut placed = false;
            for &pid in pids.iter() {
                if partitions[pid]
                    .iter()
                    .all(|&m| !witnesses.contains(&pair(m, s)))
                {
                    partitions[pid].push(s);
                    part_of[s] = pid;
                    placed = true;
                    break;
                }
            }
            if !placed {
                let pid = partitions.len();
                partitions.push(vec![s]);
                pids.push(pid);
                part_of[s] = pid;
            }
        }

        // Attempt the union partition by partition.
        let mut new_states: Vec<State> = Vec::with_capacity(partitions.len());
        for members in &partitions {
            let mut items: Vec<Pos> = Vec::new();
            for &m in members {
                items.extend(sg.states[m].items.iter().cloned());
            }
            items.sort_unstable();
            items.dedup();

            let mut actions: Vec<ActionEntry> = Vec::new();
            let mut contributor: FnvHashMap<TermIdx, usize> = FnvHashMap::default();
            let mut ambiguous = members.iter().any(|&m| sg.states[m].ambiguous);
            for &m in members {
                for e in &sg.states[m].actions {
                    let remapped = remap_action(e.action, &part_of);
                    match add_action(&mut actions, &mut ambiguous, e.term, remapped, &e.prec) {
                        AddOutcome::Ok => {
                            contributor.entry(e.term).or_insert(m);
                        }
                        AddOutcome::Conflict => {
                            let other = contributor.get(&e.term).copied().unwrap_or(members[0]);
                            witnesses.insert(pair(other, m));
                            continue 'restart;
                        }
                    }
                }
            }

            // Non-terminal transitions merge by term; diverging targets mean the successor
            // states were split by witnesses, so their predecessors must split too.
            let mut gotos: Vec<(TermIdx, StIdx)> = Vec::new();
            let mut goto_contributor: FnvHashMap<TermIdx, usize> = FnvHashMap::default();
            for &m in members {
                for &(t, target) in &sg.states[m].gotos {
                    let target = StIdx::from(part_of[usize::from(target)]);
                    match gotos.iter().find(|(gt, _)| *gt == t) {
                        Some(&(_, existing)) => {
                            if existing != target {
                                let other = goto_contributor[&t];
                                witnesses.insert(pair(other, m));
                                continue 'restart;
                            }
                        }
                        None => {
                            gotos.push((t, target));
                            goto_contributor.insert(t, m);
                        }
                    }
                }
            }

            let mut recover: Vec<(TermIdx, StIdx)> = Vec::new();
            for &m in members {
                for &(t, target) in &sg.states[m].recover {
                    let target = StIdx::from(part_of[usize::from(target)]);
                    if !recover.iter().any(|(rt, _)| *rt == t) {
                        recover.push((t, target));
                    }
                }
            }

            let mut edges: Vec<(TermIdx, StIdx)> = Vec::new();
            for &m in members {
                for &(t, target) in &sg.states[m].edges {
                    let target = StIdx::from(part_of[usize::from(target)]);
                    if !edges.iter().any(|(et, _)| *et == t) {
                        edges.push((t, target));
                    }
                }
            }

            let first = &sg.states[members[0]];
            new_states.push(State {
                items,
                edges,
                actions,
                gotos,
                recover,
                ambiguous,
                skip: first.skip,
                part_of_skip: members.iter().any(|&m| sg.states[m].part_of_skip),
                token_group: None,
            });
        }

        return StateGraph {
            states: new_states,
            start: StIdx::from(part_of[usize::from(sg.start)]),
            skip_starts: sg
                .skip_starts
                .iter()
                .map(|o| o.map(|s| StIdx::from(part_of[usize::from(s)])))
                .collect(),
        };
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{firsts::Firsts, stategraph::build_stategraph, RuleIndex};
    use cstgrammar::{normalize::normalize, parser::GrammarParser};

    fn graphs(src: &str) -> (cstgrammar::normalize::NormalGrammar, StateGraph, StateGraph) {
        let ast = GrammarParser::new(src).parse().unwrap();
        let g = normalize(&ast, &mut |_| ()).unwrap();
        let idx = RuleIndex::new(&g);
        let firsts = Firsts::new(&g, &idx);
        let sg = build_stategraph(&g, &idx, &firsts).unwrap();
        let collapsed = collapse(&sg);
        (g, sg, collapsed)
    }

    const ARITH: &str = "@precedence { times @left, plus @left } \
                         @top { Expr } \
                         Expr = expr { Expr \"+\" !plus Expr | Expr \"*\" !times Expr | \"n\" }";

    #[test]
    fn collapse_shrinks_lr1() {
        let (_, sg, collapsed) = graphs(ARITH);
        assert!(collapsed.states.len() < sg.states.len());
    }

    #[test]
    fn collapsed_actions_still_resolved() {
        let (g, _, sg) = graphs(ARITH);
        let expr = g.terms.lookup("Expr").unwrap();
        let plus = g.terms.lookup("+").unwrap();
        let times = g.terms.lookup("*").unwrap();
        let s1 = sg.edge(sg.start, expr).unwrap();
        let s_plus = sg.edge(s1, plus).unwrap();
        let after_plus = sg.edge(s_plus, expr).unwrap();
        assert!(matches!(
            sg.action(after_plus, times),
            Some(Action::Shift(_))
        ));
        assert!(matches!(
            sg.action(after_plus, plus),
            Some(Action::Reduce(_))
        ));
    }

    #[test]
    fn goto_targets_agree_after_collapse() {
        let (_, _, sg) = graphs(ARITH);
        for st in &sg.states {
            for &(t, target) in &st.gotos {
                assert!(usize::from(target) < sg.states.len());
                assert!(st.edges.iter().any(|&(et, _)| et == t));
            }
        }
    }

    // The classic LALR-inadequate grammar: merging the two `e` states by core would create a
    // reduce/reduce conflict, so the collapser must keep them apart.
    const INADEQUATE: &str = "@top { S } \
        S = s { \"a\" E \"c\" | \"a\" F \"d\" | \"b\" F \"c\" | \"b\" E \"d\" } \
        E = e1 { \"e\" } \
        F = f1 { \"e\" }";

    #[test]
    fn merge_reverted_on_conflict() {
        let (g, sg, collapsed) = graphs(INADEQUATE);
        let e = g.terms.lookup("E").unwrap();
        let count = |graph: &StateGraph| {
            graph
                .states
                .iter()
                .filter(|st| {
                    st.items.iter().any(|p| {
                        g.rules[usize::from(p.rule)].lhs == e
                            && p.dot as usize == g.rules[usize::from(p.rule)].parts.len()
                    })
                })
                .count()
        };
        // Both in the full automaton and after collapse, the two reduce-E states stay
        // distinct.
        assert_eq!(count(&sg), 2);
        assert_eq!(count(&collapsed), 2);
    }

    #[test]
    fn start_state_remapped() {
        let (_, _, collapsed) = graphs(ARITH);
        assert!(usize::from(collapsed.start) < collapsed.states.len());
        assert!(!collapsed.states[usize::from(collapsed.start)]
            .items
            .is_empty());
    }

    #[test]
    fn collapse_deterministic() {
        let (_, _, c1) = graphs(ARITH);
        let (g2, _, c2) = graphs(ARITH);
        assert_eq!(c1.states.len(), c2.states.len());
        assert_eq!(c1.pp(&g2), c2.pp(&g2));
    }
}
