//! Canonical LR(1) state exploration and action assignment. Conflicts are resolved through the
//! precedence ladder; anything left is a fatal error carrying the offending item's textual
//! form.

use fnv::FnvHashMap;
use indexmap::IndexSet;

use cstgrammar::{normalize::NormalGrammar, Precedence, Assoc, RuleIdx, SkipIdx, TermIdx, ERROR};

use crate::{
    itemset::{closure, goto, Pos},
    Firsts, GrpIdx, RuleIndex, StIdx, TableError, TableErrorKind,
};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Action {
    Shift(StIdx),
    Reduce(RuleIdx),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ActionEntry {
    pub term: TermIdx,
    pub action: Action,
    pub prec: Vec<Precedence>,
}

#[derive(Clone, Debug)]
pub struct State {
    pub items: Vec<Pos>,
    /// Raw transitions in discovery order, before being split into actions and gotos.
    pub edges: Vec<(TermIdx, StIdx)>,
    pub actions: Vec<ActionEntry>,
    pub gotos: Vec<(TermIdx, StIdx)>,
    /// Shift transitions on error-flagged terms, used for recovery.
    pub recover: Vec<(TermIdx, StIdx)>,
    pub ambiguous: bool,
    pub skip: SkipIdx,
    pub part_of_skip: bool,
    pub token_group: Option<GrpIdx>,
}

#[derive(Debug)]
pub struct StateGraph {
    pub states: Vec<State>,
    pub start: StIdx,
    /// For each skip scope: the root state of its compound construct, if it has one.
    pub skip_starts: Vec<Option<StIdx>>,
}

impl StateGraph {
    pub fn state(&self, st: StIdx) -> &State {
        &self.states[usize::from(st)]
    }

    /// Return the state reached from `st` over `sym`, or `None`.
    pub fn edge(&self, st: StIdx, sym: TermIdx) -> Option<StIdx> {
        self.state(st)
            .edges
            .iter()
            .find(|(s, _)| *s == sym)
            .map(|(_, t)| *t)
    }

    pub fn action(&self, st: StIdx, term: TermIdx) -> Option<Action> {
        self.state(st)
            .actions
            .iter()
            .find(|e| e.term == term)
            .map(|e| e.action)
    }

    /// Pretty-print all states with their items, lookaheads and edges.
    pub fn pp(&self, g: &NormalGrammar) -> String {
        let mut out = String::new();
        for (i, st) in self.states.iter().enumerate() {
            out.push_str(&format!("{}:", i));
            for item in &st.items {
                out.push_str(&format!(" [{}]", item.pp(g)));
            }
            out.push('\n');
            for (sym, target) in &st.edges {
                out.push_str(&format!("  {} -> {}\n", g.terms.name(*sym), usize::from(*target)));
            }
        }
        out
    }
}

pub(crate) enum AddOutcome {
    Ok,
    Conflict,
}

/// Strongest entry per precedence group, in first-appearance order.
fn strongest_by_group(prec: &[Precedence]) -> Vec<&Precedence> {
    let mut out: Vec<&Precedence> = Vec::new();
    for p in prec {
        match out.iter_mut().find(|q| q.group == p.group) {
            Some(q) => {
                if p.cut && !q.cut || (p.cut == q.cut && p.level > q.level) {
                    *q = p;
                }
            }
            None => out.push(p),
        }
    }
    out
}

/// Add an action for `term`, resolving against any existing entry:
///
/// 1. An identical action is a no-op (precedence contexts are merged).
/// 2. Otherwise the state is marked ambiguous and the new entry's precedence stack is paired
///    with the existing one by shared group. A negative level accepts the conflict silently
///    (keeping the existing action); a cut marker wins outright; otherwise the higher level
///    wins, and equal levels fall back to associativity (left prefers the reduce, right the
///    shift, none is a genuine conflict).
/// 3. With no shared group the conflict is genuine: the caller reports it or aborts a merge.
pub(crate) fn add_action(
    actions: &mut Vec<ActionEntry>,
    ambiguous: &mut bool,
    term: TermIdx,
    action: Action,
    prec: &[Precedence],
) -> AddOutcome {
    let existing = match actions.iter_mut().find(|e| e.term == term) {
        None => {
            actions.push(ActionEntry {
                term,
                action,
                prec: prec.to_vec(),
            });
            return AddOutcome::Ok;
        }
        Some(e) => e,
    };
    if existing.action == action {
        for p in prec {
            if !existing.prec.contains(p) {
                existing.prec.push(p.clone());
            }
        }
        return AddOutcome::Ok;
    }
    *ambiguous = true;
    let news = strongest_by_group(prec);
    for np in news {
        let op = match existing.prec.iter().find(|q| q.group == np.group) {
            Some(_) => {
                let all = strongest_by_group(&existing.prec);
                all.into_iter().find(|q| q.group == np.group).unwrap().clone()
            }
            None => continue,
        };
        if np.level < 0 || op.level < 0 {
            // An intentional, silenced conflict: keep the existing action.
            return AddOutcome::Ok;
        }
        if np.cut != op.cut {
            if np.cut {
                existing.action = action;
                existing.prec = prec.to_vec();
            }
            return AddOutcome::Ok;
        }
        if np.level > op.level {
            existing.action = action;
            existing.prec = prec.to_vec();
            return AddOutcome::Ok;
        }
        if np.level < op.level {
            return AddOutcome::Ok;
        }
        let assoc = if np.assoc != Assoc::None {
            np.assoc
        } else {
            op.assoc
        };
        match assoc {
            Assoc::Left => {
                if matches!(action, Action::Reduce(_)) {
                    existing.action = action;
                    existing.prec = prec.to_vec();
                }
                return AddOutcome::Ok;
            }
            Assoc::Right => {
                if matches!(action, Action::Shift(_)) {
                    existing.action = action;
                    existing.prec = prec.to_vec();
                }
                return AddOutcome::Ok;
            }
            Assoc::None => return AddOutcome::Conflict,
        }
    }
    AddOutcome::Conflict
}

fn merged_entries(item_prec: &[Precedence], extra: Vec<Precedence>) -> Vec<Precedence> {
    let mut out = item_prec.to_vec();
    for p in extra {
        if !out.contains(&p) {
            out.push(p);
        }
    }
    out
}

/// Explore the canonical LR(1) automaton from the top rule (and every compound skip rule) and
/// assign shift/reduce actions, resolving conflicts through precedence.
pub fn build_stategraph(
    g: &NormalGrammar,
    idx: &RuleIndex,
    firsts: &Firsts,
) -> Result<StateGraph, TableError> {
    let mut states: Vec<State> = Vec::new();
    let mut map: FnvHashMap<Vec<Pos>, StIdx> = FnvHashMap::default();

    let add_state =
        |states: &mut Vec<State>, map: &mut FnvHashMap<Vec<Pos>, StIdx>, items: Vec<Pos>, skip: SkipIdx, part_of_skip: bool| -> StIdx {
            if let Some(&st) = map.get(&items) {
                return st;
            }
            let st = StIdx::from(states.len());
            map.insert(items.clone(), st);
            states.push(State {
                items,
                edges: Vec::new(),
                actions: Vec::new(),
                gotos: Vec::new(),
                recover: Vec::new(),
                ambiguous: false,
                skip,
                part_of_skip,
                token_group: None,
            });
            st
        };

    let eof = g.terms.eof_idx();
    let start_kernel: Vec<Pos> = idx
        .prods(g.top_term)
        .iter()
        .map(|&r| Pos::new(r, 0, eof, Vec::new()))
        .collect();
    let start_items = closure(g, idx, firsts, start_kernel);
    let start = add_state(&mut states, &mut map, start_items, SkipIdx(0), false);

    let mut skip_starts: Vec<Option<StIdx>> = Vec::new();
    for (si, scope) in g.skips.iter().enumerate() {
        match scope.rule {
            Some(root) => {
                let kernel: Vec<Pos> = idx
                    .prods(root)
                    .iter()
                    .map(|&r| Pos::new(r, 0, eof, Vec::new()))
                    .collect();
                let items = closure(g, idx, firsts, kernel);
                let st = add_state(&mut states, &mut map, items, SkipIdx(si as u32), true);
                skip_starts.push(Some(st));
            }
            None => skip_starts.push(None),
        }
    }

    // Exploration. States created while iterating are appended, so a plain cursor walks
    // everything in discovery order.
    let mut i = 0;
    while i < states.len() {
        let items = states[i].items.clone();
        let (skip, part_of_skip) = (states[i].skip, states[i].part_of_skip);
        let mut syms: IndexSet<TermIdx> = IndexSet::new();
        for item in &items {
            if let Some(s) = item.next_sym(g) {
                syms.insert(s);
            }
        }
        for sym in syms {
            let kernel = goto(g, &items, sym);
            let closed = closure(g, idx, firsts, kernel);
            let target_skip = closed
                .first()
                .map(|p| g.rules[usize::from(p.rule)].skip)
                .unwrap_or(skip);
            let target = add_state(&mut states, &mut map, closed, target_skip, part_of_skip);
            states[i].edges.push((sym, target));
        }
        i += 1;
    }

    // Action assignment: reduces first, then shifts, mirroring the order conflicts are
    // classically reported in.
    for i in 0..states.len() {
        let items = states[i].items.clone();
        let edges = states[i].edges.clone();
        let mut actions = std::mem::take(&mut states[i].actions);
        let mut ambiguous = states[i].ambiguous;

        for item in &items {
            let rule = &g.rules[usize::from(item.rule)];
            if (item.dot as usize) < rule.parts.len() {
                continue;
            }
            let prec = merged_entries(&item.prec, rule.aggregate_conflicts().entries());
            match add_action(
                &mut actions,
                &mut ambiguous,
                item.ahead,
                Action::Reduce(item.rule),
                &prec,
            ) {
                AddOutcome::Ok => (),
                AddOutcome::Conflict => {
                    let existing = actions.iter().find(|e| e.term == item.ahead).unwrap();
                    let kind = match existing.action {
                        Action::Reduce(other) => TableErrorKind::ReduceReduceConflict {
                            item: g.rules[usize::from(other)]
                                .pp_item(&g.terms, g.rules[usize::from(other)].parts.len()),
                            other: item.pp(g),
                            lookahead: g.terms.name(item.ahead).to_string(),
                        },
                        Action::Shift(_) => TableErrorKind::ShiftReduceConflict {
                            item: item.pp(g),
                            lookahead: g.terms.name(item.ahead).to_string(),
                        },
                    };
                    return Err(TableError { kind });
                }
            }
        }

        let mut gotos = Vec::new();
        let mut recover = Vec::new();
        for (sym, target) in edges {
            if !g.terms.is_terminal(sym) {
                gotos.push((sym, target));
                continue;
            }
            if g.terms.get(sym).flags & ERROR != 0 {
                recover.push((sym, target));
                continue;
            }
            let mut prec: Vec<Precedence> = Vec::new();
            for item in &items {
                if item.next_sym(g) == Some(sym) {
                    let rule = &g.rules[usize::from(item.rule)];
                    for p in merged_entries(
                        &item.prec,
                        rule.conflicts[item.dot as usize + 1].entries(),
                    ) {
                        if !prec.contains(&p) {
                            prec.push(p);
                        }
                    }
                }
            }
            match add_action(
                &mut actions,
                &mut ambiguous,
                sym,
                Action::Shift(target),
                &prec,
            ) {
                AddOutcome::Ok => (),
                AddOutcome::Conflict => {
                    let reduce_item = items
                        .iter()
                        .find(|p| {
                            p.ahead == sym
                                && p.dot as usize == g.rules[usize::from(p.rule)].parts.len()
                        })
                        .unwrap();
                    return Err(TableError {
                        kind: TableErrorKind::ShiftReduceConflict {
                            item: reduce_item.pp(g),
                            lookahead: g.terms.name(sym).to_string(),
                        },
                    });
                }
            }
        }

        states[i].actions = actions;
        states[i].gotos = gotos;
        states[i].recover = recover;
        states[i].ambiguous = ambiguous;
    }

    Ok(StateGraph {
        states,
        start,
        skip_starts,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use cstgrammar::{normalize::normalize, parser::GrammarParser};

    pub(crate) fn graph(src: &str) -> (NormalGrammar, StateGraph) {
        let ast = GrammarParser::new(src).parse().unwrap();
        let g = normalize(&ast, &mut |_| ()).unwrap();
        let idx = RuleIndex::new(&g);
        let firsts = Firsts::new(&g, &idx);
        let sg = build_stategraph(&g, &idx, &firsts).unwrap();
        (g, sg)
    }

    fn graph_err(src: &str) -> TableError {
        let ast = GrammarParser::new(src).parse().unwrap();
        let g = normalize(&ast, &mut |_| ()).unwrap();
        let idx = RuleIndex::new(&g);
        let firsts = Firsts::new(&g, &idx);
        build_stategraph(&g, &idx, &firsts).unwrap_err()
    }

    const ARITH: &str = "@precedence { times @left, plus @left } \
                         @top { Expr } \
                         Expr = expr { Expr \"+\" !plus Expr | Expr \"*\" !times Expr | \"n\" }";

    #[test]
    fn arith_resolves_with_zero_conflicts() {
        let (g, sg) = graph(ARITH);
        let expr = g.terms.lookup("Expr").unwrap();
        let plus = g.terms.lookup("+").unwrap();
        let times = g.terms.lookup("*").unwrap();
        let eof = g.terms.eof_idx();

        let s1 = sg.edge(sg.start, expr).unwrap();
        let s_plus = sg.edge(s1, plus).unwrap();
        let s_times = sg.edge(s1, times).unwrap();
        let after_plus = sg.edge(s_plus, expr).unwrap();
        let after_times = sg.edge(s_times, expr).unwrap();

        // After `Expr + Expr`: `*` binds tighter (shift), `+` is left-associative (reduce).
        assert!(matches!(sg.action(after_plus, times), Some(Action::Shift(_))));
        assert!(matches!(sg.action(after_plus, plus), Some(Action::Reduce(_))));
        assert!(matches!(sg.action(after_plus, eof), Some(Action::Reduce(_))));
        // After `Expr * Expr`: both operators reduce.
        assert!(matches!(sg.action(after_times, times), Some(Action::Reduce(_))));
        assert!(matches!(sg.action(after_times, plus), Some(Action::Reduce(_))));
    }

    #[test]
    fn raising_precedence_never_adds_conflicts() {
        // Swapping the declaration order only flips which action wins; it cannot introduce a
        // conflict.
        let (g, sg) = graph(
            "@precedence { plus @left, times @left } \
             @top { Expr } \
             Expr = expr { Expr \"+\" !plus Expr | Expr \"*\" !times Expr | \"n\" }",
        );
        let expr = g.terms.lookup("Expr").unwrap();
        let plus = g.terms.lookup("+").unwrap();
        let times = g.terms.lookup("*").unwrap();
        let s1 = sg.edge(sg.start, expr).unwrap();
        let s_times = sg.edge(s1, times).unwrap();
        let after_times = sg.edge(s_times, expr).unwrap();
        // Now `+` binds tighter than `*`.
        assert!(matches!(sg.action(after_times, plus), Some(Action::Shift(_))));
        assert!(matches!(
            sg.action(after_times, times),
            Some(Action::Reduce(_))
        ));
    }

    #[test]
    fn inlined_grammar_keeps_the_language() {
        // `A { "a" }` is inlined into the top rule; the automaton still accepts exactly
        // `a x`.
        let (g, sg) = graph("@top { A \"x\" } A { \"a\" }");
        let a = g.terms.lookup("a").unwrap();
        let x = g.terms.lookup("x").unwrap();
        let eof = g.terms.eof_idx();
        let s1 = sg.edge(sg.start, a).unwrap();
        let s2 = sg.edge(s1, x).unwrap();
        assert!(matches!(sg.action(s2, eof), Some(Action::Reduce(_))));
        assert!(sg.edge(sg.start, x).is_none());
    }

    #[test]
    fn arith_without_markers_conflicts() {
        let err = graph_err(
            "@top { Expr } Expr = expr { Expr \"+\" Expr | \"n\" }",
        );
        match err.kind {
            TableErrorKind::ShiftReduceConflict { lookahead, .. } => {
                assert_eq!(lookahead, "+")
            }
            k => panic!("unexpected error {:?}", k),
        }
    }

    #[test]
    fn dangling_else_prefers_shift() {
        let (g, sg) = graph(
            "@precedence { else @right } \
             @top { Stmt } \
             Stmt = stmt { \"if\" Cond \"then\" Stmt \"else\" !else Stmt \
                         | \"if\" Cond \"then\" Stmt !else \
                         | \"s\" } \
             Cond = cond { \"c\" }",
        );
        // Walk to the state after `if Cond then Stmt`.
        let if_t = g.terms.lookup("if").unwrap();
        let then_t = g.terms.lookup("then").unwrap();
        let else_t = g.terms.lookup("else").unwrap();
        let cond = g.terms.lookup("Cond").unwrap();
        let stmt = g.terms.lookup("Stmt").unwrap();
        let s1 = sg.edge(sg.start, if_t).unwrap();
        let s2 = sg.edge(s1, cond).unwrap();
        let s3 = sg.edge(s2, then_t).unwrap();
        let s4 = sg.edge(s3, stmt).unwrap();
        assert!(matches!(sg.action(s4, else_t), Some(Action::Shift(_))));
        assert!(sg.state(s4).ambiguous);
    }

    #[test]
    fn reduce_reduce_reported() {
        let err = graph_err(
            "@top { A } A = a { B | C } \
             B = b { \"x\" \"y\" \"z\" } C = c { \"x\" \"y\" \"z\" }",
        );
        match err.kind {
            TableErrorKind::ReduceReduceConflict { lookahead, .. } => {
                assert_eq!(lookahead, "%eof")
            }
            k => panic!("unexpected error {:?}", k),
        }
    }

    #[test]
    fn ambiguity_marker_silences() {
        let (g, sg) = graph(
            "@top { A } A = a { B | C } \
             B = b { \"x\" \"y\" \"z\" ~amb } C = c { \"x\" \"y\" \"z\" ~amb }",
        );
        // The conflict state keeps a single action and is flagged ambiguous.
        let amb: Vec<&State> = sg.states.iter().filter(|s| s.ambiguous).collect();
        assert!(!amb.is_empty());
        let _ = g;
    }

    #[test]
    fn repeat_is_right_leaning() {
        let (g, sg) = graph("@top { Item* } Item = item { \"i\" }");
        let i_tok = g.terms.lookup("i").unwrap();
        let inner = g.terms.lookup("%inner").unwrap();
        // In the state reached by two inner repetitions, the next item shifts rather than
        // reducing: trees lean right.
        let s1 = sg.edge(sg.start, inner).unwrap();
        let s2 = sg.edge(s1, inner).unwrap();
        assert!(matches!(sg.action(s2, i_tok), Some(Action::Shift(_))));
        // And the whole build raised no conflict error, while the state is marked ambiguous
        // only through the silenced repeat resolution.
        assert!(sg
            .state(s2)
            .items
            .iter()
            .any(|p| p.dot as usize == g.rules[usize::from(p.rule)].parts.len()));
    }

    #[test]
    fn skip_rule_states_marked() {
        let (g, sg) = graph(
            "@top { \"a\" \"b\" \"c\" } \
             @skip { \" \" | Comment } \
             Comment = comment { \"//\" \"x\" \"y\" }",
        );
        assert_eq!(sg.skip_starts.len(), 1);
        let root = sg.skip_starts[0].unwrap();
        assert!(sg.state(root).part_of_skip);
        let _ = g;
    }

    #[test]
    fn recover_edges_split_out() {
        let (_, sg) = graph("@top { \"a\" \"b\" \"c\" }");
        for st in &sg.states {
            assert!(st.recover.is_empty());
        }
    }
}
