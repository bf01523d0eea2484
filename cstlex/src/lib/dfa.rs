//! Subset construction and the passes that run over the resulting DFA: state unification,
//! token-conflict detection, and the flat `u16` encoding embedded in the emitted artifact.

use fnv::FnvHashMap;
use indexmap::IndexSet;

use cstgrammar::{TermIdx, TermSet};

use crate::{nfa::Nfa, DfaIdx, LexBuildError, LexBuildResult, LexErrorKind, NfaIdx};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DfaState {
    pub nfa_states: Vec<NfaIdx>,
    /// Deterministic, disjoint, sorted edges over UTF-16 code units.
    pub edges: Vec<(u16, u16, DfaIdx)>,
    /// Accepted terms, highest token precedence first.
    pub accept: Vec<TermIdx>,
}

#[derive(Clone, Debug)]
pub struct Dfa {
    /// State 0 is the start state.
    pub states: Vec<DfaState>,
}

impl Dfa {
    /// Run the automaton over `input`, longest-match. Returns the number of UTF-16 code units
    /// consumed and the winning term.
    pub fn run(&self, input: &str) -> Option<(usize, TermIdx)> {
        let mut cur = 0usize;
        let mut consumed = 0usize;
        let mut last: Option<(usize, TermIdx)> = None;
        if let Some(&t) = self.states[0].accept.first() {
            last = Some((0, t));
        }
        for u in input.encode_utf16() {
            let mut next = None;
            for &(lo, hi, tgt) in &self.states[cur].edges {
                if u >= lo && u <= hi {
                    next = Some(tgt);
                    break;
                }
            }
            match next {
                Some(tgt) => {
                    cur = usize::from(tgt);
                    consumed += 1;
                    if let Some(&t) = self.states[cur].accept.first() {
                        last = Some((consumed, t));
                    }
                }
                None => break,
            }
        }
        last
    }
}

/// Compute a linear priority rank for every token named in the `@precedence` lists. The lists
/// form a DAG (earlier entries take priority); a topological sort linearizes it, and a cycle is
/// a fatal error.
pub fn precedence_ranks(
    lists: &[Vec<TermIdx>],
    terms: &TermSet,
) -> LexBuildResult<FnvHashMap<TermIdx, usize>> {
    let mut nodes: IndexSet<TermIdx> = IndexSet::new();
    for list in lists {
        for &t in list {
            nodes.insert(t);
        }
    }
    let mut succs: FnvHashMap<TermIdx, Vec<TermIdx>> = FnvHashMap::default();
    let mut indeg: FnvHashMap<TermIdx, usize> = FnvHashMap::default();
    for &t in &nodes {
        indeg.insert(t, 0);
    }
    for list in lists {
        for w in list.windows(2) {
            let (a, b) = (w[0], w[1]);
            let s = succs.entry(a).or_default();
            if !s.contains(&b) {
                s.push(b);
                *indeg.get_mut(&b).unwrap() += 1;
            }
        }
    }
    let mut ranks = FnvHashMap::default();
    let mut remaining: Vec<TermIdx> = nodes.iter().copied().collect();
    while !remaining.is_empty() {
        let pos = remaining.iter().position(|t| indeg[t] == 0);
        let pos = match pos {
            Some(p) => p,
            None => {
                return Err(LexBuildError {
                    kind: LexErrorKind::CyclicTokenPrecedence(
                        terms.name(remaining[0]).to_string(),
                    ),
                    spans: vec![cstgrammar::Span::new(0, 0)],
                })
            }
        };
        let t = remaining.remove(pos);
        ranks.insert(t, ranks.len());
        if let Some(ss) = succs.get(&t) {
            for s in ss.clone() {
                *indeg.get_mut(&s).unwrap() -= 1;
            }
        }
    }
    Ok(ranks)
}

fn eps_closure(nfa: &Nfa, set: &mut Vec<NfaIdx>) {
    let mut i = 0;
    while i < set.len() {
        let n = set[i];
        for &e in &nfa.node(n).eps {
            if !set.contains(&e) {
                set.push(e);
            }
        }
        i += 1;
    }
    set.sort_unstable();
    set.dedup();
}

/// Standard subset construction. The accepting set of each DFA state is the union of the
/// accepted terms of its NFA members, ordered by token precedence.
pub fn determinize(nfa: &Nfa, ranks: &FnvHashMap<TermIdx, usize>) -> Dfa {
    let mut start = vec![nfa.start];
    eps_closure(nfa, &mut start);
    let mut states: Vec<DfaState> = Vec::new();
    let mut map: FnvHashMap<Vec<NfaIdx>, DfaIdx> = FnvHashMap::default();

    let accept_of = |set: &[NfaIdx]| -> Vec<TermIdx> {
        let mut acc: Vec<TermIdx> = Vec::new();
        for &n in set {
            for &t in &nfa.node(n).accept {
                if !acc.contains(&t) {
                    acc.push(t);
                }
            }
        }
        acc.sort_by_key(|t| (*ranks.get(t).unwrap_or(&usize::MAX), t.as_u32()));
        acc
    };

    map.insert(start.clone(), DfaIdx(0));
    states.push(DfaState {
        accept: accept_of(&start),
        nfa_states: start,
        edges: Vec::new(),
    });

    let mut i = 0;
    while i < states.len() {
        let members = states[i].nfa_states.clone();
        let mut points: Vec<u32> = Vec::new();
        for &m in &members {
            for &(lo, hi, _) in &nfa.node(m).edges {
                points.push(lo as u32);
                points.push(hi as u32 + 1);
            }
        }
        points.sort_unstable();
        points.dedup();
        let mut edges: Vec<(u16, u16, DfaIdx)> = Vec::new();
        for w in points.windows(2) {
            let lo = w[0];
            let hi = w[1] - 1;
            let mut target: Vec<NfaIdx> = Vec::new();
            for &m in &members {
                for &(elo, ehi, to) in &nfa.node(m).edges {
                    if (elo as u32) <= lo && lo <= ehi as u32 && !target.contains(&to) {
                        target.push(to);
                    }
                }
            }
            if target.is_empty() {
                continue;
            }
            eps_closure(nfa, &mut target);
            let next = match map.get(&target) {
                Some(&d) => d,
                None => {
                    let d = DfaIdx::from(states.len());
                    map.insert(target.clone(), d);
                    states.push(DfaState {
                        accept: accept_of(&target),
                        nfa_states: target,
                        edges: Vec::new(),
                    });
                    d
                }
            };
            // Coalesce with the previous edge when contiguous and same-target.
            match edges.last_mut() {
                Some(last) if last.2 == next && last.1 as u32 + 1 == lo => last.1 = hi as u16,
                _ => edges.push((lo as u16, hi as u16, next)),
            }
        }
        states[i].edges = edges;
        i += 1;
    }
    Dfa { states }
}

/// Unify states with identical accepting lists and identical outgoing edges, left to right,
/// until a pass changes nothing.
pub fn minimize(dfa: &Dfa) -> Dfa {
    let mut states = dfa.states.clone();
    loop {
        let mut sig: FnvHashMap<(Vec<TermIdx>, Vec<(u16, u16, DfaIdx)>), DfaIdx> =
            FnvHashMap::default();
        let mut remap: Vec<DfaIdx> = (0..states.len()).map(DfaIdx::from).collect();
        let mut changed = false;
        for (i, st) in states.iter().enumerate() {
            let key = (st.accept.clone(), st.edges.clone());
            match sig.get(&key) {
                Some(&rep) => {
                    remap[i] = rep;
                    changed = true;
                }
                None => {
                    sig.insert(key, DfaIdx::from(i));
                }
            }
        }
        if !changed {
            return Dfa { states };
        }
        // Renumber surviving states and retarget edges.
        let mut new_idx: Vec<Option<DfaIdx>> = vec![None; states.len()];
        let mut kept: Vec<DfaState> = Vec::new();
        for (i, st) in states.iter().enumerate() {
            if usize::from(remap[i]) == i {
                new_idx[i] = Some(DfaIdx::from(kept.len()));
                kept.push(st.clone());
            }
        }
        for st in &mut kept {
            for e in &mut st.edges {
                e.2 = new_idx[usize::from(remap[usize::from(e.2)])].unwrap();
            }
        }
        states = kept;
    }
}

/// Pairs of tokens accepted by a common DFA state where neither takes precedence over the
/// other. Only tokens given a position in the precedence order are separable.
pub fn conflicts(dfa: &Dfa, ranks: &FnvHashMap<TermIdx, usize>) -> Vec<(TermIdx, TermIdx)> {
    let mut out: Vec<(TermIdx, TermIdx)> = Vec::new();
    for st in &dfa.states {
        for (i, &a) in st.accept.iter().enumerate() {
            for &b in &st.accept[i + 1..] {
                let separable = ranks.contains_key(&a) && ranks.contains_key(&b);
                if !separable {
                    let pair = if a < b { (a, b) } else { (b, a) };
                    if !out.contains(&pair) {
                        out.push(pair);
                    }
                }
            }
        }
    }
    out
}

/// Flat `u16` encoding of a DFA:
/// `[nstates, state_offset*, blobs...]` where each state blob is
/// `[accept_len, accept_term*, edge_count, (lo, hi, target_state)*]`.
pub fn encode(dfa: &Dfa) -> Vec<u16> {
    let n = dfa.states.len();
    let mut out = vec![0u16; 1 + n];
    out[0] = n as u16;
    for (i, st) in dfa.states.iter().enumerate() {
        out[1 + i] = out.len() as u16;
        out.push(st.accept.len() as u16);
        for &t in &st.accept {
            out.push(t.as_u32() as u16);
        }
        out.push(st.edges.len() as u16);
        for &(lo, hi, tgt) in &st.edges {
            out.push(lo);
            out.push(hi);
            out.push(usize::from(tgt) as u16);
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nfa::NfaBuilder;
    use cstgrammar::{ast::Expr, Span, TermSet, TERMINAL};
    use indexmap::IndexMap;

    fn lit(s: &str) -> Expr {
        Expr::Literal {
            value: s.to_string(),
            span: Span::new(0, 0),
        }
    }

    fn set(ranges: Vec<(u32, u32)>) -> Expr {
        Expr::Set {
            ranges,
            span: Span::new(0, 0),
        }
    }

    fn plus(e: Expr) -> Expr {
        Expr::Repeat {
            expr: Box::new(e),
            kind: cstgrammar::ast::RepeatKind::OneOrMore,
            span: Span::new(0, 0),
        }
    }

    fn dfa_for(roots: &[(TermIdx, &Expr)], ranks: &FnvHashMap<TermIdx, usize>) -> Dfa {
        let rules = IndexMap::new();
        let mut b = NfaBuilder::new(&rules);
        let nfa = b.build(roots).unwrap();
        minimize(&determinize(&nfa, ranks))
    }

    #[test]
    fn longest_match() {
        let a = lit("ab");
        let b = lit("abcd");
        let dfa = dfa_for(
            &[(TermIdx(1), &a), (TermIdx(2), &b)],
            &FnvHashMap::default(),
        );
        assert_eq!(dfa.run("ab"), Some((2, TermIdx(1))));
        assert_eq!(dfa.run("abcd"), Some((4, TermIdx(2))));
        assert_eq!(dfa.run("abc"), Some((2, TermIdx(1))));
        assert_eq!(dfa.run("x"), None);
    }

    #[test]
    fn astral_charset() {
        // [^\u0000-\u007f]: everything from 0x80 up, less surrogates.
        let e = set(vec![(0x80, 0x10FFFF)]);
        let dfa = dfa_for(&[(TermIdx(1), &e)], &FnvHashMap::default());
        assert_eq!(dfa.run("\u{20AC}"), Some((1, TermIdx(1))));
        // An astral char costs two code units (a surrogate pair).
        assert_eq!(dfa.run("\u{1F600}"), Some((2, TermIdx(1))));
        assert_eq!(dfa.run("\u{10FFFF}"), Some((2, TermIdx(1))));
        assert_eq!(dfa.run("a"), None);
    }

    #[test]
    fn overlap_is_conflict_without_precedence() {
        let id = plus(set(vec![(0x61, 0x7A)]));
        let kw = lit("if");
        let rules = IndexMap::new();
        let mut b = NfaBuilder::new(&rules);
        let nfa = b.build(&[(TermIdx(1), &id), (TermIdx(2), &kw)]).unwrap();
        let ranks = FnvHashMap::default();
        let dfa = determinize(&nfa, &ranks);
        let cs = conflicts(&dfa, &ranks);
        assert_eq!(cs, vec![(TermIdx(1), TermIdx(2))]);
    }

    #[test]
    fn precedence_separates_overlap() {
        let id = plus(set(vec![(0x61, 0x7A)]));
        let kw = lit("if");
        let rules = IndexMap::new();
        let mut b = NfaBuilder::new(&rules);
        let nfa = b.build(&[(TermIdx(1), &id), (TermIdx(2), &kw)]).unwrap();
        let mut ranks = FnvHashMap::default();
        ranks.insert(TermIdx(2), 0);
        ranks.insert(TermIdx(1), 1);
        let dfa = determinize(&nfa, &ranks);
        assert!(conflicts(&dfa, &ranks).is_empty());
        // And the accepting list puts the keyword first.
        assert_eq!(dfa.run("if"), Some((2, TermIdx(2))));
    }

    #[test]
    fn minimization_merges_equal_tails() {
        let a = lit("xa");
        let b = lit("ya");
        let rules = IndexMap::new();
        let mut builder = NfaBuilder::new(&rules);
        let nfa = builder
            .build(&[(TermIdx(1), &a), (TermIdx(1), &b)])
            .unwrap();
        let ranks = FnvHashMap::default();
        let full = determinize(&nfa, &ranks);
        let min = minimize(&full);
        assert!(min.states.len() < full.states.len());
        assert_eq!(min.run("xa"), Some((2, TermIdx(1))));
        assert_eq!(min.run("ya"), Some((2, TermIdx(1))));
    }

    #[test]
    fn rank_topology() {
        let mut terms = TermSet::new();
        let a = terms.intern("a", TERMINAL);
        let b = terms.intern("b", TERMINAL);
        let c = terms.intern("c", TERMINAL);
        let ranks = precedence_ranks(&[vec![a, b], vec![b, c]], &terms).unwrap();
        assert!(ranks[&a] < ranks[&b]);
        assert!(ranks[&b] < ranks[&c]);
    }

    #[test]
    fn rank_cycle_fatal() {
        let mut terms = TermSet::new();
        let a = terms.intern("a", TERMINAL);
        let b = terms.intern("b", TERMINAL);
        match precedence_ranks(&[vec![a, b], vec![b, a]], &terms) {
            Err(LexBuildError {
                kind: LexErrorKind::CyclicTokenPrecedence(_),
                ..
            }) => (),
            r => panic!("unexpected result {:?}", r),
        }
    }

    #[test]
    fn encode_roundtrippable_shape() {
        let a = lit("ab");
        let dfa = dfa_for(&[(TermIdx(3), &a)], &FnvHashMap::default());
        let enc = encode(&dfa);
        let n = enc[0] as usize;
        assert_eq!(n, dfa.states.len());
        let off = enc[1] as usize;
        // Start state: no accepts, one edge.
        assert_eq!(enc[off], 0);
        assert_eq!(enc[off + 1], 1);
        assert_eq!(enc[off + 2], b'a' as u16);
    }

    #[test]
    fn deterministic_construction() {
        let id = plus(set(vec![(0x61, 0x7A)]));
        let kw = lit("while");
        let ranks = FnvHashMap::default();
        let d1 = dfa_for(&[(TermIdx(1), &id), (TermIdx(2), &kw)], &ranks);
        let d2 = dfa_for(&[(TermIdx(1), &id), (TermIdx(2), &kw)], &ranks);
        assert_eq!(encode(&d1), encode(&d2));
    }
}
