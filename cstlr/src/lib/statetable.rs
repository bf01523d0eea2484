//! Packing of the collapsed automaton into flat 16-bit arrays with sub-array deduplication.
//!
//! Three tables come out:
//!
//!   * the state table: a fixed-size record per state (flags, action offset, recover offset,
//!     skip offset, tokenizer mask, default-reduce, forced-reduce);
//!   * the action data array: `(term, lo16, hi16)` triples terminated by an `End` sentinel,
//!     shared by action lists, recover lists and skip lists;
//!   * the goto table: an index cell per term followed by
//!     `(count<<1 | lastBit, target, sources...)` records.
//!
//! A shift action encodes the target state directly (its high half is zero); reduces carry
//! `ReduceFlag` plus the lhs term, optional `RepeatFlag`/`StayFlag`, and the pop depth.

use indexmap::IndexMap;

use cstgrammar::{normalize::NormalGrammar, RuleIdx, TermIdx, REPEATED};

use crate::{
    stategraph::{Action, StateGraph},
    TableError, TableErrorKind,
};

pub const REDUCE_FLAG: u32 = 1 << 16;
pub const REPEAT_FLAG: u32 = 1 << 17;
pub const STAY_FLAG: u32 = 1 << 18;
pub const REDUCE_DEPTH_SHIFT: u32 = 19;
pub const VALUE_MASK: u32 = 0xFFFF;

pub const END_SENTINEL: u16 = 0xFFFF;
pub const STATE_RECORD_SIZE: usize = 9;

pub const FLAG_AMBIGUOUS: u16 = 1;
pub const FLAG_SKIPPED: u16 = 2;
pub const FLAG_ACCEPTING: u16 = 4;

// Record cell offsets.
pub const REC_FLAGS: usize = 0;
pub const REC_ACTIONS: usize = 1;
pub const REC_RECOVER: usize = 2;
pub const REC_SKIP: usize = 3;
pub const REC_TOK_MASK: usize = 4;
pub const REC_DEFAULT_LO: usize = 5;
pub const REC_DEFAULT_HI: usize = 6;
pub const REC_FORCED_LO: usize = 7;
pub const REC_FORCED_HI: usize = 8;

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StateTable {
    pub states: Vec<u16>,
    pub data: Vec<u16>,
    pub goto: Vec<u16>,
    pub start: u16,
    /// Per skip scope: the offset of its packed skip actions in `data`.
    pub skip_offsets: Vec<u16>,
}

impl StateTable {
    pub fn states_len(&self) -> usize {
        self.states.len() / STATE_RECORD_SIZE
    }

    pub fn record(&self, st: usize) -> &[u16] {
        &self.states[st * STATE_RECORD_SIZE..(st + 1) * STATE_RECORD_SIZE]
    }

    /// Walk a state's action list: `(term, value)` pairs.
    pub fn actions_of(&self, st: usize) -> Vec<(u16, u32)> {
        let mut off = self.record(st)[REC_ACTIONS] as usize;
        let mut out = Vec::new();
        while self.data[off] != END_SENTINEL {
            let term = self.data[off];
            let v = self.data[off + 1] as u32 | ((self.data[off + 2] as u32) << 16);
            out.push((term, v));
            off += 3;
        }
        out
    }

    /// The action a state takes on `term`, falling back to the default reduce.
    pub fn lookup_action(&self, st: usize, term: u16) -> Option<u32> {
        for (t, v) in self.actions_of(st) {
            if t == term {
                return Some(v);
            }
        }
        let rec = self.record(st);
        let def = rec[REC_DEFAULT_LO] as u32 | ((rec[REC_DEFAULT_HI] as u32) << 16);
        if def != 0 {
            Some(def)
        } else {
            None
        }
    }

    /// Resolve the goto target for (`st`, non-terminal `term`), walking the records.
    pub fn goto_target(&self, st: u16, term: u16) -> Option<u16> {
        let mut off = self.goto[term as usize] as usize;
        if off == 0 {
            return None;
        }
        loop {
            let head = self.goto[off];
            let count = (head >> 1) as usize;
            let last = head & 1 != 0;
            let target = self.goto[off + 1];
            for i in 0..count {
                if self.goto[off + 2 + i] == st {
                    return Some(target);
                }
            }
            if last {
                return None;
            }
            off += 2 + count;
        }
    }
}

pub fn is_reduce(v: u32) -> bool {
    v & REDUCE_FLAG != 0
}

pub fn reduce_term(v: u32) -> u16 {
    (v & VALUE_MASK) as u16
}

pub fn reduce_depth(v: u32) -> u32 {
    v >> REDUCE_DEPTH_SHIFT
}

fn reduce_value(g: &NormalGrammar, rule: RuleIdx, depth: usize, stay: bool) -> u32 {
    let r = &g.rules[usize::from(rule)];
    let mut v = r.lhs.as_u32() | REDUCE_FLAG | ((depth as u32) << REDUCE_DEPTH_SHIFT);
    if g.terms.get(r.lhs).flags & REPEATED != 0 {
        v |= REPEAT_FLAG;
    }
    if stay {
        v |= STAY_FLAG;
    }
    v
}

/// Append `chunk` to `data` unless an identical subsequence already occurs (linear scan, left
/// to right); return its offset.
fn intern_chunk(data: &mut Vec<u16>, chunk: &[u16]) -> u16 {
    if chunk.len() <= data.len() {
        for i in 0..=data.len() - chunk.len() {
            if &data[i..i + chunk.len()] == chunk {
                return i as u16;
            }
        }
    }
    let off = data.len() as u16;
    data.extend_from_slice(chunk);
    assert!(data.len() < 0x10000, "action data overflows 16-bit offsets");
    off
}

fn encode_action(g: &NormalGrammar, a: Action) -> u32 {
    match a {
        Action::Shift(t) => {
            let v = usize::from(t) as u32;
            debug_assert!(v < 0x10000);
            v
        }
        Action::Reduce(r) => {
            reduce_value(g, r, g.rules[usize::from(r)].parts.len(), false)
        }
    }
}

/// Decide, per skip scope, whether its construct can be inlined: the scope is token-only, or
/// its start state merely shifts into states that immediately reduce the whole construct
/// ("skip once, then revert"). Returns the extra `(term, value)` stay-actions to splice into
/// ordinary states, or `None` when the scope is genuinely stateful.
fn skip_inline_actions(
    sg: &StateGraph,
    g: &NormalGrammar,
    scope: usize,
) -> Option<Vec<(TermIdx, u32)>> {
    let sk = &g.skips[scope];
    let mut out: Vec<(TermIdx, u32)> = sk.tokens.iter().map(|&t| (t, STAY_FLAG)).collect();
    let root_term = match sk.rule {
        None => return Some(out),
        Some(t) => t,
    };
    let root = match sg.skip_starts[scope] {
        Some(st) => sg.state(st),
        None => return Some(out),
    };
    for e in &root.actions {
        match e.action {
            Action::Shift(target) => {
                let tstate = sg.state(target);
                let auto_reduce = !tstate.actions.is_empty()
                    && tstate.actions.iter().all(|te| match te.action {
                        Action::Reduce(r) => g.rules[usize::from(r)].lhs == root_term,
                        Action::Shift(_) => false,
                    })
                    && tstate.gotos.is_empty();
                if !auto_reduce {
                    return None;
                }
                out.push((e.term, STAY_FLAG));
            }
            Action::Reduce(_) => return None,
        }
    }
    Some(out)
}

/// Pack the collapsed, group-assigned state graph.
pub fn pack(
    sg: &StateGraph,
    g: &NormalGrammar,
    groups_len: usize,
) -> Result<StateTable, TableError> {
    assert!(sg.states.len() < 0xFFFF);
    assert!(g.terms.len() < 0xFFFF);
    if groups_len + g.externals.len() > 16 {
        return Err(TableError {
            kind: TableErrorKind::TooManyTokenizers,
        });
    }

    let mut data: Vec<u16> = Vec::new();
    // A shared empty list for states with nothing to store.
    let empty_off = intern_chunk(&mut data, &[END_SENTINEL]);

    // Per-scope skip treatment, decided once.
    let mut scope_inline: Vec<Option<Vec<(TermIdx, u32)>>> = Vec::new();
    let mut scope_off: Vec<u16> = Vec::new();
    for scope in 0..g.skips.len() {
        let inline = skip_inline_actions(sg, g, scope);
        let off = if inline.is_some() {
            empty_off
        } else {
            // Genuinely stateful: the scope's skip offset points at the packed actions of its
            // start state.
            let root = sg.skip_starts[scope].unwrap();
            let mut chunk = Vec::new();
            let mut entries: Vec<(TermIdx, u32)> = sg
                .state(root)
                .actions
                .iter()
                .map(|e| (e.term, encode_action(g, e.action)))
                .collect();
            entries.sort_by_key(|(t, _)| t.as_u32());
            for (t, v) in entries {
                chunk.push(t.as_u32() as u16);
                chunk.push((v & 0xFFFF) as u16);
                chunk.push((v >> 16) as u16);
            }
            chunk.push(END_SENTINEL);
            intern_chunk(&mut data, &chunk)
        };
        scope_inline.push(inline);
        scope_off.push(off);
    }

    let top = g.top_term;
    let eof = g.terms.eof_idx();
    let mut states: Vec<u16> = Vec::with_capacity(sg.states.len() * STATE_RECORD_SIZE);

    for st in &sg.states {
        let mut entries: Vec<(TermIdx, u32)> = st
            .actions
            .iter()
            .map(|e| (e.term, encode_action(g, e.action)))
            .collect();
        entries.sort_by_key(|(t, _)| t.as_u32());

        // Accepting: this state reduces the top rule on eof.
        let accepting = st.actions.iter().any(|e| {
            e.term == eof
                && matches!(e.action, Action::Reduce(r) if g.rules[usize::from(r)].lhs == top)
        });

        // Inline skip actions, unless this state is itself part of a skip construct.
        let mut has_stay = false;
        if !st.part_of_skip {
            if let Some(inline) = &scope_inline[usize::from(st.skip)] {
                for &(t, v) in inline {
                    if !entries.iter().any(|(et, _)| *et == t) {
                        entries.push((t, v));
                        has_stay = true;
                    }
                }
            }
        }

        // Default reduce: a single unique reduce action covering every lookahead.
        let mut default_reduce = 0u32;
        if !accepting && !has_stay && !st.actions.is_empty() {
            let mut rules = st.actions.iter().map(|e| match e.action {
                Action::Reduce(r) => Some(r),
                Action::Shift(_) => None,
            });
            if let Some(Some(first)) = rules.next() {
                if rules.all(|r| r == Some(first)) {
                    default_reduce =
                        reduce_value(g, first, g.rules[usize::from(first)].parts.len(), false);
                }
            }
        }

        let actions_off = if default_reduce != 0 {
            empty_off
        } else {
            let mut chunk = Vec::with_capacity(entries.len() * 3 + 1);
            for &(t, v) in &entries {
                chunk.push(t.as_u32() as u16);
                chunk.push((v & 0xFFFF) as u16);
                chunk.push((v >> 16) as u16);
            }
            chunk.push(END_SENTINEL);
            intern_chunk(&mut data, &chunk)
        };

        let recover_off = if st.recover.is_empty() {
            empty_off
        } else {
            let mut chunk = Vec::new();
            for &(t, target) in &st.recover {
                chunk.push(t.as_u32() as u16);
                chunk.push(usize::from(target) as u16);
                chunk.push(0);
            }
            chunk.push(END_SENTINEL);
            intern_chunk(&mut data, &chunk)
        };

        // Forced reduce: the item with the smallest remaining suffix (ties: longest rule),
        // used to collapse the stack during error recovery.
        let mut forced = 0u32;
        let mut best: Option<(usize, usize)> = None;
        for item in &st.items {
            let rule = &g.rules[usize::from(item.rule)];
            if rule.lhs == top || item.dot == 0 {
                continue;
            }
            let remaining = rule.parts.len() - item.dot as usize;
            let key = (remaining, usize::MAX - rule.parts.len());
            if best.map_or(true, |b| key < b) {
                best = Some(key);
                forced = reduce_value(g, item.rule, item.dot as usize, false);
            }
        }

        let mut mask: u16 = 1 << usize::from(st.token_group.unwrap_or(crate::GrpIdx(0)));
        for (ei, ext) in g.externals.iter().enumerate() {
            if st.actions.iter().any(|e| ext.terms.contains(&e.term)) {
                mask |= 1 << (groups_len + ei);
            }
        }

        let mut flags = 0u16;
        if st.ambiguous {
            flags |= FLAG_AMBIGUOUS;
        }
        if st.part_of_skip {
            flags |= FLAG_SKIPPED;
        }
        if accepting {
            flags |= FLAG_ACCEPTING;
        }

        states.push(flags);
        states.push(actions_off);
        states.push(recover_off);
        states.push(scope_off[usize::from(st.skip)]);
        states.push(mask);
        states.push((default_reduce & 0xFFFF) as u16);
        states.push((default_reduce >> 16) as u16);
        states.push((forced & 0xFFFF) as u16);
        states.push((forced >> 16) as u16);
    }

    // Goto table: index area, then per-term records grouped by target.
    let mut goto: Vec<u16> = vec![0; g.terms.len()];
    let mut by_term: IndexMap<TermIdx, IndexMap<u16, Vec<u16>>> = IndexMap::new();
    for (si, st) in sg.states.iter().enumerate() {
        for &(t, target) in &st.gotos {
            by_term
                .entry(t)
                .or_default()
                .entry(usize::from(target) as u16)
                .or_default()
                .push(si as u16);
        }
    }
    for (t, targets) in &by_term {
        goto[usize::from(*t)] = goto.len() as u16;
        let last = targets.len() - 1;
        for (i, (target, sources)) in targets.iter().enumerate() {
            let head = ((sources.len() as u16) << 1) | u16::from(i == last);
            goto.push(head);
            goto.push(*target);
            goto.extend_from_slice(sources);
        }
    }
    assert!(goto.len() < 0x10000);

    Ok(StateTable {
        states,
        data,
        goto,
        start: usize::from(sg.start) as u16,
        skip_offsets: scope_off,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        collapse::collapse, firsts::Firsts, groups::assign_groups, stategraph::build_stategraph,
        RuleIndex,
    };
    use cstgrammar::{normalize::normalize, parser::GrammarParser};
    use cstlex::TokenDfaBuilder;

    fn build(src: &str) -> (NormalGrammar, StateGraph, StateTable) {
        let ast = GrammarParser::new(src).parse().unwrap();
        let g = normalize(&ast, &mut |_| ()).unwrap();
        let idx = RuleIndex::new(&g);
        let firsts = Firsts::new(&g, &idx);
        let sg = build_stategraph(&g, &idx, &firsts).unwrap();
        let mut collapsed = collapse(&sg);
        let lex = TokenDfaBuilder::new(&g).unwrap();
        let conflicts = lex.all_conflicts().unwrap();
        let groups = assign_groups(&mut collapsed, &g, &firsts, &conflicts).unwrap();
        let table = pack(&collapsed, &g, groups.len()).unwrap();
        (g, collapsed, table)
    }

    const ARITH: &str = "@precedence { times @left, plus @left } \
                         @top { Expr } \
                         Expr = expr { Expr \"+\" !plus Expr | Expr \"*\" !times Expr | \"n\" }";

    #[test]
    fn record_layout() {
        let (_, sg, table) = build(ARITH);
        assert_eq!(table.states_len(), sg.states.len());
        assert_eq!(table.states.len(), sg.states.len() * STATE_RECORD_SIZE);
        assert_eq!(table.start as usize, usize::from(sg.start));
    }

    #[test]
    fn shift_and_reduce_encoding() {
        let (g, sg, table) = build(ARITH);
        let expr = g.terms.lookup("Expr").unwrap();
        let plus = g.terms.lookup("+").unwrap();
        let times = g.terms.lookup("*").unwrap();
        let s1 = sg.edge(sg.start, expr).unwrap();
        let s_plus = sg.edge(s1, plus).unwrap();
        let after_plus = sg.edge(s_plus, expr).unwrap();

        let v_shift = table
            .lookup_action(usize::from(after_plus), times.as_u32() as u16)
            .unwrap();
        assert!(!is_reduce(v_shift));
        let v_red = table
            .lookup_action(usize::from(after_plus), plus.as_u32() as u16)
            .unwrap();
        assert!(is_reduce(v_red));
        assert_eq!(reduce_term(v_red), expr.as_u32() as u16);
        assert_eq!(reduce_depth(v_red), 3);
    }

    #[test]
    fn goto_walk_matches_graph() {
        let (_, sg, table) = build(ARITH);
        for (si, st) in sg.states.iter().enumerate() {
            for &(t, target) in &st.gotos {
                assert_eq!(
                    table.goto_target(si as u16, t.as_u32() as u16),
                    Some(usize::from(target) as u16),
                    "goto({}, {:?})",
                    si,
                    t
                );
            }
        }
    }

    #[test]
    fn default_reduce_detected() {
        let (g, sg, table) = build("@top { A \"x\" } A = a { \"y\" \"z\" }");
        // The state after `y z` reduces A on every lookahead.
        let y = g.terms.lookup("y").unwrap();
        let z = g.terms.lookup("z").unwrap();
        let s1 = sg.edge(sg.start, y).unwrap();
        let s2 = sg.edge(s1, z).unwrap();
        let rec = table.record(usize::from(s2));
        let def = rec[REC_DEFAULT_LO] as u32 | ((rec[REC_DEFAULT_HI] as u32) << 16);
        assert!(is_reduce(def));
        assert_eq!(reduce_term(def), g.terms.lookup("A").unwrap().as_u32() as u16);
        // Its action list collapses to the shared empty chunk.
        assert_eq!(table.data[rec[REC_ACTIONS] as usize], END_SENTINEL);
    }

    #[test]
    fn skip_tokens_inlined_with_stay() {
        let (g, sg, table) = build("@top { \"a\" \"b\" \"c\" } @skip { \" \" }");
        let sp = g.terms.lookup(" ").unwrap();
        let v = table
            .lookup_action(usize::from(sg.start), sp.as_u32() as u16)
            .unwrap();
        assert_eq!(v & STAY_FLAG, STAY_FLAG);
        assert!(!is_reduce(v));
    }

    #[test]
    fn repeat_reduces_carry_repeat_flag() {
        let (g, sg, table) = build("@top { Item* } Item = item { \"i\" }");
        let inner = g.terms.lookup("%inner").unwrap();
        let mut found = false;
        for si in 0..sg.states.len() {
            for (_, v) in table.actions_of(si) {
                if is_reduce(v) && reduce_term(v) == inner.as_u32() as u16 {
                    assert_eq!(v & REPEAT_FLAG, REPEAT_FLAG);
                    found = true;
                }
            }
            let rec = table.record(si);
            let def = rec[REC_DEFAULT_LO] as u32 | ((rec[REC_DEFAULT_HI] as u32) << 16);
            if def != 0 && reduce_term(def) == inner.as_u32() as u16 {
                assert_eq!(def & REPEAT_FLAG, REPEAT_FLAG);
                found = true;
            }
        }
        assert!(found);
    }

    #[test]
    fn identical_action_lists_share_offsets() {
        let (_, _, table) = build(ARITH);
        let mut offsets: Vec<(u16, Vec<(u16, u32)>)> = Vec::new();
        for si in 0..table.states_len() {
            let off = table.record(si)[REC_ACTIONS];
            let acts = table.actions_of(si);
            for (o2, a2) in &offsets {
                if *a2 == acts {
                    assert_eq!(*o2, off, "identical lists must dedup to one offset");
                }
            }
            offsets.push((off, acts));
        }
    }

    #[test]
    fn deterministic_packing() {
        let (_, _, t1) = build(ARITH);
        let (_, _, t2) = build(ARITH);
        assert_eq!(t1.states, t2.states);
        assert_eq!(t1.data, t2.data);
        assert_eq!(t1.goto, t2.goto);
    }

    #[test]
    fn accepting_state_flagged() {
        let (_, sg, table) = build("@top { \"a\" \"b\" \"c\" }");
        let accepting = (0..sg.states.len())
            .filter(|&si| table.record(si)[REC_FLAGS] & FLAG_ACCEPTING != 0)
            .count();
        assert_eq!(accepting, 1);
    }
}
