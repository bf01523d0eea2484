//! Token-group partitioning: every state is assigned a tokenizer context containing at least
//! the terminals it expects, such that no two conflicting tokens land in the same group. At
//! most 16 groups exist, matching the width of the per-state tokenizer selection mask.

use fnv::FnvHashSet;
use indexmap::IndexSet;

use cstgrammar::{normalize::NormalGrammar, TermIdx};

use crate::{Firsts, GrpIdx, StateGraph, TableError, TableErrorKind};

pub const MAX_GROUPS: usize = 16;

fn norm_pair(a: TermIdx, b: TermIdx) -> (TermIdx, TermIdx) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

/// The DFA-matched terminals a state's tokenizer must recognize: its action terms (chased
/// through specialization origins) plus the tokens of its skip scope, including the first
/// tokens of a compound skip construct.
fn state_terms(
    sg: &StateGraph,
    g: &NormalGrammar,
    firsts: &Firsts,
    dfa_terms: &FnvHashSet<TermIdx>,
    st: usize,
) -> IndexSet<TermIdx> {
    let state = &sg.states[st];
    let mut out = IndexSet::new();
    for e in &state.actions {
        let t = g.token_origin(e.term);
        if dfa_terms.contains(&t) {
            out.insert(t);
        }
    }
    let scope = &g.skips[usize::from(state.skip)];
    for &t in &scope.tokens {
        let t = g.token_origin(t);
        if dfa_terms.contains(&t) {
            out.insert(t);
        }
    }
    if let Some(rule) = scope.rule {
        for t in firsts.firsts(rule).iter_set_bits(..) {
            let t = g.token_origin(TermIdx::from(t));
            if dfa_terms.contains(&t) {
                out.insert(t);
            }
        }
    }
    out
}

/// Greedily place every state's term set into a compatible group, opening a new group when no
/// existing one fits. Returns the groups' token sets; each state's `token_group` is filled in.
pub fn assign_groups(
    sg: &mut StateGraph,
    g: &NormalGrammar,
    firsts: &Firsts,
    conflict_pairs: &[(TermIdx, TermIdx)],
) -> Result<Vec<Vec<TermIdx>>, TableError> {
    let conflicts: FnvHashSet<(TermIdx, TermIdx)> = conflict_pairs
        .iter()
        .map(|&(a, b)| norm_pair(a, b))
        .collect();
    let dfa_terms: FnvHashSet<TermIdx> = g.token_roots.iter().map(|(t, _)| *t).collect();

    let mut groups: Vec<IndexSet<TermIdx>> = vec![IndexSet::new()];
    for st in 0..sg.states.len() {
        let terms = state_terms(sg, g, firsts, &dfa_terms, st);
        for (i, &a) in terms.iter().enumerate() {
            for &b in terms.iter().skip(i + 1) {
                if conflicts.contains(&norm_pair(a, b)) {
                    return Err(TableError {
                        kind: TableErrorKind::OverlappingTokensInContext(
                            g.terms.name(a).to_string(),
                            g.terms.name(b).to_string(),
                        ),
                    });
                }
            }
        }
        let mut chosen = None;
        'groups: for (gi, group) in groups.iter().enumerate() {
            for &t in &terms {
                for &m in group.iter().chain(terms.iter()) {
                    if m != t && conflicts.contains(&norm_pair(t, m)) {
                        continue 'groups;
                    }
                }
            }
            chosen = Some(gi);
            break;
        }
        let gi = match chosen {
            Some(gi) => gi,
            None => {
                if groups.len() == MAX_GROUPS {
                    return Err(TableError {
                        kind: TableErrorKind::TooManyTokenGroups,
                    });
                }
                groups.push(IndexSet::new());
                groups.len() - 1
            }
        };
        groups[gi].extend(terms);
        sg.states[st].token_group = Some(GrpIdx::from(gi));
    }
    Ok(groups
        .into_iter()
        .map(|s| s.into_iter().collect())
        .collect())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{collapse::collapse, stategraph::build_stategraph, RuleIndex};
    use cstgrammar::{normalize::normalize, parser::GrammarParser};
    use cstlex::TokenDfaBuilder;

    fn setup(src: &str) -> (NormalGrammar, StateGraph, Vec<Vec<TermIdx>>) {
        let ast = GrammarParser::new(src).parse().unwrap();
        let g = normalize(&ast, &mut |_| ()).unwrap();
        let idx = RuleIndex::new(&g);
        let firsts = Firsts::new(&g, &idx);
        let sg = build_stategraph(&g, &idx, &firsts).unwrap();
        let mut collapsed = collapse(&sg);
        let lex = TokenDfaBuilder::new(&g).unwrap();
        let conflicts = lex.all_conflicts().unwrap();
        let groups = assign_groups(&mut collapsed, &g, &firsts, &conflicts).unwrap();
        (g, collapsed, groups)
    }

    #[test]
    fn conflict_free_grammar_uses_one_group() {
        let (_, sg, groups) = setup("@top { \"a\" \"b\" \"c\" }");
        assert_eq!(groups.len(), 1);
        assert!(sg.states.iter().all(|s| s.token_group == Some(GrpIdx(0))));
    }

    #[test]
    fn conflicting_tokens_split_groups() {
        // `kw` and `id` overlap with no precedence order, but are never expected in the same
        // state, so they land in different groups rather than failing the build.
        let (g, sg, groups) = setup(
            "@top { kw id \"%\" } @tokens { kw { \"if\" } id { [a-z]+ } }",
        );
        assert!(groups.len() >= 2);
        let kw = g.terms.lookup("kw").unwrap();
        let id = g.terms.lookup("id").unwrap();
        for group in &groups {
            assert!(!(group.contains(&kw) && group.contains(&id)));
        }
        // Every state's expected tokens are inside its group.
        let idx = RuleIndex::new(&g);
        let firsts = Firsts::new(&g, &idx);
        let dfa_terms: FnvHashSet<TermIdx> = g.token_roots.iter().map(|(t, _)| *t).collect();
        for (si, st) in sg.states.iter().enumerate() {
            let terms = state_terms(&sg, &g, &firsts, &dfa_terms, si);
            let gi = usize::from(st.token_group.unwrap());
            for t in terms {
                assert!(groups[gi].contains(&t));
            }
        }
    }

    #[test]
    fn skip_tokens_included_in_groups() {
        let (g, sg, groups) = setup("@top { \"a\" \"b\" \"c\" } @skip { \" \" }");
        let sp = g.terms.lookup(" ").unwrap();
        for st in &sg.states {
            let gi = usize::from(st.token_group.unwrap());
            assert!(groups[gi].contains(&sp));
        }
        let _ = sg;
    }

    #[test]
    fn too_many_groups_fatal() {
        // 17 mutually-conflicting tokens, each expected in its own state.
        let mut toks = String::new();
        let mut seq = String::new();
        for i in 0..17 {
            toks.push_str(&format!("t{} {{ \"k\" [a-z]* }} ", i));
            seq.push_str(&format!("t{} ", i));
        }
        let src = format!("@top {{ {} }} @tokens {{ {} }}", seq, toks);
        let ast = GrammarParser::new(&src).parse().unwrap();
        let g = normalize(&ast, &mut |_| ()).unwrap();
        let idx = RuleIndex::new(&g);
        let firsts = Firsts::new(&g, &idx);
        let sg = build_stategraph(&g, &idx, &firsts).unwrap();
        let mut collapsed = collapse(&sg);
        let lex = TokenDfaBuilder::new(&g).unwrap();
        let conflicts = lex.all_conflicts().unwrap();
        match assign_groups(&mut collapsed, &g, &firsts, &conflicts) {
            Err(TableError {
                kind: TableErrorKind::TooManyTokenGroups,
            }) => (),
            r => panic!("unexpected result {:?}", r),
        }
    }
}
