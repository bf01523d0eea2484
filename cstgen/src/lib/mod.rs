//! The driver: runs a grammar file through the whole pipeline (parse, normalize, LR(1)
//! construction, LALR collapse, token-group assignment, per-group DFA construction, table
//! packing) and emits the two output artifacts as Rust modules.

use std::{error::Error, fmt};

use cstgrammar::{
    normalize::normalize, parser::GrammarParser, BuildWarning, GrammarError, NewlineCache, Span,
};
use cstlex::{Dfa, LexBuildError, TokenDfaBuilder};
use cstlr::{
    collapse::collapse, groups::assign_groups, stategraph::build_stategraph, statetable::pack,
    Firsts, RuleIndex, TableError,
};

pub mod emit;

#[derive(Debug)]
pub enum BuildError {
    Grammar(GrammarError),
    Lex(LexBuildError),
    Table(TableError),
}

impl Error for BuildError {}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BuildError::Grammar(e) => write!(f, "{}", e),
            BuildError::Lex(e) => write!(f, "{}", e),
            BuildError::Table(e) => write!(f, "{}", e),
        }
    }
}

impl From<GrammarError> for BuildError {
    fn from(e: GrammarError) -> Self {
        BuildError::Grammar(e)
    }
}

impl From<LexBuildError> for BuildError {
    fn from(e: LexBuildError) -> Self {
        BuildError::Lex(e)
    }
}

impl From<TableError> for BuildError {
    fn from(e: TableError) -> Self {
        BuildError::Table(e)
    }
}

impl BuildError {
    pub fn spans(&self) -> &[Span] {
        match self {
            BuildError::Grammar(e) => &e.spans,
            BuildError::Lex(e) => &e.spans,
            BuildError::Table(_) => &[],
        }
    }

    /// Render as `message (file line:col)` when a position is known.
    pub fn render(&self, file: &str, src: &str) -> String {
        match self.spans().first() {
            Some(sp) => {
                let mut nc = NewlineCache::new();
                nc.feed(src);
                match nc.byte_to_line_and_col(src, sp.start()) {
                    Some((line, col)) => format!("{} ({} {}:{})", self, file, line, col),
                    None => format!("{} ({})", self, file),
                }
            }
            None => format!("{} ({})", self, file),
        }
    }
}

/// Render a warning as `message (file line:col)`.
pub fn render_warning(w: &BuildWarning, file: &str, src: &str) -> String {
    let mut nc = NewlineCache::new();
    nc.feed(src);
    match nc.byte_to_line_and_col(src, w.span.start()) {
        Some((line, col)) => format!("{} ({} {}:{})", w, file, line, col),
        None => format!("{} ({})", w, file),
    }
}

#[derive(Debug, Clone)]
pub struct GenOptions {
    /// Include a `TERM_NAMES` array in the parser module, for debugging runtimes.
    pub term_names: bool,
    /// Keep the pretty-printed state graph in [Artifacts::state_graph].
    pub dump_states: bool,
}

impl Default for GenOptions {
    fn default() -> Self {
        GenOptions {
            term_names: false,
            dump_states: false,
        }
    }
}

#[derive(Debug)]
pub struct Artifacts {
    pub parser_module: String,
    pub terms_module: String,
    pub state_count: usize,
    pub group_count: usize,
    pub term_count: usize,
    pub state_graph: Option<String>,
}

/// Run the whole generation pipeline over a grammar source.
pub fn generate(
    src: &str,
    opts: &GenOptions,
    warn: &mut dyn FnMut(BuildWarning),
) -> Result<Artifacts, BuildError> {
    let ast = GrammarParser::new(src).parse()?;
    let g = normalize(&ast, warn)?;
    let idx = RuleIndex::new(&g);
    let firsts = Firsts::new(&g, &idx);
    let sg = build_stategraph(&g, &idx, &firsts)?;
    let mut collapsed = collapse(&sg);

    let lex = TokenDfaBuilder::new(&g)?;
    let conflicts = lex.all_conflicts()?;
    let groups = assign_groups(&mut collapsed, &g, &firsts, &conflicts)?;

    // Tokenizer DFAs are built last, once the groups are known.
    let mut group_dfas: Vec<Dfa> = Vec::with_capacity(groups.len());
    for group in &groups {
        group_dfas.push(lex.build_dfa(group)?);
    }
    let mut nested_dfas: Vec<Option<Dfa>> = Vec::with_capacity(g.nested.len());
    for n in &g.nested {
        match &n.end_token {
            Some(e) => nested_dfas.push(Some(lex.build_expr_dfa(n.term, e)?)),
            None => nested_dfas.push(None),
        }
    }

    let table = pack(&collapsed, &g, groups.len())?;

    let state_graph = if opts.dump_states {
        Some(collapsed.pp(&g))
    } else {
        None
    };
    let parser_module = emit::parser_module(
        &g,
        &table,
        &group_dfas,
        &nested_dfas,
        &lex.rank_order(),
        opts,
    );
    let terms_module = emit::terms_module(&g);

    Ok(Artifacts {
        parser_module,
        terms_module,
        state_count: collapsed.states.len(),
        group_count: groups.len(),
        term_count: g.terms.len(),
        state_graph,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    const ARITH: &str = "@precedence { times @left, plus @left } \
                         @top { Expr } \
                         Expr = expr { Expr \"+\" !plus Expr | Expr \"*\" !times Expr | num } \
                         @tokens { num { std.digit+ } } \
                         @skip { \" \" }";

    fn gen(src: &str) -> Artifacts {
        generate(src, &GenOptions::default(), &mut |_| ()).unwrap()
    }

    #[test]
    fn arith_builds_cleanly() {
        let a = gen(ARITH);
        assert!(a.state_count > 0);
        assert_eq!(a.group_count, 1);
        assert!(a.parser_module.contains("pub static STATES"));
        assert!(a.terms_module.contains("pub const"));
    }

    #[test]
    fn build_is_deterministic() {
        let a = gen(ARITH);
        let b = gen(ARITH);
        assert_eq!(a.parser_module, b.parser_module);
        assert_eq!(a.terms_module, b.terms_module);
    }

    #[test]
    fn specialize_reaches_artifact() {
        let a = gen(
            "@top { (id | @specialize<id, \"while\">) \";\" } @tokens { id { [a-z]+ } }",
        );
        assert!(a.parser_module.contains("\"while\""));
        assert!(a.parser_module.contains("SPECIALIZATIONS"));
    }

    #[test]
    fn term_names_optional() {
        let with = generate(
            ARITH,
            &GenOptions {
                term_names: true,
                dump_states: false,
            },
            &mut |_| (),
        )
        .unwrap();
        let without = gen(ARITH);
        assert!(with.parser_module.contains("TERM_NAMES"));
        assert!(!without.parser_module.contains("TERM_NAMES"));
    }

    #[test]
    fn dump_states_kept_on_request() {
        let a = generate(
            ARITH,
            &GenOptions {
                term_names: false,
                dump_states: true,
            },
            &mut |_| (),
        )
        .unwrap();
        let pp = a.state_graph.unwrap();
        assert!(pp.contains("%top ->"));
    }

    #[test]
    fn error_positions_rendered() {
        let src = "@top {\n  Undefined\n}";
        let err = generate(src, &GenOptions::default(), &mut |_| ()).unwrap_err();
        let rendered = err.render("g.grammar", src);
        assert!(rendered.contains("Unknown rule 'Undefined'"));
        assert!(rendered.contains("g.grammar 2:3"));
    }

    #[test]
    fn warnings_carry_positions() {
        let src = "@top { \"a\" }\nDead { \"d\" }";
        let mut warnings = Vec::new();
        generate(src, &GenOptions::default(), &mut |w| warnings.push(w)).unwrap();
        assert_eq!(warnings.len(), 1);
        let rendered = render_warning(&warnings[0], "g.grammar", src);
        assert!(rendered.contains("Unused rule 'Dead'"));
        assert!(rendered.contains("2:1"));
    }

    #[test]
    fn nested_scenario_emits_placeholder_and_end_dfa() {
        let a = gen(
            "@top { \"{\" nest.js<:block, \"}\"> \"}\" } @external-grammar js from \"x\"",
        );
        assert!(a.parser_module.contains("NESTED"));
        assert!(a.parser_module.contains("\"js\""));
    }
}
