//! Rendering of the two output artifacts as Rust source text: the parser-tables module and
//! the term-id constants module. Everything a runtime needs to reconstruct the parser lives in
//! the statics emitted here; the packed formats themselves are documented in
//! `cstlr::statetable` and `cstlex::dfa`.

use cstgrammar::{normalize::NormalGrammar, TermIdx};
use cstlex::{dfa, Dfa};
use cstlr::statetable::{StateTable, STATE_RECORD_SIZE};

use crate::GenOptions;

const HEADER: &str = "// Generated by cstgen. Do not edit.\n";

fn push_u16_array(out: &mut String, name: &str, values: &[u16]) {
    out.push_str(&format!("pub static {}: &[u16] = &[", name));
    for (i, v) in values.iter().enumerate() {
        if i % 16 == 0 {
            out.push_str("\n    ");
        }
        out.push_str(&format!("{}, ", v));
    }
    out.push_str("\n];\n");
}

fn push_str_array(out: &mut String, name: &str, values: &[String]) {
    out.push_str(&format!("pub static {}: &[&str] = &[", name));
    for (i, v) in values.iter().enumerate() {
        if i % 8 == 0 {
            out.push_str("\n    ");
        }
        out.push_str(&format!("{:?}, ", v));
    }
    out.push_str("\n];\n");
}

pub fn parser_module(
    g: &NormalGrammar,
    table: &StateTable,
    group_dfas: &[Dfa],
    nested_dfas: &[Option<Dfa>],
    rank_order: &[TermIdx],
    opts: &GenOptions,
) -> String {
    let mut out = String::new();
    out.push_str(HEADER);
    out.push_str("#![allow(clippy::all)]\n\n");

    out.push_str(&format!(
        "pub const STATE_RECORD_SIZE: usize = {};\n",
        STATE_RECORD_SIZE
    ));
    out.push_str(&format!("pub const START_STATE: u16 = {};\n", table.start));
    out.push_str(&format!("pub const TERM_COUNT: u16 = {};\n", g.terms.len()));
    out.push_str(&format!(
        "pub const GROUP_COUNT: u16 = {};\n\n",
        group_dfas.len()
    ));

    push_u16_array(&mut out, "STATES", &table.states);
    push_u16_array(&mut out, "DATA", &table.data);
    push_u16_array(&mut out, "GOTO", &table.goto);
    push_u16_array(&mut out, "SKIP", &table.skip_offsets);

    // Group tokenizers, concatenated; nested end-token tokenizers follow.
    let mut token_data: Vec<u16> = Vec::new();
    let mut group_offsets: Vec<u16> = Vec::new();
    for d in group_dfas {
        group_offsets.push(token_data.len() as u16);
        token_data.extend(dfa::encode(d));
    }
    let mut nested_offsets: Vec<u16> = Vec::new();
    for d in nested_dfas {
        match d {
            Some(d) => {
                nested_offsets.push(token_data.len() as u16);
                token_data.extend(dfa::encode(d));
            }
            None => nested_offsets.push(u16::MAX),
        }
    }
    push_u16_array(&mut out, "TOKEN_DATA", &token_data);
    push_u16_array(&mut out, "TOKEN_GROUP_OFFSETS", &group_offsets);

    let prec: Vec<u16> = rank_order.iter().map(|t| t.as_u32() as u16).collect();
    push_u16_array(&mut out, "TOKEN_PREC", &prec);

    // Specializations, with an index from base terminal to its first entry.
    out.push_str("pub static SPECIALIZE_TABLE: &[(u16, u16)] = &[\n");
    let mut seen_base: Vec<TermIdx> = Vec::new();
    for (i, s) in g.specializations.iter().enumerate() {
        if !seen_base.contains(&s.base) {
            seen_base.push(s.base);
            out.push_str(&format!("    ({}, {}),\n", s.base.as_u32(), i));
        }
    }
    out.push_str("];\n");
    out.push_str("pub static SPECIALIZATIONS: &[(u16, &str, u16, u16)] = &[\n");
    for s in &g.specializations {
        out.push_str(&format!(
            "    ({}, {:?}, {}, {}),\n",
            s.base.as_u32(),
            s.value,
            s.term.as_u32(),
            u16::from(s.extend)
        ));
    }
    out.push_str("];\n");

    let tags: Vec<String> = g
        .terms
        .iter_idxs()
        .map(|t| {
            g.terms
                .get(t)
                .tag
                .as_ref()
                .map(|tag| tag.to_string())
                .unwrap_or_default()
        })
        .collect();
    push_str_array(&mut out, "TAG_NAMES", &tags);

    out.push_str("pub static EXTERNAL_TOKENIZERS: &[(&str, &str)] = &[\n");
    for e in &g.externals {
        out.push_str(&format!("    ({:?}, {:?}),\n", e.name, e.source));
    }
    out.push_str("];\n");
    out.push_str("pub static EXTERNAL_TOKENS: &[(u16, u16)] = &[\n");
    for (ei, e) in g.externals.iter().enumerate() {
        for &t in &e.terms {
            out.push_str(&format!("    ({}, {}),\n", ei, t.as_u32()));
        }
    }
    out.push_str("];\n");

    out.push_str("pub static NESTED: &[(&str, &str, u16, u16)] = &[\n");
    for (ni, n) in g.nested.iter().enumerate() {
        out.push_str(&format!(
            "    ({:?}, {:?}, {}, {}),\n",
            n.name,
            n.source.as_deref().unwrap_or(""),
            n.term.as_u32(),
            nested_offsets[ni]
        ));
    }
    out.push_str("];\n");

    if opts.term_names {
        let names: Vec<String> = g
            .terms
            .iter_idxs()
            .map(|t| g.terms.name(t).to_string())
            .collect();
        push_str_array(&mut out, "TERM_NAMES", &names);
    }

    out
}

const RUST_KEYWORDS: &[&str] = &[
    "abstract", "as", "async", "await", "become", "box", "break", "const", "continue", "crate",
    "do", "dyn", "else", "enum", "extern", "false", "final", "fn", "for", "if", "impl", "in",
    "let", "loop", "macro", "match", "mod", "move", "mut", "override", "priv", "pub", "ref",
    "return", "self", "static", "struct", "super", "trait", "true", "try", "type", "typeof",
    "unsafe", "unsized", "use", "virtual", "where", "while", "yield",
];

fn is_source_ident(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_')
}

pub fn terms_module(g: &NormalGrammar) -> String {
    let mut out = String::new();
    out.push_str(HEADER);
    out.push_str("#![allow(non_upper_case_globals)]\n\n");
    // Literal tokens are named after their text, which is not a source identifier.
    let literal_terms: Vec<TermIdx> = g
        .token_roots
        .iter()
        .filter(|(_, e)| matches!(e, cstgrammar::ast::Expr::Literal { .. }))
        .map(|(t, _)| *t)
        .collect();
    let mut used: Vec<String> = Vec::new();
    for t in g.terms.iter_idxs() {
        let name = g.terms.name(t);
        if !is_source_ident(name) || literal_terms.contains(&t) {
            continue;
        }
        let mut ident = name.to_string();
        if RUST_KEYWORDS.contains(&ident.as_str()) {
            ident = format!("_{}", ident);
        }
        if used.contains(&ident) {
            ident = format!("{}_{}", ident, t.as_u32());
        }
        out.push_str(&format!("pub const {}: u16 = {};\n", ident, t.as_u32()));
        used.push(ident);
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use cstgrammar::{normalize::normalize, parser::GrammarParser};

    fn grammar(src: &str) -> NormalGrammar {
        let ast = GrammarParser::new(src).parse().unwrap();
        normalize(&ast, &mut |_| ()).unwrap()
    }

    #[test]
    fn terms_module_filters_and_prefixes() {
        let g = grammar(
            "@top { Expr fn_kw } Expr = expr { \"x\" \"y\" \"z\" } \
             @tokens { fn_kw { \"fn\" } }",
        );
        let m = terms_module(&g);
        assert!(m.contains("pub const Expr: u16"));
        assert!(m.contains("pub const fn_kw: u16"));
        // Synthetic and literal terms carry no source identifier.
        assert!(!m.contains("%top"));
        assert!(!m.contains("const x:"));
    }

    #[test]
    fn keyword_collision_prefixed() {
        let g = grammar("@top { (id | @specialize<id, \"match\">) \";\" } @tokens { id { [a-z]+ } }");
        let m = terms_module(&g);
        assert!(m.contains("pub const _match: u16"));
    }

    #[test]
    fn specialization_clashing_with_rule_stays_synthetic() {
        // A specialization whose value collides with a declared rule name gets a synthetic
        // (`%`-prefixed) term instead of shadowing the rule.
        let g = grammar(
            "@top { (id | @specialize<id, \"top\">) top } top = t { \"x\" \"y\" \"z\" } \
             @tokens { id { [a-z]+ } }",
        );
        let m = terms_module(&g);
        assert_eq!(m.matches("pub const top: u16").count(), 1);
        assert!(g.terms.lookup("%top.1").is_some());
    }
}
