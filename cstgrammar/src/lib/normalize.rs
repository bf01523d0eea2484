//! The normalizer turns the surface AST into a flat list of [Rule]s over interned terms:
//! choices are distributed over sequences, repetition is lowered to synthetic right-recursive
//! rules, templates are instantiated by capture-free substitution, and the result is then
//! simplified by inlining and merging passes run to fixpoint.

use std::collections::VecDeque;

use fnv::{FnvHashMap, FnvHashSet};
use indexmap::IndexMap;

use crate::{
    ast::{Expr, GrammarRoot, Marker, RepeatKind, RuleDecl, Tag},
    term::{Assoc, Precedence, TermSet, PRESERVE, REPEATED, TERMINAL},
    BuildWarning, BuildWarningKind, ConflictSpec, GrammarError, GrammarErrorKind, Rule, SkipIdx,
    Span, TermIdx,
};

/// The internal precedence level used to keep repetitions right-leaning without reporting a
/// conflict. Far above anything a `@precedence` block can produce.
pub const PREC_REPEAT: i32 = 1_000_000_000;

/// A named token rule from the `@tokens` block, kept in source form for the tokenizer builder.
#[derive(Clone, Debug)]
pub struct TokenRuleDef {
    pub params: Vec<String>,
    pub expr: Expr,
}

/// One skip scope. `tokens` are terminals silently consumed between significant tokens;
/// `rule` is the root non-terminal of a compound skip construct, if the scope has one.
#[derive(Clone, Debug)]
pub struct SkipScope {
    pub tokens: Vec<TermIdx>,
    pub rule: Option<TermIdx>,
}

/// A literal registered for promotion to a distinct terminal at tokenization time.
#[derive(Clone, Debug)]
pub struct Specialization {
    pub base: TermIdx,
    pub value: String,
    pub term: TermIdx,
    pub extend: bool,
}

#[derive(Clone, Debug)]
pub struct ExternalTokenizer {
    pub name: String,
    pub source: String,
    pub terms: Vec<TermIdx>,
}

#[derive(Clone, Debug)]
pub struct NestedGrammar {
    pub name: String,
    pub source: Option<String>,
    pub term: TermIdx,
    pub end_token: Option<Expr>,
    pub tag: Option<Tag>,
}

/// The normalizer's output: everything downstream layers need.
#[derive(Debug)]
pub struct NormalGrammar {
    pub terms: TermSet,
    /// Rules with the same lhs are adjacent, in first-definition order.
    pub rules: Vec<Rule>,
    pub top_term: TermIdx,
    /// Scope 0 is the global scope.
    pub skips: Vec<SkipScope>,
    pub token_rules: IndexMap<String, TokenRuleDef>,
    /// For every terminal the tokenizer must match: its source expression.
    pub token_roots: Vec<(TermIdx, Expr)>,
    /// `@precedence` lists from `@tokens`, resolved to terms; earlier entries take priority.
    pub token_precedences: Vec<Vec<TermIdx>>,
    pub specializations: Vec<Specialization>,
    pub externals: Vec<ExternalTokenizer>,
    pub nested: Vec<NestedGrammar>,
}

impl NormalGrammar {
    /// Chase a specialized term back to the underlying base terminal the tokenizer matches.
    pub fn token_origin(&self, t: TermIdx) -> TermIdx {
        for s in &self.specializations {
            if s.term == t {
                return s.base;
            }
        }
        t
    }

    pub fn rules_for(&self, lhs: TermIdx) -> impl Iterator<Item = (usize, &Rule)> {
        self.rules
            .iter()
            .enumerate()
            .filter(move |(_, r)| r.lhs == lhs)
    }
}

type Env = FnvHashMap<String, Expr>;

/// One alternative produced while normalizing an expression: a flat part list with one
/// conflict record per position (`conflicts.len() == parts.len() + 1`).
#[derive(Clone, Debug)]
struct Alt {
    parts: Vec<TermIdx>,
    conflicts: Vec<ConflictSpec>,
}

impl Alt {
    fn empty() -> Alt {
        Alt {
            parts: Vec::new(),
            conflicts: vec![ConflictSpec::empty()],
        }
    }

    fn single(t: TermIdx) -> Alt {
        Alt {
            parts: vec![t],
            conflicts: vec![ConflictSpec::empty(), ConflictSpec::empty()],
        }
    }

    /// Concatenate, merging the conflict records at the junction.
    fn concat(&self, other: &Alt) -> Alt {
        let mut parts = self.parts.clone();
        parts.extend(&other.parts);
        let mut conflicts = self.conflicts.clone();
        conflicts
            .last_mut()
            .unwrap()
            .merge(&other.conflicts[0]);
        conflicts.extend(other.conflicts[1..].iter().cloned());
        Alt { parts, conflicts }
    }
}

const BUILTIN_TOKENS: &[&str] = &[
    "asciiLetter",
    "asciiLowercase",
    "asciiUppercase",
    "digit",
    "whitespace",
    "any",
];

pub fn normalize(
    root: &GrammarRoot,
    warn: &mut dyn FnMut(BuildWarning),
) -> Result<NormalGrammar, GrammarError> {
    Normalizer::new(root).run(warn)
}

struct Normalizer {
    terms: TermSet,
    rules: Vec<Rule>,
    top_term: TermIdx,
    top_expr: Option<Expr>,
    ext_decls: Vec<crate::ast::ExternalTokensDecl>,
    /// Grammar rule declarations (global and skip-scoped), keyed by name.
    decls: IndexMap<String, (RuleDecl, SkipIdx)>,
    token_decls: IndexMap<String, TokenRuleDef>,
    skip_decls: Vec<(Expr, SkipIdx, Span)>,
    tags_decl: crate::ast::TagsDecl,
    token_prec_decls: Vec<Vec<(String, Span)>>,
    prec_env: FnvHashMap<String, Precedence>,
    external_grammars: Vec<crate::ast::ExternalGrammarDecl>,

    rule_memo: FnvHashMap<String, TermIdx>,
    instantiated: FnvHashSet<String>,
    repeat_inner_memo: FnvHashMap<String, TermIdx>,
    repeat_outer_memo: FnvHashMap<(String, bool), TermIdx>,
    tagged_memo: FnvHashMap<String, TermIdx>,
    token_memo: FnvHashMap<String, TermIdx>,
    literal_terms: FnvHashMap<String, TermIdx>,
    spec_memo: FnvHashMap<(u32, String), usize>,
    nested_memo: FnvHashMap<String, TermIdx>,

    token_roots: Vec<(TermIdx, Expr)>,
    specializations: Vec<Specialization>,
    skips: Vec<SkipScope>,
    externals: Vec<ExternalTokenizer>,
    nested: Vec<NestedGrammar>,
    protected: FnvHashSet<TermIdx>,

    queue: VecDeque<(TermIdx, Expr, SkipIdx)>,
}

impl Normalizer {
    fn new(root: &GrammarRoot) -> Normalizer {
        let mut terms = TermSet::new();
        let top_term = terms.intern("%top", 0);

        // Precedence declarations: every entry of a block shares the block's group; earlier
        // entries get higher levels.
        let mut prec_env = FnvHashMap::default();
        for (bi, block) in root.precedences.iter().enumerate() {
            for (idx, pt) in block.iter().enumerate() {
                prec_env
                    .entry(pt.name.clone())
                    .or_insert_with(|| Precedence {
                        group: format!("%{}", bi),
                        level: (block.len() - idx) as i32,
                        assoc: pt.assoc,
                        cut: pt.cut,
                    });
            }
        }

        // Skip scopes: 0 is global (the union of unscoped @skip declarations); scoped @skip
        // blocks get 1..N in order of appearance. Rules declared inside a scoped block carry
        // that scope.
        let mut decls: IndexMap<String, (RuleDecl, SkipIdx)> = IndexMap::new();
        for r in &root.rules {
            decls.insert(r.name.clone(), (r.clone(), SkipIdx(0)));
        }
        let mut skip_decls = Vec::new();
        let mut next_scope = 1u32;
        for sd in &root.skips {
            if sd.rules.is_empty() {
                skip_decls.push((sd.expr.clone(), SkipIdx(0), sd.span));
            } else {
                let scope = SkipIdx(next_scope);
                next_scope += 1;
                skip_decls.push((sd.expr.clone(), scope, sd.span));
                for r in &sd.rules {
                    decls.insert(r.name.clone(), (r.clone(), scope));
                }
            }
        }
        let skips = vec![
            SkipScope {
                tokens: Vec::new(),
                rule: None
            };
            next_scope as usize
        ];

        let mut token_decls = IndexMap::new();
        for r in &root.tokens.rules {
            token_decls.insert(
                r.name.clone(),
                TokenRuleDef {
                    params: r.params.clone(),
                    expr: r.expr.clone(),
                },
            );
        }

        Normalizer {
            terms,
            rules: Vec::new(),
            top_term,
            top_expr: root.top.as_ref().map(|(e, _)| e.clone()),
            ext_decls: root.external_tokens.clone(),
            decls,
            token_decls,
            skip_decls,
            tags_decl: root.tags.clone(),
            token_prec_decls: root.tokens.precedences.clone(),
            prec_env,
            external_grammars: root.external_grammars.clone(),
            rule_memo: FnvHashMap::default(),
            instantiated: FnvHashSet::default(),
            repeat_inner_memo: FnvHashMap::default(),
            repeat_outer_memo: FnvHashMap::default(),
            tagged_memo: FnvHashMap::default(),
            token_memo: FnvHashMap::default(),
            literal_terms: FnvHashMap::default(),
            spec_memo: FnvHashMap::default(),
            nested_memo: FnvHashMap::default(),
            token_roots: Vec::new(),
            specializations: Vec::new(),
            skips,
            externals: root
                .external_tokens
                .iter()
                .map(|e| ExternalTokenizer {
                    name: e.name.clone(),
                    source: e.source.clone(),
                    terms: Vec::new(),
                })
                .collect(),
            nested: Vec::new(),
            protected: FnvHashSet::default(),
            queue: VecDeque::new(),
        }
    }

    fn run(mut self, warn: &mut dyn FnMut(BuildWarning)) -> Result<NormalGrammar, GrammarError> {
        // External tokens become terminals up front so grammar rules can reference them.
        for (ei, decl) in self.ext_decls.clone().into_iter().enumerate() {
            for (tname, tag, _span) in decl.tokens {
                let t = self.terms.intern(&tname, TERMINAL);
                if tag.is_some() {
                    self.terms.get_mut(t).tag = tag;
                }
                self.externals[ei].terms.push(t);
            }
        }

        self.terms.set_top(self.top_term);

        let top_expr = self
            .root_top_expr()
            .ok_or_else(|| GrammarError {
                kind: GrammarErrorKind::MissingTop,
                spans: vec![Span::new(0, 0)],
            })?;
        self.queue
            .push_back((self.top_term, top_expr, SkipIdx(0)));
        self.drain()?;

        // Skip scopes, after the main grammar so term numbering follows source order.
        for (expr, scope, _span) in self.skip_decls.clone() {
            let alts = self.norm_expr(&expr, &Env::default(), scope)?;
            let mut compound: Vec<Alt> = Vec::new();
            for alt in alts {
                if alt.parts.len() == 1 && self.terms.is_terminal(alt.parts[0]) {
                    let scope_ref = &mut self.skips[usize::from(scope)];
                    if !scope_ref.tokens.contains(&alt.parts[0]) {
                        scope_ref.tokens.push(alt.parts[0]);
                    }
                } else {
                    compound.push(alt);
                }
            }
            if !compound.is_empty() {
                let rule_t = if compound.len() == 1
                    && compound[0].parts.len() == 1
                    && compound[0].conflicts.iter().all(|c| c.is_empty())
                {
                    compound[0].parts[0]
                } else {
                    let t = self.terms.fresh("%skip", 0);
                    for alt in compound {
                        self.rules
                            .push(Rule::new(t, alt.parts, alt.conflicts, scope));
                    }
                    t
                };
                self.protected.insert(rule_t);
                self.skips[usize::from(scope)].rule = Some(rule_t);
            }
            self.drain()?;
        }

        // `@tags` exports introduce preserved, tagged non-terminals.
        for (name, tag, span) in self.tags_decl.exports.clone() {
            let t = self.instantiate_rule(&name, &[], span)?;
            let term = self.terms.get_mut(t);
            term.tag = Some(tag);
            term.flags |= PRESERVE;
            self.drain()?;
        }

        // Exported rules are instantiated even when unreferenced; anything else left
        // uninstantiated is dead and reported.
        let decl_names: Vec<(String, bool, Span)> = self
            .decls
            .iter()
            .map(|(n, (d, _))| (n.clone(), d.exported && d.params.is_empty(), d.name_span))
            .collect();
        for (name, exportable, span) in &decl_names {
            if *exportable && !self.instantiated.contains(name) {
                self.instantiate_rule(name, &[], *span)?;
                self.drain()?;
            }
        }
        for (name, _, span) in &decl_names {
            if !self.instantiated.contains(name) {
                warn(BuildWarning {
                    kind: BuildWarningKind::UnusedRule(name.clone()),
                    span: *span,
                });
            }
        }

        // Token precedence lists, resolved now that every used token has a term.
        let mut token_precedences = Vec::new();
        for list in self.token_prec_decls.clone() {
            let mut out = Vec::new();
            for (name, span) in list {
                let key = if self.token_decls.contains_key(&name) {
                    name.clone()
                } else {
                    format!("lit{:?}", name)
                };
                match self.token_memo.get(&key) {
                    Some(&t) => out.push(t),
                    None => warn(BuildWarning {
                        kind: BuildWarningKind::PrecedenceForUnknownToken(name),
                        span,
                    }),
                }
            }
            token_precedences.push(out);
        }

        while self.inline_pass() {}
        while self.merge_pass() {}
        self.regroup();

        self.apply_punctuation();
        self.apply_tag_assigns()?;
        if self.tags_decl.detect_delim {
            self.detect_delim();
        }

        Ok(NormalGrammar {
            terms: self.terms,
            rules: self.rules,
            top_term: self.top_term,
            skips: self.skips,
            token_rules: self.token_decls,
            token_roots: self.token_roots,
            token_precedences,
            specializations: self.specializations,
            externals: self.externals,
            nested: self.nested,
        })
    }

    fn root_top_expr(&self) -> Option<Expr> {
        self.top_expr.clone()
    }

    fn drain(&mut self) -> Result<(), GrammarError> {
        while let Some((lhs, expr, skip)) = self.queue.pop_front() {
            let alts = self.norm_expr(&expr, &Env::default(), skip)?;
            for alt in alts {
                self.rules.push(Rule::new(lhs, alt.parts, alt.conflicts, skip));
            }
        }
        Ok(())
    }

    /// A fresh term whose name never shadows a declared rule: synthetic terms (inline tags,
    /// specializations) get a `%` prefix when their natural name is taken by a declaration.
    fn fresh_nonclashing(&mut self, base: &str, flags: u8) -> TermIdx {
        if self.decls.contains_key(base) || self.token_decls.contains_key(base) {
            self.terms.fresh(&format!("%{}", base), flags)
        } else {
            self.terms.fresh(base, flags)
        }
    }

    fn marker_spec(&self, markers: &[Marker]) -> Result<ConflictSpec, GrammarError> {
        let mut spec = ConflictSpec::empty();
        for m in markers {
            if m.ambig {
                if !spec.ambig.contains(&m.name) {
                    spec.ambig.push(m.name.clone());
                }
            } else {
                match self.prec_env.get(&m.name) {
                    Some(p) => {
                        if !spec.prec.contains(p) {
                            spec.prec.push(p.clone());
                        }
                        spec.cut |= p.cut;
                    }
                    None => {
                        return Err(GrammarError {
                            kind: GrammarErrorKind::UnknownPrecedence(m.name.clone()),
                            spans: vec![m.span],
                        })
                    }
                }
            }
        }
        Ok(spec)
    }

    fn norm_expr(
        &mut self,
        e: &Expr,
        env: &Env,
        skip: SkipIdx,
    ) -> Result<Vec<Alt>, GrammarError> {
        match e {
            Expr::Literal { value, .. } => {
                if value.is_empty() {
                    return Ok(vec![Alt::empty()]);
                }
                let t = self.token_term(e, value)?;
                Ok(vec![Alt::single(t)])
            }
            Expr::AnyChar { .. } => {
                let t = self.token_term(e, "%any")?;
                Ok(vec![Alt::single(t)])
            }
            Expr::Set { .. } => {
                let t = self.token_term(e, "%set")?;
                Ok(vec![Alt::single(t)])
            }
            Expr::Ref { .. } => self.resolve_ref(e, env, skip),
            Expr::Choice { exprs, .. } => {
                let mut out = Vec::new();
                for c in exprs {
                    out.extend(self.norm_expr(c, env, skip)?);
                }
                Ok(out)
            }
            Expr::Seq { exprs, markers, .. } => {
                let mut alts = vec![Alt::empty()];
                let spec0 = self.marker_spec(&markers[0])?;
                for alt in &mut alts {
                    alt.conflicts[0].merge(&spec0);
                }
                for (i, c) in exprs.iter().enumerate() {
                    let child = self.norm_expr(c, env, skip)?;
                    let mut next = Vec::with_capacity(alts.len() * child.len());
                    for a in &alts {
                        for ca in &child {
                            next.push(a.concat(ca));
                        }
                    }
                    alts = next;
                    let spec = self.marker_spec(&markers[i + 1])?;
                    if !spec.is_empty() {
                        for alt in &mut alts {
                            alt.conflicts.last_mut().unwrap().merge(&spec);
                        }
                    }
                }
                Ok(alts)
            }
            Expr::Repeat { expr, kind, .. } => {
                let inner = subst(expr, env)?;
                match kind {
                    RepeatKind::Optional => {
                        let mut out = vec![Alt::empty()];
                        out.extend(self.norm_expr(&inner, &Env::default(), skip)?);
                        Ok(out)
                    }
                    RepeatKind::ZeroOrMore => {
                        let t = self.build_repeat(&inner, false, skip)?;
                        Ok(vec![Alt::single(t)])
                    }
                    RepeatKind::OneOrMore => {
                        let t = self.build_repeat(&inner, true, skip)?;
                        Ok(vec![Alt::single(t)])
                    }
                }
            }
            Expr::Tagged { expr, tag, .. } => {
                let inner = subst(expr, env)?;
                let tag = self.resolve_tag(tag, env, e.span())?;
                let key = format!("{}#{}", inner.canon(), tag);
                if let Some(&t) = self.tagged_memo.get(&key) {
                    return Ok(vec![Alt::single(t)]);
                }
                let base = if tag.parts.is_empty() {
                    "%anon".to_string()
                } else {
                    tag.parts.join(".")
                };
                let t = self.fresh_nonclashing(&base, 0);
                self.terms.get_mut(t).tag = Some(tag);
                self.tagged_memo.insert(key, t);
                self.queue.push_back((t, inner, skip));
                Ok(vec![Alt::single(t)])
            }
            Expr::Specialize {
                token,
                value,
                extend,
                span,
            } => {
                let base_alts = self.norm_expr(token, env, skip)?;
                let base = match base_alts.as_slice() {
                    [a] if a.parts.len() == 1 && self.terms.is_terminal(a.parts[0]) => a.parts[0],
                    _ => {
                        return Err(GrammarError {
                            kind: GrammarErrorKind::InvalidArgShape(if *extend {
                                "@extend".to_string()
                            } else {
                                "@specialize".to_string()
                            }),
                            spans: vec![*span],
                        })
                    }
                };
                let key = (base.as_u32(), value.clone());
                if let Some(&si) = self.spec_memo.get(&key) {
                    let s = &self.specializations[si];
                    if s.extend != *extend {
                        return Err(GrammarError {
                            kind: GrammarErrorKind::SpecializeExtendClash(value.clone()),
                            spans: vec![*span],
                        });
                    }
                    return Ok(vec![Alt::single(s.term)]);
                }
                let t = self.fresh_nonclashing(value, TERMINAL);
                self.spec_memo.insert(key, self.specializations.len());
                self.specializations.push(Specialization {
                    base,
                    value: value.clone(),
                    term: t,
                    extend: *extend,
                });
                Ok(vec![Alt::single(t)])
            }
        }
    }

    /// Intern the terminal for a token-matched expression (literal, char set, token-rule use).
    fn token_term(&mut self, e: &Expr, name_hint: &str) -> Result<TermIdx, GrammarError> {
        let key = e.canon();
        if let Some(&t) = self.token_memo.get(&key) {
            return Ok(t);
        }
        let t = self.terms.fresh(name_hint, TERMINAL);
        self.token_memo.insert(key, t);
        if let Expr::Literal { value, .. } = e {
            self.literal_terms.insert(value.clone(), t);
        }
        self.token_roots.push((t, e.clone()));
        Ok(t)
    }

    fn resolve_ref(
        &mut self,
        e: &Expr,
        env: &Env,
        skip: SkipIdx,
    ) -> Result<Vec<Alt>, GrammarError> {
        let (space, name, args, span) = match e {
            Expr::Ref {
                space,
                name,
                args,
                span,
            } => (space, name, args, *span),
            _ => unreachable!(),
        };
        match space.as_deref() {
            Some("std") => {
                if !BUILTIN_TOKENS.contains(&name.as_str()) {
                    return Err(GrammarError {
                        kind: GrammarErrorKind::UnknownRule(format!("std.{}", name)),
                        spans: vec![span],
                    });
                }
                let t = self.token_term(e, &format!("std.{}", name))?;
                Ok(vec![Alt::single(t)])
            }
            Some("nest") => {
                if let Some(&t) = self.nested_memo.get(name) {
                    return Ok(vec![Alt::single(t)]);
                }
                let source = match self
                    .external_grammars
                    .iter()
                    .find(|g| g.name == *name || g.alias.as_deref() == Some(name))
                {
                    Some(g) => g.source.clone(),
                    None => {
                        return Err(GrammarError {
                            kind: GrammarErrorKind::UnknownExternalGrammar(name.clone()),
                            spans: vec![span],
                        })
                    }
                };
                let mut tag = None;
                let mut end_token = None;
                for a in args {
                    match a {
                        Expr::Ref {
                            space: Some(s),
                            name: tname,
                            ..
                        } if s == "tag" => tag = Some(Tag::from_name(tname)),
                        Expr::Literal { .. } => end_token = Some(subst(a, env)?),
                        _ => {
                            return Err(GrammarError {
                                kind: GrammarErrorKind::InvalidArgShape(format!(
                                    "nest.{}",
                                    name
                                )),
                                spans: vec![span],
                            })
                        }
                    }
                }
                let t = self.terms.fresh(&format!("%nest.{}", name), TERMINAL);
                self.nested_memo.insert(name.clone(), t);
                self.nested.push(NestedGrammar {
                    name: name.clone(),
                    source,
                    term: t,
                    end_token,
                    tag,
                });
                Ok(vec![Alt::single(t)])
            }
            Some("tag") => Err(GrammarError {
                kind: GrammarErrorKind::InvalidArgShape(format!(":{}", name)),
                spans: vec![span],
            }),
            Some(other) => Err(GrammarError {
                kind: GrammarErrorKind::UnknownNamespace(other.to_string()),
                spans: vec![span],
            }),
            None => {
                if let Some(bound) = env.get(name) {
                    if !args.is_empty() {
                        return Err(GrammarError {
                            kind: GrammarErrorKind::ArgsToParameter(name.clone()),
                            spans: vec![span],
                        });
                    }
                    let bound = bound.clone();
                    return self.norm_expr(&bound, &Env::default(), skip);
                }
                if self.decls.contains_key(name) {
                    let mut closed_args = Vec::with_capacity(args.len());
                    for a in args {
                        closed_args.push(subst(a, env)?);
                    }
                    let t = self.instantiate_rule(name, &closed_args, span)?;
                    return Ok(vec![Alt::single(t)]);
                }
                if self.token_decls.contains_key(name) {
                    let mut closed_args = Vec::with_capacity(args.len());
                    for a in args {
                        closed_args.push(subst(a, env)?);
                    }
                    let td = &self.token_decls[name];
                    if td.params.len() != closed_args.len() {
                        return Err(GrammarError {
                            kind: GrammarErrorKind::WrongArgCount {
                                name: name.clone(),
                                expected: td.params.len(),
                                got: closed_args.len(),
                            },
                            spans: vec![span],
                        });
                    }
                    let closed = Expr::Ref {
                        space: None,
                        name: name.clone(),
                        args: closed_args,
                        span,
                    };
                    let t = self.token_term(&closed, name)?;
                    return Ok(vec![Alt::single(t)]);
                }
                if let Some(ext_t) = self.external_token(name) {
                    return Ok(vec![Alt::single(ext_t)]);
                }
                Err(GrammarError {
                    kind: GrammarErrorKind::UnknownRule(name.clone()),
                    spans: vec![span],
                })
            }
        }
    }

    fn external_token(&self, name: &str) -> Option<TermIdx> {
        for e in &self.externals {
            for &t in &e.terms {
                if self.terms.name(t) == name {
                    return Some(t);
                }
            }
        }
        None
    }

    fn instantiate_rule(
        &mut self,
        name: &str,
        args: &[Expr],
        span: Span,
    ) -> Result<TermIdx, GrammarError> {
        let mut key = name.to_string();
        if !args.is_empty() {
            key.push('<');
            for a in args {
                key.push_str(&a.canon());
                key.push(',');
            }
            key.push('>');
        }
        if let Some(&t) = self.rule_memo.get(&key) {
            return Ok(t);
        }
        let (decl, decl_skip) = self
            .decls
            .get(name)
            .cloned()
            .ok_or_else(|| GrammarError {
                kind: GrammarErrorKind::UnknownRule(name.to_string()),
                spans: vec![span],
            })?;
        if decl.params.len() != args.len() {
            return Err(GrammarError {
                kind: GrammarErrorKind::WrongArgCount {
                    name: name.to_string(),
                    expected: decl.params.len(),
                    got: args.len(),
                },
                spans: vec![span],
            });
        }
        let t = if args.is_empty() {
            self.terms.intern(name, 0)
        } else {
            self.terms.fresh(name, 0)
        };
        self.rule_memo.insert(key, t);
        self.instantiated.insert(name.to_string());

        let mut env = Env::default();
        for (p, a) in decl.params.iter().zip(args.iter()) {
            env.insert(p.clone(), a.clone());
        }
        if let Some(tag) = &decl.tag {
            let tag = self.resolve_tag(tag, &env, decl.name_span)?;
            self.terms.get_mut(t).tag = Some(tag);
        }
        if decl.exported {
            self.terms.get_mut(t).flags |= PRESERVE;
        }
        let body = subst(&decl.expr, &env)?;
        self.queue.push_back((t, body, decl_skip));
        Ok(t)
    }

    /// Resolve `$param` interpolations within a tag against the parameter environment.
    fn resolve_tag(&self, tag: &Tag, env: &Env, span: Span) -> Result<Tag, GrammarError> {
        let mut parts = Vec::with_capacity(tag.parts.len());
        for p in &tag.parts {
            if let Some(param) = p.strip_prefix('$') {
                let bound = env.get(param).ok_or_else(|| GrammarError {
                    kind: GrammarErrorKind::UnknownRule(param.to_string()),
                    spans: vec![span],
                })?;
                parts.push(tag_segment(bound, span)?);
            } else {
                parts.push(p.clone());
            }
        }
        Ok(Tag {
            parts,
            props: tag.props.clone(),
        })
    }

    fn build_repeat(
        &mut self,
        inner_expr: &Expr,
        plus: bool,
        skip: SkipIdx,
    ) -> Result<TermIdx, GrammarError> {
        let key = inner_expr.canon();
        let inner_t = match self.repeat_inner_memo.get(&key) {
            Some(&t) => t,
            None => {
                let t = self.terms.fresh("%inner", REPEATED);
                self.repeat_inner_memo.insert(key.clone(), t);
                let alts = self.norm_expr(inner_expr, &Env::default(), skip)?;
                for alt in alts {
                    self.rules.push(Rule::new(t, alt.parts, alt.conflicts, skip));
                }
                // The right-recursive production. Its edge precedences force right-leaning
                // trees: the left edge is stronger, flows to the shift items through closure,
                // and ties resolve toward the shift via right-associativity.
                let group = self.terms.name(t).to_string();
                let mut c0 = ConflictSpec::empty();
                c0.prec.push(Precedence::new(&group, PREC_REPEAT, Assoc::Right));
                let mut c2 = ConflictSpec::empty();
                c2.prec
                    .push(Precedence::new(&group, PREC_REPEAT - 1, Assoc::Right));
                self.rules.push(Rule::new(
                    t,
                    vec![t, t],
                    vec![c0, ConflictSpec::empty(), c2],
                    skip,
                ));
                t
            }
        };
        let okey = (key, plus);
        if let Some(&o) = self.repeat_outer_memo.get(&okey) {
            return Ok(o);
        }
        let o = self.terms.fresh("%outer", REPEATED);
        self.repeat_outer_memo.insert(okey, o);
        if !plus {
            self.rules
                .push(Rule::new(o, Vec::new(), vec![ConflictSpec::empty()], skip));
        }
        self.rules.push(Rule::new(
            o,
            vec![inner_t],
            vec![ConflictSpec::empty(), ConflictSpec::empty()],
            skip,
        ));
        Ok(o)
    }

    /// One inlining scan. Returns true (and restarts) after the first successful inline.
    fn inline_pass(&mut self) -> bool {
        let mut prods_per_lhs: FnvHashMap<TermIdx, usize> = FnvHashMap::default();
        for r in &self.rules {
            *prods_per_lhs.entry(r.lhs).or_insert(0) += 1;
        }
        for idx in 0..self.rules.len() {
            let lhs = self.rules[idx].lhs;
            if prods_per_lhs[&lhs] != 1
                || lhs == self.top_term
                || self.protected.contains(&lhs)
                || self.terms.get(lhs).interesting()
                || self.terms.get(lhs).flags & PRESERVE != 0
            {
                continue;
            }
            let (parts_len, inline_skip) = {
                let r = &self.rules[idx];
                (r.parts.len(), r.skip)
            };
            if parts_len >= 3 || self.rules[idx].parts.contains(&lhs) {
                continue;
            }
            let occurrences: Vec<usize> = self
                .rules
                .iter()
                .enumerate()
                .filter(|(j, r)| *j != idx && r.parts.contains(&lhs))
                .map(|(j, _)| j)
                .collect();
            if occurrences.is_empty() {
                continue;
            }
            if parts_len != 1
                && !occurrences
                    .iter()
                    .all(|&j| self.rules[j].skip == inline_skip)
            {
                continue;
            }
            let inner = self.rules[idx].clone();
            for &j in &occurrences {
                let spliced = splice(&self.rules[j], &inner);
                self.rules[j] = spliced;
            }
            self.rules.remove(idx);
            return true;
        }
        false
    }

    /// One merging scan: unify non-interesting lhs terms with termwise-identical production
    /// sets, rewriting occurrences of the later one to the earlier.
    fn merge_pass(&mut self) -> bool {
        let mut groups: IndexMap<TermIdx, Vec<usize>> = IndexMap::new();
        for (i, r) in self.rules.iter().enumerate() {
            groups.entry(r.lhs).or_default().push(i);
        }
        let mergeable: Vec<TermIdx> = groups
            .keys()
            .copied()
            .filter(|&l| {
                l != self.top_term
                    && !self.protected.contains(&l)
                    && !self.terms.get(l).interesting()
                    && self.terms.get(l).flags & (PRESERVE | REPEATED) == 0
            })
            .collect();
        for (ai, &a) in mergeable.iter().enumerate() {
            for &b in &mergeable[ai + 1..] {
                let ra = &groups[&a];
                let rb = &groups[&b];
                if ra.len() != rb.len() {
                    continue;
                }
                let same = ra
                    .iter()
                    .zip(rb.iter())
                    .all(|(&i, &j)| self.rules[i].same_body_lax(&self.rules[j]));
                if !same {
                    continue;
                }
                // Unify b into a.
                let remove: Vec<usize> = rb.clone();
                let mut keep = Vec::with_capacity(self.rules.len());
                for (i, mut r) in self.rules.drain(..).enumerate() {
                    if remove.contains(&i) {
                        continue;
                    }
                    for p in &mut r.parts {
                        if *p == b {
                            *p = a;
                        }
                    }
                    keep.push(r);
                }
                self.rules = keep;
                return true;
            }
        }
        false
    }

    /// Restore same-lhs adjacency (in first-occurrence order) after the simplification passes.
    fn regroup(&mut self) {
        let mut groups: IndexMap<TermIdx, Vec<Rule>> = IndexMap::new();
        for r in self.rules.drain(..) {
            groups.entry(r.lhs).or_default().push(r);
        }
        self.rules = groups.into_values().flatten().collect();
    }

    fn apply_punctuation(&mut self) {
        for (chars, _) in self.tags_decl.punctuation.clone() {
            for c in chars.chars() {
                if let Some(&t) = self.literal_terms.get(&c.to_string()) {
                    if self.terms.get(t).tag.is_none() {
                        self.terms.get_mut(t).tag =
                            Some(Tag::from_name(&format!("punctuation.{}", punct_label(c))));
                    }
                }
            }
        }
    }

    fn apply_tag_assigns(&mut self) -> Result<(), GrammarError> {
        for (name, tag, span) in self.tags_decl.assigns.clone() {
            let t = self
                .terms
                .lookup(&name)
                .or_else(|| self.token_memo.get(&name).copied())
                .ok_or_else(|| GrammarError {
                    kind: GrammarErrorKind::UnknownRule(name.clone()),
                    spans: vec![span],
                })?;
            self.terms.get_mut(t).tag = Some(tag);
        }
        Ok(())
    }

    /// When a tagged rule's first and last parts are a matching bracket pair, append
    /// `delim="open close"` to its tag.
    fn detect_delim(&mut self) {
        let mut literal_of: FnvHashMap<TermIdx, String> = FnvHashMap::default();
        for (v, &t) in &self.literal_terms {
            literal_of.insert(t, v.clone());
        }
        let mut updates: Vec<(TermIdx, String, String)> = Vec::new();
        for r in &self.rules {
            if r.parts.len() < 2 || self.terms.get(r.lhs).tag.is_none() {
                continue;
            }
            let first = literal_of.get(&r.parts[0]);
            let last = literal_of.get(r.parts.last().unwrap());
            if let (Some(open), Some(close)) = (first, last) {
                if is_bracket_pair(open, close) {
                    updates.push((r.lhs, open.clone(), close.clone()));
                }
            }
        }
        for (t, open, close) in updates {
            let tag = self.terms.get_mut(t).tag.as_mut().unwrap();
            if !tag.props.iter().any(|(k, _)| k == "delim") {
                tag.props
                    .push(("delim".to_string(), format!("{} {}", open, close)));
            }
        }
    }
}

fn is_bracket_pair(open: &str, close: &str) -> bool {
    matches!(
        (open, close),
        ("(", ")") | ("[", "]") | ("{", "}") | ("<", ">")
    )
}

fn punct_label(c: char) -> String {
    match c {
        '(' => "paren.open".to_string(),
        ')' => "paren.close".to_string(),
        '[' => "squareBracket.open".to_string(),
        ']' => "squareBracket.close".to_string(),
        '{' => "brace.open".to_string(),
        '}' => "brace.close".to_string(),
        '<' => "angleBracket.open".to_string(),
        '>' => "angleBracket.close".to_string(),
        ',' | ';' => "separator".to_string(),
        c => format!("char.{}", c as u32),
    }
}

/// Render an argument expression to a literal tag segment for `$name` interpolation.
fn tag_segment(e: &Expr, span: Span) -> Result<String, GrammarError> {
    match e {
        Expr::Literal { value, .. } => Ok(value.clone()),
        Expr::Ref { name, args, .. } if args.is_empty() => Ok(name.clone()),
        _ => Err(GrammarError {
            kind: GrammarErrorKind::InvalidArgShape("$-interpolation".to_string()),
            spans: vec![span],
        }),
    }
}

/// Capture-free substitution of parameter bindings into an expression.
fn subst(e: &Expr, env: &Env) -> Result<Expr, GrammarError> {
    if env.is_empty() {
        return Ok(e.clone());
    }
    Ok(match e {
        Expr::Literal { .. } | Expr::AnyChar { .. } | Expr::Set { .. } => e.clone(),
        Expr::Ref {
            space,
            name,
            args,
            span,
        } => {
            if space.is_none() {
                if let Some(bound) = env.get(name) {
                    if !args.is_empty() {
                        return Err(GrammarError {
                            kind: GrammarErrorKind::ArgsToParameter(name.clone()),
                            spans: vec![*span],
                        });
                    }
                    return Ok(bound.clone());
                }
            }
            let mut new_args = Vec::with_capacity(args.len());
            for a in args {
                new_args.push(subst(a, env)?);
            }
            Expr::Ref {
                space: space.clone(),
                name: name.clone(),
                args: new_args,
                span: *span,
            }
        }
        Expr::Seq {
            exprs,
            markers,
            span,
        } => {
            let mut new = Vec::with_capacity(exprs.len());
            for x in exprs {
                new.push(subst(x, env)?);
            }
            Expr::Seq {
                exprs: new,
                markers: markers.clone(),
                span: *span,
            }
        }
        Expr::Choice { exprs, span } => {
            let mut new = Vec::with_capacity(exprs.len());
            for x in exprs {
                new.push(subst(x, env)?);
            }
            Expr::Choice {
                exprs: new,
                span: *span,
            }
        }
        Expr::Repeat { expr, kind, span } => Expr::Repeat {
            expr: Box::new(subst(expr, env)?),
            kind: *kind,
            span: *span,
        },
        Expr::Tagged { expr, tag, span } => {
            // `$param` segments in tags resolve during substitution, while the bindings are
            // still in scope.
            let mut parts = Vec::with_capacity(tag.parts.len());
            for p in &tag.parts {
                match p.strip_prefix('$').and_then(|param| env.get(param)) {
                    Some(bound) => parts.push(tag_segment(bound, *span)?),
                    None => parts.push(p.clone()),
                }
            }
            Expr::Tagged {
                expr: Box::new(subst(expr, env)?),
                tag: Tag {
                    parts,
                    props: tag.props.clone(),
                },
                span: *span,
            }
        }
        Expr::Specialize {
            token,
            value,
            extend,
            span,
        } => Expr::Specialize {
            token: Box::new(subst(token, env)?),
            value: value.clone(),
            extend: *extend,
            span: *span,
        },
    })
}

/// Substitute one occurrence-set of `inner.lhs` inside `outer`, merging conflict records at the
/// splice boundaries.
fn splice(outer: &Rule, inner: &Rule) -> Rule {
    let mut parts = Vec::new();
    let mut conflicts = vec![outer.conflicts[0].clone()];
    for (i, &p) in outer.parts.iter().enumerate() {
        if p == inner.lhs {
            conflicts.last_mut().unwrap().merge(&inner.conflicts[0]);
            for (k, &ip) in inner.parts.iter().enumerate() {
                parts.push(ip);
                conflicts.push(inner.conflicts[k + 1].clone());
            }
            conflicts.last_mut().unwrap().merge(&outer.conflicts[i + 1]);
        } else {
            parts.push(p);
            conflicts.push(outer.conflicts[i + 1].clone());
        }
    }
    Rule::new(outer.lhs, parts, conflicts, outer.skip)
}
