//! Thompson-style NFA construction from token-rule expressions. Edges are labeled with
//! inclusive ranges of UTF-16 code units; astral code points are lowered to surrogate-pair
//! transitions through auxiliary intermediate states at construction time.

use fnv::FnvHashMap;
use indexmap::IndexMap;

use cstgrammar::{
    ast::Expr,
    normalize::TokenRuleDef,
    TermIdx,
};

use crate::{LexBuildError, LexBuildResult, LexErrorKind, NfaIdx};

pub const MAX_UNIT: u16 = 0xFFFF;
const SURROGATE_LO: u32 = 0xD800;
const SURROGATE_HI: u32 = 0xDFFF;

#[derive(Clone, Debug, Default)]
pub struct NfaNode {
    pub edges: Vec<(u16, u16, NfaIdx)>,
    pub eps: Vec<NfaIdx>,
    pub accept: Vec<TermIdx>,
}

#[derive(Clone, Debug)]
pub struct Nfa {
    pub nodes: Vec<NfaNode>,
    pub start: NfaIdx,
}

impl Nfa {
    pub fn node(&self, i: NfaIdx) -> &NfaNode {
        &self.nodes[usize::from(i)]
    }
}

type Env = FnvHashMap<String, Expr>;

pub struct NfaBuilder<'a> {
    token_rules: &'a IndexMap<String, TokenRuleDef>,
    nodes: Vec<NfaNode>,
    /// Sub-start states memoized by `(rule, args, accept target)`; tail-recursive calls
    /// null-edge into these.
    call_memo: FnvHashMap<String, NfaIdx>,
    /// Active `(rule, args)` frames, for non-tail-recursion detection.
    building: Vec<String>,
}

impl<'a> NfaBuilder<'a> {
    pub fn new(token_rules: &'a IndexMap<String, TokenRuleDef>) -> Self {
        NfaBuilder {
            token_rules,
            nodes: Vec::new(),
            call_memo: FnvHashMap::default(),
            building: Vec::new(),
        }
    }

    fn node(&mut self) -> NfaIdx {
        let i = NfaIdx::from(self.nodes.len());
        self.nodes.push(NfaNode::default());
        i
    }

    fn eps(&mut self, from: NfaIdx, to: NfaIdx) {
        self.nodes[usize::from(from)].eps.push(to);
    }

    fn edge(&mut self, from: NfaIdx, lo: u16, hi: u16, to: NfaIdx) {
        self.nodes[usize::from(from)].edges.push((lo, hi, to));
    }

    /// Build one NFA whose start state fans out (by null edges) to every root token.
    pub fn build(&mut self, roots: &[(TermIdx, &Expr)]) -> LexBuildResult<Nfa> {
        self.nodes.clear();
        self.call_memo.clear();
        let start = self.node();
        for &(term, expr) in roots {
            let sub = self.node();
            let end = self.node();
            self.eps(start, sub);
            self.compile(expr, sub, end, &Env::default())?;
            self.nodes[usize::from(end)].accept.push(term);
        }
        Ok(Nfa {
            nodes: std::mem::take(&mut self.nodes),
            start,
        })
    }

    fn compile(
        &mut self,
        e: &Expr,
        from: NfaIdx,
        to: NfaIdx,
        env: &Env,
    ) -> LexBuildResult<()> {
        match e {
            Expr::Literal { value, .. } => {
                let mut units = Vec::new();
                for c in value.chars() {
                    let mut buf = [0u16; 2];
                    units.extend_from_slice(c.encode_utf16(&mut buf));
                }
                if units.is_empty() {
                    self.eps(from, to);
                    return Ok(());
                }
                let mut cur = from;
                for (i, &u) in units.iter().enumerate() {
                    let next = if i == units.len() - 1 { to } else { self.node() };
                    self.edge(cur, u, u, next);
                    cur = next;
                }
                Ok(())
            }
            Expr::AnyChar { .. } => {
                self.add_range(from, to, 0, 0x10FFFF);
                Ok(())
            }
            Expr::Set { ranges, .. } => {
                for &(lo, hi) in ranges {
                    self.add_range(from, to, lo, hi);
                }
                Ok(())
            }
            Expr::Seq { exprs, .. } => {
                if exprs.is_empty() {
                    self.eps(from, to);
                    return Ok(());
                }
                let mut cur = from;
                for (i, x) in exprs.iter().enumerate() {
                    let next = if i == exprs.len() - 1 { to } else { self.node() };
                    self.compile(x, cur, next, env)?;
                    cur = next;
                }
                Ok(())
            }
            Expr::Choice { exprs, .. } => {
                for x in exprs {
                    self.compile(x, from, to, env)?;
                }
                Ok(())
            }
            Expr::Repeat { expr, kind, .. } => {
                use cstgrammar::ast::RepeatKind::*;
                match kind {
                    Optional => {
                        self.eps(from, to);
                        self.compile(expr, from, to, env)
                    }
                    ZeroOrMore | OneOrMore => {
                        let a = self.node();
                        let b = self.node();
                        self.eps(from, a);
                        self.compile(expr, a, b, env)?;
                        self.eps(b, a);
                        self.eps(b, to);
                        if matches!(kind, ZeroOrMore) {
                            self.eps(from, to);
                        }
                        Ok(())
                    }
                }
            }
            Expr::Tagged { expr, .. } => self.compile(expr, from, to, env),
            Expr::Ref {
                space,
                name,
                args,
                span,
            } => match space.as_deref() {
                Some("std") => {
                    for &(lo, hi) in builtin_ranges(name).ok_or_else(|| LexBuildError {
                        kind: LexErrorKind::UnknownTokenRule(format!("std.{}", name)),
                        spans: vec![*span],
                    })? {
                        self.add_range(from, to, lo, hi);
                    }
                    Ok(())
                }
                Some(other) => Err(LexBuildError {
                    kind: LexErrorKind::InvalidTokenExpr(format!("Namespace '{}'", other)),
                    spans: vec![*span],
                }),
                None => {
                    if let Some(bound) = env.get(name) {
                        if !args.is_empty() {
                            return Err(LexBuildError {
                                kind: LexErrorKind::InvalidTokenExpr(format!(
                                    "Passing arguments to parameter '{}'",
                                    name
                                )),
                                spans: vec![*span],
                            });
                        }
                        let bound = bound.clone();
                        return self.compile(&bound, from, to, &Env::default());
                    }
                    self.rule_call(name, args, from, to, env, *span)
                }
            },
            Expr::Specialize { span, .. } => Err(LexBuildError {
                kind: LexErrorKind::InvalidTokenExpr("@specialize/@extend".to_string()),
                spans: vec![*span],
            }),
        }
    }

    fn rule_call(
        &mut self,
        name: &str,
        args: &[Expr],
        from: NfaIdx,
        to: NfaIdx,
        env: &Env,
        span: cstgrammar::Span,
    ) -> LexBuildResult<()> {
        let td = self.token_rules.get(name).ok_or_else(|| LexBuildError {
            kind: LexErrorKind::UnknownTokenRule(name.to_string()),
            spans: vec![span],
        })?;
        if td.params.len() != args.len() {
            return Err(LexBuildError {
                kind: LexErrorKind::WrongArgCount {
                    name: name.to_string(),
                    expected: td.params.len(),
                    got: args.len(),
                },
                spans: vec![span],
            });
        }
        // Close the arguments over the caller's environment so the callee's frame is
        // self-contained.
        let mut frame = name.to_string();
        let mut env2 = Env::default();
        for (p, a) in td.params.iter().zip(args.iter()) {
            let closed = close_expr(a, env);
            frame.push('<');
            frame.push_str(&closed.canon());
            frame.push('>');
            env2.insert(p.clone(), closed);
        }
        let key = format!("{}@{}", frame, usize::from(to));
        if let Some(&st) = self.call_memo.get(&key) {
            self.eps(from, st);
            return Ok(());
        }
        if self.building.contains(&frame) {
            let mut chain = self.building.clone();
            chain.push(frame);
            return Err(LexBuildError {
                kind: LexErrorKind::NonTailRecursion(chain),
                spans: vec![span],
            });
        }
        let st = self.node();
        self.call_memo.insert(key, st);
        self.building.push(frame);
        let body = td.expr.clone();
        self.compile(&body, st, to, &env2)?;
        self.building.pop();
        self.eps(from, st);
        Ok(())
    }

    /// Add edges for the inclusive code point range `lo..=hi`, excluding surrogates and
    /// lowering the astral part to surrogate pairs.
    fn add_range(&mut self, from: NfaIdx, to: NfaIdx, lo: u32, hi: u32) {
        // BMP part, split around the surrogate block.
        let bmp_hi = hi.min(0xFFFF);
        if lo <= bmp_hi {
            if lo < SURROGATE_LO {
                let h = bmp_hi.min(SURROGATE_LO - 1);
                self.edge(from, lo as u16, h as u16, to);
            }
            if bmp_hi > SURROGATE_HI {
                let l = lo.max(SURROGATE_HI + 1);
                self.edge(from, l as u16, bmp_hi as u16, to);
            }
        }
        // Astral part: pairs of (high surrogate, low surrogate) edges via a middle state.
        let alo = lo.max(0x10000);
        if alo > hi {
            return;
        }
        let (h1, l1) = surrogates(alo);
        let (h2, l2) = surrogates(hi);
        if h1 == h2 {
            let mid = self.node();
            self.edge(from, h1, h1, mid);
            self.edge(mid, l1, l2, to);
        } else {
            let first = self.node();
            self.edge(from, h1, h1, first);
            self.edge(first, l1, 0xDFFF, to);
            if h2 > h1 + 1 {
                let mid = self.node();
                self.edge(from, h1 + 1, h2 - 1, mid);
                self.edge(mid, 0xDC00, 0xDFFF, to);
            }
            let last = self.node();
            self.edge(from, h2, h2, last);
            self.edge(last, 0xDC00, l2, to);
        }
    }
}

/// Substitute the caller's parameter bindings into an argument expression, so the value can be
/// carried into the callee without its environment.
fn close_expr(e: &Expr, env: &Env) -> Expr {
    if env.is_empty() {
        return e.clone();
    }
    match e {
        Expr::Ref {
            space: None,
            name,
            args,
            ..
        } if args.is_empty() && env.contains_key(name) => env[name].clone(),
        Expr::Seq {
            exprs,
            markers,
            span,
        } => Expr::Seq {
            exprs: exprs.iter().map(|x| close_expr(x, env)).collect(),
            markers: markers.clone(),
            span: *span,
        },
        Expr::Choice { exprs, span } => Expr::Choice {
            exprs: exprs.iter().map(|x| close_expr(x, env)).collect(),
            span: *span,
        },
        Expr::Repeat { expr, kind, span } => Expr::Repeat {
            expr: Box::new(close_expr(expr, env)),
            kind: *kind,
            span: *span,
        },
        Expr::Tagged { expr, tag, span } => Expr::Tagged {
            expr: Box::new(close_expr(expr, env)),
            tag: tag.clone(),
            span: *span,
        },
        e => e.clone(),
    }
}

fn surrogates(cp: u32) -> (u16, u16) {
    debug_assert!((0x10000..=0x10FFFF).contains(&cp));
    let v = cp - 0x10000;
    (0xD800 + (v >> 10) as u16, 0xDC00 + (v & 0x3FF) as u16)
}

fn builtin_ranges(name: &str) -> Option<&'static [(u32, u32)]> {
    match name {
        "asciiLetter" => Some(&[(0x41, 0x5A), (0x61, 0x7A)]),
        "asciiLowercase" => Some(&[(0x61, 0x7A)]),
        "asciiUppercase" => Some(&[(0x41, 0x5A)]),
        "digit" => Some(&[(0x30, 0x39)]),
        "whitespace" => Some(&[
            (0x09, 0x0D),
            (0x20, 0x20),
            (0x85, 0x85),
            (0xA0, 0xA0),
            (0x1680, 0x1680),
            (0x2000, 0x200A),
            (0x2028, 0x2029),
            (0x202F, 0x202F),
            (0x205F, 0x205F),
            (0x3000, 0x3000),
        ]),
        "any" => Some(&[(0x0, 0x10FFFF)]),
        _ => None,
    }
}
