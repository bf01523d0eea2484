//! The recursive-descent parser for grammar files. It works over byte offsets into the source
//! (every offset is guaranteed to sit on a UTF-8 character boundary) and produces a
//! [GrammarRoot].

use lazy_static::lazy_static;
use regex::Regex;

use crate::{
    ast::{
        Expr, ExternalGrammarDecl, ExternalTokensDecl, GrammarRoot, Marker, PrecTerm, RepeatKind,
        RuleDecl, SkipDecl, Tag,
    },
    term::Assoc,
    GrammarError, GrammarErrorKind, Span,
};

lazy_static! {
    static ref RE_IDENT: Regex = Regex::new(r"^[\p{Alphabetic}_][\p{Alphabetic}0-9_\-]*").unwrap();
}

const MAX_CHAR: u32 = 0x10FFFF;

pub struct GrammarParser {
    src: String,
    ast: GrammarRoot,
}

impl GrammarParser {
    pub fn new(src: &str) -> Self {
        GrammarParser {
            src: src.to_string(),
            ast: GrammarRoot::default(),
        }
    }

    /// Parse the whole file, validate, and return the AST.
    pub fn parse(mut self) -> Result<GrammarRoot, GrammarError> {
        let mut i = self.parse_ws(0)?;
        while i < self.src.len() {
            i = self.parse_decl(i)?;
            i = self.parse_ws(i)?;
        }
        self.ast.validate()?;
        Ok(self.ast)
    }

    fn err(&self, kind: GrammarErrorKind, off: usize) -> GrammarError {
        let off = off.min(self.src.len());
        GrammarError {
            kind,
            spans: vec![Span::new(off, off)],
        }
    }

    fn peek(&self, i: usize) -> Option<char> {
        self.src[i..].chars().next()
    }

    fn lookahead_is(&self, s: &str, i: usize) -> Option<usize> {
        if self.src[i..].starts_with(s) {
            Some(i + s.len())
        } else {
            None
        }
    }

    /// Like [Self::lookahead_is], but only matches a whole word: `as` must not match `ask`.
    fn keyword_is(&self, s: &str, i: usize) -> Option<usize> {
        let j = self.lookahead_is(s, i)?;
        match self.peek(j) {
            Some(c) if c.is_alphanumeric() || c == '_' || c == '-' => None,
            _ => Some(j),
        }
    }

    /// Skip whitespace, `// ...` and `/* ... */` comments.
    fn parse_ws(&self, mut i: usize) -> Result<usize, GrammarError> {
        loop {
            let mut progressed = false;
            while let Some(c) = self.peek(i) {
                if c.is_whitespace() {
                    i += c.len_utf8();
                    progressed = true;
                } else {
                    break;
                }
            }
            if let Some(j) = self.lookahead_is("//", i) {
                i = self.src[j..].find('\n').map(|k| j + k).unwrap_or(self.src.len());
                progressed = true;
            } else if let Some(j) = self.lookahead_is("/*", i) {
                match self.src[j..].find("*/") {
                    Some(k) => i = j + k + 2,
                    None => return Err(self.err(GrammarErrorKind::UnterminatedComment, i)),
                }
                progressed = true;
            }
            if !progressed {
                return Ok(i);
            }
        }
    }

    fn parse_ident(&self, i: usize) -> Result<(usize, String, Span), GrammarError> {
        match RE_IDENT.find(&self.src[i..]) {
            Some(m) => {
                let span = Span::new(i + m.start(), i + m.end());
                Ok((i + m.end(), self.src[span.start()..span.end()].to_string(), span))
            }
            None => Err(self.err(GrammarErrorKind::ExpectedIdent, i)),
        }
    }

    fn expect(&self, c: char, i: usize) -> Result<usize, GrammarError> {
        match self.peek(i) {
            Some(x) if x == c => Ok(i + c.len_utf8()),
            _ => Err(self.err(GrammarErrorKind::Expected(c), i)),
        }
    }

    fn expect_ws(&self, c: char, i: usize) -> Result<usize, GrammarError> {
        let i = self.parse_ws(i)?;
        self.expect(c, i)
    }

    /// Parse a single- or double-quoted string literal with escapes.
    fn parse_string(&self, i: usize) -> Result<(usize, String, Span), GrammarError> {
        let quote = match self.peek(i) {
            Some(c @ ('"' | '\'')) => c,
            _ => return Err(self.err(GrammarErrorKind::Expected('"'), i)),
        };
        let start = i;
        let mut j = i + 1;
        let mut out = String::new();
        loop {
            match self.peek(j) {
                None | Some('\n') => {
                    return Err(self.err(GrammarErrorKind::UnterminatedString, start))
                }
                Some(c) if c == quote => {
                    return Ok((j + 1, out, Span::new(start, j + 1)));
                }
                Some('\\') => {
                    let (nj, c) = self.parse_escape(j)?;
                    j = nj;
                    out.push(c);
                }
                Some(c) => {
                    out.push(c);
                    j += c.len_utf8();
                }
            }
        }
    }

    /// Parse the escape sequence starting at the `\` at offset `i`; returns the offset after it
    /// and the character it denotes.
    fn parse_escape(&self, i: usize) -> Result<(usize, char), GrammarError> {
        let j = i + 1;
        let c = match self.peek(j) {
            Some(c) => c,
            None => return Err(self.err(GrammarErrorKind::InvalidEscape, i)),
        };
        match c {
            'n' => Ok((j + 1, '\n')),
            't' => Ok((j + 1, '\t')),
            'r' => Ok((j + 1, '\r')),
            'b' => Ok((j + 1, '\u{8}')),
            '0' => Ok((j + 1, '\0')),
            'x' => {
                let hex = self.src.get(j + 1..j + 3).ok_or_else(|| {
                    self.err(GrammarErrorKind::InvalidEscape, i)
                })?;
                let v = u32::from_str_radix(hex, 16)
                    .map_err(|_| self.err(GrammarErrorKind::InvalidEscape, i))?;
                Ok((j + 3, char::from_u32(v).unwrap()))
            }
            'u' => {
                if self.peek(j + 1) == Some('{') {
                    let close = self.src[j + 2..]
                        .find('}')
                        .ok_or_else(|| self.err(GrammarErrorKind::InvalidEscape, i))?;
                    let v = u32::from_str_radix(&self.src[j + 2..j + 2 + close], 16)
                        .map_err(|_| self.err(GrammarErrorKind::InvalidEscape, i))?;
                    let c = char::from_u32(v)
                        .ok_or_else(|| self.err(GrammarErrorKind::InvalidEscape, i))?;
                    Ok((j + 2 + close + 1, c))
                } else {
                    let hex = self.src.get(j + 1..j + 5).ok_or_else(|| {
                        self.err(GrammarErrorKind::InvalidEscape, i)
                    })?;
                    let v = u32::from_str_radix(hex, 16)
                        .map_err(|_| self.err(GrammarErrorKind::InvalidEscape, i))?;
                    let c = char::from_u32(v)
                        .ok_or_else(|| self.err(GrammarErrorKind::InvalidEscape, i))?;
                    Ok((j + 5, c))
                }
            }
            c => Ok((j + c.len_utf8(), c)),
        }
    }

    /// Parse a `[...]` character set into inclusive code point ranges, resolving `^` inversion.
    fn parse_charset(&self, i: usize) -> Result<(usize, Vec<(u32, u32)>, Span), GrammarError> {
        let start = i;
        let mut j = self.expect('[', i)?;
        let inverted = if self.peek(j) == Some('^') {
            j += 1;
            true
        } else {
            false
        };
        let mut ranges: Vec<(u32, u32)> = Vec::new();
        loop {
            let lo = match self.peek(j) {
                None => return Err(self.err(GrammarErrorKind::InvalidCharSet, start)),
                Some(']') => {
                    j += 1;
                    break;
                }
                Some('\\') => {
                    let (nj, c) = self.parse_escape(j)?;
                    j = nj;
                    c as u32
                }
                Some(c) => {
                    j += c.len_utf8();
                    c as u32
                }
            };
            // A `-` before `]` is a literal dash.
            if self.peek(j) == Some('-') && self.peek(j + 1) != Some(']') && self.peek(j + 1).is_some()
            {
                j += 1;
                let hi = match self.peek(j) {
                    Some('\\') => {
                        let (nj, c) = self.parse_escape(j)?;
                        j = nj;
                        c as u32
                    }
                    Some(c) => {
                        j += c.len_utf8();
                        c as u32
                    }
                    None => return Err(self.err(GrammarErrorKind::InvalidCharSet, start)),
                };
                if hi < lo {
                    return Err(self.err(GrammarErrorKind::InvalidCharSet, start));
                }
                ranges.push((lo, hi));
            } else {
                ranges.push((lo, lo));
            }
        }
        ranges.sort_unstable();
        let ranges = if inverted { invert_ranges(&ranges) } else { merge_ranges(&ranges) };
        Ok((j, ranges, Span::new(start, j)))
    }

    fn parse_decl(&mut self, i: usize) -> Result<usize, GrammarError> {
        if let Some(j) = self.lookahead_is("@", i) {
            let (j, kw, kw_span) = self.parse_ident(j)?;
            match kw.as_str() {
                "top" => self.parse_top(j, kw_span),
                "tokens" => self.parse_tokens(j),
                "precedence" => self.parse_precedence(j),
                "skip" => self.parse_skip(j, kw_span),
                "tags" => self.parse_tags(j),
                "external-tokens" => self.parse_external_tokens(j, kw_span),
                "external-grammar" => self.parse_external_grammar(j, kw_span),
                "export" => {
                    let (j, decl) = self.parse_rule_decl(i, true)?;
                    self.ast.rules.push(decl);
                    Ok(j)
                }
                _ => Err(GrammarError {
                    kind: GrammarErrorKind::UnknownDeclaration(kw),
                    spans: vec![kw_span],
                }),
            }
        } else {
            let (j, decl) = self.parse_rule_decl(i, false)?;
            self.ast.rules.push(decl);
            Ok(j)
        }
    }

    fn parse_top(&mut self, i: usize, kw_span: Span) -> Result<usize, GrammarError> {
        if self.ast.top.is_some() {
            return Err(GrammarError {
                kind: GrammarErrorKind::DuplicateTopDeclaration,
                spans: vec![kw_span],
            });
        }
        let i = self.expect_ws('{', i)?;
        let (i, expr) = self.parse_expr(i)?;
        let i = self.expect_ws('}', i)?;
        self.ast.top = Some((expr, kw_span));
        Ok(i)
    }

    fn parse_tokens(&mut self, i: usize) -> Result<usize, GrammarError> {
        let mut i = self.expect_ws('{', i)?;
        loop {
            i = self.parse_ws(i)?;
            if let Some(j) = self.lookahead_is("}", i) {
                return Ok(j);
            }
            if let Some(j) = self.lookahead_is("@precedence", i) {
                let mut j = self.expect_ws('{', j)?;
                let mut list = Vec::new();
                loop {
                    j = self.parse_ws(j)?;
                    if let Some(k) = self.lookahead_is("}", j) {
                        j = k;
                        break;
                    }
                    if matches!(self.peek(j), Some('"' | '\'')) {
                        let (k, v, sp) = self.parse_string(j)?;
                        list.push((v, sp));
                        j = k;
                    } else {
                        let (k, name, sp) = self.parse_ident(j)?;
                        list.push((name, sp));
                        j = k;
                    }
                    j = self.parse_ws(j)?;
                    if let Some(k) = self.lookahead_is(",", j) {
                        j = k;
                    }
                }
                self.ast.tokens.precedences.push(list);
                i = j;
                continue;
            }
            let (j, decl) = self.parse_rule_decl(i, false)?;
            self.ast.tokens.rules.push(decl);
            i = j;
        }
    }

    fn parse_precedence(&mut self, i: usize) -> Result<usize, GrammarError> {
        let mut i = self.expect_ws('{', i)?;
        let mut block = Vec::new();
        loop {
            i = self.parse_ws(i)?;
            if let Some(j) = self.lookahead_is("}", i) {
                i = j;
                break;
            }
            let (j, name, sp) = self.parse_ident(i)?;
            i = self.parse_ws(j)?;
            let mut assoc = Assoc::None;
            let mut cut = false;
            if let Some(j) = self.lookahead_is("@left", i) {
                assoc = Assoc::Left;
                i = j;
            } else if let Some(j) = self.lookahead_is("@right", i) {
                assoc = Assoc::Right;
                i = j;
            } else if let Some(j) = self.lookahead_is("@cut", i) {
                cut = true;
                i = j;
            }
            block.push(PrecTerm {
                name,
                assoc,
                cut,
                span: sp,
            });
            i = self.parse_ws(i)?;
            if let Some(j) = self.lookahead_is(",", i) {
                i = j;
            }
        }
        self.ast.precedences.push(block);
        Ok(i)
    }

    fn parse_skip(&mut self, i: usize, kw_span: Span) -> Result<usize, GrammarError> {
        let i = self.expect_ws('{', i)?;
        let (i, expr) = self.parse_expr(i)?;
        let mut i = self.expect_ws('}', i)?;
        let mut rules = Vec::new();
        let j = self.parse_ws(i)?;
        if self.peek(j) == Some('{') {
            i = j + 1;
            loop {
                i = self.parse_ws(i)?;
                if let Some(k) = self.lookahead_is("}", i) {
                    i = k;
                    break;
                }
                let exported = self.lookahead_is("@export", i).is_some();
                let (k, decl) = self.parse_rule_decl(i, exported)?;
                rules.push(decl);
                i = k;
            }
        }
        self.ast.skips.push(SkipDecl {
            expr,
            rules,
            span: kw_span,
        });
        Ok(i)
    }

    fn parse_tags(&mut self, i: usize) -> Result<usize, GrammarError> {
        let mut i = self.expect_ws('{', i)?;
        loop {
            i = self.parse_ws(i)?;
            if let Some(j) = self.lookahead_is("}", i) {
                return Ok(j);
            }
            if let Some(j) = self.lookahead_is(";", i).or_else(|| self.lookahead_is(",", i)) {
                i = j;
                continue;
            }
            if let Some(j) = self.lookahead_is("@export", i) {
                let j = self.parse_ws(j)?;
                let (j, name, sp) = self.parse_ident(j)?;
                let mut j = self.parse_ws(j)?;
                if let Some(k) = self.lookahead_is("=", j) {
                    j = self.parse_ws(k)?;
                }
                let (j, tag) = self.parse_tag(j)?;
                self.ast.tags.exports.push((name, tag, sp));
                i = j;
            } else if let Some(j) = self.lookahead_is("@punctuation", i) {
                let j = self.parse_ws(j)?;
                let (j, chars, sp) = self.parse_string(j)?;
                self.ast.tags.punctuation.push((chars, sp));
                i = j;
            } else if let Some(j) = self.lookahead_is("@detect-delim", i) {
                self.ast.tags.detect_delim = true;
                i = j;
            } else {
                let (j, name, sp) = self.parse_ident(i)?;
                let j = self.expect_ws('=', j)?;
                let j = self.parse_ws(j)?;
                let (j, tag) = self.parse_tag(j)?;
                self.ast.tags.assigns.push((name, tag, sp));
                i = j;
            }
        }
    }

    /// Parse `:part.part[ prop="v" ...]`. A part may be a `$param` interpolation, resolved by
    /// the normalizer during template instantiation.
    fn parse_tag(&self, i: usize) -> Result<(usize, Tag), GrammarError> {
        let i = self.expect(':', i)?;
        let (mut i, first) = self.parse_tag_part(i)?;
        let mut parts = vec![first];
        while self.peek(i) == Some('.') {
            let (j, part) = self.parse_tag_part(i + 1)?;
            parts.push(part);
            i = j;
        }
        let mut tag = Tag::new(parts);
        loop {
            let j = self.parse_ws(i)?;
            // `prop="value"` pairs directly after the tag.
            if RE_IDENT.is_match(&self.src[j..]) {
                let save = i;
                let (k, key, _) = self.parse_ident(j)?;
                if self.peek(k) == Some('=') {
                    let (k, v, _) = self.parse_string(k + 1)?;
                    tag.props.push((key, v));
                    i = k;
                    continue;
                }
                i = save;
            }
            break;
        }
        Ok((i, tag))
    }

    fn parse_tag_part(&self, i: usize) -> Result<(usize, String), GrammarError> {
        if self.peek(i) == Some('$') {
            let (j, name, _) = self.parse_ident(i + 1)?;
            Ok((j, format!("${}", name)))
        } else {
            let (j, name, _) = self.parse_ident(i)?;
            Ok((j, name))
        }
    }

    fn parse_external_tokens(&mut self, i: usize, kw_span: Span) -> Result<usize, GrammarError> {
        let i = self.parse_ws(i)?;
        let (i, name, _) = self.parse_ident(i)?;
        let i = self.parse_ws(i)?;
        let i = self
            .keyword_is("from", i)
            .ok_or_else(|| self.err(GrammarErrorKind::ExpectedIdent, i))?;
        let i = self.parse_ws(i)?;
        let (i, source, _) = self.parse_string(i)?;
        let mut i = self.expect_ws('{', i)?;
        let mut tokens = Vec::new();
        loop {
            i = self.parse_ws(i)?;
            if let Some(j) = self.lookahead_is("}", i) {
                i = j;
                break;
            }
            let (j, tname, tspan) = self.parse_ident(i)?;
            let j2 = self.parse_ws(j)?;
            let (j, tag) = if self.peek(j2) == Some('=') {
                let k = self.parse_ws(j2 + 1)?;
                let (k, tag) = self.parse_tag(k)?;
                (k, Some(tag))
            } else {
                (j, None)
            };
            tokens.push((tname, tag, tspan));
            i = self.parse_ws(j)?;
            if let Some(k) = self.lookahead_is(",", i) {
                i = k;
            }
        }
        self.ast.external_tokens.push(ExternalTokensDecl {
            name,
            source,
            tokens,
            span: kw_span,
        });
        Ok(i)
    }

    fn parse_external_grammar(&mut self, i: usize, kw_span: Span) -> Result<usize, GrammarError> {
        let i = self.parse_ws(i)?;
        let (mut i, name, _) = self.parse_ident(i)?;
        let mut alias = None;
        let mut source = None;
        let j = self.parse_ws(i)?;
        if let Some(k) = self.keyword_is("as", j) {
            let k2 = self.parse_ws(k)?;
            if self.peek(k2) == Some('{') {
                // `as { ... }` is a rule named "as", which would otherwise be swallowed here.
                return Err(GrammarError {
                    kind: GrammarErrorKind::ReservedAfterExternalGrammar("as".to_string()),
                    spans: vec![Span::new(j, k)],
                });
            }
            let (k2, a, _) = self.parse_ident(k2)?;
            alias = Some(a);
            i = k2;
        }
        let j = self.parse_ws(i)?;
        if let Some(k) = self.keyword_is("from", j) {
            let k2 = self.parse_ws(k)?;
            if self.peek(k2) == Some('{') {
                return Err(GrammarError {
                    kind: GrammarErrorKind::ReservedAfterExternalGrammar("from".to_string()),
                    spans: vec![Span::new(j, k)],
                });
            }
            let (k2, s, _) = self.parse_string(k2)?;
            source = Some(s);
            i = k2;
        }
        self.ast.external_grammars.push(ExternalGrammarDecl {
            name,
            alias,
            source,
            span: kw_span,
        });
        Ok(i)
    }

    /// Parse `[@export] Id[<params>] [= name] [[props]] { expr }`.
    fn parse_rule_decl(
        &mut self,
        i: usize,
        exported: bool,
    ) -> Result<(usize, RuleDecl), GrammarError> {
        let start = i;
        let mut i = i;
        if exported {
            i = self
                .lookahead_is("@export", i)
                .ok_or_else(|| self.err(GrammarErrorKind::ExpectedIdent, i))?;
            i = self.parse_ws(i)?;
        }
        let (mut i, name, name_span) = self.parse_ident(i)?;
        let mut params = Vec::new();
        if self.peek(i) == Some('<') {
            let mut j = i + 1;
            loop {
                j = self.parse_ws(j)?;
                let (k, p, _) = self.parse_ident(j)?;
                params.push(p);
                j = self.parse_ws(k)?;
                if let Some(k) = self.lookahead_is(",", j) {
                    j = k;
                    continue;
                }
                j = self.expect('>', j)?;
                break;
            }
            i = j;
        }
        let mut tag = None;
        let j = self.parse_ws(i)?;
        if self.peek(j) == Some('=') {
            let k = self.parse_ws(j + 1)?;
            if self.peek(k) == Some(':') {
                let (k, t) = self.parse_tag(k)?;
                tag = Some(t);
                i = k;
            } else {
                let (mut k, tname, _) = self.parse_ident(k)?;
                let mut parts = vec![tname];
                while self.peek(k) == Some('.') {
                    let (k2, part, _) = self.parse_ident(k + 1)?;
                    parts.push(part);
                    k = k2;
                }
                tag = Some(Tag::new(parts));
                i = k;
            }
        }
        let j = self.parse_ws(i)?;
        if self.peek(j) == Some('[') {
            let mut t = tag.take().unwrap_or_else(|| Tag::from_name(&name));
            let mut k = j + 1;
            loop {
                k = self.parse_ws(k)?;
                if let Some(k2) = self.lookahead_is("]", k) {
                    k = k2;
                    break;
                }
                let (k2, key, _) = self.parse_ident(k)?;
                let k2 = self.expect_ws('=', k2)?;
                let k2 = self.parse_ws(k2)?;
                let (k2, v, _) = self.parse_string(k2)?;
                t.props.push((key, v));
                k = self.parse_ws(k2)?;
                if let Some(k2) = self.lookahead_is(",", k) {
                    k = k2;
                }
            }
            tag = Some(t);
            i = k;
        }
        let i = self.expect_ws('{', i)?;
        let (i, expr) = self.parse_expr(i)?;
        let i = self.expect_ws('}', i)?;
        Ok((
            i,
            RuleDecl {
                exported,
                name,
                name_span,
                params,
                tag,
                expr,
                span: Span::new(start, i),
            },
        ))
    }

    pub(crate) fn parse_expr(&self, i: usize) -> Result<(usize, Expr), GrammarError> {
        let start = self.parse_ws(i)?;
        let (mut i, first) = self.parse_seq(start)?;
        let mut alts = vec![first];
        loop {
            let j = self.parse_ws(i)?;
            if let Some(k) = self.lookahead_is("|", j) {
                let (k, next) = self.parse_seq(k)?;
                alts.push(next);
                i = k;
            } else {
                break;
            }
        }
        if alts.len() == 1 {
            Ok((i, alts.pop().unwrap()))
        } else {
            Ok((
                i,
                Expr::Choice {
                    exprs: alts,
                    span: Span::new(start, i),
                },
            ))
        }
    }

    fn parse_seq(&self, i: usize) -> Result<(usize, Expr), GrammarError> {
        let start = self.parse_ws(i)?;
        let mut i = start;
        let mut exprs: Vec<Expr> = Vec::new();
        let mut markers: Vec<Vec<Marker>> = vec![Vec::new()];
        loop {
            i = self.parse_ws(i)?;
            match self.peek(i) {
                Some(c @ ('~' | '!')) => {
                    let (j, name, sp) = self.parse_ident(i + 1)?;
                    markers.last_mut().unwrap().push(Marker {
                        ambig: c == '~',
                        name,
                        span: sp,
                    });
                    i = j;
                }
                Some(c) if self.starts_atom(c, i) => {
                    let (j, e) = self.parse_labeled(i)?;
                    exprs.push(e);
                    markers.push(Vec::new());
                    i = j;
                }
                _ => break,
            }
        }
        if exprs.is_empty() {
            // An empty sequence: epsilon.
            return Ok((
                i,
                Expr::Seq {
                    exprs,
                    markers,
                    span: Span::new(start, i),
                },
            ));
        }
        if exprs.len() == 1 && markers.iter().all(|m| m.is_empty()) {
            return Ok((i, exprs.pop().unwrap()));
        }
        Ok((
            i,
            Expr::Seq {
                exprs,
                markers,
                span: Span::new(start, i),
            },
        ))
    }

    fn starts_atom(&self, c: char, i: usize) -> bool {
        match c {
            '"' | '\'' | '[' | '_' | '(' | ':' => true,
            '@' => {
                self.lookahead_is("@specialize", i).is_some()
                    || self.lookahead_is("@extend", i).is_some()
            }
            c => c.is_alphabetic(),
        }
    }

    /// An atom with postfix repetition and optional `= name` inline naming.
    fn parse_labeled(&self, i: usize) -> Result<(usize, Expr), GrammarError> {
        let (mut i, mut e) = self.parse_postfix(i)?;
        let j = self.parse_ws(i)?;
        if self.peek(j) == Some('=') && self.peek(j + 1) != Some(':') {
            // Distinguish inline naming from `@tags`-style assignments, which never occur here.
            let k = self.parse_ws(j + 1)?;
            if let Ok((k, name, _)) = self.parse_ident(k) {
                let span = Span::new(e.span().start(), k);
                e = Expr::Tagged {
                    expr: Box::new(e),
                    tag: Tag::from_name(&name),
                    span,
                };
                i = k;
            }
        }
        Ok((i, e))
    }

    fn parse_postfix(&self, i: usize) -> Result<(usize, Expr), GrammarError> {
        let (mut i, mut e) = self.parse_atom(i)?;
        loop {
            let kind = match self.peek(i) {
                Some('*') => RepeatKind::ZeroOrMore,
                Some('+') => RepeatKind::OneOrMore,
                Some('?') => RepeatKind::Optional,
                _ => break,
            };
            let span = Span::new(e.span().start(), i + 1);
            e = Expr::Repeat {
                expr: Box::new(e),
                kind,
                span,
            };
            i += 1;
        }
        Ok((i, e))
    }

    fn parse_atom(&self, i: usize) -> Result<(usize, Expr), GrammarError> {
        match self.peek(i) {
            Some('"' | '\'') => {
                let (j, value, span) = self.parse_string(i)?;
                Ok((j, Expr::Literal { value, span }))
            }
            Some('[') => {
                let (j, ranges, span) = self.parse_charset(i)?;
                Ok((j, Expr::Set { ranges, span }))
            }
            Some('_') => Ok((
                i + 1,
                Expr::AnyChar {
                    span: Span::new(i, i + 1),
                },
            )),
            Some('(') => {
                let (j, e) = self.parse_expr(i + 1)?;
                let j = self.expect_ws(')', j)?;
                Ok((j, e))
            }
            Some(':') => {
                // A bare tag atom, used in argument position (e.g. `nest.js<:block, "}">`).
                let (j, tag) = self.parse_tag(i)?;
                Ok((
                    j,
                    Expr::Ref {
                        space: Some("tag".to_string()),
                        name: tag.parts.join("."),
                        args: Vec::new(),
                        span: Span::new(i, j),
                    },
                ))
            }
            Some('@') => {
                let extend = if self.lookahead_is("@specialize", i).is_some() {
                    false
                } else if self.lookahead_is("@extend", i).is_some() {
                    true
                } else {
                    return Err(self.err(
                        GrammarErrorKind::UnexpectedToken(self.token_at(i)),
                        i,
                    ));
                };
                let j = i + if extend { "@extend".len() } else { "@specialize".len() };
                let j = self.expect_ws('<', j)?;
                let (j, token) = self.parse_expr(j)?;
                let j = self.expect_ws(',', j)?;
                let j = self.parse_ws(j)?;
                let (j, value, _) = self.parse_string(j)?;
                let j = self.expect_ws('>', j)?;
                Ok((
                    j,
                    Expr::Specialize {
                        token: Box::new(token),
                        value,
                        extend,
                        span: Span::new(i, j),
                    },
                ))
            }
            Some(c) if c.is_alphabetic() => {
                let (mut j, mut name, _) = self.parse_ident(i)?;
                let mut space = None;
                if self.peek(j) == Some('.') {
                    let (k, name2, _) = self.parse_ident(j + 1)?;
                    space = Some(name);
                    name = name2;
                    j = k;
                }
                let mut args = Vec::new();
                if self.peek(j) == Some('<') {
                    let mut k = j + 1;
                    loop {
                        let (k2, a) = self.parse_expr(k)?;
                        args.push(a);
                        let k2 = self.parse_ws(k2)?;
                        if let Some(k3) = self.lookahead_is(",", k2) {
                            k = k3;
                            continue;
                        }
                        k = self.expect('>', k2)?;
                        break;
                    }
                    j = k;
                }
                if name == "tagged" && space.is_none() && args.is_empty() && self.peek(j) == Some('(')
                {
                    let (k, inner) = self.parse_expr(j + 1)?;
                    let k = self.expect_ws(')', k)?;
                    return Ok((
                        k,
                        Expr::Tagged {
                            expr: Box::new(inner),
                            tag: Tag::new(Vec::new()),
                            span: Span::new(i, k),
                        },
                    ));
                }
                Ok((
                    j,
                    Expr::Ref {
                        space,
                        name,
                        args,
                        span: Span::new(i, j),
                    },
                ))
            }
            _ => Err(self.err(GrammarErrorKind::UnexpectedToken(self.token_at(i)), i)),
        }
    }

    fn token_at(&self, i: usize) -> String {
        match self.peek(i) {
            Some(c) => c.to_string(),
            None => "<eof>".to_string(),
        }
    }
}

/// Merge overlapping/adjacent sorted inclusive ranges.
fn merge_ranges(ranges: &[(u32, u32)]) -> Vec<(u32, u32)> {
    let mut out: Vec<(u32, u32)> = Vec::new();
    for &(lo, hi) in ranges {
        match out.last_mut() {
            Some(last) if lo <= last.1.saturating_add(1) => last.1 = last.1.max(hi),
            _ => out.push((lo, hi)),
        }
    }
    out
}

/// Complement sorted inclusive ranges over `0..=MAX_CHAR`.
fn invert_ranges(ranges: &[(u32, u32)]) -> Vec<(u32, u32)> {
    let merged = merge_ranges(ranges);
    let mut out = Vec::new();
    let mut next = 0u32;
    for &(lo, hi) in &merged {
        if lo > next {
            out.push((next, lo - 1));
        }
        next = hi + 1;
    }
    if next <= MAX_CHAR {
        out.push((next, MAX_CHAR));
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ast::Expr;

    fn parse(src: &str) -> GrammarRoot {
        GrammarParser::new(src).parse().unwrap()
    }

    fn parse_err(src: &str) -> GrammarError {
        GrammarParser::new(src).parse().unwrap_err()
    }

    #[test]
    fn minimal_grammar() {
        let ast = parse("@top { \"x\" }");
        assert!(ast.top.is_some());
        match &ast.top.as_ref().unwrap().0 {
            Expr::Literal { value, .. } => assert_eq!(value, "x"),
            e => panic!("unexpected expr {:?}", e),
        }
    }

    #[test]
    fn comments_skipped() {
        let ast = parse("// line\n/* block\nmore */ @top { A } A { \"a\" }");
        assert!(ast.top.is_some());
        assert_eq!(ast.rules.len(), 1);
    }

    #[test]
    fn missing_top() {
        match parse_err("A { \"a\" }").kind {
            GrammarErrorKind::MissingTop => (),
            k => panic!("unexpected error {:?}", k),
        }
    }

    #[test]
    fn unterminated_string() {
        match parse_err("@top { \"x }").kind {
            GrammarErrorKind::UnterminatedString => (),
            k => panic!("unexpected error {:?}", k),
        }
    }

    #[test]
    fn unterminated_comment() {
        match parse_err("/* oops").kind {
            GrammarErrorKind::UnterminatedComment => (),
            k => panic!("unexpected error {:?}", k),
        }
    }

    #[test]
    fn choice_and_seq() {
        let ast = parse("@top { A } A { \"a\" \"b\" | \"c\" }");
        match &ast.rules[0].expr {
            Expr::Choice { exprs, .. } => {
                assert_eq!(exprs.len(), 2);
                assert!(matches!(exprs[0], Expr::Seq { .. }));
            }
            e => panic!("unexpected expr {:?}", e),
        }
    }

    #[test]
    fn conflict_markers_positions() {
        let ast = parse("@precedence { p } @top { A } A { \"a\" !p \"b\" ~x }");
        match &ast.rules[0].expr {
            Expr::Seq { exprs, markers, .. } => {
                assert_eq!(exprs.len(), 2);
                assert_eq!(markers.len(), 3);
                assert!(markers[0].is_empty());
                assert_eq!(markers[1].len(), 1);
                assert!(!markers[1][0].ambig);
                assert_eq!(markers[1][0].name, "p");
                assert_eq!(markers[2].len(), 1);
                assert!(markers[2][0].ambig);
            }
            e => panic!("unexpected expr {:?}", e),
        }
    }

    #[test]
    fn repeats_bind_tight() {
        let ast = parse("@top { A } A { \"a\"* \"b\"? }");
        match &ast.rules[0].expr {
            Expr::Seq { exprs, .. } => {
                assert!(matches!(
                    exprs[0],
                    Expr::Repeat {
                        kind: RepeatKind::ZeroOrMore,
                        ..
                    }
                ));
                assert!(matches!(
                    exprs[1],
                    Expr::Repeat {
                        kind: RepeatKind::Optional,
                        ..
                    }
                ));
            }
            e => panic!("unexpected expr {:?}", e),
        }
    }

    #[test]
    fn charset_ranges_and_inversion() {
        let ast = parse("@top { A } A { [a-cx] }");
        match &ast.rules[0].expr {
            Expr::Set { ranges, .. } => {
                assert_eq!(ranges, &vec![('a' as u32, 'c' as u32), ('x' as u32, 'x' as u32)]);
            }
            e => panic!("unexpected expr {:?}", e),
        }
        let ast = parse("@top { A } A { [^\\u0000-\\u007f] }");
        match &ast.rules[0].expr {
            Expr::Set { ranges, .. } => {
                assert_eq!(ranges, &vec![(0x80, 0x10FFFF)]);
            }
            e => panic!("unexpected expr {:?}", e),
        }
    }

    #[test]
    fn string_escapes() {
        let ast = parse("@top { A } A { \"a\\n\\t\\u{1F600}\\x41\\\\\" }");
        match &ast.rules[0].expr {
            Expr::Literal { value, .. } => assert_eq!(value, "a\n\t\u{1F600}A\\"),
            e => panic!("unexpected expr {:?}", e),
        }
    }

    #[test]
    fn tokens_block_with_precedence() {
        let ast = parse(
            "@top { num } @tokens { num { [0-9]+ } sp { \" \" } @precedence { num, sp } }",
        );
        assert_eq!(ast.tokens.rules.len(), 2);
        assert_eq!(ast.tokens.precedences.len(), 1);
        assert_eq!(ast.tokens.precedences[0][0].0, "num");
    }

    #[test]
    fn precedence_block() {
        let ast = parse("@precedence { times @left, plus @left, neg, c @cut } @top { \"x\" }");
        let blk = &ast.precedences[0];
        assert_eq!(blk.len(), 4);
        assert_eq!(blk[0].name, "times");
        assert_eq!(blk[0].assoc, Assoc::Left);
        assert!(blk[3].cut);
    }

    #[test]
    fn skip_scoped() {
        let ast = parse("@top { A } @skip { \" \" } @skip { \"\\t\" } { A { \"a\" } }");
        assert_eq!(ast.skips.len(), 2);
        assert!(ast.skips[0].rules.is_empty());
        assert_eq!(ast.skips[1].rules.len(), 1);
    }

    #[test]
    fn specialize_expr() {
        let ast = parse("@top { @specialize<id, \"if\"> } @tokens { id { [a-z]+ } }");
        match &ast.top.as_ref().unwrap().0 {
            Expr::Specialize { value, extend, .. } => {
                assert_eq!(value, "if");
                assert!(!extend);
            }
            e => panic!("unexpected expr {:?}", e),
        }
    }

    #[test]
    fn external_declarations() {
        let ast = parse(
            "@top { x } @external-tokens tok from \"./tok\" { x = :x.y, y } \
             @external-grammar js as javascript from \"./js\"",
        );
        assert_eq!(ast.external_tokens.len(), 1);
        assert_eq!(ast.external_tokens[0].tokens.len(), 2);
        let eg = &ast.external_grammars[0];
        assert_eq!(eg.name, "js");
        assert_eq!(eg.alias.as_deref(), Some("javascript"));
        assert_eq!(eg.source.as_deref(), Some("./js"));
    }

    #[test]
    fn external_grammar_reserved_followers() {
        match parse_err("@top { x } @external-grammar js\nas { \"a\" }").kind {
            GrammarErrorKind::ReservedAfterExternalGrammar(n) => assert_eq!(n, "as"),
            k => panic!("unexpected error {:?}", k),
        }
        // Only the whole words are reserved: a rule named `ask` parses normally.
        let ast = parse("@top { ask } @external-grammar js from \"./js\"\nask { \"a\" }");
        assert!(ast.get_rule("ask").is_some());
        assert!(ast.external_grammars[0].alias.is_none());
    }

    #[test]
    fn nest_reference() {
        let ast = parse("@top { nest.js<:block, \"}\"> } @external-grammar js from \"./js\"");
        match &ast.top.as_ref().unwrap().0 {
            Expr::Ref {
                space, name, args, ..
            } => {
                assert_eq!(space.as_deref(), Some("nest"));
                assert_eq!(name, "js");
                assert_eq!(args.len(), 2);
            }
            e => panic!("unexpected expr {:?}", e),
        }
    }

    #[test]
    fn tags_block() {
        let ast = parse(
            "@top { A } A { \"a\" } @tags { A = :expr.atom; @export lit :literal; \
             @punctuation \"()\"; @detect-delim }",
        );
        assert_eq!(ast.tags.assigns.len(), 1);
        assert_eq!(ast.tags.assigns[0].1.parts, vec!["expr", "atom"]);
        assert_eq!(ast.tags.exports.len(), 1);
        assert!(ast.tags.detect_delim);
    }

    #[test]
    fn duplicate_rule_rejected() {
        match parse_err("@top { A } A { \"a\" } A { \"b\" }").kind {
            GrammarErrorKind::DuplicateRule(n) => assert_eq!(n, "A"),
            k => panic!("unexpected error {:?}", k),
        }
    }

    #[test]
    fn rule_with_params_and_tag() {
        let ast = parse("@top { A } A { commaSep<\"a\"> } commaSep<x> { x (\",\" x)* }");
        let decl = ast.get_rule("commaSep").unwrap();
        assert_eq!(decl.params, vec!["x"]);
        let ast = parse("@top { A } A = cool.tag { \"a\" }");
        assert_eq!(
            ast.get_rule("A").unwrap().tag.as_ref().unwrap().parts,
            vec!["cool", "tag"]
        );
    }
}
