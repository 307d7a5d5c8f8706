/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Revset evaluation.
//!
//! The implicit universe is the *visible* part of the changelog: hidden
//! revs never appear in results and cannot be named (naming one is an
//! unknown-revision error, matching how obsolete changesets behave).
//! Callers that really need hidden revs evaluate against an unfiltered
//! context instead.

use dag::Dag;
use dag::ParentSource;
use types::Rev;

use crate::parser::Expr;
use crate::RevsetError;

/// What evaluation needs from the repository.
pub trait RevsetContext {
    fn num_revs(&self) -> usize;

    fn parent_revs(&self, rev: Rev) -> [Rev; 2];

    fn is_hidden(&self, rev: Rev) -> bool;

    /// Resolve a symbol: bookmark, node hex prefix, `tip`, `.`.
    /// Numeric rev strings are handled by the evaluator.
    fn lookup(&self, symbol: &str) -> Result<Option<Rev>, RevsetError>;

    fn author(&self, rev: Rev) -> Result<String, RevsetError>;

    fn description(&self, rev: Rev) -> Result<String, RevsetError>;

    /// Commit date as UTC seconds.
    fn date(&self, rev: Rev) -> Result<i64, RevsetError>;
}

/// An evaluated revset: a restartable, topologically ordered sequence
/// of revs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revset {
    revs: Vec<Rev>,
}

impl Revset {
    pub fn iter(&self) -> impl Iterator<Item = Rev> + '_ {
        self.revs.iter().copied()
    }

    pub fn contains(&self, rev: Rev) -> bool {
        self.revs.binary_search(&rev).is_ok()
    }

    pub fn len(&self) -> usize {
        self.revs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revs.is_empty()
    }

    pub fn first(&self) -> Option<Rev> {
        self.revs.first().copied()
    }

    pub fn last(&self) -> Option<Rev> {
        self.revs.last().copied()
    }

    pub fn into_vec(self) -> Vec<Rev> {
        self.revs
    }

    pub fn as_slice(&self) -> &[Rev] {
        &self.revs
    }
}

struct ContextSource<'a, C: RevsetContext + ?Sized>(&'a C);

impl<'a, C: RevsetContext + ?Sized> ParentSource for ContextSource<'a, C> {
    fn num_revs(&self) -> usize {
        self.0.num_revs()
    }

    fn parent_revs(&self, rev: Rev) -> [Rev; 2] {
        self.0.parent_revs(rev)
    }
}

/// Evaluate an expression against a context.
pub fn evaluate<C: RevsetContext + ?Sized>(
    ctx: &C,
    expr: &Expr,
) -> Result<Revset, RevsetError> {
    let source = ContextSource(ctx);
    let eval = Evaluator { ctx, source };
    Ok(Revset {
        revs: eval.eval(expr)?,
    })
}

struct Evaluator<'a, C: RevsetContext + ?Sized> {
    ctx: &'a C,
    source: ContextSource<'a, C>,
}

impl<'a, C: RevsetContext + ?Sized> Evaluator<'a, C> {
    fn dag(&self) -> Dag<'_, ContextSource<'a, C>> {
        Dag::new(&self.source)
    }

    fn visible(&self) -> Vec<Rev> {
        (0..self.ctx.num_revs() as Rev)
            .filter(|&rev| !self.ctx.is_hidden(rev))
            .collect()
    }

    fn filter_visible(&self, revs: Vec<Rev>) -> Vec<Rev> {
        revs.into_iter()
            .filter(|&rev| !self.ctx.is_hidden(rev))
            .collect()
    }

    fn eval(&self, expr: &Expr) -> Result<Vec<Rev>, RevsetError> {
        match expr {
            Expr::Symbol(name) | Expr::String(name) => {
                let rev = self.resolve(name)?;
                Ok(vec![rev])
            }
            Expr::Range(lhs, rhs) => {
                let lower = match lhs {
                    Some(expr) => self.eval(expr)?,
                    None => self.dag().roots(&self.visible())?,
                };
                let upper = match rhs {
                    Some(expr) => self.eval(expr)?,
                    None => self.dag().heads(&self.visible())?,
                };
                Ok(self.filter_visible(self.dag().range(&lower, &upper)?))
            }
            Expr::Union(a, b) => Ok(union_sorted(&self.eval(a)?, &self.eval(b)?)),
            Expr::Difference(a, b) => Ok(diff_sorted(&self.eval(a)?, &self.eval(b)?)),
            Expr::Intersection(a, b) => {
                Ok(intersect_sorted(&self.eval(a)?, &self.eval(b)?))
            }
            Expr::Not(e) => Ok(diff_sorted(&self.visible(), &self.eval(e)?)),
            Expr::Call(name, args) => self.eval_call(name, args),
        }
    }

    fn eval_call(&self, name: &str, args: &[Expr]) -> Result<Vec<Rev>, RevsetError> {
        match name {
            "all" => {
                check_arity("all", args, 0)?;
                Ok(self.visible())
            }
            "heads" => {
                check_arity("heads", args, 0)?;
                self.dag().heads(&self.visible()).map_err(Into::into)
            }
            "roots" => {
                check_arity("roots", args, 1)?;
                let set = self.eval(&args[0])?;
                self.dag().roots(&set).map_err(Into::into)
            }
            "ancestors" => {
                check_arity("ancestors", args, 1)?;
                let set = self.eval(&args[0])?;
                Ok(self.filter_visible(self.dag().ancestors(&set)?))
            }
            "descendants" => {
                check_arity("descendants", args, 1)?;
                let set = self.eval(&args[0])?;
                Ok(self.filter_visible(self.dag().descendants(&set)?))
            }
            "parents" => {
                check_arity("parents", args, 1)?;
                let set = self.eval(&args[0])?;
                let mut out = Vec::new();
                for rev in set {
                    for parent in self.ctx.parent_revs(rev) {
                        if parent != types::NULL_REV && !self.ctx.is_hidden(parent) {
                            out.push(parent);
                        }
                    }
                }
                out.sort_unstable();
                out.dedup();
                Ok(out)
            }
            "author" => {
                let pattern = string_arg("author", args)?;
                self.scan(|rev| Ok(self.ctx.author(rev)?.contains(&pattern)))
            }
            "desc" => {
                let pattern = string_arg("desc", args)?;
                self.scan(|rev| Ok(self.ctx.description(rev)?.contains(&pattern)))
            }
            "date" => {
                let spec = string_arg("date", args)?;
                let matcher = DateSpec::parse(&spec)?;
                self.scan(|rev| Ok(matcher.matches(self.ctx.date(rev)?)))
            }
            other => Err(RevsetError::UnknownFunction(other.to_string())),
        }
    }

    /// Filter the visible set by a per-rev predicate.
    fn scan(
        &self,
        mut predicate: impl FnMut(Rev) -> Result<bool, RevsetError>,
    ) -> Result<Vec<Rev>, RevsetError> {
        let mut out = Vec::new();
        for rev in self.visible() {
            if predicate(rev)? {
                out.push(rev);
            }
        }
        Ok(out)
    }

    fn resolve(&self, symbol: &str) -> Result<Rev, RevsetError> {
        if let Some(rev) = self.ctx.lookup(symbol)? {
            return self.check_visible(symbol, rev);
        }
        if let Ok(rev) = symbol.parse::<Rev>() {
            if rev >= 0 && (rev as usize) < self.ctx.num_revs() {
                return self.check_visible(symbol, rev);
            }
        }
        Err(RevsetError::UnknownRevision(symbol.to_string()))
    }

    fn check_visible(&self, symbol: &str, rev: Rev) -> Result<Rev, RevsetError> {
        if self.ctx.is_hidden(rev) {
            // Hidden revs are unnameable through the filtered view.
            return Err(RevsetError::UnknownRevision(symbol.to_string()));
        }
        Ok(rev)
    }
}

fn check_arity(function: &'static str, args: &[Expr], expected: usize) -> Result<(), RevsetError> {
    if args.len() != expected {
        return Err(RevsetError::BadArity { function, expected });
    }
    Ok(())
}

fn string_arg(function: &'static str, args: &[Expr]) -> Result<String, RevsetError> {
    if args.len() != 1 {
        return Err(RevsetError::BadArity {
            function,
            expected: 1,
        });
    }
    match &args[0] {
        Expr::String(s) | Expr::Symbol(s) => Ok(s.clone()),
        _ => Err(RevsetError::BadArity {
            function,
            expected: 1,
        }),
    }
}

/// `date(spec)` forms: `>N` (at or after), `<N` (at or before),
/// `N-M` (inclusive range), `N` (exact second), all UTC seconds.
enum DateSpec {
    After(i64),
    Before(i64),
    Between(i64, i64),
    Exact(i64),
}

impl DateSpec {
    fn parse(spec: &str) -> Result<Self, RevsetError> {
        let bad = || RevsetError::BadDateSpec(spec.to_string());
        if let Some(rest) = spec.strip_prefix('>') {
            return rest.trim().parse().map(DateSpec::After).map_err(|_| bad());
        }
        if let Some(rest) = spec.strip_prefix('<') {
            return rest.trim().parse().map(DateSpec::Before).map_err(|_| bad());
        }
        if let Some((lo, hi)) = spec.split_once('-') {
            let lo = lo.trim().parse().map_err(|_| bad())?;
            let hi = hi.trim().parse().map_err(|_| bad())?;
            return Ok(DateSpec::Between(lo, hi));
        }
        spec.trim().parse().map(DateSpec::Exact).map_err(|_| bad())
    }

    fn matches(&self, date: i64) -> bool {
        match self {
            DateSpec::After(t) => date >= *t,
            DateSpec::Before(t) => date <= *t,
            DateSpec::Between(lo, hi) => (*lo..=*hi).contains(&date),
            DateSpec::Exact(t) => date == *t,
        }
    }
}

fn union_sorted(a: &[Rev], b: &[Rev]) -> Vec<Rev> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() || j < b.len() {
        match (a.get(i), b.get(j)) {
            (Some(&x), Some(&y)) if x == y => {
                out.push(x);
                i += 1;
                j += 1;
            }
            (Some(&x), Some(&y)) if x < y => {
                out.push(x);
                i += 1;
            }
            (Some(_), Some(&y)) => {
                out.push(y);
                j += 1;
            }
            (Some(&x), None) => {
                out.push(x);
                i += 1;
            }
            (None, Some(&y)) => {
                out.push(y);
                j += 1;
            }
            (None, None) => unreachable!(),
        }
    }
    out
}

fn intersect_sorted(a: &[Rev], b: &[Rev]) -> Vec<Rev> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i] == b[j] {
            out.push(a[i]);
            i += 1;
            j += 1;
        } else if a[i] < b[j] {
            i += 1;
        } else {
            j += 1;
        }
    }
    out
}

fn diff_sorted(a: &[Rev], b: &[Rev]) -> Vec<Rev> {
    let mut out = Vec::new();
    let mut j = 0;
    for &x in a {
        while j < b.len() && b[j] < x {
            j += 1;
        }
        if j == b.len() || b[j] != x {
            out.push(x);
        }
    }
    out
}
