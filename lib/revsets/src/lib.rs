/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! The revset query language.
//!
//! A small expression language naming sets of revisions:
//!
//! ```text
//! heads() - ancestors(release)
//! author(alice) & v1::v2
//! not desc("WIP") + .
//! ```
//!
//! Operators: `x::y` (range), `+` (union), `-` (difference), `&`
//! (intersection), `not`, parentheses, and named predicates (`heads()`,
//! `ancestors(x)`, `descendants(x)`, `all()`, `author(pat)`,
//! `desc(pat)`, `date(spec)`).
//!
//! Evaluation runs over the implicit full set of *visible* revs: the
//! [`RevsetContext`] decides what is hidden. Results are in topological
//! order (ascending rev). Syntax problems and unknown names are
//! [`RevsetError`]s, the caller's InputError.

mod eval;
mod parser;

pub use crate::eval::evaluate;
pub use crate::eval::Revset;
pub use crate::eval::RevsetContext;
pub use crate::parser::parse;
pub use crate::parser::Expr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RevsetError {
    #[error("parse error at offset {pos}: {message}")]
    Parse { pos: usize, message: String },

    #[error("unknown revision {0:?}")]
    UnknownRevision(String),

    #[error("unknown revset function {0:?}")]
    UnknownFunction(String),

    #[error("{function}() takes {expected} argument(s)")]
    BadArity {
        function: &'static str,
        expected: usize,
    },

    #[error("invalid date spec {0:?}")]
    BadDateSpec(String),

    #[error(transparent)]
    Dag(#[from] dag::DagError),

    #[error("{0}")]
    Backend(String),
}
