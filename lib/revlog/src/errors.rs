/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use types::Node;
use types::Rev;

#[derive(Debug, Error)]
pub enum RevlogError {
    /// Stored node does not match the hash recomputed from payload and
    /// parents, or the chain structure is broken beyond the recoverable
    /// tail. Fatal for the read, not for the revlog.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// Malformed on-disk data.
    #[error("corrupt revlog: {0}")]
    Corrupt(String),

    /// The payload was censored; its bytes are gone by design.
    #[error("rev {rev} of {path:?} is censored")]
    Censored { path: PathBuf, rev: Rev },

    #[error("unknown rev {0}")]
    UnknownRev(Rev),

    #[error("unknown node {0}")]
    UnknownNode(Node),

    #[error("unsupported revlog version {0:#x}")]
    UnsupportedVersion(u32),

    #[error(transparent)]
    Transaction(#[from] transaction::TransactionError),

    #[error(transparent)]
    Io(#[from] io::Error),
}
