/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Bundle2: the framed container used for network exchange and backup
//! files.
//!
//! A bundle is `HG20`, a parameter blob, then a sequence of typed
//! *parts*, each a header plus length-prefixed payload chunks. Part
//! names are matched case-insensitively; a name transmitted with any
//! uppercase letter marks the part mandatory, so an old reader aborts
//! rather than silently dropping something it cannot interpret.
//! Advisory (all-lowercase) unknown parts are skipped. This is the
//! whole forward-compatibility story.
//!
//! The parser is a single-pass finite stream; parts come out in wire
//! order and payload chunks are already reassembled.

pub mod changegroup;

mod parts;

pub use crate::parts::BundleReader;
pub use crate::parts::BundleWriter;
pub use crate::parts::Part;

use thiserror::Error;

/// Bundle magic.
pub const MAGIC: &[u8; 4] = b"HG20";

/// Payload chunk size used by the writer.
pub(crate) const CHUNK_SIZE: usize = 32 * 1024;

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("not a bundle: bad magic {0:?}")]
    BadMagic(Vec<u8>),

    #[error("malformed bundle: {0}")]
    Malformed(String),

    #[error("missing support for mandatory part {0:?}")]
    UnknownMandatoryPart(String),

    #[error("remote reported an error: {0}")]
    RemoteError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Well-known part names (lowercase canonical form).
pub mod part_names {
    pub const CHANGEGROUP: &str = "changegroup";
    pub const OBSMARKERS: &str = "obsmarkers";
    pub const PHASE_HEADS: &str = "phase-heads";
    pub const BOOKMARKS: &str = "bookmarks";
    pub const PUSHKEY: &str = "pushkey";
    pub const CHECK_HEADS: &str = "check:heads";
    pub const ERROR: &str = "error";
    pub const REPLY_PREFIX: &str = "reply:";
}
