/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Append-only, delta-compressed, content-addressed storage.
//!
//! One revlog holds the full history of one thing: the changelog, the
//! manifest log, or a single file. Entries are addressed by a dense
//! local rev number or by their 20-byte node, reconstruct through delta
//! chains anchored on full snapshots, and are verified against their
//! node on every read.

pub mod compress;
pub mod delta;
mod errors;
mod index;
mod revlog;

pub use crate::errors::RevlogError;
pub use crate::index::IndexEntry;
pub use crate::index::RevFlags;
pub use crate::index::RECORD_LEN;
pub use crate::revlog::Revlog;
pub use crate::revlog::RevlogConfig;
