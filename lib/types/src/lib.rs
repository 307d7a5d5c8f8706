/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Common types shared by the storage and working-copy layers.
//!
//! The most important type is [`Node`], the 20-byte content-addressed
//! identifier of everything versioned: changesets, manifests and file
//! revisions all hash to a `Node`. Identity is parent-aware: the hash
//! covers the (unordered) parents followed by the payload, so the same
//! bytes reachable through different histories get different nodes.

mod errors;
mod file_type;
mod node;
mod parents;
mod path;

pub use crate::errors::TypeError;
pub use crate::file_type::FileType;
pub use crate::node::Node;
pub use crate::node::NULL_ID;
pub use crate::parents::Parents;
pub use crate::path::RepoPath;
pub use crate::path::RepoPathBuf;

/// A dense, revlog-local revision number.
///
/// Not stable across clones. `NULL_REV` is the parent of roots.
pub type Rev = i32;

/// Sentinel rev used for "no parent" and "not found".
pub const NULL_REV: Rev = -1;
