/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Manifests: the path -> (file node, flag) snapshot of one changeset.
//!
//! Serialized one line per entry, sorted bytewise by path:
//! `<path>\0<file-node-hex>[flag]\n` with flag `x` (executable) or `l`
//! (symlink). Manifest diffs merge-sort the two line sets; that diff is
//! the primitive under status, commit and merge.
//!
//! [`ManifestLog`] stores manifests in a revlog and keeps a bounded
//! cache of parsed ones.

mod manifestlog;

pub use crate::manifestlog::ManifestLog;

use std::collections::BTreeMap;

use thiserror::Error;
use types::FileType;
use types::Node;
use types::RepoPath;
use types::RepoPathBuf;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("malformed manifest line: {0:?}")]
    MalformedLine(String),

    #[error(transparent)]
    Revlog(#[from] revlog::RevlogError),
}

/// A file as a manifest records it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub node: Node,
    pub file_type: FileType,
}

impl FileInfo {
    pub fn new(node: Node, file_type: FileType) -> Self {
        FileInfo { node, file_type }
    }
}

/// An in-memory manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: BTreeMap<RepoPathBuf, FileInfo>,
}

/// One side-by-side difference entry produced by [`Manifest::diff`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffEntry {
    /// Present in `self`.
    pub left: Option<FileInfo>,
    /// Present in `other`.
    pub right: Option<FileInfo>,
}

impl Manifest {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn parse(data: &[u8]) -> Result<Self, ManifestError> {
        let mut entries = BTreeMap::new();
        for line in data.split(|&b| b == b'\n') {
            if line.is_empty() {
                continue;
            }
            let sep = line.iter().position(|&b| b == 0).ok_or_else(|| {
                ManifestError::MalformedLine(String::from_utf8_lossy(line).into_owned())
            })?;
            let (path, rest) = line.split_at(sep);
            let rest = &rest[1..];
            if rest.len() < Node::hex_len() {
                return Err(ManifestError::MalformedLine(
                    String::from_utf8_lossy(line).into_owned(),
                ));
            }
            let (hex, flag) = rest.split_at(Node::hex_len());
            let node = Node::from_hex(hex).map_err(|_| {
                ManifestError::MalformedLine(String::from_utf8_lossy(line).into_owned())
            })?;
            let flag = std::str::from_utf8(flag)
                .ok()
                .and_then(FileType::from_manifest_flag)
                .ok_or_else(|| {
                    ManifestError::MalformedLine(String::from_utf8_lossy(line).into_owned())
                })?;
            let path = RepoPathBuf::from_utf8(path.to_vec()).map_err(|e| {
                ManifestError::MalformedLine(e.to_string())
            })?;
            entries.insert(path, FileInfo::new(node, flag));
        }
        Ok(Manifest { entries })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (path, info) in &self.entries {
            out.extend_from_slice(path.as_bytes());
            out.push(0);
            out.extend_from_slice(info.node.to_hex().as_bytes());
            out.extend_from_slice(info.file_type.manifest_flag().as_bytes());
            out.push(b'\n');
        }
        out
    }

    pub fn get(&self, path: &RepoPath) -> Option<&FileInfo> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &RepoPath) -> bool {
        self.entries.contains_key(path)
    }

    pub fn insert(&mut self, path: RepoPathBuf, info: FileInfo) {
        self.entries.insert(path, info);
    }

    pub fn remove(&mut self, path: &RepoPath) -> Option<FileInfo> {
        self.entries.remove(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&RepoPath, &FileInfo)> {
        self.entries.iter().map(|(path, info)| (path.as_repo_path(), info))
    }

    pub fn paths(&self) -> impl Iterator<Item = &RepoPath> {
        self.entries.keys().map(|path| path.as_repo_path())
    }

    /// Walk both manifests in path order and report every path whose
    /// (node, flag) differs, including one-sided entries.
    pub fn diff(&self, other: &Manifest) -> BTreeMap<RepoPathBuf, DiffEntry> {
        let mut out = BTreeMap::new();
        let mut left = self.entries.iter().peekable();
        let mut right = other.entries.iter().peekable();
        loop {
            let ordering = match (left.peek(), right.peek()) {
                (None, None) => break,
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (Some((lp, _)), Some((rp, _))) => lp.cmp(rp),
            };
            match ordering {
                std::cmp::Ordering::Less => {
                    let (path, info) = left.next().unwrap();
                    out.insert(
                        path.clone(),
                        DiffEntry {
                            left: Some(*info),
                            right: None,
                        },
                    );
                }
                std::cmp::Ordering::Greater => {
                    let (path, info) = right.next().unwrap();
                    out.insert(
                        path.clone(),
                        DiffEntry {
                            left: None,
                            right: Some(*info),
                        },
                    );
                }
                std::cmp::Ordering::Equal => {
                    let (path, linfo) = left.next().unwrap();
                    let (_, rinfo) = right.next().unwrap();
                    if linfo != rinfo {
                        out.insert(
                            path.clone(),
                            DiffEntry {
                                left: Some(*linfo),
                                right: Some(*rinfo),
                            },
                        );
                    }
                }
            }
        }
        out
    }
}
