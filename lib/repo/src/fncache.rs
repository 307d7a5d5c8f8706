/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! The fncache: the list of filelog paths that exist in the store.
//!
//! Store filenames are encoded (see `vfs::pathencode`), and hashed
//! encodings are not reversible, so the store keeps the original repo
//! paths in one newline-separated file instead of walking directories.
//! It is rewritten in place, so transactions take a full backup rather
//! than a truncation record.

use std::collections::BTreeSet;
use std::path::PathBuf;

use transaction::Transaction;
use types::RepoPath;
use types::RepoPathBuf;

use crate::errors::RepoError;

pub struct FnCache {
    path: PathBuf,
    entries: BTreeSet<RepoPathBuf>,
    dirty: bool,
}

impl FnCache {
    pub fn load(path: PathBuf) -> Result<Self, RepoError> {
        let mut entries = BTreeSet::new();
        if let Some(data) = util::file::read_opt(&path)? {
            for line in String::from_utf8_lossy(&data).lines() {
                if line.is_empty() {
                    continue;
                }
                if let Ok(parsed) = RepoPathBuf::from_string(line.to_string()) {
                    entries.insert(parsed);
                }
            }
        }
        Ok(FnCache {
            path,
            entries,
            dirty: false,
        })
    }

    pub fn contains(&self, path: &RepoPath) -> bool {
        self.entries.contains(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RepoPath> {
        self.entries.iter().map(|p| p.as_repo_path())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record a filelog path, within the same transaction as the
    /// filelog's first append.
    pub fn add(&mut self, txn: &mut Transaction, path: &RepoPath) -> Result<(), RepoError> {
        if self.entries.contains(path) {
            return Ok(());
        }
        txn.add_backup(&self.path)?;
        self.entries.insert(path.to_owned());
        self.dirty = true;
        self.flush()?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), RepoError> {
        let mut out = Vec::new();
        for entry in &self.entries {
            out.extend_from_slice(entry.as_bytes());
            out.push(b'\n');
        }
        util::atomicfile::atomic_write_bytes(&self.path, &out)?;
        self.dirty = false;
        Ok(())
    }
}
