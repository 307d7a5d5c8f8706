/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! The store: everything under `.hg/store`.
//!
//! Owns the changelog, the manifest log, lazily opened filelogs (their
//! on-disk names go through `vfs::pathencode`), the fncache, the
//! obsolescence store, phase roots and bookmarks. All writes go through
//! the one store transaction; the journal and undo files live here
//! too.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use changelog::Changelog;
use filelog::Filelog;
use manifest::ManifestLog;
use obsstore::ObsStore;
use revlog::RevlogConfig;
use transaction::Transaction;
use types::Node;
use types::RepoPath;
use types::RepoPathBuf;
use types::Rev;
use types::NULL_REV;

use crate::bookmarks::Bookmarks;
use crate::errors::RepoError;
use crate::fncache::FnCache;
use crate::phases::PhaseStore;

pub struct Store {
    path: PathBuf,
    revlog_config: RevlogConfig,
    changelog: Changelog,
    manifest_log: ManifestLog,
    filelogs: HashMap<RepoPathBuf, Filelog>,
    fncache: FnCache,
    obsstore: ObsStore,
    phases: PhaseStore,
    bookmarks: Bookmarks,
}

impl Store {
    pub fn open(
        path: PathBuf,
        dot_path: &Path,
        revlog_config: RevlogConfig,
    ) -> Result<Self, RepoError> {
        let changelog = Changelog::open(
            path.join("00changelog.i"),
            RevlogConfig {
                // The changelog is read far more than written; a
                // separate data file keeps the index compact.
                inline: false,
                ..revlog_config.clone()
            },
        )?;
        let manifest_log = ManifestLog::open(
            path.join("00manifest.i"),
            RevlogConfig {
                inline: false,
                ..revlog_config.clone()
            },
        )?;
        let fncache = FnCache::load(path.join("fncache"))?;
        let obsstore = ObsStore::open(path.join("obsstore"))?;
        let phases = PhaseStore::load(path.join("phaseroots"))?;
        let bookmarks = Bookmarks::load(
            dot_path.join("bookmarks"),
            dot_path.join("bookmarks.current"),
        )?;
        Ok(Store {
            path,
            revlog_config,
            changelog,
            manifest_log,
            filelogs: HashMap::new(),
            fncache,
            obsstore,
            phases,
            bookmarks,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn journal_path(&self) -> PathBuf {
        self.path.join("journal")
    }

    pub fn undo_path(&self) -> PathBuf {
        self.path.join("undo")
    }

    pub fn changelog(&self) -> &Changelog {
        &self.changelog
    }

    pub fn changelog_mut(&mut self) -> &mut Changelog {
        &mut self.changelog
    }

    pub fn manifest_log(&self) -> &ManifestLog {
        &self.manifest_log
    }

    pub fn manifest_log_mut(&mut self) -> &mut ManifestLog {
        &mut self.manifest_log
    }

    pub fn obsstore(&self) -> &ObsStore {
        &self.obsstore
    }

    pub fn obsstore_mut(&mut self) -> &mut ObsStore {
        &mut self.obsstore
    }

    pub fn phases(&self) -> &PhaseStore {
        &self.phases
    }

    pub fn phases_mut(&mut self) -> &mut PhaseStore {
        &mut self.phases
    }

    pub fn bookmarks(&self) -> &Bookmarks {
        &self.bookmarks
    }

    pub fn bookmarks_mut(&mut self) -> &mut Bookmarks {
        &mut self.bookmarks
    }

    pub fn fncache(&self) -> &FnCache {
        &self.fncache
    }

    /// On-disk index path of the filelog for `path`.
    fn filelog_index_path(&self, path: &RepoPath) -> PathBuf {
        let encoded = vfs::pathencode::encode(&format!("data/{}.i", path));
        let mut joined = self.path.clone();
        joined.extend(encoded.split('/'));
        joined
    }

    /// The filelog for `path`, opened lazily. Opening a filelog that
    /// does not exist yet yields an empty one.
    pub fn filelog(&mut self, path: &RepoPath) -> Result<&mut Filelog, RepoError> {
        if !self.filelogs.contains_key(path) {
            let filelog =
                Filelog::open(self.filelog_index_path(path), self.revlog_config.clone())?;
            self.filelogs.insert(path.to_owned(), filelog);
        }
        Ok(self.filelogs.get_mut(path).unwrap())
    }

    /// Register a filelog path in the fncache. Call in the same
    /// transaction as its first append.
    pub fn register_filelog(
        &mut self,
        txn: &mut Transaction,
        path: &RepoPath,
    ) -> Result<(), RepoError> {
        self.fncache.add(txn, path)
    }

    /// Paths that have a filelog, per the fncache.
    pub fn tracked_filelog_paths(&self) -> Vec<RepoPathBuf> {
        self.fncache.iter().map(|p| p.to_owned()).collect()
    }

    /// Heads of the changelog as revs, including the null rev for an
    /// empty repo.
    pub fn head_revs_all(&self) -> Vec<Rev> {
        self.changelog.revlog().head_revs()
    }

    pub fn rev_of_node(&self, node: &Node) -> Option<Rev> {
        self.changelog.revlog().rev_of_node(node)
    }

    pub fn node_of_rev(&self, rev: Rev) -> Result<Node, RepoError> {
        Ok(self.changelog.revlog().node(rev)?)
    }
}

/// `dag::ParentSource` view of the changelog.
pub struct ChangelogSource<'a>(pub &'a Changelog);

impl<'a> dag::ParentSource for ChangelogSource<'a> {
    fn num_revs(&self) -> usize {
        self.0.len()
    }

    fn parent_revs(&self, rev: Rev) -> [Rev; 2] {
        // Revs handed to the dag are bounded by num_revs, and the
        // index is in memory: lookups cannot fail.
        self.0.revlog().parents(rev).unwrap_or([NULL_REV, NULL_REV])
    }
}
