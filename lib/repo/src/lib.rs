/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! The repository façade.
//!
//! A [`Repo`] owns two sibling halves: the [`store::Store`] (history)
//! and the [`WorkingCopy`] (checkout). Writers take the matching lock,
//! open one transaction, and either commit or roll back; readers work
//! from the in-memory snapshot taken at open. The façade also wires the
//! obsolescence store, phases and bookmarks into the hidden-set and
//! revset machinery.

pub mod bookmarks;
pub mod commit;
pub mod errors;
pub mod fncache;
pub mod hooks;
pub mod mergestate;
pub mod phases;
pub mod requirements;
pub mod status;
pub mod store;
pub mod verify;

use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;

use configmodel::Config;
use configmodel::ConfigSet;
use dirstate::Dirstate;
use repolock::LockHandle;
use repolock::LockOptions;
use repolock::RepoLocker;
use revlog::RevlogConfig;
use transaction::Transaction;
use types::Node;
use types::RepoPath;
use types::RepoPathBuf;
use types::Rev;
use types::NULL_REV;
use vfs::audit::PathAuditor;
use vfs::audit::ReservedPolicy;
use vfs::Vfs;

pub use crate::errors::RepoError;
pub use crate::errors::StateError;
pub use crate::hooks::HookArgs;
pub use crate::hooks::HookEvent;
pub use crate::hooks::Hooks;
pub use crate::mergestate::MergeState;
pub use crate::phases::Phase;
pub use crate::status::Status;

use crate::requirements::Requirements;
use crate::store::ChangelogSource;
use crate::store::Store;

/// Directory holding all repository metadata.
pub const DOT_DIR: &str = ".hg";

/// The working-copy half: audited file access plus the dirstate.
pub struct WorkingCopy {
    vfs: Vfs,
    dirstate: Dirstate,
    dot_path: PathBuf,
}

impl WorkingCopy {
    fn open(root: &Path, dot_path: PathBuf, config: &impl Config) -> Result<Self, RepoError> {
        let policy = match config.get("windows", "reserved-names") {
            Some("abort") => ReservedPolicy::Abort,
            _ => ReservedPolicy::Warn,
        };
        let vfs = Vfs::new(root.to_path_buf(), PathAuditor::with_policy(policy));
        let dirstate = Dirstate::open(dot_path.join("dirstate"))?;
        Ok(WorkingCopy {
            vfs,
            dirstate,
            dot_path,
        })
    }

    pub fn vfs(&self) -> &Vfs {
        &self.vfs
    }

    pub fn dirstate(&self) -> &Dirstate {
        &self.dirstate
    }

    pub fn dirstate_mut(&mut self) -> &mut Dirstate {
        &mut self.dirstate
    }

    pub fn merge_state_path(&self) -> PathBuf {
        self.dot_path.join("merge").join("state")
    }

    /// The saved merge state, if a merge is in progress.
    pub fn merge_state(&self) -> Result<Option<MergeState>, RepoError> {
        MergeState::load(self.merge_state_path())
    }
}

pub struct Repo {
    root: PathBuf,
    dot_path: PathBuf,
    config: ConfigSet,
    requirements: Requirements,
    locker: RepoLocker,
    store: Store,
    working_copy: WorkingCopy,
    hooks: Hooks,
}

impl Repo {
    /// Create a new repository at `root`.
    pub fn init(root: impl Into<PathBuf>, config: ConfigSet) -> Result<Self, RepoError> {
        let root = root.into();
        let dot_path = root.join(DOT_DIR);
        if dot_path.exists() {
            return Err(RepoError::Corrupt(format!(
                "repository already exists at {:?}",
                root
            )));
        }
        std::fs::create_dir_all(dot_path.join("store").join("data"))?;
        let requirements = Requirements::for_new_repo();
        requirements.save(&dot_path.join("requires"))?;
        Self::open_with_config(root, config)
    }

    /// Open an existing repository.
    pub fn open(root: impl Into<PathBuf>, config: ConfigSet) -> Result<Self, RepoError> {
        let root = root.into();
        if !root.join(DOT_DIR).join("requires").exists() {
            return Err(RepoError::NotFound(root.display().to_string()));
        }
        Self::open_with_config(root, config)
    }

    fn open_with_config(root: PathBuf, config: ConfigSet) -> Result<Self, RepoError> {
        let dot_path = root.join(DOT_DIR);
        let requirements = Requirements::load(&dot_path.join("requires"))?;
        let locker = RepoLocker::new(&dot_path, LockOptions::from_config(&config)?);

        // A leftover journal is a crashed transaction: recover before
        // reading anything, under the store lock.
        let journal = dot_path.join("store").join("journal");
        if journal.exists() {
            let _lock = locker.lock_store()?;
            transaction::recover(&journal)?;
        }

        let revlog_config = RevlogConfig {
            chain_len_cap: config.get_or("revlog", "chain-len-cap", 1000usize)?,
            chain_span_ratio: config.get_or("revlog", "chain-span-ratio", 4u64)?,
            inline: true,
        };
        let store = Store::open(dot_path.join("store"), &dot_path, revlog_config)?;
        let working_copy = WorkingCopy::open(&root, dot_path.clone(), &config)?;
        Ok(Repo {
            root,
            dot_path,
            config,
            requirements,
            locker,
            store,
            working_copy,
            hooks: Hooks::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dot_path(&self) -> &Path {
        &self.dot_path
    }

    pub fn config(&self) -> &ConfigSet {
        &self.config
    }

    pub fn requirements(&self) -> &Requirements {
        &self.requirements
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    pub fn working_copy(&self) -> &WorkingCopy {
        &self.working_copy
    }

    pub fn working_copy_mut(&mut self) -> &mut WorkingCopy {
        &mut self.working_copy
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut Hooks {
        &mut self.hooks
    }

    pub fn lock_store(&self) -> Result<LockHandle, RepoError> {
        Ok(self.locker.lock_store()?)
    }

    pub fn lock_working_copy(&self) -> Result<LockHandle, RepoError> {
        Ok(self.locker.lock_working_copy()?)
    }

    /// Open the store transaction. The caller must hold the store
    /// lock.
    pub fn begin_transaction(&self) -> Result<Transaction, RepoError> {
        Ok(Transaction::open(self.store.journal_path())?)
    }

    /// Re-read all store state from disk. Required after an aborted
    /// transaction: the in-memory indexes may hold entries the abort
    /// truncated away.
    pub fn reload_store(&mut self) -> Result<(), RepoError> {
        let revlog_config = RevlogConfig {
            chain_len_cap: self.config.get_or("revlog", "chain-len-cap", 1000usize)?,
            chain_span_ratio: self.config.get_or("revlog", "chain-span-ratio", 4u64)?,
            inline: true,
        };
        self.store = Store::open(
            self.dot_path.join("store"),
            &self.dot_path,
            revlog_config,
        )?;
        Ok(())
    }

    /// One-step rollback of the last committed transaction.
    pub fn rollback(&mut self) -> Result<bool, RepoError> {
        // Lock order is always wlock before store lock.
        let _wlock = self.lock_working_copy()?;
        let _lock = self.lock_store()?;
        let rolled = transaction::recover(&self.store.undo_path())?;
        if rolled {
            self.reload_store()?;
            self.fix_dirstate_after_truncation()?;
        }
        Ok(rolled)
    }

    /// Recover from a crashed transaction (journal replay).
    pub fn recover(&mut self) -> Result<bool, RepoError> {
        let _wlock = self.lock_working_copy()?;
        let _lock = self.lock_store()?;
        let recovered = transaction::recover(&self.store.journal_path())?;
        if recovered {
            self.reload_store()?;
            self.fix_dirstate_after_truncation()?;
        }
        Ok(recovered)
    }

    /// After history shrank, a dirstate parent may name a changeset
    /// that no longer exists; fall back to the tip. The caller holds
    /// both locks.
    fn fix_dirstate_after_truncation(&mut self) -> Result<(), RepoError> {
        let (p1, p2) = self.working_copy.dirstate().parents();
        let p1_gone = !p1.is_null() && self.store.rev_of_node(&p1).is_none();
        let p2_gone = !p2.is_null() && self.store.rev_of_node(&p2).is_none();
        if p1_gone || p2_gone {
            let tip = self.store.changelog().tip();
            let tip_node = self.store.node_of_rev(tip.max(NULL_REV))?;
            let dirstate = self.working_copy.dirstate_mut();
            tracing::warn!(new_parent = %tip_node, "dirstate parent was stripped, moving to tip");
            dirstate.set_parents(tip_node, types::NULL_ID);
            dirstate.write()?;
        }
        Ok(())
    }

    /// Destructively remove all changelog revs >= `rev`, with the
    /// manifest and filelog entries they introduced. Plumbing: callers
    /// wanting a safety bundle write it first.
    pub fn strip_raw(&mut self, rev: Rev) -> Result<(), RepoError> {
        let _wlock = self.lock_working_copy()?;
        let _lock = self.lock_store()?;
        if rev < 0 || rev as usize >= self.store.changelog().len() {
            return Ok(());
        }
        // Filelogs and the manifest log strip by link rev.
        for path in self.store.tracked_filelog_paths() {
            let filelog = self.store.filelog(&path)?;
            let revlog = filelog.revlog_mut();
            let mut cut = None;
            for r in 0..revlog.len() as Rev {
                if revlog.link_rev(r)? >= rev {
                    cut = Some(r);
                    break;
                }
            }
            if let Some(cut) = cut {
                revlog.strip(cut)?;
            }
        }
        let manifest_revlog = self.store.manifest_log_mut().revlog_mut();
        let mut cut = None;
        for r in 0..manifest_revlog.len() as Rev {
            if manifest_revlog.link_rev(r)? >= rev {
                cut = Some(r);
                break;
            }
        }
        if let Some(cut) = cut {
            manifest_revlog.strip(cut)?;
        }
        self.store.changelog_mut().revlog_mut().strip(rev)?;
        self.fix_dirstate_after_truncation()?;
        Ok(())
    }

    /// Changelog heads, hidden revs filtered out.
    pub fn heads(&self) -> Result<Vec<Node>, RepoError> {
        let hidden = self.hidden_revs()?;
        let hidden: HashSet<Rev> = hidden.into_iter().collect();
        let visible: Vec<Rev> = (0..self.store.changelog().len() as Rev)
            .filter(|rev| !hidden.contains(rev))
            .collect();
        let source = ChangelogSource(self.store.changelog());
        let dag = dag::Dag::new(&source);
        let mut heads = Vec::new();
        for rev in dag.heads(&visible)? {
            heads.push(self.store.node_of_rev(rev)?);
        }
        if heads.is_empty() {
            heads.push(types::NULL_ID);
        }
        Ok(heads)
    }

    /// Phase of every rev.
    pub fn phase_vector(&self) -> Result<Vec<Phase>, RepoError> {
        let source = ChangelogSource(self.store.changelog());
        self.store
            .phases()
            .phase_vector(&source, |node| self.store.rev_of_node(node))
    }

    pub fn phase_of(&self, rev: Rev) -> Result<Phase, RepoError> {
        Ok(self
            .phase_vector()?
            .get(rev as usize)
            .copied()
            .unwrap_or(Phase::Public))
    }

    /// Publish `revs` (draft -> public). Publishing a hidden changeset
    /// is a state error.
    pub fn publish(&mut self, txn: &mut Transaction, revs: &[Rev]) -> Result<(), RepoError> {
        let hidden: HashSet<Rev> = self.hidden_revs()?.into_iter().collect();
        for &rev in revs {
            if hidden.contains(&rev) {
                return Err(StateError::PublishHidden(self.store.node_of_rev(rev)?).into());
            }
        }
        // Snapshot parents and nodes so the phase store can borrow them
        // while the store is borrowed mutably.
        let len = self.store.changelog().len() as Rev;
        let mut source = dag::VecSource::new();
        let mut nodes = Vec::with_capacity(len as usize);
        for rev in 0..len {
            let [p1, p2] = self.store.changelog().revlog().parents(rev)?;
            source.push(p1, p2);
            nodes.push(self.store.node_of_rev(rev)?);
        }
        let nodes_ref = &nodes;
        self.store.phases_mut().advance(
            txn,
            &source,
            move |node| nodes_ref.iter().position(|n| n == node).map(|i| i as Rev),
            move |rev| nodes_ref[rev as usize],
            revs,
            Phase::Public,
        )?;
        Ok(())
    }

    /// Record freshly added revs (changegroup apply) as draft. Revs
    /// whose phase is already draft or secret are left alone.
    pub fn mark_draft(&mut self, txn: &mut Transaction, revs: &[Rev]) -> Result<(), RepoError> {
        let len = self.store.changelog().len() as Rev;
        let mut source = dag::VecSource::new();
        let mut nodes = Vec::with_capacity(len as usize);
        for rev in 0..len {
            let [p1, p2] = self.store.changelog().revlog().parents(rev)?;
            source.push(p1, p2);
            nodes.push(self.store.node_of_rev(rev)?);
        }
        let nodes_ref = &nodes;
        for &rev in revs {
            self.store.phases_mut().note_new_rev(
                txn,
                &source,
                move |node| nodes_ref.iter().position(|n| n == node).map(|i| i as Rev),
                move |r| nodes_ref[r as usize],
                rev,
                Phase::Draft,
            )?;
        }
        Ok(())
    }

    /// Append obsolescence markers, enforcing the public-predecessor
    /// rule.
    pub fn add_obsmarkers(
        &mut self,
        txn: &mut Transaction,
        markers: Vec<obsstore::Marker>,
    ) -> Result<usize, RepoError> {
        let phases = self.phase_vector()?;
        let rev_of: Vec<(Node, Rev)> = (0..self.store.changelog().len() as Rev)
            .map(|rev| Ok((self.store.node_of_rev(rev)?, rev)))
            .collect::<Result<_, RepoError>>()?;
        let is_public = move |node: &Node| {
            rev_of
                .iter()
                .find(|(n, _)| n == node)
                .map(|(_, rev)| phases[*rev as usize] == Phase::Public)
                .unwrap_or(false)
        };
        Ok(self.store.obsstore_mut().add(txn, markers, is_public)?)
    }

    /// Revs hidden by obsolescence (not public, not pinned).
    pub fn hidden_revs(&self) -> Result<Vec<Rev>, RepoError> {
        let phases = self.phase_vector()?;
        let (p1, p2) = self.working_copy.dirstate().parents();
        let mut pins = Vec::new();
        for parent in [p1, p2] {
            if let Some(rev) = self.store.rev_of_node(&parent) {
                pins.push(rev);
            }
        }
        for (_, node) in self.store.bookmarks().iter() {
            if let Some(rev) = self.store.rev_of_node(node) {
                pins.push(rev);
            }
        }
        let ctx = ObsCtx {
            changelog: self.store.changelog(),
            phases: &phases,
            pins,
        };
        Ok(self.store.obsstore().hidden_revs(&ctx)?)
    }

    /// Resolve a revset expression against the visible repo.
    pub fn revset(&self, expr: &str) -> Result<revsets::Revset, RepoError> {
        let parsed = revsets::parse(expr)?;
        let hidden: HashSet<Rev> = self.hidden_revs()?.into_iter().collect();
        let ctx = RepoRevsetContext { repo: self, hidden };
        Ok(revsets::evaluate(&ctx, &parsed)?)
    }

    /// Resolve a single symbol to a rev, unfiltered. `.` is the
    /// working-copy parent, `tip` the highest rev; bookmarks, full hex
    /// and unambiguous hex prefixes work too.
    pub fn lookup_symbol(&self, symbol: &str) -> Result<Option<Rev>, RepoError> {
        match symbol {
            "." => {
                let (p1, _) = self.working_copy.dirstate().parents();
                if p1.is_null() {
                    return Ok(Some(NULL_REV));
                }
                Ok(self.store.rev_of_node(&p1))
            }
            "tip" => {
                if self.store.changelog().is_empty() {
                    Ok(Some(NULL_REV))
                } else {
                    Ok(Some(self.store.changelog().tip()))
                }
            }
            _ => {
                if let Some(node) = self.store.bookmarks().get(symbol) {
                    return Ok(self.store.rev_of_node(&node));
                }
                if symbol.len() == Node::hex_len() {
                    if let Ok(node) = Node::from_hex(symbol.as_bytes()) {
                        return Ok(self.store.rev_of_node(&node));
                    }
                }
                if symbol.len() >= 4
                    && symbol.len() < Node::hex_len()
                    && symbol.bytes().all(|b| b.is_ascii_hexdigit())
                {
                    return self.lookup_hex_prefix(symbol);
                }
                Ok(None)
            }
        }
    }

    fn lookup_hex_prefix(&self, prefix: &str) -> Result<Option<Rev>, RepoError> {
        let prefix = prefix.to_ascii_lowercase();
        let mut found = None;
        for rev in 0..self.store.changelog().len() as Rev {
            let node = self.store.node_of_rev(rev)?;
            if node.to_hex().starts_with(&prefix) {
                if found.is_some() {
                    // Ambiguous prefixes match nothing.
                    return Ok(None);
                }
                found = Some(rev);
            }
        }
        Ok(found)
    }

    /// Track `path` (string form, audited). S6 behavior: bad paths are
    /// path errors and leave the dirstate untouched.
    pub fn wc_add(&mut self, path: &str) -> Result<(), RepoError> {
        let auditor = PathAuditor::with_policy(self.reserved_policy());
        let repo_path = auditor.check_relative(path).map_err(RepoError::Path)?;
        auditor
            .audit(&self.root, repo_path)
            .map_err(RepoError::Path)?;
        if !self.working_copy.vfs().case_sensitive() {
            let detector = vfs::audit::CaseCollisions::new(
                self.working_copy.dirstate().tracked_paths(),
            );
            detector.check(repo_path).map_err(RepoError::Path)?;
        }
        let owned = repo_path.to_owned();
        self.working_copy.dirstate_mut().add(owned)?;
        Ok(())
    }

    fn reserved_policy(&self) -> ReservedPolicy {
        match self.config.get("windows", "reserved-names") {
            Some("abort") => ReservedPolicy::Abort,
            _ => ReservedPolicy::Warn,
        }
    }

    /// The store-side parent revs of the working copy.
    pub fn working_parents(&self) -> (Rev, Rev) {
        let (p1, p2) = self.working_copy.dirstate().parents();
        (
            self.store.rev_of_node(&p1).unwrap_or(NULL_REV),
            self.store.rev_of_node(&p2).unwrap_or(NULL_REV),
        )
    }
}

/// Obsstore context assembled from repo pieces.
struct ObsCtx<'a> {
    changelog: &'a changelog::Changelog,
    phases: &'a [Phase],
    pins: Vec<Rev>,
}

impl<'a> dag::ParentSource for ObsCtx<'a> {
    fn num_revs(&self) -> usize {
        self.changelog.len()
    }

    fn parent_revs(&self, rev: Rev) -> [Rev; 2] {
        self.changelog
            .revlog()
            .parents(rev)
            .unwrap_or([NULL_REV, NULL_REV])
    }
}

impl<'a> obsstore::ObsContext for ObsCtx<'a> {
    fn rev_of_node(&self, node: &Node) -> Option<Rev> {
        self.changelog.revlog().rev_of_node(node)
    }

    fn is_public(&self, rev: Rev) -> bool {
        self.phases
            .get(rev as usize)
            .map(|&p| p == Phase::Public)
            .unwrap_or(true)
    }

    fn pinned_revs(&self) -> Vec<Rev> {
        self.pins.clone()
    }
}

/// Revset context over a repo snapshot.
struct RepoRevsetContext<'a> {
    repo: &'a Repo,
    hidden: HashSet<Rev>,
}

impl<'a> revsets::RevsetContext for RepoRevsetContext<'a> {
    fn num_revs(&self) -> usize {
        self.repo.store.changelog().len()
    }

    fn parent_revs(&self, rev: Rev) -> [Rev; 2] {
        self.repo
            .store
            .changelog()
            .revlog()
            .parents(rev)
            .unwrap_or([NULL_REV, NULL_REV])
    }

    fn is_hidden(&self, rev: Rev) -> bool {
        self.hidden.contains(&rev)
    }

    fn lookup(&self, symbol: &str) -> Result<Option<Rev>, revsets::RevsetError> {
        match self.repo.lookup_symbol(symbol) {
            Ok(Some(NULL_REV)) => Ok(None),
            Ok(found) => Ok(found),
            Err(err) => Err(revsets::RevsetError::Backend(err.to_string())),
        }
    }

    fn author(&self, rev: Rev) -> Result<String, revsets::RevsetError> {
        self.changeset(rev).map(|c| c.author)
    }

    fn description(&self, rev: Rev) -> Result<String, revsets::RevsetError> {
        self.changeset(rev).map(|c| c.description)
    }

    fn date(&self, rev: Rev) -> Result<i64, revsets::RevsetError> {
        self.changeset(rev).map(|c| c.time.unixtime)
    }
}

impl<'a> RepoRevsetContext<'a> {
    fn changeset(&self, rev: Rev) -> Result<changelog::Changeset, revsets::RevsetError> {
        self.repo
            .store
            .changelog()
            .changeset(rev)
            .map_err(|err| revsets::RevsetError::Backend(err.to_string()))
    }
}
