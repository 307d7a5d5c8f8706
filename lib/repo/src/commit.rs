/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Commit: turn working-copy changes into a changeset.
//!
//! Inside one transaction, in dependency order: filelog entries first,
//! then the manifest, then the changelog entry, so a reader (or a
//! crash) never sees a changeset whose manifest or files are missing.
//! The new changeset starts in the draft phase (`phases.new-commit`
//! can make it secret). The dirstate is rewritten afterwards under the
//! working-copy lock.

use std::time::SystemTime;

use changelog::Changeset;
use changelog::HgTime;
use configmodel::Config;
use filelog::CopyInfo;
use types::Node;
use types::RepoPathBuf;
use types::Rev;
use types::NULL_ID;
use types::NULL_REV;

use crate::errors::RepoError;
use crate::errors::StateError;
use crate::hooks::HookArgs;
use crate::hooks::HookEvent;
use crate::phases::Phase;
use crate::status;
use crate::Repo;

#[derive(Debug, Clone)]
pub struct CommitOptions {
    pub author: String,
    pub description: String,
    /// Defaults to the current time.
    pub date: Option<HgTime>,
    pub extra: Vec<(String, String)>,
}

impl CommitOptions {
    pub fn new(author: impl Into<String>, description: impl Into<String>) -> Self {
        CommitOptions {
            author: author.into(),
            description: description.into(),
            date: None,
            extra: Vec::new(),
        }
    }
}

/// Commit the working copy. Returns the new changelog rev and node.
pub fn commit(repo: &mut Repo, options: &CommitOptions) -> Result<(Rev, Node), RepoError> {
    let _wlock = repo.lock_working_copy()?;
    let _lock = repo.lock_store()?;

    if let Some(merge_state) = repo.working_copy().merge_state()? {
        if merge_state.has_unresolved() {
            return Err(StateError::UnresolvedMerge.into());
        }
    }

    let changes = status::status(repo, false, false)?;
    let (p1_rev, p2_rev) = repo.working_parents();
    let in_merge = p2_rev != NULL_REV;
    if changes.is_clean() && !in_merge {
        return Err(StateError::NothingToCommit.into());
    }

    let (p1_node, p2_node) = repo.working_copy().dirstate().parents();
    let m1 = repo.store().manifest_log().get(&p1_node)?;
    let m2 = repo.store().manifest_log().get(&p2_node)?;
    let (m1_node, m1_rev) = parent_manifest(repo, &p1_node)?;
    let (_m2_node, m2_rev) = parent_manifest(repo, &p2_node)?;
    debug_assert!(p1_node.is_null() || !m1_node.is_null() || m1.is_empty());

    let mut txn = repo.begin_transaction()?;
    let result = (|| -> Result<(Rev, Node), RepoError> {
        let mut manifest = (*m1).clone();
        let mut touched: Vec<RepoPathBuf> = Vec::new();

        for path in changes.added.iter().chain(&changes.modified) {
            let content = repo.working_copy().vfs().read(path)?;
            let file_type = repo
                .working_copy()
                .vfs()
                .file_type(path)?
                .unwrap_or(types::FileType::Regular);
            let copy = match repo.working_copy().dirstate().copied(path) {
                Some(source) => m1.get(source).map(|info| CopyInfo {
                    path: source.to_owned(),
                    node: info.node,
                }),
                None => None,
            };

            let fp1 = m1.get(path).map(|info| info.node).unwrap_or(NULL_ID);
            let fp2 = m2.get(path).map(|info| info.node).unwrap_or(NULL_ID);
            let link_rev = repo.store().changelog().len() as Rev;

            repo.store_mut().register_filelog(&mut txn, path)?;
            let filelog = repo.store_mut().filelog(path)?;
            let fp1_rev = filelog.revlog().rev_of_node(&fp1).unwrap_or(NULL_REV);
            let fp2_rev = filelog.revlog().rev_of_node(&fp2).unwrap_or(NULL_REV);
            let (_, file_node) = filelog.add(
                &mut txn,
                &content,
                copy.as_ref(),
                fp1_rev,
                fp2_rev,
                link_rev,
            )?;

            manifest.insert(path.clone(), manifest::FileInfo::new(file_node, file_type));
            touched.push(path.clone());
        }

        for path in &changes.removed {
            manifest.remove(path);
            touched.push(path.clone());
        }
        touched.sort();

        let link_rev = repo.store().changelog().len() as Rev;
        let (_, manifest_node) = repo.store_mut().manifest_log_mut().add(
            &mut txn,
            &manifest,
            m1_rev,
            m2_rev,
            link_rev,
        )?;

        let date = options.date.unwrap_or_else(now);
        let changeset = Changeset {
            manifest_node,
            author: options.author.clone(),
            time: date,
            extra: options.extra.iter().cloned().collect(),
            files: touched,
            description: options.description.clone(),
        };
        let (rev, node) =
            repo.store_mut()
                .changelog_mut()
                .add(&mut txn, &changeset, p1_rev, p2_rev)?;

        let phase = match repo.config().get("phases", "new-commit") {
            Some("secret") => Phase::Secret,
            _ => Phase::Draft,
        };
        note_phase(repo, &mut txn, rev, phase)?;

        // The active bookmark follows commits made on top of it.
        if let Some(active) = repo.store().bookmarks().active()? {
            let at_parent = repo.store().bookmarks().get(&active) == Some(p1_node);
            if at_parent || repo.store().bookmarks().get(&active).is_none() {
                repo.store_mut()
                    .bookmarks_mut()
                    .set(&mut txn, &active, node)?;
            }
        }

        repo.hooks().fire(&HookArgs {
            event: HookEvent::PreTxnCommit,
            repo_root: repo.root(),
            node: Some(node),
            key: None,
        })?;
        Ok((rev, node))
    })();

    let (rev, node) = match result {
        Ok(ok) => ok,
        Err(err) => {
            txn.abort()?;
            repo.reload_store()?;
            return Err(err);
        }
    };
    txn.commit(&repo.store().undo_path())?;

    // Working-copy bookkeeping happens after the store committed.
    update_dirstate_after_commit(repo, node, &changes)?;
    if let Some(merge_state) = repo.working_copy().merge_state()? {
        merge_state.delete()?;
    }
    let _ = repo.hooks().fire(&HookArgs {
        event: HookEvent::TxnClose,
        repo_root: repo.root(),
        node: Some(node),
        key: None,
    });
    tracing::info!(rev, %node, "committed");
    Ok((rev, node))
}

/// The manifest (node, rev) of a parent changeset; null for a root.
fn parent_manifest(repo: &Repo, parent: &Node) -> Result<(Node, Rev), RepoError> {
    if parent.is_null() {
        return Ok((NULL_ID, NULL_REV));
    }
    let rev = repo
        .store()
        .rev_of_node(parent)
        .ok_or_else(|| RepoError::UnknownRevision(parent.to_hex()))?;
    let manifest_node = repo.store().changelog().changeset(rev)?.manifest_node;
    let manifest_rev = repo
        .store()
        .manifest_log()
        .rev_of_node(&manifest_node)
        .unwrap_or(NULL_REV);
    Ok((manifest_node, manifest_rev))
}

/// Record `rev`'s phase. Parent and node tables are snapshotted first
/// so the phase store can borrow them freely.
fn note_phase(
    repo: &mut Repo,
    txn: &mut transaction::Transaction,
    rev: Rev,
    phase: Phase,
) -> Result<(), RepoError> {
    let len = repo.store().changelog().len() as Rev;
    let mut source = dag::VecSource::new();
    let mut nodes = Vec::with_capacity(len as usize);
    for r in 0..len {
        let [p1, p2] = repo.store().changelog().revlog().parents(r)?;
        source.push(p1, p2);
        nodes.push(repo.store().node_of_rev(r)?);
    }
    let nodes_ref = &nodes;
    repo.store_mut().phases_mut().note_new_rev(
        txn,
        &source,
        move |node| nodes_ref.iter().position(|n| n == node).map(|i| i as Rev),
        move |r| nodes_ref[r as usize],
        rev,
        phase,
    )
}

fn update_dirstate_after_commit(
    repo: &mut Repo,
    node: Node,
    changes: &status::Status,
) -> Result<(), RepoError> {
    let stats: Vec<(RepoPathBuf, Option<(u32, i32, i32)>)> = changes
        .added
        .iter()
        .chain(&changes.modified)
        .map(|path| {
            let stat = repo
                .working_copy()
                .vfs()
                .stat(path)
                .ok()
                .flatten()
                .map(|meta| {
                    let mtime = meta
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                        .map(|d| d.as_secs() as i32)
                        .unwrap_or(dirstate::MTIME_UNSET);
                    // A file changed again within this same second
                    // would produce an identical (size, mtime) pair, so
                    // an mtime of "now" cannot be trusted yet.
                    let mtime = if mtime as i64 == now().unixtime {
                        dirstate::MTIME_UNSET
                    } else {
                        mtime
                    };
                    (mode_of(&meta), meta.len() as i32, mtime)
                });
            (path.clone(), stat)
        })
        .collect();

    let dirstate = repo.working_copy_mut().dirstate_mut();
    dirstate.set_parents(node, NULL_ID);
    for (path, stat) in stats {
        match stat {
            Some((mode, size, mtime)) => dirstate.normal(path, mode, size, mtime),
            None => dirstate.normal(path, 0, dirstate::SIZE_DIRTY, dirstate::MTIME_UNSET),
        }
    }
    for path in &changes.removed {
        let _ = dirstate.forget(path);
    }
    dirstate.write()?;
    Ok(())
}

#[cfg(unix)]
fn mode_of(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn mode_of(_meta: &std::fs::Metadata) -> u32 {
    0o100644
}

fn now() -> HgTime {
    let unixtime = SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    HgTime {
        unixtime,
        offset: 0,
    }
}
