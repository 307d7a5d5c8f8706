/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! The update/merge engine.
//!
//! Both entry points go through the same pipeline: pick an ancestor,
//! compute a [`plan::Plan`] from three manifests, then apply it in the
//! fixed order removes -> gets -> merges (removals first so case-only
//! renames and file/directory swaps find their names free). Content
//! merges run the in-process three-way merge or a configured external
//! tool; unresolved files land in the merge state for `resolve`.
//!
//! The engine runs single-threaded under the working-copy lock and
//! polls a cancellation flag between per-file actions; an interrupted
//! run leaves the merge state resumable.

pub mod diff3;
pub mod plan;
pub mod similarity;

use std::collections::BTreeSet;
use std::process::Command;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use configmodel::Config;
use dag::Dag;
use manifest::FileInfo;
use manifest::Manifest;
use repo::store::ChangelogSource;
use repo::MergeState;
use repo::Repo;
use repo::RepoError;
use repo::StateError;
use thiserror::Error;
use types::FileType;
use types::Node;
use types::RepoPath;
use types::RepoPathBuf;
use types::Rev;
use types::NULL_ID;
use types::NULL_REV;
use ui::Ui;

use crate::plan::Action;
use crate::plan::MergeSpec;
use crate::plan::Plan;
use crate::plan::PlanInputs;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("uncommitted changes in the working copy")]
    Dirty,

    #[error("already in a merge (resolve conflicts or commit first)")]
    AlreadyMerging,

    #[error("operation cancelled")]
    Cancelled,

    #[error("no merge in progress")]
    NoMergeState,

    #[error(transparent)]
    Repo(#[from] RepoError),
}

impl From<StateError> for MergeError {
    fn from(err: StateError) -> Self {
        MergeError::Repo(err.into())
    }
}

impl From<dirstate::DirstateError> for MergeError {
    fn from(err: dirstate::DirstateError) -> Self {
        MergeError::Repo(err.into())
    }
}

impl From<vfs::VfsError> for MergeError {
    fn from(err: vfs::VfsError) -> Self {
        MergeError::Repo(err.into())
    }
}

impl From<changelog::ChangelogError> for MergeError {
    fn from(err: changelog::ChangelogError) -> Self {
        MergeError::Repo(err.into())
    }
}

impl From<manifest::ManifestError> for MergeError {
    fn from(err: manifest::ManifestError) -> Self {
        MergeError::Repo(err.into())
    }
}

impl From<filelog::FilelogError> for MergeError {
    fn from(err: filelog::FilelogError) -> Self {
        MergeError::Repo(err.into())
    }
}

/// What an update/merge did. `unresolved > 0` means "paused for the
/// user", exit code 1, never an abort.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Stats {
    pub updated: usize,
    pub merged: usize,
    pub removed: usize,
    pub unresolved: usize,
}

impl Stats {
    pub fn exit_code(&self) -> i32 {
        if self.unresolved > 0 {
            1
        } else {
            0
        }
    }
}

/// Engine knobs, resolved from config once per run.
struct Options {
    similarity: u8,
    merge_tool: Option<String>,
    ancestor_pick: AncestorPick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AncestorPick {
    /// Deepest in topological order (greatest rev). The default.
    TopoFirst,
    /// Smallest node, stable across clones.
    MinNode,
}

impl Options {
    fn from_repo(repo: &Repo) -> Result<Self, MergeError> {
        let config = repo.config();
        let similarity = config
            .get_or("merge", "similarity", 75u8)
            .map_err(RepoError::from)?
            .min(100);
        let merge_tool = config.get("merge", "tool").map(|s| s.to_string());
        let ancestor_pick = match config.get("merge", "ancestor-pick") {
            Some("min-node") => AncestorPick::MinNode,
            _ => AncestorPick::TopoFirst,
        };
        Ok(Options {
            similarity,
            merge_tool,
            ancestor_pick,
        })
    }
}

/// Merge `other_rev` into the working copy (sets the second parent,
/// leaves a merge state).
pub fn merge_with(
    repo: &mut Repo,
    ui: &Ui,
    other_rev: Rev,
    cancel: &AtomicBool,
) -> Result<Stats, MergeError> {
    let _wlock = repo.lock_working_copy()?;
    if let Some(state) = repo.working_copy().merge_state()? {
        if state.has_unresolved() {
            return Err(StateError::UnresolvedMerge.into());
        }
    }
    let status = repo::status::status(repo, false, false)?;
    if !status.is_clean() {
        return Err(MergeError::Dirty);
    }
    let (p1_rev, p2_rev) = repo.working_parents();
    if p2_rev != NULL_REV {
        return Err(MergeError::AlreadyMerging);
    }

    let options = Options::from_repo(repo)?;
    let (ancestor_rev, other_ancestors) =
        pick_ancestor(repo, p1_rev, other_rev, options.ancestor_pick)?;

    let ancestor_manifest = manifest_of(repo, ancestor_rev)?;
    let local_manifest = manifest_of(repo, p1_rev)?;
    let other_manifest = manifest_of(repo, other_rev)?;

    let dirty = BTreeSet::new();
    let plan = build_plan(
        repo,
        &ancestor_manifest,
        &local_manifest,
        &other_manifest,
        &dirty,
        options.similarity,
    )?;
    for (source, alternatives) in &plan.divergent {
        ui.warn(&format!(
            "note: {} was renamed divergently to {}",
            source,
            alternatives
                .iter()
                .map(|p| p.as_str())
                .collect::<Vec<_>>()
                .join(" and ")
        ));
    }

    let p1_node = repo.store().node_of_rev(p1_rev)?;
    let other_node = repo.store().node_of_rev(other_rev)?;
    let mut merge_state = MergeState::new(
        repo.working_copy().merge_state_path(),
        p1_node,
        other_node,
    );
    merge_state.other_ancestors = other_ancestors;

    let stats = apply_plan(
        repo,
        ui,
        &plan,
        &options,
        Some(&mut merge_state),
        cancel,
        Mode::Merge,
    )?;

    // The second parent marks the in-progress merge until commit.
    {
        let dirstate = repo.working_copy_mut().dirstate_mut();
        dirstate.set_parents(p1_node, other_node);
        dirstate.write()?;
    }
    merge_state.write()?;
    ui.status(&format!(
        "{} files updated, {} files merged, {} files removed, {} files unresolved",
        stats.updated, stats.merged, stats.removed, stats.unresolved
    ));
    Ok(stats)
}

/// Update the working copy to `target_rev` (linear checkout; local
/// uncommitted changes are carried over and merged).
pub fn update(
    repo: &mut Repo,
    ui: &Ui,
    target_rev: Rev,
    cancel: &AtomicBool,
) -> Result<Stats, MergeError> {
    let _wlock = repo.lock_working_copy()?;
    if let Some(state) = repo.working_copy().merge_state()? {
        if state.has_unresolved() {
            return Err(StateError::UnresolvedMerge.into());
        }
    }
    let status = repo::status::status(repo, false, false)?;
    let (p1_rev, p2_rev) = repo.working_parents();
    if p2_rev != NULL_REV {
        return Err(MergeError::AlreadyMerging);
    }

    let options = Options::from_repo(repo)?;
    // Against the current parent, the parent manifest *is* the
    // ancestor: only target-side and dirty-local differences remain.
    let local_manifest = manifest_of(repo, p1_rev)?;
    let target_manifest = manifest_of(repo, target_rev)?;
    let dirty: BTreeSet<RepoPathBuf> = status.modified.iter().cloned().collect();

    let plan = build_plan(
        repo,
        &local_manifest,
        &local_manifest,
        &target_manifest,
        &dirty,
        options.similarity,
    )?;

    let target_node = repo.store().node_of_rev(target_rev)?;
    let mut merge_state = MergeState::new(
        repo.working_copy().merge_state_path(),
        repo.store().node_of_rev(p1_rev)?,
        target_node,
    );

    let stats = apply_plan(
        repo,
        ui,
        &plan,
        &options,
        Some(&mut merge_state),
        cancel,
        Mode::Update,
    )?;

    {
        let dirstate = repo.working_copy_mut().dirstate_mut();
        dirstate.set_parents(target_node, NULL_ID);
        dirstate.write()?;
    }
    if stats.unresolved > 0 {
        merge_state.write()?;
    } else {
        merge_state.delete()?;
    }
    ui.status(&format!(
        "{} files updated, {} files merged, {} files removed, {} files unresolved",
        stats.updated, stats.merged, stats.removed, stats.unresolved
    ));
    Ok(stats)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Update,
    Merge,
}

/// Choose the merge ancestor among all GCAs, returning the rest for
/// the second-pass list.
fn pick_ancestor(
    repo: &Repo,
    p1_rev: Rev,
    other_rev: Rev,
    pick: AncestorPick,
) -> Result<(Rev, Vec<Node>), MergeError> {
    let source = ChangelogSource(repo.store().changelog());
    let dag = Dag::new(&source);
    let mut gcas = dag.common_ancestors(p1_rev, other_rev).map_err(RepoError::from)?;
    if gcas.is_empty() {
        return Ok((NULL_REV, Vec::new()));
    }
    let chosen = match pick {
        AncestorPick::TopoFirst => *gcas.iter().max().unwrap(),
        AncestorPick::MinNode => {
            let mut best = gcas[0];
            for &rev in &gcas[1..] {
                if repo.store().node_of_rev(rev)? < repo.store().node_of_rev(best)? {
                    best = rev;
                }
            }
            best
        }
    };
    gcas.retain(|&rev| rev != chosen);
    let others = gcas
        .into_iter()
        .map(|rev| repo.store().node_of_rev(rev))
        .collect::<Result<_, _>>()?;
    Ok((chosen, others))
}

fn manifest_of(repo: &Repo, rev: Rev) -> Result<std::sync::Arc<Manifest>, MergeError> {
    if rev == NULL_REV {
        return Ok(std::sync::Arc::new(Manifest::new()));
    }
    let manifest_node = repo.store().changelog().changeset(rev)?.manifest_node;
    Ok(repo.store().manifest_log().get(&manifest_node)?)
}

fn build_plan(
    repo: &mut Repo,
    ancestor: &Manifest,
    local: &Manifest,
    other: &Manifest,
    dirty: &BTreeSet<RepoPathBuf>,
    similarity: u8,
) -> Result<Plan, MergeError> {
    let inputs = PlanInputs {
        ancestor,
        local,
        other,
        dirty,
        similarity,
    };
    let repo = std::cell::RefCell::new(repo);
    plan::compute_plan(
        &inputs,
        |path, node| file_content(&mut repo.borrow_mut(), path, node),
        |path, node| {
            let mut repo = repo.borrow_mut();
            let filelog = repo.store_mut().filelog(path).ok()?;
            let rev = filelog.revlog().rev_of_node(node)?;
            filelog
                .copy_info(rev)
                .ok()
                .flatten()
                .map(|copy| (copy.path, copy.node))
        },
    )
}

/// Stored content of `path@node`, following the fncache when the node
/// lives in another path's filelog (renames).
fn file_content(repo: &mut Repo, path: &RepoPath, node: &Node) -> Result<Vec<u8>, MergeError> {
    if node.is_null() {
        return Ok(Vec::new());
    }
    let filelog = repo.store_mut().filelog(path)?;
    if let Some(rev) = filelog.revlog().rev_of_node(node) {
        return Ok(filelog.content(rev)?);
    }
    for other_path in repo.store().tracked_filelog_paths() {
        let filelog = repo.store_mut().filelog(&other_path)?;
        if let Some(rev) = filelog.revlog().rev_of_node(node) {
            return Ok(filelog.content(rev)?);
        }
    }
    Err(MergeError::Repo(
        revlog::RevlogError::UnknownNode(*node).into(),
    ))
}

#[allow(clippy::too_many_arguments)]
fn apply_plan(
    repo: &mut Repo,
    ui: &Ui,
    plan: &Plan,
    options: &Options,
    mut merge_state: Option<&mut MergeState>,
    cancel: &AtomicBool,
    mode: Mode,
) -> Result<Stats, MergeError> {
    let mut stats = Stats::default();
    let total = plan.actions.len() as u64;
    let mut position = 0u64;
    let check_cancel = || -> Result<(), MergeError> {
        if cancel.load(Ordering::Relaxed) {
            return Err(MergeError::Cancelled);
        }
        Ok(())
    };

    // Removes free up names for case-only renames and file/directory
    // swaps, so they run first.
    for (path, action) in &plan.actions {
        if !matches!(action, Action::Remove) {
            continue;
        }
        check_cancel()?;
        position += 1;
        ui.progress("updating", position, Some(total));
        repo.working_copy().vfs().unlink(path)?;
        let dirstate = repo.working_copy_mut().dirstate_mut();
        if dirstate.get(path).is_some() {
            let _ = dirstate.remove(path.clone());
        }
        stats.removed += 1;
    }

    for (path, action) in &plan.actions {
        check_cancel()?;
        match action {
            Action::Remove => {}
            Action::Get(info) => {
                position += 1;
                ui.progress("updating", position, Some(total));
                write_file(repo, path, info, mode)?;
                stats.updated += 1;
            }
            Action::DirectoryRename { from, info } => {
                position += 1;
                ui.progress("updating", position, Some(total));
                ui.status(&format!("moving {} to {}", from, path));
                write_file(repo, path, info, mode)?;
                stats.updated += 1;
            }
            Action::CreatedKept {
                local_changed,
                other_info,
            } => {
                position += 1;
                let keep = ui.prompt(
                    &format!(
                        "{} was {} - keep the changed version?",
                        path,
                        if *local_changed {
                            "changed locally but deleted on the other side"
                        } else {
                            "deleted locally but changed on the other side"
                        }
                    ),
                    &["changed", "deleted"],
                ) == 0;
                if keep {
                    if let Some(info) = other_info {
                        write_file(repo, path, info, mode)?;
                        stats.updated += 1;
                    }
                    // Locally-changed version is already in place.
                } else {
                    repo.working_copy().vfs().unlink(path)?;
                    let dirstate = repo.working_copy_mut().dirstate_mut();
                    if dirstate.get(path).is_some() {
                        let _ = dirstate.remove(path.clone());
                    }
                    stats.removed += 1;
                }
            }
            Action::Merge(_) => {}
        }
    }

    for (path, action) in &plan.actions {
        let spec = match action {
            Action::Merge(spec) => spec,
            _ => continue,
        };
        check_cancel()?;
        position += 1;
        ui.progress("updating", position, Some(total));
        let clean = merge_one_file(repo, ui, path, spec, options)?;
        stats.merged += 1;
        if let Some(state) = merge_state.as_deref_mut() {
            state.add_conflict(
                path.clone(),
                spec.base.map(|i| i.node).unwrap_or(NULL_ID),
                spec.local.map(|i| i.node).unwrap_or(NULL_ID),
                spec.other.map(|i| i.node).unwrap_or(NULL_ID),
            );
            if clean {
                state.mark_resolved(path);
            }
            // Flushed per file so an interrupted merge resumes.
            state.write()?;
        }
        if !clean {
            stats.unresolved += 1;
            ui.warn(&format!("merging {} failed", path));
        }
    }

    Ok(stats)
}

/// Write a file from the store into the working copy and record it in
/// the dirstate.
fn write_file(
    repo: &mut Repo,
    path: &RepoPathBuf,
    info: &FileInfo,
    mode: Mode,
) -> Result<(), MergeError> {
    let content = file_content(repo, path, &info.node)?;
    repo.working_copy()
        .vfs()
        .write(path, &content, info.file_type)?;
    record_written(repo, path, mode)?;
    Ok(())
}

fn record_written(repo: &mut Repo, path: &RepoPathBuf, mode: Mode) -> Result<(), MergeError> {
    match mode {
        Mode::Update => {
            // The file now matches the (future) parent: record a clean
            // stat so status trusts it.
            let stat = repo.working_copy().vfs().stat(path)?;
            let dirstate = repo.working_copy_mut().dirstate_mut();
            match stat {
                Some(meta) => {
                    let now = std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .map(|d| d.as_secs() as i32)
                        .unwrap_or(0);
                    let mtime = meta
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                        .map(|d| d.as_secs() as i32)
                        .unwrap_or(dirstate::MTIME_UNSET);
                    // An mtime of this very second cannot be trusted:
                    // another write could land on the same stamp.
                    let mtime = if mtime == now { dirstate::MTIME_UNSET } else { mtime };
                    dirstate.normal(path.clone(), mode_of(&meta), meta.len() as i32, mtime);
                }
                None => dirstate.normal(
                    path.clone(),
                    0,
                    dirstate::SIZE_DIRTY,
                    dirstate::MTIME_UNSET,
                ),
            }
        }
        Mode::Merge => {
            // Part of the pending merge commit: force a content check.
            repo.working_copy_mut()
                .dirstate_mut()
                .merge_mark(path.clone())?;
        }
    }
    Ok(())
}

/// Run the three-way merge for one file. Returns whether it resolved
/// cleanly.
fn merge_one_file(
    repo: &mut Repo,
    ui: &Ui,
    dest: &RepoPathBuf,
    spec: &MergeSpec,
    options: &Options,
) -> Result<bool, MergeError> {
    let base = match &spec.base {
        Some(info) => file_content(repo, &spec.base_path, &info.node)?,
        None => Vec::new(),
    };
    // Local content comes from the working copy when present (it may
    // carry uncommitted edits), else from the store.
    let local = match repo.working_copy().vfs().stat(&spec.local_path)? {
        Some(_) => repo.working_copy().vfs().read(&spec.local_path)?,
        None => match &spec.local {
            Some(info) => file_content(repo, &spec.local_path, &info.node)?,
            None => Vec::new(),
        },
    };
    let other = match &spec.other {
        Some(info) => file_content(repo, &spec.other_path, &info.node)?,
        None => Vec::new(),
    };
    let file_type = merged_file_type(spec);

    // Binary content and symlinks are not text-mergeable: keep local,
    // leave the conflict for the user (or a tool).
    let text_mergeable = file_type != FileType::Symlink
        && !diff3::looks_binary(&base)
        && !diff3::looks_binary(&local)
        && !diff3::looks_binary(&other);

    if !text_mergeable && options.merge_tool.is_none() {
        repo.working_copy().vfs().write(dest, &local, file_type)?;
        record_written(repo, dest, Mode::Merge)?;
        return Ok(false);
    }

    let (content, clean) = match &options.merge_tool {
        Some(tool) => run_merge_tool(repo, tool, &base, &local, &other)?,
        None => {
            let result = diff3::merge(&base, &local, &other, "working copy", "merge rev");
            let clean = result.is_clean();
            (result.content, clean)
        }
    };

    repo.working_copy().vfs().write(dest, &content, file_type)?;
    // Merged results always carry changes relative to the new first
    // parent, so the dirstate gets a content-check marker either way.
    record_written(repo, dest, Mode::Merge)?;
    if !clean && options.merge_tool.is_some() {
        ui.note(&format!("merge tool left {} unresolved", dest));
    }
    Ok(clean)
}

/// Flag merge: a side that changed the type away from the ancestor
/// wins; local wins ties.
fn merged_file_type(spec: &MergeSpec) -> FileType {
    let base = spec.base.map(|i| i.file_type);
    let local = spec.local.map(|i| i.file_type);
    let other = spec.other.map(|i| i.file_type);
    match (local, other) {
        (Some(l), Some(o)) if l == o => l,
        (Some(l), Some(o)) => {
            if Some(l) == base {
                o
            } else {
                l
            }
        }
        (Some(l), None) => l,
        (None, Some(o)) => o,
        (None, None) => FileType::Regular,
    }
}

/// Invoke an external merge tool on temp copies. The tool gets
/// (local, base, other) paths, must write the result over the local
/// file and exit 0 for success.
fn run_merge_tool(
    repo: &Repo,
    tool: &str,
    base: &[u8],
    local: &[u8],
    other: &[u8],
) -> Result<(Vec<u8>, bool), MergeError> {
    let dir = repo.dot_path().join("merge");
    std::fs::create_dir_all(&dir).map_err(RepoError::from)?;
    let base_path = dir.join("base");
    let local_path = dir.join("local");
    let other_path = dir.join("other");
    std::fs::write(&base_path, base).map_err(RepoError::from)?;
    std::fs::write(&local_path, local).map_err(RepoError::from)?;
    std::fs::write(&other_path, other).map_err(RepoError::from)?;

    let status = Command::new(tool)
        .arg(&local_path)
        .arg(&base_path)
        .arg(&other_path)
        .status()
        .map_err(RepoError::from)?;
    let merged = std::fs::read(&local_path).map_err(RepoError::from)?;
    let clean = status.success();
    tracing::debug!(tool, clean, "external merge tool finished");
    Ok((merged, clean))
}

/// Re-run the merge for `path` using the saved merge state; marks the
/// file resolved if it now merges cleanly.
pub fn resolve_file(repo: &mut Repo, ui: &Ui, path: &RepoPath) -> Result<bool, MergeError> {
    let _wlock = repo.lock_working_copy()?;
    let mut state = repo
        .working_copy()
        .merge_state()?
        .ok_or(MergeError::NoMergeState)?;
    let conflict = match state.get(path) {
        Some(conflict) => conflict.clone(),
        None => return Err(MergeError::NoMergeState),
    };
    let options = Options::from_repo(repo)?;

    let base = content_by_node(repo, path, &conflict.ancestor)?;
    let local = content_by_node(repo, path, &conflict.local)?;
    let other = content_by_node(repo, path, &conflict.other)?;
    let (content, clean) = match &options.merge_tool {
        Some(tool) => run_merge_tool(repo, tool, &base, &local, &other)?,
        None => {
            let result = diff3::merge(&base, &local, &other, "working copy", "merge rev");
            let clean = result.is_clean();
            (result.content, clean)
        }
    };
    repo.working_copy()
        .vfs()
        .write(path, &content, FileType::Regular)?;
    repo.working_copy_mut()
        .dirstate_mut()
        .merge_mark(path.to_owned())?;
    if clean {
        state.mark_resolved(path);
        ui.status(&format!("{}: resolved", path));
    } else {
        state.mark_unresolved(path);
        ui.warn(&format!("{}: still unresolved", path));
    }
    state.write()?;
    Ok(clean)
}

/// Mark `path` resolved without re-merging (the user fixed it by
/// hand).
pub fn resolve_mark(repo: &mut Repo, path: &RepoPath) -> Result<(), MergeError> {
    let _wlock = repo.lock_working_copy()?;
    let mut state = repo
        .working_copy()
        .merge_state()?
        .ok_or(MergeError::NoMergeState)?;
    if !state.mark_resolved(path) {
        return Err(MergeError::NoMergeState);
    }
    state.write()?;
    Ok(())
}

fn content_by_node(repo: &mut Repo, hint: &RepoPath, node: &Node) -> Result<Vec<u8>, MergeError> {
    if node.is_null() {
        return Ok(Vec::new());
    }
    file_content(repo, hint, node)
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
