/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Working-copy status.
//!
//! Dirstate entries carry the (mode, size, mtime) observed at the last
//! refresh; a matching stat means clean without reading the file. On
//! mismatch the content is compared against the parent manifest's file
//! node. Unknown files come from a filesystem walk that skips the
//! metadata directory.

use std::collections::BTreeSet;
use std::path::Path;

use dirstate::EntryState;
use types::RepoPathBuf;

use crate::errors::RepoError;
use crate::Repo;
use crate::DOT_DIR;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Status {
    pub modified: Vec<RepoPathBuf>,
    pub added: Vec<RepoPathBuf>,
    pub removed: Vec<RepoPathBuf>,
    /// Tracked but missing from disk.
    pub deleted: Vec<RepoPathBuf>,
    pub unknown: Vec<RepoPathBuf>,
    pub clean: Vec<RepoPathBuf>,
}

impl Status {
    pub fn is_clean(&self) -> bool {
        self.modified.is_empty()
            && self.added.is_empty()
            && self.removed.is_empty()
            && self.deleted.is_empty()
    }
}

/// Compute status against the first working-copy parent.
pub fn status(repo: &mut Repo, list_unknown: bool, list_clean: bool) -> Result<Status, RepoError> {
    let mut result = Status::default();
    let (p1, _) = repo.working_copy().dirstate().parents();
    let p1_manifest = repo.store().manifest_log().get(&p1)?;

    let entries: Vec<(RepoPathBuf, dirstate::DirstateEntry)> = repo
        .working_copy()
        .dirstate()
        .iter()
        .map(|(path, entry)| (path.to_owned(), entry.clone()))
        .collect();

    for (path, entry) in entries {
        match entry.state {
            EntryState::Added => {
                if repo.working_copy().vfs().stat(&path)?.is_some() {
                    result.added.push(path);
                } else {
                    result.deleted.push(path);
                }
            }
            EntryState::Removed => result.removed.push(path),
            EntryState::Normal | EntryState::Merged => {
                let meta = match repo.working_copy().vfs().stat(&path)? {
                    None => {
                        result.deleted.push(path);
                        continue;
                    }
                    Some(meta) => meta,
                };
                let mtime = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(-1);
                let mode = file_mode(&meta);
                if entry.state == EntryState::Normal
                    && entry.maybe_clean(mode, meta.len(), mtime)
                {
                    if list_clean {
                        result.clean.push(path);
                    }
                    continue;
                }
                // Stat cache miss: compare content against the parent
                // manifest.
                let changed = match p1_manifest.get(&path) {
                    None => true,
                    Some(info) => {
                        let content = repo.working_copy().vfs().read(&path)?;
                        let store = repo.store_mut();
                        let filelog = store.filelog(&path)?;
                        match filelog.revlog().rev_of_node(&info.node) {
                            None => true,
                            Some(rev) => !filelog.content_equals(rev, &content)?,
                        }
                    }
                };
                if changed {
                    result.modified.push(path);
                } else if list_clean {
                    result.clean.push(path);
                }
            }
        }
    }

    if list_unknown {
        let tracked: BTreeSet<RepoPathBuf> = repo
            .working_copy()
            .dirstate()
            .iter()
            .map(|(path, _)| path.to_owned())
            .collect();
        let mut found = Vec::new();
        walk(repo.working_copy().vfs().root(), Path::new(""), &mut found)?;
        for path in found {
            if !tracked.contains(&path) {
                result.unknown.push(path);
            }
        }
    }
    Ok(result)
}

fn walk(
    root: &Path,
    relative: &Path,
    out: &mut Vec<RepoPathBuf>,
) -> Result<(), RepoError> {
    let dir = root.join(relative);
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if relative.as_os_str().is_empty() && name == DOT_DIR {
            continue;
        }
        let child = relative.join(&*name);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(root, &child, out)?;
        } else {
            let text = child.to_string_lossy().replace('\\', "/");
            if let Ok(path) = RepoPathBuf::from_string(text) {
                out.push(path);
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> u32 {
    0o100644
}
