/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Repository verification.
//!
//! Walks the whole store and reports every violation of the structural
//! invariants instead of stopping at the first: node hashes recompute,
//! delta chains terminate, every changeset's manifest resolves, every
//! file a changeset touches has a filelog entry linked back to it, and
//! hidden never intersects public.

use std::collections::HashSet;

use types::Rev;

use crate::errors::RepoError;
use crate::phases::Phase;
use crate::Repo;

#[derive(Debug, Default)]
pub struct VerifyReport {
    pub problems: Vec<String>,
    pub checked_changesets: usize,
    pub checked_manifests: usize,
    pub checked_files: usize,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }

    fn problem(&mut self, message: String) {
        tracing::warn!(%message, "verify");
        self.problems.push(message);
    }
}

/// Verify the store. Read-only; safe without locks (the snapshot rule
/// applies).
pub fn verify(repo: &mut Repo) -> Result<VerifyReport, RepoError> {
    let mut report = VerifyReport::default();

    let changelog_len = repo.store().changelog().len() as Rev;
    for rev in 0..changelog_len {
        report.checked_changesets += 1;
        let changeset = match repo.store().changelog().changeset(rev) {
            Ok(changeset) => changeset,
            Err(err) => {
                report.problem(format!("changeset {}: {}", rev, err));
                continue;
            }
        };
        let manifest_rev = repo
            .store()
            .manifest_log()
            .rev_of_node(&changeset.manifest_node);
        let manifest_rev = match manifest_rev {
            None if changeset.manifest_node.is_null() => None,
            None => {
                report.problem(format!(
                    "changeset {}: manifest {} not in manifest log",
                    rev, changeset.manifest_node
                ));
                continue;
            }
            Some(manifest_rev) => Some(manifest_rev),
        };
        if let Some(manifest_rev) = manifest_rev {
            let link = repo.store().manifest_log().revlog().link_rev(manifest_rev)?;
            if link > rev {
                report.problem(format!(
                    "manifest rev {} links to {} which is after changeset {}",
                    manifest_rev, link, rev
                ));
            }
        }
        // Every touched file must have a filelog entry created by this
        // changeset.
        for path in &changeset.files {
            let manifest = repo.store().manifest_log().get(&changeset.manifest_node)?;
            let expected = manifest.get(path).map(|info| info.node);
            let filelog = repo.store_mut().filelog(path)?;
            match expected {
                Some(node) => {
                    match filelog.revlog().rev_of_node(&node) {
                        None => report.problem(format!(
                            "changeset {}: file {} node {} missing from filelog",
                            rev, path, node
                        )),
                        Some(file_rev) => {
                            let link = filelog.revlog().link_rev(file_rev)?;
                            if link != rev {
                                report.problem(format!(
                                    "filelog {} rev {} has link rev {}, expected {}",
                                    path, file_rev, link, rev
                                ));
                            }
                        }
                    }
                }
                None => {
                    // Touched but absent from the manifest: a removal.
                    // Nothing to cross-check in the filelog.
                }
            }
        }
    }

    // Hash-verify every manifest and filelog payload.
    let manifest_len = repo.store().manifest_log().revlog().len() as Rev;
    for rev in 0..manifest_len {
        report.checked_manifests += 1;
        if let Err(err) = repo.store().manifest_log().revlog().text(rev) {
            if !matches!(err, revlog::RevlogError::Censored { .. }) {
                report.problem(format!("manifest rev {}: {}", rev, err));
            }
        }
    }
    for path in repo.store().tracked_filelog_paths() {
        let changelog_len = repo.store().changelog().len() as Rev;
        let filelog = repo.store_mut().filelog(&path)?;
        for rev in 0..filelog.revlog().len() as Rev {
            report.checked_files += 1;
            if let Err(err) = filelog.revlog().text(rev) {
                if !matches!(err, revlog::RevlogError::Censored { .. }) {
                    report.problem(format!("filelog {} rev {}: {}", path, rev, err));
                }
            }
            let link = filelog.revlog().link_rev(rev)?;
            if link < 0 || link >= changelog_len {
                report.problem(format!(
                    "filelog {} rev {}: link rev {} out of range",
                    path, rev, link
                ));
            }
        }
    }

    // Hidden and public must not intersect.
    let hidden: HashSet<Rev> = repo.hidden_revs()?.into_iter().collect();
    let phases = repo.phase_vector()?;
    for rev in 0..changelog_len {
        if hidden.contains(&rev) && phases[rev as usize] == Phase::Public {
            report.problem(format!("rev {} is both hidden and public", rev));
        }
    }

    tracing::info!(
        changesets = report.checked_changesets,
        manifests = report.checked_manifests,
        files = report.checked_files,
        problems = report.problems.len(),
        "verify finished"
    );
    Ok(report)
}
