/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Pushrebase: server-side rebase of incoming pushes.
//!
//! When the receiver advertises it and the incoming stack is not based
//! on the target bookmark's current head, the incoming changesets are
//! rebased onto that head inside the receiving transaction, with
//! obsolescence markers original -> rebased. A file touched both by
//! the stack and by the commits it skips over is a conflict and aborts
//! the push. Only linear draft stacks rebase; merges are refused.

use std::collections::HashMap;

use bundles::changegroup::Changegroup;
use bundles::changegroup::Entry;
use bundles::part_names;
use changelog::Changeset;
use repo::Repo;
use repo::RepoError;
use revlog::delta;
use revlog::RevFlags;
use transaction::Transaction;
use types::Node;
use types::RepoPathBuf;
use types::Rev;
use types::NULL_ID;
use types::NULL_REV;
use ui::Ui;

use crate::apply;
use crate::ExchangeError;

/// Apply a pushed bundle, rebasing onto the head of `bookmark` when
/// the incoming stack is based elsewhere.
pub fn apply_pushrebase(
    repo: &mut Repo,
    ui: &Ui,
    bytes: &[u8],
    bookmark: &str,
) -> Result<(), ExchangeError> {
    let parts = apply::read_and_vet_parts(bytes)?;
    let group = parts
        .iter()
        .find(|part| part.canonical_name() == part_names::CHANGEGROUP)
        .map(|part| Changegroup::decode(&part.payload[..]))
        .transpose()?
        .unwrap_or_default();

    let onto_node = repo
        .store()
        .bookmarks()
        .get(bookmark)
        .unwrap_or(NULL_ID);
    let fast_forward = group
        .changelog
        .first()
        .map(|entry| entry.p1 == onto_node)
        .unwrap_or(true);

    if fast_forward {
        // Based on the bookmark head already: a plain apply, then the
        // bookmark advances.
        crate::apply_bundle(repo, ui, bytes)?;
        if let Some(tip_entry) = group.changelog.last() {
            let _lock = repo.lock_store()?;
            let mut txn = repo.begin_transaction()?;
            repo.store_mut()
                .bookmarks_mut()
                .set(&mut txn, bookmark, tip_entry.node)?;
            txn.commit(&repo.store().undo_path())
                .map_err(RepoError::from)?;
        }
        return Ok(());
    }

    let _lock = repo.lock_store()?;
    let mut txn = repo.begin_transaction()?;
    let result = rebase_group(repo, ui, &mut txn, &group, bookmark, onto_node);
    match result {
        Ok(()) => {
            txn.commit(&repo.store().undo_path())
                .map_err(RepoError::from)?;
            Ok(())
        }
        Err(err) => {
            let _ = txn.abort();
            repo.reload_store()?;
            Err(err)
        }
    }
}

fn rebase_group(
    repo: &mut Repo,
    ui: &Ui,
    txn: &mut Transaction,
    group: &Changegroup,
    bookmark: &str,
    onto_node: Node,
) -> Result<(), ExchangeError> {
    // Reconstruct incoming payloads in memory; nothing is written until
    // the rebased versions go in.
    let changesets = reconstruct_changesets(repo, group)?;
    let file_payloads = reconstruct_files(repo, group)?;

    let mut onto_rev = repo
        .store()
        .rev_of_node(&onto_node)
        .ok_or_else(|| ExchangeError::Bundle(bundles::BundleError::Malformed(
            format!("pushrebase target {} unknown", bookmark),
        )))?;

    let mut rebased = Vec::new();
    let mut markers = Vec::new();
    // Old manifests of already-walked incoming changesets, by
    // changeset node (stacks are ordered parents-first).
    let mut old_manifests: HashMap<Node, manifest::Manifest> = HashMap::new();
    for (old_node, entry, changeset) in &changesets {
        if !entry.p2.is_null() {
            return Err(ExchangeError::PushRebaseMerge(*old_node));
        }
        let old_parent_manifest = match repo.store().rev_of_node(&entry.p1) {
            Some(rev) => (*manifest_of_rev(repo, rev)?).clone(),
            None => old_manifests.get(&entry.p1).cloned().ok_or_else(|| {
                ExchangeError::Bundle(bundles::BundleError::Malformed(format!(
                    "pushrebase stack parent {} unknown",
                    entry.p1
                )))
            })?,
        };
        let old_manifest_text = manifest_text_by_node(repo, &changeset.manifest_node, group)?;
        let old_manifest = manifest::Manifest::parse(&old_manifest_text)
            .map_err(RepoError::from)?;
        old_manifests.insert(*old_node, old_manifest.clone());
        let changes = old_parent_manifest.diff(&old_manifest);

        // Conflict rule: the rebase target must not have touched any
        // of these paths since the stack's base.
        let onto_manifest = manifest_of_rev(repo, onto_rev)?;
        for (path, _) in &changes {
            let in_onto = onto_manifest.get(path);
            let in_base = old_parent_manifest.get(path);
            if in_onto != in_base {
                return Err(ExchangeError::PushRebaseConflict(path.clone()));
            }
        }

        // Build the rebased changeset on top of onto_rev.
        let mut new_manifest = (*onto_manifest).clone();
        let link_rev = repo.store().changelog().len() as Rev;
        for (path, diff_entry) in &changes {
            match diff_entry.right {
                None => {
                    new_manifest.remove(path);
                }
                Some(new_info) => {
                    let payload = file_payloads
                        .get(&(path.clone(), new_info.node))
                        .cloned()
                        .ok_or_else(|| {
                            ExchangeError::Bundle(bundles::BundleError::Malformed(
                                format!("missing file payload for {}", path),
                            ))
                        })?;
                    repo.store_mut().register_filelog(txn, path)?;
                    let filelog = repo.store_mut().filelog(path)?;
                    let fp1 = new_manifest
                        .get(path)
                        .and_then(|info| filelog.revlog().rev_of_node(&info.node))
                        .unwrap_or(NULL_REV);
                    let (_, file_node) = filelog
                        .revlog_mut()
                        .append(txn, &payload, fp1, NULL_REV, link_rev, RevFlags::empty())
                        .map_err(RepoError::from)?;
                    new_manifest.insert(
                        path.clone(),
                        manifest::FileInfo::new(file_node, new_info.file_type),
                    );
                }
            }
        }

        let onto_manifest_node = repo
            .store()
            .changelog()
            .changeset(onto_rev)?
            .manifest_node;
        let m1_rev = repo
            .store()
            .manifest_log()
            .rev_of_node(&onto_manifest_node)
            .unwrap_or(NULL_REV);
        let (_, new_manifest_node) = repo.store_mut().manifest_log_mut().add(
            txn,
            &new_manifest,
            m1_rev,
            NULL_REV,
            link_rev,
        )?;

        let new_changeset = Changeset {
            manifest_node: new_manifest_node,
            ..changeset.clone()
        };
        let (new_rev, new_node) = repo.store_mut().changelog_mut().add(
            txn,
            &new_changeset,
            onto_rev,
            NULL_REV,
        )?;
        markers.push(obsstore::Marker::new(*old_node, vec![new_node]));
        rebased.push(new_rev);
        onto_rev = new_rev;
        ui.status(&format!("rebased {} onto {}", old_node, new_node));
    }

    if rebased.is_empty() {
        return Ok(());
    }

    // The rebased stack is public history now; the originals become
    // obsolete (they only ever existed on the client, the markers
    // travel back on the next pull).
    repo.mark_draft(txn, &rebased)?;
    repo.publish(txn, &rebased)?;
    repo.add_obsmarkers(txn, markers)?;

    let tip_node = repo.store().node_of_rev(onto_rev)?;
    repo.store_mut()
        .bookmarks_mut()
        .set(txn, bookmark, tip_node)?;
    Ok(())
}

/// Parse every incoming changeset payload, in group order.
fn reconstruct_changesets(
    repo: &Repo,
    group: &Changegroup,
) -> Result<Vec<(Node, Entry, Changeset)>, ExchangeError> {
    let mut texts: HashMap<Node, Vec<u8>> = HashMap::new();
    let mut out = Vec::new();
    for entry in &group.changelog {
        let payload = reconstruct_payload(
            entry,
            |node| match repo.store().rev_of_node(node) {
                Some(rev) => repo
                    .store()
                    .changelog()
                    .revlog()
                    .text(rev)
                    .map(Some)
                    .map_err(|e| RepoError::from(e).into()),
                None => Ok(texts.get(node).cloned()),
            },
        )?;
        let changeset = Changeset::parse(&payload).map_err(RepoError::from)?;
        texts.insert(entry.node, payload);
        out.push((entry.node, entry.clone(), changeset));
    }
    Ok(out)
}

/// Reconstruct all incoming file payloads, keyed by (path, node).
fn reconstruct_files(
    repo: &mut Repo,
    group: &Changegroup,
) -> Result<HashMap<(RepoPathBuf, Node), Vec<u8>>, ExchangeError> {
    let mut out: HashMap<(RepoPathBuf, Node), Vec<u8>> = HashMap::new();
    for (path, entries) in &group.files {
        for entry in entries {
            let filelog = repo.store_mut().filelog(path)?;
            let local_text = |node: &Node| -> Result<Option<Vec<u8>>, ExchangeError> {
                match filelog.revlog().rev_of_node(node) {
                    Some(rev) => filelog
                        .revlog()
                        .text(rev)
                        .map(Some)
                        .map_err(|e| RepoError::from(e).into()),
                    None => Ok(out.get(&(path.clone(), *node)).cloned()),
                }
            };
            let payload = reconstruct_payload(entry, local_text)?;
            out.insert((path.clone(), entry.node), payload);
        }
    }
    Ok(out)
}

fn reconstruct_payload(
    entry: &Entry,
    lookup_base: impl Fn(&Node) -> Result<Option<Vec<u8>>, ExchangeError>,
) -> Result<Vec<u8>, ExchangeError> {
    let base = if entry.delta_base.is_null() {
        Vec::new()
    } else {
        lookup_base(&entry.delta_base)?.ok_or_else(|| {
            ExchangeError::Bundle(bundles::BundleError::Malformed(format!(
                "delta base {} unavailable",
                entry.delta_base
            )))
        })?
    };
    let fragments = delta::deserialize(&entry.delta).map_err(RepoError::from)?;
    Ok(delta::apply(&base, &fragments).map_err(RepoError::from)?)
}

fn manifest_of_rev(
    repo: &Repo,
    rev: Rev,
) -> Result<std::sync::Arc<manifest::Manifest>, ExchangeError> {
    if rev == NULL_REV {
        return Ok(std::sync::Arc::new(manifest::Manifest::new()));
    }
    let node = repo.store().changelog().changeset(rev)?.manifest_node;
    Ok(repo.store().manifest_log().get(&node)?)
}

/// Full text of a manifest node: local, or reconstructed from the
/// group.
fn manifest_text_by_node(
    repo: &Repo,
    node: &Node,
    group: &Changegroup,
) -> Result<Vec<u8>, ExchangeError> {
    if let Some(rev) = repo.store().manifest_log().rev_of_node(node) {
        return Ok(repo
            .store()
            .manifest_log()
            .revlog()
            .text(rev)
            .map_err(RepoError::from)?);
    }
    // Reconstruct through the group's manifest entries, which may chain
    // onto each other.
    let mut texts: HashMap<Node, Vec<u8>> = HashMap::new();
    for entry in &group.manifests {
        let payload = reconstruct_payload(entry, |base| {
            if let Some(rev) = repo.store().manifest_log().rev_of_node(base) {
                return repo
                    .store()
                    .manifest_log()
                    .revlog()
                    .text(rev)
                    .map(Some)
                    .map_err(|e| RepoError::from(e).into());
            }
            Ok(texts.get(base).cloned())
        })?;
        texts.insert(entry.node, payload);
    }
    texts.remove(node).ok_or_else(|| {
        ExchangeError::Bundle(bundles::BundleError::Malformed(format!(
            "manifest {} not in changegroup",
            node
        )))
    })
}
