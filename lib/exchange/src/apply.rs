/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Transactional bundle application.
//!
//! All parts are decoded (and unknown mandatory parts rejected) before
//! the first store write. Inside the transaction, the changegroup goes
//! in bottom-up: filelogs, then manifests, then the changelog, so a
//! crash at any point leaves no changeset without its data; the journal
//! rolls back everything else. Obsmarkers, phase heads and bookmarks
//! follow, then the `pretxnchangegroup` hook gets its veto before the
//! transaction commits.

use std::collections::HashMap;

use bundles::changegroup::Changegroup;
use bundles::changegroup::Entry;
use bundles::part_names;
use bundles::BundleError;
use bundles::BundleReader;
use bundles::Part;
use repo::HookArgs;
use repo::HookEvent;
use repo::Repo;
use repo::RepoError;
use revlog::delta;
use revlog::RevFlags;
use revlog::Revlog;
use transaction::Transaction;
use types::Node;
use types::Rev;
use types::NULL_REV;
use ui::Ui;

use crate::ExchangeError;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct AppliedStats {
    pub changesets: usize,
    pub manifests: usize,
    pub filerevs: usize,
    pub markers: usize,
    pub bookmarks: usize,
}

/// Apply a bundle to the repository.
pub fn apply_bundle(
    repo: &mut Repo,
    ui: &Ui,
    bytes: &[u8],
) -> Result<AppliedStats, ExchangeError> {
    let parts = read_and_vet_parts(bytes)?;

    // check:heads is optimistic concurrency: the sender pins the heads
    // it based its bundle on. Checked before any write.
    for part in &parts {
        if part.canonical_name() == part_names::CHECK_HEADS {
            let expected = decode_nodes(&part.payload)?;
            let mut actual = repo.heads()?;
            let mut expected_sorted = expected;
            actual.sort();
            expected_sorted.sort();
            if actual != expected_sorted {
                return Err(ExchangeError::HeadsChanged);
            }
        }
    }

    let _lock = repo.lock_store()?;
    let mut txn = repo.begin_transaction()?;
    let result = apply_parts(repo, ui, &mut txn, &parts);
    match result {
        Ok(stats) => {
            txn.commit(&repo.store().undo_path())
                .map_err(RepoError::from)?;
            let _ = repo.hooks().fire(&HookArgs {
                event: HookEvent::TxnClose,
                repo_root: repo.root(),
                node: None,
                key: None,
            });
            Ok(stats)
        }
        Err(err) => {
            let _ = txn.abort();
            repo.reload_store()?;
            Err(err)
        }
    }
}

/// Decode every part up front; unknown mandatory parts abort before
/// anything is written.
pub(crate) fn read_and_vet_parts(bytes: &[u8]) -> Result<Vec<Part>, ExchangeError> {
    let mut reader = BundleReader::new(bytes)?;
    let mut parts = Vec::new();
    while let Some(part) = reader.next_part()? {
        let name = part.canonical_name();
        match name.as_str() {
            part_names::ERROR => {
                return Err(BundleError::RemoteError(
                    String::from_utf8_lossy(&part.payload).into_owned(),
                )
                .into());
            }
            part_names::CHANGEGROUP
            | part_names::OBSMARKERS
            | part_names::PHASE_HEADS
            | part_names::BOOKMARKS
            | part_names::PUSHKEY
            | part_names::CHECK_HEADS => parts.push(part),
            _ if name.starts_with(part_names::REPLY_PREFIX) => {
                tracing::debug!(name, "ignoring reply part");
            }
            _ if part.is_mandatory() => {
                return Err(BundleError::UnknownMandatoryPart(part.name.clone()).into());
            }
            _ => {
                tracing::debug!(name, "ignoring unknown advisory part");
            }
        }
    }
    Ok(parts)
}

fn apply_parts(
    repo: &mut Repo,
    ui: &Ui,
    txn: &mut Transaction,
    parts: &[Part],
) -> Result<AppliedStats, ExchangeError> {
    let mut stats = AppliedStats::default();
    let mut first_new_node = None;

    // Changegroups first: later parts may reference the new changesets.
    for part in parts {
        if part.canonical_name() != part_names::CHANGEGROUP {
            continue;
        }
        let group = Changegroup::decode(&part.payload[..])?;
        let applied = apply_changegroup(repo, ui, txn, &group)?;
        stats.changesets += applied.changesets;
        stats.manifests += applied.manifests;
        stats.filerevs += applied.filerevs;
        if first_new_node.is_none() {
            first_new_node = applied.first_new_node;
        }
    }

    for part in parts {
        match part.canonical_name().as_str() {
            part_names::OBSMARKERS => {
                let markers = obsstore::decode_markers(&part.payload)
                    .map_err(RepoError::from)?;
                stats.markers += repo.add_obsmarkers(txn, markers)?;
            }
            part_names::PHASE_HEADS => {
                let revs: Vec<Rev> = decode_nodes(&part.payload)?
                    .into_iter()
                    .filter_map(|node| repo.store().rev_of_node(&node))
                    .collect();
                if !revs.is_empty() {
                    repo.publish(txn, &revs)?;
                }
            }
            part_names::BOOKMARKS => {
                let text = String::from_utf8_lossy(&part.payload).into_owned();
                for line in text.lines() {
                    if let Some((hex, name)) = line.split_once(' ') {
                        if let Ok(node) = Node::from_hex(hex.as_bytes()) {
                            if repo.store().rev_of_node(&node).is_some() {
                                repo.store_mut()
                                    .bookmarks_mut()
                                    .set(txn, name, node)?;
                                stats.bookmarks += 1;
                            }
                        }
                    }
                }
            }
            part_names::PUSHKEY => {
                let namespace = part.param("namespace").unwrap_or_default().to_string();
                let key = part.param("key").unwrap_or_default().to_string();
                let new = part.param("new").unwrap_or_default().to_string();
                repo.hooks().fire(&HookArgs {
                    event: HookEvent::PrePushkey,
                    repo_root: repo.root(),
                    node: None,
                    key: Some((&namespace, &key)),
                })?;
                if namespace == "bookmarks" {
                    if let Ok(node) = Node::from_hex(new.as_bytes()) {
                        repo.store_mut().bookmarks_mut().set(txn, &key, node)?;
                        stats.bookmarks += 1;
                    }
                }
            }
            _ => {}
        }
    }

    repo.hooks().fire(&HookArgs {
        event: HookEvent::PreTxnChangegroup,
        repo_root: repo.root(),
        node: first_new_node,
        key: None,
    })?;
    Ok(stats)
}

pub(crate) struct GroupStats {
    pub(crate) changesets: usize,
    pub(crate) manifests: usize,
    pub(crate) filerevs: usize,
    pub(crate) first_new_node: Option<Node>,
}

/// Stream one changegroup into the revlogs, changelog last.
pub(crate) fn apply_changegroup(
    repo: &mut Repo,
    ui: &Ui,
    txn: &mut Transaction,
    group: &Changegroup,
) -> Result<GroupStats, ExchangeError> {
    // Future changelog revs: entries are appended in group order, so
    // link nodes resolve before the changelog itself is written.
    let mut future_clrev: HashMap<Node, Rev> = HashMap::new();
    let mut next = repo.store().changelog().len() as Rev;
    for entry in &group.changelog {
        if repo.store().rev_of_node(&entry.node).is_none() {
            future_clrev.insert(entry.node, next);
            next += 1;
        }
    }
    let clrev_of = |repo: &Repo, node: &Node| -> Option<Rev> {
        repo.store()
            .rev_of_node(node)
            .or_else(|| future_clrev.get(node).copied())
    };

    // Files first.
    let mut filerevs = 0;
    for (path, entries) in &group.files {
        repo.store_mut().register_filelog(txn, path)?;
        for entry in entries {
            let link = clrev_of(repo, &entry.link_node).ok_or_else(|| {
                corrupt(format!("file {} links to unknown changeset", path))
            })?;
            let filelog = repo.store_mut().filelog(path)?;
            if append_entry(filelog.revlog_mut(), txn, entry, link)? {
                filerevs += 1;
            }
        }
        ui.progress("files", filerevs as u64, None);
    }

    // Manifests.
    let mut manifests = 0;
    for entry in &group.manifests {
        let link = clrev_of(repo, &entry.link_node)
            .ok_or_else(|| corrupt("manifest links to unknown changeset".to_string()))?;
        let manifest_revlog = repo.store_mut().manifest_log_mut().revlog_mut();
        if append_entry(manifest_revlog, txn, entry, link)? {
            manifests += 1;
        }
    }

    // Changelog last: a crash before this point leaves data revs that
    // nothing references, which verify tolerates and strip can clean.
    let mut changesets = 0;
    let mut first_new_node = None;
    let mut new_revs = Vec::new();
    for entry in &group.changelog {
        let expected_rev = match future_clrev.get(&entry.node) {
            None => continue, // already known
            Some(&rev) => rev,
        };
        let changelog_revlog = repo.store_mut().changelog_mut().revlog_mut();
        let link = expected_rev;
        if !append_entry(changelog_revlog, txn, entry, link)? {
            return Err(corrupt("duplicate changelog entry out of order".to_string()));
        }
        let got = repo.store().rev_of_node(&entry.node);
        if got != Some(expected_rev) {
            return Err(corrupt(format!(
                "changelog rev mismatch for {} (expected {}, got {:?})",
                entry.node, expected_rev, got
            )));
        }
        changesets += 1;
        new_revs.push(expected_rev);
        if first_new_node.is_none() {
            first_new_node = Some(entry.node);
        }
        ui.progress("changesets", changesets as u64, None);
    }

    // Incoming changesets default to draft; a phase-heads part may
    // publish them right after.
    if !new_revs.is_empty() {
        repo.mark_draft(txn, &new_revs)?;
    }

    Ok(GroupStats {
        changesets,
        manifests,
        filerevs,
        first_new_node,
    })
}

/// Append one wire entry. Returns false if the node already existed.
fn append_entry(
    revlog: &mut Revlog,
    txn: &mut Transaction,
    entry: &Entry,
    link_rev: Rev,
) -> Result<bool, ExchangeError> {
    if revlog.rev_of_node(&entry.node).is_some() {
        return Ok(false);
    }
    let base_text = if entry.delta_base.is_null() {
        Vec::new()
    } else {
        let base_rev = revlog.rev_of_node(&entry.delta_base).ok_or_else(|| {
            corrupt(format!("delta base {} unknown", entry.delta_base))
        })?;
        revlog.text(base_rev).map_err(RepoError::from)?
    };
    let fragments = delta::deserialize(&entry.delta).map_err(RepoError::from)?;
    let payload = delta::apply(&base_text, &fragments).map_err(RepoError::from)?;

    let p1 = resolve_parent(revlog, &entry.p1)?;
    let p2 = resolve_parent(revlog, &entry.p2)?;
    let (_, node) = revlog
        .append(txn, &payload, p1, p2, link_rev, RevFlags::empty())
        .map_err(RepoError::from)?;
    if node != entry.node {
        return Err(corrupt(format!(
            "entry hashed to {}, wire said {}",
            node, entry.node
        )));
    }
    Ok(true)
}

fn resolve_parent(revlog: &Revlog, node: &Node) -> Result<Rev, ExchangeError> {
    if node.is_null() {
        return Ok(NULL_REV);
    }
    revlog
        .rev_of_node(node)
        .ok_or_else(|| corrupt(format!("parent {} unknown", node)))
}

fn decode_nodes(payload: &[u8]) -> Result<Vec<Node>, ExchangeError> {
    if payload.len() % 20 != 0 {
        return Err(corrupt("node list payload not a multiple of 20".to_string()));
    }
    Ok(payload
        .chunks(20)
        .map(|chunk| Node::from_slice(chunk).expect("20 bytes"))
        .collect())
}

fn corrupt(message: String) -> ExchangeError {
    ExchangeError::Bundle(BundleError::Malformed(message))
}
