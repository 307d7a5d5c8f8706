/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Bundle generation: package `ancestors(heads) - ancestors(common)`
//! as a bundle2 stream.
//!
//! Entries delta against p1, which the receiver provably has: every
//! parent of an outgoing rev is either outgoing itself (sent earlier in
//! the stream) or an ancestor of the common set. Alongside the
//! changegroup ride phase-heads, obsolescence markers for the outgoing
//! changesets, bookmarks, and optionally a `check:heads` guard.

use bundles::changegroup::Changegroup;
use bundles::changegroup::Entry;
use bundles::part_names;
use bundles::BundleWriter;
use bundles::Part;
use dag::Dag;
use repo::phases::Phase;
use repo::store::ChangelogSource;
use repo::Repo;
use revlog::delta;
use revlog::Revlog;
use types::Node;
use types::Rev;
use types::NULL_REV;

use crate::ExchangeError;

/// Changelog revs in `ancestors(local heads) - ancestors(common)`,
/// ascending.
pub fn outgoing_revs(repo: &Repo, common: &[Node]) -> Result<Vec<Rev>, ExchangeError> {
    let common_revs: Vec<Rev> = common
        .iter()
        .filter(|node| !node.is_null())
        .filter_map(|node| repo.store().rev_of_node(node))
        .collect();
    let source = ChangelogSource(repo.store().changelog());
    let dag = Dag::new(&source);
    let common_closure: std::collections::HashSet<Rev> =
        dag.ancestors(&common_revs)?.into_iter().collect();
    let hidden: std::collections::HashSet<Rev> =
        repo.hidden_revs()?.into_iter().collect();
    Ok((0..repo.store().changelog().len() as Rev)
        .filter(|rev| !common_closure.contains(rev) && !hidden.contains(rev))
        .collect())
}

/// Serialize a bundle for the given exchange window.
pub fn generate_bundle(
    repo: &mut Repo,
    common: &[Node],
    heads: &[Node],
    check_heads: Option<&[Node]>,
) -> Result<Vec<u8>, ExchangeError> {
    // Outgoing, clipped to the ancestry of the requested heads.
    let outgoing = {
        let all = outgoing_revs(repo, common)?;
        let head_revs: Vec<Rev> = heads
            .iter()
            .filter(|node| !node.is_null())
            .filter_map(|node| repo.store().rev_of_node(node))
            .collect();
        let source = ChangelogSource(repo.store().changelog());
        let dag = Dag::new(&source);
        let wanted: std::collections::HashSet<Rev> =
            dag.ancestors(&head_revs)?.into_iter().collect();
        all.into_iter()
            .filter(|rev| wanted.contains(rev))
            .collect::<Vec<Rev>>()
    };

    let mut writer = BundleWriter::new(Vec::new(), &[("version", "2")])?;

    if let Some(expected) = check_heads {
        let mut payload = Vec::with_capacity(expected.len() * 20);
        for node in expected {
            payload.extend_from_slice(node.as_bytes());
        }
        writer.add_part(Part::new(part_names::CHECK_HEADS, payload).mandatory())?;
    }

    let group = build_changegroup(repo, &outgoing)?;
    writer.add_part(
        Part::new(part_names::CHANGEGROUP, group.encode()?)
            .with_param("version", "02")
            .mandatory(),
    )?;

    // Phase heads: the heads of our public set, so the receiver can
    // advance its own boundary.
    let phases = repo.phase_vector()?;
    let public: Vec<Rev> = (0..repo.store().changelog().len() as Rev)
        .filter(|&rev| phases[rev as usize] == Phase::Public)
        .collect();
    let source = ChangelogSource(repo.store().changelog());
    let dag = Dag::new(&source);
    let mut payload = Vec::new();
    for rev in dag.heads(&public)? {
        payload.extend_from_slice(repo.store().node_of_rev(rev)?.as_bytes());
    }
    writer.add_part(Part::new(part_names::PHASE_HEADS, payload))?;

    // Obsolescence markers about anything we are sending.
    let outgoing_nodes: std::collections::HashSet<Node> = outgoing
        .iter()
        .map(|&rev| repo.store().node_of_rev(rev))
        .collect::<Result<_, _>>()?;
    let markers: Vec<obsstore::Marker> = repo
        .store()
        .obsstore()
        .markers()
        .iter()
        .filter(|marker| {
            outgoing_nodes.contains(&marker.predecessor)
                || marker
                    .successors
                    .iter()
                    .any(|s| outgoing_nodes.contains(s))
        })
        .cloned()
        .collect();
    if !markers.is_empty() {
        writer.add_part(Part::new(
            part_names::OBSMARKERS,
            obsstore::encode_markers(&markers),
        ))?;
    }

    // Bookmarks, advisory.
    let mut payload = Vec::new();
    for (name, node) in repo.store().bookmarks().iter() {
        payload.extend_from_slice(format!("{} {}\n", node.to_hex(), name).as_bytes());
    }
    if !payload.is_empty() {
        writer.add_part(Part::new(part_names::BOOKMARKS, payload))?;
    }

    tracing::info!(changesets = outgoing.len(), "bundle generated");
    Ok(writer.finish()?)
}

fn build_changegroup(repo: &mut Repo, outgoing: &[Rev]) -> Result<Changegroup, ExchangeError> {
    let mut group = Changegroup::default();

    // Changelog section, ascending rev order.
    for &rev in outgoing {
        group
            .changelog
            .push(entry_for(repo.store().changelog().revlog(), rev, None)?);
    }

    // Manifest entries introduced by the outgoing changesets.
    let outgoing_set: std::collections::HashSet<Rev> = outgoing.iter().copied().collect();
    let manifest_revlog = repo.store().manifest_log().revlog();
    for rev in 0..manifest_revlog.len() as Rev {
        if outgoing_set.contains(&manifest_revlog.link_rev(rev)?) {
            let link_node = repo
                .store()
                .node_of_rev(manifest_revlog.link_rev(rev)?)?;
            group
                .manifests
                .push(entry_for(manifest_revlog, rev, Some(link_node))?);
        }
    }

    // Filelog sections, path order per the fncache.
    for path in repo.store().tracked_filelog_paths() {
        let changelog_len = repo.store().changelog().len() as Rev;
        let mut link_nodes = Vec::new();
        {
            let filelog = repo.store_mut().filelog(&path)?;
            for rev in 0..filelog.revlog().len() as Rev {
                let link = filelog.revlog().link_rev(rev)?;
                if link >= 0 && link < changelog_len && outgoing_set.contains(&link) {
                    link_nodes.push((rev, link));
                }
            }
        }
        if link_nodes.is_empty() {
            continue;
        }
        let mut entries = Vec::new();
        for (rev, link) in link_nodes {
            let link_node = repo.store().node_of_rev(link)?;
            let filelog = repo.store_mut().filelog(&path)?;
            entries.push(entry_for(filelog.revlog(), rev, Some(link_node))?);
        }
        group.files.push((path, entries));
    }

    Ok(group)
}

/// Build one wire entry, delta-ed against p1.
fn entry_for(
    revlog: &Revlog,
    rev: Rev,
    link_node: Option<Node>,
) -> Result<Entry, ExchangeError> {
    let node = revlog.node(rev).map_err(repo::RepoError::from)?;
    let (p1, p2) = revlog.parent_nodes(rev).map_err(repo::RepoError::from)?;
    let [p1_rev, _] = revlog.parents(rev).map_err(repo::RepoError::from)?;
    let text = revlog.text(rev).map_err(repo::RepoError::from)?;
    let base_text = if p1_rev == NULL_REV {
        Vec::new()
    } else {
        revlog.text(p1_rev).map_err(repo::RepoError::from)?
    };
    let fragments = delta::compute(&base_text, &text);
    Ok(Entry {
        node,
        p1,
        p2,
        link_node: link_node.unwrap_or(node),
        delta_base: p1,
        delta: delta::serialize(&fragments),
    })
}
