/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Exchanging history between peers.
//!
//! Three layers: the [`peer::Peer`] trait (the only thing a transport
//! has to provide), [`discovery`] (sampled set reconciliation to find
//! the common ancestry), and the pull/push drivers in this module,
//! which generate and transactionally apply bundles. The changegroup
//! is committed manifests-and-files-first, changelog last, so an
//! interrupted apply never leaves a changeset whose data is missing.

pub mod discovery;
pub mod peer;
pub mod pushrebase;

mod apply;
mod generate;

pub use crate::apply::apply_bundle;
pub use crate::apply::AppliedStats;
pub use crate::generate::generate_bundle;
pub use crate::generate::outgoing_revs;

use repo::Repo;
use repo::RepoError;
use thiserror::Error;
use types::Node;
use types::RepoPathBuf;
use ui::Ui;

use crate::peer::Peer;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("remote heads changed during push (race with another client)")]
    HeadsChanged,

    #[error("pushrebase conflict on {0}")]
    PushRebaseConflict(RepoPathBuf),

    #[error("pushrebase cannot rebase merge changeset {0}")]
    PushRebaseMerge(Node),

    #[error("peer does not support {0}")]
    Unsupported(&'static str),

    #[error(transparent)]
    Bundle(#[from] bundles::BundleError),

    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error(transparent)]
    Dag(#[from] dag::DagError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Manifest(#[from] manifest::ManifestError),

    #[error(transparent)]
    Changelog(#[from] changelog::ChangelogError),

    #[error(transparent)]
    Revlog(#[from] revlog::RevlogError),

    #[error(transparent)]
    Transaction(#[from] transaction::TransactionError),
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PullStats {
    pub changesets: usize,
    pub markers: usize,
    pub bookmarks: usize,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PushStats {
    pub changesets: usize,
}

/// Pull everything the peer has that we do not.
pub fn pull(repo: &mut Repo, ui: &Ui, peer: &mut dyn Peer) -> Result<PullStats, ExchangeError> {
    ui.status("searching for changes");
    let outcome = discovery::find_common_heads(repo, peer)?;
    let missing_remote_heads: Vec<Node> = outcome
        .remote_heads
        .iter()
        .filter(|node| !node.is_null() && repo.store().rev_of_node(node).is_none())
        .copied()
        .collect();
    if missing_remote_heads.is_empty() {
        ui.status("no changes found");
        return Ok(PullStats::default());
    }

    let bundle = peer.get_bundle(&outcome.common_heads, &outcome.remote_heads)?;
    let applied = apply_bundle(repo, ui, &bundle)?;
    ui.status(&format!(
        "added {} changesets ({} obsolescence markers)",
        applied.changesets, applied.markers
    ));
    Ok(PullStats {
        changesets: applied.changesets,
        markers: applied.markers,
        bookmarks: applied.bookmarks,
    })
}

/// Push local changesets the peer is missing.
pub fn push(repo: &mut Repo, ui: &Ui, peer: &mut dyn Peer) -> Result<PushStats, ExchangeError> {
    ui.status("searching for changes");
    let outcome = discovery::find_common_heads(repo, peer)?;
    let outgoing = outgoing_revs(repo, &outcome.common_heads)?;
    if outgoing.is_empty() {
        ui.status("no changes found");
        return Ok(PushStats::default());
    }

    let local_heads = repo.heads()?;
    let bundle = generate_bundle(
        repo,
        &outcome.common_heads,
        &local_heads,
        // check:heads pins what we think the remote looks like.
        Some(&outcome.remote_heads),
    )?;
    peer.unbundle(&bundle)?;

    // A publishing push: everything sent becomes public on both sides.
    {
        let _lock = repo.lock_store()?;
        let mut txn = repo.begin_transaction()?;
        repo.publish(&mut txn, &outgoing)?;
        txn.commit(&repo.store().undo_path())?;
    }
    ui.status(&format!("pushed {} changesets", outgoing.len()));
    Ok(PushStats {
        changesets: outgoing.len(),
    })
}
