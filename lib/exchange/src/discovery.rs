/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Set-reconciliation discovery.
//!
//! Find the maximal set of changesets both sides have, so the missing
//! set can be computed on either end. The peer only answers two
//! questions: "what are your heads" and "which of these nodes do you
//! know" (a bit vector). Rounds sample the undecided region - its
//! heads first, then random picks - and each answer classifies whole
//! cones: a known node makes its ancestors common, an unknown one
//! makes its descendants missing. Expected O(log N) rounds.

use std::collections::HashSet;

use dag::Dag;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use repo::store::ChangelogSource;
use repo::Repo;
use types::Node;
use types::Rev;

use crate::peer::Peer;
use crate::ExchangeError;

/// Nodes asked about per round.
const SAMPLE_SIZE: usize = 200;

#[derive(Debug)]
pub struct DiscoveryOutcome {
    /// Heads of the common set, as the peer should be told them.
    pub common_heads: Vec<Node>,
    /// The peer's current heads (for missing-set computation and
    /// check:heads).
    pub remote_heads: Vec<Node>,
    pub rounds: usize,
}

/// Run discovery against `peer`.
pub fn find_common_heads(
    repo: &Repo,
    peer: &mut dyn Peer,
) -> Result<DiscoveryOutcome, ExchangeError> {
    let remote_heads = peer.heads()?;
    let local_len = repo.store().changelog().len() as Rev;

    // Fast path: the remote heads we already have are fully common; if
    // that covers every remote head and every local head is known
    // remotely, both sides are level.
    let known_remote_heads: Vec<Rev> = remote_heads
        .iter()
        .filter(|node| !node.is_null())
        .filter_map(|node| repo.store().rev_of_node(node))
        .collect();

    if local_len == 0 {
        return Ok(DiscoveryOutcome {
            common_heads: Vec::new(),
            remote_heads,
            rounds: 0,
        });
    }

    let source = ChangelogSource(repo.store().changelog());
    let dag = Dag::new(&source);

    let mut common: HashSet<Rev> = dag
        .ancestors(&known_remote_heads)?
        .into_iter()
        .collect();
    let mut missing: HashSet<Rev> = HashSet::new();
    let mut rounds = 0;

    // The sample of our own heads doubles as the equality check.
    let mut sample: Vec<Rev> = repo
        .heads()?
        .iter()
        .filter(|node| !node.is_null())
        .filter_map(|node| repo.store().rev_of_node(node))
        .collect();
    let mut rng = SmallRng::seed_from_u64(local_len as u64);

    loop {
        sample.retain(|rev| !common.contains(rev) && !missing.contains(rev));
        sample.truncate(SAMPLE_SIZE);
        if !sample.is_empty() {
            rounds += 1;
            let nodes: Vec<Node> = sample
                .iter()
                .map(|&rev| repo.store().node_of_rev(rev))
                .collect::<Result<_, _>>()?;
            let answers = peer.known(&nodes)?;
            tracing::debug!(
                round = rounds,
                asked = nodes.len(),
                known = answers.iter().filter(|&&k| k).count(),
                "discovery round"
            );
            let mut known_revs = Vec::new();
            let mut unknown_revs = Vec::new();
            for (&rev, &known) in sample.iter().zip(answers.iter()) {
                if known {
                    known_revs.push(rev);
                } else {
                    unknown_revs.push(rev);
                }
            }
            for rev in dag.ancestors(&known_revs)? {
                common.insert(rev);
            }
            for rev in dag.descendants(&unknown_revs)? {
                missing.insert(rev);
            }
        }

        // Undecided: neither proven common nor proven missing.
        let undecided: Vec<Rev> = (0..local_len)
            .filter(|rev| !common.contains(rev) && !missing.contains(rev))
            .collect();
        if undecided.is_empty() {
            break;
        }

        // Next sample: the frontier (heads of the undecided region)
        // plus random undecided revs.
        sample = dag.heads(&undecided)?;
        if sample.len() < SAMPLE_SIZE {
            let mut extra: Vec<Rev> = undecided
                .iter()
                .copied()
                .filter(|rev| !sample.contains(rev))
                .collect();
            extra.shuffle(&mut rng);
            extra.truncate(SAMPLE_SIZE - sample.len());
            sample.extend(extra);
        }
    }

    let common_revs: Vec<Rev> = common.iter().copied().collect();
    let mut common_heads = Vec::new();
    for rev in dag.heads(&common_revs)? {
        common_heads.push(repo.store().node_of_rev(rev)?);
    }
    common_heads.sort();
    Ok(DiscoveryOutcome {
        common_heads,
        remote_heads,
        rounds,
    })
}
