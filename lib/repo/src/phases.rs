/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Phases: publication state of changesets.
//!
//! Only the *roots* of the draft and secret sets are stored
//! (`phaseroots`, one `<phase> <hex>` line each); everything not
//! descended from a root is public. Movement is monotonic towards
//! public: publishing is irreversible, and no marker may obsolete a
//! public changeset.

use std::path::PathBuf;

use dag::Dag;
use dag::ParentSource;
use transaction::Transaction;
use types::Node;
use types::Rev;

use crate::errors::RepoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Public = 0,
    Draft = 1,
    Secret = 2,
}

impl Phase {
    fn from_code(code: u8) -> Option<Phase> {
        match code {
            0 => Some(Phase::Public),
            1 => Some(Phase::Draft),
            2 => Some(Phase::Secret),
            _ => None,
        }
    }
}

pub struct PhaseStore {
    path: PathBuf,
    draft_roots: Vec<Node>,
    secret_roots: Vec<Node>,
}

impl PhaseStore {
    pub fn load(path: PathBuf) -> Result<Self, RepoError> {
        let mut store = PhaseStore {
            path,
            draft_roots: Vec::new(),
            secret_roots: Vec::new(),
        };
        if let Some(data) = util::file::read_opt(&store.path)? {
            for line in String::from_utf8_lossy(&data).lines() {
                let (code, hex) = match line.split_once(' ') {
                    Some(parts) => parts,
                    None => continue,
                };
                let phase = code
                    .parse::<u8>()
                    .ok()
                    .and_then(Phase::from_code)
                    .unwrap_or(Phase::Draft);
                let node = match Node::from_hex(hex.as_bytes()) {
                    Ok(node) => node,
                    Err(_) => continue,
                };
                match phase {
                    Phase::Draft => store.draft_roots.push(node),
                    Phase::Secret => store.secret_roots.push(node),
                    Phase::Public => {}
                }
            }
        }
        Ok(store)
    }

    pub fn draft_roots(&self) -> &[Node] {
        &self.draft_roots
    }

    pub fn secret_roots(&self) -> &[Node] {
        &self.secret_roots
    }

    fn save(&self, txn: &mut Transaction) -> Result<(), RepoError> {
        txn.add_backup(&self.path)?;
        let mut out = String::new();
        for node in &self.draft_roots {
            out.push_str(&format!("1 {}\n", node.to_hex()));
        }
        for node in &self.secret_roots {
            out.push_str(&format!("2 {}\n", node.to_hex()));
        }
        util::atomicfile::atomic_write_bytes(&self.path, out.as_bytes())?;
        Ok(())
    }

    /// Phase of every rev: public unless under a draft/secret root.
    pub fn phase_vector<S>(
        &self,
        source: &S,
        rev_of_node: impl Fn(&Node) -> Option<Rev>,
    ) -> Result<Vec<Phase>, RepoError>
    where
        S: ParentSource + ?Sized,
    {
        let mut phases = vec![Phase::Public; source.num_revs()];
        let dag = Dag::new(source);
        for (roots, phase) in [
            (&self.draft_roots, Phase::Draft),
            (&self.secret_roots, Phase::Secret),
        ] {
            let root_revs: Vec<Rev> = roots.iter().filter_map(&rev_of_node).collect();
            if root_revs.is_empty() {
                continue;
            }
            for rev in dag.descendants(&root_revs)? {
                if phases[rev as usize] < phase {
                    phases[rev as usize] = phase;
                }
            }
        }
        Ok(phases)
    }

    /// Move `targets` (and, for publishing, their ancestors) to
    /// `phase`. Movement is only ever towards public; a changeset never
    /// leaves public again.
    pub fn advance<S>(
        &mut self,
        txn: &mut Transaction,
        source: &S,
        rev_of_node: impl Fn(&Node) -> Option<Rev> + Copy,
        node_of_rev: impl Fn(Rev) -> Node,
        targets: &[Rev],
        phase: Phase,
    ) -> Result<(), RepoError>
    where
        S: ParentSource + ?Sized,
    {
        let mut phases = self.phase_vector(source, rev_of_node)?;
        let dag = Dag::new(source);
        // Phase boundaries respect ancestry: making a rev public makes
        // all its ancestors public; making it draft pulls secret
        // ancestors to draft.
        for &rev in &dag.ancestors(targets)? {
            if phases[rev as usize] > phase {
                phases[rev as usize] = phase;
            }
        }
        self.rebuild_roots(source, &phases, node_of_rev)?;
        self.save(txn)?;
        tracing::debug!(targets = targets.len(), ?phase, "phase boundary moved");
        Ok(())
    }

    /// Record a brand-new rev (commit, changegroup apply) as `phase`.
    pub fn note_new_rev<S>(
        &mut self,
        txn: &mut Transaction,
        source: &S,
        rev_of_node: impl Fn(&Node) -> Option<Rev> + Copy,
        node_of_rev: impl Fn(Rev) -> Node + Copy,
        rev: Rev,
        phase: Phase,
    ) -> Result<(), RepoError>
    where
        S: ParentSource + ?Sized,
    {
        if phase == Phase::Public {
            return Ok(());
        }
        let mut phases = self.phase_vector(source, rev_of_node)?;
        if phases[rev as usize] >= phase {
            return Ok(());
        }
        phases[rev as usize] = phase;
        self.rebuild_roots(source, &phases, node_of_rev)?;
        self.save(txn)
    }

    fn rebuild_roots<S>(
        &mut self,
        source: &S,
        phases: &[Phase],
        node_of_rev: impl Fn(Rev) -> Node,
    ) -> Result<(), RepoError>
    where
        S: ParentSource + ?Sized,
    {
        let dag = Dag::new(source);
        self.draft_roots.clear();
        self.secret_roots.clear();
        for (set, phase) in [
            (&mut self.draft_roots, Phase::Draft),
            (&mut self.secret_roots, Phase::Secret),
        ] {
            let members: Vec<Rev> = (0..source.num_revs() as Rev)
                .filter(|&rev| phases[rev as usize] >= phase)
                .collect();
            for root in dag.roots(&members)? {
                set.push(node_of_rev(root));
            }
        }
        Ok(())
    }
}
