/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Ancestry over the rev-number DAG.
//!
//! The changelog index gives every rev at most two parents, both with
//! strictly smaller rev numbers. That ordering makes every closure
//! computable in one linear sweep over a bit vector, which is how all
//! the set operations here work. Results come back as sorted rev lists
//! (ascending = topological order).
//!
//! The only requirement on the graph is the [`ParentSource`] trait;
//! the changelog, a bundle being previewed, and test fixtures all
//! implement it.

use bit_vec::BitVec;
use thiserror::Error;
use types::Rev;
use types::NULL_REV;

#[derive(Debug, Error)]
pub enum DagError {
    #[error("unknown rev {0}")]
    UnknownRev(Rev),

    #[error("rev {rev} has parent {parent} >= itself")]
    ParentOrder { rev: Rev, parent: Rev },
}

/// A DAG described by its parent relation.
pub trait ParentSource {
    /// Total number of revs; valid revs are `0..num_revs`.
    fn num_revs(&self) -> usize;

    /// Parents of `rev`, `NULL_REV`-padded.
    fn parent_revs(&self, rev: Rev) -> [Rev; 2];
}

/// Set algebra over a [`ParentSource`].
pub struct Dag<'a, S: ParentSource + ?Sized> {
    source: &'a S,
}

impl<'a, S: ParentSource + ?Sized> Dag<'a, S> {
    pub fn new(source: &'a S) -> Self {
        Dag { source }
    }

    fn check(&self, revs: &[Rev]) -> Result<(), DagError> {
        let len = self.source.num_revs() as Rev;
        for &rev in revs {
            if rev < 0 || rev >= len {
                return Err(DagError::UnknownRev(rev));
            }
        }
        Ok(())
    }

    fn bitset(&self, revs: &[Rev]) -> BitVec {
        let mut set = BitVec::from_elem(self.source.num_revs(), false);
        for &rev in revs {
            set.set(rev as usize, true);
        }
        set
    }

    fn collect(set: &BitVec) -> Vec<Rev> {
        set.iter()
            .enumerate()
            .filter_map(|(rev, in_set)| in_set.then_some(rev as Rev))
            .collect()
    }

    /// Reflexive transitive closure towards the roots.
    pub fn ancestors(&self, revs: &[Rev]) -> Result<Vec<Rev>, DagError> {
        self.check(revs)?;
        let mut set = self.bitset(revs);
        let max = match revs.iter().max() {
            Some(&max) => max,
            None => return Ok(Vec::new()),
        };
        for rev in (0..=max).rev() {
            if !set[rev as usize] {
                continue;
            }
            for parent in self.parents_checked(rev)? {
                set.set(parent as usize, true);
            }
        }
        Ok(Self::collect(&set))
    }

    /// Reflexive transitive closure towards the heads.
    pub fn descendants(&self, revs: &[Rev]) -> Result<Vec<Rev>, DagError> {
        self.check(revs)?;
        let mut set = self.bitset(revs);
        let min = match revs.iter().min() {
            Some(&min) => min,
            None => return Ok(Vec::new()),
        };
        for rev in min..self.source.num_revs() as Rev {
            if set[rev as usize] {
                continue;
            }
            let inherits = self
                .parents_checked(rev)?
                .into_iter()
                .any(|parent| set[parent as usize]);
            if inherits {
                set.set(rev as usize, true);
            }
        }
        Ok(Self::collect(&set))
    }

    /// Elements of `revs` that no other element of `revs` descends
    /// from.
    pub fn heads(&self, revs: &[Rev]) -> Result<Vec<Rev>, DagError> {
        self.check(revs)?;
        let set = self.bitset(revs);
        // Proper ancestors of the set: sweep down, propagating through
        // both set members and already-marked ancestors.
        let mut proper = BitVec::from_elem(self.source.num_revs(), false);
        for rev in (0..self.source.num_revs() as Rev).rev() {
            if !set[rev as usize] && !proper[rev as usize] {
                continue;
            }
            for parent in self.parents_checked(rev)? {
                proper.set(parent as usize, true);
            }
        }
        Ok(revs
            .iter()
            .copied()
            .filter(|&rev| !proper[rev as usize])
            .collect())
    }

    /// Elements of `revs` with no proper ancestor in `revs`.
    pub fn roots(&self, revs: &[Rev]) -> Result<Vec<Rev>, DagError> {
        self.check(revs)?;
        let set = self.bitset(revs);
        // reach[rev]: rev has a proper ancestor in the set.
        let mut reach = BitVec::from_elem(self.source.num_revs(), false);
        let mut result = Vec::new();
        for rev in 0..self.source.num_revs() as Rev {
            let from_parents = self.parents_checked(rev)?.into_iter().any(|parent| {
                set[parent as usize] || reach[parent as usize]
            });
            if from_parents {
                reach.set(rev as usize, true);
            }
            if set[rev as usize] && !from_parents {
                result.push(rev);
            }
        }
        Ok(result)
    }

    /// All greatest common ancestors of `a` and `b`. More than one when
    /// the history criss-crosses.
    pub fn common_ancestors(&self, a: Rev, b: Rev) -> Result<Vec<Rev>, DagError> {
        if a == NULL_REV || b == NULL_REV {
            return Ok(Vec::new());
        }
        let ancestors_a = self.ancestors(&[a])?;
        let ancestors_b = self.bitset(&self.ancestors(&[b])?);
        let common: Vec<Rev> = ancestors_a
            .into_iter()
            .filter(|&rev| ancestors_b[rev as usize])
            .collect();
        self.heads(&common)
    }

    /// `x::y`: ancestors of `y` that descend from `x`, inclusive.
    pub fn range(&self, x: &[Rev], y: &[Rev]) -> Result<Vec<Rev>, DagError> {
        let down = self.bitset(&self.ancestors(y)?);
        Ok(self
            .descendants(x)?
            .into_iter()
            .filter(|&rev| down[rev as usize])
            .collect())
    }

    /// Direct children of `rev`.
    pub fn children(&self, rev: Rev) -> Result<Vec<Rev>, DagError> {
        self.check(&[rev])?;
        let mut result = Vec::new();
        for child in (rev + 1)..self.source.num_revs() as Rev {
            if self.parents_checked(child)?.into_iter().any(|p| p == rev) {
                result.push(child);
            }
        }
        Ok(result)
    }

    /// Is `ancestor` an ancestor of `descendant` (reflexive)?
    pub fn is_ancestor(&self, ancestor: Rev, descendant: Rev) -> Result<bool, DagError> {
        if ancestor == NULL_REV {
            return Ok(true);
        }
        Ok(self.ancestors(&[descendant])?.contains(&ancestor))
    }

    fn parents_checked(&self, rev: Rev) -> Result<impl IntoIterator<Item = Rev>, DagError> {
        let [p1, p2] = self.source.parent_revs(rev);
        for parent in [p1, p2] {
            if parent != NULL_REV && parent >= rev {
                return Err(DagError::ParentOrder { rev, parent });
            }
        }
        Ok([p1, p2]
            .into_iter()
            .filter(|&p| p != NULL_REV)
            .collect::<Vec<_>>())
    }
}

/// A parent source described by plain vectors. Tests and bundle
/// previews use this.
#[derive(Debug, Clone, Default)]
pub struct VecSource {
    parents: Vec<[Rev; 2]>,
}

impl VecSource {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn push(&mut self, p1: Rev, p2: Rev) -> Rev {
        self.parents.push([p1, p2]);
        self.parents.len() as Rev - 1
    }
}

impl ParentSource for VecSource {
    fn num_revs(&self) -> usize {
        self.parents.len()
    }

    fn parent_revs(&self, rev: Rev) -> [Rev; 2] {
        self.parents[rev as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The test graph used throughout:
    ///
    /// ```text
    ///   0 - 1 - 2 - 4 - 6
    ///         \       /
    ///           3 - 5        7 (on 1)
    /// ```
    fn crossed() -> VecSource {
        let mut source = VecSource::new();
        source.push(NULL_REV, NULL_REV); // 0
        source.push(0, NULL_REV); // 1
        source.push(1, NULL_REV); // 2
        source.push(1, NULL_REV); // 3
        source.push(2, NULL_REV); // 4
        source.push(3, NULL_REV); // 5
        source.push(4, 5); // 6 (merge)
        source.push(1, NULL_REV); // 7
        source
    }

    #[test]
    fn test_ancestors() {
        let source = crossed();
        let dag = Dag::new(&source);
        assert_eq!(dag.ancestors(&[6]).unwrap(), vec![0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(dag.ancestors(&[3]).unwrap(), vec![0, 1, 3]);
        assert_eq!(dag.ancestors(&[]).unwrap(), Vec::<Rev>::new());
        assert!(dag.ancestors(&[99]).is_err());
    }

    #[test]
    fn test_descendants() {
        let source = crossed();
        let dag = Dag::new(&source);
        assert_eq!(dag.descendants(&[3]).unwrap(), vec![3, 5, 6]);
        assert_eq!(dag.descendants(&[0]).unwrap(), vec![0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_heads_and_roots() {
        let source = crossed();
        let dag = Dag::new(&source);
        assert_eq!(dag.heads(&[0, 1, 2, 3, 4, 5, 6, 7]).unwrap(), vec![6, 7]);
        // 4 is an ancestor of 6 transitively even though 5 sits between
        // them on the other branch.
        assert_eq!(dag.heads(&[2, 4, 6]).unwrap(), vec![6]);
        assert_eq!(dag.heads(&[2, 3]).unwrap(), vec![2, 3]);
        assert_eq!(dag.roots(&[2, 3, 6]).unwrap(), vec![2, 3]);
        assert_eq!(dag.roots(&[0, 5]).unwrap(), vec![0]);
    }

    #[test]
    fn test_common_ancestors() {
        let source = crossed();
        let dag = Dag::new(&source);
        assert_eq!(dag.common_ancestors(4, 5).unwrap(), vec![1]);
        assert_eq!(dag.common_ancestors(6, 7).unwrap(), vec![1]);
        assert_eq!(dag.common_ancestors(2, 2).unwrap(), vec![2]);
        assert_eq!(dag.common_ancestors(0, NULL_REV).unwrap(), Vec::<Rev>::new());
    }

    #[test]
    fn test_multiple_gcas() {
        // Criss-cross: both 1 and 2 are greatest common ancestors of
        // 3 and 4.
        let mut source = VecSource::new();
        source.push(NULL_REV, NULL_REV); // 0
        source.push(0, NULL_REV); // 1
        source.push(0, NULL_REV); // 2
        source.push(1, 2); // 3
        source.push(1, 2); // 4
        let dag = Dag::new(&source);
        assert_eq!(dag.common_ancestors(3, 4).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_range() {
        let source = crossed();
        let dag = Dag::new(&source);
        assert_eq!(dag.range(&[1], &[6]).unwrap(), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(dag.range(&[3], &[6]).unwrap(), vec![3, 5, 6]);
        assert_eq!(dag.range(&[7], &[6]).unwrap(), Vec::<Rev>::new());
    }

    #[test]
    fn test_children_and_is_ancestor() {
        let source = crossed();
        let dag = Dag::new(&source);
        assert_eq!(dag.children(1).unwrap(), vec![2, 3, 7]);
        assert!(dag.is_ancestor(1, 6).unwrap());
        assert!(!dag.is_ancestor(7, 6).unwrap());
        assert!(dag.is_ancestor(6, 6).unwrap());
        assert!(dag.is_ancestor(NULL_REV, 0).unwrap());
    }

    #[test]
    fn test_parent_order_violation_detected() {
        let mut source = VecSource::new();
        source.push(NULL_REV, NULL_REV);
        source.parents.push([1, NULL_REV]); // self-parent
        let dag = Dag::new(&source);
        assert!(matches!(
            dag.ancestors(&[1]),
            Err(DagError::ParentOrder { .. })
        ));
    }
}
