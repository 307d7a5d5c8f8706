/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! The obsolescence store.
//!
//! A flat, append-only file of markers, each declaring that a
//! *predecessor* changeset was rewritten into zero or more *successor*
//! changesets. Markers form their own DAG, orthogonal to the changelog.
//! From them the *hidden set* is derived: obsolete changesets stay on
//! disk but disappear from the filtered view unless something visible
//! pins them.
//!
//! Wire format: one version byte (1), then records:
//!
//! ```text
//! [pred 20] [flags u32] [date i64] [tz i32] [n-succ u8] [succ 20]*
//! [n-meta u8] ([key-len u8] [val-len u8] key val)*
//! ```
//!
//! Markers are never deleted in normal operation. Writes run inside the
//! store transaction, so a crashed append truncates away cleanly.

use std::collections::HashMap;
use std::collections::HashSet;
use std::hash::Hash;
use std::hash::Hasher;
use std::path::Path;
use std::path::PathBuf;

use byteorder::BigEndian;
use byteorder::ByteOrder;
use dag::Dag;
use dag::ParentSource;
use parking_lot::Mutex;
use thiserror::Error;
use transaction::Transaction;
use types::Node;
use types::Rev;

const FORMAT_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum ObsError {
    #[error("corrupt obsstore: {0}")]
    Corrupt(String),

    #[error("cannot obsolete public changeset {0}")]
    PublicPredecessor(Node),

    #[error(transparent)]
    Dag(#[from] dag::DagError),

    #[error(transparent)]
    Transaction(#[from] transaction::TransactionError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One obsolescence marker. An empty successor list is a prune.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub predecessor: Node,
    pub successors: Vec<Node>,
    pub flags: u32,
    /// When the rewrite happened: UTC seconds + tz offset seconds.
    pub date: (i64, i32),
    pub metadata: Vec<(String, String)>,
}

impl Marker {
    pub fn new(predecessor: Node, successors: Vec<Node>) -> Self {
        Marker {
            predecessor,
            successors,
            flags: 0,
            date: (0, 0),
            metadata: Vec::new(),
        }
    }

    pub fn is_prune(&self) -> bool {
        self.successors.is_empty()
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.predecessor.as_bytes());
        let mut fixed = [0u8; 16];
        BigEndian::write_u32(&mut fixed[0..4], self.flags);
        BigEndian::write_i64(&mut fixed[4..12], self.date.0);
        BigEndian::write_i32(&mut fixed[12..16], self.date.1);
        out.extend_from_slice(&fixed);
        out.push(self.successors.len() as u8);
        for successor in &self.successors {
            out.extend_from_slice(successor.as_bytes());
        }
        out.push(self.metadata.len() as u8);
        for (key, value) in &self.metadata {
            out.push(key.len() as u8);
            out.push(value.len() as u8);
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(value.as_bytes());
        }
    }

    fn deserialize(data: &[u8], pos: &mut usize) -> Result<Self, ObsError> {
        let take = |pos: &mut usize, n: usize| -> Result<&[u8], ObsError> {
            if *pos + n > data.len() {
                return Err(ObsError::Corrupt(format!(
                    "truncated marker at byte {}",
                    *pos
                )));
            }
            let slice = &data[*pos..*pos + n];
            *pos += n;
            Ok(slice)
        };
        let predecessor = Node::from_slice(take(pos, 20)?).expect("20 bytes");
        let fixed = take(pos, 16)?;
        let flags = BigEndian::read_u32(&fixed[0..4]);
        let seconds = BigEndian::read_i64(&fixed[4..12]);
        let tz = BigEndian::read_i32(&fixed[12..16]);
        let n_succ = take(pos, 1)?[0] as usize;
        let mut successors = Vec::with_capacity(n_succ);
        for _ in 0..n_succ {
            successors.push(Node::from_slice(take(pos, 20)?).expect("20 bytes"));
        }
        let n_meta = take(pos, 1)?[0] as usize;
        let mut metadata = Vec::with_capacity(n_meta);
        for _ in 0..n_meta {
            let lens = take(pos, 2)?;
            let (key_len, value_len) = (lens[0] as usize, lens[1] as usize);
            let key = String::from_utf8(take(pos, key_len)?.to_vec())
                .map_err(|_| ObsError::Corrupt("metadata key is not utf-8".to_string()))?;
            let value = String::from_utf8(take(pos, value_len)?.to_vec())
                .map_err(|_| ObsError::Corrupt("metadata value is not utf-8".to_string()))?;
            metadata.push((key, value));
        }
        Ok(Marker {
            predecessor,
            successors,
            flags,
            date: (seconds, tz),
            metadata,
        })
    }
}

/// What the hidden-set computation needs from the repository.
pub trait ObsContext: ParentSource {
    fn rev_of_node(&self, node: &Node) -> Option<Rev>;

    fn is_public(&self, rev: Rev) -> bool;

    /// Revs that pin visibility: working-copy parents, bookmark
    /// targets, configured pins.
    fn pinned_revs(&self) -> Vec<Rev>;
}

pub struct ObsStore {
    path: PathBuf,
    markers: Vec<Marker>,
    /// predecessor -> marker indexes.
    by_pred: HashMap<Node, Vec<usize>>,
    hidden_cache: Mutex<Option<(CacheKey, Vec<Rev>)>>,
}

#[derive(PartialEq, Eq, Clone, Copy)]
struct CacheKey {
    tip: usize,
    markers: usize,
    pin_hash: u64,
}

impl ObsStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ObsError> {
        let path = path.into();
        let mut store = ObsStore {
            path: path.clone(),
            markers: Vec::new(),
            by_pred: HashMap::new(),
            hidden_cache: Mutex::new(None),
        };
        let data = match util::file::read_opt(&path)? {
            None => return Ok(store),
            Some(data) => data,
        };
        if data.is_empty() {
            return Ok(store);
        }
        if data[0] != FORMAT_VERSION {
            return Err(ObsError::Corrupt(format!(
                "unknown obsstore version {}",
                data[0]
            )));
        }
        let mut pos = 1;
        while pos < data.len() {
            let marker = Marker::deserialize(&data, &mut pos)?;
            store.index_marker(&marker, store.markers.len());
            store.markers.push(marker);
        }
        Ok(store)
    }

    fn index_marker(&mut self, marker: &Marker, idx: usize) {
        self.by_pred
            .entry(marker.predecessor)
            .or_default()
            .push(idx);
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn markers(&self) -> &[Marker] {
        &self.markers
    }

    /// Append markers. A marker naming a public predecessor is
    /// rejected; `is_public` comes from the phase store. Duplicate
    /// markers are dropped silently.
    pub fn add(
        &mut self,
        txn: &mut Transaction,
        markers: Vec<Marker>,
        is_public: impl Fn(&Node) -> bool,
    ) -> Result<usize, ObsError> {
        let mut fresh = Vec::new();
        for marker in markers {
            if is_public(&marker.predecessor) {
                return Err(ObsError::PublicPredecessor(marker.predecessor));
            }
            if self
                .markers_for(&marker.predecessor)
                .any(|existing| existing == &marker)
            {
                continue;
            }
            fresh.push(marker);
        }
        if fresh.is_empty() {
            return Ok(0);
        }

        txn.add(&self.path)?;
        let mut out = Vec::new();
        if util::file::file_len(&self.path)? == 0 {
            out.push(FORMAT_VERSION);
        }
        for marker in &fresh {
            marker.serialize(&mut out);
        }
        append_bytes(&self.path, &out)?;

        let count = fresh.len();
        for marker in fresh {
            self.index_marker(&marker, self.markers.len());
            self.markers.push(marker);
        }
        *self.hidden_cache.lock() = None;
        tracing::debug!(count, total = self.markers.len(), "obsmarkers appended");
        Ok(count)
    }

    pub fn markers_for<'a>(&'a self, predecessor: &Node) -> impl Iterator<Item = &'a Marker> {
        self.by_pred
            .get(predecessor)
            .into_iter()
            .flatten()
            .map(|&idx| &self.markers[idx])
    }

    /// Direct successors of `node` across all its markers.
    pub fn successors(&self, node: &Node) -> Vec<Node> {
        let mut out = Vec::new();
        for marker in self.markers_for(node) {
            for successor in &marker.successors {
                if !out.contains(successor) {
                    out.push(*successor);
                }
            }
        }
        out
    }

    pub fn is_obsolete(&self, node: &Node) -> bool {
        self.by_pred.contains_key(node)
    }

    /// Predecessors whose markers split into mutually disjoint
    /// successor sets: the store exposes divergence, policy lives
    /// above.
    pub fn divergent(&self) -> Vec<Node> {
        let mut out = Vec::new();
        for (pred, indexes) in &self.by_pred {
            let sets: Vec<HashSet<&Node>> = indexes
                .iter()
                .map(|&idx| self.markers[idx].successors.iter().collect())
                .filter(|set: &HashSet<&Node>| !set.is_empty())
                .collect();
            let has_disjoint_pair = sets.iter().enumerate().any(|(i, a)| {
                sets[i + 1..]
                    .iter()
                    .any(|b| a.is_disjoint(b))
            });
            if has_disjoint_pair {
                out.push(*pred);
            }
        }
        out.sort();
        out
    }

    /// The hidden revs: obsolete changesets that are neither public nor
    /// an ancestor of a pinned rev. Cached keyed by (changelog tip,
    /// marker count, pin set); any change invalidates.
    pub fn hidden_revs<C: ObsContext>(&self, ctx: &C) -> Result<Vec<Rev>, ObsError> {
        let pins = {
            let mut pins = ctx.pinned_revs();
            pins.sort_unstable();
            pins.dedup();
            pins.retain(|&rev| rev >= 0 && (rev as usize) < ctx.num_revs());
            pins
        };
        let key = CacheKey {
            tip: ctx.num_revs(),
            markers: self.markers.len(),
            pin_hash: hash_pins(&pins),
        };
        if let Some((cached_key, hidden)) = &*self.hidden_cache.lock() {
            if *cached_key == key {
                return Ok(hidden.clone());
            }
        }

        let mut obsolete: Vec<Rev> = self
            .by_pred
            .keys()
            .filter_map(|node| ctx.rev_of_node(node))
            .filter(|&rev| !ctx.is_public(rev))
            .collect();
        obsolete.sort_unstable();

        let hidden = if obsolete.is_empty() {
            Vec::new()
        } else {
            let dag = Dag::new(ctx);
            let pinned_ancestors: HashSet<Rev> =
                dag.ancestors(&pins)?.into_iter().collect();
            obsolete
                .into_iter()
                .filter(|rev| !pinned_ancestors.contains(rev))
                .collect()
        };

        *self.hidden_cache.lock() = Some((key, hidden.clone()));
        Ok(hidden)
    }
}

/// Serialize markers to the wire/file format (version byte + records).
/// The obsmarkers bundle part carries exactly these bytes.
pub fn encode_markers(markers: &[Marker]) -> Vec<u8> {
    let mut out = vec![FORMAT_VERSION];
    for marker in markers {
        marker.serialize(&mut out);
    }
    out
}

/// Parse the wire/file format.
pub fn decode_markers(data: &[u8]) -> Result<Vec<Marker>, ObsError> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    if data[0] != FORMAT_VERSION {
        return Err(ObsError::Corrupt(format!(
            "unknown obsmarker format {}",
            data[0]
        )));
    }
    let mut markers = Vec::new();
    let mut pos = 1;
    while pos < data.len() {
        markers.push(Marker::deserialize(data, &mut pos)?);
    }
    Ok(markers)
}

fn hash_pins(pins: &[Rev]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    pins.hash(&mut hasher);
    hasher.finish()
}

fn append_bytes(path: &Path, bytes: &[u8]) -> Result<(), ObsError> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use types::NULL_ID;
    use types::NULL_REV;

    use super::*;

    fn node(seed: u8) -> Node {
        Node::from_content(&[seed], &NULL_ID, &NULL_ID)
    }

    struct TestStore {
        dir: tempfile::TempDir,
        store: ObsStore,
    }

    impl TestStore {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = ObsStore::open(dir.path().join("obsstore")).unwrap();
            TestStore { dir, store }
        }

        fn add(&mut self, markers: Vec<Marker>) {
            let mut txn = Transaction::open(self.dir.path().join("journal")).unwrap();
            self.store.add(&mut txn, markers, |_| false).unwrap();
            txn.commit(&self.dir.path().join("undo")).unwrap();
        }

        fn reopen(&mut self) {
            self.store = ObsStore::open(self.dir.path().join("obsstore")).unwrap();
        }
    }

    #[test]
    fn test_append_and_reload() {
        let mut t = TestStore::new();
        let mut marker = Marker::new(node(1), vec![node(2), node(3)]);
        marker.date = (1700000000, 3600);
        marker.metadata.push(("user".to_string(), "alice".to_string()));
        t.add(vec![marker.clone()]);
        t.add(vec![Marker::new(node(4), vec![])]); // prune

        t.reopen();
        assert_eq!(t.store.len(), 2);
        assert_eq!(t.store.markers()[0], marker);
        assert!(t.store.markers()[1].is_prune());
        assert_eq!(t.store.successors(&node(1)), vec![node(2), node(3)]);
        assert!(t.store.is_obsolete(&node(4)));
        assert!(!t.store.is_obsolete(&node(9)));
    }

    #[test]
    fn test_duplicate_markers_dropped() {
        let mut t = TestStore::new();
        let marker = Marker::new(node(1), vec![node(2)]);
        t.add(vec![marker.clone()]);
        t.add(vec![marker]);
        assert_eq!(t.store.len(), 1);
    }

    #[test]
    fn test_public_predecessor_rejected() {
        let mut t = TestStore::new();
        let mut txn = Transaction::open(t.dir.path().join("journal")).unwrap();
        let result = t.store.add(
            &mut txn,
            vec![Marker::new(node(1), vec![node(2)])],
            |_| true,
        );
        assert!(matches!(result, Err(ObsError::PublicPredecessor(_))));
        assert_eq!(t.store.len(), 0);
    }

    #[test]
    fn test_divergence_detection() {
        let mut t = TestStore::new();
        t.add(vec![Marker::new(node(1), vec![node(2)])]);
        assert!(t.store.divergent().is_empty());
        // Same predecessor rewritten a second way: divergent.
        t.add(vec![Marker::new(node(1), vec![node(3)])]);
        assert_eq!(t.store.divergent(), vec![node(1)]);
        // A split (multiple successors in one marker) is not divergence.
        t.add(vec![Marker::new(node(5), vec![node(6), node(7)])]);
        assert_eq!(t.store.divergent(), vec![node(1)]);
        // Prunes do not count either.
        t.add(vec![Marker::new(node(8), vec![node(9)])]);
        t.add(vec![Marker::new(node(8), vec![])]);
        assert_eq!(t.store.divergent(), vec![node(1)]);
    }

    #[test]
    fn test_corrupt_store_detected() {
        let t = TestStore::new();
        std::fs::write(t.dir.path().join("obsstore"), [9u8, 1, 2]).unwrap();
        assert!(matches!(
            ObsStore::open(t.dir.path().join("obsstore")),
            Err(ObsError::Corrupt(_))
        ));
        std::fs::write(t.dir.path().join("obsstore"), [FORMAT_VERSION, 1, 2]).unwrap();
        assert!(matches!(
            ObsStore::open(t.dir.path().join("obsstore")),
            Err(ObsError::Corrupt(_))
        ));
    }

    struct Graph {
        parents: Vec<[Rev; 2]>,
        nodes: Vec<Node>,
        public: Vec<Rev>,
        pins: Vec<Rev>,
    }

    impl Graph {
        /// Linear 0-1-2-3 with per-rev nodes node(10+rev).
        fn linear() -> Self {
            Graph {
                parents: vec![
                    [NULL_REV, NULL_REV],
                    [0, NULL_REV],
                    [1, NULL_REV],
                    [2, NULL_REV],
                ],
                nodes: (0..4).map(|i| node(10 + i)).collect(),
                public: Vec::new(),
                pins: Vec::new(),
            }
        }
    }

    impl ParentSource for Graph {
        fn num_revs(&self) -> usize {
            self.parents.len()
        }
        fn parent_revs(&self, rev: Rev) -> [Rev; 2] {
            self.parents[rev as usize]
        }
    }

    impl ObsContext for Graph {
        fn rev_of_node(&self, node: &Node) -> Option<Rev> {
            self.nodes.iter().position(|n| n == node).map(|i| i as Rev)
        }
        fn is_public(&self, rev: Rev) -> bool {
            self.public.contains(&rev)
        }
        fn pinned_revs(&self) -> Vec<Rev> {
            self.pins.clone()
        }
    }

    #[test]
    fn test_hidden_derivation() {
        let mut t = TestStore::new();
        let mut graph = Graph::linear();
        // Obsolete rev 2 and rev 3.
        t.add(vec![
            Marker::new(node(12), vec![node(99)]),
            Marker::new(node(13), vec![]),
        ]);
        assert_eq!(t.store.hidden_revs(&graph).unwrap(), vec![2, 3]);

        // Public predecessors are never hidden.
        graph.public = vec![2];
        assert_eq!(t.store.hidden_revs(&graph).unwrap(), vec![3]);

        // A pin on rev 3 reveals it (and its ancestors).
        graph.pins = vec![3];
        assert_eq!(t.store.hidden_revs(&graph).unwrap(), Vec::<Rev>::new());

        // Pin on rev 1 only: rev 3 goes hidden again.
        graph.pins = vec![1];
        assert_eq!(t.store.hidden_revs(&graph).unwrap(), vec![3]);
    }

    #[test]
    fn test_hidden_cache_invalidation() {
        let mut t = TestStore::new();
        let graph = Graph::linear();
        t.add(vec![Marker::new(node(13), vec![])]);
        assert_eq!(t.store.hidden_revs(&graph).unwrap(), vec![3]);
        // New marker invalidates the cached answer.
        t.add(vec![Marker::new(node(12), vec![])]);
        assert_eq!(t.store.hidden_revs(&graph).unwrap(), vec![2, 3]);
    }

    #[test]
    fn test_markers_of_unknown_changesets_are_inert() {
        let mut t = TestStore::new();
        let graph = Graph::linear();
        t.add(vec![Marker::new(node(77), vec![node(78)])]);
        assert_eq!(t.store.hidden_revs(&graph).unwrap(), Vec::<Rev>::new());
    }
}
