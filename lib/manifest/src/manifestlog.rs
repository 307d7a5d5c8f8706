/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use revlog::RevFlags;
use revlog::Revlog;
use revlog::RevlogConfig;
use transaction::Transaction;
use types::Node;
use types::Rev;

use crate::Manifest;
use crate::ManifestError;

/// Total parsed manifest entries kept across cached manifests.
const DEFAULT_CACHE_ENTRIES: usize = 100_000;

/// The manifest revlog plus a bounded cache of parsed manifests.
///
/// Parsing a big manifest dominates operations that look at several
/// snapshots (status against two parents, merges, verify), so recently
/// parsed ones are kept until the cache holds `max_entries` manifest
/// lines in total. Eviction is oldest-first.
pub struct ManifestLog {
    revlog: Revlog,
    cache: Mutex<Cache>,
}

struct Cache {
    parsed: HashMap<Node, Arc<Manifest>>,
    order: VecDeque<Node>,
    entries: usize,
    max_entries: usize,
}

impl ManifestLog {
    pub fn open(index_path: impl Into<PathBuf>, config: RevlogConfig) -> Result<Self, ManifestError> {
        Ok(ManifestLog {
            revlog: Revlog::open(index_path, config)?,
            cache: Mutex::new(Cache {
                parsed: HashMap::new(),
                order: VecDeque::new(),
                entries: 0,
                max_entries: DEFAULT_CACHE_ENTRIES,
            }),
        })
    }

    pub fn revlog(&self) -> &Revlog {
        &self.revlog
    }

    pub fn revlog_mut(&mut self) -> &mut Revlog {
        &mut self.revlog
    }

    pub fn rev_of_node(&self, node: &Node) -> Option<Rev> {
        self.revlog.rev_of_node(node)
    }

    /// The parsed manifest stored under `node`.
    pub fn get(&self, node: &Node) -> Result<Arc<Manifest>, ManifestError> {
        if node.is_null() {
            return Ok(Arc::new(Manifest::new()));
        }
        if let Some(found) = self.cache.lock().parsed.get(node) {
            return Ok(found.clone());
        }
        let rev = self
            .revlog
            .rev_of_node(node)
            .ok_or(revlog::RevlogError::UnknownNode(*node))?;
        self.get_rev(rev)
    }

    pub fn get_rev(&self, rev: Rev) -> Result<Arc<Manifest>, ManifestError> {
        let node = self.revlog.node(rev)?;
        let manifest = Arc::new(Manifest::parse(&self.revlog.text(rev)?)?);
        self.cache.lock().put(node, manifest.clone());
        Ok(manifest)
    }

    /// Store a manifest; returns its rev and node. Duplicate content
    /// with the same parents is a no-op by revlog rules.
    pub fn add(
        &mut self,
        txn: &mut Transaction,
        manifest: &Manifest,
        p1: Rev,
        p2: Rev,
        link_rev: Rev,
    ) -> Result<(Rev, Node), ManifestError> {
        let payload = manifest.serialize();
        let (rev, node) = self
            .revlog
            .append(txn, &payload, p1, p2, link_rev, RevFlags::empty())?;
        self.cache.lock().put(node, Arc::new(manifest.clone()));
        Ok((rev, node))
    }
}

impl Cache {
    fn put(&mut self, node: Node, manifest: Arc<Manifest>) {
        if self.parsed.contains_key(&node) {
            return;
        }
        self.entries += manifest.len();
        self.parsed.insert(node, manifest);
        self.order.push_back(node);
        while self.entries > self.max_entries && self.order.len() > 1 {
            if let Some(evicted) = self.order.pop_front() {
                if let Some(manifest) = self.parsed.remove(&evicted) {
                    self.entries -= manifest.len();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use transaction::Transaction;
    use types::FileType;
    use types::RepoPathBuf;
    use types::NULL_ID;
    use types::NULL_REV;

    use super::*;
    use crate::FileInfo;

    fn path(s: &str) -> RepoPathBuf {
        RepoPathBuf::from_string(s.to_string()).unwrap()
    }

    #[test]
    fn test_store_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = ManifestLog::open(
            dir.path().join("00manifest.i"),
            RevlogConfig::default(),
        )
        .unwrap();

        let mut manifest = Manifest::new();
        manifest.insert(
            path("a"),
            FileInfo::new(Node::from_content(b"a", &NULL_ID, &NULL_ID), FileType::Regular),
        );

        let mut txn = Transaction::open(dir.path().join("journal")).unwrap();
        let (rev, node) = log
            .add(&mut txn, &manifest, NULL_REV, NULL_REV, 0)
            .unwrap();
        txn.commit(&dir.path().join("undo")).unwrap();
        assert_eq!(rev, 0);

        // Cached read and a cold read after reopen agree.
        assert_eq!(*log.get(&node).unwrap(), manifest);
        let log = ManifestLog::open(
            dir.path().join("00manifest.i"),
            RevlogConfig::default(),
        )
        .unwrap();
        assert_eq!(*log.get(&node).unwrap(), manifest);
    }

    #[test]
    fn test_null_node_is_empty_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let log = ManifestLog::open(
            dir.path().join("00manifest.i"),
            RevlogConfig::default(),
        )
        .unwrap();
        assert!(log.get(&NULL_ID).unwrap().is_empty());
    }

    #[test]
    fn test_cache_eviction_by_entry_count() {
        let mut cache = Cache {
            parsed: HashMap::new(),
            order: VecDeque::new(),
            entries: 0,
            max_entries: 5,
        };
        let mut manifest = Manifest::new();
        for i in 0..4 {
            manifest.insert(
                path(&format!("file{}", i)),
                FileInfo::new(NULL_ID, FileType::Regular),
            );
        }
        let n1 = Node::from_content(b"1", &NULL_ID, &NULL_ID);
        let n2 = Node::from_content(b"2", &NULL_ID, &NULL_ID);
        cache.put(n1, Arc::new(manifest.clone()));
        cache.put(n2, Arc::new(manifest));
        // Four entries each against a five-entry budget: the older one
        // goes.
        assert!(!cache.parsed.contains_key(&n1));
        assert!(cache.parsed.contains_key(&n2));
    }
}
