/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Bookmarks: named mutable pointers to changesets.
//!
//! Stored as `<hex> <name>` lines; the active bookmark name lives in
//! its own file so checkout can switch it without rewriting the table.
//! The table is rewritten in place, so transactional writes register a
//! full backup.

use std::collections::BTreeMap;
use std::path::PathBuf;

use transaction::Transaction;
use types::Node;

use crate::errors::RepoError;

pub struct Bookmarks {
    path: PathBuf,
    active_path: PathBuf,
    entries: BTreeMap<String, Node>,
}

impl Bookmarks {
    pub fn load(path: PathBuf, active_path: PathBuf) -> Result<Self, RepoError> {
        let mut entries = BTreeMap::new();
        if let Some(data) = util::file::read_opt(&path)? {
            for line in String::from_utf8_lossy(&data).lines() {
                if let Some((hex, name)) = line.split_once(' ') {
                    if let Ok(node) = Node::from_hex(hex.as_bytes()) {
                        entries.insert(name.to_string(), node);
                    }
                }
            }
        }
        Ok(Bookmarks {
            path,
            active_path,
            entries,
        })
    }

    pub fn get(&self, name: &str) -> Option<Node> {
        self.entries.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.entries.iter().map(|(name, node)| (name.as_str(), node))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn set(
        &mut self,
        txn: &mut Transaction,
        name: &str,
        node: Node,
    ) -> Result<(), RepoError> {
        self.entries.insert(name.to_string(), node);
        self.save(txn)
    }

    pub fn delete(&mut self, txn: &mut Transaction, name: &str) -> Result<bool, RepoError> {
        let removed = self.entries.remove(name).is_some();
        if removed {
            self.save(txn)?;
        }
        Ok(removed)
    }

    fn save(&self, txn: &mut Transaction) -> Result<(), RepoError> {
        txn.add_backup(&self.path)?;
        let mut out = String::new();
        for (name, node) in &self.entries {
            out.push_str(&format!("{} {}\n", node.to_hex(), name));
        }
        util::atomicfile::atomic_write_bytes(&self.path, out.as_bytes())?;
        Ok(())
    }

    /// The currently active bookmark, if any.
    pub fn active(&self) -> Result<Option<String>, RepoError> {
        Ok(util::file::read_opt(&self.active_path)?
            .map(|data| String::from_utf8_lossy(&data).trim().to_string())
            .filter(|name| !name.is_empty()))
    }

    /// Activate (Some) or deactivate (None). Working-copy state, so it
    /// is not part of the store transaction.
    pub fn set_active(&self, name: Option<&str>) -> Result<(), RepoError> {
        match name {
            Some(name) => {
                util::atomicfile::atomic_write_bytes(&self.active_path, name.as_bytes())?
            }
            None => util::file::unlink_opt(&self.active_path)?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use types::NULL_ID;

    use super::*;

    fn node(seed: u8) -> Node {
        Node::from_content(&[seed], &NULL_ID, &NULL_ID)
    }

    struct Fixture {
        dir: tempfile::TempDir,
        bookmarks: Bookmarks,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let bookmarks = Bookmarks::load(
                dir.path().join("bookmarks"),
                dir.path().join("bookmarks.current"),
            )
            .unwrap();
            Fixture { dir, bookmarks }
        }

        fn reload(&mut self) {
            self.bookmarks = Bookmarks::load(
                self.dir.path().join("bookmarks"),
                self.dir.path().join("bookmarks.current"),
            )
            .unwrap();
        }
    }

    #[test]
    fn test_set_get_delete() {
        let mut f = Fixture::new();
        let mut txn = Transaction::open(f.dir.path().join("journal")).unwrap();
        f.bookmarks.set(&mut txn, "main", node(1)).unwrap();
        f.bookmarks.set(&mut txn, "feature/x", node(2)).unwrap();
        txn.commit(&f.dir.path().join("undo")).unwrap();

        f.reload();
        assert_eq!(f.bookmarks.get("main"), Some(node(1)));
        assert_eq!(f.bookmarks.get("feature/x"), Some(node(2)));
        assert_eq!(f.bookmarks.get("nope"), None);

        let mut txn = Transaction::open(f.dir.path().join("journal")).unwrap();
        assert!(f.bookmarks.delete(&mut txn, "main").unwrap());
        assert!(!f.bookmarks.delete(&mut txn, "main").unwrap());
        txn.commit(&f.dir.path().join("undo")).unwrap();
        f.reload();
        assert_eq!(f.bookmarks.get("main"), None);
    }

    #[test]
    fn test_abort_restores_bookmarks() {
        let mut f = Fixture::new();
        {
            let mut txn = Transaction::open(f.dir.path().join("journal")).unwrap();
            f.bookmarks.set(&mut txn, "keep", node(1)).unwrap();
            txn.commit(&f.dir.path().join("undo")).unwrap();
        }
        {
            let mut txn = Transaction::open(f.dir.path().join("journal")).unwrap();
            f.bookmarks.set(&mut txn, "discard", node(2)).unwrap();
            txn.abort().unwrap();
        }
        f.reload();
        assert_eq!(f.bookmarks.get("keep"), Some(node(1)));
        assert_eq!(f.bookmarks.get("discard"), None);
    }

    #[test]
    fn test_active_bookmark() {
        let f = Fixture::new();
        assert_eq!(f.bookmarks.active().unwrap(), None);
        f.bookmarks.set_active(Some("main")).unwrap();
        assert_eq!(f.bookmarks.active().unwrap(), Some("main".to_string()));
        f.bookmarks.set_active(None).unwrap();
        assert_eq!(f.bookmarks.active().unwrap(), None);
    }
}
