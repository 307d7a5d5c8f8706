/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! The peer interface.
//!
//! Every transport reduces to these six capabilities. The local
//! implementation wraps another repository in-process (and is what the
//! tests exchange against); the bundle-file implementation serves pulls
//! from a bundle on disk. HTTP and SSH peers live with their transports,
//! outside the core.

use repo::Repo;
use types::Node;
use ui::Ui;

use crate::ExchangeError;

pub trait Peer {
    /// Heads of the peer's (visible) changelog.
    fn heads(&mut self) -> Result<Vec<Node>, ExchangeError>;

    /// For each node: does the peer have it?
    fn known(&mut self, nodes: &[Node]) -> Result<Vec<bool>, ExchangeError>;

    /// A bundle of everything in `ancestors(heads) - ancestors(common)`.
    fn get_bundle(&mut self, common: &[Node], heads: &[Node]) -> Result<Vec<u8>, ExchangeError>;

    /// Apply a bundle pushed at the peer.
    fn unbundle(&mut self, bundle: &[u8]) -> Result<(), ExchangeError>;

    /// Key/value listing of a namespace (`bookmarks`, `phases`).
    fn list_keys(&mut self, namespace: &str) -> Result<Vec<(String, String)>, ExchangeError>;

    /// Conditional update of one key; `Ok(false)` when the old value
    /// did not match.
    fn push_key(
        &mut self,
        namespace: &str,
        key: &str,
        old: &str,
        new: &str,
    ) -> Result<bool, ExchangeError>;
}

/// A peer backed by a repository in the same process.
pub struct LocalPeer<'a> {
    repo: &'a mut Repo,
    ui: Ui,
    /// Bookmark whose head incoming pushes rebase onto, when set.
    pushrebase_onto: Option<String>,
}

impl<'a> LocalPeer<'a> {
    pub fn new(repo: &'a mut Repo) -> Self {
        LocalPeer {
            repo,
            ui: Ui::null(),
            pushrebase_onto: None,
        }
    }

    /// Advertise pushrebase onto `bookmark`.
    pub fn with_pushrebase(mut self, bookmark: impl Into<String>) -> Self {
        self.pushrebase_onto = Some(bookmark.into());
        self
    }

    pub fn repo(&mut self) -> &mut Repo {
        self.repo
    }
}

impl<'a> Peer for LocalPeer<'a> {
    fn heads(&mut self) -> Result<Vec<Node>, ExchangeError> {
        Ok(self.repo.heads()?)
    }

    fn known(&mut self, nodes: &[Node]) -> Result<Vec<bool>, ExchangeError> {
        Ok(nodes
            .iter()
            .map(|node| self.repo.store().rev_of_node(node).is_some())
            .collect())
    }

    fn get_bundle(&mut self, common: &[Node], heads: &[Node]) -> Result<Vec<u8>, ExchangeError> {
        crate::generate_bundle(self.repo, common, heads, None)
    }

    fn unbundle(&mut self, bundle: &[u8]) -> Result<(), ExchangeError> {
        match self.pushrebase_onto.clone() {
            Some(bookmark) => {
                crate::pushrebase::apply_pushrebase(self.repo, &self.ui, bundle, &bookmark)?;
            }
            None => {
                crate::apply_bundle(self.repo, &self.ui, bundle)?;
            }
        }
        Ok(())
    }

    fn list_keys(&mut self, namespace: &str) -> Result<Vec<(String, String)>, ExchangeError> {
        match namespace {
            "bookmarks" => Ok(self
                .repo
                .store()
                .bookmarks()
                .iter()
                .map(|(name, node)| (name.to_string(), node.to_hex()))
                .collect()),
            _ => Ok(Vec::new()),
        }
    }

    fn push_key(
        &mut self,
        namespace: &str,
        key: &str,
        old: &str,
        new: &str,
    ) -> Result<bool, ExchangeError> {
        if namespace != "bookmarks" {
            return Ok(false);
        }
        let current = self
            .repo
            .store()
            .bookmarks()
            .get(key)
            .map(|n| n.to_hex())
            .unwrap_or_default();
        if current != old {
            return Ok(false);
        }
        let _lock = self.repo.lock_store()?;
        let mut txn = self.repo.begin_transaction()?;
        let result = if new.is_empty() {
            self.repo
                .store_mut()
                .bookmarks_mut()
                .delete(&mut txn, key)
                .map(|_| true)
        } else {
            match Node::from_hex(new.as_bytes()) {
                Ok(node) => self
                    .repo
                    .store_mut()
                    .bookmarks_mut()
                    .set(&mut txn, key, node)
                    .map(|_| true),
                Err(_) => Ok(false),
            }
        };
        match result {
            Ok(changed) => {
                txn.commit(&self.repo.store().undo_path())
                    .map_err(repo::RepoError::from)?;
                Ok(changed)
            }
            Err(err) => {
                let _ = txn.abort();
                Err(err.into())
            }
        }
    }
}

/// A read-only peer backed by a bundle file: `clone`/`pull` from a
/// backup.
pub struct BundleFilePeer {
    bytes: Vec<u8>,
    heads: Vec<Node>,
    nodes: Vec<Node>,
}

impl BundleFilePeer {
    pub fn open(path: &std::path::Path) -> Result<Self, ExchangeError> {
        let bytes = std::fs::read(path)?;
        let mut reader = bundles::BundleReader::new(&bytes[..])?;
        let mut nodes = Vec::new();
        let mut parents: Vec<(Node, Node, Node)> = Vec::new();
        while let Some(part) = reader.next_part()? {
            if part.canonical_name() == bundles::part_names::CHANGEGROUP {
                let group = bundles::changegroup::Changegroup::decode(&part.payload[..])?;
                for entry in &group.changelog {
                    nodes.push(entry.node);
                    parents.push((entry.node, entry.p1, entry.p2));
                }
            }
        }
        // Heads: nodes no other entry names as a parent.
        let heads = parents
            .iter()
            .filter(|(node, _, _)| {
                !parents.iter().any(|(_, p1, p2)| p1 == node || p2 == node)
            })
            .map(|(node, _, _)| *node)
            .collect();
        Ok(BundleFilePeer {
            bytes,
            heads,
            nodes,
        })
    }
}

impl Peer for BundleFilePeer {
    fn heads(&mut self) -> Result<Vec<Node>, ExchangeError> {
        Ok(self.heads.clone())
    }

    fn known(&mut self, nodes: &[Node]) -> Result<Vec<bool>, ExchangeError> {
        Ok(nodes
            .iter()
            .map(|node| self.nodes.contains(node))
            .collect())
    }

    fn get_bundle(&mut self, _common: &[Node], _heads: &[Node]) -> Result<Vec<u8>, ExchangeError> {
        // The receiver skips entries it already has; the whole file is
        // the answer.
        Ok(self.bytes.clone())
    }

    fn unbundle(&mut self, _bundle: &[u8]) -> Result<(), ExchangeError> {
        Err(ExchangeError::Unsupported("push to a bundle file"))
    }

    fn list_keys(&mut self, _namespace: &str) -> Result<Vec<(String, String)>, ExchangeError> {
        Ok(Vec::new())
    }

    fn push_key(
        &mut self,
        _namespace: &str,
        _key: &str,
        _old: &str,
        _new: &str,
    ) -> Result<bool, ExchangeError> {
        Err(ExchangeError::Unsupported("pushkey to a bundle file"))
    }
}
