/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Merge state: the on-disk record of an in-progress merge.
//!
//! Written by the update/merge engine after planning, consulted by
//! `resolve` to replay individual files and by `commit` to refuse while
//! anything is unresolved. The file survives interruption, which is
//! what makes merges resumable.
//!
//! Format (text, line-oriented, `\0`-separated fields):
//!
//! ```text
//! v1
//! parents\0<p1 hex>\0<p2 hex>
//! ancestors\0<hex>[,<hex>...]        # GCA candidates beyond the chosen one
//! file\0<u|r>\0<path>\0<ancestor>\0<local>\0<other>
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use types::Node;
use types::RepoPath;
use types::RepoPathBuf;
use types::NULL_ID;

use crate::errors::RepoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictState {
    Unresolved,
    Resolved,
}

/// The three inputs of one file's merge, plus its resolution state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileConflict {
    pub state: ConflictState,
    pub ancestor: Node,
    pub local: Node,
    pub other: Node,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeState {
    path: PathBuf,
    pub p1: Node,
    pub p2: Node,
    /// Common-ancestor candidates not picked for the first pass; a
    /// second resolution pass may retry a still-conflicting file
    /// against these.
    pub other_ancestors: Vec<Node>,
    files: BTreeMap<RepoPathBuf, FileConflict>,
}

impl MergeState {
    pub fn new(path: PathBuf, p1: Node, p2: Node) -> Self {
        MergeState {
            path,
            p1,
            p2,
            other_ancestors: Vec::new(),
            files: BTreeMap::new(),
        }
    }

    /// Load the saved merge state, or `None` when no merge is in
    /// progress.
    pub fn load(path: PathBuf) -> Result<Option<Self>, RepoError> {
        let data = match util::file::read_opt(&path)? {
            None => return Ok(None),
            Some(data) => data,
        };
        let text = String::from_utf8_lossy(&data).into_owned();
        let mut lines = text.lines();
        if lines.next() != Some("v1") {
            return Err(RepoError::Corrupt(
                "unsupported merge state version".to_string(),
            ));
        }
        let mut state = MergeState::new(path, NULL_ID, NULL_ID);
        for line in lines {
            let fields: Vec<&str> = line.split('\0').collect();
            match fields.as_slice() {
                ["parents", p1, p2] => {
                    state.p1 = parse_node(p1)?;
                    state.p2 = parse_node(p2)?;
                }
                ["ancestors", list] => {
                    for hex in list.split(',').filter(|s| !s.is_empty()) {
                        state.other_ancestors.push(parse_node(hex)?);
                    }
                }
                ["file", flag, path, ancestor, local, other] => {
                    let conflict = FileConflict {
                        state: match *flag {
                            "r" => ConflictState::Resolved,
                            _ => ConflictState::Unresolved,
                        },
                        ancestor: parse_node(ancestor)?,
                        local: parse_node(local)?,
                        other: parse_node(other)?,
                    };
                    let path = RepoPathBuf::from_string(path.to_string())
                        .map_err(|e| RepoError::Corrupt(e.to_string()))?;
                    state.files.insert(path, conflict);
                }
                _ => continue,
            }
        }
        Ok(Some(state))
    }

    pub fn write(&self) -> Result<(), RepoError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = String::from("v1\n");
        out.push_str(&format!(
            "parents\0{}\0{}\n",
            self.p1.to_hex(),
            self.p2.to_hex()
        ));
        if !self.other_ancestors.is_empty() {
            let list: Vec<String> =
                self.other_ancestors.iter().map(|n| n.to_hex()).collect();
            out.push_str(&format!("ancestors\0{}\n", list.join(",")));
        }
        for (path, conflict) in &self.files {
            let flag = match conflict.state {
                ConflictState::Resolved => "r",
                ConflictState::Unresolved => "u",
            };
            out.push_str(&format!(
                "file\0{}\0{}\0{}\0{}\0{}\n",
                flag,
                path,
                conflict.ancestor.to_hex(),
                conflict.local.to_hex(),
                conflict.other.to_hex()
            ));
        }
        util::atomicfile::atomic_write_bytes(&self.path, out.as_bytes())?;
        Ok(())
    }

    /// Remove the state file: the merge is finished or abandoned.
    pub fn delete(&self) -> Result<(), RepoError> {
        util::file::unlink_opt(&self.path)?;
        Ok(())
    }

    pub fn add_conflict(&mut self, path: RepoPathBuf, ancestor: Node, local: Node, other: Node) {
        self.files.insert(
            path,
            FileConflict {
                state: ConflictState::Unresolved,
                ancestor,
                local,
                other,
            },
        );
    }

    pub fn mark_resolved(&mut self, path: &RepoPath) -> bool {
        match self.files.get_mut(path) {
            Some(conflict) => {
                conflict.state = ConflictState::Resolved;
                true
            }
            None => false,
        }
    }

    pub fn mark_unresolved(&mut self, path: &RepoPath) -> bool {
        match self.files.get_mut(path) {
            Some(conflict) => {
                conflict.state = ConflictState::Unresolved;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, path: &RepoPath) -> Option<&FileConflict> {
        self.files.get(path)
    }

    pub fn files(&self) -> impl Iterator<Item = (&RepoPath, &FileConflict)> {
        self.files
            .iter()
            .map(|(path, conflict)| (path.as_repo_path(), conflict))
    }

    pub fn unresolved(&self) -> impl Iterator<Item = &RepoPath> {
        self.files().filter_map(|(path, conflict)| {
            (conflict.state == ConflictState::Unresolved).then_some(path)
        })
    }

    pub fn has_unresolved(&self) -> bool {
        self.unresolved().next().is_some()
    }
}

fn parse_node(hex: &str) -> Result<Node, RepoError> {
    Node::from_hex(hex.as_bytes()).map_err(|e| RepoError::Corrupt(e.to_string()))
}

#[cfg(test)]
mod tests {
    use types::NULL_ID;

    use super::*;

    fn node(seed: u8) -> Node {
        Node::from_content(&[seed], &NULL_ID, &NULL_ID)
    }

    fn p(s: &str) -> RepoPathBuf {
        RepoPathBuf::from_string(s.to_string()).unwrap()
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("merge-state");
        let mut state = MergeState::new(path.clone(), node(1), node(2));
        state.other_ancestors.push(node(3));
        state.add_conflict(p("a.txt"), node(4), node(5), node(6));
        state.add_conflict(p("b bis.txt"), node(7), node(8), node(9));
        state.mark_resolved(&p("b bis.txt"));
        state.write().unwrap();

        let loaded = MergeState::load(path).unwrap().unwrap();
        assert_eq!(loaded, state);
        assert!(loaded.has_unresolved());
        let unresolved: Vec<String> =
            loaded.unresolved().map(|p| p.to_string()).collect();
        assert_eq!(unresolved, vec!["a.txt".to_string()]);
    }

    #[test]
    fn test_missing_file_means_no_merge() {
        let dir = tempfile::tempdir().unwrap();
        assert!(MergeState::load(dir.path().join("merge-state"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_resolve_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = MergeState::new(dir.path().join("ms"), node(1), node(2));
        state.add_conflict(p("f"), NULL_ID, node(3), node(4));
        assert!(state.mark_resolved(&p("f")));
        assert!(!state.has_unresolved());
        assert!(state.mark_unresolved(&p("f")));
        assert!(state.has_unresolved());
        assert!(!state.mark_resolved(&p("ghost")));
        state.delete().unwrap();
    }
}
