/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Filelogs: one revlog per tracked path.
//!
//! The payload is the file content, optionally preceded by a metadata
//! header recording a copy source:
//!
//! ```text
//! \x01\n
//! copy: <source-path>
//! copyrev: <source-node-hex>
//! \x01\n
//! <content>
//! ```
//!
//! The header participates in the node hash (copies change identity)
//! and is stripped by [`Filelog::content`]. Content that itself begins
//! with the `\x01\n` sentinel is wrapped in an empty header so the
//! sentinel cannot be forged.

use std::path::PathBuf;

use revlog::RevFlags;
use revlog::Revlog;
use revlog::RevlogConfig;
use thiserror::Error;
use transaction::Transaction;
use types::Node;
use types::RepoPath;
use types::RepoPathBuf;
use types::Rev;

const META_SENTINEL: &[u8] = b"\x01\n";

#[derive(Debug, Error)]
pub enum FilelogError {
    #[error("malformed filelog metadata: {0}")]
    MalformedMeta(String),

    #[error(transparent)]
    Revlog(#[from] revlog::RevlogError),
}

/// Copy source recorded in a filelog entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyInfo {
    pub path: RepoPathBuf,
    pub node: Node,
}

pub struct Filelog {
    revlog: Revlog,
}

impl Filelog {
    pub fn open(index_path: impl Into<PathBuf>, config: RevlogConfig) -> Result<Self, FilelogError> {
        Ok(Filelog {
            revlog: Revlog::open(index_path, config)?,
        })
    }

    pub fn revlog(&self) -> &Revlog {
        &self.revlog
    }

    pub fn revlog_mut(&mut self) -> &mut Revlog {
        &mut self.revlog
    }

    pub fn len(&self) -> usize {
        self.revlog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revlog.is_empty()
    }

    /// Append file content with optional copy metadata.
    pub fn add(
        &mut self,
        txn: &mut Transaction,
        content: &[u8],
        copy: Option<&CopyInfo>,
        p1: Rev,
        p2: Rev,
        link_rev: Rev,
    ) -> Result<(Rev, Node), FilelogError> {
        let payload = encode_payload(content, copy);
        Ok(self
            .revlog
            .append(txn, &payload, p1, p2, link_rev, RevFlags::empty())?)
    }

    /// File content at `rev`, metadata stripped.
    pub fn content(&self, rev: Rev) -> Result<Vec<u8>, FilelogError> {
        let payload = self.revlog.text(rev)?;
        let (_, content) = split_payload(&payload)?;
        Ok(content.to_vec())
    }

    /// Copy metadata at `rev`, if any.
    pub fn copy_info(&self, rev: Rev) -> Result<Option<CopyInfo>, FilelogError> {
        let payload = self.revlog.text(rev)?;
        let (meta, _) = split_payload(&payload)?;
        parse_copy_meta(meta)
    }

    /// Whether the stored content at `rev` equals `content`, comparing
    /// sizes first to skip reconstruction where possible.
    pub fn content_equals(&self, rev: Rev, content: &[u8]) -> Result<bool, FilelogError> {
        // The stored payload is the content plus an optional header, so
        // a payload shorter than the candidate can never match.
        if (self.revlog.uncompressed_len(rev)? as usize) < content.len() {
            return Ok(false);
        }
        Ok(self.content(rev)? == content)
    }
}

/// Build the stored payload for content + copy metadata.
fn encode_payload(content: &[u8], copy: Option<&CopyInfo>) -> Vec<u8> {
    let mut meta = Vec::new();
    if let Some(copy) = copy {
        meta.extend_from_slice(b"copy: ");
        meta.extend_from_slice(copy.path.as_bytes());
        meta.extend_from_slice(b"\ncopyrev: ");
        meta.extend_from_slice(copy.node.to_hex().as_bytes());
        meta.push(b'\n');
    }
    if meta.is_empty() && !content.starts_with(META_SENTINEL) {
        return content.to_vec();
    }
    let mut out = Vec::with_capacity(meta.len() + content.len() + 4);
    out.extend_from_slice(META_SENTINEL);
    out.extend_from_slice(&meta);
    out.extend_from_slice(META_SENTINEL);
    out.extend_from_slice(content);
    out
}

/// Split a payload into (metadata block, content).
fn split_payload(payload: &[u8]) -> Result<(&[u8], &[u8]), FilelogError> {
    if !payload.starts_with(META_SENTINEL) {
        return Ok((&[], payload));
    }
    let body = &payload[META_SENTINEL.len()..];
    let end = body
        .windows(META_SENTINEL.len())
        .position(|window| window == META_SENTINEL)
        .ok_or_else(|| {
            FilelogError::MalformedMeta("unterminated metadata header".to_string())
        })?;
    Ok((&body[..end], &body[end + META_SENTINEL.len()..]))
}

fn parse_copy_meta(meta: &[u8]) -> Result<Option<CopyInfo>, FilelogError> {
    if meta.is_empty() {
        return Ok(None);
    }
    let text = std::str::from_utf8(meta)
        .map_err(|_| FilelogError::MalformedMeta("metadata is not utf-8".to_string()))?;
    let mut path = None;
    let mut node = None;
    for line in text.lines() {
        if let Some(value) = line.strip_prefix("copy: ") {
            path = Some(
                RepoPath::from_str(value)
                    .map_err(|e| FilelogError::MalformedMeta(e.to_string()))?
                    .to_owned(),
            );
        } else if let Some(value) = line.strip_prefix("copyrev: ") {
            node = Some(
                Node::from_hex(value.as_bytes())
                    .map_err(|e| FilelogError::MalformedMeta(e.to_string()))?,
            );
        } else {
            return Err(FilelogError::MalformedMeta(format!(
                "unknown metadata line {:?}",
                line
            )));
        }
    }
    match (path, node) {
        (Some(path), Some(node)) => Ok(Some(CopyInfo { path, node })),
        (None, None) => Ok(None),
        _ => Err(FilelogError::MalformedMeta(
            "copy and copyrev must appear together".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use types::NULL_ID;
    use types::NULL_REV;

    use super::*;

    struct TestFilelog {
        dir: tempfile::TempDir,
        filelog: Filelog,
    }

    impl TestFilelog {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let filelog =
                Filelog::open(dir.path().join("a.i"), RevlogConfig::default()).unwrap();
            TestFilelog { dir, filelog }
        }

        fn add(&mut self, content: &[u8], copy: Option<&CopyInfo>, p1: Rev) -> (Rev, Node) {
            let mut txn = Transaction::open(self.dir.path().join("journal")).unwrap();
            let result = self
                .filelog
                .add(&mut txn, content, copy, p1, NULL_REV, 0)
                .unwrap();
            txn.commit(&self.dir.path().join("undo")).unwrap();
            result
        }
    }

    #[test]
    fn test_plain_content() {
        let mut t = TestFilelog::new();
        let (rev, _) = t.add(b"hello\n", None, NULL_REV);
        assert_eq!(t.filelog.content(rev).unwrap(), b"hello\n");
        assert_eq!(t.filelog.copy_info(rev).unwrap(), None);
        assert!(t.filelog.content_equals(rev, b"hello\n").unwrap());
        assert!(!t.filelog.content_equals(rev, b"hello!\n").unwrap());
        assert!(!t.filelog.content_equals(rev, b"other!\n").unwrap());
    }

    #[test]
    fn test_copy_metadata_roundtrip() {
        let mut t = TestFilelog::new();
        let copy = CopyInfo {
            path: RepoPathBuf::from_string("old/name".to_string()).unwrap(),
            node: Node::from_content(b"v0", &NULL_ID, &NULL_ID),
        };
        let (rev, _) = t.add(b"moved content\n", Some(&copy), NULL_REV);
        assert_eq!(t.filelog.content(rev).unwrap(), b"moved content\n");
        assert_eq!(t.filelog.copy_info(rev).unwrap(), Some(copy));
    }

    #[test]
    fn test_copy_changes_node() {
        let mut t = TestFilelog::new();
        let copy = CopyInfo {
            path: RepoPathBuf::from_string("source".to_string()).unwrap(),
            node: Node::from_content(b"v0", &NULL_ID, &NULL_ID),
        };
        let (_, plain) = t.add(b"same\n", None, NULL_REV);
        let mut t2 = TestFilelog::new();
        let (_, copied) = t2.add(b"same\n", Some(&copy), NULL_REV);
        assert_ne!(plain, copied);
    }

    #[test]
    fn test_sentinel_content_is_escaped() {
        let mut t = TestFilelog::new();
        let tricky = b"\x01\nnot actually metadata\n";
        let (rev, _) = t.add(tricky, None, NULL_REV);
        assert_eq!(t.filelog.content(rev).unwrap(), tricky);
        assert_eq!(t.filelog.copy_info(rev).unwrap(), None);
        assert!(t.filelog.content_equals(rev, tricky).unwrap());
    }

    #[test]
    fn test_malformed_meta_rejected() {
        assert!(parse_copy_meta(b"copy: onlypath\n").is_err());
        assert!(parse_copy_meta(b"mystery: value\n").is_err());
        assert!(split_payload(b"\x01\ncopy: x\n").is_err());
    }
}
