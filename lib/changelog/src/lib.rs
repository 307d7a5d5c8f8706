/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! The changelog: the revlog whose entries are changesets.
//!
//! A changeset payload is newline-structured text:
//!
//! ```text
//! <manifest-node-hex>
//! <author>
//! <utc-seconds> <tz-offset> [key=value ...]
//! <touched path>
//! ...
//! <blank line>
//! <description>
//! ```
//!
//! Extra key/value pairs ride on the date line, space-separated, with
//! `%`-escaping so keys and values can hold spaces, `=`, newlines and
//! `%` itself.

use std::collections::BTreeMap;
use std::path::PathBuf;

use revlog::RevFlags;
use revlog::Revlog;
use revlog::RevlogConfig;
use thiserror::Error;
use transaction::Transaction;
use types::Node;
use types::RepoPathBuf;
use types::Rev;

#[derive(Debug, Error)]
pub enum ChangelogError {
    #[error("malformed changeset: {0}")]
    Malformed(String),

    #[error(transparent)]
    Revlog(#[from] revlog::RevlogError),
}

/// Commit date: UTC seconds plus the author's offset from UTC in
/// seconds (positive = west, as the wire format has it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HgTime {
    pub unixtime: i64,
    pub offset: i32,
}

/// A parsed changeset.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Changeset {
    pub manifest_node: Node,
    pub author: String,
    pub time: HgTime,
    pub extra: BTreeMap<String, String>,
    pub files: Vec<RepoPathBuf>,
    pub description: String,
}

impl Changeset {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(self.manifest_node.to_hex().as_bytes());
        out.push(b'\n');
        out.extend_from_slice(self.author.as_bytes());
        out.push(b'\n');
        out.extend_from_slice(
            format!("{} {}", self.time.unixtime, self.time.offset).as_bytes(),
        );
        for (key, value) in &self.extra {
            out.push(b' ');
            out.extend_from_slice(escape(key).as_bytes());
            out.push(b'=');
            out.extend_from_slice(escape(value).as_bytes());
        }
        out.push(b'\n');
        for file in &self.files {
            out.extend_from_slice(file.as_bytes());
            out.push(b'\n');
        }
        out.push(b'\n');
        out.extend_from_slice(self.description.as_bytes());
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self, ChangelogError> {
        let text = std::str::from_utf8(data)
            .map_err(|_| ChangelogError::Malformed("not utf-8".to_string()))?;
        let mut lines = text.split('\n');

        let manifest_line = lines
            .next()
            .ok_or_else(|| ChangelogError::Malformed("empty changeset".to_string()))?;
        let manifest_node = Node::from_hex(manifest_line.as_bytes())
            .map_err(|e| ChangelogError::Malformed(e.to_string()))?;

        let author = lines
            .next()
            .ok_or_else(|| ChangelogError::Malformed("missing author".to_string()))?
            .to_string();

        let date_line = lines
            .next()
            .ok_or_else(|| ChangelogError::Malformed("missing date".to_string()))?;
        let mut words = date_line.split(' ');
        let unixtime = words
            .next()
            .and_then(|w| w.parse::<i64>().ok())
            .ok_or_else(|| ChangelogError::Malformed(format!("bad date line {:?}", date_line)))?;
        let offset = words
            .next()
            .and_then(|w| w.parse::<i32>().ok())
            .ok_or_else(|| ChangelogError::Malformed(format!("bad date line {:?}", date_line)))?;
        let mut extra = BTreeMap::new();
        for pair in words {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                ChangelogError::Malformed(format!("bad extra {:?}", pair))
            })?;
            extra.insert(unescape(key)?, unescape(value)?);
        }

        let mut files = Vec::new();
        for line in lines.by_ref() {
            if line.is_empty() {
                break;
            }
            let path = RepoPathBuf::from_string(line.to_string())
                .map_err(|e| ChangelogError::Malformed(e.to_string()))?;
            files.push(path);
        }

        let description = lines.collect::<Vec<&str>>().join("\n");

        Ok(Changeset {
            manifest_node,
            author,
            time: HgTime { unixtime, offset },
            extra,
            files,
            description,
        })
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '%' => out.push_str("%25"),
            ' ' => out.push_str("%20"),
            '=' => out.push_str("%3d"),
            '\n' => out.push_str("%0a"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(s: &str) -> Result<String, ChangelogError> {
    let bytes = s.as_bytes();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = s
                .get(i + 1..i + 3)
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| ChangelogError::Malformed(format!("bad escape in {:?}", s)))?;
            out.push(hex as char);
            i += 3;
        } else {
            // Multi-byte chars pass through untouched.
            let c = s[i..].chars().next().unwrap();
            out.push(c);
            i += c.len_utf8();
        }
    }
    Ok(out)
}

/// The changelog revlog.
pub struct Changelog {
    revlog: Revlog,
}

impl Changelog {
    pub fn open(index_path: impl Into<PathBuf>, config: RevlogConfig) -> Result<Self, ChangelogError> {
        Ok(Changelog {
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

    pub fn tip(&self) -> Rev {
        self.revlog.tip()
    }

    /// Parse the changeset at `rev`.
    pub fn changeset(&self, rev: Rev) -> Result<Changeset, ChangelogError> {
        Changeset::parse(&self.revlog.text(rev)?)
    }

    /// Append a changeset. The link rev of a changelog entry is itself.
    pub fn add(
        &mut self,
        txn: &mut Transaction,
        changeset: &Changeset,
        p1: Rev,
        p2: Rev,
    ) -> Result<(Rev, Node), ChangelogError> {
        let payload = changeset.serialize();
        let link_rev = self.revlog.len() as Rev;
        Ok(self
            .revlog
            .append(txn, &payload, p1, p2, link_rev, RevFlags::empty())?)
    }
}

#[cfg(test)]
mod tests {
    use types::NULL_ID;
    use types::NULL_REV;

    use super::*;

    fn sample() -> Changeset {
        let mut extra = BTreeMap::new();
        extra.insert("branch".to_string(), "default".to_string());
        extra.insert("rebase_source".to_string(), "a b=c%d".to_string());
        Changeset {
            manifest_node: Node::from_content(b"m", &NULL_ID, &NULL_ID),
            author: "Alice <alice@example.com>".to_string(),
            time: HgTime {
                unixtime: 1700000000,
                offset: -7200,
            },
            extra,
            files: vec![
                RepoPathBuf::from_string("a".to_string()).unwrap(),
                RepoPathBuf::from_string("dir/b".to_string()).unwrap(),
            ],
            description: "add a and dir/b\n\nlonger explanation".to_string(),
        }
    }

    #[test]
    fn test_serialize_parse_roundtrip() {
        let changeset = sample();
        let parsed = Changeset::parse(&changeset.serialize()).unwrap();
        assert_eq!(parsed, changeset);
    }

    #[test]
    fn test_wire_shape() {
        let changeset = sample();
        let text = String::from_utf8(changeset.serialize()).unwrap();
        let lines: Vec<&str> = text.split('\n').collect();
        assert_eq!(lines[0], changeset.manifest_node.to_hex());
        assert_eq!(lines[1], "Alice <alice@example.com>");
        assert!(lines[2].starts_with("1700000000 -7200 "));
        assert!(lines[2].contains("rebase_source=a%20b%3dc%25d"));
        assert_eq!(lines[3], "a");
        assert_eq!(lines[4], "dir/b");
        assert_eq!(lines[5], "");
        assert_eq!(lines[6], "add a and dir/b");
    }

    #[test]
    fn test_no_files_no_extra() {
        let changeset = Changeset {
            author: "bob".to_string(),
            description: "empty".to_string(),
            ..Default::default()
        };
        let parsed = Changeset::parse(&changeset.serialize()).unwrap();
        assert_eq!(parsed, changeset);
        assert!(parsed.files.is_empty());
        assert!(parsed.extra.is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Changeset::parse(b"").is_err());
        assert!(Changeset::parse(b"nothex\nuser\n1 0\n\n").is_err());
        let bad_date = format!("{}\nuser\nsoon 0\n\n", NULL_ID.to_hex());
        assert!(Changeset::parse(bad_date.as_bytes()).is_err());
    }

    #[test]
    fn test_changelog_add_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut changelog = Changelog::open(
            dir.path().join("00changelog.i"),
            RevlogConfig::default(),
        )
        .unwrap();
        let changeset = sample();
        let mut txn = Transaction::open(dir.path().join("journal")).unwrap();
        let (rev, _node) = changelog
            .add(&mut txn, &changeset, NULL_REV, NULL_REV)
            .unwrap();
        txn.commit(&dir.path().join("undo")).unwrap();
        assert_eq!(rev, 0);
        assert_eq!(changelog.changeset(0).unwrap(), changeset);
        assert_eq!(changelog.revlog().link_rev(0).unwrap(), 0);
    }
}
