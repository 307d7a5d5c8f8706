/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! The dirstate: the working copy's view of tracked files.
//!
//! An in-memory map path -> entry, persisted as one file rewritten
//! atomically. The file is a 40-byte parent header (p1, p2 nodes)
//! followed by per-path records:
//!
//! ```text
//! [state u8] [mode u32] [size i32] [mtime i32]
//! [path-len u32] path [copy-len u32 copy]   (copy iff state has 0x80)
//! ```
//!
//! The recorded (mode, size, mtime) triple is the stat cache: status
//! only reads file content when the triple no longer matches the
//! working copy.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use byteorder::BigEndian;
use byteorder::ByteOrder;
use thiserror::Error;
use types::Node;
use types::RepoPath;
use types::RepoPathBuf;
use types::NULL_ID;

#[derive(Debug, Error)]
pub enum DirstateError {
    #[error("corrupt dirstate: {0}")]
    Corrupt(String),

    #[error("cannot {action} {path}: {reason}")]
    BadOperation {
        action: &'static str,
        path: RepoPathBuf,
        reason: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Tracking state of one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Tracked and believed clean (stat cache decides).
    Normal,
    /// Scheduled for addition.
    Added,
    /// Scheduled for removal.
    Removed,
    /// Touched by an in-progress merge.
    Merged,
}

impl EntryState {
    fn to_byte(self) -> u8 {
        match self {
            EntryState::Normal => b'n',
            EntryState::Added => b'a',
            EntryState::Removed => b'r',
            EntryState::Merged => b'm',
        }
    }

    fn from_byte(byte: u8) -> Result<Self, DirstateError> {
        match byte {
            b'n' => Ok(EntryState::Normal),
            b'a' => Ok(EntryState::Added),
            b'r' => Ok(EntryState::Removed),
            b'm' => Ok(EntryState::Merged),
            other => Err(DirstateError::Corrupt(format!(
                "unknown entry state {:?}",
                other as char
            ))),
        }
    }
}

/// Size sentinel: stat data unusable, force a content comparison.
pub const SIZE_DIRTY: i32 = -2;

/// Mtime sentinel: written this second, mtime cannot be trusted yet.
pub const MTIME_UNSET: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirstateEntry {
    pub state: EntryState,
    pub mode: u32,
    pub size: i32,
    pub mtime: i32,
    pub copy_source: Option<RepoPathBuf>,
}

impl DirstateEntry {
    fn added() -> Self {
        DirstateEntry {
            state: EntryState::Added,
            mode: 0,
            size: SIZE_DIRTY,
            mtime: MTIME_UNSET,
            copy_source: None,
        }
    }

    /// Whether the cached stat matches: a `false` means the caller must
    /// compare content.
    pub fn maybe_clean(&self, mode: u32, size: u64, mtime: i64) -> bool {
        self.state == EntryState::Normal
            && self.size >= 0
            && self.size as u64 == size
            && self.mtime != MTIME_UNSET
            && self.mtime as i64 == mtime
            // Only the exec and link bits of the mode matter.
            && (self.mode ^ mode) & 0o170111 == 0
    }
}

/// The marker bit on the state byte announcing a copy-source field.
const COPY_BIT: u8 = 0x80;

/// Length of the parent header.
const HEADER_LEN: usize = 40;

pub struct Dirstate {
    path: PathBuf,
    parents: (Node, Node),
    entries: BTreeMap<RepoPathBuf, DirstateEntry>,
    dirty: bool,
}

impl Dirstate {
    /// Load the dirstate file, or start empty if it does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, DirstateError> {
        let path = path.into();
        let data = util::file::read_opt(&path)?;
        let mut dirstate = Dirstate {
            path,
            parents: (NULL_ID, NULL_ID),
            entries: BTreeMap::new(),
            dirty: false,
        };
        let data = match data {
            None => return Ok(dirstate),
            Some(data) => data,
        };
        if data.len() < HEADER_LEN {
            return Err(DirstateError::Corrupt(format!(
                "header is {} bytes, want {}",
                data.len(),
                HEADER_LEN
            )));
        }
        dirstate.parents = (
            Node::from_slice(&data[0..20]).expect("20 bytes"),
            Node::from_slice(&data[20..40]).expect("20 bytes"),
        );
        let mut pos = HEADER_LEN;
        while pos < data.len() {
            let (path, entry, next) = parse_record(&data, pos)?;
            dirstate.entries.insert(path, entry);
            pos = next;
        }
        Ok(dirstate)
    }

    pub fn parents(&self) -> (Node, Node) {
        self.parents
    }

    pub fn set_parents(&mut self, p1: Node, p2: Node) {
        self.parents = (p1, p2);
        self.dirty = true;
    }

    pub fn in_merge(&self) -> bool {
        !self.parents.1.is_null()
    }

    pub fn get(&self, path: &RepoPath) -> Option<&DirstateEntry> {
        self.entries.get(path)
    }

    pub fn is_tracked(&self, path: &RepoPath) -> bool {
        matches!(
            self.entries.get(path).map(|e| e.state),
            Some(EntryState::Normal) | Some(EntryState::Added) | Some(EntryState::Merged)
        )
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RepoPath, &DirstateEntry)> {
        self.entries
            .iter()
            .map(|(path, entry)| (path.as_repo_path(), entry))
    }

    /// Paths in a tracked state (not scheduled for removal).
    pub fn tracked_paths(&self) -> impl Iterator<Item = &RepoPath> {
        self.iter()
            .filter(|(_, entry)| entry.state != EntryState::Removed)
            .map(|(path, _)| path)
    }

    /// Start tracking `path`.
    pub fn add(&mut self, path: RepoPathBuf) -> Result<(), DirstateError> {
        match self.entries.get(&path).map(|e| e.state) {
            Some(EntryState::Normal) | Some(EntryState::Merged) => {
                return Err(DirstateError::BadOperation {
                    action: "add",
                    path,
                    reason: "already tracked".to_string(),
                });
            }
            Some(EntryState::Removed) => {
                // Re-adding a removed file makes it normal-but-dirty.
                let entry = self.entries.get_mut(&path).unwrap();
                entry.state = EntryState::Normal;
                entry.size = SIZE_DIRTY;
                entry.mtime = MTIME_UNSET;
            }
            Some(EntryState::Added) => {}
            None => {
                self.entries.insert(path, DirstateEntry::added());
            }
        }
        self.dirty = true;
        Ok(())
    }

    /// Schedule `path` for removal, keeping the record so commit knows.
    pub fn remove(&mut self, path: RepoPathBuf) -> Result<(), DirstateError> {
        match self.entries.get_mut(&path) {
            None => {
                return Err(DirstateError::BadOperation {
                    action: "remove",
                    path,
                    reason: "not tracked".to_string(),
                });
            }
            Some(entry) if entry.state == EntryState::Added => {
                // Never committed: removing it is forgetting it.
                self.entries.remove(&path);
            }
            Some(entry) => {
                entry.state = EntryState::Removed;
                entry.mode = 0;
                entry.size = 0;
                entry.mtime = MTIME_UNSET;
                entry.copy_source = None;
            }
        }
        self.dirty = true;
        Ok(())
    }

    /// Stop tracking `path` without scheduling deletion.
    pub fn forget(&mut self, path: &RepoPath) -> Result<(), DirstateError> {
        if self.entries.remove(path).is_none() {
            return Err(DirstateError::BadOperation {
                action: "forget",
                path: path.to_owned(),
                reason: "not tracked".to_string(),
            });
        }
        self.dirty = true;
        Ok(())
    }

    /// Record `dest` as a copy of `source`. `dest` must be tracked
    /// (usually just added).
    pub fn copy(&mut self, source: RepoPathBuf, dest: &RepoPath) -> Result<(), DirstateError> {
        match self.entries.get_mut(dest) {
            Some(entry)
                if matches!(entry.state, EntryState::Added | EntryState::Merged | EntryState::Normal) =>
            {
                entry.copy_source = Some(source);
            }
            _ => {
                return Err(DirstateError::BadOperation {
                    action: "copy",
                    path: dest.to_owned(),
                    reason: "destination not tracked".to_string(),
                });
            }
        }
        self.dirty = true;
        Ok(())
    }

    /// Record a rename: `dest` becomes a copy of `source` and `source`
    /// is scheduled for removal. `dest` must already be tracked.
    pub fn rename(&mut self, source: RepoPathBuf, dest: &RepoPath) -> Result<(), DirstateError> {
        self.copy(source.clone(), dest)?;
        self.remove(source)
    }

    /// Copy metadata of `path`, if any.
    pub fn copied(&self, path: &RepoPath) -> Option<&RepoPath> {
        self.entries
            .get(path)?
            .copy_source
            .as_ref()
            .map(|p| p.as_repo_path())
    }

    /// Mark `path` as touched by the in-progress merge.
    pub fn merge_mark(&mut self, path: RepoPathBuf) -> Result<(), DirstateError> {
        let entry = self
            .entries
            .entry(path)
            .or_insert_with(DirstateEntry::added);
        entry.state = EntryState::Merged;
        entry.size = SIZE_DIRTY;
        entry.mtime = MTIME_UNSET;
        self.dirty = true;
        Ok(())
    }

    /// Record `path` as clean with the given stat data.
    pub fn normal(&mut self, path: RepoPathBuf, mode: u32, size: i32, mtime: i32) {
        self.entries.insert(
            path,
            DirstateEntry {
                state: EntryState::Normal,
                mode,
                size,
                mtime,
                copy_source: None,
            },
        );
        self.dirty = true;
    }

    /// Drop every entry (used when rebuilding from a manifest).
    pub fn clear(&mut self) {
        self.entries.clear();
        self.dirty = true;
    }

    /// Persist atomically (write-to-temp-and-rename).
    pub fn write(&mut self) -> Result<(), DirstateError> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.entries.len() * 64);
        out.extend_from_slice(self.parents.0.as_bytes());
        out.extend_from_slice(self.parents.1.as_bytes());
        for (path, entry) in &self.entries {
            serialize_record(&mut out, path, entry);
        }
        util::atomicfile::atomic_write(&self.path, |f| f.write_all(&out))?;
        self.dirty = false;
        tracing::debug!(entries = self.entries.len(), "dirstate written");
        Ok(())
    }
}

fn serialize_record(out: &mut Vec<u8>, path: &RepoPathBuf, entry: &DirstateEntry) {
    let state = entry.state.to_byte()
        | if entry.copy_source.is_some() { COPY_BIT } else { 0 };
    out.push(state);
    let mut fixed = [0u8; 12];
    BigEndian::write_u32(&mut fixed[0..4], entry.mode);
    BigEndian::write_i32(&mut fixed[4..8], entry.size);
    BigEndian::write_i32(&mut fixed[8..12], entry.mtime);
    out.extend_from_slice(&fixed);
    let path_bytes = path.as_bytes();
    let mut len = [0u8; 4];
    BigEndian::write_u32(&mut len, path_bytes.len() as u32);
    out.extend_from_slice(&len);
    out.extend_from_slice(path_bytes);
    if let Some(copy) = &entry.copy_source {
        BigEndian::write_u32(&mut len, copy.as_bytes().len() as u32);
        out.extend_from_slice(&len);
        out.extend_from_slice(copy.as_bytes());
    }
}

fn parse_record(
    data: &[u8],
    mut pos: usize,
) -> Result<(RepoPathBuf, DirstateEntry, usize), DirstateError> {
    let take = |pos: &mut usize, n: usize| -> Result<&[u8], DirstateError> {
        if *pos + n > data.len() {
            return Err(DirstateError::Corrupt(format!(
                "truncated record at byte {}",
                *pos
            )));
        }
        let slice = &data[*pos..*pos + n];
        *pos += n;
        Ok(slice)
    };
    let state_byte = take(&mut pos, 1)?[0];
    let has_copy = state_byte & COPY_BIT != 0;
    let state = EntryState::from_byte(state_byte & !COPY_BIT)?;
    let fixed = take(&mut pos, 12)?;
    let mode = BigEndian::read_u32(&fixed[0..4]);
    let size = BigEndian::read_i32(&fixed[4..8]);
    let mtime = BigEndian::read_i32(&fixed[8..12]);
    let path_len = BigEndian::read_u32(take(&mut pos, 4)?) as usize;
    let path = RepoPathBuf::from_utf8(take(&mut pos, path_len)?.to_vec())
        .map_err(|e| DirstateError::Corrupt(e.to_string()))?;
    let copy_source = if has_copy {
        let copy_len = BigEndian::read_u32(take(&mut pos, 4)?) as usize;
        Some(
            RepoPathBuf::from_utf8(take(&mut pos, copy_len)?.to_vec())
                .map_err(|e| DirstateError::Corrupt(e.to_string()))?,
        )
    } else {
        None
    };
    Ok((
        path,
        DirstateEntry {
            state,
            mode,
            size,
            mtime,
            copy_source,
        },
        pos,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> RepoPathBuf {
        RepoPathBuf::from_string(s.to_string()).unwrap()
    }

    struct TestDirstate {
        dir: tempfile::TempDir,
        dirstate: Dirstate,
    }

    impl TestDirstate {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let dirstate = Dirstate::open(dir.path().join("dirstate")).unwrap();
            TestDirstate { dir, dirstate }
        }

        fn reopen(&mut self) {
            self.dirstate = Dirstate::open(self.dir.path().join("dirstate")).unwrap();
        }
    }

    #[test]
    fn test_fresh_dirstate_has_null_parents() {
        let t = TestDirstate::new();
        assert_eq!(t.dirstate.parents(), (NULL_ID, NULL_ID));
        assert!(!t.dirstate.in_merge());
        assert!(t.dirstate.is_empty());
    }

    #[test]
    fn test_roundtrip_with_copies_and_states() {
        let mut t = TestDirstate::new();
        let p1 = Node::from_content(b"p1", &NULL_ID, &NULL_ID);
        t.dirstate.set_parents(p1, NULL_ID);
        t.dirstate.add(p("added")).unwrap();
        t.dirstate.normal(p("clean"), 0o100644, 10, 123456);
        t.dirstate.normal(p("gone"), 0o100644, 4, 123);
        t.dirstate.remove(p("gone")).unwrap();
        t.dirstate.add(p("dest")).unwrap();
        t.dirstate.copy(p("clean"), &p("dest")).unwrap();
        t.dirstate.merge_mark(p("conflicted")).unwrap();
        t.dirstate.write().unwrap();

        t.reopen();
        assert_eq!(t.dirstate.parents(), (p1, NULL_ID));
        assert_eq!(t.dirstate.get(&p("added")).unwrap().state, EntryState::Added);
        assert_eq!(
            t.dirstate.get(&p("clean")).unwrap(),
            &DirstateEntry {
                state: EntryState::Normal,
                mode: 0o100644,
                size: 10,
                mtime: 123456,
                copy_source: None,
            }
        );
        assert_eq!(t.dirstate.get(&p("gone")).unwrap().state, EntryState::Removed);
        assert_eq!(t.dirstate.copied(&p("dest")), Some(p("clean").as_repo_path()));
        assert_eq!(
            t.dirstate.get(&p("conflicted")).unwrap().state,
            EntryState::Merged
        );
        assert!(!t.dirstate.is_dirty());
    }

    #[test]
    fn test_add_remove_forget_rules() {
        let mut t = TestDirstate::new();
        t.dirstate.normal(p("file"), 0, 0, 0);
        assert!(t.dirstate.add(p("file")).is_err());
        // Removing an added-but-never-committed file forgets it.
        t.dirstate.add(p("fresh")).unwrap();
        t.dirstate.remove(p("fresh")).unwrap();
        assert!(t.dirstate.get(&p("fresh")).is_none());
        // Remove-then-add round trip keeps the entry tracked.
        t.dirstate.remove(p("file")).unwrap();
        t.dirstate.add(p("file")).unwrap();
        assert_eq!(t.dirstate.get(&p("file")).unwrap().state, EntryState::Normal);
        // Forget requires tracking.
        assert!(t.dirstate.forget(&p("nope")).is_err());
        t.dirstate.forget(&p("file")).unwrap();
        assert!(t.dirstate.get(&p("file")).is_none());
        // Errors on untracked operations.
        assert!(t.dirstate.remove(p("ghost")).is_err());
        assert!(t.dirstate.copy(p("a"), &p("ghost")).is_err());
    }

    #[test]
    fn test_rename_is_copy_plus_remove() {
        let mut t = TestDirstate::new();
        t.dirstate.normal(p("old"), 0o100644, 3, 100);
        t.dirstate.add(p("new")).unwrap();
        t.dirstate.rename(p("old"), &p("new")).unwrap();
        assert_eq!(t.dirstate.copied(&p("new")), Some(p("old").as_repo_path()));
        assert_eq!(t.dirstate.get(&p("old")).unwrap().state, EntryState::Removed);
    }

    #[test]
    fn test_maybe_clean() {
        let entry = DirstateEntry {
            state: EntryState::Normal,
            mode: 0o100644,
            size: 100,
            mtime: 5000,
            copy_source: None,
        };
        assert!(entry.maybe_clean(0o100644, 100, 5000));
        // Irrelevant mode bits are ignored; exec bit is not.
        assert!(entry.maybe_clean(0o100664, 100, 5000));
        assert!(!entry.maybe_clean(0o100755, 100, 5000));
        assert!(!entry.maybe_clean(0o100644, 101, 5000));
        assert!(!entry.maybe_clean(0o100644, 100, 5001));
        // Sentinels force a content check.
        let dirty = DirstateEntry {
            size: SIZE_DIRTY,
            ..entry.clone()
        };
        assert!(!dirty.maybe_clean(0o100644, 100, 5000));
        let unset = DirstateEntry {
            mtime: MTIME_UNSET,
            ..entry
        };
        assert!(!unset.maybe_clean(0o100644, 100, 5000));
    }

    #[test]
    fn test_corrupt_file_rejected() {
        let t = TestDirstate::new();
        let path = t.dir.path().join("dirstate");
        std::fs::write(&path, b"short").unwrap();
        assert!(Dirstate::open(&path).is_err());
        let mut data = vec![0u8; HEADER_LEN];
        data.push(b'z'); // unknown state
        data.extend_from_slice(&[0u8; 20]);
        std::fs::write(&path, &data).unwrap();
        assert!(Dirstate::open(&path).is_err());
    }

    #[test]
    fn test_record_roundtrip_quickcheck() {
        use quickcheck::quickcheck;

        fn roundtrip(
            state: u8,
            mode: u32,
            size: i32,
            mtime: i32,
            name: u8,
            copy: bool,
        ) -> bool {
            let state = match state % 4 {
                0 => EntryState::Normal,
                1 => EntryState::Added,
                2 => EntryState::Removed,
                _ => EntryState::Merged,
            };
            let entry = DirstateEntry {
                state,
                mode,
                size,
                mtime,
                copy_source: copy.then(|| p("copy/source")),
            };
            let path = p(&format!("dir/file{}", name));
            let mut out = Vec::new();
            serialize_record(&mut out, &path, &entry);
            let (parsed_path, parsed_entry, consumed) = parse_record(&out, 0).unwrap();
            parsed_path == path && parsed_entry == entry && consumed == out.len()
        }
        quickcheck(roundtrip as fn(u8, u32, i32, i32, u8, bool) -> bool);
    }

    #[test]
    fn test_tracked_paths_excludes_removed() {
        let mut t = TestDirstate::new();
        t.dirstate.normal(p("keep"), 0, 0, 0);
        t.dirstate.normal(p("drop"), 0, 0, 0);
        t.dirstate.remove(p("drop")).unwrap();
        let tracked: Vec<String> = t
            .dirstate
            .tracked_paths()
            .map(|path| path.to_string())
            .collect();
        assert_eq!(tracked, vec!["keep".to_string()]);
        assert!(t.dirstate.is_tracked(&p("keep")));
        assert!(!t.dirstate.is_tracked(&p("drop")));
    }
}
