/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Journalled store transactions.
//!
//! Store files are strictly append-only, so undoing a transaction is
//! truncation: before the first write to each file, the pre-write
//! length is recorded in a journal on disk. Abort (or crash recovery on
//! the next open) truncates every journalled file back. Commit renames
//! the journal to `undo`, which enables one-step rollback of the last
//! transaction. Files that are rewritten rather than appended register
//! full backups instead.
//!
//! The journal entry for a file is written and flushed *before* the
//! file itself is touched, so a crash can never leave an appended byte
//! that the journal does not cover.

use std::collections::HashSet;
use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("transaction already in progress (journal {0:?} exists)")]
    JournalExists(PathBuf),

    #[error("journal is corrupt: {0}")]
    CorruptJournal(String),

    #[error("transaction is no longer active")]
    NotActive,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One recorded undo action.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    /// Truncate `path` back to `len`.
    Truncate { path: PathBuf, len: u64 },
    /// Restore `path` from the copy at `backup` (remove `path` if the
    /// backup records it as absent).
    Restore { path: PathBuf, backup: PathBuf },
}

/// An open store transaction.
///
/// Dropping an uncommitted transaction aborts it.
pub struct Transaction {
    journal_path: PathBuf,
    journal: File,
    entries: Vec<Entry>,
    /// Files already journalled this transaction.
    seen: HashSet<PathBuf>,
    backup_seq: u32,
    state: State,
}

#[derive(Debug, PartialEq, Eq)]
enum State {
    Active,
    Committed,
    Aborted,
}

impl Transaction {
    /// Open a transaction journalling into `journal_path`.
    ///
    /// Fails if a journal already exists: that means a concurrent or
    /// crashed transaction, and the caller must run [`recover`] first
    /// (under the store lock).
    pub fn open(journal_path: PathBuf) -> Result<Self, TransactionError> {
        if journal_path.exists() {
            return Err(TransactionError::JournalExists(journal_path));
        }
        let journal = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&journal_path)?;
        tracing::debug!(journal = %journal_path.display(), "transaction opened");
        Ok(Transaction {
            journal_path,
            journal,
            entries: Vec::new(),
            seen: HashSet::new(),
            backup_seq: 0,
            state: State::Active,
        })
    }

    pub fn active(&self) -> bool {
        self.state == State::Active
    }

    /// Record `path` as append-only: its current length is the undo
    /// point. Must be called before writing. Idempotent per file.
    pub fn add(&mut self, path: &Path) -> Result<(), TransactionError> {
        self.check_active()?;
        if self.seen.contains(path) {
            return Ok(());
        }
        let len = util::file::file_len(path)?;
        let entry = Entry::Truncate {
            path: path.to_path_buf(),
            len,
        };
        self.write_entry(&entry)?;
        self.seen.insert(path.to_path_buf());
        self.entries.push(entry);
        Ok(())
    }

    /// Record a full backup of `path`, for files that are rewritten in
    /// place rather than appended (fncache, phase roots, bookmarks).
    pub fn add_backup(&mut self, path: &Path) -> Result<(), TransactionError> {
        self.check_active()?;
        if self.seen.contains(path) {
            return Ok(());
        }
        self.backup_seq += 1;
        let backup = self
            .journal_path
            .with_extension(format!("backup.{}", self.backup_seq));
        match fs::copy(path, &backup) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                // Mark "did not exist" with an absent backup file.
                util::file::unlink_opt(&backup)?;
            }
            Err(err) => return Err(err.into()),
        }
        let entry = Entry::Restore {
            path: path.to_path_buf(),
            backup,
        };
        self.write_entry(&entry)?;
        self.seen.insert(path.to_path_buf());
        self.entries.push(entry);
        Ok(())
    }

    fn write_entry(&mut self, entry: &Entry) -> Result<(), TransactionError> {
        let line = serialize_entry(entry);
        self.journal.write_all(&line)?;
        self.journal.sync_data()?;
        Ok(())
    }

    fn check_active(&self) -> Result<(), TransactionError> {
        if self.state != State::Active {
            return Err(TransactionError::NotActive);
        }
        Ok(())
    }

    /// Commit: keep all writes and rename the journal to `undo_path`,
    /// making the transaction the rollback target.
    pub fn commit(mut self, undo_path: &Path) -> Result<(), TransactionError> {
        self.check_active()?;
        self.journal.sync_all()?;
        fs::rename(&self.journal_path, undo_path)?;
        // Backups stay behind for undo; they are garbage-collected when
        // the next transaction commits over the same undo path.
        self.state = State::Committed;
        tracing::debug!(undo = %undo_path.display(), files = self.entries.len(), "transaction committed");
        Ok(())
    }

    /// Abort: undo every recorded write and delete the journal.
    pub fn abort(mut self) -> Result<(), TransactionError> {
        self.abort_in_place()
    }

    fn abort_in_place(&mut self) -> Result<(), TransactionError> {
        self.check_active()?;
        self.state = State::Aborted;
        tracing::warn!(files = self.entries.len(), "transaction aborted, rolling back");
        // Undo in reverse order of recording.
        for entry in self.entries.iter().rev() {
            apply_entry(entry)?;
        }
        self.cleanup_backups();
        util::file::unlink_opt(&self.journal_path)?;
        Ok(())
    }

    fn cleanup_backups(&self) {
        for entry in &self.entries {
            if let Entry::Restore { backup, .. } = entry {
                let _ = util::file::unlink_opt(backup);
            }
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == State::Active {
            let _ = self.abort_in_place();
        }
    }
}

/// Replay a journal (or undo file) found on disk: crash recovery and
/// one-step rollback share this.
///
/// Missing journal is a no-op returning `false`.
pub fn recover(journal_path: &Path) -> Result<bool, TransactionError> {
    let data = match util::file::read_opt(journal_path)? {
        Some(data) => data,
        None => return Ok(false),
    };
    let entries = parse_journal(&data)?;
    tracing::info!(journal = %journal_path.display(), files = entries.len(), "recovering interrupted transaction");
    for entry in entries.iter().rev() {
        apply_entry(entry)?;
    }
    for entry in &entries {
        if let Entry::Restore { backup, .. } = entry {
            let _ = util::file::unlink_opt(backup);
        }
    }
    util::file::unlink_opt(journal_path)?;
    Ok(true)
}

fn apply_entry(entry: &Entry) -> Result<(), TransactionError> {
    match entry {
        Entry::Truncate { path, len } => {
            let current = util::file::file_len(path)?;
            if current > *len {
                util::file::truncate(path, *len)?;
            }
            if *len == 0 {
                // A file created by the transaction vanishes entirely.
                let _ = util::file::unlink_opt(path);
            }
        }
        Entry::Restore { path, backup } => {
            if backup.exists() {
                fs::copy(backup, path)?;
            } else {
                util::file::unlink_opt(path)?;
            }
        }
    }
    Ok(())
}

fn serialize_entry(entry: &Entry) -> Vec<u8> {
    let mut line = Vec::new();
    match entry {
        Entry::Truncate { path, len } => {
            line.push(b't');
            line.push(0);
            line.extend_from_slice(path.to_string_lossy().as_bytes());
            line.push(0);
            line.extend_from_slice(len.to_string().as_bytes());
        }
        Entry::Restore { path, backup } => {
            line.push(b'b');
            line.push(0);
            line.extend_from_slice(path.to_string_lossy().as_bytes());
            line.push(0);
            line.extend_from_slice(backup.to_string_lossy().as_bytes());
        }
    }
    line.push(b'\n');
    line
}

fn parse_journal(data: &[u8]) -> Result<Vec<Entry>, TransactionError> {
    let mut entries = Vec::new();
    for line in data.split(|&b| b == b'\n') {
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split(|&b| b == 0);
        let kind = fields.next();
        let path = fields.next();
        let arg = fields.next();
        let (kind, path, arg) = match (kind, path, arg) {
            (Some(k), Some(p), Some(a)) if k.len() == 1 => (k[0], p, a),
            _ => {
                return Err(TransactionError::CorruptJournal(
                    String::from_utf8_lossy(line).into_owned(),
                ));
            }
        };
        let path = PathBuf::from(String::from_utf8_lossy(path).into_owned());
        match kind {
            b't' => {
                let len = String::from_utf8_lossy(arg)
                    .parse::<u64>()
                    .map_err(|e| TransactionError::CorruptJournal(e.to_string()))?;
                entries.push(Entry::Truncate { path, len });
            }
            b'b' => {
                let backup = PathBuf::from(String::from_utf8_lossy(arg).into_owned());
                entries.push(Entry::Restore { path, backup });
            }
            other => {
                return Err(TransactionError::CorruptJournal(format!(
                    "unknown entry kind {:?}",
                    other as char
                )));
            }
        }
    }
    Ok(entries)
}
