/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Working-copy path audit.
//!
//! Every path that is about to be written in the working copy goes
//! through [`PathAuditor::audit`] first. Rejected: `.hg` as any
//! component, escaping the root via `..`, traversing a symlink at a
//! non-terminal component, and (policy-dependent) Windows-reserved
//! names. Case-fold collisions are detected by [`CaseCollisions`] when
//! the filesystem folds case.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use thiserror::Error;
use types::RepoPath;
use types::RepoPathBuf;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("path contains illegal component: {0}")]
    IllegalComponent(String),

    #[error("path escapes repository root: {0}")]
    EscapesRoot(String),

    #[error("path {path:?} traverses symlink {symlink:?}")]
    ThroughSymlink { path: String, symlink: String },

    #[error("path {0:?} collides with tracked path {1:?} on a case-insensitive filesystem")]
    CaseCollision(String, String),

    #[error("filename contains Windows-reserved name: {0}")]
    ReservedName(String),

    #[error("invalid path: {0}")]
    Malformed(String),
}

/// What to do about `con`, `aux` and friends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReservedPolicy {
    /// Log a warning and continue. The default, for repositories that
    /// are never checked out on Windows.
    #[default]
    Warn,
    Abort,
}

pub struct PathAuditor {
    reserved_policy: ReservedPolicy,
    /// Directories already proven symlink-free. Never invalidated
    /// within one operation; a new auditor is made per command.
    audited_dirs: Mutex<HashSet<PathBuf>>,
}

impl PathAuditor {
    pub fn new() -> Self {
        PathAuditor::with_policy(ReservedPolicy::default())
    }

    pub fn with_policy(reserved_policy: ReservedPolicy) -> Self {
        PathAuditor {
            reserved_policy,
            audited_dirs: Mutex::new(HashSet::new()),
        }
    }

    /// Validate a user-supplied relative path string into a `RepoPath`,
    /// rejecting absolute paths and `..` escapes before structural
    /// validation.
    pub fn check_relative<'a>(&self, s: &'a str) -> Result<&'a RepoPath, AuditError> {
        if s.starts_with('/') || s.starts_with('\\') || looks_like_drive(s) {
            return Err(AuditError::EscapesRoot(s.to_string()));
        }
        if s.split(['/', '\\']).any(|c| c == "..") {
            return Err(AuditError::EscapesRoot(s.to_string()));
        }
        RepoPath::from_str(s).map_err(|e| AuditError::Malformed(e.to_string()))
    }

    /// Audit a structurally valid repo path against the tree at `root`.
    pub fn audit(&self, root: &Path, path: &RepoPath) -> Result<(), AuditError> {
        for component in path.components() {
            if component.eq_ignore_ascii_case(".hg") {
                return Err(AuditError::IllegalComponent(path.to_string()));
            }
            if let Some(reserved) = reserved_component(component) {
                match self.reserved_policy {
                    ReservedPolicy::Warn => {
                        tracing::warn!(path = %path, component = reserved, "reserved Windows filename");
                    }
                    ReservedPolicy::Abort => {
                        return Err(AuditError::ReservedName(path.to_string()));
                    }
                }
            }
        }
        self.audit_symlinks(root, path)
    }

    /// Every non-terminal component must be a real directory (or not
    /// exist yet). Writing through a symlinked directory could escape
    /// the root.
    fn audit_symlinks(&self, root: &Path, path: &RepoPath) -> Result<(), AuditError> {
        let components: Vec<&str> = path.components().collect();
        let mut prefix = root.to_path_buf();
        for component in &components[..components.len() - 1] {
            prefix.push(component);
            if self.audited_dirs.lock().unwrap().contains(&prefix) {
                continue;
            }
            match fs::symlink_metadata(&prefix) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    return Err(AuditError::ThroughSymlink {
                        path: path.to_string(),
                        symlink: component.to_string(),
                    });
                }
                Ok(_) | Err(_) => {
                    // Missing prefixes are fine: they will be created
                    // as real directories by the write.
                    self.audited_dirs.lock().unwrap().insert(prefix.clone());
                }
            }
        }
        Ok(())
    }
}

impl Default for PathAuditor {
    fn default() -> Self {
        PathAuditor::new()
    }
}

fn looks_like_drive(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic()
}

/// The reserved basename, if the component carries one (`con`,
/// `con.txt`, `COM1` all count; the part before the first dot decides).
fn reserved_component(component: &str) -> Option<&'static str> {
    const RESERVED: &[&str] = &[
        "con", "prn", "aux", "nul", "com1", "com2", "com3", "com4", "com5", "com6", "com7",
        "com8", "com9", "lpt1", "lpt2", "lpt3", "lpt4", "lpt5", "lpt6", "lpt7", "lpt8", "lpt9",
    ];
    let base = component.split('.').next().unwrap_or(component);
    RESERVED
        .iter()
        .copied()
        .find(|r| base.eq_ignore_ascii_case(r))
}

/// Case-folded view of the tracked set, for collision detection on
/// case-insensitive filesystems.
#[derive(Debug, Default)]
pub struct CaseCollisions {
    folded: HashMap<String, RepoPathBuf>,
}

impl CaseCollisions {
    pub fn new<'a>(paths: impl Iterator<Item = &'a RepoPath>) -> Self {
        let mut detector = CaseCollisions::default();
        for path in paths {
            detector.insert(path);
        }
        detector
    }

    pub fn insert(&mut self, path: &RepoPath) {
        self.folded
            .insert(path.as_str().to_lowercase(), path.to_owned());
    }

    pub fn remove(&mut self, path: &RepoPath) {
        self.folded.remove(&path.as_str().to_lowercase());
    }

    /// Check a path about to be added. A hit on a *different* spelling
    /// of the same bytes is a collision; re-adding the identical path
    /// is not.
    pub fn check(&self, path: &RepoPath) -> Result<(), AuditError> {
        if let Some(existing) = self.folded.get(&path.as_str().to_lowercase()) {
            if existing.as_repo_path() != path {
                return Err(AuditError::CaseCollision(
                    path.to_string(),
                    existing.to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> &RepoPath {
        RepoPath::from_str(s).unwrap()
    }

    #[test]
    fn test_check_relative() {
        let auditor = PathAuditor::new();
        assert!(auditor.check_relative("a/b").is_ok());
        assert!(auditor.check_relative("../x").is_err());
        assert!(auditor.check_relative("a/../x").is_err());
        assert!(auditor.check_relative("/etc/passwd").is_err());
        assert!(auditor.check_relative("c:\\temp").is_err());
    }

    #[test]
    fn test_dot_hg_rejected_any_case() {
        let dir = tempfile::tempdir().unwrap();
        let auditor = PathAuditor::new();
        for path in [".hg/store/00changelog.i", "a/.hg/x", "a/.hG/x"] {
            assert!(matches!(
                auditor.audit(dir.path(), p(path)),
                Err(AuditError::IllegalComponent(_))
            ));
        }
        assert!(auditor.audit(dir.path(), p(".hgignore")).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("real")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("foo")).unwrap();
        let auditor = PathAuditor::new();
        assert!(matches!(
            auditor.audit(dir.path(), p("foo/bar")),
            Err(AuditError::ThroughSymlink { .. })
        ));
        // The terminal component may be a symlink.
        assert!(auditor.audit(dir.path(), p("foo")).is_ok());
        // Missing directories are fine.
        assert!(auditor.audit(dir.path(), p("new/dir/file")).is_ok());
    }

    #[test]
    fn test_reserved_names() {
        let dir = tempfile::tempdir().unwrap();
        let warn = PathAuditor::new();
        assert!(warn.audit(dir.path(), p("con.txt")).is_ok());
        let abort = PathAuditor::with_policy(ReservedPolicy::Abort);
        assert!(matches!(
            abort.audit(dir.path(), p("con.txt")),
            Err(AuditError::ReservedName(_))
        ));
        assert!(matches!(
            abort.audit(dir.path(), p("sub/COM1")),
            Err(AuditError::ReservedName(_))
        ));
        assert!(abort.audit(dir.path(), p("console")).is_ok());
    }

    #[test]
    fn test_case_collisions() {
        let mut detector = CaseCollisions::default();
        detector.insert(p("README"));
        assert!(detector.check(p("readme")).is_err());
        assert!(detector.check(p("README")).is_ok());
        assert!(detector.check(p("other")).is_ok());
        detector.remove(p("README"));
        assert!(detector.check(p("readme")).is_ok());
    }
}
