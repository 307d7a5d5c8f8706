/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;

use serde::Deserialize;
use serde::Serialize;

use crate::errors::TypeError;

/// An owned repo-relative path.
///
/// Repo paths are `/`-separated, never empty, never absolute, and have
/// no empty, `.` or `..` components. They are compared bytewise; no
/// unicode normalization is applied.
#[derive(
    Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default
)]
pub struct RepoPathBuf(String);

/// A borrowed repo-relative path. See [`RepoPathBuf`].
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct RepoPath(str);

impl RepoPath {
    pub fn from_str(s: &str) -> Result<&RepoPath, TypeError> {
        validate_path(s)?;
        Ok(RepoPath::from_str_unchecked(s))
    }

    pub fn from_utf8(bytes: &[u8]) -> Result<&RepoPath, TypeError> {
        let s = std::str::from_utf8(bytes)
            .map_err(|_| TypeError::InvalidPath("not valid utf-8".to_string()))?;
        RepoPath::from_str(s)
    }

    fn from_str_unchecked(s: &str) -> &RepoPath {
        // Safety: RepoPath is a repr(transparent) wrapper around str.
        unsafe { &*(s as *const str as *const RepoPath) }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn to_owned(&self) -> RepoPathBuf {
        RepoPathBuf(self.0.to_string())
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// The parent directory, or `None` for a top-level path.
    pub fn parent(&self) -> Option<&RepoPath> {
        self.0
            .rsplit_once('/')
            .map(|(dir, _)| RepoPath::from_str_unchecked(dir))
    }

    /// The last component.
    pub fn base_name(&self) -> &str {
        self.0.rsplit_once('/').map_or(&self.0, |(_, name)| name)
    }

    /// True if `self` is inside directory `dir`.
    pub fn starts_with_dir(&self, dir: &RepoPath) -> bool {
        self.0.len() > dir.0.len() + 1
            && self.0.starts_with(&dir.0)
            && self.0.as_bytes()[dir.0.len()] == b'/'
    }
}

impl RepoPathBuf {
    pub fn from_string(s: String) -> Result<Self, TypeError> {
        validate_path(&s)?;
        Ok(RepoPathBuf(s))
    }

    pub fn from_utf8(bytes: Vec<u8>) -> Result<Self, TypeError> {
        let s = String::from_utf8(bytes)
            .map_err(|_| TypeError::InvalidPath("not valid utf-8".to_string()))?;
        RepoPathBuf::from_string(s)
    }

    pub fn as_repo_path(&self) -> &RepoPath {
        RepoPath::from_str_unchecked(&self.0)
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

fn validate_path(s: &str) -> Result<(), TypeError> {
    if s.is_empty() {
        return Err(TypeError::InvalidPath("empty path".to_string()));
    }
    if s.contains('\0') || s.contains('\n') {
        return Err(TypeError::InvalidPath(format!(
            "{:?}: NUL and newline are reserved",
            s
        )));
    }
    for component in s.split('/') {
        match component {
            "" => {
                return Err(TypeError::InvalidPath(format!(
                    "{:?}: empty component",
                    s
                )));
            }
            "." | ".." => {
                return Err(TypeError::InvalidPath(format!(
                    "{:?}: {:?} component",
                    s, component
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

impl Deref for RepoPathBuf {
    type Target = RepoPath;

    fn deref(&self) -> &Self::Target {
        self.as_repo_path()
    }
}

impl Borrow<RepoPath> for RepoPathBuf {
    fn borrow(&self) -> &RepoPath {
        self.as_repo_path()
    }
}

impl AsRef<RepoPath> for RepoPathBuf {
    fn as_ref(&self) -> &RepoPath {
        self.as_repo_path()
    }
}

impl ToOwned for RepoPath {
    type Owned = RepoPathBuf;

    fn to_owned(&self) -> Self::Owned {
        RepoPath::to_owned(self)
    }
}

impl fmt::Display for RepoPath {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", &self.0)
    }
}

impl fmt::Display for RepoPathBuf {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", self.as_repo_path())
    }
}

impl fmt::Debug for RepoPath {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "RepoPath({:?})", &self.0)
    }
}

impl fmt::Debug for RepoPathBuf {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "RepoPathBuf({:?})", &self.0)
    }
}
