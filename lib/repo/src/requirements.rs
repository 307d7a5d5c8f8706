/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! The `requires` file: feature names a reader must understand before
//! touching the store. Unknown names are a hard error, which is how
//! future formats lock old code out.

use std::collections::BTreeSet;
use std::path::Path;

use crate::errors::RepoError;

/// Features this implementation writes and understands.
pub const SUPPORTED: &[&str] = &["revlogv1", "store", "fncache", "generaldelta", "dotencode"];

#[derive(Debug, Clone, Default)]
pub struct Requirements {
    names: BTreeSet<String>,
}

impl Requirements {
    pub fn for_new_repo() -> Self {
        Requirements {
            names: SUPPORTED.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, RepoError> {
        let data = util::file::read_opt(path)?.unwrap_or_default();
        let names: BTreeSet<String> = String::from_utf8_lossy(&data)
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| line.to_string())
            .collect();
        for name in &names {
            if !SUPPORTED.contains(&name.as_str()) {
                return Err(RepoError::UnsupportedRequirement(name.clone()));
            }
        }
        Ok(Requirements { names })
    }

    pub fn save(&self, path: &Path) -> Result<(), RepoError> {
        let mut out = String::new();
        for name in &self.names {
            out.push_str(name);
            out.push('\n');
        }
        util::atomicfile::atomic_write_bytes(path, out.as_bytes())?;
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_and_unknown_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requires");
        Requirements::for_new_repo().save(&path).unwrap();
        let loaded = Requirements::load(&path).unwrap();
        assert!(loaded.contains("revlogv1"));
        assert!(loaded.contains("generaldelta"));

        std::fs::write(&path, "revlogv1\nquantum-store\n").unwrap();
        assert!(matches!(
            Requirements::load(&path),
            Err(RepoError::UnsupportedRequirement(name)) if name == "quantum-store"
        ));
    }
}
