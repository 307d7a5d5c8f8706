/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

use serde::Deserialize;
use serde::Serialize;

/// File kind recorded in manifests and the working copy.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default
)]
pub enum FileType {
    #[default]
    Regular,
    Executable,
    Symlink,
}

impl FileType {
    /// The manifest flag suffix: `""`, `"x"` or `"l"`.
    pub fn manifest_flag(&self) -> &'static str {
        match self {
            FileType::Regular => "",
            FileType::Executable => "x",
            FileType::Symlink => "l",
        }
    }

    pub fn from_manifest_flag(flag: &str) -> Option<Self> {
        match flag {
            "" => Some(FileType::Regular),
            "x" => Some(FileType::Executable),
            "l" => Some(FileType::Symlink),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_roundtrip() {
        for file_type in [FileType::Regular, FileType::Executable, FileType::Symlink] {
            assert_eq!(
                FileType::from_manifest_flag(file_type.manifest_flag()),
                Some(file_type)
            );
        }
        assert_eq!(FileType::from_manifest_flag("q"), None);
    }
}
