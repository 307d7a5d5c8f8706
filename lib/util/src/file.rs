/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

use std::fs;
use std::io;
use std::path::Path;

/// The length of a file, or 0 if it does not exist.
pub fn file_len(path: &Path) -> io::Result<u64> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(err),
    }
}

/// Read a file, returning `None` if it does not exist.
pub fn read_opt(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// Truncate a file to `len` bytes. Creating the file is not an error:
/// truncating a missing file to 0 is a no-op.
pub fn truncate(path: &Path, len: u64) -> io::Result<()> {
    match fs::OpenOptions::new().write(true).open(path) {
        Ok(file) => file.set_len(len),
        Err(err) if err.kind() == io::ErrorKind::NotFound && len == 0 => Ok(()),
        Err(err) => Err(err),
    }
}

/// Remove a file, ignoring "not found".
pub fn unlink_opt(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_len_missing_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(file_len(&dir.path().join("missing")).unwrap(), 0);
    }

    #[test]
    fn test_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"0123456789").unwrap();
        truncate(&path, 4).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"0123");
        truncate(&dir.path().join("missing"), 0).unwrap();
        assert!(truncate(&dir.path().join("missing"), 4).is_err());
    }
}
