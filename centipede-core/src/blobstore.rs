// SPDX-License-Identifier: Apache-2.0

//! File transport collaborator (§1, §4.10 "Design Notes"). The concrete
//! remote/local transport is out of scope for deep design; this module
//! defines the trait boundary the engine actually calls through and a
//! local-filesystem implementation so the engine runs end to end.

use std::path::{Path, PathBuf};

use crate::error::Result;

/// Minimal capability set the engine needs from a shard-file transport:
/// list, read, append, and create (§4.10 "Save/Export utilities").
pub trait BlobStore {
    fn read_dir(&self, dir: &Path) -> Result<Vec<PathBuf>>;
    fn read(&self, path: &Path) -> Result<Vec<u8>>;
    fn append(&self, path: &Path, bytes: &[u8]) -> Result<()>;
    fn create(&self, path: &Path) -> Result<()>;
}

/// `std::fs`-backed implementation; everything the shipped engine actually
/// uses.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalBlobStore;

impl BlobStore for LocalBlobStore {
    fn read_dir(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            out.push(entry?.path());
        }
        out.sort();
        Ok(out)
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn append(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        use std::io::Write;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        file.write_all(bytes)?;
        Ok(())
    }

    fn create(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::File::create(path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn read_of_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = LocalBlobStore;
        assert_eq!(store.read(&dir.path().join("missing")).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn append_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shard.000000");
        let store = LocalBlobStore;
        store.append(&path, b"hello ").unwrap();
        store.append(&path, b"world").unwrap();
        assert_eq!(store.read(&path).unwrap(), b"hello world".to_vec());
    }

    #[test]
    fn read_dir_lists_entries_sorted() {
        let dir = tempdir().unwrap();
        let store = LocalBlobStore;
        store.create(&dir.path().join("b")).unwrap();
        store.create(&dir.path().join("a")).unwrap();
        let entries = store.read_dir(dir.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].ends_with("a"));
        assert!(entries[1].ends_with("b"));
    }
}
