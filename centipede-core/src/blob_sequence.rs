// SPDX-License-Identifier: Apache-2.0

//! Blob sequence over shared memory (§4.1): a named, fixed-size POSIX
//! shared-memory region carrying an ordered sequence of framed blobs
//! `{tag: u64, size: u64, bytes[size]}`. Used as the two directions of the
//! runner/engine protocol (`inputs`, `outputs`) for a single worker.

use std::ffi::CString;
use std::fs::File;
use std::os::fd::FromRawFd;

use memmap2::MmapMut;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;

use crate::error::{CentipedeError, Result};

/// A single framed element of a [`BlobSequence`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub tag: u64,
    pub bytes: Vec<u8>,
}

/// Size, in bytes, of the `{tag, size}` frame header preceding each blob's
/// payload.
const HEADER_LEN: usize = 16;

/// A `tag` of zero marks an invalid/sentinel blob; readers stop there.
const INVALID_TAG: u64 = 0;

fn shm_path(name: &str) -> String {
    if let Some(stripped) = name.strip_prefix('/') {
        stripped.to_string()
    } else {
        name.to_string()
    }
}

/// Single-producer/single-consumer framed byte sequence backed by a named
/// POSIX shared-memory region (§4.1, §5). One instance owns either the
/// writer or the reader role for its process, but both expose `write` and
/// `read` so a peer can be driven from either side across a `fork`/`exec`
/// boundary.
pub struct BlobSequence {
    name: String,
    mmap: Option<MmapMut>,
    size: usize,
    cursor: usize,
    owner: bool,
}

impl BlobSequence {
    /// Create and size a new shared-memory region, mmap it, and take
    /// ownership (the owner unlinks the region when dropped). `size` must be
    /// at least 8 bytes.
    pub fn new(name: impl Into<String>, size: usize) -> Result<Self> {
        let name = name.into();
        if size < 8 {
            return Err(CentipedeError::Precondition(
                "blob sequence size must be >= 8 bytes".into(),
            ));
        }
        let path = shm_path(&name);
        let cname = CString::new(format!("/{path}"))
            .map_err(|e| CentipedeError::Precondition(e.to_string()))?;
        let fd = shm_open(
            cname.as_c_str(),
            OFlag::O_CREAT | OFlag::O_RDWR | OFlag::O_TRUNC,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| CentipedeError::Io {
            source: std::io::Error::from(e),
        })?;
        ftruncate(fd, size as i64).map_err(|e| CentipedeError::Io {
            source: std::io::Error::from(e),
        })?;
        let file = unsafe { File::from_raw_fd(fd) };
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        mmap[..HEADER_LEN.min(size)].fill(0);

        Ok(Self {
            name,
            mmap: Some(mmap),
            size,
            cursor: 0,
            owner: true,
        })
    }

    /// Open an existing region by name; size is taken from the file itself.
    pub fn open(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let path = shm_path(&name);
        let cname = CString::new(format!("/{path}"))
            .map_err(|e| CentipedeError::Precondition(e.to_string()))?;
        let fd = shm_open(cname.as_c_str(), OFlag::O_RDWR, Mode::empty()).map_err(|e| {
            CentipedeError::Io {
                source: std::io::Error::from(e),
            }
        })?;
        let file = unsafe { File::from_raw_fd(fd) };
        let size = file.metadata()?.len() as usize;
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self {
            name,
            mmap: Some(mmap),
            size,
            cursor: 0,
            owner: false,
        })
    }

    fn region(&self) -> Result<&MmapMut> {
        self.mmap
            .as_ref()
            .ok_or_else(|| CentipedeError::Precondition("blob sequence already released".into()))
    }

    fn region_mut(&mut self) -> Result<&mut MmapMut> {
        self.mmap
            .as_mut()
            .ok_or_else(|| CentipedeError::Precondition("blob sequence already released".into()))
    }

    /// Write one blob. Returns `Ok(false)` if the remaining region cannot
    /// hold `tag + size + bytes` (a recoverable "shmem too small" signal,
    /// §4.1). On success the next 16 bytes are overwritten with an invalid
    /// sentinel so the tail stays self-terminating.
    pub fn write(&mut self, blob: &Blob) -> Result<bool> {
        if blob.tag == INVALID_TAG {
            return Err(CentipedeError::Precondition(
                "tag 0 is reserved as the invalid sentinel".into(),
            ));
        }
        let needed = HEADER_LEN + blob.bytes.len();
        let size = self.size;
        let cursor = self.cursor;
        let region = self.region_mut()?;
        if cursor + needed > size {
            return Ok(false);
        }
        region[cursor..cursor + 8].copy_from_slice(&blob.tag.to_le_bytes());
        region[cursor + 8..cursor + 16].copy_from_slice(&(blob.bytes.len() as u64).to_le_bytes());
        region[cursor + 16..cursor + needed].copy_from_slice(&blob.bytes);
        let sentinel_start = cursor + needed;
        let sentinel_end = (sentinel_start + HEADER_LEN).min(size);
        region[sentinel_start..sentinel_end].fill(0);
        self.cursor += needed;
        Ok(true)
    }

    /// Read the next blob, or `None` at end of stream or an invalid tag.
    pub fn read(&mut self) -> Result<Option<Blob>> {
        let size = self.size;
        let cursor = self.cursor;
        let region = self.region()?;
        if cursor + HEADER_LEN > size {
            return Ok(None);
        }
        let tag = u64::from_le_bytes(region[cursor..cursor + 8].try_into().unwrap());
        if tag == INVALID_TAG {
            return Ok(None);
        }
        let len = u64::from_le_bytes(region[cursor + 8..cursor + 16].try_into().unwrap()) as usize;
        if cursor + HEADER_LEN + len > size {
            return Ok(None);
        }
        let bytes = region[cursor + HEADER_LEN..cursor + HEADER_LEN + len].to_vec();
        self.cursor += HEADER_LEN + len;
        Ok(Some(Blob { tag, bytes }))
    }

    /// Rewind the cursor without zeroing memory.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Idempotently unmap the region. The owner additionally unlinks the
    /// named shared-memory object.
    pub fn release(&mut self) {
        if self.mmap.take().is_some() {
            if self.owner {
                let path = shm_path(&self.name);
                if let Ok(cname) = CString::new(format!("/{path}")) {
                    let _ = shm_unlink(cname.as_c_str());
                }
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for BlobSequence {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!(
            "centipede-test-{tag}-{}",
            std::process::id().wrapping_mul(2654435761) ^ (tag.len() as u32 * 7919)
        )
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut seq = BlobSequence::new(unique_name("roundtrip"), 4096).expect("create");
        let b1 = Blob {
            tag: 1,
            bytes: vec![1, 2, 3],
        };
        let b2 = Blob {
            tag: 2,
            bytes: vec![],
        };
        assert!(seq.write(&b1).unwrap());
        assert!(seq.write(&b2).unwrap());
        seq.reset();
        assert_eq!(seq.read().unwrap(), Some(b1));
        assert_eq!(seq.read().unwrap(), Some(b2));
        assert_eq!(seq.read().unwrap(), None);
    }

    #[test]
    fn write_overflow_returns_false() {
        let mut seq = BlobSequence::new(unique_name("overflow"), 32).expect("create");
        let big = Blob {
            tag: 1,
            bytes: vec![0u8; 64],
        };
        assert!(!seq.write(&big).unwrap());
    }

    #[test]
    fn zero_tag_is_rejected_on_write() {
        let mut seq = BlobSequence::new(unique_name("zerotag"), 256).expect("create");
        let err = seq
            .write(&Blob {
                tag: 0,
                bytes: vec![1],
            })
            .unwrap_err();
        assert!(matches!(err, CentipedeError::Precondition(_)));
    }

    #[test]
    fn release_is_idempotent() {
        let mut seq = BlobSequence::new(unique_name("release"), 256).expect("create");
        seq.release();
        seq.release();
    }
}
