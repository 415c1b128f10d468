// SPDX-License-Identifier: Apache-2.0

//! Append-only, self-framed packed-blob file (§3 "Shard file layout", §4.2).
//! Every blob is wrapped as:
//!
//! ```text
//! MAGIC_BEGIN(11B) | sha1(payload)(40B) | size(8B LE) | payload | MAGIC_END(11B)
//! ```
//!
//! Readers scan tolerantly for `MAGIC_BEGIN`: a truncated or corrupt tail
//! frame is skipped rather than treated as a hard failure, so a reader can
//! observe a file concurrently being appended to.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};

use crate::error::{CentipedeError, Result};

/// 11-byte ASCII tag opening a frame. The spec requires only that the two
/// tags be distinct and self-synchronizing; the literal bytes are this
/// implementation's own choice (see DESIGN.md).
pub const MAGIC_BEGIN: [u8; 11] = *b"CentiBegin\n";
/// 11-byte ASCII tag closing a frame.
pub const MAGIC_END: [u8; 11] = *b"CentiEnd\n\n\n";

const SHA1_HEX_LEN: usize = 40;
const SIZE_LEN: usize = 8;
const FRAME_OVERHEAD: usize = MAGIC_BEGIN.len() + SHA1_HEX_LEN + SIZE_LEN + MAGIC_END.len();

fn sha1_hex(payload: &[u8]) -> [u8; SHA1_HEX_LEN] {
    let digest = Sha1::digest(payload);
    let mut out = [0u8; SHA1_HEX_LEN];
    for (i, byte) in digest.iter().enumerate() {
        let hex = format!("{byte:02x}");
        out[i * 2] = hex.as_bytes()[0];
        out[i * 2 + 1] = hex.as_bytes()[1];
    }
    out
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
    out.extend_from_slice(&MAGIC_BEGIN);
    out.extend_from_slice(&sha1_hex(payload));
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(&MAGIC_END);
    out
}

/// Scan `data` for framed blobs, skipping any frame that is truncated or
/// fails its hash/footer check. Returns the payloads in file order.
pub fn scan_blobs(data: &[u8]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while let Some(begin_rel) = find(&data[pos..], &MAGIC_BEGIN) {
        let begin = pos + begin_rel;
        let header_start = begin + MAGIC_BEGIN.len();
        let size_start = header_start + SHA1_HEX_LEN;
        let payload_start = size_start + SIZE_LEN;
        if payload_start > data.len() {
            break;
        }
        let hash_claim = &data[header_start..size_start];
        let size_bytes = &data[size_start..payload_start];
        let size = u64::from_le_bytes(size_bytes.try_into().unwrap()) as usize;
        let payload_end = payload_start + size;
        let footer_end = payload_end + MAGIC_END.len();
        if footer_end > data.len() {
            break;
        }
        let payload = &data[payload_start..payload_end];
        let footer = &data[payload_end..footer_end];
        if footer == MAGIC_END && hash_claim == sha1_hex(payload) {
            out.push(payload.to_vec());
            pos = footer_end;
        } else {
            // Corrupt/partial frame: resume scanning just past this
            // MAGIC_BEGIN occurrence rather than giving up on the file.
            pos = begin + 1;
        }
    }
    out
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Loads a blob file once and serves its blobs by cursor (§4.2).
pub struct BlobFileReader {
    blobs: Vec<Vec<u8>>,
    cursor: usize,
    open: bool,
}

impl BlobFileReader {
    pub fn new() -> Self {
        Self {
            blobs: Vec::new(),
            cursor: 0,
            open: false,
        }
    }

    /// Open and eagerly scan `path`. A missing file is tolerated as an empty
    /// shard (§7).
    pub fn open(&mut self, path: impl AsRef<Path>) -> Result<()> {
        if self.open {
            return Err(CentipedeError::Precondition("reader already open".into()));
        }
        let data = match std::fs::read(path.as_ref()) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        self.blobs = scan_blobs(&data);
        self.cursor = 0;
        self.open = true;
        Ok(())
    }

    pub fn num_blobs(&self) -> usize {
        self.blobs.len()
    }

    /// Read the next blob, or `EndOfStream` once every blob has been served.
    pub fn read(&mut self) -> Result<Vec<u8>> {
        if !self.open {
            return Err(CentipedeError::Precondition("reader not open".into()));
        }
        let blob = self
            .blobs
            .get(self.cursor)
            .cloned()
            .ok_or(CentipedeError::EndOfStream)?;
        self.cursor += 1;
        Ok(blob)
    }

    /// All blobs at once, leaving the cursor unmoved.
    pub fn all(&self) -> &[Vec<u8>] {
        &self.blobs
    }

    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Err(CentipedeError::Precondition("reader not open".into()));
        }
        self.open = false;
        self.blobs.clear();
        self.cursor = 0;
        Ok(())
    }
}

impl Default for BlobFileReader {
    fn default() -> Self {
        Self::new()
    }
}

/// Appends framed blobs to a file, one appender per file at a time (§4.2,
/// §5: "single appender discipline").
pub struct BlobFileAppender {
    file: Option<File>,
    path: PathBuf,
}

impl BlobFileAppender {
    pub fn new() -> Self {
        Self {
            file: None,
            path: PathBuf::new(),
        }
    }

    pub fn open(&mut self, path: impl AsRef<Path>) -> Result<()> {
        if self.file.is_some() {
            return Err(CentipedeError::Precondition("appender already open".into()));
        }
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.file = Some(file);
        self.path = path;
        Ok(())
    }

    pub fn append(&mut self, payload: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| CentipedeError::Precondition("appender not open".into()))?;
        file.write_all(&frame(payload))?;
        file.flush()?;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if self.file.take().is_none() {
            return Err(CentipedeError::Precondition("appender not open".into()));
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for BlobFileAppender {
    fn default() -> Self {
        Self::new()
    }
}

/// Read every framed blob out of `path` in one call, tolerating a missing
/// file as an empty shard.
pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<Vec<u8>>> {
    let mut reader = BlobFileReader::new();
    reader.open(path)?;
    Ok(reader.all().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("corpus.000000");
        let mut appender = BlobFileAppender::new();
        appender.open(&path).unwrap();
        appender.append(b"hello").unwrap();
        appender.append(b"world").unwrap();
        appender.close().unwrap();

        let mut reader = BlobFileReader::new();
        reader.open(&path).unwrap();
        assert_eq!(reader.read().unwrap(), b"hello");
        assert_eq!(reader.read().unwrap(), b"world");
        assert!(matches!(reader.read(), Err(CentipedeError::EndOfStream)));
    }

    #[test]
    fn truncated_tail_frame_is_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("corpus.000001");
        let mut full = frame(b"one");
        full.extend_from_slice(&frame(b"two"));
        full.extend_from_slice(&frame(b"three")[..10]); // truncate last frame
        std::fs::write(&path, &full).unwrap();

        let mut reader = BlobFileReader::new();
        reader.open(&path).unwrap();
        assert_eq!(reader.num_blobs(), 2);
        assert_eq!(reader.read().unwrap(), b"one");
        assert_eq!(reader.read().unwrap(), b"two");
    }

    #[test]
    fn missing_file_reads_as_empty_shard() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("does-not-exist");
        let mut reader = BlobFileReader::new();
        reader.open(&path).unwrap();
        assert_eq!(reader.num_blobs(), 0);
    }

    #[test]
    fn double_open_is_a_precondition_failure() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("corpus.000002");
        let mut appender = BlobFileAppender::new();
        appender.open(&path).unwrap();
        assert!(matches!(
            appender.open(&path),
            Err(CentipedeError::Precondition(_))
        ));
    }

    #[test]
    fn read_before_open_is_a_precondition_failure() {
        let mut reader = BlobFileReader::new();
        assert!(matches!(
            reader.read(),
            Err(CentipedeError::Precondition(_))
        ));
    }

    #[test]
    fn corrupted_hash_frame_is_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("corpus.000003");
        let mut data = frame(b"good");
        let mut bad = frame(b"bad-payload");
        let payload_start = MAGIC_BEGIN.len() + SHA1_HEX_LEN + SIZE_LEN;
        bad[payload_start] ^= 0xFF; // corrupt payload without fixing hash
        data.extend_from_slice(&bad);
        data.extend_from_slice(&frame(b"tail"));
        std::fs::write(&path, &data).unwrap();

        let mut reader = BlobFileReader::new();
        reader.open(&path).unwrap();
        let blobs = reader.all();
        assert!(blobs.contains(&b"good".to_vec()));
        assert!(blobs.contains(&b"tail".to_vec()));
        assert!(!blobs.iter().any(|b| b.starts_with(b"bad")));
    }
}
