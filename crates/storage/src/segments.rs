//! Append-only block segments.
//!
//! Block bodies live in `blkNNNNN.dat` files. Each record is framed as a
//! 4-byte magic plus a 4-byte big-endian length; segments roll over at a
//! configured size cap and are never rewritten. Every append is fsynced
//! before the index learns about it.

use crate::StorageError;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Record framing magic, `LGCB`.
pub const SEGMENT_MAGIC: [u8; 4] = *b"LGCB";

/// Frame overhead per record: magic + length.
const FRAME_BYTES: u64 = 8;

/// Where a block body lives on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLocation {
    pub segment: u32,
    pub offset: u64,
    pub length: u32,
}

/// The set of `blkNNNNN.dat` files under one directory.
pub struct SegmentStore {
    dir: PathBuf,
    max_bytes: u64,
    current_id: u32,
    current_len: u64,
    current: File,
}

impl SegmentStore {
    /// Open the store, resuming the highest existing segment.
    pub fn open(dir: impl Into<PathBuf>, max_bytes: u64) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let current_id = Self::segment_ids(&dir)?.last().copied().unwrap_or(0);
        let path = Self::segment_path(&dir, current_id);
        let current = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        let current_len = current.metadata()?.len();
        debug!(segment = current_id, bytes = current_len, "segment store opened");

        Ok(Self {
            dir,
            max_bytes,
            current_id,
            current_len,
            current,
        })
    }

    fn segment_path(dir: &Path, id: u32) -> PathBuf {
        dir.join(format!("blk{id:05}.dat"))
    }

    /// Sorted ids of every segment file present.
    pub fn segment_ids(dir: &Path) -> Result<Vec<u32>, StorageError> {
        let mut ids = Vec::new();
        if !dir.exists() {
            return Ok(ids);
        }
        for entry in fs::read_dir(dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(digits) = name.strip_prefix("blk").and_then(|n| n.strip_suffix(".dat")) {
                if let Ok(id) = digits.parse() {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Append one block body, fsync, and return its location.
    pub fn append(&mut self, bytes: &[u8]) -> Result<BlockLocation, StorageError> {
        let record_len = FRAME_BYTES + bytes.len() as u64;
        if self.current_len > 0 && self.current_len + record_len > self.max_bytes {
            self.roll_over()?;
        }

        let offset = self.current_len;
        self.current.write_all(&SEGMENT_MAGIC)?;
        self.current.write_all(&(bytes.len() as u32).to_be_bytes())?;
        self.current.write_all(bytes)?;
        self.current.sync_all()?;
        self.current_len += record_len;

        Ok(BlockLocation {
            segment: self.current_id,
            offset,
            length: bytes.len() as u32,
        })
    }

    fn roll_over(&mut self) -> Result<(), StorageError> {
        self.current_id += 1;
        let path = Self::segment_path(&self.dir, self.current_id);
        self.current = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        self.current_len = 0;
        info!(segment = self.current_id, "rolled over to new segment");
        Ok(())
    }

    /// Read one block body back.
    pub fn read(&self, location: BlockLocation) -> Result<Vec<u8>, StorageError> {
        let path = Self::segment_path(&self.dir, location.segment);
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(location.offset))?;

        let mut frame = [0u8; 8];
        file.read_exact(&mut frame)?;
        if frame[..4] != SEGMENT_MAGIC {
            return Err(StorageError::Corruption(format!(
                "bad magic in segment {} at offset {}",
                location.segment, location.offset
            )));
        }
        let length = u32::from_be_bytes(frame[4..].try_into().expect("4 bytes"));
        if length != location.length {
            return Err(StorageError::Corruption(format!(
                "length mismatch in segment {}: framed {length}, indexed {}",
                location.segment, location.length
            )));
        }

        let mut bytes = vec![0u8; length as usize];
        file.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    /// Replay every record in every segment, oldest first. A torn trailing
    /// record (crash mid-append) ends the replay cleanly.
    pub fn replay(&self) -> Result<Vec<(BlockLocation, Vec<u8>)>, StorageError> {
        let mut records = Vec::new();
        for id in Self::segment_ids(&self.dir)? {
            let path = Self::segment_path(&self.dir, id);
            let mut file = File::open(&path)?;
            let total = file.metadata()?.len();
            let mut offset = 0u64;
            while offset + FRAME_BYTES <= total {
                file.seek(SeekFrom::Start(offset))?;
                let mut frame = [0u8; 8];
                file.read_exact(&mut frame)?;
                if frame[..4] != SEGMENT_MAGIC {
                    return Err(StorageError::Corruption(format!(
                        "bad magic in segment {id} at offset {offset}"
                    )));
                }
                let length = u32::from_be_bytes(frame[4..].try_into().expect("4 bytes"));
                if offset + FRAME_BYTES + length as u64 > total {
                    debug!(segment = id, offset, "torn trailing record ignored");
                    break;
                }
                let mut bytes = vec![0u8; length as usize];
                file.read_exact(&mut bytes)?;
                records.push((
                    BlockLocation {
                        segment: id,
                        offset,
                        length,
                    },
                    bytes,
                ));
                offset += FRAME_BYTES + length as u64;
            }
        }
        Ok(records)
    }

    pub fn current_segment(&self) -> u32 {
        self.current_id
    }
}
