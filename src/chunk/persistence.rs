//! Sealed chunk index files
//!
//! File layout, a sequence of frames:
//!
//! ```text
//! [len: u32 LE][snappy(bincode(SealedObject))][crc32: u32 LE]
//! ```
//!
//! A valid file holds exactly two frames: the payload, then a seal marker.
//! The seal is written last, so a file cut short by a crash mid-persist has
//! no seal and is rejected on load. Files are written to a temporary path,
//! synced and renamed into place.

use crate::index::{DocumentRecord, IndexerMap};
use crate::store::ChunkId;
use crate::{IndexError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const FILE_EXTENSION: &str = "tidx";
const FRAME_OVERHEAD: usize = 8;

/// Persisted content of one chunk document index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkIndexPayload {
    pub branch: String,
    /// Indexers the documents were built with
    pub indexers: IndexerMap,
    pub documents: Vec<DocumentRecord>,
}

/// Completeness marker; the token is never compared
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SealMarker {
    pub token: Uuid,
}

impl SealMarker {
    pub fn new() -> Self {
        Self { token: Uuid::new_v4() }
    }
}

impl Default for SealMarker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SealedObject {
    Payload(ChunkIndexPayload),
    Seal(SealMarker),
}

/// Encode one object as a checksummed frame
pub fn encode_frame(object: &SealedObject) -> Result<Vec<u8>> {
    let raw = bincode::serialize(object)?;
    let compressed = snap::raw::Encoder::new()
        .compress_vec(&raw)
        .map_err(|e| IndexError::Serialization(format!("Compression failed: {}", e)))?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&compressed);
    let checksum = hasher.finalize();

    let mut frame = Vec::with_capacity(compressed.len() + FRAME_OVERHEAD);
    frame.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
    frame.extend_from_slice(&compressed);
    frame.extend_from_slice(&checksum.to_le_bytes());
    Ok(frame)
}

/// Split a file into its objects; any framing, checksum or decode error is reported as text
pub fn decode_frames(data: &[u8]) -> std::result::Result<Vec<SealedObject>, String> {
    let mut objects = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        if data.len() - offset < FRAME_OVERHEAD {
            return Err(format!("Truncated frame header at offset {}", offset));
        }
        let len = u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]]) as usize;
        let body_start = offset + 4;
        let body_end = body_start
            .checked_add(len)
            .filter(|end| end + 4 <= data.len())
            .ok_or_else(|| format!("Frame at offset {} exceeds file size", offset))?;

        let body = &data[body_start..body_end];
        let expected = u32::from_le_bytes([
            data[body_end],
            data[body_end + 1],
            data[body_end + 2],
            data[body_end + 3],
        ]);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(body);
        let actual = hasher.finalize();
        if actual != expected {
            return Err(format!(
                "Checksum mismatch at offset {}: expected {:#010x}, got {:#010x}",
                offset, expected, actual
            ));
        }

        let raw = snap::raw::Decoder::new()
            .decompress_vec(body)
            .map_err(|e| format!("Decompression failed: {}", e))?;
        let object: SealedObject = bincode::deserialize(&raw).map_err(|e| format!("Decode failed: {}", e))?;
        objects.push(object);
        offset = body_end + 4;
    }
    Ok(objects)
}

/// Directory of sealed chunk index files
#[derive(Debug, Clone)]
pub struct ChunkFileStore {
    root: PathBuf,
}

impl ChunkFileStore {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        fs::create_dir_all(root.as_ref())?;
        Ok(Self {
            root: root.as_ref().to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<sanitized-branch>-<crc32(branch)>/chunk-<sequence>.tidx`
    pub fn path_for(&self, chunk: &ChunkId) -> PathBuf {
        self.branch_dir(&chunk.branch)
            .join(format!("chunk-{}.{}", chunk.sequence, FILE_EXTENSION))
    }

    fn branch_dir(&self, branch: &str) -> PathBuf {
        let sanitized: String = branch
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.root
            .join(format!("{}-{:08x}", sanitized, crc32fast::hash(branch.as_bytes())))
    }

    pub fn exists(&self, chunk: &ChunkId) -> bool {
        self.path_for(chunk).exists()
    }

    /// Write payload and seal, replacing any previous file
    pub fn write(&self, chunk: &ChunkId, payload: &ChunkIndexPayload) -> Result<()> {
        let path = self.path_for(chunk);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut data = encode_frame(&SealedObject::Payload(payload.clone()))?;
        data.extend(encode_frame(&SealedObject::Seal(SealMarker::new()))?);

        let tmp_path = path.with_extension(format!("{}.tmp", FILE_EXTENSION));
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// Read a sealed file.
    ///
    /// `Ok(None)` when no file exists, `CorruptedChunkFile` when the file is
    /// unusable.
    pub fn read(&self, chunk: &ChunkId) -> Result<Option<ChunkIndexPayload>> {
        let path = self.path_for(chunk);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path)?;
        let corrupted = |reason: String| IndexError::CorruptedChunkFile {
            path: path.clone(),
            reason,
        };

        let mut objects = decode_frames(&data).map_err(corrupted)?;
        if objects.len() != 2 {
            return Err(corrupted(format!("expected 2 objects, found {}", objects.len())));
        }
        let seal = objects.pop();
        let payload = objects.pop();
        match (payload, seal) {
            (Some(SealedObject::Payload(payload)), Some(SealedObject::Seal(_))) => Ok(Some(payload)),
            _ => Err(corrupted("expected payload followed by seal marker".to_string())),
        }
    }

    /// Returns whether a file was removed
    pub fn delete(&self, chunk: &ChunkId) -> Result<bool> {
        let path = self.path_for(chunk);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove every chunk index file below the root
    pub fn delete_all(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            for file in fs::read_dir(entry.path())? {
                let file = file?;
                if file.path().extension().and_then(|e| e.to_str()) == Some(FILE_EXTENSION) {
                    fs::remove_file(file.path())?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Indexer;
    use crate::types::{IndexValue, TIMESTAMP_INFINITY};
    use tempfile::tempdir;

    fn payload() -> ChunkIndexPayload {
        let mut indexers = IndexerMap::new();
        indexers.insert("name".to_string(), vec![Indexer::text("name")]);
        ChunkIndexPayload {
            branch: "feature/x".to_string(),
            indexers,
            documents: vec![DocumentRecord {
                index_name: "name".to_string(),
                keyspace: "people".to_string(),
                key: "k1".to_string(),
                value: IndexValue::from("Ann"),
                valid_from: 10,
                valid_to: TIMESTAMP_INFINITY,
            }],
        }
    }

    fn chunk_id() -> ChunkId {
        ChunkId {
            branch: "feature/x".to_string(),
            sequence: 3,
        }
    }

    #[test]
    fn test_write_and_read() {
        let dir = tempdir().unwrap();
        let files = ChunkFileStore::open(dir.path()).unwrap();
        assert!(files.read(&chunk_id()).unwrap().is_none());

        files.write(&chunk_id(), &payload()).unwrap();
        let path = files.path_for(&chunk_id());
        assert!(path.ends_with("chunk-3.tidx"));
        assert!(path
            .parent()
            .unwrap()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("feature_x-"));

        assert_eq!(files.read(&chunk_id()).unwrap(), Some(payload()));
        assert!(files.delete(&chunk_id()).unwrap());
        assert!(!files.delete(&chunk_id()).unwrap());
    }

    #[test]
    fn test_missing_seal_is_corrupt() {
        let dir = tempdir().unwrap();
        let files = ChunkFileStore::open(dir.path()).unwrap();
        let path = files.path_for(&chunk_id());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, encode_frame(&SealedObject::Payload(payload())).unwrap()).unwrap();

        let err = files.read(&chunk_id()).unwrap_err();
        assert!(matches!(err, IndexError::CorruptedChunkFile { .. }));
    }

    #[test]
    fn test_wrong_order_and_garbage_are_corrupt() {
        let dir = tempdir().unwrap();
        let files = ChunkFileStore::open(dir.path()).unwrap();
        let path = files.path_for(&chunk_id());
        fs::create_dir_all(path.parent().unwrap()).unwrap();

        let mut swapped = encode_frame(&SealedObject::Seal(SealMarker::new())).unwrap();
        swapped.extend(encode_frame(&SealedObject::Payload(payload())).unwrap());
        fs::write(&path, swapped).unwrap();
        assert!(files.read(&chunk_id()).is_err());

        let mut flipped = encode_frame(&SealedObject::Payload(payload())).unwrap();
        flipped[6] ^= 0xff;
        fs::write(&path, flipped).unwrap();
        assert!(files.read(&chunk_id()).is_err());

        fs::write(&path, b"xx").unwrap();
        assert!(files.read(&chunk_id()).is_err());
    }

    #[test]
    fn test_delete_all() {
        let dir = tempdir().unwrap();
        let files = ChunkFileStore::open(dir.path()).unwrap();
        files.write(&chunk_id(), &payload()).unwrap();
        files
            .write(
                &ChunkId {
                    branch: "master".to_string(),
                    sequence: 0,
                },
                &payload(),
            )
            .unwrap();
        assert_eq!(files.delete_all().unwrap(), 2);
        assert!(!files.exists(&chunk_id()));
    }
}
