//! Durable adaptive-queue state.
//!
//! File layout: [`storage::MAGIC`], `u32` LE format version, then lz4 chunks.
//! The `MIXQ` chunk carries the JSON of a [`MixedSnapshot`].

use std::fs;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::SnapshotError;
use crate::queues::AdaptiveState;
use crate::storage;

pub const FORMAT_VERSION: u32 = 1;
/// Version of the JSON payload schema, independent of the file framing.
pub const MIXED_SCHEMA: u32 = 1;

const TAG_MIXED_QUEUE: [u8; 4] = *b"MIXQ";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixedSnapshot {
    pub schema: u32,
    pub queues: Vec<AdaptiveState>,
}

impl MixedSnapshot {
    pub fn new(queues: Vec<AdaptiveState>) -> Self {
        Self {
            schema: MIXED_SCHEMA,
            queues,
        }
    }

    pub fn check_schema(&self) -> Result<(), SnapshotError> {
        if self.schema != MIXED_SCHEMA {
            return Err(SnapshotError::Version(self.schema));
        }
        Ok(())
    }
}

pub fn write_snapshot<W: Write>(w: &mut W, snapshot: &MixedSnapshot) -> Result<(), SnapshotError> {
    w.write_all(storage::MAGIC)?;
    storage::write_u32_le(w, FORMAT_VERSION)?;
    let payload = serde_json::to_vec(snapshot)?;
    storage::write_chunk_lz4(w, TAG_MIXED_QUEUE, &payload)?;
    Ok(())
}

pub fn read_snapshot<R: Read>(r: &mut R) -> Result<MixedSnapshot, SnapshotError> {
    let magic = storage::read_exact::<8, _>(r)?;
    if &magic != storage::MAGIC {
        return Err(SnapshotError::BadMagic);
    }
    let version = storage::read_u32_le(r)?;
    if version != FORMAT_VERSION {
        return Err(SnapshotError::Version(version));
    }

    let mut mixed: Option<Vec<u8>> = None;
    while let Some((tag, payload)) = storage::read_chunk_lz4(r)? {
        // Unknown chunks are skipped.
        if tag == TAG_MIXED_QUEUE {
            mixed = Some(payload);
        }
    }
    let payload = mixed.ok_or(SnapshotError::MissingChunk("MIXQ"))?;
    let snapshot: MixedSnapshot = serde_json::from_slice(&payload)?;
    snapshot.check_schema()?;
    Ok(snapshot)
}

/// Where a [`crate::queues::MixedAdaptiveQueue`] keeps its state.
pub trait SnapshotStore: Send {
    /// `Ok(None)` if nothing has been saved yet.
    fn load(&self) -> Result<Option<MixedSnapshot>, SnapshotError>;
    fn save(&self, snapshot: &MixedSnapshot) -> Result<(), SnapshotError>;
}

/// Snapshot file replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self) -> Result<Option<MixedSnapshot>, SnapshotError> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut r = io::BufReader::new(file);
        read_snapshot(&mut r).map(Some)
    }

    fn save(&self, snapshot: &MixedSnapshot) -> Result<(), SnapshotError> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let tmp = self.temp_path();
        {
            let file = fs::File::create(&tmp)?;
            let mut w = io::BufWriter::new(file);
            write_snapshot(&mut w, snapshot)?;
            let file = w.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// In-memory store holding encoded bytes. Clones share storage, which lets a
/// test drop a queue and reopen it against the same "file".
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshotStore {
    bytes: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Vec<u8>>> {
        self.bytes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self) -> Result<Option<MixedSnapshot>, SnapshotError> {
        match self.lock().as_deref() {
            Some(bytes) => read_snapshot(&mut Cursor::new(bytes)).map(Some),
            None => Ok(None),
        }
    }

    fn save(&self, snapshot: &MixedSnapshot) -> Result<(), SnapshotError> {
        let mut buf = Vec::new();
        write_snapshot(&mut buf, snapshot)?;
        *self.lock() = Some(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queues::{BracketState, KaernbachState, Trend};

    fn sample() -> MixedSnapshot {
        MixedSnapshot::new(vec![
            AdaptiveState::DoubleStaircase {
                bracket: BracketState {
                    low_idx: 3,
                    high_idx: 17,
                },
            },
            AdaptiveState::Kaernbach(KaernbachState {
                value: 42.0,
                trend: Some(Trend::Down),
                trials: 12,
                reversals: 4,
            }),
        ])
    }

    #[test]
    fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path().join("nested").join("queue.snap"));
        assert!(store.load().unwrap().is_none());

        store.save(&sample()).unwrap();
        assert_eq!(store.load().unwrap(), Some(sample()));
        assert!(!store.temp_path().exists());
    }

    #[test]
    fn rejects_foreign_files() {
        let mut bytes = Vec::new();
        write_snapshot(&mut bytes, &sample()).unwrap();
        bytes[0] = b'X';
        assert!(matches!(
            read_snapshot(&mut Cursor::new(&bytes)),
            Err(SnapshotError::BadMagic)
        ));
    }

    #[test]
    fn rejects_unknown_format_version() {
        let mut bytes = Vec::new();
        write_snapshot(&mut bytes, &sample()).unwrap();
        bytes[8..12].copy_from_slice(&9u32.to_le_bytes());
        assert!(matches!(
            read_snapshot(&mut Cursor::new(&bytes)),
            Err(SnapshotError::Version(9))
        ));
    }

    #[test]
    fn missing_payload_chunk() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(storage::MAGIC);
        storage::write_u32_le(&mut bytes, FORMAT_VERSION).unwrap();
        storage::write_chunk_lz4(&mut bytes, *b"NOTE", b"unrelated").unwrap();
        assert!(matches!(
            read_snapshot(&mut Cursor::new(&bytes)),
            Err(SnapshotError::MissingChunk("MIXQ"))
        ));
    }
}
