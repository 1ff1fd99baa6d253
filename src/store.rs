//! Durable per-trial records.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};

use crate::error::StoreError;

pub type Record = Map<String, Value>;

/// Receives each terminal trial exactly once.
pub trait DataStore: Send {
    fn append(&mut self, record: &Record) -> Result<(), StoreError>;
}

/// One JSON object per line, flushed after every trial.
pub struct JsonLinesStore {
    path: PathBuf,
    out: BufWriter<File>,
}

impl JsonLinesStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            out: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Index to give the next trial appended to `path`: one past the largest
    /// recorded `index`, or 0 for a missing file. Unparseable lines (a torn
    /// final write) are skipped.
    pub fn next_index(path: &Path) -> Result<u64, StoreError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut next = 0;
        for line in BufReader::new(file).lines() {
            let Ok(record) = serde_json::from_str::<Record>(&line?) else {
                continue;
            };
            if let Some(index) = record.get("index").and_then(Value::as_u64) {
                next = next.max(index + 1);
            }
        }
        Ok(next)
    }
}

impl DataStore for JsonLinesStore {
    fn append(&mut self, record: &Record) -> Result<(), StoreError> {
        serde_json::to_writer(&mut self.out, record)?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }
}

/// Clones share the same record list.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<Vec<Record>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Record> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl DataStore for MemoryStore {
    fn append(&mut self, record: &Record) -> Result<(), StoreError> {
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        records.push(record.clone());
        Ok(())
    }
}
