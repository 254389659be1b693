use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use ciborium::Value;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::utils::lock;

/// Durable key/value storage for encoded task records.
///
/// Writes become durable only once [`StateStore::commit`] returns. A crash
/// before that loses the uncommitted writes and nothing else.
pub trait StateStore: Send {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn put(&mut self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    fn commit(&mut self) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct Memory {
    committed: BTreeMap<String, Vec<u8>>,
    pending: BTreeMap<String, Vec<u8>>,
}

/// Process-local store. Clones share the same data, so a clone can stand in
/// for the same store after a restart of its owner.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Memory>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Throws away uncommitted writes, as a crash would.
    pub fn discard_pending(&self) {
        lock(&self.inner).pending.clear();
    }

    pub fn committed_len(&self) -> usize {
        lock(&self.inner).committed.len()
    }

    /// Overwrites a committed record directly.
    pub fn insert_committed(&self, key: &str, value: Vec<u8>) {
        lock(&self.inner).committed.insert(key.to_string(), value);
    }
}

impl StateStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let inner = lock(&self.inner);
        Ok(inner
            .pending
            .get(key)
            .or_else(|| inner.committed.get(key))
            .cloned())
    }

    fn put(&mut self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        lock(&self.inner).pending.insert(key.to_string(), value);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        let mut inner = lock(&self.inner);
        let pending = std::mem::take(&mut inner.pending);
        inner.committed.extend(pending);
        Ok(())
    }
}

/// Store kept as a single CBOR map on disk.
///
/// A commit writes the whole map next to the target, syncs it and renames it
/// over the previous file, so readers only ever see a complete map. Writes
/// stay pending until that rename succeeds and are dropped if it fails.
#[derive(Debug)]
pub struct FileStore {
    path: Utf8PathBuf,
    records: BTreeMap<String, Vec<u8>>,
    pending: BTreeMap<String, Vec<u8>>,
}

impl FileStore {
    /// Loads `path` if it exists. A file which cannot be decoded is treated
    /// as empty and replaced on the next commit.
    pub fn open(path: impl Into<Utf8PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();

        let records = match fs::read(&path) {
            Ok(bytes) => decode(&bytes).unwrap_or_else(|err| {
                warn!(path = %path, "discarding unreadable task state: {err}");
                BTreeMap::new()
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };

        debug!(path = %path, records = records.len(), "opened task state");

        Ok(Self {
            path,
            records,
            pending: BTreeMap::new(),
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn temp_path(&self) -> Utf8PathBuf {
        let name = self.path.file_name().unwrap_or("tasks.db");
        self.path.with_file_name(format!("{name}.tmp"))
    }

    fn write(&self, records: &BTreeMap<String, Vec<u8>>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let temp = self.temp_path();
        {
            let file = fs::File::create(&temp)?;
            let mut writer = BufWriter::new(file);
            ciborium::into_writer(&encode(records), &mut writer)
                .map_err(|e| StoreError::Encode(e.to_string()))?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        fs::rename(&temp, &self.path)?;
        Ok(())
    }
}

impl StateStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .pending
            .get(key)
            .or_else(|| self.records.get(key))
            .cloned())
    }

    fn put(&mut self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.pending.insert(key.to_string(), value);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let pending = std::mem::take(&mut self.pending);
        let mut records = self.records.clone();
        records.extend(pending);

        if let Err(err) = self.write(&records) {
            warn!(path = %self.path, "dropping uncommitted task state: {err}");
            return Err(err);
        }

        self.records = records;
        Ok(())
    }
}

fn encode(records: &BTreeMap<String, Vec<u8>>) -> Value {
    Value::Map(
        records
            .iter()
            .map(|(key, value)| (Value::Text(key.clone()), Value::Bytes(value.clone())))
            .collect(),
    )
}

fn decode(bytes: &[u8]) -> Result<BTreeMap<String, Vec<u8>>, StoreError> {
    let value: Value = ciborium::from_reader(bytes).map_err(|e| StoreError::Decode(e.to_string()))?;

    let Value::Map(entries) = value else {
        return Err(StoreError::Decode("expected a map".into()));
    };

    entries
        .into_iter()
        .map(|entry| match entry {
            (Value::Text(key), Value::Bytes(value)) => Ok((key, value)),
            _ => Err(StoreError::Decode("expected text keys and byte values".into())),
        })
        .collect()
}
