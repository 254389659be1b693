//! Persisted fingerprints of the last successful execution of each task.
//!
//! A record is a 4-byte big-endian format version followed by a CBOR body.
//! Every known version decodes into the same in-memory [`TaskState`]; unknown
//! versions are rejected so the caller can treat them as a cache miss.

mod store;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::StateError;
use crate::fingerprint::SnapshotEntry;
use crate::task::Options;

pub use self::store::{FileStore, MemoryStore, StateStore};

/// The last persisted fingerprint of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskState {
    pub options_hash: u64,
    /// The full option map, absent in records written before version 4.
    pub options: Option<Options>,
    pub inputs: Vec<SnapshotEntry>,
    pub outputs: Vec<SnapshotEntry>,
}

impl TaskState {
    pub fn new(options: &Options, inputs: Vec<SnapshotEntry>, outputs: Vec<SnapshotEntry>) -> Self {
        Self {
            options_hash: options.hash(),
            options: Some(options.clone()),
            inputs,
            outputs,
        }
    }

    /// Compares structurally when the map is known, by hash otherwise.
    pub fn options_match(&self, options: &Options) -> bool {
        match &self.options {
            Some(stored) => stored == options,
            None => self.options_hash == options.hash(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, StateError> {
        let body = RecordV4 {
            options_hash: self.options_hash,
            options: self
                .options
                .as_ref()
                .map(|options| options.as_map().clone())
                .unwrap_or_default(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
        };

        let mut buffer = Format::CURRENT.tag().to_be_bytes().to_vec();
        ciborium::into_writer(&body, &mut buffer).map_err(|e| StateError::Encode(e.to_string()))?;
        Ok(buffer)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StateError> {
        let (tag, body) = bytes.split_first_chunk::<4>().ok_or(StateError::Truncated)?;
        let tag = u32::from_be_bytes(*tag);
        let format = Format::from_tag(tag).ok_or(StateError::UnsupportedVersion(tag))?;

        let mut state = format.decode(body)?;
        state.inputs.sort_by(|a, b| a.path.cmp(&b.path));
        state.outputs.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(state)
    }
}

/// Known on-disk layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    /// Metadata without the folder flag.
    V1,
    /// Adds the folder flag.
    V2,
    /// Adds the optional content digest.
    V3,
    /// Adds the full option map.
    V4,
}

impl Format {
    const CURRENT: Format = Format::V4;

    fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(Self::V1),
            2 => Some(Self::V2),
            3 => Some(Self::V3),
            4 => Some(Self::V4),
            _ => None,
        }
    }

    fn tag(self) -> u32 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
            Self::V3 => 3,
            Self::V4 => 4,
        }
    }

    fn decode(self, body: &[u8]) -> Result<TaskState, StateError> {
        match self {
            Self::V1 => read::<Record<EntryV1>>(body).map(Record::upgrade),
            Self::V2 => read::<Record<EntryV2>>(body).map(Record::upgrade),
            Self::V3 => read::<Record<SnapshotEntry>>(body).map(Record::upgrade),
            Self::V4 => read::<RecordV4>(body).map(|record| TaskState {
                options_hash: record.options_hash,
                options: Some(record.options.into_iter().collect()),
                inputs: record.inputs,
                outputs: record.outputs,
            }),
        }
    }
}

fn read<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, StateError> {
    ciborium::from_reader(body).map_err(|e| StateError::Decode(e.to_string()))
}

#[derive(Serialize, Deserialize)]
struct Record<E> {
    options_hash: u64,
    inputs: Vec<E>,
    outputs: Vec<E>,
}

impl<E: Into<SnapshotEntry>> Record<E> {
    fn upgrade(self) -> TaskState {
        TaskState {
            options_hash: self.options_hash,
            options: None,
            inputs: self.inputs.into_iter().map(Into::into).collect(),
            outputs: self.outputs.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RecordV4 {
    options_hash: u64,
    options: BTreeMap<String, String>,
    inputs: Vec<SnapshotEntry>,
    outputs: Vec<SnapshotEntry>,
}

#[derive(Serialize, Deserialize)]
struct EntryV1 {
    path: String,
    exists: bool,
    last_modified: i64,
    length: i64,
}

impl From<EntryV1> for SnapshotEntry {
    fn from(entry: EntryV1) -> Self {
        SnapshotEntry {
            path: entry.path,
            exists: entry.exists,
            folder: false,
            last_modified: entry.last_modified,
            length: entry.length,
            digest: None,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct EntryV2 {
    path: String,
    exists: bool,
    folder: bool,
    last_modified: i64,
    length: i64,
}

impl From<EntryV2> for SnapshotEntry {
    fn from(entry: EntryV2) -> Self {
        SnapshotEntry {
            path: entry.path,
            exists: entry.exists,
            folder: entry.folder,
            last_modified: entry.last_modified,
            length: entry.length,
            digest: None,
        }
    }
}
