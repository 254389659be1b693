//! Snapshots of declared inputs and outputs.

use std::collections::HashSet;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::vfs::FileHandle;

/// What a snapshot entry records about a regular file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintMode {
    /// Existence, modification time and length.
    #[default]
    Metadata,
    /// Metadata plus a digest of the content.
    ContentHash,
}

/// How far a single declared reference reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMode {
    /// Only the referenced path.
    Single,
    /// The referenced path and every descendant.
    Tree,
}

/// One observed path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub path: String,
    pub exists: bool,
    pub folder: bool,
    pub last_modified: i64,
    pub length: i64,
    /// Lowercase hex, only for existing regular files under
    /// [`FingerprintMode::ContentHash`].
    pub digest: Option<String>,
}

impl SnapshotEntry {
    fn observe(file: &FileHandle) -> Self {
        file.refresh();
        let exists = file.exists();
        let folder = exists && file.is_folder();

        Self {
            path: file.path().to_string(),
            exists,
            folder,
            last_modified: file.last_modified(),
            length: file.length(),
            digest: None,
        }
    }

    fn wants_digest(&self) -> bool {
        self.exists && !self.folder
    }

    /// Whether `self` and `other` describe the same state of one path.
    ///
    /// When both sides carry a digest the modification time is not compared,
    /// rewriting a file with identical bytes keeps it unchanged.
    pub fn same_state(&self, other: &Self) -> bool {
        match (&self.digest, &other.digest) {
            (Some(a), Some(b)) => {
                self.path == other.path
                    && self.exists == other.exists
                    && self.folder == other.folder
                    && self.length == other.length
                    && a == b
            }
            _ => self == other,
        }
    }
}

/// Entry-wise [`SnapshotEntry::same_state`] of two path-sorted snapshots.
pub fn snapshots_match(a: &[SnapshotEntry], b: &[SnapshotEntry]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(a, b)| a.same_state(b))
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Hash32([u8; 32]);

impl From<blake3::Hash> for Hash32 {
    fn from(value: blake3::Hash) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub(crate) fn hash_file(file: &FileHandle) -> std::io::Result<Self> {
        let mut hasher = blake3::Hasher::new();
        hasher.update_reader(file.open()?)?;
        Ok(hasher.finalize().into())
    }

    pub(crate) fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for byte in self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// Entries for one reference, deduplicated by path.
pub(crate) fn snapshot(file: &FileHandle, mode: SnapshotMode) -> Vec<(SnapshotEntry, FileHandle)> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut stack = vec![file.clone()];

    while let Some(file) = stack.pop() {
        let entry = SnapshotEntry::observe(&file);
        if !seen.insert(entry.path.clone()) {
            continue;
        }

        if mode == SnapshotMode::Tree && entry.folder {
            stack.extend(file.children());
        }

        out.push((entry, file));
    }

    out
}

/// The path-sorted snapshot of every reference.
///
/// Digests are computed in parallel. A file which cannot be read gets no
/// digest, which makes it compare unequal to any readable state.
pub(crate) fn snapshot_all<'a>(
    mode: FingerprintMode,
    refs: impl IntoIterator<Item = (SnapshotMode, &'a FileHandle)>,
) -> Vec<SnapshotEntry> {
    let mut entries: Vec<_> = refs
        .into_iter()
        .flat_map(|(reach, file)| snapshot(file, reach))
        .collect();

    if mode == FingerprintMode::ContentHash {
        entries
            .par_iter_mut()
            .filter(|(entry, _)| entry.wants_digest())
            .for_each(|(entry, file)| match Hash32::hash_file(file) {
                Ok(hash) => entry.digest = Some(hash.to_hex()),
                Err(err) => warn!(path = %entry.path, "couldn't hash file: {err}"),
            });
    }

    let mut entries: Vec<_> = entries.into_iter().map(|(entry, _)| entry).collect();
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    entries
}
