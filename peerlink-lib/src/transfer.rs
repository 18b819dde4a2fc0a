pub mod codec;
pub mod engine;

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use derive_new::new;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sender-supplied file metadata, fixed for the lifetime of a transfer.
///
/// Unknown fields (e.g. a collaborator correlation id) survive the trip
/// through `extra` and reach the receiver unmodified.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type", default)]
    pub mime: String,
    #[serde(default)]
    pub last_modified: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl FileMetadata {
    pub fn new(name: impl Into<String>, size: u64, mime: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            mime: mime.into(),
            last_modified: 0,
            extra: serde_json::Map::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferDirection {
    Sending,
    Receiving,
}

/// Monotonic except that `Transferring -> Failed` can happen mid-flight;
/// `Failed` is terminal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferStatus {
    Pending,
    Transferring,
    Completed,
    Failed,
}

/// One item of the read-only progress stream.
#[derive(Clone, Debug, new, Getters, CopyGetters)]
pub struct TransferProgress {
    #[getset(get = "pub")]
    file_id: String,
    #[getset(get = "pub")]
    name: String,
    #[getset(get_copy = "pub")]
    direction: TransferDirection,
    #[getset(get_copy = "pub")]
    status: TransferStatus,
    #[getset(get_copy = "pub")]
    transferred: u64,
    #[getset(get_copy = "pub")]
    size: u64,
    #[getset(get_copy = "pub")]
    percent: u8,
}

/// A fully reassembled incoming file, handed to the file-received
/// collaborator together with its original metadata.
#[derive(Clone, Debug)]
pub struct ReceivedFile {
    pub file_id: String,
    pub metadata: FileMetadata,
    pub data: Bytes,
}

pub(crate) struct TransferRecord {
    pub metadata: FileMetadata,
    pub direction: TransferDirection,
    pub status: TransferStatus,
    pub transferred: u64,
}

impl TransferRecord {
    pub fn new(metadata: FileMetadata, direction: TransferDirection) -> Self {
        Self {
            metadata,
            direction,
            status: TransferStatus::Pending,
            transferred: 0,
        }
    }

    /// Reported percentage is capped at 100 even if a misbehaving sender
    /// overruns the declared size.
    pub fn percent(&self) -> u8 {
        if self.metadata.size == 0 {
            return match self.status {
                TransferStatus::Completed => 100,
                _ => 0,
            };
        }
        (self.transferred.saturating_mul(100) / self.metadata.size).min(100) as u8
    }

    pub fn progress(&self, file_id: &str) -> TransferProgress {
        TransferProgress::new(
            file_id.to_owned(),
            self.metadata.name.clone(),
            self.direction,
            self.status,
            self.transferred,
            self.metadata.size,
            self.percent(),
        )
    }
}

/// Timestamp plus random suffix; collisions within one session are
/// negligible.
pub(crate) fn generate_file_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{:x}-{}", millis, &suffix[..8])
}
