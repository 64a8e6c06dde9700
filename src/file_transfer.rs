use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::errors::{AgentError, AgentResult};
use crate::topology::InstanceId;

/// Matches the sender's in-flight window; a full channel blocks the
/// producer until the receiver drains.
pub const CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub path: String,
    pub length: u64,
    #[serde(default)]
    pub directory: bool,
}

/// One item of a streamed directory tree. A transfer is a sequence of
/// headers, each followed by exactly `length` bytes of chunks, closed by
/// a single end-of-stream marker.
#[derive(Debug, Clone)]
pub enum TransferItem {
    Header(FileMetadata),
    Chunk(Bytes),
    EndOfStream,
}

pub fn channel_key(instance_id: &InstanceId, client_name: &str) -> String {
    format!("{}@file-transfer-queue@{}", instance_id, client_name)
}

struct TransferChannel {
    tx: mpsc::Sender<TransferItem>,
    rx: Mutex<mpsc::Receiver<TransferItem>>,
}

impl TransferChannel {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        TransferChannel {
            tx,
            rx: Mutex::new(rx),
        }
    }
}

/// Named rendezvous channels between the message layer feeding transfer
/// items in and the receiver task writing files out. Either side may
/// create the channel; the name ties them together.
pub struct TransferHub {
    channels: DashMap<String, Arc<TransferChannel>>,
}

impl TransferHub {
    pub fn new() -> Self {
        TransferHub {
            channels: DashMap::new(),
        }
    }

    fn channel(&self, name: &str) -> Arc<TransferChannel> {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(TransferChannel::new()))
            .clone()
    }

    /// Queues one item for the receiver, waiting when the channel is full.
    pub async fn push(&self, name: &str, item: TransferItem) -> AgentResult<()> {
        let channel = self.channel(name);
        channel.tx.send(item).await.map_err(|_| {
            AgentError::ProtocolError(format!(
                "Transfer channel '{}' is no longer accepting items",
                name
            ))
        })
    }

    /// Drains the named channel into `dest_root`, reconstructing the
    /// streamed directory tree. The channel is dropped afterwards whether
    /// the transfer succeeded or not; partial files are left in place.
    pub async fn receive_tree(&self, name: &str, dest_root: &Path) -> AgentResult<()> {
        let channel = self.channel(name);
        let result = {
            let mut rx = channel.rx.lock().await;
            receive_tree_from(&mut rx, dest_root).await
        };
        self.channels.remove(name);
        result
    }
}

impl Default for TransferHub {
    fn default() -> Self {
        TransferHub::new()
    }
}

async fn receive_tree_from(
    rx: &mut mpsc::Receiver<TransferItem>,
    dest_root: &Path,
) -> AgentResult<()> {
    fs::create_dir_all(dest_root).await.map_err(|e| {
        AgentError::FileSystemError(format!(
            "Cannot create transfer directory {}: {}",
            dest_root.display(),
            e
        ))
    })?;

    let mut files = 0usize;
    loop {
        let item = rx.recv().await.ok_or_else(|| {
            AgentError::ProtocolError("Transfer channel closed before end-of-stream".to_string())
        })?;

        match item {
            TransferItem::EndOfStream => {
                info!("Transfer into {} complete ({} files)", dest_root.display(), files);
                return Ok(());
            }
            TransferItem::Header(metadata) if metadata.directory => {
                // Directories materialize as parents of the files below them.
                debug!("Skipping directory entry {}", metadata.path);
            }
            TransferItem::Header(metadata) => {
                receive_file(rx, dest_root, &metadata).await?;
                files += 1;
            }
            TransferItem::Chunk(_) => {
                return Err(AgentError::ProtocolError(
                    "Received a chunk while awaiting a file header".to_string(),
                ));
            }
        }
    }
}

async fn receive_file(
    rx: &mut mpsc::Receiver<TransferItem>,
    dest_root: &Path,
    metadata: &FileMetadata,
) -> AgentResult<()> {
    let target = resolve_entry_path(dest_root, &metadata.path)?;
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await.map_err(|e| {
            AgentError::FileSystemError(format!(
                "Cannot create directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }

    let mut file = fs::File::create(&target).await.map_err(|e| {
        AgentError::FileSystemError(format!("Cannot create file {}: {}", target.display(), e))
    })?;

    let mut received: u64 = 0;
    while received < metadata.length {
        let item = rx.recv().await.ok_or_else(|| {
            AgentError::ProtocolError(format!(
                "Transfer channel closed mid-file at {} of {} bytes for '{}'",
                received, metadata.length, metadata.path
            ))
        })?;

        let chunk = match item {
            TransferItem::Chunk(chunk) => chunk,
            TransferItem::Header(next) => {
                return Err(AgentError::ProtocolError(format!(
                    "Header for '{}' arrived before '{}' was complete",
                    next.path, metadata.path
                )));
            }
            TransferItem::EndOfStream => {
                return Err(AgentError::ProtocolError(format!(
                    "End-of-stream at {} of {} bytes for '{}'",
                    received, metadata.length, metadata.path
                )));
            }
        };

        file.write_all(&chunk).await.map_err(|e| {
            AgentError::FileSystemError(format!(
                "Cannot write to file {}: {}",
                target.display(),
                e
            ))
        })?;
        received += chunk.len() as u64;

        if received > metadata.length {
            return Err(AgentError::ProtocolError(format!(
                "File '{}' received {} bytes, expected {}",
                metadata.path, received, metadata.length
            )));
        }
    }

    file.flush().await?;
    debug!("Received file {} ({} bytes)", target.display(), received);
    Ok(())
}

fn resolve_entry_path(dest_root: &Path, relative: &str) -> AgentResult<PathBuf> {
    let path = Path::new(relative);
    if path.is_absolute()
        || path
            .components()
            .any(|component| matches!(component, Component::ParentDir))
    {
        return Err(AgentError::PermissionDenied(format!(
            "Path traversal attempt detected: {}",
            relative
        )));
    }
    Ok(dest_root.join(path))
}
