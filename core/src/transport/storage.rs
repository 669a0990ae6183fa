/// Shared-storage polling transport.
///
/// Each message becomes one JSON file under `messages/<target>/`. Files are
/// written under a dot-prefixed temporary name and renamed into place, so a
/// poller never observes a partial file. The listener polls its inbox at a
/// fixed interval and claims each file in name order by renaming it, emits
/// it, then deletes it.
use super::{emit, validate_target, DeliveryDetail, DeliveryReceipt, StrategyKind, Transport};
use crate::config::BridgeConfig;
use crate::errors::{BridgeError, BridgeResult};
use crate::message::Message;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MESSAGE_SUFFIX: &str = ".json";

/// File name for a message: sortable by creation time, unique by id.
pub fn message_file_name(message: &Message) -> String {
    let id: String = message
        .id()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{:013}-{}{}", message.timestamp().max(0), id, MESSAGE_SUFFIX)
}

/// Write `message` into `dir` with write-then-rename. Returns the final path.
pub async fn write_atomic(dir: &Path, message: &Message) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;

    let name = message_file_name(message);
    let final_path = dir.join(&name);
    let tmp_path = dir.join(format!(".{}.tmp", name));
    let body = message
        .to_json()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    tokio::fs::write(&tmp_path, body.as_bytes()).await?;
    if let Err(e) = tokio::fs::rename(&tmp_path, &final_path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }
    Ok(final_path)
}

/// Complete message files currently in `dir`, oldest first.
async fn pending_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') || !name.ends_with(MESSAGE_SUFFIX) {
            continue;
        }
        files.push(entry.path());
    }
    files.sort();
    Ok(files)
}

/// Claimed copy of an inbox file: dot-prefixed, so no poller lists it.
fn claimed_path(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    Some(path.with_file_name(format!(".{}.claimed", name)))
}

/// Claim, emit and delete every message file in `dir`. A file is renamed
/// to its claimed name before it is read and deleted only once the sink has
/// accepted it; if the emit is cancelled the claim is undone so the message
/// stays in the inbox. Malformed files are logged and removed so they are
/// not re-read on every pass. Returns false when the listener should stop.
pub(crate) async fn drain_inbox(
    dir: &Path,
    sink: &mpsc::Sender<Message>,
    cancel: &CancellationToken,
) -> bool {
    let files = match pending_files(dir).await {
        Ok(files) => files,
        Err(e) => {
            warn!("Failed to scan inbox {:?}: {}", dir, e);
            return true;
        }
    };

    for path in files {
        let Some(claimed) = claimed_path(&path) else {
            continue;
        };
        match tokio::fs::rename(&path, &claimed).await {
            Ok(()) => {}
            // Another poller claimed it first.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                warn!("Failed to claim {:?}: {}", path, e);
                continue;
            }
        }

        let parsed = match tokio::fs::read_to_string(&claimed).await {
            Ok(content) => Message::from_json(&content).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        let message = match parsed {
            Ok(message) => message,
            Err(e) => {
                warn!("Discarding malformed message file {:?}: {}", path, e);
                remove_claimed(&claimed).await;
                continue;
            }
        };

        debug!("Inbox {:?} received message {}", dir, message.id());
        if !emit(sink, cancel, message).await {
            if let Err(e) = tokio::fs::rename(&claimed, &path).await {
                warn!("Failed to return {:?} to the inbox: {}", path, e);
            }
            return false;
        }
        remove_claimed(&claimed).await;
    }
    true
}

async fn remove_claimed(claimed: &Path) {
    if let Err(e) = tokio::fs::remove_file(claimed).await {
        warn!("Failed to remove {:?}: {}", claimed, e);
    }
}

/// Shared-storage polling transport
pub struct SharedStorageTransport {
    root: PathBuf,
    interval: Duration,
}

impl SharedStorageTransport {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            root: config.messages_dir(),
            interval: Duration::from_millis(config.polling.interval_ms.max(1)),
        }
    }

    /// Inbox directory for a target identity
    pub fn inbox(&self, target: &str) -> PathBuf {
        self.root.join(target)
    }
}

#[async_trait]
impl Transport for SharedStorageTransport {
    fn kind(&self) -> StrategyKind {
        StrategyKind::SharedStorage
    }

    fn can_listen(&self) -> bool {
        true
    }

    async fn send(&self, target: &str, message: &Message) -> BridgeResult<DeliveryReceipt> {
        validate_target(self.kind(), target)?;

        let path = write_atomic(&self.inbox(target), message)
            .await
            .map_err(|e| BridgeError::delivery(self.kind(), target, e))?;

        debug!("Wrote message {} to {:?}", message.id(), path);
        Ok(DeliveryReceipt::delivered(
            self.kind(),
            target,
            message,
            DeliveryDetail::Storage { path },
        ))
    }

    async fn listen(
        &self,
        identity: &str,
        sink: mpsc::Sender<Message>,
        cancel: CancellationToken,
    ) -> BridgeResult<JoinHandle<()>> {
        validate_target(self.kind(), identity)?;

        let dir = self.inbox(identity);
        tokio::fs::create_dir_all(&dir).await?;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("Polling {:?} every {:?}", dir, self.interval);
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if !drain_inbox(&dir, &sink, &cancel).await {
                            break;
                        }
                    }
                }
            }
            debug!("Stopped polling {:?}", dir);
        }))
    }
}
