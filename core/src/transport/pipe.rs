/// Named-pipe (FIFO) transport.
///
/// One FIFO per target lives under `pipes/`. Opening a FIFO for writing
/// blocks at the OS level while no reader exists, so the writer opens
/// non-blocking and retries until a bounded deadline; no reader within the
/// deadline is a delivery failure. Messages are newline-delimited JSON.
/// Writes up to PIPE_BUF bytes are atomic, so concurrent writers of small
/// messages never interleave.
use super::{emit, validate_target, DeliveryDetail, DeliveryReceipt, StrategyKind, Transport};
use crate::config::BridgeConfig;
use crate::errors::{BridgeError, BridgeResult};
use crate::message::Message;
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::stat::Mode;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::pipe;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const OPEN_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// Create a FIFO at `path` unless one already exists.
pub async fn ensure_fifo(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        match nix::unistd::mkfifo(&path, Mode::from_bits_truncate(0o666)) {
            Ok(()) | Err(Errno::EEXIST) => Ok(()),
            Err(errno) => Err(std::io::Error::from(errno)),
        }
    })
    .await?
}

fn no_reader(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(Errno::ENXIO as i32)
}

/// Named-pipe transport
pub struct NamedPipeTransport {
    dir: PathBuf,
    open_timeout: Duration,
    write_timeout: Duration,
}

impl NamedPipeTransport {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            dir: config.pipes_dir(),
            open_timeout: Duration::from_millis(config.pipe.open_timeout_ms),
            write_timeout: Duration::from_millis(config.pipe.write_timeout_ms),
        }
    }

    /// FIFO path for a target identity
    pub fn pipe_path(&self, target: &str) -> PathBuf {
        self.dir.join(format!("{}.pipe", target))
    }

    /// Open the write end, waiting at most `open_timeout` for a reader.
    async fn open_writer(&self, path: &Path) -> Result<pipe::Sender, String> {
        let deadline = Instant::now() + self.open_timeout;
        loop {
            match pipe::OpenOptions::new().open_sender(path) {
                Ok(sender) => return Ok(sender),
                Err(e) if no_reader(&e) => {
                    if Instant::now() >= deadline {
                        return Err(format!(
                            "no reader on {:?} within {:?}",
                            path, self.open_timeout
                        ));
                    }
                    tokio::time::sleep(OPEN_RETRY_INTERVAL).await;
                }
                Err(e) => return Err(format!("cannot open {:?}: {}", path, e)),
            }
        }
    }
}

#[async_trait]
impl Transport for NamedPipeTransport {
    fn kind(&self) -> StrategyKind {
        StrategyKind::NamedPipe
    }

    fn can_listen(&self) -> bool {
        true
    }

    async fn send(&self, target: &str, message: &Message) -> BridgeResult<DeliveryReceipt> {
        validate_target(self.kind(), target)?;

        let path = self.pipe_path(target);
        ensure_fifo(&path)
            .await
            .map_err(|e| BridgeError::delivery(self.kind(), target, e))?;

        let mut sender = self
            .open_writer(&path)
            .await
            .map_err(|reason| BridgeError::delivery(self.kind(), target, reason))?;

        let mut line = message.to_json()?;
        line.push('\n');

        match tokio::time::timeout(self.write_timeout, sender.write_all(line.as_bytes())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(BridgeError::delivery(self.kind(), target, e)),
            Err(_) => {
                return Err(BridgeError::delivery(
                    self.kind(),
                    target,
                    format!("write to {:?} stalled for {:?}", path, self.write_timeout),
                ))
            }
        }

        debug!("Wrote message {} to {:?}", message.id(), path);
        Ok(DeliveryReceipt::delivered(
            self.kind(),
            target,
            message,
            DeliveryDetail::Pipe { path },
        ))
    }

    async fn listen(
        &self,
        identity: &str,
        sink: mpsc::Sender<Message>,
        cancel: CancellationToken,
    ) -> BridgeResult<JoinHandle<()>> {
        validate_target(self.kind(), identity)?;

        let path = self.pipe_path(identity);
        ensure_fifo(&path).await?;

        // Holding the pipe read-write keeps a writer attached, so the reader
        // never sees EOF between senders.
        let mut options = pipe::OpenOptions::new();
        #[cfg(target_os = "linux")]
        options.read_write(true);
        let receiver = options.open_receiver(&path)?;

        info!("Listening on pipe {:?}", path);
        Ok(tokio::spawn(async move {
            let mut lines = BufReader::new(receiver).lines();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) if line.trim().is_empty() => {}
                        Ok(Some(line)) => match Message::from_json(&line) {
                            Ok(message) => {
                                if !emit(&sink, &cancel, message).await {
                                    break;
                                }
                            }
                            Err(e) => warn!("Discarding malformed line on {:?}: {}", path, e),
                        },
                        Ok(None) => {
                            debug!("Pipe {:?} closed", path);
                            break;
                        }
                        Err(e) => {
                            warn!("Read error on {:?}: {}", path, e);
                            break;
                        }
                    },
                }
            }
            debug!("Stopped listening on pipe {:?}", path);
        }))
    }
}
