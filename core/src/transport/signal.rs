/// Signal-triggered transport.
///
/// The sender drops the message into the target's signal inbox
/// (`signals/<target>/`) and then sends a user-defined signal to a process
/// inside the target, telling it to re-read that inbox. Success means the
/// signal was delivered, not that it was handled.
///
/// Listening installs a process-wide handler with `sigaction`, shared by
/// every listener waiting on the same signal. The handler only writes a
/// byte to a self-pipe; a reader task turns those bytes into wakeups. When
/// the last listener for a signal exits, the disposition that was in place
/// before the first one started is restored.
use super::storage::{drain_inbox, write_atomic};
use super::terminal::command_matches;
use super::{validate_target, DeliveryDetail, DeliveryReceipt, StrategyKind, Transport};
use crate::config::{BridgeConfig, SignalConfig};
use crate::errors::{BridgeError, BridgeResult};
use crate::message::Message;
use crate::runtime::{ContainerRuntime, ProcessInfo};
use async_trait::async_trait;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use parking_lot::Mutex;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::os::raw::c_int;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pid to signal: the first allow-listed process, else the container's init.
pub fn select_signal_target(processes: &[ProcessInfo], shell_names: &[String]) -> u32 {
    processes
        .iter()
        .find(|p| shell_names.iter().any(|name| command_matches(&p.command, name)))
        .map_or(1, |p| p.pid)
}

const NO_FD: AtomicI32 = AtomicI32::new(-1);

/// Write end of each signal's self-pipe, indexed by signal number.
static WAKE_FDS: [AtomicI32; 65] = [NO_FD; 65];

static REGISTRATIONS: Mutex<Vec<Registration>> = parking_lot::const_mutex(Vec::new());

extern "C" fn forward_signal(signo: c_int) {
    let Some(slot) = usize::try_from(signo).ok().and_then(|i| WAKE_FDS.get(i)) else {
        return;
    };
    let fd = slot.load(Ordering::SeqCst);
    if fd >= 0 {
        // SAFETY: the descriptor is closed only after the slot is cleared
        // and the previous disposition is back in place.
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        // A full pipe already holds a pending wakeup.
        let _ = nix::unistd::write(fd, &[1u8]);
    }
}

fn wake_slot(signal: Signal) -> BridgeResult<&'static AtomicI32> {
    usize::try_from(signal as i32)
        .ok()
        .and_then(|i| WAKE_FDS.get(i))
        .ok_or_else(|| BridgeError::Config(format!("Unsupported signal {}", signal)))
}

struct Registration {
    signal: Signal,
    previous: SigAction,
    listeners: usize,
    wake: watch::Sender<u64>,
    reader: JoinHandle<()>,
    // Kept open while the handler may write to it.
    _writer: pipe::Sender,
}

async fn pump_wakeups(mut receiver: pipe::Receiver, wake: watch::Sender<u64>) {
    let mut buf = [0u8; 64];
    loop {
        match receiver.read(&mut buf).await {
            Ok(0) => break,
            Ok(_) => wake.send_modify(|count| *count = count.wrapping_add(1)),
            Err(e) => {
                warn!("Signal wakeup pipe failed: {}", e);
                break;
            }
        }
    }
}

/// One listener's share of a process-wide signal handler. Dropping the
/// last subscription for a signal restores its previous disposition.
pub(crate) struct SignalSubscription {
    signal: Signal,
    wake: watch::Receiver<u64>,
}

impl SignalSubscription {
    /// Must be called inside a Tokio runtime.
    pub(crate) fn install(signal: Signal) -> BridgeResult<Self> {
        let mut registrations = REGISTRATIONS.lock();
        if let Some(existing) = registrations.iter_mut().find(|r| r.signal == signal) {
            existing.listeners += 1;
            return Ok(Self {
                signal,
                wake: existing.wake.subscribe(),
            });
        }

        let slot = wake_slot(signal)?;
        let (writer, receiver) = pipe::pipe()?;
        slot.store(writer.as_raw_fd(), Ordering::SeqCst);

        let action = SigAction::new(
            SigHandler::Handler(forward_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        // SAFETY: the handler only loads an atomic and calls write(2).
        let previous = match unsafe { sigaction(signal, &action) } {
            Ok(previous) => previous,
            Err(errno) => {
                slot.store(-1, Ordering::SeqCst);
                return Err(std::io::Error::from(errno).into());
            }
        };

        let (wake, rx) = watch::channel(0u64);
        let reader = tokio::spawn(pump_wakeups(receiver, wake.clone()));
        registrations.push(Registration {
            signal,
            previous,
            listeners: 1,
            wake,
            reader,
            _writer: writer,
        });
        debug!("Installed {} handler", signal);
        Ok(Self { signal, wake: rx })
    }

    /// Wait for the next delivery of the signal. False once the
    /// registration is gone.
    pub(crate) async fn recv(&mut self) -> bool {
        self.wake.changed().await.is_ok()
    }
}

impl Drop for SignalSubscription {
    fn drop(&mut self) {
        let mut registrations = REGISTRATIONS.lock();
        let Some(index) = registrations.iter().position(|r| r.signal == self.signal) else {
            return;
        };
        registrations[index].listeners -= 1;
        if registrations[index].listeners > 0 {
            return;
        }

        let registration = registrations.swap_remove(index);
        // SAFETY: restores the disposition captured at install time.
        if let Err(e) = unsafe { sigaction(self.signal, &registration.previous) } {
            warn!("Failed to restore {} disposition: {}", self.signal, e);
        }
        if let Ok(slot) = wake_slot(self.signal) {
            slot.store(-1, Ordering::SeqCst);
        }
        registration.reader.abort();
        debug!("Restored {} disposition", self.signal);
    }
}

/// Signal-triggered transport
pub struct SignalTransport {
    runtime: Arc<dyn ContainerRuntime>,
    root: PathBuf,
    signal: SignalConfig,
    shell_names: Vec<String>,
}

impl SignalTransport {
    pub fn new(config: &BridgeConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            root: config.signals_dir(),
            signal: config.signal.clone(),
            shell_names: config.terminal.shell_names.clone(),
        }
    }

    /// Inbox directory re-read on every signal
    pub fn inbox(&self, target: &str) -> PathBuf {
        self.root.join(target)
    }

    async fn notify(&self, target: &str, signal_name: &str) -> Result<u32, String> {
        let pid = match self.runtime.processes(target).await {
            Ok(processes) => select_signal_target(&processes, &self.shell_names),
            Err(e) => {
                debug!("Process discovery failed in {} ({}), signalling pid 1", target, e);
                1
            }
        };

        let command = vec![
            "kill".to_string(),
            "-s".to_string(),
            signal_name.to_string(),
            pid.to_string(),
        ];
        let output = self
            .runtime
            .exec_once(target, &command)
            .await
            .map_err(|e| e.to_string())?;
        if output.success() {
            Ok(pid)
        } else {
            Err(format!(
                "kill -s {} {} exited {}: {}",
                signal_name,
                pid,
                output.exit_code,
                output.stderr.trim()
            ))
        }
    }
}

#[async_trait]
impl Transport for SignalTransport {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Signal
    }

    fn can_listen(&self) -> bool {
        true
    }

    async fn send(&self, target: &str, message: &Message) -> BridgeResult<DeliveryReceipt> {
        validate_target(self.kind(), target)?;

        let signal = self
            .signal
            .resolve()
            .map_err(|e| BridgeError::delivery(self.kind(), target, e))?;
        let signal_name = signal.as_str().trim_start_matches("SIG");

        let inbox = self.inbox(target);
        let path = write_atomic(&inbox, message)
            .await
            .map_err(|e| BridgeError::delivery(self.kind(), target, e))?;

        match self.notify(target, signal_name).await {
            Ok(pid) => {
                debug!("Signalled pid {} in {} for message {}", pid, target, message.id());
                Ok(DeliveryReceipt::delivered(
                    self.kind(),
                    target,
                    message,
                    DeliveryDetail::Signal {
                        pid,
                        signal: signal.as_str().to_string(),
                        inbox,
                    },
                ))
            }
            Err(reason) => {
                // Nobody was told to look, so the next strategy must not
                // race a late reader of this file.
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!("Failed to withdraw {:?}: {}", path, e);
                }
                Err(BridgeError::delivery(self.kind(), target, reason))
            }
        }
    }

    async fn listen(
        &self,
        identity: &str,
        sink: mpsc::Sender<Message>,
        cancel: CancellationToken,
    ) -> BridgeResult<JoinHandle<()>> {
        validate_target(self.kind(), identity)?;

        let signal = self.signal.resolve()?;
        let dir = self.inbox(identity);
        tokio::fs::create_dir_all(&dir).await?;
        let mut subscription = SignalSubscription::install(signal)?;

        info!("Draining {:?} on {}", dir, self.signal.signal);
        Ok(tokio::spawn(async move {
            // Pick up anything that arrived while nobody was listening.
            if drain_inbox(&dir, &sink, &cancel).await {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        received = subscription.recv() => {
                            if !received || !drain_inbox(&dir, &sink, &cancel).await {
                                break;
                            }
                        }
                    }
                }
            }
            drop(subscription);
            debug!("Stopped signal listener for {:?}", dir);
        }))
    }
}
