//! Transport strategies.
//!
//! Each strategy knows how to deliver one message to one named target and,
//! optionally, how to surface inbound messages for a target identity as a
//! background listener. The set of strategies is closed ([`StrategyKind`]);
//! the selector dispatches purely through the [`Transport`] trait.

pub mod exec;
pub mod pipe;
pub mod signal;
pub mod storage;
pub mod terminal;

pub use exec::ExecTransport;
pub use pipe::NamedPipeTransport;
pub use signal::SignalTransport;
pub use storage::SharedStorageTransport;
pub use terminal::TerminalTransport;

use crate::config::BridgeConfig;
use crate::errors::{BridgeError, BridgeResult};
use crate::message::Message;
use crate::runtime::ContainerRuntime;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Transport strategy variants, in fixed preference order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    NamedPipe,
    TerminalDevice,
    Signal,
    Exec,
    SharedStorage,
}

impl StrategyKind {
    /// Every variant, fastest first and most reliable last.
    pub const PREFERENCE: [StrategyKind; 5] = [
        StrategyKind::NamedPipe,
        StrategyKind::TerminalDevice,
        StrategyKind::Signal,
        StrategyKind::Exec,
        StrategyKind::SharedStorage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::NamedPipe => "named-pipe",
            StrategyKind::TerminalDevice => "terminal-device",
            StrategyKind::Signal => "signal",
            StrategyKind::Exec => "exec",
            StrategyKind::SharedStorage => "shared-storage",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StrategyKind::PREFERENCE
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| BridgeError::Config(format!("Unknown strategy: {}", s)))
    }
}

/// Strategy-specific diagnostics attached to a successful delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DeliveryDetail {
    Pipe { path: PathBuf },
    Terminal { device: String },
    Signal { pid: u32, signal: String, inbox: PathBuf },
    Exec { exit_code: i32 },
    Storage { path: PathBuf },
}

/// Outcome of one strategy's delivery attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub strategy: StrategyKind,
    pub success: bool,
    pub target: String,
    pub message_id: String,
    /// Epoch milliseconds at which delivery completed
    pub timestamp: i64,
    pub detail: DeliveryDetail,
}

impl DeliveryReceipt {
    pub fn delivered(
        strategy: StrategyKind,
        target: &str,
        message: &Message,
        detail: DeliveryDetail,
    ) -> Self {
        Self {
            strategy,
            success: true,
            target: target.to_string(),
            message_id: message.id().to_string(),
            timestamp: crate::message::now_millis(),
            detail,
        }
    }
}

/// Per-call send options
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Force a single strategy; no fallback occurs
    pub strategy: Option<StrategyKind>,
    /// Override the coordinator's retry policy
    pub retry: Option<crate::config::RetryPolicy>,
}

impl SendOptions {
    pub fn via(strategy: StrategyKind) -> Self {
        Self {
            strategy: Some(strategy),
            retry: None,
        }
    }
}

/// Per-call listen options
#[derive(Debug, Clone, Default)]
pub struct ListenOptions {
    /// Strategies to listen with; None means every strategy that can listen
    pub strategies: Option<Vec<StrategyKind>>,
}

impl ListenOptions {
    pub fn only(strategies: impl IntoIterator<Item = StrategyKind>) -> Self {
        Self {
            strategies: Some(strategies.into_iter().collect()),
        }
    }
}

/// Trait for message transport implementations
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which variant this is
    fn kind(&self) -> StrategyKind;

    /// Whether `listen` can ever succeed
    fn can_listen(&self) -> bool;

    /// Deliver one message to one target
    async fn send(&self, target: &str, message: &Message) -> BridgeResult<DeliveryReceipt>;

    /// Start a background listener for `identity`. Setup happens before this
    /// returns, so setup failures surface here. The returned task emits
    /// parsed messages into `sink` until `cancel` fires, and releases every
    /// resource it holds when it exits.
    async fn listen(
        &self,
        identity: &str,
        sink: mpsc::Sender<Message>,
        cancel: CancellationToken,
    ) -> BridgeResult<JoinHandle<()>> {
        let _ = (identity, sink, cancel);
        Err(BridgeError::Capability {
            strategy: self.kind(),
            operation: "listen",
        })
    }
}

/// Whether `name` is usable as a target identity: `[A-Za-z0-9_.-]+`, and
/// never `.` or `..`.
pub fn is_valid_target(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// Reject target names that could escape the shared tree or a shell.
pub fn validate_target(strategy: StrategyKind, target: &str) -> BridgeResult<()> {
    if is_valid_target(target) {
        Ok(())
    } else {
        Err(BridgeError::delivery(
            strategy,
            target,
            format!("malformed target name {:?}", target),
        ))
    }
}

/// Forward one parsed message into the sink unless cancelled first.
/// Returns false when the listener should stop.
pub(crate) async fn emit(
    sink: &mpsc::Sender<Message>,
    cancel: &CancellationToken,
    message: Message,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = sink.send(message) => sent.is_ok(),
    }
}

/// The five standard strategies in preference order.
pub fn standard_transports(
    config: &BridgeConfig,
    runtime: Arc<dyn ContainerRuntime>,
) -> Vec<Arc<dyn Transport>> {
    vec![
        Arc::new(NamedPipeTransport::new(config)),
        Arc::new(TerminalTransport::new(config, Arc::clone(&runtime))),
        Arc::new(SignalTransport::new(config, Arc::clone(&runtime))),
        Arc::new(ExecTransport::new(config, Arc::clone(&runtime))),
        Arc::new(SharedStorageTransport::new(config)),
    ]
}
