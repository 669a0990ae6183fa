// Parley: inter-container messaging bridge
// Core library providing transports, strategy fallback, listeners and request/response correlation

pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod correlator;
pub mod errors;
pub mod logging;
pub mod message;
pub mod registry;
pub mod runtime;
pub mod selector;
pub mod transport;

// Re-export commonly used types
pub use errors::{BridgeError, BridgeResult, StrategyFailure};

pub use message::{generate_message_id, EnvelopeKind, Message};

pub use bridge::{Bridge, BridgeBuilder, BridgeEvent, MessageHandler, RequestOptions};

pub use coordinator::{BroadcastOutcome, BroadcastReport, DeliveryCoordinator};

pub use correlator::{Correlator, PendingResponse};

pub use registry::ListenerRegistry;

pub use selector::StrategySelector;

pub use transport::{
    DeliveryDetail, DeliveryReceipt, ExecTransport, ListenOptions, NamedPipeTransport,
    SendOptions, SharedStorageTransport, SignalTransport, StrategyKind, TerminalTransport,
    Transport,
};

pub use runtime::{
    ContainerInfo, ContainerRuntime, ContainerSummary, DockerCli, ExecOutput, ProcessInfo,
};

pub use config::{
    BridgeConfig, ConfigManager, EventConfig, ExecConfig, LoggingConfig, PipeConfig,
    PollingConfig, RequestConfig, RetryPolicy, RuntimeConfig, SignalConfig, TerminalConfig,
};

pub use logging::init_tracing;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
