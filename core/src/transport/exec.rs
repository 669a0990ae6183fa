/// Ephemeral-exec transport.
///
/// Spawns a one-shot command in the target that prints a framed rendering of
/// the message to the target's primary output stream. Works wherever the
/// runtime can exec; the only confirmation is the command's exit status.
use super::{validate_target, DeliveryDetail, DeliveryReceipt, StrategyKind, Transport};
use crate::config::BridgeConfig;
use crate::errors::{BridgeError, BridgeResult};
use crate::message::{render_terminal_block, shell_quote, Message};
use crate::runtime::ContainerRuntime;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Ephemeral-exec transport
pub struct ExecTransport {
    runtime: Arc<dyn ContainerRuntime>,
    output_path: String,
}

impl ExecTransport {
    pub fn new(config: &BridgeConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            output_path: config.exec.output_path.clone(),
        }
    }

    /// Shell command that prints `message` to the configured output path.
    pub fn print_command(&self, message: &Message) -> Vec<String> {
        let block = render_terminal_block(message);
        vec![
            "sh".to_string(),
            "-c".to_string(),
            format!(
                "printf '%s' {} > {}",
                shell_quote(&block),
                shell_quote(&self.output_path)
            ),
        ]
    }
}

#[async_trait]
impl Transport for ExecTransport {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Exec
    }

    fn can_listen(&self) -> bool {
        false
    }

    async fn send(&self, target: &str, message: &Message) -> BridgeResult<DeliveryReceipt> {
        validate_target(self.kind(), target)?;

        let output = self
            .runtime
            .exec_once(target, &self.print_command(message))
            .await
            .map_err(|e| BridgeError::delivery(self.kind(), target, e))?;

        if !output.success() {
            return Err(BridgeError::delivery(
                self.kind(),
                target,
                format!("exit status {}: {}", output.exit_code, output.stderr.trim()),
            ));
        }

        debug!("Printed message {} inside {}", message.id(), target);
        Ok(DeliveryReceipt::delivered(
            self.kind(),
            target,
            message,
            DeliveryDetail::Exec {
                exit_code: output.exit_code,
            },
        ))
    }
}
