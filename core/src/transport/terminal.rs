/// Terminal-device injection transport.
///
/// Finds the pseudo-terminal of the target's interactive process and writes a
/// framed, escaped rendering of the message straight to that device, so it
/// shows up in the session without the process reading anything.
///
/// Discovery is best-effort: the first process whose command name is on the
/// allow-list and that owns a terminal wins. A container running several
/// shells may get the wrong one. When nothing matches (or `ps` is missing),
/// the configured fallback device is used.
use super::{validate_target, DeliveryDetail, DeliveryReceipt, StrategyKind, Transport};
use crate::config::BridgeConfig;
use crate::errors::{BridgeError, BridgeResult};
use crate::message::{render_terminal_block, shell_quote, Message};
use crate::runtime::{ContainerRuntime, ProcessInfo};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Pick the terminal device of the first allow-listed process owning a tty.
pub fn select_terminal_device(
    processes: &[ProcessInfo],
    shell_names: &[String],
) -> Option<String> {
    processes
        .iter()
        .filter(|p| p.tty.is_some())
        .find(|p| shell_names.iter().any(|name| command_matches(&p.command, name)))
        .and_then(ProcessInfo::tty_device)
}

/// Match a `ps` command name against an allow-list entry. Login shells show
/// up with a leading dash ("-bash") and some ps builds print full paths.
pub(crate) fn command_matches(command: &str, name: &str) -> bool {
    let base = command.rsplit('/').next().unwrap_or(command);
    base.trim_start_matches('-') == name
}

/// Terminal-device injection transport
pub struct TerminalTransport {
    runtime: Arc<dyn ContainerRuntime>,
    shell_names: Vec<String>,
    fallback_device: String,
}

impl TerminalTransport {
    pub fn new(config: &BridgeConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            shell_names: config.terminal.shell_names.clone(),
            fallback_device: config.terminal.fallback_device.clone(),
        }
    }

    /// Resolve the device to write to inside `target`.
    pub async fn discover_device(&self, target: &str) -> String {
        match self.runtime.processes(target).await {
            Ok(processes) => select_terminal_device(&processes, &self.shell_names)
                .unwrap_or_else(|| {
                    debug!(
                        "No interactive process with a terminal in {}, using {}",
                        target, self.fallback_device
                    );
                    self.fallback_device.clone()
                }),
            Err(e) => {
                warn!("Process discovery failed in {}: {}", target, e);
                self.fallback_device.clone()
            }
        }
    }
}

#[async_trait]
impl Transport for TerminalTransport {
    fn kind(&self) -> StrategyKind {
        StrategyKind::TerminalDevice
    }

    fn can_listen(&self) -> bool {
        false
    }

    async fn send(&self, target: &str, message: &Message) -> BridgeResult<DeliveryReceipt> {
        validate_target(self.kind(), target)?;

        let device = self.discover_device(target).await;
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("cat > {}", shell_quote(&device)),
        ];
        let block = render_terminal_block(message);

        let output = self
            .runtime
            .exec_with_input(target, &command, block.as_bytes())
            .await
            .map_err(|e| BridgeError::delivery(self.kind(), target, e))?;

        if !output.success() {
            return Err(BridgeError::delivery(
                self.kind(),
                target,
                format!(
                    "write to {} exited {}: {}",
                    device,
                    output.exit_code,
                    output.stderr.trim()
                ),
            ));
        }

        debug!("Injected message {} into {}:{}", message.id(), target, device);
        Ok(DeliveryReceipt::delivered(
            self.kind(),
            target,
            message,
            DeliveryDetail::Terminal { device },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proc(pid: u32, tty: Option<&str>, command: &str) -> ProcessInfo {
        ProcessInfo {
            pid,
            tty: tty.map(str::to_string),
            command: command.to_string(),
        }
    }

    fn shells() -> Vec<String> {
        vec!["bash".to_string(), "claude".to_string()]
    }

    #[test]
    fn test_first_allow_listed_process_with_tty_wins() {
        let processes = vec![
            proc(1, None, "bash"),
            proc(8, Some("pts/4"), "vim"),
            proc(9, Some("pts/1"), "-bash"),
            proc(12, Some("pts/2"), "claude"),
        ];
        assert_eq!(
            select_terminal_device(&processes, &shells()),
            Some("/dev/pts/1".to_string())
        );
    }

    #[test]
    fn test_full_path_commands_match() {
        let processes = vec![proc(3, Some("pts/7"), "/usr/local/bin/claude")];
        assert_eq!(
            select_terminal_device(&processes, &shells()),
            Some("/dev/pts/7".to_string())
        );
    }

    #[test]
    fn test_no_match() {
        let processes = vec![proc(1, Some("pts/0"), "nginx")];
        assert_eq!(select_terminal_device(&processes, &shells()), None);
    }
}
