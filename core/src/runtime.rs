/// Container runtime client.
///
/// A thin accessor over the host's container management facility. The bridge
/// only inspects and executes inside containers that already exist; it never
/// creates, stops or removes them.
///
/// ```text
/// ContainerRuntime
///   ├── list_containers()   running containers by name
///   ├── is_running()        single-container liveness
///   ├── inspect()           state and host pid
///   ├── exec_once()         one-shot command, captured output
///   ├── exec_with_input()   one-shot command with stdin streamed in
///   └── processes()         `ps` inside the container, parsed
/// ```
use crate::config::RuntimeConfig;
use crate::errors::{BridgeError, BridgeResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// A running container as reported by the runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub name: String,
    pub status: String,
}

/// Container state as reported by inspect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub name: String,
    pub running: bool,
    /// Host pid of the container's init process (0 when not running)
    pub pid: u32,
}

/// A process inside a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Controlling terminal relative to /dev (e.g. "pts/0"); None if detached
    pub tty: Option<String>,
    pub command: String,
}

impl ProcessInfo {
    /// Absolute path of the controlling terminal device.
    pub fn tty_device(&self) -> Option<String> {
        self.tty.as_ref().map(|tty| format!("/dev/{}", tty))
    }
}

/// Output of a one-shot command
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Command used to enumerate processes inside a container.
pub fn ps_command() -> Vec<String> {
    vec!["ps".into(), "-eo".into(), "pid=,tty=,comm=".into()]
}

/// Parse `ps -eo pid=,tty=,comm=` output. Lines that do not start with a
/// numeric pid are skipped.
pub fn parse_ps_output(output: &str) -> Vec<ProcessInfo> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let pid = fields.next()?.parse().ok()?;
            let tty = fields.next()?;
            let command = fields.collect::<Vec<_>>().join(" ");
            if command.is_empty() {
                return None;
            }
            let tty = match tty {
                "?" | "-" => None,
                other => Some(other.to_string()),
            };
            Some(ProcessInfo { pid, tty, command })
        })
        .collect()
}

/// Trait for container runtime implementations
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List running containers
    async fn list_containers(&self) -> BridgeResult<Vec<ContainerSummary>>;

    /// Inspect a container's state
    async fn inspect(&self, name: &str) -> BridgeResult<ContainerInfo>;

    /// Execute a one-shot command inside the container's namespace
    async fn exec_once(&self, name: &str, command: &[String]) -> BridgeResult<ExecOutput>;

    /// Execute a one-shot command with `input` streamed to its stdin
    async fn exec_with_input(
        &self,
        name: &str,
        command: &[String],
        input: &[u8],
    ) -> BridgeResult<ExecOutput>;

    /// Whether the named container exists and is running
    async fn is_running(&self, name: &str) -> BridgeResult<bool> {
        let containers = self.list_containers().await?;
        Ok(containers.iter().any(|c| c.name == name))
    }

    /// Processes running inside the container
    async fn processes(&self, name: &str) -> BridgeResult<Vec<ProcessInfo>> {
        let output = self.exec_once(name, &ps_command()).await?;
        if !output.success() {
            return Err(BridgeError::Runtime(format!(
                "ps failed in {} (exit {}): {}",
                name,
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(parse_ps_output(&output.stdout))
    }
}

/// Docker-compatible CLI runtime (docker, podman, nerdctl)
pub struct DockerCli {
    binary: String,
    timeout: Duration,
}

impl DockerCli {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            timeout: Duration::from_millis(config.command_timeout_ms),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, args: Vec<String>, input: Option<&[u8]>) -> BridgeResult<ExecOutput> {
        debug!("{} {}", self.binary, args.join(" "));

        let mut cmd = self.command(&args);
        if input.is_some() {
            cmd.stdin(Stdio::piped());
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| BridgeError::Runtime(format!("Failed to run {}: {}", self.binary, e)))?;

        let run = async {
            if let (Some(bytes), Some(mut stdin)) = (input, child.stdin.take()) {
                stdin.write_all(bytes).await?;
                stdin.shutdown().await?;
            }
            child.wait_with_output().await
        };

        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| BridgeError::Timeout {
                waited: self.timeout,
                operation: format!("{} {}", self.binary, args.first().map_or("", |a| a.as_str())),
            })??;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    fn exec_args(name: &str, command: &[String], interactive: bool) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if interactive {
            args.push("-i".to_string());
        }
        args.push(name.to_string());
        args.extend(command.iter().cloned());
        args
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn list_containers(&self) -> BridgeResult<Vec<ContainerSummary>> {
        let output = self
            .run(
                vec![
                    "ps".into(),
                    "--format".into(),
                    "{{.Names}}\t{{.Status}}".into(),
                ],
                None,
            )
            .await?;
        if !output.success() {
            return Err(BridgeError::Runtime(output.stderr.trim().to_string()));
        }

        Ok(output
            .stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                let (name, status) = line.split_once('\t').unwrap_or((line, ""));
                ContainerSummary {
                    name: name.trim().to_string(),
                    status: status.trim().to_string(),
                }
            })
            .collect())
    }

    async fn inspect(&self, name: &str) -> BridgeResult<ContainerInfo> {
        let output = self
            .run(
                vec![
                    "inspect".into(),
                    "--format".into(),
                    "{{.State.Running}} {{.State.Pid}}".into(),
                    name.to_string(),
                ],
                None,
            )
            .await?;
        if !output.success() {
            return Err(inspect_failure(name, &output));
        }

        let mut fields = output.stdout.split_whitespace();
        let running = fields.next() == Some("true");
        let pid = fields.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        Ok(ContainerInfo {
            name: name.to_string(),
            running,
            pid,
        })
    }

    async fn exec_once(&self, name: &str, command: &[String]) -> BridgeResult<ExecOutput> {
        self.run(Self::exec_args(name, command, false), None).await
    }

    async fn exec_with_input(
        &self,
        name: &str,
        command: &[String],
        input: &[u8],
    ) -> BridgeResult<ExecOutput> {
        self.run(Self::exec_args(name, command, true), Some(input))
            .await
    }

    async fn is_running(&self, name: &str) -> BridgeResult<bool> {
        match self.inspect(name).await {
            Ok(info) => Ok(info.running),
            Err(BridgeError::UnknownTarget(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Only a "no such object/container" answer means the target is absent;
/// anything else (daemon down, permission denied) is a runtime failure.
fn inspect_failure(name: &str, output: &ExecOutput) -> BridgeError {
    let stderr = output.stderr.to_ascii_lowercase();
    if stderr.contains("no such object") || stderr.contains("no such container") {
        BridgeError::UnknownTarget(name.to_string())
    } else {
        BridgeError::Runtime(format!(
            "inspect {} exited with {}: {}",
            name,
            output.exit_code,
            output.stderr.trim()
        ))
    }
}
