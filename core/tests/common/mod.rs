//! Shared fixtures for integration tests: a scripted container runtime and
//! config helpers rooted in a temp directory.
#![allow(dead_code)]

use async_trait::async_trait;
use parley_core::{
    BridgeConfig, BridgeError, BridgeResult, ContainerInfo, ContainerRuntime, ContainerSummary,
    ExecOutput, RetryPolicy,
};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// One command the runtime was asked to execute
#[derive(Debug, Clone)]
pub struct ExecCall {
    pub container: String,
    pub command: Vec<String>,
    pub input: Option<Vec<u8>>,
}

/// In-memory runtime with canned answers and a call log
#[derive(Default)]
pub struct ScriptedRuntime {
    running: Mutex<HashSet<String>>,
    ps_output: Mutex<String>,
    calls: Mutex<Vec<ExecCall>>,
    exec_exit_code: AtomicI32,
    raise_on_kill: AtomicBool,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_running(names: &[&str]) -> Self {
        let runtime = Self::new();
        for name in names {
            runtime.set_running(name);
        }
        runtime
    }

    pub fn set_running(&self, name: &str) {
        self.running.lock().unwrap().insert(name.to_string());
    }

    pub fn set_ps_output(&self, output: &str) {
        *self.ps_output.lock().unwrap() = output.to_string();
    }

    /// Exit code returned by every non-ps exec
    pub fn fail_exec_with(&self, exit_code: i32) {
        self.exec_exit_code.store(exit_code, Ordering::SeqCst);
    }

    /// Raise SIGUSR1 in this process whenever a `kill` is executed, standing
    /// in for the signal reaching a process inside the target container.
    pub fn raise_on_kill(&self) {
        self.raise_on_kill.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<ExecCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls whose program is `program`
    pub fn calls_to(&self, program: &str) -> Vec<ExecCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.command.first().map(String::as_str) == Some(program))
            .collect()
    }

    fn record(&self, name: &str, command: &[String], input: Option<&[u8]>) -> ExecOutput {
        self.calls.lock().unwrap().push(ExecCall {
            container: name.to_string(),
            command: command.to_vec(),
            input: input.map(<[u8]>::to_vec),
        });

        if command.first().map(String::as_str) == Some("ps") {
            return ExecOutput {
                stdout: self.ps_output.lock().unwrap().clone(),
                stderr: String::new(),
                exit_code: 0,
            };
        }

        let exit_code = self.exec_exit_code.load(Ordering::SeqCst);
        if exit_code == 0
            && command.first().map(String::as_str) == Some("kill")
            && self.raise_on_kill.load(Ordering::SeqCst)
        {
            nix::sys::signal::raise(nix::sys::signal::Signal::SIGUSR1).unwrap();
        }

        ExecOutput {
            stdout: String::new(),
            stderr: if exit_code == 0 {
                String::new()
            } else {
                "scripted failure".to_string()
            },
            exit_code,
        }
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    async fn list_containers(&self) -> BridgeResult<Vec<ContainerSummary>> {
        let mut names: Vec<_> = self.running.lock().unwrap().iter().cloned().collect();
        names.sort();
        Ok(names
            .into_iter()
            .map(|name| ContainerSummary {
                name,
                status: "Up 5 minutes".to_string(),
            })
            .collect())
    }

    async fn inspect(&self, name: &str) -> BridgeResult<ContainerInfo> {
        if self.running.lock().unwrap().contains(name) {
            Ok(ContainerInfo {
                name: name.to_string(),
                running: true,
                pid: 4242,
            })
        } else {
            Err(BridgeError::UnknownTarget(name.to_string()))
        }
    }

    async fn exec_once(&self, name: &str, command: &[String]) -> BridgeResult<ExecOutput> {
        Ok(self.record(name, command, None))
    }

    async fn exec_with_input(
        &self,
        name: &str,
        command: &[String],
        input: &[u8],
    ) -> BridgeResult<ExecOutput> {
        Ok(self.record(name, command, Some(input)))
    }
}

/// Fast-polling config rooted at `root` with a single delivery attempt
pub fn test_config(identity: &str, root: &Path) -> BridgeConfig {
    let mut config = BridgeConfig::new(identity, root);
    config.retry = RetryPolicy::once();
    config.polling.interval_ms = 20;
    config.pipe.open_timeout_ms = 50;
    config.runtime.verify_targets = false;
    config
}

/// Poll `check` until it holds or `within` elapses.
pub async fn eventually<F: Fn() -> bool>(within: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
