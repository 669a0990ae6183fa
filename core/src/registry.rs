/// Listener registry.
///
/// Runs at most one listener per (strategy, identity) pair and merges every
/// listener's inbound messages into a single bounded queue owned by the
/// bridge. Stopping cancels each listener and waits for its task to exit, so
/// no descriptor, timer or signal handler outlives `stop`.
use crate::errors::{BridgeError, BridgeResult};
use crate::message::Message;
use crate::selector::StrategySelector;
use crate::transport::{ListenOptions, StrategyKind};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type ListenerKey = (StrategyKind, String);

struct ActiveListener {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ActiveListener {
    async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                warn!("Listener task ended abnormally: {}", e);
            }
        }
    }
}

struct RegistryState {
    active: HashMap<ListenerKey, ActiveListener>,
    sink: mpsc::Sender<Message>,
}

pub struct ListenerRegistry {
    selector: Arc<StrategySelector>,
    // Held across listener setup so two concurrent `listen` calls cannot
    // start the same pair twice.
    state: Mutex<RegistryState>,
    root: CancellationToken,
}

impl ListenerRegistry {
    pub fn new(selector: Arc<StrategySelector>, sink: mpsc::Sender<Message>) -> Self {
        Self {
            selector,
            state: Mutex::new(RegistryState {
                active: HashMap::new(),
                sink,
            }),
            root: CancellationToken::new(),
        }
    }

    /// Start listeners for `identity`. Pairs already running are reused.
    /// Strategies that cannot listen are skipped; if nothing could be
    /// started the first error is returned. Returns the strategies now
    /// listening for `identity` from this call's selection.
    pub async fn listen(
        &self,
        identity: &str,
        options: &ListenOptions,
    ) -> BridgeResult<Vec<StrategyKind>> {
        let kinds = options
            .strategies
            .clone()
            .unwrap_or_else(|| self.selector.listening_kinds());

        let mut state = self.state.lock().await;
        let mut listening = Vec::new();
        let mut first_error = None;

        for kind in kinds {
            let key = (kind, identity.to_string());
            if let Some(existing) = state.active.get(&key) {
                if !existing.task.is_finished() {
                    debug!("Reusing {} listener for {}", kind, identity);
                    listening.push(kind);
                    continue;
                }
            }

            let Some(transport) = self.selector.get(kind) else {
                warn!("Strategy {} is not configured", kind);
                first_error.get_or_insert(BridgeError::Config(format!(
                    "Strategy {} is not configured",
                    kind
                )));
                continue;
            };

            let cancel = self.root.child_token();
            match transport
                .listen(identity, state.sink.clone(), cancel.clone())
                .await
            {
                Ok(task) => {
                    if let Some(stale) = state.active.insert(key, ActiveListener { cancel, task })
                    {
                        stale.shutdown().await;
                    }
                    listening.push(kind);
                }
                Err(e) => {
                    if e.is_capability() {
                        debug!("Skipping {} for {}: {}", kind, identity, e);
                    } else {
                        warn!("Failed to start {} listener for {}: {}", kind, identity, e);
                    }
                    first_error.get_or_insert(e);
                }
            }
        }

        match (listening.is_empty(), first_error) {
            (true, Some(e)) => Err(e),
            _ => {
                info!("Listening for {} via {:?}", identity, listening);
                Ok(listening)
            }
        }
    }

    /// Stop every listener. Idempotent.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        Self::stop_all(&mut state).await;
    }

    /// Stop every listener, then point listeners started afterwards at
    /// `sink`. Nothing can start in between, so messages already queued on
    /// the old sink are the only ones left behind.
    pub async fn stop_and_redirect(&self, sink: mpsc::Sender<Message>) {
        let mut state = self.state.lock().await;
        Self::stop_all(&mut state).await;
        state.sink = sink;
    }

    async fn stop_all(state: &mut RegistryState) {
        let drained: Vec<_> = state.active.drain().collect();
        if drained.is_empty() {
            return;
        }
        let count = drained.len();
        for (_, listener) in drained {
            listener.shutdown().await;
        }
        info!("Stopped {} listener(s)", count);
    }

    /// Stop only the listeners for `identity`.
    pub async fn stop_identity(&self, identity: &str) {
        let stopped: Vec<ActiveListener> = {
            let mut state = self.state.lock().await;
            let keys: Vec<_> = state
                .active
                .keys()
                .filter(|(_, id)| id == identity)
                .cloned()
                .collect();
            keys.iter().filter_map(|k| state.active.remove(k)).collect()
        };
        for listener in stopped {
            listener.shutdown().await;
        }
    }

    /// (strategy, identity) pairs currently running
    pub async fn active(&self) -> Vec<(StrategyKind, String)> {
        let mut pairs: Vec<_> = self
            .state
            .lock()
            .await
            .active
            .iter()
            .filter(|(_, l)| !l.task.is_finished())
            .map(|(k, _)| k.clone())
            .collect();
        pairs.sort();
        pairs
    }
}

impl Drop for ListenerRegistry {
    fn drop(&mut self) {
        self.root.cancel();
    }
}
