/// Messaging bridge: the public entry point.
///
/// ```text
/// Bridge
///   ├── send() / broadcast() ──> DeliveryCoordinator ──> StrategySelector ──> Transport*
///   ├── request() / respond() ─> Correlator + DeliveryCoordinator
///   ├── listen() / stop() ─────> ListenerRegistry ──> Transport::listen
///   └── dispatcher task: inbound queue ─┬─> Correlator::settle   (responses)
///                                       └─> subscribers + handlers (everything else)
/// ```
///
/// The bridge owns every long-lived resource (listeners, pending requests)
/// and releases them in `shutdown`. `stop` fences the inbound queue: once it
/// returns, messages that were queued but not yet dispatched are discarded
/// and later listeners feed a fresh queue.
use crate::config::{BridgeConfig, ConfigManager};
use crate::coordinator::{BroadcastReport, DeliveryCoordinator};
use crate::correlator::Correlator;
use crate::errors::{BridgeError, BridgeResult};
use crate::message::{generate_message_id, Message};
use crate::registry::ListenerRegistry;
use crate::runtime::{ContainerRuntime, DockerCli};
use crate::selector::StrategySelector;
use crate::transport::{
    is_valid_target, standard_transports, DeliveryReceipt, ListenOptions, SendOptions,
    StrategyKind, Transport,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Event surfaced to callers for every inbound, non-response message
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    Message(Message),
}

/// Trait for inbound message handlers. Each invocation runs on its own task,
/// so a slow handler never holds up listeners or other handlers.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle a message
    async fn handle(&self, bridge: &Bridge, message: &Message) -> Result<(), String>;

    /// Get handler name
    fn name(&self) -> &str {
        "handler"
    }
}

/// Options for a correlated request
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Caller-supplied correlation id; generated when None
    pub request_id: Option<String>,
    /// Deadline for the response; the configured default when None
    pub timeout: Option<Duration>,
    /// Delivery options for the outbound request
    pub send: SendOptions,
}

impl RequestOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }
}

/// Swap the dispatcher onto a fresh inbound queue, dropping the old one.
struct Fence {
    inbound: mpsc::Receiver<Message>,
    done: oneshot::Sender<usize>,
}

struct BridgeInner {
    config: BridgeConfig,
    runtime: Arc<dyn ContainerRuntime>,
    coordinator: DeliveryCoordinator,
    registry: ListenerRegistry,
    correlator: Correlator,
    handlers: RwLock<Vec<Arc<dyn MessageHandler>>>,
    events: broadcast::Sender<BridgeEvent>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    fences: mpsc::UnboundedSender<Fence>,
    // Set for the duration of `stop`; the dispatcher drops while it is.
    fenced: AtomicBool,
    shut_down: AtomicBool,
}

/// Cheaply cloneable handle to one bridge instance
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

/// Builder for [`Bridge`]
pub struct BridgeBuilder {
    config: BridgeConfig,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    transports: Option<Vec<Arc<dyn Transport>>>,
}

impl BridgeBuilder {
    /// Use a specific container runtime instead of the configured CLI
    pub fn runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Replace the standard strategy set
    pub fn transports(mut self, transports: Vec<Arc<dyn Transport>>) -> Self {
        self.transports = Some(transports);
        self
    }

    /// Validate the configuration and start the bridge. Must be called
    /// inside a Tokio runtime.
    pub fn build(self) -> BridgeResult<Bridge> {
        ConfigManager::from_config(self.config.clone()).validate()?;
        let config = self.config;

        let runtime = self
            .runtime
            .unwrap_or_else(|| Arc::new(DockerCli::new(&config.runtime)));
        let transports = self
            .transports
            .unwrap_or_else(|| standard_transports(&config, Arc::clone(&runtime)));
        let selector = Arc::new(StrategySelector::new(transports));

        let coordinator = DeliveryCoordinator::new(
            config.identity.clone(),
            Arc::clone(&selector),
            Arc::clone(&runtime),
            config.retry,
            config.runtime.verify_targets,
        );

        let (sink, inbound) = mpsc::channel(config.events.queue_capacity);
        let registry = ListenerRegistry::new(selector, sink);
        let (events, _) = broadcast::channel(config.events.queue_capacity);
        let (fences, fence_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(BridgeInner {
            config,
            runtime,
            coordinator,
            registry,
            correlator: Correlator::new(),
            handlers: RwLock::new(Vec::new()),
            events,
            dispatcher: Mutex::new(None),
            fences,
            fenced: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        });

        let dispatcher = tokio::spawn(dispatch(Arc::downgrade(&inner), inbound, fence_rx));
        *inner.dispatcher.lock() = Some(dispatcher);

        info!("Bridge started as {}", inner.config.identity);
        Ok(Bridge { inner })
    }
}

fn swap_queue(inbound: &mut mpsc::Receiver<Message>, fence: Fence) {
    let mut stale = std::mem::replace(inbound, fence.inbound);
    let mut dropped = 0;
    while stale.try_recv().is_ok() {
        dropped += 1;
    }
    let _ = fence.done.send(dropped);
}

async fn dispatch(
    inner: Weak<BridgeInner>,
    mut inbound: mpsc::Receiver<Message>,
    mut fences: mpsc::UnboundedReceiver<Fence>,
) {
    loop {
        let message = tokio::select! {
            biased;
            fence = fences.recv() => match fence {
                Some(fence) => {
                    swap_queue(&mut inbound, fence);
                    continue;
                }
                None => break,
            },
            message = inbound.recv() => match message {
                Some(message) => message,
                // Every sender is gone: the bridge is going away, or a stop
                // is about to hand over a fresh queue.
                None => match fences.recv().await {
                    Some(fence) => {
                        swap_queue(&mut inbound, fence);
                        continue;
                    }
                    None => break,
                },
            },
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };

        if inner.fenced.load(Ordering::SeqCst) {
            debug!("Dropped {} received during stop", message.id());
            continue;
        }

        if message.is_response() {
            if !inner.correlator.settle(&message) {
                debug!("Dropped unmatched response {}", message.id());
            }
            continue;
        }

        // No subscribers is fine.
        let _ = inner.events.send(BridgeEvent::Message(message.clone()));

        let handlers = inner.handlers.read().clone();
        if handlers.is_empty() {
            continue;
        }
        let bridge = Bridge { inner };
        for handler in handlers {
            let bridge = bridge.clone();
            let message = message.clone();
            tokio::spawn(async move {
                if let Err(e) = handler.handle(&bridge, &message).await {
                    warn!("Handler {} failed on {}: {}", handler.name(), message.id(), e);
                }
            });
        }
    }
    debug!("Dispatcher stopped");
}

impl Bridge {
    pub fn builder(config: BridgeConfig) -> BridgeBuilder {
        BridgeBuilder {
            config,
            runtime: None,
            transports: None,
        }
    }

    /// Start a bridge with the standard strategies and the configured runtime.
    pub fn new(config: BridgeConfig) -> BridgeResult<Self> {
        Self::builder(config).build()
    }

    pub fn identity(&self) -> &str {
        &self.inner.config.identity
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.inner.runtime
    }

    fn ensure_open(&self) -> BridgeResult<()> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            Err(BridgeError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Send `payload` to `target`, falling back across strategies and
    /// retrying per the retry policy.
    pub async fn send(
        &self,
        target: &str,
        payload: impl Into<Value>,
        options: &SendOptions,
    ) -> BridgeResult<DeliveryReceipt> {
        self.ensure_open()?;
        self.inner.coordinator.send(target, payload, options).await
    }

    /// Send a pre-built message (its `from` is left as given).
    pub async fn send_message(
        &self,
        target: &str,
        message: &Message,
        options: &SendOptions,
    ) -> BridgeResult<DeliveryReceipt> {
        self.ensure_open()?;
        self.inner
            .coordinator
            .send_message(target, message, options)
            .await
    }

    /// Send to every target concurrently with per-target isolation.
    pub async fn broadcast(
        &self,
        targets: &[String],
        payload: impl Into<Value>,
        options: &SendOptions,
    ) -> BridgeResult<BroadcastReport> {
        self.ensure_open()?;
        Ok(self
            .inner
            .coordinator
            .broadcast(targets, payload, options)
            .await)
    }

    /// Broadcast to every running container except this bridge's own.
    pub async fn broadcast_running(
        &self,
        payload: impl Into<Value>,
        options: &SendOptions,
    ) -> BridgeResult<BroadcastReport> {
        self.ensure_open()?;
        let targets: Vec<String> = self
            .inner
            .runtime
            .list_containers()
            .await?
            .into_iter()
            .map(|c| c.name)
            .filter(|name| name != self.identity())
            .collect();
        self.broadcast(&targets, payload, options).await
    }

    /// Send a correlated request and wait for the matching response. The
    /// caller must be listening on its own identity for the response to
    /// arrive.
    pub async fn request(
        &self,
        target: &str,
        action: &str,
        data: Value,
        options: &RequestOptions,
    ) -> BridgeResult<Value> {
        self.ensure_open()?;

        let request_id = options
            .request_id
            .clone()
            .unwrap_or_else(generate_message_id);
        let timeout = options.timeout.unwrap_or(Duration::from_millis(
            self.inner.config.requests.default_timeout_ms,
        ));

        let mut pending = self.inner.correlator.register(&request_id, timeout)?;
        let message = Message::request(&request_id, self.identity(), target, action, data);

        // The deadline runs from registration, so a slow strategy chain
        // cannot push the timeout back.
        let send = self
            .inner
            .coordinator
            .send_message(target, &message, &options.send);
        tokio::pin!(send);

        tokio::select! {
            settled = &mut pending => return settled,
            sent = &mut send => {
                if let Err(e) = sent {
                    self.inner.correlator.forget(&request_id);
                    return Err(e);
                }
            }
        }

        debug!("Request {} ({}) sent to {}", request_id, action, target);
        pending.await
    }

    /// Answer a request. The response goes back to `original.from` with the
    /// same correlation id, through the normal fallback and retry path.
    pub async fn respond(
        &self,
        original: &Message,
        result: Option<Value>,
        error: Option<Value>,
        options: &SendOptions,
    ) -> BridgeResult<DeliveryReceipt> {
        self.ensure_open()?;
        let response = Message::response_to(original, self.identity(), result, error)
            .ok_or_else(|| BridgeError::NotARequest(original.id().to_string()))?;
        self.inner
            .coordinator
            .send_message(&original.from, &response, options)
            .await
    }

    /// Start listening for messages addressed to `identity`.
    pub async fn listen(
        &self,
        identity: &str,
        options: &ListenOptions,
    ) -> BridgeResult<Vec<StrategyKind>> {
        self.ensure_open()?;
        if !is_valid_target(identity) {
            return Err(BridgeError::InvalidTarget(identity.to_string()));
        }
        self.inner.registry.listen(identity, options).await
    }

    /// Stop every listener and discard anything they queued that has not
    /// been dispatched yet. No message event is emitted after this returns
    /// unless `listen` is called again. Idempotent.
    pub async fn stop(&self) {
        self.inner.fenced.store(true, Ordering::SeqCst);

        let (sink, inbound) = mpsc::channel(self.inner.config.events.queue_capacity);
        self.inner.registry.stop_and_redirect(sink).await;

        let (done, acked) = oneshot::channel();
        if self.inner.fences.send(Fence { inbound, done }).is_ok() {
            // An aborted dispatcher never acks; nothing is dispatched then.
            if let Ok(dropped) = acked.await {
                if dropped > 0 {
                    debug!("Discarded {} queued message(s) on stop", dropped);
                }
            }
        }

        self.inner.fenced.store(false, Ordering::SeqCst);
    }

    /// Stop the listeners for one identity.
    pub async fn stop_listening(&self, identity: &str) {
        self.inner.registry.stop_identity(identity).await;
    }

    pub async fn active_listeners(&self) -> Vec<(StrategyKind, String)> {
        self.inner.registry.active().await
    }

    /// Register a handler invoked for every inbound non-response message.
    pub fn on_message(&self, handler: Arc<dyn MessageHandler>) {
        self.inner.handlers.write().push(handler);
    }

    /// Receive every inbound non-response message as an event.
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.inner.events.subscribe()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    /// Reject every pending request with `ShuttingDown`, stop every
    /// listener and stop dispatching. Later calls are no-ops.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let rejected = self.inner.correlator.shutdown();
        self.stop().await;
        if let Some(dispatcher) = self.inner.dispatcher.lock().take() {
            dispatcher.abort();
        }
        info!(
            "Bridge {} shut down ({} pending request(s) rejected)",
            self.identity(),
            rejected
        );
    }
}
