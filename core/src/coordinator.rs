/// Delivery coordination: single sends with retry, and isolated broadcasts.
use crate::config::RetryPolicy;
use crate::errors::{BridgeError, BridgeResult};
use crate::message::Message;
use crate::runtime::ContainerRuntime;
use crate::selector::StrategySelector;
use crate::transport::{DeliveryReceipt, SendOptions};
use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Per-target outcome of a broadcast
#[derive(Debug)]
pub struct BroadcastOutcome {
    pub target: String,
    pub result: BridgeResult<DeliveryReceipt>,
}

impl BroadcastOutcome {
    pub fn is_delivered(&self) -> bool {
        self.result.is_ok()
    }
}

/// Aggregate result of a broadcast, one outcome per target in input order
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub outcomes: Vec<BroadcastOutcome>,
}

impl BroadcastReport {
    pub fn delivered(&self) -> impl Iterator<Item = &BroadcastOutcome> {
        self.outcomes.iter().filter(|o| o.is_delivered())
    }

    pub fn failed(&self) -> impl Iterator<Item = &BroadcastOutcome> {
        self.outcomes.iter().filter(|o| !o.is_delivered())
    }

    pub fn get(&self, target: &str) -> Option<&BroadcastOutcome> {
        self.outcomes.iter().find(|o| o.target == target)
    }

    pub fn all_delivered(&self) -> bool {
        self.outcomes.iter().all(BroadcastOutcome::is_delivered)
    }
}

/// Public send/broadcast operations. Holds no long-lived state beyond its
/// configuration; every call is independent.
pub struct DeliveryCoordinator {
    identity: String,
    selector: Arc<StrategySelector>,
    runtime: Arc<dyn ContainerRuntime>,
    retry: RetryPolicy,
    verify_targets: bool,
}

impl DeliveryCoordinator {
    pub fn new(
        identity: impl Into<String>,
        selector: Arc<StrategySelector>,
        runtime: Arc<dyn ContainerRuntime>,
        retry: RetryPolicy,
        verify_targets: bool,
    ) -> Self {
        Self {
            identity: identity.into(),
            selector,
            runtime,
            retry,
            verify_targets,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn selector(&self) -> &Arc<StrategySelector> {
        &self.selector
    }

    /// Build a message from this identity and deliver it.
    pub async fn send(
        &self,
        target: &str,
        payload: impl Into<Value>,
        options: &SendOptions,
    ) -> BridgeResult<DeliveryReceipt> {
        let message = Message::new(self.identity.clone(), target, payload);
        self.send_message(target, &message, options).await
    }

    /// Deliver a pre-built message, retrying the whole strategy chain.
    pub async fn send_message(
        &self,
        target: &str,
        message: &Message,
        options: &SendOptions,
    ) -> BridgeResult<DeliveryReceipt> {
        self.check_target(target).await?;

        let policy = options.retry.unwrap_or(self.retry);
        let attempts = policy.attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.selector.deliver(target, message, options.strategy).await {
                Ok(receipt) => {
                    info!(
                        "Delivered {} to {} via {} (attempt {}/{})",
                        message.id(),
                        target,
                        receipt.strategy,
                        attempt,
                        attempts
                    );
                    return Ok(receipt);
                }
                Err(e) if !e.is_retryable() || attempt >= attempts => {
                    let e = match e {
                        BridgeError::AggregateDelivery {
                            target, failures, ..
                        } => BridgeError::AggregateDelivery {
                            target,
                            attempts: attempt,
                            failures,
                        },
                        other => other,
                    };
                    error!("Giving up on {} to {}: {}", message.id(), target, e);
                    return Err(e);
                }
                Err(e) => {
                    debug!(
                        "Attempt {}/{} for {} to {} failed: {}",
                        attempt,
                        attempts,
                        message.id(),
                        target,
                        e
                    );
                    tokio::time::sleep(policy.delay()).await;
                }
            }
        }
    }

    /// Send `payload` to every target concurrently. A failure for one target
    /// never cancels or delays the others.
    pub async fn broadcast(
        &self,
        targets: &[String],
        payload: impl Into<Value>,
        options: &SendOptions,
    ) -> BroadcastReport {
        let payload = payload.into();
        let sends = targets.iter().map(|target| {
            let message = Message::new(self.identity.clone(), target.clone(), payload.clone());
            async move {
                let result = self.send_message(target, &message, options).await;
                BroadcastOutcome {
                    target: target.clone(),
                    result,
                }
            }
        });

        let report = BroadcastReport {
            outcomes: join_all(sends).await,
        };
        info!(
            "Broadcast to {} target(s): {} delivered, {} failed",
            report.outcomes.len(),
            report.delivered().count(),
            report.failed().count()
        );
        report
    }

    async fn check_target(&self, target: &str) -> BridgeResult<()> {
        if !self.verify_targets {
            return Ok(());
        }
        match self.runtime.is_running(target).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(BridgeError::UnknownTarget(target.to_string())),
            Err(e) => {
                // Shared storage can still deliver without the runtime.
                warn!("Could not verify target {}: {}", target, e);
                Ok(())
            }
        }
    }
}
