/// Strategy selection and automatic fallback.
///
/// Holds the transports in fixed preference order (fastest first, most
/// reliable last). In automatic mode each is tried in turn until one
/// succeeds; a forced strategy is tried alone and its error is surfaced as is.
use crate::errors::{BridgeError, BridgeResult, StrategyFailure};
use crate::message::Message;
use crate::transport::{DeliveryReceipt, StrategyKind, Transport};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct StrategySelector {
    transports: Vec<Arc<dyn Transport>>,
}

impl StrategySelector {
    /// Build a selector. Transports are ordered by [`StrategyKind::PREFERENCE`]
    /// regardless of the order given.
    pub fn new(mut transports: Vec<Arc<dyn Transport>>) -> Self {
        transports.sort_by_key(|t| t.kind());
        Self { transports }
    }

    /// Transports in preference order
    pub fn transports(&self) -> &[Arc<dyn Transport>] {
        &self.transports
    }

    pub fn get(&self, kind: StrategyKind) -> Option<&Arc<dyn Transport>> {
        self.transports.iter().find(|t| t.kind() == kind)
    }

    /// Strategies that can run a listener
    pub fn listening_kinds(&self) -> Vec<StrategyKind> {
        self.transports
            .iter()
            .filter(|t| t.can_listen())
            .map(|t| t.kind())
            .collect()
    }

    /// Deliver once through the chain. An exhausted chain yields
    /// `AggregateDelivery` with one entry per attempted strategy.
    pub async fn deliver(
        &self,
        target: &str,
        message: &Message,
        forced: Option<StrategyKind>,
    ) -> BridgeResult<DeliveryReceipt> {
        if let Some(kind) = forced {
            let transport = self.get(kind).ok_or_else(|| {
                BridgeError::Config(format!("Strategy {} is not configured", kind))
            })?;
            return transport.send(target, message).await;
        }

        let mut failures = Vec::with_capacity(self.transports.len());
        for transport in &self.transports {
            match transport.send(target, message).await {
                Ok(receipt) => {
                    if !failures.is_empty() {
                        debug!(
                            "Message {} reached {} via {} after {} failure(s)",
                            message.id(),
                            target,
                            receipt.strategy,
                            failures.len()
                        );
                    }
                    return Ok(receipt);
                }
                Err(e) => {
                    warn!("{} failed for {}: {}", transport.kind(), target, e);
                    failures.push(StrategyFailure {
                        strategy: transport.kind(),
                        capability: e.is_capability(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(BridgeError::AggregateDelivery {
            target: target.to_string(),
            attempts: 1,
            failures,
        })
    }
}
