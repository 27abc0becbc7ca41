//! Supervised push listener for factory creation events.
//!
//! Wraps `ChainEventSource::subscribe` with reconnect handling:
//! - Running → (subscription error) → Reconnecting(attempt) → Running(attempt + 1)
//! - once `attempt == max_attempts` the listener is Stopped for good
//! - delay before each reconnect is `base_delay * 2^attempt`
//! - the previous subscription is unsubscribed before resubscribing
//!
//! Decoded events are emitted via a `tokio::sync::mpsc` channel; the current
//! state is published on a `watch` channel.

use crate::metrics::SyncMetrics;
use crate::onchain::abi;
use crate::onchain::source::{ChainError, ChainEventSource};
use crate::onchain::types::DeploymentEvent;
use crate::onchain::watcher::decode_deployment;
use crate::templates::TemplateId;

use alloy::primitives::{Address, B256};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ListenerState {
    Running { attempt: u32 },
    Reconnecting { attempt: u32 },
    Stopped,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

#[derive(Error, Debug)]
#[error("listener stopped after {attempts} reconnect attempts: {last_error}")]
pub struct ListenerFatal {
    pub attempts: u32,
    pub last_error: ChainError,
}

/// Delay before reconnect number `attempt + 1`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

pub struct ListenerSupervisor {
    source: Arc<dyn ChainEventSource>,
    factory: Address,
    template: TemplateId,
    topic: B256,
    config: SupervisorConfig,
    events_tx: mpsc::UnboundedSender<DeploymentEvent>,
    state_tx: watch::Sender<ListenerState>,
    metrics: Arc<SyncMetrics>,
    shutdown: CancellationToken,
}

impl ListenerSupervisor {
    pub fn new(
        source: Arc<dyn ChainEventSource>,
        factory: Address,
        template: TemplateId,
        config: SupervisorConfig,
        events_tx: mpsc::UnboundedSender<DeploymentEvent>,
        metrics: Arc<SyncMetrics>,
        shutdown: CancellationToken,
    ) -> Self {
        let (state_tx, _) = watch::channel(ListenerState::Running { attempt: 0 });
        Self {
            source,
            factory,
            template,
            topic: abi::event_topic(template.descriptor().creation_event),
            config,
            events_tx,
            state_tx,
            metrics,
            shutdown,
        }
    }

    pub fn state(&self) -> watch::Receiver<ListenerState> {
        self.state_tx.subscribe()
    }

    /// Start the supervisor in a background task. Returns immediately.
    pub fn start(self) -> tokio::task::JoinHandle<Result<(), ListenerFatal>> {
        tokio::spawn(self.run())
    }

    /// Run until shutdown (`Ok`) or until reconnect attempts are exhausted.
    pub async fn run(self) -> Result<(), ListenerFatal> {
        let mut attempt = 0u32;
        loop {
            self.state_tx.send_replace(ListenerState::Running { attempt });

            let err = match self.run_session().await {
                Ok(()) => {
                    info!(factory = %self.factory, "listener shut down");
                    return Ok(());
                }
                Err(e) => e,
            };

            if attempt >= self.config.max_attempts {
                self.state_tx.send_replace(ListenerState::Stopped);
                self.metrics.record_listener_fatal();
                error!(
                    factory = %self.factory,
                    attempts = attempt,
                    error = %err,
                    "max reconnect attempts reached, listener stopped"
                );
                return Err(ListenerFatal {
                    attempts: attempt,
                    last_error: err,
                });
            }

            let delay = backoff_delay(self.config.base_delay, attempt);
            self.state_tx
                .send_replace(ListenerState::Reconnecting { attempt });
            self.metrics.record_reconnect();
            warn!(
                factory = %self.factory,
                error = %err,
                attempt = attempt + 1,
                max_attempts = self.config.max_attempts,
                backoff_secs = delay.as_secs(),
                "listener error, reconnecting"
            );

            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// One subscription lifetime. `Ok` only on shutdown.
    async fn run_session(&self) -> Result<(), ChainError> {
        let mut subscription = self.source.subscribe(self.factory, self.topic).await?;
        info!(factory = %self.factory, template = %self.template, "listening for deployments");

        loop {
            let item = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    subscription.unsubscribe();
                    return Ok(());
                }
                item = subscription.next() => item,
            };

            match item {
                Some(Ok(log)) => match decode_deployment(self.template, &log) {
                    Ok(event) => {
                        debug!(event = %event, "listener delivered deployment");
                        if self.events_tx.send(event).is_err() {
                            subscription.unsubscribe();
                            return Ok(());
                        }
                    }
                    Err(e) => warn!(tx = %log.transaction_hash, error = %e, "skipping undecodable log"),
                },
                Some(Err(e)) => {
                    subscription.unsubscribe();
                    return Err(e);
                }
                None => {
                    subscription.unsubscribe();
                    return Err(ChainError::Network("subscription closed".into()));
                }
            }
        }
    }
}
