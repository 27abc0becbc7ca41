//! The blockchain capability every other component talks to.

use crate::onchain::types::RawLog;
use crate::templates::ViewFunction;
use alloy::dyn_abi::DynSolValue;
use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("network error: {0}")]
    Network(String),
    #[error("call reverted: {0}")]
    Revert(String),
    #[error("failed to decode chain data: {0}")]
    Decode(String),
}

impl ChainError {
    /// Network failures are worth retrying on the next cycle; reverts and
    /// decode failures will repeat until the contract changes.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Network(_))
    }
}

/// Read access to a chain node.
#[async_trait]
pub trait ChainEventSource: Send + Sync {
    async fn current_height(&self) -> Result<u64, ChainError>;

    /// Logs emitted by `address` with the given topic0 in `[from_block, to_block]`,
    /// ordered by block then log index.
    async fn get_logs(
        &self,
        address: Address,
        topic0: B256,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>, ChainError>;

    /// Invoke a zero-argument view function and decode its return value.
    async fn call(&self, address: Address, function: &ViewFunction)
        -> Result<DynSolValue, ChainError>;

    /// Push-style delivery of new logs. The subscription ends after the first
    /// error it reports.
    async fn subscribe(&self, address: Address, topic0: B256)
        -> Result<LogSubscription, ChainError>;
}

/// Handle to a live log subscription. Dropping it unsubscribes.
pub struct LogSubscription {
    logs: mpsc::UnboundedReceiver<Result<RawLog, ChainError>>,
    cancel: CancellationToken,
}

impl LogSubscription {
    pub fn new(
        logs: mpsc::UnboundedReceiver<Result<RawLog, ChainError>>,
        cancel: CancellationToken,
    ) -> Self {
        Self { logs, cancel }
    }

    /// Next delivered log or error. `None` once the producer has gone away.
    pub async fn next(&mut self) -> Option<Result<RawLog, ChainError>> {
        self.logs.recv().await
    }

    pub fn unsubscribe(self) {
        self.cancel.cancel();
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
