//! JSON-RPC implementation of `ChainEventSource` on top of an alloy provider.
//!
//! Works against HTTP or WebSocket endpoints. Subscriptions are served by a
//! background task that polls `eth_blockNumber` + `eth_getLogs`, so they work
//! on plain HTTP nodes too.

use crate::onchain::abi;
use crate::onchain::source::{ChainError, ChainEventSource, LogSubscription};
use crate::onchain::types::RawLog;
use crate::templates::ViewFunction;

use alloy::dyn_abi::{DynSolType, DynSolValue};
use alloy::primitives::{Address, Bytes, B256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, Log, TransactionInput, TransactionRequest};
use alloy::transports::TransportError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// JSON-RPC error code used by nodes for `execution reverted`.
const REVERT_ERROR_CODE: i64 = 3;

pub struct RpcChainSource {
    provider: DynProvider,
    subscription_poll: Duration,
}

impl RpcChainSource {
    pub async fn connect(url: &str, subscription_poll: Duration) -> Result<Self, ChainError> {
        let provider = ProviderBuilder::new()
            .connect(url)
            .await
            .map_err(classify_transport_error)?;
        info!(url = %url, "connected to chain RPC");
        Ok(Self {
            provider: provider.erased(),
            subscription_poll,
        })
    }
}

#[async_trait]
impl ChainEventSource for RpcChainSource {
    async fn current_height(&self) -> Result<u64, ChainError> {
        self.provider
            .get_block_number()
            .await
            .map_err(classify_transport_error)
    }

    async fn get_logs(
        &self,
        address: Address,
        topic0: B256,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>, ChainError> {
        fetch_logs(&self.provider, address, topic0, from_block, to_block).await
    }

    async fn call(
        &self,
        address: Address,
        function: &ViewFunction,
    ) -> Result<DynSolValue, ChainError> {
        let calldata = Bytes::from(abi::selector(&function.signature()).to_vec());
        let tx = TransactionRequest::default()
            .to(address)
            .input(TransactionInput::new(calldata));

        let output = self
            .provider
            .call(tx)
            .await
            .map_err(classify_transport_error)?;

        if output.is_empty() {
            // Calls to an address without code return empty data instead of reverting.
            return Err(ChainError::Revert(format!("{} returned no data", function.name)));
        }

        let ty = DynSolType::parse(function.output)
            .map_err(|e| ChainError::Decode(format!("{}: {e}", function.output)))?;
        ty.abi_decode(&output)
            .map_err(|e| ChainError::Decode(format!("{}: {e}", function.name)))
    }

    async fn subscribe(
        &self,
        address: Address,
        topic0: B256,
    ) -> Result<LogSubscription, ChainError> {
        let start = self.current_height().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        tokio::spawn(poll_subscription(
            self.provider.clone(),
            address,
            topic0,
            start,
            self.subscription_poll,
            tx,
            cancel.clone(),
        ));

        debug!(address = %address, topic = %topic0, from_block = start, "log subscription started");
        Ok(LogSubscription::new(rx, cancel))
    }
}

async fn fetch_logs(
    provider: &DynProvider,
    address: Address,
    topic0: B256,
    from_block: u64,
    to_block: u64,
) -> Result<Vec<RawLog>, ChainError> {
    let filter = Filter::new()
        .address(address)
        .event_signature(topic0)
        .from_block(from_block)
        .to_block(to_block);

    let logs = provider
        .get_logs(&filter)
        .await
        .map_err(classify_transport_error)?;

    let mut raw: Vec<RawLog> = logs.into_iter().filter_map(to_raw_log).collect();
    raw.sort_by_key(|log| (log.block_number, log.log_index));
    Ok(raw)
}

/// Forward new logs until cancelled or the first failure.
async fn poll_subscription(
    provider: DynProvider,
    address: Address,
    topic0: B256,
    mut last_block: u64,
    interval: Duration,
    tx: mpsc::UnboundedSender<Result<RawLog, ChainError>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let head = match provider.get_block_number().await {
            Ok(head) => head,
            Err(e) => {
                let _ = tx.send(Err(classify_transport_error(e)));
                break;
            }
        };
        if head <= last_block {
            continue;
        }

        match fetch_logs(&provider, address, topic0, last_block + 1, head).await {
            Ok(logs) => {
                for log in logs {
                    if tx.send(Ok(log)).is_err() {
                        return;
                    }
                }
                last_block = head;
            }
            Err(e) => {
                let _ = tx.send(Err(e));
                break;
            }
        }
    }
    debug!(address = %address, "log subscription ended");
}

/// Pending logs have no block or index yet and are skipped.
fn to_raw_log(log: Log) -> Option<RawLog> {
    let (Some(block_number), Some(log_index)) = (log.block_number, log.log_index) else {
        warn!("skipping log without block position");
        return None;
    };
    Some(RawLog {
        address: log.address(),
        topics: log.topics().to_vec(),
        data: log.data().data.clone(),
        block_number,
        transaction_hash: log.transaction_hash.unwrap_or_default(),
        log_index,
    })
}

fn classify_transport_error(err: TransportError) -> ChainError {
    match err.as_error_resp() {
        Some(payload)
            if payload.code == REVERT_ERROR_CODE
                || payload.message.to_lowercase().contains("revert") =>
        {
            ChainError::Revert(payload.message.to_string())
        }
        _ => ChainError::Network(err.to_string()),
    }
}
