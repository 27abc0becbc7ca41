//! Scripted `ChainEventSource` and log builders for unit tests.

use crate::onchain::abi;
use crate::onchain::source::{ChainError, ChainEventSource, LogSubscription};
use crate::onchain::types::RawLog;
use crate::templates::{TemplateId, ViewFunction};

use alloy::dyn_abi::DynSolValue;
use alloy::primitives::{Address, B256, U256};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogQuery {
    pub address: Address,
    pub topic0: B256,
    pub from_block: u64,
    pub to_block: u64,
}

pub enum SubscriptionScript {
    Refuse(ChainError),
    /// Deliver these items, then stay open until unsubscribed.
    Deliver(Vec<Result<RawLog, ChainError>>),
}

#[derive(Default)]
pub struct FakeChain {
    height: AtomicU64,
    height_error: Mutex<Option<ChainError>>,
    logs: Mutex<Vec<RawLog>>,
    failing_topics: Mutex<Vec<B256>>,
    queries: Mutex<Vec<LogQuery>>,
    values: Mutex<HashMap<(Address, &'static str), Result<DynSolValue, ChainError>>>,
    scripts: Mutex<VecDeque<SubscriptionScript>>,
    subscribe_times: Mutex<Vec<tokio::time::Instant>>,
    subscription_tokens: Mutex<Vec<CancellationToken>>,
    open_senders: Mutex<Vec<mpsc::UnboundedSender<Result<RawLog, ChainError>>>>,
}

impl FakeChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_height(&self, height: u64) {
        self.height.store(height, Ordering::SeqCst);
    }

    pub fn fail_height(&self, error: Option<ChainError>) {
        *self.height_error.lock().unwrap() = error;
    }

    pub fn push_log(&self, log: RawLog) {
        self.logs.lock().unwrap().push(log);
    }

    pub fn fail_topic(&self, topic0: B256) {
        self.failing_topics.lock().unwrap().push(topic0);
    }

    pub fn clear_failures(&self) {
        self.failing_topics.lock().unwrap().clear();
        *self.height_error.lock().unwrap() = None;
    }

    pub fn log_queries(&self) -> Vec<LogQuery> {
        self.queries.lock().unwrap().clone()
    }

    pub fn set_value(&self, address: Address, name: &'static str, value: DynSolValue) {
        self.values.lock().unwrap().insert((address, name), Ok(value));
    }

    pub fn set_error(&self, address: Address, name: &'static str, error: ChainError) {
        self.values.lock().unwrap().insert((address, name), Err(error));
    }

    /// A legacy rental with plausible values and the given `state` code.
    pub fn seed_legacy_rental(&self, address: Address, state: u8) {
        self.set_value(address, "landlord", DynSolValue::Address(Address::repeat_byte(0x11)));
        self.set_value(address, "tenant", DynSolValue::Address(Address::repeat_byte(0x22)));
        self.set_value(address, "monthlyAmount", uint(2_000_000_000, 256));
        self.set_value(address, "totalMonths", uint(12, 8));
        self.set_value(address, "startTime", uint(1_735_689_600, 256));
        self.set_value(address, "state", uint(state as u64, 8));
        self.set_value(address, "terminationNoticeTime", uint(0, 256));
    }

    /// A rent vault that has (or has not) been withdrawn.
    pub fn seed_rent_vault(&self, address: Address, withdrawn: bool) {
        self.set_value(address, "recipient", DynSolValue::Address(Address::repeat_byte(0x33)));
        self.set_value(address, "rentAmount", uint(1_500_000_000, 256));
        self.set_value(address, "dueDate", uint(1_735_689_600, 256));
        self.set_value(address, "totalDeposited", uint(750_000_000, 256));
        self.set_value(address, "withdrawn", DynSolValue::Bool(withdrawn));
    }

    pub fn script_subscription(&self, script: SubscriptionScript) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn subscribe_times(&self) -> Vec<tokio::time::Instant> {
        self.subscribe_times.lock().unwrap().clone()
    }

    pub fn subscription_tokens(&self) -> Vec<CancellationToken> {
        self.subscription_tokens.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChainEventSource for FakeChain {
    async fn current_height(&self) -> Result<u64, ChainError> {
        if let Some(e) = self.height_error.lock().unwrap().clone() {
            return Err(e);
        }
        Ok(self.height.load(Ordering::SeqCst))
    }

    async fn get_logs(
        &self,
        address: Address,
        topic0: B256,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>, ChainError> {
        self.queries.lock().unwrap().push(LogQuery {
            address,
            topic0,
            from_block,
            to_block,
        });
        if self.failing_topics.lock().unwrap().contains(&topic0) {
            return Err(ChainError::Network("getLogs timed out".into()));
        }
        let mut logs: Vec<RawLog> = self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|log| {
                log.address == address
                    && log.topic0() == Some(&topic0)
                    && (from_block..=to_block).contains(&log.block_number)
            })
            .cloned()
            .collect();
        logs.sort_by_key(|log| (log.block_number, log.log_index));
        Ok(logs)
    }

    async fn call(
        &self,
        address: Address,
        function: &ViewFunction,
    ) -> Result<DynSolValue, ChainError> {
        self.values
            .lock()
            .unwrap()
            .get(&(address, function.name))
            .cloned()
            .unwrap_or_else(|| Err(ChainError::Revert(format!("{} not set", function.name))))
    }

    async fn subscribe(
        &self,
        _address: Address,
        _topic0: B256,
    ) -> Result<LogSubscription, ChainError> {
        self.subscribe_times
            .lock()
            .unwrap()
            .push(tokio::time::Instant::now());

        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| SubscriptionScript::Refuse(ChainError::Network("connection refused".into())));

        match script {
            SubscriptionScript::Refuse(e) => Err(e),
            SubscriptionScript::Deliver(items) => {
                let (tx, rx) = mpsc::unbounded_channel();
                for item in items {
                    let _ = tx.send(item);
                }
                self.open_senders.lock().unwrap().push(tx);
                let token = CancellationToken::new();
                self.subscription_tokens.lock().unwrap().push(token.clone());
                Ok(LogSubscription::new(rx, token))
            }
        }
    }
}

pub fn uint(value: u64, bits: usize) -> DynSolValue {
    DynSolValue::Uint(U256::from(value), bits)
}

fn address_topic(address: Address) -> B256 {
    B256::left_padding_from(address.as_slice())
}

/// Generic factory creation log: `(creator, clone, recipient|owner)` all indexed.
pub fn creation_log(
    factory: Address,
    template: TemplateId,
    creator: Address,
    instance: Address,
    third: Address,
    block_number: u64,
    log_index: u64,
) -> RawLog {
    RawLog {
        address: factory,
        topics: vec![
            abi::event_topic(template.descriptor().creation_event),
            address_topic(creator),
            address_topic(instance),
            address_topic(third),
        ],
        data: Default::default(),
        block_number,
        transaction_hash: B256::with_last_byte(block_number as u8),
        log_index,
    }
}

/// Legacy `RentalDeployed` log with its non-indexed tenant/name payload.
#[allow(clippy::too_many_arguments)]
pub fn rental_log(
    factory: Address,
    creator: Address,
    rental: Address,
    landlord: Address,
    tenant: Address,
    suggested_name: &str,
    block_number: u64,
    log_index: u64,
) -> RawLog {
    let data = DynSolValue::Tuple(vec![
        DynSolValue::Address(tenant),
        DynSolValue::String(suggested_name.to_string()),
    ])
    .abi_encode_params();

    let mut log = creation_log(
        factory,
        TemplateId::LegacyRental,
        creator,
        rental,
        landlord,
        block_number,
        log_index,
    );
    log.data = data.into();
    log
}
