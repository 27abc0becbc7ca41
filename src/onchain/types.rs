//! Log and deployment-event types shared by the watcher, the listener
//! supervisor and the sync pipeline.

use crate::store::DeploymentConfig;
use crate::templates::TemplateId;
use alloy::primitives::{Address, Bytes, B256};
use std::fmt;

/// A log as delivered by a `ChainEventSource`, already confirmed into a block.
#[derive(Debug, Clone, PartialEq)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub transaction_hash: B256,
    pub log_index: u64,
}

impl RawLog {
    pub fn topic0(&self) -> Option<&B256> {
        self.topics.first()
    }
}

/// Template-specific fields carried by a creation event beyond creator and
/// instance address.
#[derive(Debug, Clone, PartialEq)]
pub enum DeploymentExtra {
    Legacy {
        landlord: Address,
        tenant: Address,
        suggested_name: String,
    },
    Recipient(Address),
    Owner(Address),
    /// Registered through the API rather than observed on chain.
    None,
}

/// A normalized "instance deployed" event. Delivered at-least-once.
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentEvent {
    pub template: TemplateId,
    pub creator: Address,
    pub instance: Address,
    pub block_number: u64,
    pub transaction_hash: B256,
    pub log_index: u64,
    pub extra: DeploymentExtra,
}

impl DeploymentEvent {
    /// Deployment config implied by the event alone. Generic factory events
    /// only establish the creator; the legacy event also names landlord and
    /// tenant.
    pub fn config(&self) -> DeploymentConfig {
        let mut config = DeploymentConfig {
            creator: Some(self.creator),
            ..DeploymentConfig::default()
        };
        if let DeploymentExtra::Legacy { landlord, tenant, .. } = &self.extra {
            config.recipient = Some(*landlord);
            config.tenants = vec![*tenant];
        }
        config
    }
}

impl fmt::Display for DeploymentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({} by {} @ block {}#{})",
            self.template, self.instance, self.creator, self.block_number, self.log_index
        )
    }
}
