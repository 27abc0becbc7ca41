//! Reconciliation store: the off-chain cache of factory-deployed instances.
//!
//! Data model:
//!   instance      → one row per contract address (never deleted)
//!   participant   → one row per (contract, user, role)
//!
//! Creation is idempotent: replaying a deployment event returns the existing
//! row and re-applies participants by key. State updates overwrite the cached
//! snapshot wholesale and never touch participants.

pub mod memory;
pub mod valkey;

pub use memory::MemoryStore;
pub use valkey::ValkeyStore;

use crate::onchain::types::DeploymentEvent;
use crate::templates::{StateMap, TemplateId};
use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("contract {0} not found")]
    NotFound(Address),
    #[error("contract {address} is a {existing}, not a {requested}")]
    TemplateConflict {
        address: Address,
        existing: TemplateId,
        requested: TemplateId,
    },
    #[error("valkey error: {0}")]
    Backend(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Creator,
    Recipient,
    Owner,
    Tenant,
    Participant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Creator => write!(f, "creator"),
            Role::Recipient => write!(f, "recipient"),
            Role::Owner => write!(f, "owner"),
            Role::Tenant => write!(f, "tenant"),
            Role::Participant => write!(f, "participant"),
        }
    }
}

/// Creation-time configuration of an instance, as produced upstream.
/// `share_bps` pairs by index with `tenants` or `participants`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfig {
    #[serde(default)]
    pub creator: Option<Address>,
    #[serde(default)]
    pub recipient: Option<Address>,
    #[serde(default)]
    pub owner: Option<Address>,
    #[serde(default)]
    pub tenants: Vec<Address>,
    #[serde(default)]
    pub participants: Vec<Address>,
    #[serde(default)]
    pub share_bps: Vec<u32>,
}

impl DeploymentConfig {
    pub fn share_total(&self) -> u32 {
        self.share_bps.iter().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractInstance {
    pub address: Address,
    pub template_id: TemplateId,
    pub creator_address: Address,
    pub deployment_block: u64,
    pub transaction_hash: B256,
    pub lifecycle_state: u8,
    pub on_chain_state: StateMap,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ContractInstance {
    pub fn from_event(event: &DeploymentEvent, template: TemplateId) -> Self {
        Self {
            address: event.instance,
            template_id: template,
            creator_address: event.creator,
            deployment_block: event.block_number,
            transaction_hash: event.transaction_hash,
            lifecycle_state: 0,
            on_chain_state: StateMap::new(),
            last_synced_at: None,
            created_at: Utc::now(),
        }
    }

    /// Replace the cached snapshot and re-derive the lifecycle code.
    pub fn apply_state(&mut self, state: StateMap) {
        self.lifecycle_state = self.template_id.lifecycle_of(&state, self.lifecycle_state);
        self.on_chain_state = state;
        self.last_synced_at = Some(Utc::now());
    }

    pub fn is_terminal(&self) -> bool {
        self.template_id.is_terminal(self.lifecycle_state)
    }

    pub fn lifecycle_label(&self) -> &'static str {
        self.template_id
            .descriptor()
            .lifecycle_labels
            .get(self.lifecycle_state as usize)
            .copied()
            .unwrap_or("Unknown")
    }

    fn ensure_template(&self, requested: TemplateId) -> Result<(), StoreError> {
        if self.template_id == requested {
            Ok(())
        } else {
            Err(StoreError::TemplateConflict {
                address: self.address,
                existing: self.template_id,
                requested,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub contract_address: Address,
    pub user_address: Address,
    pub role: Role,
    pub share_bps: Option<u32>,
}

impl Participant {
    pub fn key(&self) -> (Address, Address, Role) {
        (self.contract_address, self.user_address, self.role)
    }
}

/// Participant rows implied by a deployment config, restricted to the roles
/// the template supports. The creator is always included when known.
pub fn derive_participants(
    address: Address,
    template: TemplateId,
    config: &DeploymentConfig,
) -> Vec<Participant> {
    let roles = template.descriptor().roles;
    let row = |user: Address, role: Role, share_bps: Option<u32>| Participant {
        contract_address: address,
        user_address: user,
        role,
        share_bps,
    };

    let mut rows = Vec::new();
    if let Some(creator) = config.creator {
        rows.push(row(creator, Role::Creator, None));
    }
    if roles.contains(&Role::Recipient) {
        rows.extend(config.recipient.map(|user| row(user, Role::Recipient, None)));
    }
    if roles.contains(&Role::Owner) {
        rows.extend(config.owner.map(|user| row(user, Role::Owner, None)));
    }
    for (role, members) in [
        (Role::Tenant, &config.tenants),
        (Role::Participant, &config.participants),
    ] {
        if !roles.contains(&role) {
            continue;
        }
        for (i, user) in members.iter().enumerate() {
            rows.push(row(*user, role, config.share_bps.get(i).copied()));
        }
    }
    rows
}

#[async_trait]
pub trait ReconciliationStore: Send + Sync {
    /// Create the instance if absent and upsert its participants.
    /// Returns the stored row (the existing one on replay).
    async fn upsert_instance(
        &self,
        event: &DeploymentEvent,
        template: TemplateId,
        config: &DeploymentConfig,
    ) -> Result<ContractInstance, StoreError>;

    async fn update_state(
        &self,
        address: Address,
        state: StateMap,
    ) -> Result<ContractInstance, StoreError>;

    async fn get_instance(&self, address: Address) -> Result<Option<ContractInstance>, StoreError>;

    async fn participants(&self, address: Address) -> Result<Vec<Participant>, StoreError>;

    /// Instances where `user` holds any participant role.
    async fn instances_for_user(&self, user: Address) -> Result<Vec<ContractInstance>, StoreError>;

    async fn non_terminal_instances(&self) -> Result<Vec<ContractInstance>, StoreError>;
}
