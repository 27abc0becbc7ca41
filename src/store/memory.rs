//! In-process store backed by `DashMap`, for single-node runs and tests.

use super::{
    derive_participants, ContractInstance, DeploymentConfig, Participant, ReconciliationStore,
    Role, StoreError,
};
use crate::onchain::types::DeploymentEvent;
use crate::templates::{StateMap, TemplateId};

use alloy::primitives::Address;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

#[derive(Default)]
pub struct MemoryStore {
    instances: DashMap<Address, ContractInstance>,
    participants: DashMap<(Address, Address, Role), Participant>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }
}

#[async_trait]
impl ReconciliationStore for MemoryStore {
    async fn upsert_instance(
        &self,
        event: &DeploymentEvent,
        template: TemplateId,
        config: &DeploymentConfig,
    ) -> Result<ContractInstance, StoreError> {
        let instance = match self.instances.entry(event.instance) {
            Entry::Occupied(existing) => {
                existing.get().ensure_template(template)?;
                debug!(address = %event.instance, "instance already known");
                existing.get().clone()
            }
            Entry::Vacant(slot) => {
                let created = ContractInstance::from_event(event, template);
                slot.insert(created.clone());
                info!(address = %event.instance, template = %template, "instance created");
                created
            }
        };

        for participant in derive_participants(event.instance, template, config) {
            self.participants.insert(participant.key(), participant);
        }
        Ok(instance)
    }

    async fn update_state(
        &self,
        address: Address,
        state: StateMap,
    ) -> Result<ContractInstance, StoreError> {
        let mut instance = self
            .instances
            .get_mut(&address)
            .ok_or(StoreError::NotFound(address))?;
        instance.apply_state(state);
        Ok(instance.clone())
    }

    async fn get_instance(&self, address: Address) -> Result<Option<ContractInstance>, StoreError> {
        Ok(self.instances.get(&address).map(|i| i.clone()))
    }

    async fn participants(&self, address: Address) -> Result<Vec<Participant>, StoreError> {
        let mut rows: Vec<Participant> = self
            .participants
            .iter()
            .filter(|p| p.contract_address == address)
            .map(|p| p.value().clone())
            .collect();
        rows.sort_by_key(|p| (p.role, p.user_address));
        Ok(rows)
    }

    async fn instances_for_user(&self, user: Address) -> Result<Vec<ContractInstance>, StoreError> {
        let mut addresses: Vec<Address> = self
            .participants
            .iter()
            .filter(|p| p.user_address == user)
            .map(|p| p.contract_address)
            .collect();
        addresses.sort();
        addresses.dedup();
        Ok(addresses
            .into_iter()
            .filter_map(|a| self.instances.get(&a).map(|i| i.clone()))
            .collect())
    }

    async fn non_terminal_instances(&self) -> Result<Vec<ContractInstance>, StoreError> {
        let mut rows: Vec<ContractInstance> = self
            .instances
            .iter()
            .filter(|i| !i.is_terminal())
            .map(|i| i.value().clone())
            .collect();
        rows.sort_by_key(|i| (i.deployment_block, i.address));
        Ok(rows)
    }
}
