//! Valkey (Redis-compatible) reconciliation store.
//!
//! Data model (all keys under a configurable prefix):
//!   instance:{address}        → JSON ContractInstance
//!   instances                 → SET of instance addresses
//!   participants:{address}    → HASH "{user}:{role}" → JSON Participant
//!   user:{address}            → SET of contract addresses the user takes part in

use super::{
    derive_participants, ContractInstance, DeploymentConfig, Participant, ReconciliationStore,
    StoreError,
};
use crate::onchain::types::DeploymentEvent;
use crate::templates::{StateMap, TemplateId};

use alloy::primitives::Address;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Valkey-backed store.
///
/// Default prefix: "factory-sync" → keys like "factory-sync:instance:0xabc…".
#[derive(Clone)]
pub struct ValkeyStore {
    conn: MultiplexedConnection,
    prefix: String,
}

impl ValkeyStore {
    /// Connect to Valkey/Redis.
    pub async fn connect(url: &str, prefix: &str) -> anyhow::Result<Self> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(url = url, prefix = prefix, "connected to Valkey");
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
        })
    }

    /// Build a namespaced key: "{prefix}:{suffix}"
    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    fn instance_key(&self, address: &Address) -> String {
        self.key(&format!("instance:{}", addr(address)))
    }

    /// Test connectivity.
    pub async fn ping(&self) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!(response = %pong, "Valkey ping");
        Ok(())
    }

    async fn load(
        &self,
        conn: &mut MultiplexedConnection,
        address: &Address,
    ) -> Result<Option<ContractInstance>, StoreError> {
        let json: Option<String> = conn.get(self.instance_key(address)).await?;
        match json {
            Some(j) => Ok(Some(serde_json::from_str(&j)?)),
            None => Ok(None),
        }
    }

    async fn load_many(
        &self,
        conn: &mut MultiplexedConnection,
        addresses: Vec<String>,
    ) -> Result<Vec<ContractInstance>, StoreError> {
        let mut instances = Vec::with_capacity(addresses.len());
        for raw in addresses {
            let Ok(address) = Address::from_str(&raw) else {
                warn!(address = %raw, "skipping malformed address in index");
                continue;
            };
            if let Some(instance) = self.load(conn, &address).await? {
                instances.push(instance);
            }
        }
        Ok(instances)
    }
}

#[async_trait]
impl ReconciliationStore for ValkeyStore {
    async fn upsert_instance(
        &self,
        event: &DeploymentEvent,
        template: TemplateId,
        config: &DeploymentConfig,
    ) -> Result<ContractInstance, StoreError> {
        let mut conn = self.conn.clone();
        let key = self.instance_key(&event.instance);
        let fresh = ContractInstance::from_event(event, template);

        // SET NX makes creation a single atomic create-if-absent.
        let created: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(serde_json::to_string(&fresh)?)
            .arg("NX")
            .query_async(&mut conn)
            .await?;

        let instance = if created.is_some() {
            info!(address = %event.instance, template = %template, "instance created");
            fresh
        } else {
            let existing = self
                .load(&mut conn, &event.instance)
                .await?
                .ok_or(StoreError::NotFound(event.instance))?;
            existing.ensure_template(template)?;
            debug!(address = %event.instance, "instance already known");
            existing
        };

        // Re-indexed on every delivery so a replay repairs a failed earlier SADD.
        conn.sadd::<_, _, ()>(self.key("instances"), addr(&event.instance))
            .await?;

        let participants_key = self.key(&format!("participants:{}", addr(&event.instance)));
        for participant in derive_participants(event.instance, template, config) {
            let field = format!("{}:{}", addr(&participant.user_address), participant.role);
            conn.hset::<_, _, _, ()>(&participants_key, field, serde_json::to_string(&participant)?)
                .await?;
            conn.sadd::<_, _, ()>(
                self.key(&format!("user:{}", addr(&participant.user_address))),
                addr(&event.instance),
            )
            .await?;
        }

        Ok(instance)
    }

    async fn update_state(
        &self,
        address: Address,
        state: StateMap,
    ) -> Result<ContractInstance, StoreError> {
        let mut conn = self.conn.clone();
        let mut instance = self
            .load(&mut conn, &address)
            .await?
            .ok_or(StoreError::NotFound(address))?;
        instance.apply_state(state);

        let written: Option<String> = redis::cmd("SET")
            .arg(self.instance_key(&address))
            .arg(serde_json::to_string(&instance)?)
            .arg("XX")
            .query_async(&mut conn)
            .await?;
        if written.is_none() {
            return Err(StoreError::NotFound(address));
        }
        Ok(instance)
    }

    async fn get_instance(&self, address: Address) -> Result<Option<ContractInstance>, StoreError> {
        let mut conn = self.conn.clone();
        self.load(&mut conn, &address).await
    }

    async fn participants(&self, address: Address) -> Result<Vec<Participant>, StoreError> {
        let mut conn = self.conn.clone();
        let rows: Vec<String> = conn
            .hvals(self.key(&format!("participants:{}", addr(&address))))
            .await?;
        let mut participants = rows
            .iter()
            .map(|j| serde_json::from_str::<Participant>(j))
            .collect::<Result<Vec<_>, _>>()?;
        participants.sort_by_key(|p| (p.role, p.user_address));
        Ok(participants)
    }

    async fn instances_for_user(&self, user: Address) -> Result<Vec<ContractInstance>, StoreError> {
        let mut conn = self.conn.clone();
        let addresses: Vec<String> = conn.smembers(self.key(&format!("user:{}", addr(&user)))).await?;
        self.load_many(&mut conn, addresses).await
    }

    async fn non_terminal_instances(&self) -> Result<Vec<ContractInstance>, StoreError> {
        let mut conn = self.conn.clone();
        let addresses: Vec<String> = conn.smembers(self.key("instances")).await?;
        let mut instances = self.load_many(&mut conn, addresses).await?;
        instances.retain(|i| !i.is_terminal());
        Ok(instances)
    }
}

/// Lowercase hex used in every key.
fn addr(address: &Address) -> String {
    address.to_string().to_lowercase()
}
