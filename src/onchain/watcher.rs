//! Cursor-based polling for factory creation events.
//!
//! Each watcher covers one factory and one event family. A poll queries
//! `[cursor + 1, head]` for every creation signature of the family; any
//! failed fetch fails the whole poll so the range is retried next tick.

use crate::onchain::abi;
use crate::onchain::source::{ChainError, ChainEventSource};
use crate::onchain::types::{DeploymentEvent, DeploymentExtra, RawLog};
use crate::templates::TemplateId;

use alloy::primitives::{Address, B256};
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Last block whose creation events have been fully dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncCursor {
    pub last_processed_block: u64,
}

impl SyncCursor {
    pub fn at(last_processed_block: u64) -> Self {
        Self { last_processed_block }
    }

    /// Startup cursor: the first poll rescans `[head - lookback, head]`.
    pub fn from_head(head: u64, lookback: u64) -> Self {
        Self::at(head.saturating_sub(lookback).saturating_sub(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherFamily {
    /// The first-generation rental factory: `RentalDeployed` only.
    Legacy,
    /// The clone factory: one creation event per registered template.
    Generic,
}

impl WatcherFamily {
    pub fn templates(self) -> &'static [TemplateId] {
        match self {
            WatcherFamily::Legacy => &[TemplateId::LegacyRental],
            WatcherFamily::Generic => &[
                TemplateId::RentVault,
                TemplateId::GroupBuyEscrow,
                TemplateId::StableAllowanceTreasury,
            ],
        }
    }
}

#[derive(Debug)]
pub struct PollOutcome {
    pub cursor: SyncCursor,
    pub events: Vec<DeploymentEvent>,
}

pub struct DeploymentWatcher {
    source: Arc<dyn ChainEventSource>,
    factory: Address,
    family: WatcherFamily,
    topics: Vec<(TemplateId, B256)>,
}

impl DeploymentWatcher {
    pub fn new(source: Arc<dyn ChainEventSource>, factory: Address, family: WatcherFamily) -> Self {
        let topics = family
            .templates()
            .iter()
            .map(|t| (*t, abi::event_topic(t.descriptor().creation_event)))
            .collect();
        Self {
            source,
            factory,
            family,
            topics,
        }
    }

    pub fn factory(&self) -> Address {
        self.factory
    }

    pub async fn init_cursor(&self, lookback: u64) -> Result<SyncCursor, ChainError> {
        let head = self.source.current_height().await?;
        let cursor = SyncCursor::from_head(head, lookback);
        info!(
            factory = %self.factory,
            family = ?self.family,
            head = head,
            from_block = cursor.last_processed_block + 1,
            "deployment watcher initialised"
        );
        Ok(cursor)
    }

    pub async fn poll_once(&self, cursor: SyncCursor) -> Result<PollOutcome, ChainError> {
        let head = self.source.current_height().await?;
        if head <= cursor.last_processed_block {
            return Ok(PollOutcome {
                cursor,
                events: Vec::new(),
            });
        }
        let from_block = cursor.last_processed_block + 1;

        let fetches = self.topics.iter().map(|(template, topic)| async move {
            self.source
                .get_logs(self.factory, *topic, from_block, head)
                .await
                .map(|logs| (*template, logs))
        });
        let batches = try_join_all(fetches).await?;

        let mut events = Vec::new();
        for (template, logs) in batches {
            for log in logs {
                match decode_deployment(template, &log) {
                    Ok(event) => events.push(event),
                    Err(e) => warn!(
                        factory = %self.factory,
                        block = log.block_number,
                        tx = %log.transaction_hash,
                        error = %e,
                        "skipping undecodable creation log"
                    ),
                }
            }
        }
        events.sort_by_key(|e| (e.block_number, e.log_index));

        if events.is_empty() {
            debug!(factory = %self.factory, from_block, to_block = head, "no new deployments");
        } else {
            info!(
                factory = %self.factory,
                from_block,
                to_block = head,
                count = events.len(),
                "discovered deployments"
            );
        }

        Ok(PollOutcome {
            cursor: SyncCursor::at(head),
            events,
        })
    }
}

/// Normalize a creation log. All creation events index
/// `(creator, instance, third)` in topics 1..=3.
pub fn decode_deployment(template: TemplateId, log: &RawLog) -> Result<DeploymentEvent, ChainError> {
    let [_, creator, instance, third] = log.topics.as_slice() else {
        return Err(ChainError::Decode(format!(
            "expected 4 topics, got {}",
            log.topics.len()
        )));
    };
    let third = abi::topic_address(third);

    let extra = match template {
        TemplateId::LegacyRental => {
            let (tenant, suggested_name) = abi::decode_rental_payload(&log.data)
                .ok_or_else(|| ChainError::Decode("malformed RentalDeployed payload".into()))?;
            DeploymentExtra::Legacy {
                landlord: third,
                tenant,
                suggested_name,
            }
        }
        TemplateId::RentVault | TemplateId::GroupBuyEscrow => DeploymentExtra::Recipient(third),
        TemplateId::StableAllowanceTreasury => DeploymentExtra::Owner(third),
    };

    Ok(DeploymentEvent {
        template,
        creator: abi::topic_address(creator),
        instance: abi::topic_address(instance),
        block_number: log.block_number,
        transaction_hash: log.transaction_hash,
        log_index: log.log_index,
        extra,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{creation_log, rental_log, FakeChain};
    use alloy::primitives::address;

    const FACTORY: Address = address!("00000000000000000000000000000000000000f1");
    const CREATOR: Address = address!("00000000000000000000000000000000000000c0");
    const RECIPIENT: Address = address!("00000000000000000000000000000000000000d0");

    #[test]
    fn test_cursor_from_head_covers_lookback_window() {
        assert_eq!(SyncCursor::from_head(1_000, 100).last_processed_block, 899);
        assert_eq!(SyncCursor::from_head(50, 100).last_processed_block, 0);
    }

    #[test]
    fn test_decode_generic_and_legacy_events() {
        let vault = address!("00000000000000000000000000000000000000a1");
        let log = creation_log(FACTORY, TemplateId::RentVault, CREATOR, vault, RECIPIENT, 42, 3);
        let event = decode_deployment(TemplateId::RentVault, &log).unwrap();
        assert_eq!(event.creator, CREATOR);
        assert_eq!(event.instance, vault);
        assert_eq!(event.extra, DeploymentExtra::Recipient(RECIPIENT));

        let tenant = address!("00000000000000000000000000000000000000e0");
        let log = rental_log(FACTORY, CREATOR, vault, RECIPIENT, tenant, "Flat 2", 43, 0);
        let event = decode_deployment(TemplateId::LegacyRental, &log).unwrap();
        assert_eq!(
            event.extra,
            DeploymentExtra::Legacy {
                landlord: RECIPIENT,
                tenant,
                suggested_name: "Flat 2".into(),
            }
        );

        let mut short = log.clone();
        short.topics.truncate(2);
        assert!(decode_deployment(TemplateId::LegacyRental, &short).is_err());
    }

    #[tokio::test]
    async fn test_poll_discovers_rent_vault_and_advances_cursor() {
        let vault = address!("00000000000000000000000000000000000000a1");
        let chain = Arc::new(FakeChain::new());
        chain.set_height(105);
        chain.push_log(creation_log(FACTORY, TemplateId::RentVault, CREATOR, vault, RECIPIENT, 103, 0));

        let watcher = DeploymentWatcher::new(chain.clone(), FACTORY, WatcherFamily::Generic);
        let outcome = watcher.poll_once(SyncCursor::at(98)).await.unwrap();

        assert_eq!(outcome.cursor, SyncCursor::at(105));
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.events[0].template, TemplateId::RentVault);
        assert_eq!(outcome.events[0].instance, vault);
        for query in chain.log_queries() {
            assert_eq!((query.from_block, query.to_block), (99, 105));
        }
        assert_eq!(chain.log_queries().len(), 3);
    }

    #[tokio::test]
    async fn test_poll_without_new_blocks_keeps_cursor() {
        let chain = Arc::new(FakeChain::new());
        chain.set_height(98);
        let watcher = DeploymentWatcher::new(chain.clone(), FACTORY, WatcherFamily::Generic);
        let outcome = watcher.poll_once(SyncCursor::at(98)).await.unwrap();
        assert_eq!(outcome.cursor, SyncCursor::at(98));
        assert!(outcome.events.is_empty());
        assert!(chain.log_queries().is_empty());
    }

    #[tokio::test]
    async fn test_poll_fails_whole_tick_on_any_fetch_failure() {
        let chain = Arc::new(FakeChain::new());
        chain.set_height(120);
        chain.fail_topic(abi::event_topic(
            TemplateId::GroupBuyEscrow.descriptor().creation_event,
        ));
        let watcher = DeploymentWatcher::new(chain.clone(), FACTORY, WatcherFamily::Generic);
        assert!(watcher.poll_once(SyncCursor::at(100)).await.is_err());
    }

    #[tokio::test]
    async fn test_lookback_rediscovers_events_after_restart() {
        let vault = address!("00000000000000000000000000000000000000a2");
        let chain = Arc::new(FakeChain::new());
        chain.set_height(500);
        // Deployed exactly at the edge of the lookback window.
        chain.push_log(creation_log(FACTORY, TemplateId::RentVault, CREATOR, vault, RECIPIENT, 400, 1));

        let watcher = DeploymentWatcher::new(chain.clone(), FACTORY, WatcherFamily::Generic);
        let cursor = watcher.init_cursor(100).await.unwrap();
        let outcome = watcher.poll_once(cursor).await.unwrap();
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.events[0].block_number, 400);
    }

    #[tokio::test]
    async fn test_events_are_ordered_across_signatures() {
        let chain = Arc::new(FakeChain::new());
        chain.set_height(10);
        let a = address!("00000000000000000000000000000000000000a1");
        let b = address!("00000000000000000000000000000000000000a2");
        let c = address!("00000000000000000000000000000000000000a3");
        chain.push_log(creation_log(FACTORY, TemplateId::StableAllowanceTreasury, CREATOR, c, RECIPIENT, 9, 0));
        chain.push_log(creation_log(FACTORY, TemplateId::RentVault, CREATOR, a, RECIPIENT, 9, 4));
        chain.push_log(creation_log(FACTORY, TemplateId::GroupBuyEscrow, CREATOR, b, RECIPIENT, 7, 2));

        let watcher = DeploymentWatcher::new(chain, FACTORY, WatcherFamily::Generic);
        let outcome = watcher.poll_once(SyncCursor::at(0)).await.unwrap();
        let order: Vec<Address> = outcome.events.iter().map(|e| e.instance).collect();
        assert_eq!(order, vec![b, c, a]);
        assert_eq!(outcome.events[1].extra, DeploymentExtra::Owner(RECIPIENT));
    }
}
