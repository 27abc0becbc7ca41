//! Everything that talks to the chain.
//!
//! Architecture:
//! - `ChainEventSource`: the node capability (heights, ranged logs, view
//!   calls, subscriptions); `RpcChainSource` implements it over alloy
//! - `DeploymentWatcher`: cursor-based polling for factory creation events
//! - `ListenerSupervisor`: push subscription with exponential-backoff reconnect
//! - `StateReader`: template-driven reads of an instance's on-chain state
//! - Deployments are normalized into `DeploymentEvent`s for the sync pipeline

pub mod abi;
pub mod monitor;
pub mod reader;
pub mod rpc;
pub mod source;
pub mod types;
pub mod watcher;

pub use monitor::{ListenerState, ListenerSupervisor, SupervisorConfig};
pub use reader::StateReader;
pub use rpc::RpcChainSource;
pub use source::{ChainError, ChainEventSource, LogSubscription};
pub use types::{DeploymentEvent, DeploymentExtra, RawLog};
pub use watcher::{DeploymentWatcher, SyncCursor, WatcherFamily};
