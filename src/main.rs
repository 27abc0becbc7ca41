use factory_sync::api::{self, ApiState};
use factory_sync::config::{Config, StoreBackend};
use factory_sync::metrics::SyncMetrics;
use factory_sync::onchain::{
    ChainEventSource, DeploymentEvent, DeploymentWatcher, ListenerSupervisor, RpcChainSource,
    SupervisorConfig, WatcherFamily,
};
use factory_sync::store::{MemoryStore, ReconciliationStore, ValkeyStore};
use factory_sync::sync::{ScheduleConfig, SyncContext, SyncScheduler};
use factory_sync::templates::TemplateId;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const CONFIG_PATH: &str = "factory-sync.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let config = if Path::new(CONFIG_PATH).exists() {
        Config::load(Path::new(CONFIG_PATH))?
    } else {
        Config::from_env()?
    };

    // Initialize logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    info!("factory-sync v{} starting", env!("CARGO_PKG_VERSION"));

    let legacy_factory = config.legacy_factory()?;
    let generic_factory = config.generic_factory()?;
    if legacy_factory.is_none() && generic_factory.is_none() {
        warn!("no factory addresses configured; only manually registered contracts will sync");
    }

    // --- Chain ---
    let source: Arc<dyn ChainEventSource> = Arc::new(
        RpcChainSource::connect(
            &config.chain.rpc_url,
            Duration::from_millis(config.listener.subscription_poll_ms),
        )
        .await?,
    );

    // --- Store ---
    let store: Arc<dyn ReconciliationStore> = match config.store.backend {
        StoreBackend::Memory => {
            info!("using in-memory store");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Valkey => {
            let store = ValkeyStore::connect(&config.store.url, &config.store.prefix).await?;
            store.ping().await?;
            Arc::new(store)
        }
    };

    let metrics = Arc::new(SyncMetrics::default());
    let ctx = Arc::new(SyncContext::new(source.clone(), store, metrics.clone()));
    let shutdown = CancellationToken::new();

    // --- Scheduler ---
    let mut watchers = Vec::new();
    if let Some(factory) = legacy_factory {
        watchers.push(DeploymentWatcher::new(source.clone(), factory, WatcherFamily::Legacy));
    }
    if let Some(factory) = generic_factory {
        watchers.push(DeploymentWatcher::new(source.clone(), factory, WatcherFamily::Generic));
    }
    let scheduler = SyncScheduler::new(
        ctx.clone(),
        watchers,
        ScheduleConfig {
            poll_interval: config.poll_interval(),
            reconcile_interval: config.reconcile_interval(),
            lookback_blocks: config.sync.lookback_blocks,
        },
        shutdown.clone(),
    );
    let reconcile = scheduler.reconcile_trigger();
    let loops = scheduler.spawn();

    // --- Legacy push listener ---
    let mut listener_state = None;
    let mut listener_task = None;
    if let (Some(factory), true) = (legacy_factory, config.listener.enabled) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let supervisor = ListenerSupervisor::new(
            source.clone(),
            factory,
            TemplateId::LegacyRental,
            SupervisorConfig {
                base_delay: Duration::from_millis(config.listener.base_delay_ms),
                max_attempts: config.listener.max_attempts,
            },
            events_tx,
            metrics.clone(),
            shutdown.clone(),
        );
        listener_state = Some(supervisor.state());
        tokio::spawn(consume_listener_events(ctx.clone(), events_rx));
        listener_task = Some(supervisor.start());
    }

    // --- API ---
    let api_state = ApiState {
        ctx: ctx.clone(),
        reconcile,
        listener: listener_state,
    };
    let bind_addr = config.api.bind_addr.clone();
    let api_shutdown = shutdown.clone();
    let api_task = tokio::spawn(async move {
        if let Err(e) = api::serve(api_state, &bind_addr, api_shutdown).await {
            error!(error = %e, "api server failed");
        }
    });

    shutdown_signal().await?;
    info!("shutdown signal received");
    shutdown.cancel();

    let _ = loops.poll.await;
    let _ = loops.reconcile.await;
    let _ = api_task.await;
    if let Some(task) = listener_task {
        match task.await {
            Ok(Err(fatal)) => warn!(error = %fatal, "listener had already stopped"),
            Ok(Ok(())) | Err(_) => {}
        }
    }
    metrics.log_summary();
    info!("factory-sync stopped");
    Ok(())
}

/// Handle each delivered event on its own task.
async fn consume_listener_events(
    ctx: Arc<SyncContext>,
    mut events_rx: mpsc::UnboundedReceiver<DeploymentEvent>,
) {
    while let Some(event) = events_rx.recv().await {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let outcome = ctx.handle_deployment(&event).await;
            ctx.metrics().record_event(outcome.is_ok());
            if let Err(e) = outcome {
                warn!(event = %event, error = %e, "listener deployment handling failed");
            }
        });
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res,
            _ = terminate.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
