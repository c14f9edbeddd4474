//! Spotherd - spot instance pool manager
//!
//! ## Usage
//!
//! ```bash
//! # Reconcile every enabled pool once
//! spotherd --pools pools.json reconcile
//!
//! # Reconcile one pool
//! spotherd --pools pools.json reconcile --pool 3
//!
//! # Refresh the cached spot prices
//! spotherd --pools pools.json collect-prices
//!
//! # Periodic driver: collect prices, then reconcile, forever
//! spotherd --pools pools.json tick --interval 120
//! ```
//!
//! The pools file seeds the in-memory record store; production deployments
//! plug a database-backed [`Storage`] implementation into the library
//! instead. `REDIS_URL` selects the shared price/blacklist cache; without
//! it an in-process cache is used, which is only meaningful for a single
//! worker.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use spotherd_core::{ConfigId, Pool, PoolConfigNode, PoolId};
use spotherd_manager::{
    collect_prices, KvCache, MemoryCache, MemoryStorage, PoolReconciler, ProviderRegistry,
    RedisCache, Storage,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Spotherd: keeps spot instance pools at their target core capacity
#[derive(Parser)]
#[command(name = "spotherd")]
#[command(about = "Spot instance pool manager", long_about = None)]
struct Cli {
    /// Pool definition file (JSON)
    #[arg(long, global = true, default_value = "pools.json")]
    pools: PathBuf,

    /// Directory for the per-pool lock files
    #[arg(long, global = true, default_value = "/tmp")]
    lock_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one reconciliation tick
    Reconcile {
        /// Pool id; every enabled pool when omitted
        #[arg(long)]
        pool: Option<u32>,
    },

    /// Refresh the cached spot price snapshots
    CollectPrices,

    /// Periodic driver: collect prices, then reconcile every enabled pool
    Tick {
        /// Seconds between rounds
        #[arg(long, default_value_t = 120)]
        interval: u64,
    },
}

/// On-disk pool definitions consumed into the in-memory store.
#[derive(Deserialize)]
struct PoolsFile {
    pools: Vec<PoolSeed>,
    configs: Vec<PoolConfigNode>,
}

#[derive(Deserialize)]
struct PoolSeed {
    id: u32,
    #[serde(default = "default_enabled")]
    enabled: bool,
    config: u32,
}

fn default_enabled() -> bool {
    true
}

fn load_storage(path: &PathBuf) -> anyhow::Result<Arc<MemoryStorage>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading pool definitions from {}", path.display()))?;
    let file: PoolsFile = serde_json::from_str(&raw)
        .with_context(|| format!("parsing pool definitions from {}", path.display()))?;

    let storage = Arc::new(MemoryStorage::new());
    for node in file.configs {
        storage.seed_config(node);
    }
    for seed in &file.pools {
        storage.seed_pool(Pool {
            id: PoolId(seed.id),
            enabled: seed.enabled,
            last_cycled: None,
            config: ConfigId(seed.config),
        });
    }
    info!("Loaded {} pools from {}", file.pools.len(), path.display());
    Ok(storage)
}

async fn reconcile(
    reconciler: &PoolReconciler,
    storage: &MemoryStorage,
    pool: Option<u32>,
) -> anyhow::Result<()> {
    let pools = match pool {
        Some(id) => vec![PoolId(id)],
        None => storage
            .pools()
            .await?
            .into_iter()
            .filter(|p| p.enabled)
            .map(|p| p.id)
            .collect(),
    };
    for pool_id in pools {
        if let Err(e) = reconciler.reconcile_pool(pool_id).await {
            error!("[Pool {pool_id}] Reconciliation failed: {e}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let storage = load_storage(&cli.pools)?;
    let cache: Arc<dyn KvCache> = match std::env::var("REDIS_URL") {
        Ok(url) => Arc::new(RedisCache::connect(&url).await?),
        Err(_) => {
            warn!("REDIS_URL not set; falling back to the in-process cache");
            Arc::new(MemoryCache::new())
        }
    };
    let registry = Arc::new(ProviderRegistry::with_defaults());
    let reconciler = PoolReconciler::new(
        storage.clone(),
        cache.clone(),
        registry.clone(),
        cli.lock_dir.clone(),
    );

    match cli.command {
        Commands::Reconcile { pool } => {
            reconcile(&reconciler, &storage, pool).await?;
        }
        Commands::CollectPrices => {
            collect_prices(storage.as_ref(), cache.as_ref(), &registry).await?;
        }
        Commands::Tick { interval } => {
            info!("Running every {interval}s; Ctrl+C to stop");
            loop {
                if let Err(e) =
                    collect_prices(storage.as_ref(), cache.as_ref(), &registry).await
                {
                    error!("Price collection failed: {e}");
                }
                reconcile(&reconciler, &storage, None).await?;
                tokio::time::sleep(Duration::from_secs(interval)).await;
            }
        }
    }
    Ok(())
}
