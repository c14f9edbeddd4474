//! Spot price collection
//!
//! A periodic task queries each provider's recent price history for the
//! union of every enabled pool's instance types across the union of their
//! allowed regions, and writes one snapshot per instance type to the cache.
//! Readers (the selector) only ever see the cache. A collection failure is
//! retryable: the previous snapshot stays in place until its TTL expires.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use futures::future::join_all;
use spotherd_core::{flatten_chain, Result, SpotherdError, ZonePrices};
use tracing::{info, warn};

use crate::cache::{price_key, KvCache, PRICE_TTL_SECS};
use crate::providers::ProviderRegistry;
use crate::storage::{config_chain, Storage};

/// Cached slice for one instance type: region to zone to prices, newest
/// first.
pub type RegionPrices = BTreeMap<String, ZonePrices>;

/// Parse a cached per-instance-type price slice.
pub fn parse_price_slice(payload: &str) -> Result<RegionPrices> {
    serde_json::from_str(payload)
        .map_err(|e| SpotherdError::Cache(format!("corrupt price snapshot: {e}")))
}

/// Refresh the cached price snapshots for every provider in use.
pub async fn collect_prices(
    storage: &dyn Storage,
    cache: &dyn KvCache,
    registry: &ProviderRegistry,
) -> Result<()> {
    // Union of instance types and regions per provider, across all enabled
    // pools. Pools with broken configs are skipped here, not failed: the
    // reconciler is where config errors get journaled.
    let mut wanted: HashMap<String, (BTreeSet<String>, BTreeSet<String>)> = HashMap::new();
    for pool in storage.pools().await? {
        if !pool.enabled {
            continue;
        }
        let config = match config_chain(storage, pool.config).await {
            Ok(chain) => match flatten_chain(&chain).into_config() {
                Ok(config) => config,
                Err(e) => {
                    warn!("[Pool {}] Skipping price collection: {e}", pool.id);
                    continue;
                }
            },
            Err(e) => {
                warn!("[Pool {}] Skipping price collection: {e}", pool.id);
                continue;
            }
        };
        let provider = match registry.by_name(&config.provider) {
            Ok(provider) => provider,
            Err(e) => {
                warn!("[Pool {}] Skipping price collection: {e}", pool.id);
                continue;
            }
        };
        let entry = wanted.entry(config.provider.clone()).or_default();
        entry.0.extend(provider.instance_types(&config));
        entry.1.extend(provider.allowed_regions(&config));
    }

    for (provider_name, (types, regions)) in wanted {
        let provider = registry.by_name(&provider_name)?;
        let types: Vec<String> = types.into_iter().collect();
        let regions: Vec<String> = regions.into_iter().collect();

        let queries = regions
            .iter()
            .map(|region| provider.price_history_per_region(region, &types));
        let mut merged: BTreeMap<String, RegionPrices> = BTreeMap::new();
        for (region, result) in regions.iter().zip(join_all(queries).await) {
            let per_region = result?;
            for (instance_type, zones) in per_region {
                merged
                    .entry(instance_type)
                    .or_default()
                    .insert(region.clone(), zones);
            }
        }

        for (instance_type, region_prices) in &merged {
            let payload = serde_json::to_string(region_prices)
                .map_err(|e| SpotherdError::Cache(e.to_string()))?;
            cache
                .set(
                    &price_key(&provider_name, instance_type),
                    &payload,
                    PRICE_TTL_SECS,
                )
                .await?;
        }
        info!(
            "Cached spot prices of {} instance types across {} regions for {provider_name}",
            merged.len(),
            regions.len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use spotherd_core::{ConfigId, Pool, PoolConfigNode, PoolId};

    use crate::cache::MemoryCache;
    use crate::providers::mock::{MockProvider, MOCK_PROVIDER_NAME};
    use crate::storage::MemoryStorage;

    fn seed_pool(storage: &MemoryStorage, id: u32, types: &[&str], regions: &[&str]) {
        storage.seed_config(PoolConfigNode {
            id: ConfigId(id),
            name: format!("pool-{id}"),
            size: Some(8),
            cycle_interval: Some(3600),
            provider: Some(MOCK_PROVIDER_NAME.into()),
            allowed_regions: Some(regions.iter().map(|s| s.to_string()).collect()),
            instance_types: Some(types.iter().map(|s| s.to_string()).collect()),
            max_price: Some(0.1),
            user_data: Some(b"#!/bin/sh\n".to_vec()),
            image_name: Some("img".into()),
            ..Default::default()
        });
        storage.seed_pool(Pool {
            id: PoolId(id),
            enabled: true,
            last_cycled: None,
            config: ConfigId(id),
        });
    }

    #[tokio::test]
    async fn test_collects_union_across_pools() {
        let storage = MemoryStorage::new();
        seed_pool(&storage, 1, &["mock-small"], &["us-east-1"]);
        seed_pool(&storage, 2, &["mock-large"], &["us-west-2"]);

        let mock = Arc::new(MockProvider::new(HashMap::from([
            ("mock-small".to_string(), 4),
            ("mock-large".to_string(), 8),
        ])));
        mock.set_prices("us-east-1", "mock-small", "us-east-1b", vec![0.05, 0.04]);
        mock.set_prices("us-west-2", "mock-large", "us-west-2a", vec![0.2, 0.3]);

        let mut registry = ProviderRegistry::new();
        registry.register(mock);
        let cache = MemoryCache::new();

        collect_prices(&storage, &cache, &registry).await.unwrap();

        let small = cache
            .get(&price_key(MOCK_PROVIDER_NAME, "mock-small"))
            .await
            .unwrap()
            .expect("snapshot cached");
        let parsed = parse_price_slice(&small).unwrap();
        assert_eq!(parsed["us-east-1"]["us-east-1b"], vec![0.05, 0.04]);

        let large = cache
            .get(&price_key(MOCK_PROVIDER_NAME, "mock-large"))
            .await
            .unwrap()
            .expect("snapshot cached");
        let parsed = parse_price_slice(&large).unwrap();
        assert_eq!(parsed["us-west-2"]["us-west-2a"], vec![0.2, 0.3]);
    }

    #[tokio::test]
    async fn test_disabled_pools_are_ignored() {
        let storage = MemoryStorage::new();
        seed_pool(&storage, 1, &["mock-small"], &["us-east-1"]);
        let mut pool = storage.pool(PoolId(1)).await.unwrap().unwrap();
        pool.enabled = false;
        storage.update_pool(&pool).await.unwrap();

        let mock = Arc::new(MockProvider::new(HashMap::from([(
            "mock-small".to_string(),
            4,
        )])));
        mock.set_prices("us-east-1", "mock-small", "us-east-1b", vec![0.05]);
        let mut registry = ProviderRegistry::new();
        registry.register(mock);
        let cache = MemoryCache::new();

        collect_prices(&storage, &cache, &registry).await.unwrap();
        assert_eq!(
            cache
                .get(&price_key(MOCK_PROVIDER_NAME, "mock-small"))
                .await
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_price_slice("not json"),
            Err(SpotherdError::Cache(_))
        ));
    }
}
