//! Pool reconciliation
//!
//! One reconciliation tick moves a pool toward its target core capacity:
//! observe the provider's view, repair the local inventory, then scale up,
//! scale down or recycle. Ticks of the same pool are serialized by a
//! non-blocking cross-process lock; a contended tick drops instead of
//! queueing. Everything a tick does is idempotent, so a failed tick is
//! repaired by the next one.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration, Utc};
use spotherd_core::{
    flatten_chain, CloudProvider, FailedRequest, Instance, InstanceState, Pool, PoolConfig,
    PoolId, Result, SpotherdError, StatusKind, POOL_ID_TAG, UPDATABLE_TAG,
};
use tracing::{debug, error, info, warn};

use crate::cache::{
    blacklist_key, image_key, price_key, KvCache, BLACKLIST_TTL_SECS, IMAGE_TTL_SECS,
};
use crate::lock::PoolLock;
use crate::prices::parse_price_slice;
use crate::providers::ProviderRegistry;
use crate::selector::{
    determine_best_location, instances_for_cores, winnow_instance_types, PriceSnapshot,
};
use crate::status::StatusJournal;
use crate::storage::{config_chain, Storage};
use crate::userdata;

/// Per-pool reconciliation engine.
pub struct PoolReconciler {
    storage: Arc<dyn Storage>,
    cache: Arc<dyn KvCache>,
    registry: Arc<ProviderRegistry>,
    journal: StatusJournal,
    lock_dir: PathBuf,
}

impl PoolReconciler {
    pub fn new(
        storage: Arc<dyn Storage>,
        cache: Arc<dyn KvCache>,
        registry: Arc<ProviderRegistry>,
        lock_dir: PathBuf,
    ) -> Self {
        let journal = StatusJournal::new(storage.clone());
        Self {
            storage,
            cache,
            registry,
            journal,
            lock_dir,
        }
    }

    /// Run one reconciliation tick for the pool. Returns without doing
    /// anything when another tick of the same pool is still in progress.
    pub async fn reconcile_pool(&self, pool_id: PoolId) -> Result<()> {
        let Some(_lock) = PoolLock::try_acquire(&self.lock_dir, pool_id)? else {
            warn!("[Pool {pool_id}] Another check still in progress, exiting");
            return Ok(());
        };
        self.run_tick(pool_id).await
    }

    async fn run_tick(&self, pool_id: PoolId) -> Result<()> {
        let Some(mut pool) = self.storage.pool(pool_id).await? else {
            return Err(SpotherdError::Config(format!(
                "pool {pool_id} does not exist"
            )));
        };

        if self.journal.has_critical(pool_id).await? {
            return Ok(());
        }

        let config = match self.load_config(&pool).await {
            Ok(config) => config,
            Err(err) => {
                self.journal
                    .record(
                        pool_id,
                        StatusKind::ConfigError,
                        true,
                        format!("Configuration error: {err}"),
                    )
                    .await?;
                return Ok(());
            }
        };
        let provider = match self.registry.by_name(&config.provider) {
            Ok(provider) => provider,
            Err(err) => {
                self.journal
                    .record(
                        pool_id,
                        StatusKind::ConfigError,
                        true,
                        format!("Configuration error: {err}"),
                    )
                    .await?;
                return Ok(());
            }
        };
        if !provider.config_supported(&config) {
            self.journal
                .record(
                    pool_id,
                    StatusKind::ConfigError,
                    true,
                    format!(
                        "Configuration error: not supported by provider {}",
                        provider.name()
                    ),
                )
                .await?;
            return Ok(());
        }

        self.update_pool_instances(&pool, &config, provider.as_ref())
            .await?;

        // Reload the repaired inventory. Terminal records go; everything
        // else keeps counting toward capacity, stopped instances included.
        let mut cores_missing = i64::from(config.size);
        let mut kept = Vec::new();
        for instance in self.storage.instances_by_pool(pool_id).await? {
            if instance.status.is_terminal() {
                info!(
                    "[Pool {pool_id}] Deleting terminated instance {} from the inventory",
                    instance.provider_id
                );
                self.storage.delete_instance(instance.id).await?;
            } else {
                cores_missing -= i64::from(instance.size);
                kept.push(instance);
            }
        }

        if !pool.enabled {
            if !kept.is_empty() {
                self.terminate_instances(&pool, provider.as_ref(), &kept)
                    .await?;
                info!("[Pool {pool_id}] Termination complete");
            }
            return Ok(());
        }

        let cycle_due = pool.last_cycled.is_none_or(|last| {
            last < Utc::now() - Duration::seconds(config.cycle_interval as i64)
        });
        if cycle_due {
            info!("[Pool {pool_id}] Needs to be cycled, terminating all instances");
            pool.last_cycled = Some(Utc::now());
            self.terminate_instances(&pool, provider.as_ref(), &kept)
                .await?;
            self.storage.update_pool(&pool).await?;
            info!("[Pool {pool_id}] Termination complete");
        }

        if cores_missing > 0 {
            info!("[Pool {pool_id}] Needs {cores_missing} more instance cores, starting");
            if let Err(err) = self
                .start_pool_instances(&pool, &config, provider.as_ref(), cores_missing as u32)
                .await
            {
                self.journal.record_failure(pool_id, &err).await?;
            }
        } else if cores_missing < 0 {
            // Oldest instances go first, but never past the target: an
            // instance whose removal would leave the pool short is skipped,
            // otherwise the size would oscillate.
            let mut doomed = Vec::new();
            let mut missing = cores_missing;
            for instance in &kept {
                if missing + i64::from(instance.size) > 0 {
                    continue;
                }
                missing += i64::from(instance.size);
                doomed.push(instance.clone());
                if missing == 0 {
                    break;
                }
            }
            if !doomed.is_empty() {
                let over: i64 = doomed.iter().map(|i| i64::from(i.size)).sum();
                info!(
                    "[Pool {pool_id}] Has {over} instance cores over limit in {} instances, \
                     terminating",
                    doomed.len()
                );
                self.terminate_instances(&pool, provider.as_ref(), &doomed)
                    .await?;
            }
        } else {
            debug!("[Pool {pool_id}] Size is ok");
        }
        Ok(())
    }

    async fn load_config(&self, pool: &Pool) -> Result<PoolConfig> {
        let chain = config_chain(self.storage.as_ref(), pool.config).await?;
        flatten_chain(&chain).into_config()
    }

    /// Best-effort termination; provider failures become journal entries,
    /// not tick failures.
    async fn terminate_instances(
        &self,
        pool: &Pool,
        provider: &dyn CloudProvider,
        instances: &[Instance],
    ) -> Result<()> {
        let mut ids_by_region: HashMap<String, Vec<String>> = HashMap::new();
        for instance in instances {
            // Unfulfilled spot requests have nothing to terminate; they run
            // into their request timeout on their own.
            if instance.status == InstanceState::Requested {
                continue;
            }
            ids_by_region
                .entry(instance.region.clone())
                .or_default()
                .push(instance.provider_id.clone());
        }
        if ids_by_region.is_empty() {
            return Ok(());
        }
        if let Err(err) = provider.terminate_instances(pool.id, &ids_by_region).await {
            self.journal.record_failure(pool.id, &err).await?;
        }
        Ok(())
    }

    /// Reconcile the local inventory against the provider's view, region by
    /// region. Returns after journaling when a region fails; an inventory
    /// inconsistency is fatal to the whole tick.
    async fn update_pool_instances(
        &self,
        pool: &Pool,
        config: &PoolConfig,
        provider: &dyn CloudProvider,
    ) -> Result<()> {
        let instances = self.storage.instances_by_pool(pool.id).await?;
        let mut by_region: BTreeMap<String, Vec<Instance>> = BTreeMap::new();
        for instance in instances {
            by_region
                .entry(instance.region.clone())
                .or_default()
                .push(instance);
        }

        let mut tags = provider.tags(config);
        tags.insert(POOL_ID_TAG.to_string(), pool.id.to_string());

        // Local records are deleted at the end unless the provider view or
        // one of the rescue rules below accounts for them. Unfulfilled
        // requests are exempt; they are waited out, not discarded.
        let mut deletion_candidates: HashMap<String, Instance> = by_region
            .values()
            .flatten()
            .filter(|i| i.status != InstanceState::Requested)
            .map(|i| (i.provider_id.clone(), i.clone()))
            .collect();
        let mut seen_on_cloud: HashSet<String> = HashSet::new();
        let mut not_updatable: HashSet<String> = HashSet::new();
        let mut wrong_region: HashMap<String, InstanceState> = HashMap::new();

        let mut instances_created = false;
        for (region, regional) in &by_region {
            match self
                .update_region(
                    pool,
                    provider,
                    region,
                    regional,
                    &tags,
                    &mut deletion_candidates,
                    &mut seen_on_cloud,
                    &mut not_updatable,
                    &mut wrong_region,
                )
                .await
            {
                Ok(created) => instances_created |= created,
                Err(err @ SpotherdError::Inconsistent(_)) => {
                    self.journal.record_failure(pool.id, &err).await?;
                    return Err(err);
                }
                Err(err) => {
                    // One broken region must not stop the others.
                    self.journal.record_failure(pool.id, &err).await?;
                }
            }
        }

        for instance in deletion_candidates.values() {
            let mut reasons = Vec::new();
            if !seen_on_cloud.contains(&instance.provider_id) {
                reasons.push("no corresponding machine on cloud".to_string());
            }
            if not_updatable.contains(&instance.provider_id) {
                reasons.push("not updatable".to_string());
            }
            if let Some(state) = wrong_region.get(&instance.provider_id) {
                reasons.push(format!("has state {state} on cloud but not in our region"));
            }
            if reasons.is_empty() {
                reasons.push("?".to_string());
            }
            info!(
                "[Pool {}] Deleting instance {} from the inventory: {}",
                pool.id,
                instance.provider_id,
                reasons.join(", ")
            );
            self.storage.delete_instance(instance.id).await?;
        }

        if instances_created {
            // Instances launched, so earlier quota and transient warnings
            // no longer apply. Critical entries stay for the operator.
            self.journal.retract_transient(pool.id).await?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn update_region(
        &self,
        pool: &Pool,
        provider: &dyn CloudProvider,
        region: &str,
        regional: &[Instance],
        tags: &HashMap<String, String>,
        deletion_candidates: &mut HashMap<String, Instance>,
        seen_on_cloud: &mut HashSet<String>,
        not_updatable: &mut HashSet<String>,
        wrong_region: &mut HashMap<String, InstanceState>,
    ) -> Result<bool> {
        let mut instances_created = false;
        let mut known: HashMap<String, Instance> = regional
            .iter()
            .map(|i| (i.provider_id.clone(), i.clone()))
            .collect();

        // First settle the pending spot requests of this region.
        let requested_ids: Vec<String> = regional
            .iter()
            .filter(|i| i.status == InstanceState::Requested)
            .map(|i| i.provider_id.clone())
            .collect();
        if !requested_ids.is_empty() {
            let (fulfilled, failed) = provider
                .check_instance_requests(region, &requested_ids, tags)
                .await?;

            for (request_id, result) in &fulfilled {
                let Some(mut instance) = known.remove(request_id) else {
                    continue;
                };
                info!(
                    "[Pool {}] Spot request fulfilled {request_id} -> {}",
                    pool.id, result.instance_id
                );
                instance.provider_id = result.instance_id.clone();
                instance.hostname = result.hostname.clone();
                instance.status = result.status;
                self.storage.update_instance(&instance).await?;
                known.insert(result.instance_id.clone(), instance);
                instances_created = true;
            }

            for (request_id, failure) in &failed {
                let Some(instance) = known.get(request_id).cloned() else {
                    continue;
                };
                match failure {
                    FailedRequest::Blacklist { instance_type } => {
                        let key =
                            blacklist_key(provider.name(), &instance.zone, instance_type);
                        self.cache.set(&key, "", BLACKLIST_TTL_SECS).await?;
                        warn!("Blacklisted {key} for 12h");
                        self.storage.delete_instance(instance.id).await?;
                        known.remove(request_id);
                    }
                    FailedRequest::DisablePool => {
                        self.journal
                            .record(
                                pool.id,
                                StatusKind::Unclassified,
                                true,
                                format!("Spot request {request_id} failed"),
                            )
                            .await?;
                    }
                }
            }
        }

        // Then cross-reference the provider's instance view.
        let cloud_instances = provider.check_instances_state(pool.id, region).await?;
        for (cloud_id, cloud_instance) in &cloud_instances {
            seen_on_cloud.insert(cloud_id.clone());

            let updatable = cloud_instance
                .tags
                .get(UPDATABLE_TAG)
                .and_then(|v| v.parse::<i32>().ok())
                .is_some_and(|v| v > 0);
            if !updatable {
                // Spawning window: another worker still manages this
                // instance. Hands off, but a record we already have must
                // not be deleted either.
                if known.contains_key(cloud_id) {
                    deletion_candidates.remove(cloud_id);
                } else {
                    not_updatable.insert(cloud_id.clone());
                }
                continue;
            }

            let local = match known.get(cloud_id) {
                Some(instance) => Some(instance.clone()),
                None => {
                    if cloud_instance.status.is_terminal() {
                        wrong_region.insert(cloud_id.clone(), cloud_instance.status);
                        continue;
                    }
                    // The record may have been written between our inventory
                    // load and the provider query; look once more.
                    match self.storage.instance_by_provider_id(cloud_id).await? {
                        Some(instance) => {
                            error!(
                                "[Pool {}] Instance {cloud_id} was reloaded from storage",
                                pool.id
                            );
                            Some(instance)
                        }
                        None => {
                            error!(
                                "[Pool {}] Instance {cloud_id} is not in storage",
                                pool.id
                            );
                            return Err(SpotherdError::Inconsistent(format!(
                                "cloud instance {cloud_id} in region {region} has no \
                                 inventory record"
                            )));
                        }
                    }
                }
            };
            let Some(mut instance) = local else {
                continue;
            };
            deletion_candidates.remove(cloud_id);

            if instance.status != cloud_instance.status {
                instance.status = cloud_instance.status;
                self.storage.update_instance(&instance).await?;
            }
        }

        Ok(instances_created)
    }

    /// Launch enough spot requests to cover `cores_needed`, in the cheapest
    /// acceptable location.
    async fn start_pool_instances(
        &self,
        pool: &Pool,
        config: &PoolConfig,
        provider: &dyn CloudProvider,
        cores_needed: u32,
    ) -> Result<()> {
        let image_name = provider.image_name(config);
        let instance_types = provider.instance_types(config);
        let cores = provider.cores_per_instance();

        let winnowed = winnow_instance_types(&instance_types, cores, cores_needed);
        let user_data = userdata::render(config, pool.id)?;

        // Assemble the price and blacklist snapshots for the selector.
        let mut snapshot = PriceSnapshot::new();
        for instance_type in &winnowed {
            match self
                .cache
                .get(&price_key(provider.name(), instance_type))
                .await?
            {
                Some(payload) => {
                    snapshot.insert(instance_type.clone(), parse_price_slice(&payload)?);
                }
                None => warn!("No price data for {instance_type}?"),
            }
        }
        let mut blacklist = HashSet::new();
        for (instance_type, regions) in &snapshot {
            for zones in regions.values() {
                for zone in zones.keys() {
                    if self
                        .cache
                        .get(&blacklist_key(provider.name(), zone, instance_type))
                        .await?
                        .is_some()
                    {
                        blacklist.insert((zone.clone(), instance_type.clone()));
                    }
                }
            }
        }

        let mut selection_config = config.clone();
        selection_config.instance_types = winnowed;
        let selection =
            determine_best_location(&selection_config, &snapshot, &blacklist, cores);
        let Some(choice) = selection.choice else {
            warn!(
                "[Pool {}] No allowed region was cheap enough to spawn instances",
                pool.id
            );
            let mut message =
                String::from("No allowed region was cheap enough to spawn instances.");
            for (zone, price) in &selection.rejected_prices {
                message.push_str(&format!("\n{zone} at {price}"));
            }
            self.journal
                .record_once(pool.id, StatusKind::PriceTooLow, false, message)
                .await?;
            return Ok(());
        };
        info!(
            "[Pool {}] Using instance type {} in region {} with availability zone {}",
            pool.id, choice.instance_type, choice.region, choice.zone
        );

        let image_cache_key = image_key(provider.name(), &choice.region, &image_name);
        let image_id = match self.cache.get(&image_cache_key).await? {
            Some(image_id) => image_id,
            None => {
                let image_id = provider.get_image(&choice.region, config).await?;
                self.cache
                    .set(&image_cache_key, &image_id, IMAGE_TTL_SECS)
                    .await?;
                image_id
            }
        };

        let per_instance = cores.get(&choice.instance_type).copied().ok_or_else(|| {
            SpotherdError::Config(format!(
                "no core count for instance type {}",
                choice.instance_type
            ))
        })?;
        let count = instances_for_cores(cores_needed, per_instance);

        let request_ids = provider
            .start_instances(
                config,
                &choice.region,
                &choice.zone,
                &user_data,
                &image_id,
                &choice.instance_type,
                count,
            )
            .await?;

        for request_id in request_ids {
            self.storage
                .insert_instance(&Instance {
                    id: 0,
                    provider_id: request_id,
                    pool: pool.id,
                    region: choice.region.clone(),
                    zone: choice.zone.clone(),
                    status: InstanceState::Requested,
                    size: per_instance,
                    hostname: None,
                    created: Utc::now(),
                })
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spotherd_core::{ConfigId, PoolConfigNode};

    use crate::cache::MemoryCache;
    use crate::prices::collect_prices;
    use crate::providers::mock::{
        InjectedFailure, MockProvider, ScriptedOutcome, MOCK_PROVIDER_NAME,
    };
    use crate::storage::MemoryStorage;

    const POOL: PoolId = PoolId(1);

    struct Harness {
        storage: Arc<MemoryStorage>,
        cache: Arc<MemoryCache>,
        mock: Arc<MockProvider>,
        registry: Arc<ProviderRegistry>,
        reconciler: PoolReconciler,
        _lock_dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let storage = Arc::new(MemoryStorage::new());
        let cache = Arc::new(MemoryCache::new());
        let mock = Arc::new(MockProvider::new(HashMap::from([
            ("mock-small".to_string(), 4),
            ("mock-large".to_string(), 8),
        ])));
        let mut registry = ProviderRegistry::new();
        registry.register(mock.clone());
        let registry = Arc::new(registry);
        let lock_dir = tempfile::tempdir().unwrap();
        let reconciler = PoolReconciler::new(
            storage.clone(),
            cache.clone(),
            registry.clone(),
            lock_dir.path().to_path_buf(),
        );
        Harness {
            storage,
            cache,
            mock,
            registry,
            reconciler,
            _lock_dir: lock_dir,
        }
    }

    fn seed_pool(h: &Harness, size: u32) {
        h.storage.seed_config(PoolConfigNode {
            id: ConfigId(1),
            name: "pool-1".into(),
            size: Some(size),
            cycle_interval: Some(3600),
            provider: Some(MOCK_PROVIDER_NAME.into()),
            allowed_regions: Some(vec!["us-east-1".into()]),
            instance_types: Some(vec!["mock-small".into(), "mock-large".into()]),
            max_price: Some(0.05),
            user_data: Some(b"#!/bin/sh\nstart %SPOTHERD_POOLID%\n".to_vec()),
            image_name: Some("fuzzer-base".into()),
            ..Default::default()
        });
        h.storage.seed_pool(Pool {
            id: POOL,
            enabled: true,
            last_cycled: Some(Utc::now()),
            config: ConfigId(1),
        });
    }

    fn pool_tags() -> HashMap<String, String> {
        HashMap::from([
            (POOL_ID_TAG.to_string(), POOL.to_string()),
            (UPDATABLE_TAG.to_string(), "1".to_string()),
        ])
    }

    async fn seed_instance(h: &Harness, provider_id: &str, size: u32, age_secs: i64) -> Instance {
        let instance = Instance {
            id: 0,
            provider_id: provider_id.to_string(),
            pool: POOL,
            region: "us-east-1".into(),
            zone: "us-east-1b".into(),
            status: InstanceState::Running,
            size,
            hostname: None,
            created: Utc::now() - Duration::seconds(age_secs),
        };
        let id = h.storage.insert_instance(&instance).await.unwrap();
        // Matching provider-side view so the update pass keeps the record.
        h.mock.add_cloud_instance(
            POOL,
            "us-east-1",
            provider_id,
            InstanceState::Running,
            pool_tags(),
        );
        Instance { id, ..instance }
    }

    async fn seed_requested(h: &Harness, request_id: &str, zone: &str, size: u32) {
        h.storage
            .insert_instance(&Instance {
                id: 0,
                provider_id: request_id.to_string(),
                pool: POOL,
                region: "us-east-1".into(),
                zone: zone.into(),
                status: InstanceState::Requested,
                size,
                hostname: None,
                created: Utc::now(),
            })
            .await
            .unwrap();
    }

    async fn publish_prices(h: &Harness) {
        collect_prices(h.storage.as_ref(), h.cache.as_ref(), &h.registry)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_scale_up_launches_cheapest_type() {
        let h = harness();
        seed_pool(&h, 8);
        // small: $0.64 for 4 cores = $0.16/core; large: $0.24 for 8 = $0.03/core
        h.mock
            .set_prices("us-east-1", "mock-small", "us-east-1b", vec![0.64, 0.64]);
        h.mock
            .set_prices("us-east-1", "mock-large", "us-east-1c", vec![0.24, 0.24]);
        publish_prices(&h).await;

        h.reconciler.reconcile_pool(POOL).await.unwrap();

        let calls = h.mock.start_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].instance_type, "mock-large");
        assert_eq!(calls[0].zone, "us-east-1c");
        assert_eq!(calls[0].count, 1);
        assert_eq!(calls[0].image_id, "img-fuzzer-base");

        let instances = h.storage.instances_by_pool(POOL).await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].status, InstanceState::Requested);
        assert_eq!(instances[0].size, 8);
        assert!(instances[0].provider_id.starts_with("sir-mock-"));
    }

    #[tokio::test]
    async fn test_scale_down_terminates_oldest_first() {
        let h = harness();
        seed_pool(&h, 4);
        seed_instance(&h, "i-old", 4, 100).await;
        seed_instance(&h, "i-mid", 4, 50).await;
        seed_instance(&h, "i-young", 4, 10).await;

        h.reconciler.reconcile_pool(POOL).await.unwrap();

        let calls = h.mock.terminate_calls();
        assert_eq!(calls.len(), 1);
        let mut ids = calls[0].1["us-east-1"].clone();
        ids.sort();
        assert_eq!(ids, vec!["i-mid".to_string(), "i-old".to_string()]);
        assert!(h.mock.start_calls().is_empty());
    }

    #[tokio::test]
    async fn test_scale_down_never_overshoots() {
        let h = harness();
        seed_pool(&h, 6);
        // 4 + 4 = 8 cores for a 6-core target: terminating either instance
        // would leave the pool short, so both stay.
        seed_instance(&h, "i-a", 4, 100).await;
        seed_instance(&h, "i-b", 4, 50).await;

        h.reconciler.reconcile_pool(POOL).await.unwrap();

        assert!(h.mock.terminate_calls().is_empty());
    }

    #[tokio::test]
    async fn test_cycle_terminates_everything_and_stamps() {
        let h = harness();
        seed_pool(&h, 4);
        seed_instance(&h, "i-stale", 4, 5000).await;
        let mut pool = h.storage.pool(POOL).await.unwrap().unwrap();
        pool.last_cycled = Some(Utc::now() - Duration::seconds(3601));
        h.storage.update_pool(&pool).await.unwrap();

        let before = Utc::now();
        h.reconciler.reconcile_pool(POOL).await.unwrap();

        let calls = h.mock.terminate_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1["us-east-1"], vec!["i-stale".to_string()]);
        // No launch this tick; the next tick reprovisions.
        assert!(h.mock.start_calls().is_empty());

        let pool = h.storage.pool(POOL).await.unwrap().unwrap();
        assert!(pool.last_cycled.unwrap() >= before);
    }

    #[tokio::test]
    async fn test_price_too_low_appends_exactly_once() {
        let h = harness();
        seed_pool(&h, 8);
        // Everything above the $0.05/core ceiling.
        h.mock
            .set_prices("us-east-1", "mock-large", "us-east-1c", vec![0.80]);
        publish_prices(&h).await;

        h.reconciler.reconcile_pool(POOL).await.unwrap();
        h.reconciler.reconcile_pool(POOL).await.unwrap();

        assert!(h.mock.start_calls().is_empty());
        let entries = h.storage.status_entries(POOL).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, StatusKind::PriceTooLow);
        assert!(!entries[0].is_critical);
        assert!(entries[0].message.contains("us-east-1c"));
    }

    #[tokio::test]
    async fn test_fulfilled_request_rewrites_record_and_retracts() {
        let h = harness();
        seed_pool(&h, 4);
        seed_requested(&h, "sir-x", "us-east-1b", 4).await;
        h.mock.script_request(
            "sir-x",
            ScriptedOutcome::Fulfill {
                instance_id: "i-y".into(),
                hostname: Some("ec2-1-2-3-4.compute.amazonaws.com".into()),
            },
        );
        // Outstanding transient warnings must clear on the launch.
        let journal = StatusJournal::new(h.storage.clone());
        journal
            .record(POOL, StatusKind::TemporaryFailure, false, "earlier failure")
            .await
            .unwrap();
        journal
            .record(POOL, StatusKind::MaxSpotInstanceCountExceeded, false, "quota")
            .await
            .unwrap();

        h.reconciler.reconcile_pool(POOL).await.unwrap();

        let instances = h.storage.instances_by_pool(POOL).await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].provider_id, "i-y");
        assert_eq!(instances[0].status, InstanceState::Running);
        assert_eq!(
            instances[0].hostname.as_deref(),
            Some("ec2-1-2-3-4.compute.amazonaws.com")
        );
        assert!(h.storage.status_entries(POOL).await.unwrap().is_empty());
        // At capacity, nothing new launched.
        assert!(h.mock.start_calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_request_blacklists_and_deletes() {
        let h = harness();
        seed_pool(&h, 8);
        seed_requested(&h, "sir-z", "us-east-1a", 4).await;
        h.mock.script_request(
            "sir-z",
            ScriptedOutcome::Cancel {
                instance_type: "mock-small".into(),
            },
        );
        // Cheap in the cancelled zone, slightly dearer elsewhere: the fresh
        // blacklist must steer the relaunch away from us-east-1a.
        h.mock
            .set_prices("us-east-1", "mock-small", "us-east-1a", vec![0.01]);
        h.mock
            .set_prices("us-east-1", "mock-small", "us-east-1b", vec![0.02]);
        publish_prices(&h).await;

        h.reconciler.reconcile_pool(POOL).await.unwrap();

        let key = blacklist_key(MOCK_PROVIDER_NAME, "us-east-1a", "mock-small");
        assert!(h.cache.get(&key).await.unwrap().is_some());
        assert!(h
            .storage
            .instance_by_provider_id("sir-z")
            .await
            .unwrap()
            .is_none());

        let calls = h.mock.start_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].zone, "us-east-1b");
    }

    #[tokio::test]
    async fn test_failed_request_disables_pool() {
        let h = harness();
        seed_pool(&h, 4);
        seed_requested(&h, "sir-dead", "us-east-1b", 4).await;
        h.mock.script_request("sir-dead", ScriptedOutcome::Fail);

        h.reconciler.reconcile_pool(POOL).await.unwrap();

        let entries = h.storage.status_entries(POOL).await.unwrap();
        assert!(entries
            .iter()
            .any(|e| e.kind == StatusKind::Unclassified && e.is_critical));
    }

    #[tokio::test]
    async fn test_critical_entry_halts_reconciliation() {
        let h = harness();
        seed_pool(&h, 8);
        h.mock
            .set_prices("us-east-1", "mock-large", "us-east-1c", vec![0.02]);
        publish_prices(&h).await;
        StatusJournal::new(h.storage.clone())
            .record(POOL, StatusKind::Unclassified, true, "operator attention")
            .await
            .unwrap();

        h.reconciler.reconcile_pool(POOL).await.unwrap();

        assert!(h.mock.start_calls().is_empty());
        assert!(h.mock.terminate_calls().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_pool_tears_down() {
        let h = harness();
        seed_pool(&h, 8);
        seed_instance(&h, "i-a", 4, 100).await;
        let mut pool = h.storage.pool(POOL).await.unwrap().unwrap();
        pool.enabled = false;
        h.storage.update_pool(&pool).await.unwrap();

        h.reconciler.reconcile_pool(POOL).await.unwrap();

        let calls = h.mock.terminate_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1["us-east-1"], vec!["i-a".to_string()]);
        assert!(h.mock.start_calls().is_empty());
    }

    #[tokio::test]
    async fn test_broken_config_is_a_critical_config_error() {
        let h = harness();
        h.storage.seed_config(PoolConfigNode {
            id: ConfigId(1),
            name: "incomplete".into(),
            size: Some(8),
            ..Default::default()
        });
        h.storage.seed_pool(Pool {
            id: POOL,
            enabled: true,
            last_cycled: None,
            config: ConfigId(1),
        });

        h.reconciler.reconcile_pool(POOL).await.unwrap();
        // The second tick is halted by the critical entry.
        h.reconciler.reconcile_pool(POOL).await.unwrap();

        let entries = h.storage.status_entries(POOL).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, StatusKind::ConfigError);
        assert!(entries[0].is_critical);
    }

    #[tokio::test]
    async fn test_cyclic_config_is_rejected() {
        let h = harness();
        h.storage.seed_config(PoolConfigNode {
            id: ConfigId(1),
            name: "a".into(),
            parent: Some(ConfigId(2)),
            ..Default::default()
        });
        h.storage.seed_config(PoolConfigNode {
            id: ConfigId(2),
            name: "b".into(),
            parent: Some(ConfigId(1)),
            ..Default::default()
        });
        h.storage.seed_pool(Pool {
            id: POOL,
            enabled: true,
            last_cycled: None,
            config: ConfigId(1),
        });

        h.reconciler.reconcile_pool(POOL).await.unwrap();

        let entries = h.storage.status_entries(POOL).await.unwrap();
        assert_eq!(entries[0].kind, StatusKind::ConfigError);
    }

    #[tokio::test]
    async fn test_contended_pool_drops_the_tick() {
        let h = harness();
        seed_pool(&h, 8);
        h.mock
            .set_prices("us-east-1", "mock-large", "us-east-1c", vec![0.02]);
        publish_prices(&h).await;

        let _held = PoolLock::try_acquire(h._lock_dir.path(), POOL)
            .unwrap()
            .unwrap();
        h.reconciler.reconcile_pool(POOL).await.unwrap();

        assert!(h.mock.start_calls().is_empty());
        assert!(h.storage.instances_by_pool(POOL).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_cloud_instance_is_fatal() {
        let h = harness();
        seed_pool(&h, 4);
        seed_instance(&h, "i-known", 4, 100).await;
        h.mock.add_cloud_instance(
            POOL,
            "us-east-1",
            "i-ghost",
            InstanceState::Running,
            pool_tags(),
        );

        let err = h.reconciler.reconcile_pool(POOL).await.unwrap_err();
        assert!(matches!(err, SpotherdError::Inconsistent(_)));

        let entries = h.storage.status_entries(POOL).await.unwrap();
        assert!(entries
            .iter()
            .any(|e| e.kind == StatusKind::Unclassified && e.is_critical));
    }

    #[tokio::test]
    async fn test_spawning_window_instance_is_left_alone() {
        let h = harness();
        seed_pool(&h, 4);
        // Known record whose cloud instance is not yet updatable: rescued.
        seed_instance(&h, "i-spawning", 4, 10).await;
        h.mock.add_cloud_instance(
            POOL,
            "us-east-1",
            "i-spawning",
            InstanceState::Running,
            HashMap::from([(POOL_ID_TAG.to_string(), POOL.to_string())]),
        );
        // Unknown, not updatable: someone else's spawning window, no panic.
        h.mock.add_cloud_instance(
            POOL,
            "us-east-1",
            "i-foreign",
            InstanceState::Pending,
            HashMap::from([(POOL_ID_TAG.to_string(), POOL.to_string())]),
        );

        h.reconciler.reconcile_pool(POOL).await.unwrap();

        assert!(h
            .storage
            .instance_by_provider_id("i-spawning")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_vanished_instance_record_is_deleted() {
        let h = harness();
        seed_pool(&h, 4);
        // Local record with no provider-side counterpart at all.
        h.storage
            .insert_instance(&Instance {
                id: 0,
                provider_id: "i-vanished".into(),
                pool: POOL,
                region: "us-east-1".into(),
                zone: "us-east-1b".into(),
                status: InstanceState::Running,
                size: 4,
                hostname: None,
                created: Utc::now(),
            })
            .await
            .unwrap();

        h.reconciler.reconcile_pool(POOL).await.unwrap();

        assert!(h
            .storage
            .instance_by_provider_id("i-vanished")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_status_drift_is_copied_to_the_record() {
        let h = harness();
        seed_pool(&h, 4);
        let seeded = seed_instance(&h, "i-drift", 4, 100).await;
        h.mock.add_cloud_instance(
            POOL,
            "us-east-1",
            "i-drift",
            InstanceState::Stopping,
            pool_tags(),
        );

        h.reconciler.reconcile_pool(POOL).await.unwrap();

        let instance = h
            .storage
            .instance_by_provider_id("i-drift")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(instance.id, seeded.id);
        assert_eq!(instance.status, InstanceState::Stopping);
    }

    #[tokio::test]
    async fn test_launch_quota_failure_is_journaled_not_fatal() {
        let h = harness();
        seed_pool(&h, 8);
        h.mock
            .set_prices("us-east-1", "mock-large", "us-east-1c", vec![0.02]);
        publish_prices(&h).await;
        h.mock
            .fail_next_start(InjectedFailure::MaxSpotInstanceCountExceeded);

        h.reconciler.reconcile_pool(POOL).await.unwrap();

        let entries = h.storage.status_entries(POOL).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, StatusKind::MaxSpotInstanceCountExceeded);
        assert!(!entries[0].is_critical);
        assert!(h.storage.instances_by_pool(POOL).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_residual_need_is_left_for_the_next_tick() {
        let h = harness();
        seed_pool(&h, 12);
        h.mock
            .set_prices("us-east-1", "mock-small", "us-east-1b", vec![0.16]);
        h.mock
            .set_prices("us-east-1", "mock-large", "us-east-1c", vec![0.24]);
        publish_prices(&h).await;

        // 12 cores wanted: one 8-core instance now, 4 cores next tick.
        h.reconciler.reconcile_pool(POOL).await.unwrap();
        let calls = h.mock.start_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].instance_type, "mock-large");
        assert_eq!(calls[0].count, 1);
    }
}
