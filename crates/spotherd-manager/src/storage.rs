//! Record store interface
//!
//! Pools, configuration nodes, instances and status entries live in an
//! external transactional record store; the manager consumes it through the
//! [`Storage`] trait. [`MemoryStorage`] backs tests and the single-process
//! CLI. Instance rows are only ever mutated by the holder of the pool lock,
//! so no multi-row transactions are required of implementations.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use spotherd_core::{
    ConfigId, Instance, Pool, PoolConfigNode, PoolId, PoolStatusEntry, Result, SpotherdError,
    StatusKind,
};

/// CRUD surface the reconciler needs from the record store.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn pool(&self, id: PoolId) -> Result<Option<Pool>>;
    async fn pools(&self) -> Result<Vec<Pool>>;
    async fn update_pool(&self, pool: &Pool) -> Result<()>;

    async fn config_node(&self, id: ConfigId) -> Result<Option<PoolConfigNode>>;

    /// Instances of a pool, oldest first.
    async fn instances_by_pool(&self, pool: PoolId) -> Result<Vec<Instance>>;
    async fn instance_by_provider_id(&self, provider_id: &str) -> Result<Option<Instance>>;
    /// Insert a new instance record; returns the assigned record id.
    async fn insert_instance(&self, instance: &Instance) -> Result<u64>;
    /// Rewrite an instance record in place, keyed by its record id.
    async fn update_instance(&self, instance: &Instance) -> Result<()>;
    async fn delete_instance(&self, id: u64) -> Result<()>;

    async fn status_entries(&self, pool: PoolId) -> Result<Vec<PoolStatusEntry>>;
    async fn append_status_entry(&self, entry: &PoolStatusEntry) -> Result<()>;
    async fn delete_status_entries(&self, pool: PoolId, kind: StatusKind) -> Result<()>;
    async fn has_critical_entries(&self, pool: PoolId) -> Result<bool>;
}

/// Walk a pool's configuration chain, child first.
///
/// A chain that revisits a node is cyclic and rejected as a configuration
/// error, as is a dangling parent reference.
pub async fn config_chain(storage: &dyn Storage, root: ConfigId) -> Result<Vec<PoolConfigNode>> {
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut next = Some(root);
    while let Some(id) = next {
        if !seen.insert(id) {
            return Err(SpotherdError::Config(format!(
                "configuration chain of {id} is cyclic"
            )));
        }
        let node = storage.config_node(id).await?.ok_or_else(|| {
            SpotherdError::Config(format!("configuration {id} does not exist"))
        })?;
        next = node.parent;
        chain.push(node);
    }
    Ok(chain)
}

#[derive(Default)]
struct MemoryInner {
    pools: HashMap<PoolId, Pool>,
    configs: HashMap<ConfigId, PoolConfigNode>,
    instances: HashMap<u64, Instance>,
    next_instance_id: u64,
    entries: Vec<PoolStatusEntry>,
}

/// In-memory record store for tests and single-process runs.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<MemoryInner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a pool, for setup outside the reconciliation path.
    pub fn seed_pool(&self, pool: Pool) {
        self.inner.lock().unwrap().pools.insert(pool.id, pool);
    }

    /// Seed a configuration node, for setup outside the reconciliation path.
    pub fn seed_config(&self, node: PoolConfigNode) {
        self.inner.lock().unwrap().configs.insert(node.id, node);
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn pool(&self, id: PoolId) -> Result<Option<Pool>> {
        Ok(self.inner.lock().unwrap().pools.get(&id).cloned())
    }

    async fn pools(&self) -> Result<Vec<Pool>> {
        let inner = self.inner.lock().unwrap();
        let mut pools: Vec<_> = inner.pools.values().cloned().collect();
        pools.sort_by_key(|p| p.id);
        Ok(pools)
    }

    async fn update_pool(&self, pool: &Pool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.pools.get_mut(&pool.id) {
            Some(existing) => {
                *existing = pool.clone();
                Ok(())
            }
            None => Err(SpotherdError::Storage(format!(
                "pool {} does not exist",
                pool.id
            ))),
        }
    }

    async fn config_node(&self, id: ConfigId) -> Result<Option<PoolConfigNode>> {
        Ok(self.inner.lock().unwrap().configs.get(&id).cloned())
    }

    async fn instances_by_pool(&self, pool: PoolId) -> Result<Vec<Instance>> {
        let inner = self.inner.lock().unwrap();
        let mut instances: Vec<_> = inner
            .instances
            .values()
            .filter(|i| i.pool == pool)
            .cloned()
            .collect();
        instances.sort_by_key(|i| (i.created, i.id));
        Ok(instances)
    }

    async fn instance_by_provider_id(&self, provider_id: &str) -> Result<Option<Instance>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .instances
            .values()
            .find(|i| i.provider_id == provider_id)
            .cloned())
    }

    async fn insert_instance(&self, instance: &Instance) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_instance_id += 1;
        let id = inner.next_instance_id;
        let mut instance = instance.clone();
        instance.id = id;
        inner.instances.insert(id, instance);
        Ok(id)
    }

    async fn update_instance(&self, instance: &Instance) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.instances.get_mut(&instance.id) {
            Some(existing) => {
                *existing = instance.clone();
                Ok(())
            }
            None => Err(SpotherdError::Storage(format!(
                "instance record {} does not exist",
                instance.id
            ))),
        }
    }

    async fn delete_instance(&self, id: u64) -> Result<()> {
        self.inner.lock().unwrap().instances.remove(&id);
        Ok(())
    }

    async fn status_entries(&self, pool: PoolId) -> Result<Vec<PoolStatusEntry>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .entries
            .iter()
            .filter(|e| e.pool == pool)
            .cloned()
            .collect())
    }

    async fn append_status_entry(&self, entry: &PoolStatusEntry) -> Result<()> {
        self.inner.lock().unwrap().entries.push(entry.clone());
        Ok(())
    }

    async fn delete_status_entries(&self, pool: PoolId, kind: StatusKind) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .retain(|e| !(e.pool == pool && e.kind == kind));
        Ok(())
    }

    async fn has_critical_entries(&self, pool: PoolId) -> Result<bool> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.entries.iter().any(|e| e.pool == pool && e.is_critical))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use spotherd_core::InstanceState;

    fn instance(provider_id: &str, pool: PoolId, age_secs: i64) -> Instance {
        Instance {
            id: 0,
            provider_id: provider_id.to_string(),
            pool,
            region: "us-east-1".into(),
            zone: "us-east-1b".into(),
            status: InstanceState::Running,
            size: 4,
            hostname: None,
            created: Utc::now() - Duration::seconds(age_secs),
        }
    }

    #[tokio::test]
    async fn test_instances_ordered_oldest_first() {
        let storage = MemoryStorage::new();
        let pool = PoolId(1);
        storage.insert_instance(&instance("i-young", pool, 10)).await.unwrap();
        storage.insert_instance(&instance("i-old", pool, 100)).await.unwrap();
        storage.insert_instance(&instance("i-mid", pool, 50)).await.unwrap();

        let ordered = storage.instances_by_pool(pool).await.unwrap();
        let ids: Vec<_> = ordered.iter().map(|i| i.provider_id.as_str()).collect();
        assert_eq!(ids, vec!["i-old", "i-mid", "i-young"]);
    }

    #[tokio::test]
    async fn test_update_keyed_by_record_id() {
        let storage = MemoryStorage::new();
        let pool = PoolId(1);
        let id = storage.insert_instance(&instance("sir-1", pool, 0)).await.unwrap();

        let mut fulfilled = storage.instances_by_pool(pool).await.unwrap().remove(0);
        assert_eq!(fulfilled.id, id);
        fulfilled.provider_id = "i-abc".into();
        storage.update_instance(&fulfilled).await.unwrap();

        assert!(storage.instance_by_provider_id("sir-1").await.unwrap().is_none());
        assert!(storage.instance_by_provider_id("i-abc").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_config_chain_detects_cycles() {
        let storage = MemoryStorage::new();
        storage.seed_config(PoolConfigNode {
            id: ConfigId(1),
            name: "a".into(),
            parent: Some(ConfigId(2)),
            ..Default::default()
        });
        storage.seed_config(PoolConfigNode {
            id: ConfigId(2),
            name: "b".into(),
            parent: Some(ConfigId(1)),
            ..Default::default()
        });

        let err = config_chain(&storage, ConfigId(1)).await.unwrap_err();
        assert!(matches!(err, SpotherdError::Config(_)));
    }

    #[tokio::test]
    async fn test_config_chain_child_first() {
        let storage = MemoryStorage::new();
        storage.seed_config(PoolConfigNode {
            id: ConfigId(1),
            name: "parent".into(),
            ..Default::default()
        });
        storage.seed_config(PoolConfigNode {
            id: ConfigId(2),
            name: "child".into(),
            parent: Some(ConfigId(1)),
            ..Default::default()
        });

        let chain = config_chain(&storage, ConfigId(2)).await.unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].name, "child");
        assert_eq!(chain[1].name, "parent");
    }

    #[tokio::test]
    async fn test_status_entry_lifecycle() {
        let storage = MemoryStorage::new();
        let pool = PoolId(3);
        storage
            .append_status_entry(&PoolStatusEntry {
                pool,
                kind: StatusKind::TemporaryFailure,
                is_critical: false,
                message: "endpoint unreachable".into(),
                created: Utc::now(),
            })
            .await
            .unwrap();

        assert!(!storage.has_critical_entries(pool).await.unwrap());
        storage
            .delete_status_entries(pool, StatusKind::TemporaryFailure)
            .await
            .unwrap();
        assert!(storage.status_entries(pool).await.unwrap().is_empty());
    }
}
