//! Core traits for spotherd
//!
//! The CloudProvider trait defines the interface ALL cloud providers must
//! implement. The reconciler works through this interface ONLY - never
//! concrete types.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;

use crate::config::PoolConfig;
use crate::error::Result;
use crate::types::{InstanceState, PoolId};

/// Recent prices per zone (or per region, for providers without zones),
/// newest first.
pub type ZonePrices = BTreeMap<String, Vec<f64>>;

/// A fulfilled spot request: the instance now exists.
#[derive(Debug, Clone)]
pub struct FulfilledRequest {
    pub instance_id: String,
    pub hostname: Option<String>,
    pub status: InstanceState,
}

/// Terminal outcome of a spot request that will never be fulfilled.
#[derive(Debug, Clone)]
pub enum FailedRequest {
    /// Cancelled or closed; avoid this zone / instance-type pair for a while
    Blacklist { instance_type: String },
    /// Failed outright; the pool needs operator attention
    DisablePool,
}

/// A provider-side instance as seen by [`CloudProvider::check_instances_state`].
#[derive(Debug, Clone)]
pub struct CloudInstance {
    pub status: InstanceState,
    pub tags: HashMap<String, String>,
}

/// All cloud providers must implement this trait.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Provider name; also the cache key namespace
    fn name(&self) -> &'static str;

    /// Whether locations below the region level exist for this provider
    fn uses_zones(&self) -> bool;

    /// Whether the given configuration carries this provider's fields
    fn config_supported(&self, config: &PoolConfig) -> bool;

    /// Machine shape to virtual core count
    fn cores_per_instance(&self) -> &HashMap<String, u32>;

    /// Config accessors, so callers never reach into provider-specific keys
    fn allowed_regions(&self, config: &PoolConfig) -> Vec<String>;
    fn instance_types(&self, config: &PoolConfig) -> Vec<String>;
    fn max_price(&self, config: &PoolConfig) -> f64;
    fn image_name(&self, config: &PoolConfig) -> String;
    fn tags(&self, config: &PoolConfig) -> HashMap<String, String>;

    /// Best-effort termination of the given instances, grouped by region.
    ///
    /// The pool id scopes the provider-side consistency check: instances the
    /// provider reports under this pool but absent from `ids_by_region` are
    /// warned about, not terminated.
    async fn terminate_instances(
        &self,
        pool_id: PoolId,
        ids_by_region: &HashMap<String, Vec<String>>,
    ) -> Result<()>;

    /// Submit `count` spot purchase requests. Returns provider-assigned
    /// request ids; the instances themselves do not exist yet.
    #[allow(clippy::too_many_arguments)]
    async fn start_instances(
        &self,
        config: &PoolConfig,
        region: &str,
        zone: &str,
        user_data: &[u8],
        image_id: &str,
        instance_type: &str,
        count: u32,
    ) -> Result<Vec<String>>;

    /// Poll pending spot requests.
    ///
    /// Fulfilled requests are tagged with `tags` plus the updatable handoff
    /// marker and returned with their new instance identity; failed requests
    /// return the action to take. Requests still open appear in neither map.
    async fn check_instance_requests(
        &self,
        region: &str,
        request_ids: &[String],
        tags: &HashMap<String, String>,
    ) -> Result<(
        HashMap<String, FulfilledRequest>,
        HashMap<String, FailedRequest>,
    )>;

    /// All non-terminated instances the provider holds for this pool in the
    /// region, keyed by instance id.
    async fn check_instances_state(
        &self,
        pool_id: PoolId,
        region: &str,
    ) -> Result<HashMap<String, CloudInstance>>;

    /// Resolve the configured image name to a provider image id.
    async fn get_image(&self, region: &str, config: &PoolConfig) -> Result<String>;

    /// Recent spot price history for one region: instance type to zone to
    /// prices, newest first.
    async fn price_history_per_region(
        &self,
        region: &str,
        instance_types: &[String],
    ) -> Result<BTreeMap<String, ZonePrices>>;
}
