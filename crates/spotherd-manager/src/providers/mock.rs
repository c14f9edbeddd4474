//! Scriptable in-process provider
//!
//! Implements the full provider interface against programmed state, so the
//! reconciler can be exercised end to end without a cloud account. Spot
//! request outcomes, the provider-side instance view and region price
//! histories are all set up by the caller; launch and terminate calls are
//! recorded for inspection.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use spotherd_core::{
    CloudInstance, CloudProvider, FailedRequest, FulfilledRequest, InstanceState, PoolConfig,
    PoolId, Result, SpotherdError, ZonePrices, POOL_ID_TAG, UPDATABLE_TAG,
};

pub const MOCK_PROVIDER_NAME: &str = "Mock";

/// Programmed outcome of one spot request id.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    /// Request fulfilled; the instance appears in the provider view tagged
    /// with the tags passed to the poll call
    Fulfill {
        instance_id: String,
        hostname: Option<String>,
    },
    /// Request cancelled or closed; the caller should blacklist
    Cancel { instance_type: String },
    /// Request failed outright; the pool should be disabled
    Fail,
    /// Request still open; appears in neither result map
    StillOpen,
}

/// Failure to inject into the next launch attempt.
#[derive(Debug, Clone, Copy)]
pub enum InjectedFailure {
    MaxSpotInstanceCountExceeded,
    Temporary,
    Unclassified,
}

impl InjectedFailure {
    fn into_error(self) -> SpotherdError {
        match self {
            Self::MaxSpotInstanceCountExceeded => {
                SpotherdError::MaxSpotInstanceCountExceeded("injected quota failure".into())
            }
            Self::Temporary => SpotherdError::Temporary("injected temporary failure".into()),
            Self::Unclassified => SpotherdError::Unclassified("injected failure".into()),
        }
    }
}

/// One recorded launch call.
#[derive(Debug, Clone)]
pub struct StartCall {
    pub region: String,
    pub zone: String,
    pub instance_type: String,
    pub image_id: String,
    pub count: u32,
}

#[derive(Default)]
struct MockState {
    prices: HashMap<String, BTreeMap<String, ZonePrices>>,
    outcomes: HashMap<String, ScriptedOutcome>,
    cloud: HashMap<(PoolId, String), HashMap<String, CloudInstance>>,
    start_calls: Vec<StartCall>,
    terminate_calls: Vec<(PoolId, HashMap<String, Vec<String>>)>,
    fail_next_start: Option<InjectedFailure>,
    next_request: u32,
}

/// The scriptable provider.
pub struct MockProvider {
    cores: HashMap<String, u32>,
    state: Mutex<MockState>,
}

impl MockProvider {
    pub fn new(cores: HashMap<String, u32>) -> Self {
        Self {
            cores,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Program the price history of one (region, instance type, zone).
    pub fn set_prices(&self, region: &str, instance_type: &str, zone: &str, prices: Vec<f64>) {
        self.state
            .lock()
            .unwrap()
            .prices
            .entry(region.to_string())
            .or_default()
            .entry(instance_type.to_string())
            .or_default()
            .insert(zone.to_string(), prices);
    }

    /// Program the outcome the next poll reports for a request id.
    pub fn script_request(&self, request_id: &str, outcome: ScriptedOutcome) {
        self.state
            .lock()
            .unwrap()
            .outcomes
            .insert(request_id.to_string(), outcome);
    }

    /// Place an instance in the provider-side view of a pool.
    pub fn add_cloud_instance(
        &self,
        pool: PoolId,
        region: &str,
        instance_id: &str,
        status: InstanceState,
        tags: HashMap<String, String>,
    ) {
        self.state
            .lock()
            .unwrap()
            .cloud
            .entry((pool, region.to_string()))
            .or_default()
            .insert(instance_id.to_string(), CloudInstance { status, tags });
    }

    /// Make the next launch attempt fail with the given classification.
    pub fn fail_next_start(&self, failure: InjectedFailure) {
        self.state.lock().unwrap().fail_next_start = Some(failure);
    }

    pub fn start_calls(&self) -> Vec<StartCall> {
        self.state.lock().unwrap().start_calls.clone()
    }

    pub fn terminate_calls(&self) -> Vec<(PoolId, HashMap<String, Vec<String>>)> {
        self.state.lock().unwrap().terminate_calls.clone()
    }
}

#[async_trait]
impl CloudProvider for MockProvider {
    fn name(&self) -> &'static str {
        MOCK_PROVIDER_NAME
    }

    fn uses_zones(&self) -> bool {
        true
    }

    fn config_supported(&self, _config: &PoolConfig) -> bool {
        true
    }

    fn cores_per_instance(&self) -> &HashMap<String, u32> {
        &self.cores
    }

    fn allowed_regions(&self, config: &PoolConfig) -> Vec<String> {
        config.allowed_regions.clone()
    }

    fn instance_types(&self, config: &PoolConfig) -> Vec<String> {
        config.instance_types.clone()
    }

    fn max_price(&self, config: &PoolConfig) -> f64 {
        config.max_price
    }

    fn image_name(&self, config: &PoolConfig) -> String {
        config.image_name.clone()
    }

    fn tags(&self, config: &PoolConfig) -> HashMap<String, String> {
        config.tags.clone()
    }

    async fn terminate_instances(
        &self,
        pool_id: PoolId,
        ids_by_region: &HashMap<String, Vec<String>>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for (region, ids) in ids_by_region {
            if let Some(instances) = state.cloud.get_mut(&(pool_id, region.clone())) {
                for id in ids {
                    if let Some(instance) = instances.get_mut(id) {
                        instance.status = InstanceState::ShuttingDown;
                    }
                }
            }
        }
        state.terminate_calls.push((pool_id, ids_by_region.clone()));
        Ok(())
    }

    async fn start_instances(
        &self,
        _config: &PoolConfig,
        region: &str,
        zone: &str,
        _user_data: &[u8],
        image_id: &str,
        instance_type: &str,
        count: u32,
    ) -> Result<Vec<String>> {
        let mut state = self.state.lock().unwrap();
        if let Some(failure) = state.fail_next_start.take() {
            return Err(failure.into_error());
        }
        state.start_calls.push(StartCall {
            region: region.to_string(),
            zone: zone.to_string(),
            instance_type: instance_type.to_string(),
            image_id: image_id.to_string(),
            count,
        });
        let mut request_ids = Vec::new();
        for _ in 0..count {
            state.next_request += 1;
            request_ids.push(format!("sir-mock-{}", state.next_request));
        }
        Ok(request_ids)
    }

    async fn check_instance_requests(
        &self,
        region: &str,
        request_ids: &[String],
        tags: &HashMap<String, String>,
    ) -> Result<(
        HashMap<String, FulfilledRequest>,
        HashMap<String, FailedRequest>,
    )> {
        let mut fulfilled = HashMap::new();
        let mut failed = HashMap::new();
        let mut state = self.state.lock().unwrap();

        for request_id in request_ids {
            match state.outcomes.get(request_id).cloned() {
                Some(ScriptedOutcome::Fulfill {
                    instance_id,
                    hostname,
                }) => {
                    // The fulfilled instance becomes visible in the pool's
                    // provider view, tagged and marked updatable.
                    if let Some(pool) = tags
                        .get(POOL_ID_TAG)
                        .and_then(|v| v.parse().ok())
                        .map(PoolId)
                    {
                        let mut instance_tags = tags.clone();
                        instance_tags.insert(UPDATABLE_TAG.to_string(), "1".to_string());
                        state
                            .cloud
                            .entry((pool, region.to_string()))
                            .or_default()
                            .insert(
                                instance_id.clone(),
                                CloudInstance {
                                    status: InstanceState::Running,
                                    tags: instance_tags,
                                },
                            );
                    }
                    fulfilled.insert(
                        request_id.clone(),
                        FulfilledRequest {
                            instance_id,
                            hostname,
                            status: InstanceState::Running,
                        },
                    );
                }
                Some(ScriptedOutcome::Cancel { instance_type }) => {
                    failed.insert(
                        request_id.clone(),
                        FailedRequest::Blacklist { instance_type },
                    );
                }
                Some(ScriptedOutcome::Fail) => {
                    failed.insert(request_id.clone(), FailedRequest::DisablePool);
                    break;
                }
                Some(ScriptedOutcome::StillOpen) | None => {}
            }
        }
        Ok((fulfilled, failed))
    }

    async fn check_instances_state(
        &self,
        pool_id: PoolId,
        region: &str,
    ) -> Result<HashMap<String, CloudInstance>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .cloud
            .get(&(pool_id, region.to_string()))
            .map(|instances| {
                instances
                    .iter()
                    .filter(|(_, i)| !i.status.is_terminal())
                    .map(|(id, i)| (id.clone(), i.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_image(&self, _region: &str, config: &PoolConfig) -> Result<String> {
        Ok(format!("img-{}", config.image_name))
    }

    async fn price_history_per_region(
        &self,
        region: &str,
        instance_types: &[String],
    ) -> Result<BTreeMap<String, ZonePrices>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .prices
            .get(region)
            .map(|types| {
                types
                    .iter()
                    .filter(|(ty, _)| instance_types.contains(ty))
                    .map(|(ty, zones)| (ty.clone(), zones.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}
