//! EC2 spot provider
//!
//! Implements the provider interface against the EC2 spot market: submits
//! spot purchase requests at a per-instance bid derived from the pool's
//! per-core ceiling, polls request fulfilment, tags fulfilled instances for
//! the reconciler, translates EC2 state words into canonical states and
//! classifies EC2 failures into the status-entry kinds.
//!
//! Credentials and shared client configuration come from the SDK's default
//! provider chain (environment); one client is kept per region.

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_ec2::error::SdkError;
use aws_sdk_ec2::primitives::DateTime as AwsDateTime;
use aws_sdk_ec2::types::{
    BlockDeviceMapping, EbsBlockDevice, Filter, InstanceType, RequestSpotLaunchSpecification,
    SpotInstanceState, SpotInstanceType, SpotPlacement, Tag,
};
use aws_sdk_ec2::Client;
use aws_types::region::Region;
use base64::prelude::*;
use chrono::Utc;
use spotherd_core::{
    CloudInstance, CloudProvider, FailedRequest, FulfilledRequest, InstanceState, PoolConfig,
    PoolId, Result, SpotherdError, ZonePrices, POOL_ID_TAG, UPDATABLE_TAG,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Spot requests that stay unfulfilled this long are dropped by EC2.
const SPOT_REQUEST_TIMEOUT_SECS: i64 = 10 * 60;

/// How far back the price history query reaches.
const PRICE_HISTORY_HOURS: i64 = 6;

/// Zones with a history of refusing or churning spot requests; excluded
/// from price collection so the selector never considers them.
const ZONE_BLACKLIST: &[&str] = &["us-east-1a", "us-east-1f"];

/// Virtual cores per machine shape, for the shapes pools are allowed to use.
const CORES_PER_INSTANCE: &[(&str, u32)] = &[
    ("t3.medium", 2),
    ("t3.large", 2),
    ("t3.xlarge", 4),
    ("c4.large", 2),
    ("c4.xlarge", 4),
    ("c4.2xlarge", 8),
    ("c4.4xlarge", 16),
    ("c4.8xlarge", 36),
    ("c5.large", 2),
    ("c5.xlarge", 4),
    ("c5.2xlarge", 8),
    ("c5.4xlarge", 16),
    ("c5.9xlarge", 36),
    ("c5.18xlarge", 72),
    ("c5d.large", 2),
    ("c5d.xlarge", 4),
    ("c5d.2xlarge", 8),
    ("c5d.4xlarge", 16),
    ("c5d.9xlarge", 36),
    ("c5d.18xlarge", 72),
    ("m4.large", 2),
    ("m4.xlarge", 4),
    ("m4.2xlarge", 8),
    ("m4.4xlarge", 16),
    ("m4.10xlarge", 40),
    ("m4.16xlarge", 64),
    ("m5.large", 2),
    ("m5.xlarge", 4),
    ("m5.2xlarge", 8),
    ("m5.4xlarge", 16),
    ("m5.12xlarge", 48),
    ("m5.24xlarge", 96),
    ("m5d.large", 2),
    ("m5d.xlarge", 4),
    ("m5d.2xlarge", 8),
    ("m5d.4xlarge", 16),
    ("r4.large", 2),
    ("r4.xlarge", 4),
    ("r4.2xlarge", 8),
    ("r4.4xlarge", 16),
    ("r4.8xlarge", 32),
    ("r5.large", 2),
    ("r5.xlarge", 4),
    ("r5.2xlarge", 8),
    ("r5.4xlarge", 16),
];

fn cores_table() -> &'static HashMap<String, u32> {
    static TABLE: OnceLock<HashMap<String, u32>> = OnceLock::new();
    TABLE.get_or_init(|| {
        CORES_PER_INSTANCE
            .iter()
            .map(|(name, cores)| (name.to_string(), *cores))
            .collect()
    })
}

/// Per-instance spot bid: the pool ceiling is per core-hour.
fn spot_bid(max_price_per_core: f64, cores: u32) -> String {
    format!("{:.6}", max_price_per_core * f64::from(cores))
}

/// Map an SDK failure onto the status-entry kinds. Dispatch and timeout
/// failures never reached the service and are always retryable.
fn classify<E, R>(op: &str, err: &SdkError<E, R>) -> SpotherdError
where
    E: std::fmt::Debug,
    R: std::fmt::Debug,
{
    match err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => {
            return SpotherdError::Temporary(format!("{op}: {err:?}"));
        }
        _ => {}
    }
    classify_text(op, &format!("{err:?}"))
}

fn classify_text(op: &str, text: &str) -> SpotherdError {
    if text.contains("MaxSpotInstanceCountExceeded") {
        SpotherdError::MaxSpotInstanceCountExceeded(format!(
            "{op}: region exceeded its maximum spot instance count"
        ))
    } else if text.contains("Service Unavailable")
        || text.contains("ServiceUnavailable")
        || text.contains("RequestLimitExceeded")
    {
        SpotherdError::Temporary(format!("{op}: {text}"))
    } else {
        SpotherdError::Unclassified(format!("{op}: {text}"))
    }
}

/// The EC2 spot market provider.
pub struct Ec2SpotProvider {
    clients: Mutex<HashMap<String, Client>>,
}

impl Ec2SpotProvider {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client_for(&self, region: &str) -> Client {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(region) {
            return client.clone();
        }
        debug!("Creating EC2 client for region: {region}");
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;
        let client = Client::new(&config);
        clients.insert(region.to_string(), client.clone());
        client
    }

    /// Hostname and canonical state of one instance.
    async fn describe_instance(
        &self,
        client: &Client,
        instance_id: &str,
    ) -> Result<(Option<String>, InstanceState)> {
        let response = client
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|e| classify("describe_instances", &e))?;

        let instance = response
            .reservations()
            .first()
            .and_then(|r| r.instances().first())
            .ok_or_else(|| {
                SpotherdError::Unclassified(format!("instance {instance_id} not found"))
            })?;

        let hostname = instance
            .public_dns_name()
            .filter(|name| !name.is_empty())
            .map(str::to_string);
        let status = instance
            .state()
            .and_then(|s| s.code())
            .and_then(InstanceState::from_status_code)
            .unwrap_or(InstanceState::Pending);
        Ok((hostname, status))
    }

    /// Tag a fulfilled instance with the pool tags plus the updatable
    /// handoff marker.
    async fn tag_instance(
        &self,
        client: &Client,
        instance_id: &str,
        tags: &HashMap<String, String>,
    ) -> Result<()> {
        let mut request = client.create_tags().resources(instance_id);
        for (key, value) in tags {
            request = request.tags(Tag::builder().key(key).value(value).build());
        }
        request = request.tags(Tag::builder().key(UPDATABLE_TAG).value("1").build());
        request
            .send()
            .await
            .map_err(|e| classify("create_tags", &e))?;
        Ok(())
    }
}

impl Default for Ec2SpotProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudProvider for Ec2SpotProvider {
    fn name(&self) -> &'static str {
        "EC2Spot"
    }

    fn uses_zones(&self) -> bool {
        true
    }

    fn config_supported(&self, config: &PoolConfig) -> bool {
        !config.image_name.is_empty()
            && config
                .instance_types
                .iter()
                .all(|t| cores_table().contains_key(t))
    }

    fn cores_per_instance(&self) -> &HashMap<String, u32> {
        cores_table()
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
        let mut regions: Vec<_> = ids_by_region.keys().collect();
        regions.sort();
        for region in regions {
            let ids = &ids_by_region[region];
            if ids.is_empty() {
                continue;
            }
            let client = self.client_for(region).await;

            // Cross-check against the provider's tagged view: a live tagged
            // instance the inventory does not carry is worth an operator's
            // attention, not a termination.
            let tagged = self.check_instances_state(pool_id, region).await?;
            for instance_id in tagged.keys() {
                if !ids.contains(instance_id) {
                    error!(
                        "[Pool {pool_id}] Instance {instance_id} is tagged for this pool \
                         but not in the termination list for region {region}"
                    );
                }
            }

            info!(
                "[Pool {pool_id}] Terminating {} instances in region {region}",
                ids.len()
            );
            client
                .terminate_instances()
                .set_instance_ids(Some(ids.clone()))
                .send()
                .await
                .map_err(|e| classify("terminate_instances", &e))?;
        }
        Ok(())
    }

    async fn start_instances(
        &self,
        config: &PoolConfig,
        region: &str,
        zone: &str,
        user_data: &[u8],
        image_id: &str,
        instance_type: &str,
        count: u32,
    ) -> Result<Vec<String>> {
        let cores = cores_table().get(instance_type).copied().ok_or_else(|| {
            SpotherdError::Config(format!("unknown instance type: {instance_type}"))
        })?;
        let client = self.client_for(region).await;

        let root_device = BlockDeviceMapping::builder()
            .device_name("/dev/xvda")
            .ebs(EbsBlockDevice::builder().delete_on_termination(true).build())
            .build();
        let launch_spec = RequestSpotLaunchSpecification::builder()
            .image_id(image_id)
            .instance_type(InstanceType::from(instance_type))
            .placement(SpotPlacement::builder().availability_zone(zone).build())
            .user_data(BASE64_STANDARD.encode(user_data))
            .set_key_name(config.key_name.clone())
            .set_security_groups(if config.security_groups.is_empty() {
                None
            } else {
                Some(config.security_groups.clone())
            })
            .block_device_mappings(root_device)
            .build();

        info!(
            "[{region}/{zone}] Creating {count}x {instance_type} spot requests \
             ({} cores total)",
            count * cores
        );
        let response = client
            .request_spot_instances()
            .spot_price(spot_bid(config.max_price, cores))
            .instance_count(count as i32)
            .r#type(SpotInstanceType::OneTime)
            .valid_until(AwsDateTime::from_secs(
                Utc::now().timestamp() + SPOT_REQUEST_TIMEOUT_SECS,
            ))
            .launch_specification(launch_spec)
            .send()
            .await
            .map_err(|e| classify("request_spot_instances", &e))?;

        Ok(response
            .spot_instance_requests()
            .iter()
            .filter_map(|r| r.spot_instance_request_id().map(str::to_string))
            .collect())
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
        let client = self.client_for(region).await;
        let response = client
            .describe_spot_instance_requests()
            .set_spot_instance_request_ids(Some(request_ids.to_vec()))
            .send()
            .await
            .map_err(|e| classify("describe_spot_instance_requests", &e))?;

        let mut fulfilled = HashMap::new();
        let mut failed = HashMap::new();

        for request in response.spot_instance_requests() {
            let Some(request_id) = request.spot_instance_request_id() else {
                continue;
            };

            if let Some(instance_id) = request.instance_id() {
                let (hostname, status) = self.describe_instance(&client, instance_id).await?;
                self.tag_instance(&client, instance_id, tags).await?;
                info!("Spot request fulfilled {request_id} -> {instance_id}");
                fulfilled.insert(
                    request_id.to_string(),
                    FulfilledRequest {
                        instance_id: instance_id.to_string(),
                        hostname,
                        status,
                    },
                );
                continue;
            }

            match request.state() {
                Some(SpotInstanceState::Cancelled) | Some(SpotInstanceState::Closed) => {
                    let instance_type = request
                        .launch_specification()
                        .and_then(|s| s.instance_type())
                        .map(|t| t.as_str().to_string())
                        .unwrap_or_default();
                    info!("Spot request {request_id} is {:?}", request.state());
                    failed.insert(
                        request_id.to_string(),
                        FailedRequest::Blacklist { instance_type },
                    );
                }
                Some(SpotInstanceState::Failed) => {
                    let code = request
                        .status()
                        .and_then(|s| s.code())
                        .unwrap_or("unknown");
                    error!("Spot request {request_id} failed ({code})");
                    failed.insert(request_id.to_string(), FailedRequest::DisablePool);
                    // The rest of the batch shares its fate; stop here.
                    break;
                }
                Some(SpotInstanceState::Open) | Some(SpotInstanceState::Active) => {
                    debug!("Spot request {request_id} is still open");
                }
                other => {
                    warn!("Spot request {request_id} in unexpected state {other:?}");
                }
            }
        }
        Ok((fulfilled, failed))
    }

    async fn check_instances_state(
        &self,
        pool_id: PoolId,
        region: &str,
    ) -> Result<HashMap<String, CloudInstance>> {
        let client = self.client_for(region).await;
        let mut instances = HashMap::new();

        let mut pages = client
            .describe_instances()
            .filters(
                Filter::builder()
                    .name(format!("tag:{POOL_ID_TAG}"))
                    .values(pool_id.to_string())
                    .build(),
            )
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| classify("describe_instances", &e))?;
            for reservation in page.reservations() {
                for instance in reservation.instances() {
                    let Some(id) = instance.instance_id() else {
                        continue;
                    };
                    let Some(code) = instance.state().and_then(|s| s.code()) else {
                        continue;
                    };
                    let Some(status) = InstanceState::from_status_code(code) else {
                        warn!("Instance {id} has unknown state code {code}");
                        continue;
                    };
                    if status.is_terminal() {
                        continue;
                    }
                    let tags = instance
                        .tags()
                        .iter()
                        .filter_map(|t| {
                            Some((t.key()?.to_string(), t.value()?.to_string()))
                        })
                        .collect();
                    instances.insert(id.to_string(), CloudInstance { status, tags });
                }
            }
        }
        Ok(instances)
    }

    async fn get_image(&self, region: &str, config: &PoolConfig) -> Result<String> {
        let client = self.client_for(region).await;
        let response = client
            .describe_images()
            .filters(
                Filter::builder()
                    .name("name")
                    .values(&config.image_name)
                    .build(),
            )
            .send()
            .await
            .map_err(|e| classify("describe_images", &e))?;

        // Several images can match a name pattern; take the newest.
        let mut images = response.images().to_vec();
        images.sort_by(|a, b| b.creation_date().cmp(&a.creation_date()));
        images
            .first()
            .and_then(|image| image.image_id())
            .map(str::to_string)
            .ok_or_else(|| {
                SpotherdError::Config(format!(
                    "no image named {} in {region}",
                    config.image_name
                ))
            })
    }

    async fn price_history_per_region(
        &self,
        region: &str,
        instance_types: &[String],
    ) -> Result<BTreeMap<String, ZonePrices>> {
        let client = self.client_for(region).await;
        let start = Utc::now() - chrono::Duration::hours(PRICE_HISTORY_HOURS);

        let mut pages = client
            .describe_spot_price_history()
            .filters(
                Filter::builder()
                    .name("product-description")
                    .values("Linux/UNIX")
                    .build(),
            )
            .start_time(AwsDateTime::from_secs(start.timestamp()))
            .set_instance_types(Some(
                instance_types
                    .iter()
                    .map(|t| InstanceType::from(t.as_str()))
                    .collect(),
            ))
            .into_paginator()
            .items()
            .send();

        // The API yields newest entries first; the snapshot keeps that
        // order, the selector's ceiling test reads index 0.
        let mut prices: BTreeMap<String, ZonePrices> = BTreeMap::new();
        while let Some(item) = pages.next().await {
            let price = item.map_err(|e| classify("describe_spot_price_history", &e))?;
            let Some(zone) = price.availability_zone() else {
                continue;
            };
            if ZONE_BLACKLIST.contains(&zone) {
                continue;
            }
            let Some(instance_type) = price.instance_type() else {
                continue;
            };
            let Some(amount) = price.spot_price().and_then(|p| p.parse::<f64>().ok()) else {
                continue;
            };
            prices
                .entry(instance_type.as_str().to_string())
                .or_default()
                .entry(zone.to_string())
                .or_default()
                .push(amount);
        }
        Ok(prices)
    }
}
