//! Location selection
//!
//! Given a pool's configuration, the cached price snapshot and the current
//! blacklist, pick the (region, zone, instance type) whose median price per
//! core is lowest, subject to the pool's per-core price ceiling. Pure
//! functions over snapshots the reconciler assembles; iteration order is
//! stable so identical inputs always produce the identical pick.

use std::collections::{BTreeMap, HashMap, HashSet};

use spotherd_core::{PoolConfig, ZonePrices};
use tracing::debug;

/// Instance type to region to zone to recent prices, newest first.
pub type PriceSnapshot = BTreeMap<String, BTreeMap<String, ZonePrices>>;

/// The winning location of a selection run.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationChoice {
    pub region: String,
    pub zone: String,
    pub instance_type: String,
    /// Median price per core that won
    pub median: f64,
}

/// Outcome of [`determine_best_location`].
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub choice: Option<LocationChoice>,
    /// Zones rejected by the price ceiling, with the lowest per-core price
    /// seen there. Reported in the price-too-low status entry.
    pub rejected_prices: BTreeMap<String, f64>,
}

/// Median of a price list; `None` for an empty list.
pub fn price_median(prices: &[f64]) -> Option<f64> {
    if prices.is_empty() {
        return None;
    }
    let mut sorted = prices.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    if n % 2 == 0 {
        Some((sorted[n / 2 - 1] + sorted[n / 2]) / 2.0)
    } else {
        Some(sorted[n / 2])
    }
}

/// Pick the cheapest acceptable location for the pool.
///
/// Every (instance type, region, zone) candidate is considered; the one
/// with the strictly lowest median per-core price wins, first candidate in
/// sorted order winning ties. A zone whose newest per-core price exceeds
/// the ceiling is rejected (and reported); blacklisted pairs are skipped.
pub fn determine_best_location(
    config: &PoolConfig,
    snapshot: &PriceSnapshot,
    blacklist: &HashSet<(String, String)>,
    cores_per_instance: &HashMap<String, u32>,
) -> Selection {
    let allowed_types: HashSet<&str> =
        config.instance_types.iter().map(String::as_str).collect();
    let allowed_regions: HashSet<&str> =
        config.allowed_regions.iter().map(String::as_str).collect();

    let mut selection = Selection::default();
    let mut best_median: Option<f64> = None;

    for (instance_type, regions) in snapshot {
        if !allowed_types.contains(instance_type.as_str()) {
            continue;
        }
        let Some(&cores) = cores_per_instance.get(instance_type) else {
            continue;
        };
        for (region, zones) in regions {
            if !allowed_regions.contains(region.as_str()) {
                continue;
            }
            for (zone, prices) in zones {
                if blacklist.contains(&(zone.clone(), instance_type.clone())) {
                    debug!("{zone}/{instance_type} is blacklisted");
                    continue;
                }
                let per_core: Vec<f64> =
                    prices.iter().map(|p| p / f64::from(cores)).collect();
                let Some(&newest) = per_core.first() else {
                    continue;
                };
                if newest > config.max_price {
                    let entry = selection
                        .rejected_prices
                        .entry(zone.clone())
                        .or_insert(newest);
                    *entry = entry.min(newest);
                    continue;
                }
                let Some(median) = price_median(&per_core) else {
                    continue;
                };
                if best_median.is_none_or(|best| median < best) {
                    best_median = Some(median);
                    selection.choice = Some(LocationChoice {
                        region: region.clone(),
                        zone: zone.clone(),
                        instance_type: instance_type.clone(),
                        median,
                    });
                    debug!(
                        "Best price median currently {median} in {region}/{zone} ({instance_type})"
                    );
                }
            }
        }
    }
    selection
}

/// Filter instance types to those whose core count does not exceed the
/// remaining need; when every type is too large, fall back to the set of
/// smallest types so the pool can still make progress.
pub fn winnow_instance_types(
    instance_types: &[String],
    cores_per_instance: &HashMap<String, u32>,
    cores_needed: u32,
) -> Vec<String> {
    let mut acceptable = Vec::new();
    let mut smallest: Vec<String> = Vec::new();
    let mut smallest_size: Option<u32> = None;

    for instance_type in instance_types {
        let Some(&size) = cores_per_instance.get(instance_type) else {
            continue;
        };
        if size <= cores_needed {
            acceptable.push(instance_type.clone());
        }
        match smallest_size {
            None => {
                smallest_size = Some(size);
                smallest.push(instance_type.clone());
            }
            Some(current) if size < current => {
                smallest_size = Some(size);
                smallest = vec![instance_type.clone()];
            }
            Some(current) if size == current => smallest.push(instance_type.clone()),
            Some(_) => {}
        }
    }

    if acceptable.is_empty() { smallest } else { acceptable }
}

/// Convert a core requirement into an instance count for the chosen type.
///
/// The integer-division remainder is deliberately left over: the next tick
/// sees the residual need and can pick a smaller instance type for it.
pub fn instances_for_cores(cores_needed: u32, cores_per_instance: u32) -> u32 {
    (cores_needed / cores_per_instance).max(1)
}
