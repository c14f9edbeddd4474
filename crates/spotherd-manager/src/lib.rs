//! # Spotherd Manager
//!
//! Reconciliation engine for spot-instance pools: keeps each pool of
//! interruptible cloud instances at its target core capacity, buying in the
//! cheapest acceptable location and recycling instances on schedule.
//!
//! ## Architecture
//!
//! ```text
//! Scheduler (external)
//!   ├── reconcile_pool(id) ──► PoolReconciler ──► CloudProvider (EC2 spot, ...)
//!   │                             │    │
//!   │                             │    └── Storage (pools, instances, status)
//!   └── collect_prices() ──► price cache ◄── KvCache (Redis / in-memory)
//! ```
//!
//! Each pool reconciles independently under a non-blocking cross-process
//! lock; a tick observes the provider's view, repairs the local inventory,
//! and then scales up, scales down or recycles. Failures are classified at
//! the provider boundary and journaled as pool status entries; critical
//! entries halt the pool until an operator clears them.

pub mod cache;
pub mod lock;
pub mod prices;
pub mod providers;
pub mod reconciler;
pub mod selector;
pub mod status;
pub mod storage;
pub mod userdata;

// Reconciliation engine
pub use reconciler::PoolReconciler;

// Price collection
pub use prices::{collect_prices, parse_price_slice};

// Location selection
pub use selector::{
    determine_best_location, instances_for_cores, price_median, winnow_instance_types,
    LocationChoice, PriceSnapshot, Selection,
};

// Cache layer
pub use cache::{
    blacklist_key, image_key, price_key, KvCache, MemoryCache, RedisCache, BLACKLIST_TTL_SECS,
    IMAGE_TTL_SECS, PRICE_TTL_SECS,
};

// Locking, status journal, storage
pub use lock::PoolLock;
pub use status::StatusJournal;
pub use storage::{config_chain, MemoryStorage, Storage};

// Providers
pub use providers::{ec2spot::Ec2SpotProvider, ProviderRegistry};
