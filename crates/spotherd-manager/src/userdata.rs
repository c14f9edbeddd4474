//! User data rendering
//!
//! Launch-time user data is a template: `%NAME%` markers are replaced with
//! the configured macro values plus variables the manager injects about the
//! pool itself, so instances can find their way back to their pool.

use std::collections::HashMap;

use spotherd_core::{PoolConfig, PoolId, Result, SpotherdError};

/// Macro carrying the owning pool id into the instance
pub const POOL_ID_MACRO: &str = "SPOTHERD_POOLID";

/// Macro carrying the pool's cycle interval (seconds) into the instance
pub const CYCLE_TIME_MACRO: &str = "SPOTHERD_CYCLETIME";

/// Render the pool's user data for launch.
pub fn render(config: &PoolConfig, pool_id: PoolId) -> Result<Vec<u8>> {
    let template = std::str::from_utf8(&config.user_data).map_err(|e| {
        SpotherdError::Unclassified(format!("user data is not valid UTF-8: {e}"))
    })?;

    let mut macros = config.user_data_macros.clone();
    macros.insert(POOL_ID_MACRO.to_string(), pool_id.to_string());
    macros.insert(
        CYCLE_TIME_MACRO.to_string(),
        config.cycle_interval.to_string(),
    );

    let mut rendered = template.to_string();
    for (name, value) in &macros {
        rendered = rendered.replace(&format!("%{name}%"), value);
    }

    if rendered.trim().is_empty() {
        return Err(SpotherdError::Unclassified(
            "failed to compile user data: result is empty".into(),
        ));
    }
    Ok(rendered.into_bytes())
}
