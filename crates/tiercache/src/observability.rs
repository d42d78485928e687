//! Tracing setup for hosts that do not install their own subscriber.
//!
//! The filter sits behind a reload layer, so [`apply_logging_level`] can change
//! verbosity while caches are running.

use std::sync::OnceLock;

use tiercache_core::{CacheError, Result};
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

use crate::config::LoggingConfig;

type FilterHandle = reload::Handle<EnvFilter, Registry>;

static FILTER_HANDLE: OnceLock<FilterHandle> = OnceLock::new();

/// Install the subscriber at `info`, or at `RUST_LOG` when that is set.
pub fn init_tracing() {
    init_tracing_with_level("info");
}

/// Install the subscriber from the `[logging]` settings section.
pub fn init_tracing_from(config: &LoggingConfig) {
    init_tracing_with_level(&config.level);
}

/// Install the subscriber with `level` as the fallback directive.
///
/// `RUST_LOG` wins when it parses. If a global subscriber already exists,
/// including one from an earlier call, it stays in place and the level can
/// no longer be changed through [`apply_logging_level`].
pub fn init_tracing_with_level(level: &str) {
    if FILTER_HANDLE.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, handle) = reload::Layer::new(filter);

    let installed = tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_target(true))
        .try_init();
    match installed {
        Ok(()) => {
            let _ = FILTER_HANDLE.set(handle);
        }
        Err(_) => {
            tracing::debug!("global subscriber already set, tiercache filter not installed");
        }
    }
}

/// Swap the active filter.
///
/// Returns `Ok(false)` when tracing was not initialized through this module.
pub fn apply_logging_level(level: &str) -> Result<bool> {
    let filter = EnvFilter::try_new(level)
        .map_err(|e| CacheError::configuration(format!("invalid log level '{level}': {e}")))?;

    let Some(handle) = FILTER_HANDLE.get() else {
        return Ok(false);
    };
    handle
        .modify(|current| *current = filter)
        .map_err(|e| CacheError::configuration(format!("failed to reload log filter: {e}")))?;
    Ok(true)
}
