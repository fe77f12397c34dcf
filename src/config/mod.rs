//! Engine Configuration Module
//!
//! SPC settings loaded from TOML so sites can tune sigma multipliers, baseline
//! windows, run rules and tolerance bands without a rebuild.
//!
//! ## Loading Order
//!
//! 1. `QA_KPI_CONFIG` environment variable (path to TOML file)
//! 2. `qa_kpi.toml` in the current working directory
//! 3. Built-in defaults
//!
//! ## Usage
//!
//! ```ignore
//! // In main():
//! config::init(EngineConfig::load()?);
//!
//! // Anywhere else:
//! let sigma = config::get().limits.sigma_out_of_control;
//! ```

mod engine_config;
pub mod defaults;
pub mod validation;

pub use engine_config::*;

use std::sync::OnceLock;

/// Global engine configuration, initialized once at startup.
static ENGINE_CONFIG: OnceLock<EngineConfig> = OnceLock::new();

/// Install the process-wide configuration. Later calls are ignored.
pub fn init(config: EngineConfig) {
    if ENGINE_CONFIG.set(config).is_err() {
        tracing::warn!("config::init() called more than once, ignoring");
    }
}

/// Get the global configuration, falling back to built-in defaults when
/// `init()` was never called.
pub fn get() -> &'static EngineConfig {
    ENGINE_CONFIG.get_or_init(|| {
        tracing::warn!("config::get() called before config::init(), using defaults");
        EngineConfig::default()
    })
}

pub fn is_initialized() -> bool {
    ENGINE_CONFIG.get().is_some()
}
