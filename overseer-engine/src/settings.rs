//! Layered configuration loading
//!
//! Sources, later ones overriding earlier ones:
//!
//! 1. built-in defaults of [`OrchestratorConfig`]
//! 2. `config/default.{toml,json,yaml}` (optional)
//! 3. `config/local.{toml,json,yaml}` (optional)
//! 4. environment variables such as `OVERSEER_RESOLVER__CHRONIC_FAILURE_THRESHOLD=5`

use crate::Result;
use overseer_core::config::OrchestratorConfig;
use std::path::Path;
use tracing::debug;

pub const ENV_PREFIX: &str = "OVERSEER";

/// Load configuration relative to the working directory
pub fn load() -> Result<OrchestratorConfig> {
    load_from(Path::new("."))
}

/// Load configuration with `config/` resolved under `base`
pub fn load_from(base: &Path) -> Result<OrchestratorConfig> {
    let default_file = base.join("config").join("default");
    let local_file = base.join("config").join("local");

    let settings = config::Config::builder()
        .add_source(config::File::with_name(&default_file.to_string_lossy()).required(false))
        .add_source(config::File::with_name(&local_file.to_string_lossy()).required(false))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let config: OrchestratorConfig = settings.try_deserialize()?;
    config.validate()?;
    debug!(base = %base.display(), "Loaded orchestrator configuration");
    Ok(config)
}
