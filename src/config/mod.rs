// =============================================================================
// Matrixon Timeline - Config Module
// =============================================================================
//
// Project: Matrixon - Gap-aware room timeline engine
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Contributors: Matrixon Development Team
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Loads `TimelineConfig` from the `[global]` table of a TOML file and
//   `MATRIXON_TIMELINE_*` environment variables, the latter taking
//   precedence, and validates the result.
//
// =============================================================================

use std::path::Path;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use matrixon_timeline_core::{TimelineConfig, TimelineError};
use tracing::{debug, info};

use crate::Result;

pub const ENV_PREFIX: &str = "MATRIXON_TIMELINE_";

/// Config providers in precedence order, lowest first.
pub fn figment(path: Option<&Path>) -> Figment {
    let mut figment = Figment::new();
    if let Some(path) = path {
        debug!(path = %path.display(), "Reading config file");
        figment = figment.merge(Toml::file(path).nested());
    }
    figment.merge(Env::prefixed(ENV_PREFIX).global())
}

#[tracing::instrument]
pub fn load(path: Option<&Path>) -> Result<TimelineConfig> {
    let config: TimelineConfig = figment(path)
        .extract()
        .map_err(|e| TimelineError::Config(e.to_string()))?;
    config.validate()?;

    info!(user_id = %config.user_id, "✅ Configuration loaded");
    Ok(config)
}
