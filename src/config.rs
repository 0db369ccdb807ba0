use std::path::Path;

use anyhow::{Context, ensure};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

use super::chain::ChainScope;
use super::decay::{DEFAULT_WEEKLY_RATE, DecayModel};

pub const DEFAULT_CONFIG_PATH: &str = "config/compost.toml";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DecayConfig {
    #[serde(default = "default_rate_per_week")]
    pub rate_per_week: f64,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            rate_per_week: default_rate_per_week(),
        }
    }
}

/// Engine-wide settings. Every field has a default, so an empty source is valid.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub decay: DecayConfig,
    #[serde(default)]
    pub chain_scope: ChainScope,
    #[serde(default)]
    pub require_geolocation: bool,
    #[serde(default = "default_geofence_radius_m")]
    pub geofence_radius_m: f64,
    #[serde(default = "default_stage_days")]
    pub stage_days: i64,
}

fn default_rate_per_week() -> f64 {
    DEFAULT_WEEKLY_RATE
}

fn default_geofence_radius_m() -> f64 {
    100.0
}

fn default_stage_days() -> i64 {
    7
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            decay: DecayConfig::default(),
            chain_scope: ChainScope::default(),
            require_geolocation: false,
            geofence_radius_m: default_geofence_radius_m(),
            stage_days: default_stage_days(),
        }
    }
}

impl EngineConfig {
    /// Load from `config/compost.toml` (optional), then `COMPOST__*` env vars.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let settings = Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix("COMPOST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| {
                format!("failed to read engine configuration from {}", path.display())
            })?;

        let engine: EngineConfig = settings
            .try_deserialize()
            .context("engine configuration is invalid")?;
        engine.check()?;

        tracing::debug!(
            rate = engine.decay.rate_per_week,
            scope = ?engine.chain_scope,
            "engine configuration loaded"
        );
        Ok(engine)
    }

    fn check(&self) -> anyhow::Result<()> {
        let rate = self.decay.rate_per_week;
        ensure!(
            rate.is_finite() && (0.0..1.0).contains(&rate),
            "decay.rate_per_week must be in [0, 1), got {rate}"
        );
        ensure!(self.stage_days > 0, "stage_days must be positive");
        ensure!(
            self.geofence_radius_m >= 0.0,
            "geofence_radius_m must not be negative"
        );
        Ok(())
    }

    pub fn decay_model(&self) -> DecayModel {
        DecayModel::new(self.decay.rate_per_week)
    }
}
