use std::path::Path;
use std::time::Duration;

use anyhow::{Context as _, Result};
use serde::Deserialize;

use crate::engine::ServiceSettings;
use crate::engine::eviction::EvictionPolicy;

/// Configuration loaded from `flowpulse.yaml`.
/// Top-level fields are optional and fall back to CLI/env/defaults; the
/// sections carry their own defaults.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FlowPulseConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub max_body: Option<usize>,
    pub eviction: EvictionConfig,
    pub ticker: TickerConfig,
    pub hub: HubConfig,
    pub memory: MemoryConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    pub sweep_interval_secs: u64,
    /// How long finished workflows stay visible.
    pub grace_period_secs: u64,
    pub max_records: usize,
    /// Size to shrink back to once `max_records` is exceeded.
    /// Defaults to 80 % of `max_records`.
    pub target_records: Option<usize>,
    pub stale_running_secs: u64,
    pub pressure_high_water: f64,
    pub pressure_critical_water: f64,
    pub pressure_running_secs: u64,
    pub pressure_keep_recent: usize,
    pub history_limit: usize,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 120,
            grace_period_secs: 300,
            max_records: 20,
            target_records: None,
            stale_running_secs: 2 * 60 * 60,
            pressure_high_water: 80.0,
            pressure_critical_water: 90.0,
            pressure_running_secs: 60 * 60,
            pressure_keep_recent: 5,
            history_limit: 25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TickerConfig {
    pub interval_ms: u64,
    pub probe_timeout_ms: u64,
}

impl Default for TickerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            probe_timeout_ms: 250,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub subscriber_buffer: usize,
    pub liveness_interval_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 256,
            liveness_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// RSS budget in MiB; defaults to total system memory.
    pub limit_mb: Option<u64>,
}

impl FlowPulseConfig {
    /// Load configuration from a YAML file.
    ///
    /// - If `path` is `Some`, load that specific file (error if missing).
    /// - If `path` is `None`, auto-detect `flowpulse.yaml` in cwd; return defaults if absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_path = match path {
            Some(p) => {
                if !p.exists() {
                    anyhow::bail!("Config file not found: {}", p.display());
                }
                p.to_path_buf()
            }
            None => {
                let default_path = Path::new("flowpulse.yaml");
                if !default_path.exists() {
                    return Ok(Self::default());
                }
                default_path.to_path_buf()
            }
        };

        let contents = std::fs::read_to_string(&file_path)
            .with_context(|| format!("Failed to read config file: {}", file_path.display()))?;

        let config: FlowPulseConfig = serde_yml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", file_path.display()))?;

        Ok(config)
    }

    pub fn eviction_policy(&self) -> EvictionPolicy {
        let e = &self.eviction;
        EvictionPolicy {
            grace_period: secs(e.grace_period_secs),
            max_records: e.max_records,
            target_records: e
                .target_records
                .unwrap_or_else(|| EvictionPolicy::default_target(e.max_records)),
            stale_running_after: secs(e.stale_running_secs),
            pressure_high_water: e.pressure_high_water,
            pressure_critical_water: e.pressure_critical_water,
            pressure_running_after: secs(e.pressure_running_secs),
            pressure_keep_recent: e.pressure_keep_recent,
            history_limit: e.history_limit,
        }
        .normalized()
    }

    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            sweep_interval: Duration::from_secs(self.eviction.sweep_interval_secs.max(1)),
            tick_interval: Duration::from_millis(self.ticker.interval_ms.max(10)),
            liveness_interval: Duration::from_secs(self.hub.liveness_interval_secs.max(1)),
            ..ServiceSettings::default()
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.ticker.probe_timeout_ms)
    }
}

fn secs(value: u64) -> chrono::Duration {
    i64::try_from(value)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::TimeDelta::MAX)
}
