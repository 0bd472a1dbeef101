use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::aprs_client::{AprsClientConfig, AprsClientConfigBuilder, RECEIVE_ONLY_PASSCODE};
use crate::aprs_filters::{FilterExpr, PacketTypeCode, validate_lat_lon};
use crate::feed_worker::ConsumeOptions;

pub const CONFIG_PATH_ENV: &str = "APRS_WEATHER_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "./aprs-weather.toml";

/// `[feed]`: where and how to connect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedSection {
    pub host: String,
    pub port: u16,
    pub callsign: String,
    pub passcode: String,
    pub immortal: bool,
    pub blocking: bool,
    /// Initial reconnect delay in seconds
    pub retry_delay: u64,
    pub max_retry_delay: u64,
}

impl Default for FeedSection {
    fn default() -> Self {
        Self {
            host: "rotate.aprs2.net".to_string(),
            port: 14580,
            callsign: "N0CALL".to_string(),
            passcode: RECEIVE_ONLY_PASSCODE.to_string(),
            immortal: true,
            blocking: false,
            retry_delay: 0,
            max_retry_delay: 60,
        }
    }
}

/// `[filter]`: the server-side filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSection {
    pub latitude: f64,
    pub longitude: f64,
    pub radius_km: f64,
    /// Packet type codes to exclude, e.g. `oimqstun`
    pub exclude_types: String,
    /// Additional raw filter terms appended as-is
    pub extra: String,
}

impl Default for FilterSection {
    fn default() -> Self {
        Self {
            latitude: 59.95,
            longitude: 30.31667,
            radius_km: 400.0,
            exclude_types: "oimqstun".to_string(),
            extra: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    /// Materialize latitude/longitude as metrics of their own
    pub track_position: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSection {
    /// Port for the Prometheus endpoint; disabled when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Top-level configuration file structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherConfig {
    pub feed: FeedSection,
    pub filter: FilterSection,
    pub dispatch: DispatchSection,
    pub metrics: MetricsSection,
}

impl WeatherConfig {
    /// Load config from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        let config: WeatherConfig =
            toml::from_str(&contents).with_context(|| format!("Failed to parse {:?}", path))?;
        Ok(config)
    }

    /// Load the file if it exists, fall back to defaults otherwise, then
    /// apply environment overrides.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            info!("Loading configuration from {:?}", path);
            Self::load(path)?
        } else {
            warn!("Config file {:?} not found, using defaults", path);
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// `APRS_CALLSIGN`, `APRS_PASSCODE` and `APRS_HOST` take precedence over
    /// the file
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(callsign) = lookup("APRS_CALLSIGN").filter(|v| !v.is_empty()) {
            self.feed.callsign = callsign;
        }
        if let Some(passcode) = lookup("APRS_PASSCODE").filter(|v| !v.is_empty()) {
            self.feed.passcode = passcode;
        }
        if let Some(host) = lookup("APRS_HOST").filter(|v| !v.is_empty()) {
            self.feed.host = host;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.feed.callsign.trim().is_empty() {
            bail!("feed.callsign must not be empty");
        }
        if self.feed.max_retry_delay < self.feed.retry_delay {
            bail!(
                "feed.max_retry_delay ({}) is smaller than feed.retry_delay ({})",
                self.feed.max_retry_delay,
                self.feed.retry_delay
            );
        }
        self.filter_expr()?;
        Ok(())
    }

    /// The server-side filter built from `[filter]`
    pub fn filter_expr(&self) -> Result<FilterExpr> {
        let f = &self.filter;
        validate_lat_lon(f.latitude, f.longitude)
            .map_err(|e| anyhow::anyhow!("invalid filter centre: {}", e))?;
        if !f.radius_km.is_finite() || f.radius_km <= 0.0 {
            bail!("filter.radius_km must be positive, got {}", f.radius_km);
        }

        let excluded = PacketTypeCode::parse_set(&f.exclude_types)
            .map_err(|e| anyhow::anyhow!("invalid filter.exclude_types: {}", e))?;
        let mut expr = FilterExpr::weather_feed(f.latitude, f.longitude, f.radius_km, &excluded);

        if !f.extra.trim().is_empty() {
            let extra: FilterExpr = f
                .extra
                .parse()
                .with_context(|| format!("invalid filter.extra {:?}", f.extra))?;
            if let Some((term, reason)) = extra.invalid_terms().first() {
                bail!("invalid filter.extra term {:?}: {}", term, reason);
            }
            expr.extend(extra);
        }

        Ok(expr)
    }

    /// Connection settings for the feed
    pub fn client_config(&self) -> Result<AprsClientConfig> {
        let passcode = Some(self.feed.passcode.trim()).filter(|p| !p.is_empty());
        Ok(AprsClientConfigBuilder::new()
            .server(&self.feed.host)
            .port(self.feed.port)
            .callsign(&self.feed.callsign)
            .passcode(passcode)
            .filter(Some(self.filter_expr()?.to_string()))
            .retry_delay_seconds(self.feed.retry_delay)
            .max_retry_delay_seconds(self.feed.max_retry_delay)
            .build())
    }

    pub fn consume_options(&self) -> ConsumeOptions {
        ConsumeOptions {
            immortal: self.feed.immortal,
            blocking: self.feed.blocking,
        }
    }

    /// Effective configuration as TOML, passcode masked
    pub fn to_display_toml(&self) -> Result<String> {
        let mut masked = self.clone();
        if masked.feed.passcode != RECEIVE_ONLY_PASSCODE {
            masked.feed.passcode = "*****".to_string();
        }
        toml::to_string_pretty(&masked).context("Failed to serialize config to TOML")
    }
}

/// Resolve the config file path.
///
/// Priority:
/// 1. `--config` on the command line
/// 2. `APRS_WEATHER_CONFIG` env var
/// 3. `./aprs-weather.toml`
pub fn config_path(cli_path: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_path {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        return PathBuf::from(path);
    }
    PathBuf::from(DEFAULT_CONFIG_PATH)
}
