//! Runtime configuration.
//!
//! Loaded from a TOML file by the CLI shell; every scalar the engine and
//! the two transports need at construction time. Decimal strategy
//! parameters are scaled to the fixed-point ×10⁹ representation here, at
//! load time, so the rest of the crate never sees floats.

use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::engine::EngineConfig;
use crate::errors::{Error, Result};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub quoting: QuotingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Book feed connection parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeedConfig {
    /// WebSocket endpoint of the market data feed.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
}

fn default_endpoint() -> String {
    "wss://127.0.0.1:9000/api/v1/ws".to_string()
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
        }
    }
}

/// Trading gate connection and identity parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GateConfig {
    #[serde(default = "default_gate_host")]
    pub host: String,
    #[serde(default = "default_gate_port")]
    pub port: u16,
    /// Gate login id.
    #[serde(default)]
    pub login: u32,
    /// Gate account id.
    #[serde(default)]
    pub account: i64,
    /// First request id to use. Must be greater than any request id used
    /// in a previous run or the gate rejects every request; the previous
    /// run logs its highest used id on exit.
    #[serde(default = "default_first_request_id")]
    pub first_request_id: u64,
}

fn default_gate_host() -> String {
    "127.0.0.1".to_string()
}

fn default_gate_port() -> u16 {
    12345
}

fn default_first_request_id() -> u64 {
    1
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            host: default_gate_host(),
            port: default_gate_port(),
            login: 0,
            account: 0,
            first_request_id: default_first_request_id(),
        }
    }
}

/// Strategy parameters. `interest`, `shift` and `price_increment` are
/// plain decimals here and become fixed-point ×10⁹ integers at load.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QuotingConfig {
    /// Instrument id to trade.
    #[serde(default)]
    pub instrument: i32,
    /// Size of each quote.
    #[serde(default = "default_quote_volume")]
    pub quote_volume: i32,
    /// Position held before the first execution report.
    #[serde(default)]
    pub initial_position: i32,
    /// Bound on the absolute position.
    #[serde(default = "default_max_position")]
    pub max_position: i32,
    /// Half-spread around the mid.
    #[serde(default)]
    pub interest: f64,
    /// Quote shift per unit of position.
    #[serde(default)]
    pub shift: f64,
    /// Minimum price increment of the instrument.
    #[serde(default = "default_price_increment")]
    pub price_increment: f64,
    /// Messages per second that trigger the gate's flooding penalty.
    #[serde(default = "default_flood_limit")]
    pub flood_limit: i32,
}

fn default_quote_volume() -> i32 {
    1
}

fn default_max_position() -> i32 {
    10
}

fn default_price_increment() -> f64 {
    1.0
}

fn default_flood_limit() -> i32 {
    100
}

impl Default for QuotingConfig {
    fn default() -> Self {
        Self {
            instrument: 0,
            quote_volume: default_quote_volume(),
            initial_position: 0,
            max_position: default_max_position(),
            interest: 0.0,
            shift: 0.0,
            price_increment: default_price_increment(),
            flood_limit: default_flood_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format: pretty, json, compact.
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

impl AppConfig {
    /// Reads and parses a config file. A missing file is fatal; this
    /// agent places real orders, so it never runs on silent defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<AppConfig> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))?;
        let config: AppConfig =
            toml::from_str(&content).map_err(|e| Error::config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the scalars that would otherwise fail only after a
    /// connection is up.
    pub fn validate(&self) -> Result<()> {
        let endpoint = Url::parse(&self.feed.endpoint)
            .map_err(|e| Error::config(format!("invalid feed endpoint: {e}")))?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(Error::config(format!(
                "feed endpoint must be ws:// or wss://, got {}",
                endpoint.scheme()
            )));
        }
        if self.quoting.quote_volume <= 0 {
            return Err(Error::config("quote_volume must be positive"));
        }
        if self.quoting.max_position <= 0 {
            return Err(Error::config("max_position must be positive"));
        }
        if self.quoting.initial_position.abs() > self.quoting.max_position {
            return Err(Error::config("initial_position outside max_position bounds"));
        }
        if self.quoting.price_increment <= 0.0 {
            return Err(Error::config("price_increment must be positive"));
        }
        if self.quoting.flood_limit <= 1 {
            return Err(Error::config("flood_limit must be at least 2"));
        }
        if self.gate.first_request_id == 0 {
            return Err(Error::config("first_request_id must be at least 1"));
        }
        Ok(())
    }

    /// The engine's view of this configuration, decimals scaled to ×10⁹.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            quote_volume: self.quoting.quote_volume,
            interest: scale_decimal(self.quoting.interest),
            shift: scale_decimal(self.quoting.shift),
            instrument: self.quoting.instrument,
            increment: scale_decimal(self.quoting.price_increment),
            max_position: self.quoting.max_position,
            initial_position: self.quoting.initial_position,
            flood_limit: self.quoting.flood_limit,
        }
    }
}

/// Scales a decimal config value to the fixed-point ×10⁹ representation.
fn scale_decimal(value: f64) -> i64 {
    (value * 1e9).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_toml() -> &'static str {
        r#"
            [feed]
            endpoint = "wss://feed.example.test/api/v1/ws"

            [gate]
            host = "gate.example.test"
            port = 4001
            login = 17
            account = 901
            first_request_id = 5000

            [quoting]
            instrument = 2
            quote_volume = 25
            initial_position = -3
            max_position = 100
            interest = 0.5
            shift = 0.01
            price_increment = 0.25
            flood_limit = 50
        "#
    }

    #[test]
    fn test_parse_and_scale() {
        let config: AppConfig = toml::from_str(valid_toml()).unwrap();
        config.validate().unwrap();

        let engine = config.engine_config();
        assert_eq!(engine.interest, 500_000_000);
        assert_eq!(engine.shift, 10_000_000);
        assert_eq!(engine.increment, 250_000_000);
        assert_eq!(engine.quote_volume, 25);
        assert_eq!(engine.initial_position, -3);
        assert_eq!(config.gate.first_request_id, 5000);
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.gate.port, 12345);
        assert_eq!(config.quoting.flood_limit, 100);
        assert_eq!(config.gate.first_request_id, 1);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_rejects_bad_endpoint() {
        let mut config: AppConfig = toml::from_str(valid_toml()).unwrap();
        config.feed.endpoint = "http://not-a-feed".to_string();
        assert!(config.validate().is_err());
        config.feed.endpoint = ":: definitely not a uri".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_out_of_range_scalars() {
        let base: AppConfig = toml::from_str(valid_toml()).unwrap();

        let mut config = base.clone();
        config.quoting.quote_volume = 0;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.quoting.initial_position = 101;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.quoting.price_increment = 0.0;
        assert!(config.validate().is_err());

        let mut config = base;
        config.gate.first_request_id = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_fatal() {
        assert!(AppConfig::load("/nonexistent/quotebot.toml").is_err());
    }
}
