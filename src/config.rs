use anyhow::{anyhow, bail, Context, Result};
use chrono_tz::Tz;
use serde::Serialize;
use std::env;
use std::time::Duration;

pub const DEFAULT_TRANSITLAND_URL: &str = "https://transit.land/api/v2/rest";
pub const DEFAULT_GTFSR_URL: &str = "https://api.nationaltransport.ie/gtfsr/v2/TripUpdates";
pub const DEFAULT_OPERATORS: [&str; 4] = [
    "o-gc-dublinbus",
    "o-ey-BusEireann",
    "o-gc-luas",
    "o-gc-irishrail",
];
pub const DEFAULT_TIMEZONE: Tz = chrono_tz::Europe::Dublin;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedFormat {
    Json,
    Protobuf,
}

impl std::str::FromStr for FeedFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(FeedFormat::Json),
            "protobuf" | "pb" => Ok(FeedFormat::Protobuf),
            other => bail!("unknown feed format '{}'", other),
        }
    }
}

/// Everything the pipelines need to reach their providers. Built once and
/// handed to each pipeline constructor.
#[derive(Debug, Clone, Serialize)]
pub struct TransitConfig {
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub operators: Vec<String>,
    pub bbox_limit: usize,
    /// Page size for the whole-network stop load.
    pub network_limit: usize,
    pub search_limit: usize,
    pub departures_limit: usize,
    pub min_query_len: usize,
    pub arrival_horizon_minutes: i64,
    pub debounce: Duration,
    /// Zone the provider's wall-clock departure times are read in.
    pub timezone: Tz,
    /// Server sessions untouched for this long are dropped.
    pub session_idle: Duration,
    pub gtfsr_url: String,
    #[serde(skip_serializing)]
    pub gtfsr_api_key: String,
    pub gtfsr_format: FeedFormat,
}

impl Default for TransitConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_TRANSITLAND_URL.to_string(),
            api_key: String::new(),
            operators: DEFAULT_OPERATORS.iter().map(|s| s.to_string()).collect(),
            bbox_limit: 500,
            network_limit: 9000,
            search_limit: 50,
            departures_limit: 15,
            min_query_len: 2,
            arrival_horizon_minutes: 80,
            debounce: Duration::from_millis(500),
            timezone: DEFAULT_TIMEZONE,
            session_idle: Duration::from_secs(30 * 60),
            gtfsr_url: DEFAULT_GTFSR_URL.to_string(),
            gtfsr_api_key: String::new(),
            gtfsr_format: FeedFormat::Json,
        }
    }
}

impl TransitConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let operators = env::var("TRANSITLAND_OPERATORS")
            .map(|s| parse_operators(&s))
            .unwrap_or(defaults.operators);

        let debounce_ms: u64 = env::var("DEBOUNCE_MS")
            .unwrap_or_else(|_| "500".to_string())
            .parse()
            .context("Failed to parse DEBOUNCE_MS")?;

        let timezone = match env::var("TRANSIT_TIMEZONE") {
            Ok(raw) => parse_timezone(&raw)?,
            Err(_) => defaults.timezone,
        };

        let session_idle_secs: u64 = env::var("SESSION_IDLE_SECS")
            .unwrap_or_else(|_| "1800".to_string())
            .parse()
            .context("Failed to parse SESSION_IDLE_SECS")?;

        Ok(Self {
            base_url: env::var("TRANSITLAND_API_URL").unwrap_or(defaults.base_url),
            api_key: env::var("TRANSITLAND_API_KEY")
                .context("TRANSITLAND_API_KEY must be set")?,
            operators,
            arrival_horizon_minutes: env::var("ARRIVAL_HORIZON_MINUTES")
                .unwrap_or_else(|_| "80".to_string())
                .parse()
                .context("Failed to parse ARRIVAL_HORIZON_MINUTES")?,
            debounce: Duration::from_millis(debounce_ms),
            timezone,
            session_idle: Duration::from_secs(session_idle_secs),
            gtfsr_url: env::var("GTFSR_URL").unwrap_or(defaults.gtfsr_url),
            gtfsr_api_key: env::var("GTFSR_API_KEY").unwrap_or_default(),
            gtfsr_format: env::var("GTFSR_FORMAT")
                .unwrap_or_else(|_| "json".to_string())
                .parse()
                .context("Failed to parse GTFSR_FORMAT")?,
            ..defaults
        })
    }
}

fn parse_timezone(raw: &str) -> Result<Tz> {
    Tz::from_str_insensitive(raw.trim())
        .map_err(|e| anyhow!("Failed to parse TRANSIT_TIMEZONE '{}': {:?}", raw, e))
}

fn parse_operators(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
