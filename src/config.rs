// ===============================
// src/config.rs
// ===============================
//
// All configuration comes from the environment (plus .env via dotenvy),
// the same surface the rest of the stack expects:
//
//   SYMBOL=btcusdt                      canonical lowercase pair
//   VENUES=binance,coinbase,kraken,okx  selected venue ids
//   METRICS_PORT=9898
//   BASE_PRICE=65000                    placeholder seed price
//   FEED_BASE_DELAY_MS / FEED_MAX_DELAY_MS / FEED_MAX_ATTEMPTS / FEED_SETTLE_MS
//   AGG_DEPTH / PLACEHOLDER_SECS
//   ZONE_GROUP_PCT / SR_GROUP_PCT / ZONE_MIN_VOLUME / ZONE_CRITICAL / ZONE_INTENSITY_SCALE
//   MAX_DATA_POINTS
//
// Unknown venue ids are a warned no-op, never an error.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use dotenvy::dotenv;
use tracing::warn;

use crate::aggregator::AggCfg;
use crate::analytics::ZoneConfig;
use crate::feed::FeedCfg;
use crate::history::HistoryCfg;
use crate::venues::Venue;

#[derive(Clone, Debug)]
pub struct Config {
    pub symbol: String,
    pub venues: Vec<Venue>,
    pub metrics_port: u16,
    pub feed: FeedCfg,
    pub agg: AggCfg,
    pub zones: ZoneConfig,
    pub history: HistoryCfg,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

/// Parse the selected venue id set. Unknown ids are skipped with a
/// warning; an empty or missing list selects every venue.
fn parse_venues(raw: Option<String>) -> Vec<Venue> {
    let Some(raw) = raw else { return Venue::ALL.to_vec() };
    let mut out: Vec<Venue> = Vec::new();
    for token in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        match Venue::parse_id(token) {
            Some(v) if !out.contains(&v) => out.push(v),
            Some(_) => {}
            None => warn!(venue = token, "unknown venue id, ignoring"),
        }
    }
    if out.is_empty() { Venue::ALL.to_vec() } else { out }
}

pub fn load() -> Config {
    // Make sure .env is read before any lookup
    let _ = dotenv();

    let symbol = env::var("SYMBOL")
        .unwrap_or_else(|_| "btcusdt".to_string())
        .to_ascii_lowercase();
    let venues = parse_venues(env::var("VENUES").ok());
    let metrics_port = env_parse("METRICS_PORT", 9898u16);

    let feed = FeedCfg {
        base_delay_ms: env_parse("FEED_BASE_DELAY_MS", 500),
        max_delay_ms: env_parse("FEED_MAX_DELAY_MS", 30_000),
        max_attempts: env_parse("FEED_MAX_ATTEMPTS", 10),
        settle_delay_ms: env_parse("FEED_SETTLE_MS", 300),
    };

    let agg = AggCfg {
        depth: env_parse("AGG_DEPTH", 50),
        placeholder_interval: Duration::from_secs(env_parse("PLACEHOLDER_SECS", 2u64)),
        base_price: env_parse("BASE_PRICE", 65_000.0),
    };

    let zones = ZoneConfig {
        grouping_percent: env_parse("ZONE_GROUP_PCT", 0.1),
        sr_percent: env_parse("SR_GROUP_PCT", 0.05),
        min_volume: env_parse("ZONE_MIN_VOLUME", 0.5),
        critical_threshold: env_parse("ZONE_CRITICAL", 0.7),
        intensity_scale: env_parse("ZONE_INTENSITY_SCALE", 0.1),
    };

    let history = HistoryCfg {
        max_data_points: env_parse("MAX_DATA_POINTS", 60),
    };

    Config { symbol, venues, metrics_port, feed, agg, zones, history }
}
