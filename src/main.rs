// ===============================
// src/main.rs
// ===============================
//
// bookagg_rust — multi-venue orderbook aggregation core.
//
// Streams orderbook snapshots from several crypto venues over WebSocket,
// normalizes and merges them into one ranked bid/ask view, keeps a
// bounded in-memory history, and derives microstructure analytics
// (pressure zones, VWAP, imbalance, depth heatmap) on demand. Prometheus
// metrics are exposed on METRICS_PORT; a rendering frontend is expected
// to consume the published snapshots as plain data.

mod aggregator;
mod analytics;
mod config;
mod domain;
mod feed;
mod history;
mod metrics;
mod mock;
mod venues;

use tokio::sync::{mpsc, watch};
use tokio::time::Duration;
use tracing::info;

use crate::domain::{AggSnapshot, FeedEvent};

#[tokio::main]
async fn main() {
    // ---- Logging ----
    // RUST_LOG controls verbosity, info when unset
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // ---- Load config ----
    let cfg = config::load();

    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(cfg.metrics_port));

    let venue_names: Vec<&'static str> = cfg.venues.iter().map(|v| v.name()).collect();
    info!(
        symbol = %cfg.symbol,
        venues = ?venue_names,
        depth = cfg.agg.depth,
        max_attempts = cfg.feed.max_attempts,
        "startup config"
    );
    metrics::CONFIG_SYMBOL.with_label_values(&[cfg.symbol.as_str()]).set(1);
    for v in &cfg.venues {
        metrics::CONFIG_VENUE.with_label_values(&[v.name()]).set(1);
    }

    // ---- Buses ----
    let (feed_tx, feed_rx) = mpsc::channel::<FeedEvent>(4096);
    let (snap_tx, snap_rx) = watch::channel(AggSnapshot::default());

    // ---- Aggregator (single owner of the snapshot map) ----
    tokio::spawn(aggregator::run(
        feed_rx,
        snap_tx,
        cfg.venues.clone(),
        cfg.agg.clone(),
    ));

    // ---- Venue connections ----
    let mut manager = feed::ConnectionManager::new(cfg.symbol.clone(), cfg.feed.clone(), feed_tx);
    for venue in &cfg.venues {
        manager.connect(*venue);
    }

    // ---- Historical recorder ----
    let mut recorder = history::HistoryRecorder::new(cfg.history.clone());
    recorder.start(snap_rx.clone());

    // ---- Heartbeat: once a second, log a digest of the merged view ----
    let updates_rx = snap_rx.clone();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                let snap = updates_rx.borrow().clone();
                let imb = analytics::calculate_imbalance(&snap.book.bids, &snap.book.asks);
                let zones = analytics::analyze_pressure_zones(&snap.book.bids, &snap.book.asks, &cfg.zones);
                let sr = analytics::detect_support_resistance(&snap.book.bids, &snap.book.asks, &cfg.zones);
                info!(
                    connected = snap.book.venues_connected,
                    total = snap.book.venues_total,
                    best_bid = ?snap.book.best_bid(),
                    best_ask = ?snap.book.best_ask(),
                    spread = ?snap.book.spread(),
                    bid_vwap = analytics::calculate_vwap(&snap.book.bids),
                    dominant = ?imb.dominant,
                    zones = zones.len(),
                    critical = zones.iter().filter(|z| z.critical).count(),
                    support = ?sr.support.first(),
                    resistance = ?sr.resistance.first(),
                    "heartbeat"
                );
            }
        }
    }

    // ---- Teardown: cancel timers, close sockets, deterministically ----
    recorder.stop();
    manager.disconnect_all().await;
    info!("stopped");
}
