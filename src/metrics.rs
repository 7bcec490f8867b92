// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Feed health --------
pub static FRAMES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ws_frames_total", "text frames received per venue"),
        &["venue"],
    )
    .unwrap()
});

pub static PARSE_DROPS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ws_parse_drops_total", "non-book or malformed frames dropped per venue"),
        &["venue"],
    )
    .unwrap()
});

pub static RECONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ws_reconnects_total", "reconnect attempts scheduled per venue"),
        &["venue"],
    )
    .unwrap()
});

pub static WS_CONNECTED: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("ws_connected", "1 if the venue socket is open, 0 otherwise"),
        &["venue"],
    )
    .unwrap()
});

// -------- Aggregation --------
pub static BOOK_UPDATES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("book_updates_total", "normalized book updates applied").unwrap());

pub static AGG_DEPTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("agg_book_depth", "levels per side in the merged book"),
        &["side"],
    )
    .unwrap()
});

pub static VENUES_CONNECTED: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("venues_connected", "selected venues with an open socket").unwrap());

// -------- History --------
pub static HIST_SAMPLES: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("history_ring_depth", "samples retained per time range"),
        &["range"],
    )
    .unwrap()
});

// ---- Config visibility ----
pub static CONFIG_SYMBOL: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_symbol", "configured symbol (label: symbol)"),
        &["symbol"],
    )
    .unwrap()
});

pub static CONFIG_VENUE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_venue", "selected venues (label: venue)"),
        &["venue"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(FRAMES_TOTAL.clone())),
        REGISTRY.register(Box::new(PARSE_DROPS.clone())),
        REGISTRY.register(Box::new(RECONNECTS.clone())),
        REGISTRY.register(Box::new(WS_CONNECTED.clone())),
        REGISTRY.register(Box::new(BOOK_UPDATES.clone())),
        REGISTRY.register(Box::new(AGG_DEPTH.clone())),
        REGISTRY.register(Box::new(VENUES_CONNECTED.clone())),
        REGISTRY.register(Box::new(HIST_SAMPLES.clone())),
        REGISTRY.register(Box::new(CONFIG_SYMBOL.clone())),
        REGISTRY.register(Box::new(CONFIG_VENUE.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics) — tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub async fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = TcpListener::bind(&addr)
            .unwrap_or_else(|e| panic!("metrics bind {} failed: {}", addr, e));
        eprintln!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => eprintln!("metrics accept error: {}", e),
            }
        }
    });
}
