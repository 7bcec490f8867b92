// ===============================
// src/feed.rs
// ===============================
//
// Venue Connection Manager:
// - one task per venue: Idle -> Connecting -> Open -> Closed(code), with
//   exponential backoff reconnects up to a fixed retry budget
// - subscription handshake after a short settle delay (URL-subscribed
//   venues skip it)
// - answers ping traffic immediately; ping/pong never reaches the parser
// - malformed frames are logged and dropped without closing the socket;
//   transport errors close and reschedule
// - the only side-effecting output is FeedEvent traffic into the
//   aggregator bus

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::domain::{BookUpdate, ConnState, FeedEvent};
use crate::metrics::{FRAMES_TOTAL, PARSE_DROPS, RECONNECTS, WS_CONNECTED};
use crate::venues::Venue;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("bad websocket url: {0}")]
    Url(#[from] url::ParseError),
    #[error("websocket: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
}

#[derive(Debug, Clone)]
pub struct FeedCfg {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Reconnect attempts per venue before it is marked Failed.
    pub max_attempts: u32,
    /// Delay between socket open and the subscribe frame.
    pub settle_delay_ms: u64,
}

impl Default for FeedCfg {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            max_attempts: 10,
            settle_delay_ms: 300,
        }
    }
}

/// Backoff schedule: delay before reconnect attempt `attempt` (0-based),
/// or None once the retry budget is exhausted. Attempt 0 waits exactly the
/// base delay; each further attempt doubles, capped at `max_delay_ms`.
pub fn reconnect_after(cfg: &FeedCfg, attempt: u32) -> Option<Duration> {
    if attempt >= cfg.max_attempts {
        return None;
    }
    let factor = 1u64 << attempt.min(16);
    let ms = cfg.base_delay_ms.saturating_mul(factor).min(cfg.max_delay_ms);
    Some(Duration::from_millis(ms))
}

/// Add jitter to a backoff delay without letting the sum exceed the
/// configured maximum. `max_delay_ms` is a hard ceiling on the wait.
pub fn jittered(cfg: &FeedCfg, delay: Duration, jitter: Duration) -> Duration {
    (delay + jitter).min(Duration::from_millis(cfg.max_delay_ms))
}

/// Close codes that must not be retried: policy violation and the
/// app-level explicit no-retry signal. A locally initiated normal close
/// is handled through the shutdown flag, not through the code.
pub fn is_no_retry_close(code: u16) -> bool {
    matches!(code, 1008 | 4000)
}

/// How a connected session ended.
enum SessionEnd {
    /// Local teardown requested; socket closed normally, no retry.
    Shutdown,
    /// Remote close or transport error.
    Remote { code: u16, reason: Option<String> },
}

/// Owns one connection task per active venue. Explicitly constructed and
/// torn down; dropping it without `disconnect_all` leaves tasks running.
pub struct ConnectionManager {
    symbol: String,
    cfg: FeedCfg,
    bus: mpsc::Sender<FeedEvent>,
    conns: ahash::AHashMap<Venue, VenueConn>,
}

struct VenueConn {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ConnectionManager {
    pub fn new(symbol: String, cfg: FeedCfg, bus: mpsc::Sender<FeedEvent>) -> Self {
        Self { symbol, cfg, bus, conns: ahash::AHashMap::new() }
    }

    pub fn is_active(&self, venue: Venue) -> bool {
        self.conns.contains_key(&venue)
    }

    /// Spawn the connection task for a venue. Connecting an already-active
    /// venue is a warned no-op.
    pub fn connect(&mut self, venue: Venue) {
        if self.is_active(venue) {
            warn!(venue = venue.name(), "already connected, ignoring");
            return;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_venue(
            venue,
            self.symbol.clone(),
            self.cfg.clone(),
            self.bus.clone(),
            shutdown_rx,
        ));
        self.conns.insert(venue, VenueConn { shutdown: shutdown_tx, task });
    }

    /// Manual teardown for one venue: cancels any pending reconnect timer,
    /// closes the socket normally and does not retry.
    pub async fn disconnect(&mut self, venue: Venue) {
        if let Some(conn) = self.conns.remove(&venue) {
            let _ = conn.shutdown.send(true);
            if conn.task.await.is_err() {
                warn!(venue = venue.name(), "connection task panicked during teardown");
            }
            info!(venue = venue.name(), "disconnected");
        }
    }

    /// Tear down every active venue, in registry order. Idempotent.
    pub async fn disconnect_all(&mut self) {
        for venue in Venue::ALL {
            self.disconnect(venue).await;
        }
    }
}

async fn send_state(
    bus: &mpsc::Sender<FeedEvent>,
    venue: Venue,
    state: ConnState,
    reason: Option<String>,
) {
    let _ = bus.send(FeedEvent::State { venue, state, reason }).await;
}

/// Per-venue connection loop with reconnect/backoff state.
async fn run_venue(
    venue: Venue,
    symbol: String,
    cfg: FeedCfg,
    bus: mpsc::Sender<FeedEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let name = venue.name();
    let mut attempt: u32 = 0;

    loop {
        if *shutdown.borrow() {
            return;
        }
        send_state(&bus, venue, ConnState::Connecting, None).await;

        let end = match open_session(venue, &symbol, &cfg, &bus, &mut shutdown).await {
            Ok(opened) => {
                attempt = 0; // successful open resets the backoff
                opened
            }
            Err(e) => {
                error!(venue = name, err = %e, "connect failed");
                SessionEnd::Remote { code: 1006, reason: Some(e.to_string()) }
            }
        };
        WS_CONNECTED.with_label_values(&[name]).set(0);

        match end {
            SessionEnd::Shutdown => {
                send_state(&bus, venue, ConnState::Closed { code: 1000 }, None).await;
                return;
            }
            SessionEnd::Remote { code, reason } => {
                send_state(&bus, venue, ConnState::Closed { code }, reason.clone()).await;
                if is_no_retry_close(code) {
                    warn!(venue = name, code, "terminal close code, not retrying");
                    return;
                }
                let Some(delay) = reconnect_after(&cfg, attempt) else {
                    error!(venue = name, attempts = attempt, "retry budget exhausted");
                    send_state(&bus, venue, ConnState::Failed, reason).await;
                    return;
                };
                attempt += 1;
                RECONNECTS.with_label_values(&[name]).inc();
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=250));
                info!(venue = name, attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { return; }
                    }
                    _ = sleep(jittered(&cfg, delay, jitter)) => {}
                }
            }
        }
    }
}

/// Connect, subscribe, then pump frames until the session ends.
async fn open_session(
    venue: Venue,
    symbol: &str,
    cfg: &FeedCfg,
    bus: &mpsc::Sender<FeedEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<SessionEnd, FeedError> {
    let url = Url::parse(&venue.ws_url(symbol))?;
    info!(venue = venue.name(), %url, "connecting");
    let connect = connect_async(url.as_str());
    tokio::pin!(connect);
    let (mut ws, _resp) = loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(SessionEnd::Shutdown);
                }
            }
            res = &mut connect => break res?,
        }
    };

    info!(venue = venue.name(), "connected");
    WS_CONNECTED.with_label_values(&[venue.name()]).set(1);
    send_state(bus, venue, ConnState::Open, None).await;

    // Subscription handshake after a short settle delay; URL-subscribed
    // venues (Binance) have no frame to send.
    if let Some(frame) = venue.subscribe_frame(symbol) {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = ws.close(None).await;
                    return Ok(SessionEnd::Shutdown);
                }
            }
            _ = sleep(Duration::from_millis(cfg.settle_delay_ms)) => {}
        }
        debug!(venue = venue.name(), %frame, "subscribing");
        ws.send(Message::Text(frame)).await?;
    }

    Ok(drive(venue, &mut ws, bus, shutdown).await)
}

/// Frame pump: processes messages in arrival order until close, error or
/// local shutdown.
async fn drive(
    venue: Venue,
    ws: &mut WsStream,
    bus: &mpsc::Sender<FeedEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let name = venue.name();
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = ws.close(None).await;
                    return SessionEnd::Shutdown;
                }
            }
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(txt))) => {
                    FRAMES_TOTAL.with_label_values(&[name]).inc();
                    if let Some(pong) = venue.pong_for(&txt) {
                        if let Err(e) = ws.send(Message::Text(pong.to_string())).await {
                            error!(venue = name, err = %e, "pong send failed");
                            return SessionEnd::Remote { code: 1006, reason: Some(e.to_string()) };
                        }
                        continue;
                    }
                    match venue.parse(&txt) {
                        Some(book) => {
                            let update = BookUpdate {
                                venue,
                                kind: book.kind,
                                bids: book.bids,
                                asks: book.asks,
                                ts: Utc::now().timestamp_millis(),
                            };
                            let _ = bus.send(FeedEvent::Book(update)).await;
                        }
                        None => {
                            // ack / heartbeat / malformed: drop, stay connected
                            PARSE_DROPS.with_label_values(&[name]).inc();
                            debug!(venue = name, "non-book frame dropped");
                        }
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(e) = ws.send(Message::Pong(payload)).await {
                        error!(venue = name, err = %e, "pong send failed");
                        return SessionEnd::Remote { code: 1006, reason: Some(e.to_string()) };
                    }
                }
                Some(Ok(Message::Close(cf))) => {
                    let (code, reason) = match cf {
                        Some(f) => (u16::from(f.code), Some(f.reason.to_string())),
                        None => (1005, None),
                    };
                    warn!(venue = name, code, "closed by remote");
                    return SessionEnd::Remote { code, reason };
                }
                Some(Ok(_)) => {} // binary/pong frames are not book data
                Some(Err(e)) => {
                    error!(venue = name, err = %e, "ws read error");
                    return SessionEnd::Remote { code: 1006, reason: Some(e.to_string()) };
                }
                None => {
                    warn!(venue = name, "stream ended");
                    return SessionEnd::Remote { code: 1006, reason: Some("stream ended".into()) };
                }
            }
        }
    }
}
