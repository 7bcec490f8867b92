// ===============================
// src/domain.rs
// ===============================
use serde::Serialize;

use crate::venues::{ParseKind, Venue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Side { Bid, Ask }

/// One (price, quantity) pair on one side of the book.
/// Immutable once produced by an adapter; zero-quantity levels are
/// filtered at the adapter boundary and never reach consumers.
#[derive(Debug, Clone, Serialize)]
pub struct PriceLevel {
    pub price: f64,
    pub quantity: f64,
    pub side: Side,
    pub venue: Option<Venue>,
    /// Unix ms at which the level was observed.
    pub observed_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<&'static str>,
}

/// Connection lifecycle per venue. `Failed` is terminal: the retry budget
/// is exhausted and the venue is not reconnected without a re-toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnState {
    Idle,
    Connecting,
    Open,
    Closed { code: u16 },
    Failed,
}

impl ConnState {
    pub fn is_open(&self) -> bool { matches!(self, ConnState::Open) }
}

/// Normalized orderbook batch emitted by a venue connection.
/// Raw (price, qty) pairs; the aggregator turns them into `PriceLevel`s.
/// Delta batches keep quantity-0 pairs as level removals.
#[derive(Debug, Clone)]
pub struct BookUpdate {
    pub venue: Venue,
    pub kind: ParseKind,
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
    pub ts: i64,
}

/// Bus traffic from venue connections into the aggregator task.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Book(BookUpdate),
    State { venue: Venue, state: ConnState, reason: Option<String> },
}

/// Last-known book for one venue. Replaced wholesale on every update;
/// consumers never observe a partially-written snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct VenueBookSnapshot {
    pub venue: Venue,
    pub bids: Vec<PriceLevel>, // descending price
    pub asks: Vec<PriceLevel>, // ascending price
    pub state: ConnState,
    /// false = synthetic placeholder, must never be mistaken for feed data
    pub live: bool,
    pub last_update: i64,
    pub last_error: Option<String>,
}

/// Merged cross-venue view, recomputed on every venue update.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregatedBook {
    pub bids: Vec<PriceLevel>, // descending, price-unique, capped
    pub asks: Vec<PriceLevel>, // ascending, price-unique, capped
    pub venues_total: usize,
    pub venues_connected: usize,
    pub last_update: i64,
}

impl AggregatedBook {
    pub fn best_bid(&self) -> Option<f64> { self.bids.first().map(|l| l.price) }
    pub fn best_ask(&self) -> Option<f64> { self.asks.first().map(|l| l.price) }

    pub fn mid_price(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((b + a) / 2.0),
            _ => None,
        }
    }

    pub fn spread(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some(a - b),
            _ => None,
        }
    }
}

/// What the aggregator publishes on its watch channel: the merged book
/// plus the per-venue health/snapshot map, as one consistent value.
#[derive(Debug, Clone, Default)]
pub struct AggSnapshot {
    pub book: AggregatedBook,
    pub venues: ahash::AHashMap<Venue, VenueBookSnapshot>,
}

/// A contiguous price band with elevated aggregated volume.
#[derive(Debug, Clone, Serialize)]
pub struct PressureZone {
    pub id: usize,
    pub price_start: f64, // price_start <= price_end
    pub price_end: f64,
    pub total_volume: f64,
    pub vw_price: f64,
    pub intensity: f64, // in [0, 1]
    pub critical: bool,
    pub side: Side,
    pub levels: Vec<PriceLevel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Dominance { Bid, Ask, Balanced }

/// Top-of-book volume imbalance. `ratio` is clamped to a finite value so
/// a one-sided book never leaks Infinity/NaN into display.
#[derive(Debug, Clone, Serialize)]
pub struct Imbalance {
    pub bid_volume: f64,
    pub ask_volume: f64,
    pub ratio: f64,
    pub dominant: Dominance,
    pub imbalance_pct: f64,
}

/// One sampled per-venue book in the historical ring buffer.
#[derive(Debug, Clone, Serialize)]
pub struct HistoricalSample {
    pub timestamp: i64,
    pub venue: Venue,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}
