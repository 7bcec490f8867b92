// ===============================
// src/aggregator.rs
// ===============================
//
// Aggregation Layer. A single task owns the per-venue snapshot map:
// venue connections write to it only through the FeedEvent bus, and
// consumers only ever see fully-formed snapshots through the watch
// channel (replace-on-write, never partial state).
//
// Venues without a connected live book get a synthetic placeholder,
// regenerated on a fixed timer and tagged live=false; a placeholder
// never overwrites a live snapshot.

use std::cmp::Ordering;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::domain::{
    AggSnapshot, AggregatedBook, BookUpdate, ConnState, FeedEvent, PriceLevel, Side,
    VenueBookSnapshot,
};
use crate::metrics::{AGG_DEPTH, BOOK_UPDATES, VENUES_CONNECTED};
use crate::mock;
use crate::venues::{ParseKind, Venue};

#[derive(Debug, Clone)]
pub struct AggCfg {
    /// Max levels kept per merged side.
    pub depth: usize,
    /// Cadence for regenerating placeholder books on disconnected venues.
    pub placeholder_interval: Duration,
    /// Seed price for placeholder generation.
    pub base_price: f64,
}

impl Default for AggCfg {
    fn default() -> Self {
        Self {
            depth: 50,
            placeholder_interval: Duration::from_secs(2),
            base_price: 65_000.0,
        }
    }
}

/// Sort one side (stable), sum levels that share a price, cap at `depth`.
/// Summed levels keep the first contributor's venue tag and color and the
/// latest observation timestamp. Idempotent: re-aggregating an already
/// aggregated side yields the same sequence.
pub fn aggregate_levels(levels: Vec<PriceLevel>, side: Side, depth: usize) -> Vec<PriceLevel> {
    let mut sorted = levels;
    sorted.sort_by(|a, b| {
        let ord = a.price.partial_cmp(&b.price).unwrap_or(Ordering::Equal);
        match side {
            Side::Bid => ord.reverse(),
            Side::Ask => ord,
        }
    });

    let mut out: Vec<PriceLevel> = Vec::with_capacity(sorted.len().min(depth));
    for level in sorted {
        match out.last_mut() {
            Some(prev) if prev.price == level.price => {
                prev.quantity += level.quantity;
                prev.observed_at = prev.observed_at.max(level.observed_at);
            }
            _ => out.push(level),
        }
    }
    out.truncate(depth);
    out
}

/// Merge the selected venues' snapshots into one ranked view.
pub fn merge_books(
    venues: &HashMap<Venue, VenueBookSnapshot>,
    selected: &[Venue],
    depth: usize,
) -> AggregatedBook {
    let mut bids = Vec::new();
    let mut asks = Vec::new();
    let mut last_update = 0i64;
    let mut connected = 0usize;

    for venue in selected {
        let Some(snap) = venues.get(venue) else { continue };
        bids.extend(snap.bids.iter().cloned());
        asks.extend(snap.asks.iter().cloned());
        last_update = last_update.max(snap.last_update);
        if snap.state.is_open() {
            connected += 1;
        }
    }

    AggregatedBook {
        bids: aggregate_levels(bids, Side::Bid, depth),
        asks: aggregate_levels(asks, Side::Ask, depth),
        venues_total: selected.len(),
        venues_connected: connected,
        last_update,
    }
}

fn levels_of(venue: Venue, pairs: &[(f64, f64)], side: Side, ts: i64) -> Vec<PriceLevel> {
    let mut levels: Vec<PriceLevel> = pairs
        .iter()
        .map(|&(price, quantity)| PriceLevel {
            price,
            quantity,
            side,
            venue: Some(venue),
            observed_at: ts,
            color: Some(venue.color()),
        })
        .collect();
    levels.sort_by(|a, b| {
        let ord = a.price.partial_cmp(&b.price).unwrap_or(Ordering::Equal);
        match side {
            Side::Bid => ord.reverse(),
            Side::Ask => ord,
        }
    });
    levels
}

fn placeholder_snapshot(
    venue: Venue,
    state: ConnState,
    last_error: Option<String>,
    base_price: f64,
) -> VenueBookSnapshot {
    let ts = Utc::now().timestamp_millis();
    let (bids, asks) = mock::placeholder_book(venue, base_price);
    VenueBookSnapshot {
        venue,
        bids: levels_of(venue, &bids, Side::Bid, ts),
        asks: levels_of(venue, &asks, Side::Ask, ts),
        state,
        live: false,
        last_update: ts,
        last_error,
    }
}

/// Aggregator task. Consumes the feed bus, maintains the snapshot map and
/// publishes a fresh AggSnapshot on every change.
pub async fn run(
    mut rx: mpsc::Receiver<FeedEvent>,
    snap_tx: watch::Sender<AggSnapshot>,
    selected: Vec<Venue>,
    cfg: AggCfg,
) {
    let mut venues: HashMap<Venue, VenueBookSnapshot> = HashMap::new();
    for venue in &selected {
        venues.insert(*venue, placeholder_snapshot(*venue, ConnState::Idle, None, cfg.base_price));
    }
    publish(&snap_tx, &venues, &selected, &cfg);

    let mut tick = interval(cfg.placeholder_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            ev = rx.recv() => match ev {
                Some(FeedEvent::Book(update)) => {
                    if !selected.contains(&update.venue) {
                        warn!(venue = update.venue.name(), "book update from unselected venue");
                        continue;
                    }
                    BOOK_UPDATES.inc();
                    apply_book(&mut venues, update);
                    publish(&snap_tx, &venues, &selected, &cfg);
                }
                Some(FeedEvent::State { venue, state, reason }) => {
                    if let Some(snap) = venues.get_mut(&venue) {
                        snap.state = state;
                        if reason.is_some() {
                            snap.last_error = reason;
                        }
                        // data stops being live the moment the feed drops
                        if !state.is_open() {
                            snap.live = false;
                        }
                        publish(&snap_tx, &venues, &selected, &cfg);
                    }
                }
                None => {
                    info!("feed bus closed, aggregator stopping");
                    return;
                }
            },
            _ = tick.tick() => {
                let mut touched = false;
                for venue in &selected {
                    let refresh = venues
                        .get(venue)
                        .map(|s| !(s.live && s.state.is_open()))
                        .unwrap_or(true);
                    if refresh {
                        // carry state and failure reason across regeneration
                        let (state, last_error) = venues
                            .get(venue)
                            .map(|s| (s.state, s.last_error.clone()))
                            .unwrap_or((ConnState::Idle, None));
                        venues.insert(
                            *venue,
                            placeholder_snapshot(*venue, state, last_error, cfg.base_price),
                        );
                        touched = true;
                    }
                }
                if touched {
                    publish(&snap_tx, &venues, &selected, &cfg);
                }
            }
        }
    }
}

/// Play a delta's (price, qty) changes onto the previous side. Qty 0
/// removes the level, anything else replaces or inserts it.
fn apply_delta(prev: &[PriceLevel], changes: &[(f64, f64)]) -> Vec<(f64, f64)> {
    let mut book: Vec<(f64, f64)> = prev.iter().map(|l| (l.price, l.quantity)).collect();
    for &(price, qty) in changes {
        book.retain(|&(p, _)| p != price);
        if qty > 0.0 {
            book.push((price, qty));
        }
    }
    book
}

fn apply_book(venues: &mut HashMap<Venue, VenueBookSnapshot>, update: BookUpdate) {
    let BookUpdate { venue, kind, bids, asks, ts } = update;
    let prev = venues.get(&venue);
    let state = prev.map(|s| s.state).unwrap_or(ConnState::Open);
    let (bids, asks) = match kind {
        ParseKind::Snapshot => (bids, asks),
        // deltas build on the previous live book; placeholder data is
        // never a baseline, so the first delta after one starts empty
        ParseKind::Delta => match prev.filter(|s| s.live) {
            Some(s) => (apply_delta(&s.bids, &bids), apply_delta(&s.asks, &asks)),
            None => (apply_delta(&[], &bids), apply_delta(&[], &asks)),
        },
    };
    // the snapshot itself is still rebuilt whole, never patched in place
    venues.insert(venue, VenueBookSnapshot {
        venue,
        bids: levels_of(venue, &bids, Side::Bid, ts),
        asks: levels_of(venue, &asks, Side::Ask, ts),
        state,
        live: true,
        last_update: ts,
        last_error: None,
    });
}

fn publish(
    snap_tx: &watch::Sender<AggSnapshot>,
    venues: &HashMap<Venue, VenueBookSnapshot>,
    selected: &[Venue],
    cfg: &AggCfg,
) {
    let book = merge_books(venues, selected, cfg.depth);
    AGG_DEPTH.with_label_values(&["bid"]).set(book.bids.len() as i64);
    AGG_DEPTH.with_label_values(&["ask"]).set(book.asks.len() as i64);
    VENUES_CONNECTED.set(book.venues_connected as i64);
    let _ = snap_tx.send(AggSnapshot { book, venues: venues.clone() });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(venue: Venue, price: f64, qty: f64, side: Side) -> PriceLevel {
        PriceLevel {
            price,
            quantity: qty,
            side,
            venue: Some(venue),
            observed_at: 1,
            color: Some(venue.color()),
        }
    }

    fn snapshot(venue: Venue, bids: Vec<PriceLevel>, asks: Vec<PriceLevel>, state: ConnState, live: bool) -> VenueBookSnapshot {
        VenueBookSnapshot {
            venue,
            bids,
            asks,
            state,
            live,
            last_update: 1,
            last_error: None,
        }
    }

    #[test]
    fn merged_sides_are_sorted_and_price_unique() {
        let mut venues = HashMap::new();
        venues.insert(Venue::Binance, snapshot(
            Venue::Binance,
            vec![level(Venue::Binance, 100.0, 1.0, Side::Bid), level(Venue::Binance, 99.0, 2.0, Side::Bid)],
            vec![level(Venue::Binance, 101.0, 1.0, Side::Ask)],
            ConnState::Open,
            true,
        ));
        venues.insert(Venue::Kraken, snapshot(
            Venue::Kraken,
            vec![level(Venue::Kraken, 100.0, 3.0, Side::Bid)],
            vec![level(Venue::Kraken, 100.5, 2.0, Side::Ask)],
            ConnState::Open,
            true,
        ));
        let selected = [Venue::Binance, Venue::Kraken];
        let book = merge_books(&venues, &selected, 50);

        assert!(book.bids.windows(2).all(|w| w[0].price > w[1].price));
        assert!(book.asks.windows(2).all(|w| w[0].price < w[1].price));
        // 100.0 appears once, summed across venues
        assert_eq!(book.bids[0].price, 100.0);
        assert_eq!(book.bids[0].quantity, 4.0);
        assert_eq!(book.bids[0].venue, Some(Venue::Binance)); // first contributor kept
        assert_eq!(book.venues_connected, 2);
        assert_eq!(book.venues_total, 2);
    }

    #[test]
    fn merged_sides_cap_at_depth() {
        let bids: Vec<PriceLevel> = (0..80)
            .map(|i| level(Venue::Binance, 100.0 - i as f64 * 0.1, 1.0, Side::Bid))
            .collect();
        let out = aggregate_levels(bids, Side::Bid, 50);
        assert_eq!(out.len(), 50);
        assert_eq!(out[0].price, 100.0); // best bids survive the cap
    }

    #[test]
    fn aggregation_is_idempotent() {
        let levels = vec![
            level(Venue::Binance, 100.0, 1.0, Side::Ask),
            level(Venue::Kraken, 100.0, 2.0, Side::Ask),
            level(Venue::Okx, 101.0, 1.5, Side::Ask),
        ];
        let once = aggregate_levels(levels, Side::Ask, 50);
        let twice = aggregate_levels(once.clone(), Side::Ask, 50);
        assert_eq!(once.len(), twice.len());
        for (a, b) in once.iter().zip(&twice) {
            assert_eq!(a.price, b.price);
            assert_eq!(a.quantity, b.quantity);
        }
    }

    #[test]
    fn disconnected_venue_does_not_count_as_connected() {
        let mut venues = HashMap::new();
        venues.insert(Venue::Binance, snapshot(
            Venue::Binance,
            vec![level(Venue::Binance, 100.0, 1.0, Side::Bid)],
            vec![],
            ConnState::Closed { code: 1006 },
            false,
        ));
        let book = merge_books(&venues, &[Venue::Binance], 50);
        assert_eq!(book.venues_connected, 0);
        assert_eq!(book.venues_total, 1);
        // placeholder data still present so the view is never empty
        assert!(!book.bids.is_empty());
    }

    fn book_event(kind: ParseKind, bids: Vec<(f64, f64)>, asks: Vec<(f64, f64)>, ts: i64) -> BookUpdate {
        BookUpdate { venue: Venue::Coinbase, kind, bids, asks, ts }
    }

    #[test]
    fn delta_updates_maintain_the_venue_book() {
        let mut venues = HashMap::new();
        apply_book(&mut venues, book_event(
            ParseKind::Snapshot,
            vec![(64000.0, 1.0), (63999.0, 2.0)],
            vec![(64001.0, 0.5), (64002.0, 1.5)],
            1,
        ));

        // bump one bid, remove one ask; everything untouched must survive
        apply_book(&mut venues, book_event(
            ParseKind::Delta,
            vec![(64000.0, 3.0)],
            vec![(64002.0, 0.0)],
            2,
        ));

        let snap = &venues[&Venue::Coinbase];
        assert!(snap.live);
        let bids: Vec<(f64, f64)> = snap.bids.iter().map(|l| (l.price, l.quantity)).collect();
        assert_eq!(bids, vec![(64000.0, 3.0), (63999.0, 2.0)]);
        let asks: Vec<(f64, f64)> = snap.asks.iter().map(|l| (l.price, l.quantity)).collect();
        assert_eq!(asks, vec![(64001.0, 0.5)]);

        // a later delta can re-add the removed level
        apply_book(&mut venues, book_event(
            ParseKind::Delta,
            vec![],
            vec![(64002.0, 0.9)],
            3,
        ));
        let snap = &venues[&Venue::Coinbase];
        assert_eq!(snap.asks.len(), 2);
        assert_eq!(snap.asks[1].price, 64002.0);
        assert_eq!(snap.asks[1].quantity, 0.9);
    }

    #[test]
    fn delta_against_placeholder_starts_fresh() {
        let mut venues = HashMap::new();
        venues.insert(
            Venue::Coinbase,
            placeholder_snapshot(Venue::Coinbase, ConnState::Connecting, None, 65_000.0),
        );

        apply_book(&mut venues, book_event(
            ParseKind::Delta,
            vec![(64000.0, 1.0)],
            vec![],
            1,
        ));

        let snap = &venues[&Venue::Coinbase];
        assert!(snap.live);
        // synthetic levels never leak into the live book
        assert_eq!(snap.bids.len(), 1);
        assert_eq!(snap.bids[0].price, 64000.0);
        assert!(snap.asks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn placeholder_never_overwrites_live_snapshot() {
        let (tx, rx) = mpsc::channel(64);
        let (snap_tx, snap_rx) = watch::channel(AggSnapshot::default());
        tokio::spawn(run(rx, snap_tx, vec![Venue::Binance], AggCfg::default()));
        tokio::time::sleep(Duration::from_millis(20)).await;

        // before any live data: placeholder, tagged not live
        {
            let snap = snap_rx.borrow();
            let v = &snap.venues[&Venue::Binance];
            assert!(!v.live);
            assert!(!v.bids.is_empty());
        }

        tx.send(FeedEvent::State {
            venue: Venue::Binance,
            state: ConnState::Open,
            reason: None,
        }).await.unwrap();
        tx.send(FeedEvent::Book(BookUpdate {
            venue: Venue::Binance,
            kind: ParseKind::Snapshot,
            bids: vec![(64000.0, 1.5)],
            asks: vec![(64001.0, 0.5)],
            ts: 42,
        })).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // several placeholder ticks later the live book is untouched
        tokio::time::sleep(Duration::from_secs(7)).await;
        {
            let snap = snap_rx.borrow();
            let v = &snap.venues[&Venue::Binance];
            assert!(v.live);
            assert_eq!(v.bids[0].price, 64000.0);
            assert_eq!(snap.book.venues_connected, 1);
        }

        // once the feed drops, the next tick regenerates a placeholder
        tx.send(FeedEvent::State {
            venue: Venue::Binance,
            state: ConnState::Closed { code: 1006 },
            reason: Some("ws read error".into()),
        }).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        {
            let snap = snap_rx.borrow();
            let v = &snap.venues[&Venue::Binance];
            assert!(!v.live);
            assert_eq!(v.last_error.as_deref(), Some("ws read error"));
            assert!(!v.bids.is_empty());
        }
    }
}
