// ===============================
// src/history.rs
// ===============================
//
// Historical Recorder. One sampling task per time-range bucket reads the
// aggregator's watch channel on that bucket's interval and appends one
// HistoricalSample per live venue to a FIFO ring capped at
// `max_data_points`. Queries (raw samples, time slices, slice
// re-aggregation, volume profile) are sync reads over the shared store.
// `stop` aborts every sampling task; leaving timers running after
// teardown is a leak.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use ahash::AHashMap as HashMap;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::info;

use crate::aggregator::aggregate_levels;
use crate::domain::{AggSnapshot, HistoricalSample, PriceLevel, Side};
use crate::metrics::HIST_SAMPLES;
use crate::venues::Venue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TimeRange { M1, M5, M15, H1 }

impl TimeRange {
    pub const ALL: [TimeRange; 4] = [TimeRange::M1, TimeRange::M5, TimeRange::M15, TimeRange::H1];

    pub fn label(&self) -> &'static str {
        match self {
            TimeRange::M1 => "1m",
            TimeRange::M5 => "5m",
            TimeRange::M15 => "15m",
            TimeRange::H1 => "1h",
        }
    }

    /// Sampling cadence: 60 points span the whole range.
    pub fn sample_interval(&self) -> Duration {
        match self {
            TimeRange::M1 => Duration::from_secs(1),
            TimeRange::M5 => Duration::from_secs(5),
            TimeRange::M15 => Duration::from_secs(15),
            TimeRange::H1 => Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HistoryCfg {
    pub max_data_points: usize,
}

impl Default for HistoryCfg {
    fn default() -> Self {
        Self { max_data_points: 60 }
    }
}

/// One point of the cross-time volume profile.
#[derive(Debug, Clone, Serialize)]
pub struct PricePoint {
    pub price: f64,
    pub volume: f64,
}

type Store = Arc<Mutex<HashMap<TimeRange, VecDeque<HistoricalSample>>>>;

pub struct HistoryRecorder {
    cfg: HistoryCfg,
    store: Store,
    tasks: Vec<JoinHandle<()>>,
}

impl HistoryRecorder {
    pub fn new(cfg: HistoryCfg) -> Self {
        let mut rings = HashMap::new();
        for range in TimeRange::ALL {
            rings.insert(range, VecDeque::with_capacity(cfg.max_data_points));
        }
        Self { cfg, store: Arc::new(Mutex::new(rings)), tasks: Vec::new() }
    }

    /// Spawn one sampling task per time range. Only live venue snapshots
    /// are recorded; placeholder data never enters history.
    pub fn start(&mut self, snap_rx: watch::Receiver<AggSnapshot>) {
        if !self.tasks.is_empty() {
            return; // already recording
        }
        for range in TimeRange::ALL {
            let store = Arc::clone(&self.store);
            let rx = snap_rx.clone();
            let cap = self.cfg.max_data_points;
            self.tasks.push(tokio::spawn(async move {
                let mut tick = interval(range.sample_interval());
                tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tick.tick().await;
                    let snap = rx.borrow().clone();
                    let ts = Utc::now().timestamp_millis();
                    let mut rings = match store.lock() {
                        Ok(g) => g,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    if let Some(ring) = rings.get_mut(&range) {
                        for vsnap in snap.venues.values().filter(|v| v.live) {
                            push_sample(ring, cap, HistoricalSample {
                                timestamp: ts,
                                venue: vsnap.venue,
                                bids: vsnap.bids.clone(),
                                asks: vsnap.asks.clone(),
                            });
                        }
                        HIST_SAMPLES.with_label_values(&[range.label()]).set(ring.len() as i64);
                    }
                }
            }));
        }
        info!(ranges = TimeRange::ALL.len(), "history recorder started");
    }

    /// Raw samples for a range, oldest first, optionally one venue only.
    pub fn samples(&self, range: TimeRange, venue: Option<Venue>) -> Vec<HistoricalSample> {
        let rings = match self.store.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        rings
            .get(&range)
            .map(|ring| {
                ring.iter()
                    .filter(|s| venue.map_or(true, |v| s.venue == v))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Split the buffer into up to `n` equal-ish contiguous chunks,
    /// keeping the most recent ones, oldest chunk first.
    pub fn time_slices(&self, range: TimeRange, n: usize) -> Vec<Vec<HistoricalSample>> {
        if n == 0 {
            return Vec::new();
        }
        let samples = self.samples(range, None);
        if samples.is_empty() {
            return Vec::new();
        }
        let chunk = (samples.len() + n - 1) / n;
        let mut slices: Vec<Vec<HistoricalSample>> =
            samples.chunks(chunk).map(|c| c.to_vec()).collect();
        if slices.len() > n {
            slices.drain(..slices.len() - n);
        }
        slices
    }

    /// Re-aggregate one slice into a merged bid/ask view, same
    /// price-summing rule as the live aggregation.
    pub fn aggregate_slice(samples: &[HistoricalSample], depth: usize) -> (Vec<PriceLevel>, Vec<PriceLevel>) {
        let mut bids = Vec::new();
        let mut asks = Vec::new();
        for s in samples {
            bids.extend(s.bids.iter().cloned());
            asks.extend(s.asks.iter().cloned());
        }
        (
            aggregate_levels(bids, Side::Bid, depth),
            aggregate_levels(asks, Side::Ask, depth),
        )
    }

    /// Cross-time volume profile: price -> volume, where each price takes
    /// the volume observed in the latest sample containing it. Result is
    /// sorted ascending by price.
    pub fn volume_profile(&self, range: TimeRange) -> Vec<PricePoint> {
        let samples = self.samples(range, None);
        // keyed by price bits; prices are positive finite so bits sort too
        let mut acc: HashMap<u64, (i64, f64)> = HashMap::new();
        for sample in &samples {
            let mut per_price: HashMap<u64, f64> = HashMap::new();
            for l in sample.bids.iter().chain(&sample.asks) {
                *per_price.entry(l.price.to_bits()).or_insert(0.0) += l.quantity;
            }
            for (bits, vol) in per_price {
                let entry = acc.entry(bits).or_insert((i64::MIN, 0.0));
                if sample.timestamp >= entry.0 {
                    *entry = (sample.timestamp, vol);
                }
            }
        }
        let mut out: Vec<PricePoint> = acc
            .into_iter()
            .map(|(bits, (_, volume))| PricePoint { price: f64::from_bits(bits), volume })
            .collect();
        out.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));
        out
    }

    /// Cancel all sampling timers. Idempotent; recorded data stays
    /// queryable after stopping.
    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for HistoryRecorder {
    fn drop(&mut self) {
        self.stop();
    }
}

/// FIFO push with capacity: oldest sample is evicted first.
fn push_sample(ring: &mut VecDeque<HistoricalSample>, cap: usize, sample: HistoricalSample) {
    while ring.len() >= cap.max(1) {
        ring.pop_front();
    }
    ring.push_back(sample);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AggregatedBook, ConnState, VenueBookSnapshot};

    fn level(price: f64, qty: f64, side: Side, ts: i64) -> PriceLevel {
        PriceLevel {
            price,
            quantity: qty,
            side,
            venue: Some(Venue::Binance),
            observed_at: ts,
            color: None,
        }
    }

    fn sample(ts: i64, venue: Venue, bid_px: f64, qty: f64) -> HistoricalSample {
        HistoricalSample {
            timestamp: ts,
            venue,
            bids: vec![level(bid_px, qty, Side::Bid, ts)],
            asks: vec![level(bid_px + 1.0, qty, Side::Ask, ts)],
        }
    }

    #[test]
    fn ring_evicts_oldest_first() {
        let cap = 60;
        let mut ring = VecDeque::new();
        for i in 0..(cap + 5) {
            push_sample(&mut ring, cap, sample(i as i64, Venue::Binance, 100.0, 1.0));
        }
        assert_eq!(ring.len(), cap);
        assert_eq!(ring.front().unwrap().timestamp, 5); // 0..=4 evicted in order
        assert_eq!(ring.back().unwrap().timestamp, (cap + 4) as i64);
    }

    #[test]
    fn samples_filter_by_venue() {
        let rec = HistoryRecorder::new(HistoryCfg::default());
        {
            let mut rings = rec.store.lock().unwrap();
            let ring = rings.get_mut(&TimeRange::M1).unwrap();
            push_sample(ring, 60, sample(1, Venue::Binance, 100.0, 1.0));
            push_sample(ring, 60, sample(2, Venue::Kraken, 99.0, 2.0));
        }
        assert_eq!(rec.samples(TimeRange::M1, None).len(), 2);
        let kraken = rec.samples(TimeRange::M1, Some(Venue::Kraken));
        assert_eq!(kraken.len(), 1);
        assert_eq!(kraken[0].timestamp, 2);
        assert!(rec.samples(TimeRange::M5, None).is_empty());
    }

    #[test]
    fn time_slices_keep_most_recent_chunks() {
        let rec = HistoryRecorder::new(HistoryCfg::default());
        {
            let mut rings = rec.store.lock().unwrap();
            let ring = rings.get_mut(&TimeRange::M5).unwrap();
            for i in 0..10 {
                push_sample(ring, 60, sample(i, Venue::Binance, 100.0, 1.0));
            }
        }
        let slices = rec.time_slices(TimeRange::M5, 3);
        assert_eq!(slices.len(), 3);
        // ceil(10/3) = 4 -> 4 + 4 + 2, contiguous and in time order
        assert_eq!(slices[0].len(), 4);
        assert_eq!(slices[2].len(), 2);
        assert_eq!(slices[0][0].timestamp, 0);
        assert_eq!(slices[2][1].timestamp, 9);
        assert!(rec.time_slices(TimeRange::M5, 0).is_empty());
    }

    #[test]
    fn aggregate_slice_sums_duplicate_prices() {
        let samples = [
            sample(1, Venue::Binance, 100.0, 1.0),
            sample(2, Venue::Kraken, 100.0, 2.5),
        ];
        let (bids, asks) = HistoryRecorder::aggregate_slice(&samples, 50);
        assert_eq!(bids.len(), 1);
        assert_eq!(bids[0].quantity, 3.5);
        assert_eq!(asks.len(), 1);
        assert_eq!(asks[0].price, 101.0);
    }

    #[test]
    fn volume_profile_latest_timestamp_wins() {
        let rec = HistoryRecorder::new(HistoryCfg::default());
        {
            let mut rings = rec.store.lock().unwrap();
            let ring = rings.get_mut(&TimeRange::M1).unwrap();
            push_sample(ring, 60, sample(1, Venue::Binance, 100.0, 5.0));
            push_sample(ring, 60, sample(9, Venue::Binance, 100.0, 2.0));
        }
        let profile = rec.volume_profile(TimeRange::M1);
        let at_100 = profile.iter().find(|p| p.price == 100.0).unwrap();
        assert_eq!(at_100.volume, 2.0); // ts 9 beats ts 1
        // sorted ascending by price
        assert!(profile.windows(2).all(|w| w[0].price < w[1].price));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_sampling_timers() {
        let mut venues = HashMap::new();
        venues.insert(Venue::Binance, VenueBookSnapshot {
            venue: Venue::Binance,
            bids: vec![level(100.0, 1.0, Side::Bid, 1)],
            asks: vec![level(101.0, 1.0, Side::Ask, 1)],
            state: ConnState::Open,
            live: true,
            last_update: 1,
            last_error: None,
        });
        let snap = AggSnapshot { book: AggregatedBook::default(), venues };
        let (_snap_tx, snap_rx) = watch::channel(snap);

        let mut rec = HistoryRecorder::new(HistoryCfg { max_data_points: 10 });
        rec.start(snap_rx);
        tokio::time::sleep(Duration::from_secs(3)).await;
        let recorded = rec.samples(TimeRange::M1, None).len();
        assert!(recorded >= 2, "expected samples after 3s, got {recorded}");

        rec.stop();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(rec.samples(TimeRange::M1, None).len(), recorded);
        rec.stop(); // idempotent
    }
}
