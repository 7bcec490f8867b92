// ===============================
// src/mock.rs
// ===============================
//
// Synthetic placeholder books. Generated for any selected venue that has
// no connected live snapshot, so the merged view is never empty purely
// because a feed is down. Consumers must treat these as not-live; the
// aggregator tags them `live = false` and never lets one overwrite a
// live snapshot.

use rand::Rng;

use crate::venues::Venue;

pub const PLACEHOLDER_LEVELS: usize = 15;

/// Random book around `base_price + venue.price_offset()`: bids walk down
/// from just under mid, asks walk up from just over it.
pub fn placeholder_book(venue: Venue, base_price: f64) -> (Vec<(f64, f64)>, Vec<(f64, f64)>) {
    let mut rng = rand::thread_rng();
    let mid = base_price + venue.price_offset() + rng.gen_range(-3.0..3.0);
    let tick = (mid * 0.0001).max(0.01);

    let mut bids = Vec::with_capacity(PLACEHOLDER_LEVELS);
    let mut asks = Vec::with_capacity(PLACEHOLDER_LEVELS);
    let mut bid_px = mid - tick / 2.0;
    let mut ask_px = mid + tick / 2.0;
    for _ in 0..PLACEHOLDER_LEVELS {
        bids.push((bid_px, rng.gen_range(0.05..2.5)));
        asks.push((ask_px, rng.gen_range(0.05..2.5)));
        bid_px -= tick * rng.gen_range(0.5..2.0);
        ask_px += tick * rng.gen_range(0.5..2.0);
    }
    (bids, asks)
}
