// ===============================
// src/analytics.rs
// ===============================
//
// Stateless analyses over a snapshot of bid/ask levels. Every function is
// pure: no shared state, safe to call concurrently for different
// snapshots. Degenerate input (empty levels, zero volume) yields a
// well-defined zero/empty result, never NaN/Infinity or a panic.

use std::cmp::Ordering;

use crate::domain::{Dominance, Imbalance, PressureZone, PriceLevel, Side};

/// Tunables for pressure-zone clustering and support/resistance.
#[derive(Debug, Clone)]
pub struct ZoneConfig {
    /// A level joins the open group iff |price - anchor| <= anchor * pct/100.
    pub grouping_percent: f64,
    /// Tighter grouping used by support/resistance detection.
    pub sr_percent: f64,
    /// Groups below this total volume are dropped.
    pub min_volume: f64,
    /// Zones at or above this intensity are flagged critical.
    pub critical_threshold: f64,
    /// Intensity denominator: group volume / (book volume * scale).
    pub intensity_scale: f64,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            grouping_percent: 0.1,
            sr_percent: 0.05,
            min_volume: 0.5,
            critical_threshold: 0.7,
            intensity_scale: 0.1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SupportResistance {
    /// Volume-weighted prices of the strongest bid clusters, best first.
    pub support: Vec<f64>,
    /// Same for ask clusters.
    pub resistance: Vec<f64>,
}

/// Σ(price·qty) / Σ(qty); 0 for an empty or zero-volume set.
pub fn calculate_vwap(levels: &[PriceLevel]) -> f64 {
    let (pv, vol) = levels
        .iter()
        .fold((0.0, 0.0), |(pv, vol), l| (pv + l.price * l.quantity, vol + l.quantity));
    if vol > 0.0 { pv / vol } else { 0.0 }
}

/// Cluster both sides into contiguous price bands and rank by volume.
/// Bids and asks are grouped independently, each pre-sorted in its natural
/// direction so a group is always a contiguous band.
pub fn analyze_pressure_zones(
    bids: &[PriceLevel],
    asks: &[PriceLevel],
    cfg: &ZoneConfig,
) -> Vec<PressureZone> {
    let book_volume: f64 = bids.iter().chain(asks).map(|l| l.quantity).sum();
    let mut zones = Vec::new();
    for (levels, side) in [(bids, Side::Bid), (asks, Side::Ask)] {
        group_side(levels, side, cfg.grouping_percent, &mut zones, |group| {
            zone_from_group(group, side, book_volume, cfg)
        });
    }
    zones.retain(|z| z.total_volume >= cfg.min_volume);
    for (i, z) in zones.iter_mut().enumerate() {
        z.id = i;
    }
    zones
}

/// Same grouping at a tighter percentage; keeps the 3 highest-volume
/// clusters per side and reports their volume-weighted prices.
pub fn detect_support_resistance(
    bids: &[PriceLevel],
    asks: &[PriceLevel],
    cfg: &ZoneConfig,
) -> SupportResistance {
    let book_volume: f64 = bids.iter().chain(asks).map(|l| l.quantity).sum();
    let mut out = SupportResistance::default();
    for (levels, side) in [(bids, Side::Bid), (asks, Side::Ask)] {
        let mut zones = Vec::new();
        group_side(levels, side, cfg.sr_percent, &mut zones, |group| {
            zone_from_group(group, side, book_volume, cfg)
        });
        zones.sort_by(|a, b| {
            b.total_volume.partial_cmp(&a.total_volume).unwrap_or(Ordering::Equal)
        });
        let prices = zones.iter().take(3).map(|z| z.vw_price);
        match side {
            Side::Bid => out.support = prices.collect(),
            Side::Ask => out.resistance = prices.collect(),
        }
    }
    out
}

/// Walk the side in its natural price direction and cut a new group
/// whenever a level falls outside the open group's anchor band.
fn group_side<F>(levels: &[PriceLevel], side: Side, percent: f64, out: &mut Vec<PressureZone>, make: F)
where
    F: Fn(&[PriceLevel]) -> PressureZone,
{
    if levels.is_empty() {
        return;
    }
    let mut sorted: Vec<PriceLevel> = levels.to_vec();
    sorted.sort_by(|a, b| {
        let ord = a.price.partial_cmp(&b.price).unwrap_or(Ordering::Equal);
        match side {
            Side::Bid => ord.reverse(),
            Side::Ask => ord,
        }
    });

    let mut group: Vec<PriceLevel> = Vec::new();
    let mut anchor = sorted[0].price;
    for level in sorted {
        if group.is_empty() {
            anchor = level.price;
            group.push(level);
            continue;
        }
        if (level.price - anchor).abs() <= anchor * (percent / 100.0) {
            group.push(level);
        } else {
            out.push(make(&group));
            anchor = level.price;
            group = vec![level];
        }
    }
    out.push(make(&group));
}

fn zone_from_group(group: &[PriceLevel], side: Side, book_volume: f64, cfg: &ZoneConfig) -> PressureZone {
    let total_volume: f64 = group.iter().map(|l| l.quantity).sum();
    let vw_price = calculate_vwap(group);
    let (mut lo, mut hi) = (f64::MAX, f64::MIN);
    for l in group {
        lo = lo.min(l.price);
        hi = hi.max(l.price);
    }
    let denom = book_volume * cfg.intensity_scale;
    let intensity = if denom > 0.0 { (total_volume / denom).min(1.0) } else { 0.0 };
    PressureZone {
        id: 0, // assigned by the caller once filtering is done
        price_start: lo,
        price_end: hi,
        total_volume,
        vw_price,
        intensity,
        critical: intensity >= cfg.critical_threshold,
        side,
        levels: group.to_vec(),
    }
}

/// Number of best levels per side that feed the imbalance ratio.
const IMBALANCE_DEPTH: usize = 10;

/// Display clamp for the bid/ask ratio when the ask side is empty.
const MAX_RATIO: f64 = 1_000.0;

/// Top-10 bid volume vs top-10 ask volume. Both sides empty reads as
/// balanced (ratio 1); a zero-ask, nonzero-bid book is fully bid-dominant
/// with the ratio clamped finite.
pub fn calculate_imbalance(bids: &[PriceLevel], asks: &[PriceLevel]) -> Imbalance {
    let bid_volume = top_volume(bids, Side::Bid);
    let ask_volume = top_volume(asks, Side::Ask);
    let total = bid_volume + ask_volume;

    let ratio = if ask_volume > 0.0 {
        (bid_volume / ask_volume).min(MAX_RATIO)
    } else if bid_volume > 0.0 {
        MAX_RATIO
    } else {
        1.0
    };
    let dominant = if ratio > 1.2 {
        Dominance::Bid
    } else if ratio < 0.8 {
        Dominance::Ask
    } else {
        Dominance::Balanced
    };
    let imbalance_pct = if total > 0.0 {
        (bid_volume - ask_volume).abs() / total * 100.0
    } else {
        0.0
    };
    Imbalance { bid_volume, ask_volume, ratio, dominant, imbalance_pct }
}

fn top_volume(levels: &[PriceLevel], side: Side) -> f64 {
    let mut sorted: Vec<&PriceLevel> = levels.iter().collect();
    sorted.sort_by(|a, b| {
        let ord = a.price.partial_cmp(&b.price).unwrap_or(Ordering::Equal);
        match side {
            Side::Bid => ord.reverse(),
            Side::Ask => ord,
        }
    });
    sorted.iter().take(IMBALANCE_DEPTH).map(|l| l.quantity).sum()
}

/// Fixed-size depth-intensity grid: price position on the x axis,
/// normalized quantity on the y axis.
#[derive(Debug, Clone)]
pub struct DepthHeatmap {
    pub size: usize,
    cells: Vec<f64>,
}

impl DepthHeatmap {
    pub fn new(size: usize) -> Self {
        Self { size, cells: vec![0.0; size * size] }
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.cells[row * self.size + col]
    }

    /// Radial falloff kernel around (row, col): linear falloff
    /// max(0, 1 - d/3) within radius 2, merged per cell with max (not sum)
    /// so overlapping levels keep peak intensity instead of double-counting.
    fn splat(&mut self, row: usize, col: usize, intensity: f64) {
        const RADIUS: i64 = 2;
        for dr in -RADIUS..=RADIUS {
            for dc in -RADIUS..=RADIUS {
                let (r, c) = (row as i64 + dr, col as i64 + dc);
                if r < 0 || c < 0 || r >= self.size as i64 || c >= self.size as i64 {
                    continue;
                }
                let dist = ((dr * dr + dc * dc) as f64).sqrt();
                let falloff = (1.0 - dist / 3.0).max(0.0);
                let idx = r as usize * self.size + c as usize;
                self.cells[idx] = self.cells[idx].max(intensity * falloff);
            }
        }
    }
}

pub const HEATMAP_SIZE: usize = 20;

/// Bucket every level into the grid by normalized price (column) and
/// normalized quantity (row), splatting each with the radial kernel.
pub fn depth_heatmap(bids: &[PriceLevel], asks: &[PriceLevel]) -> DepthHeatmap {
    let mut grid = DepthHeatmap::new(HEATMAP_SIZE);
    let all: Vec<&PriceLevel> = bids.iter().chain(asks).collect();
    if all.is_empty() {
        return grid;
    }
    let (mut lo, mut hi, mut max_qty) = (f64::MAX, f64::MIN, 0.0f64);
    for l in &all {
        lo = lo.min(l.price);
        hi = hi.max(l.price);
        max_qty = max_qty.max(l.quantity);
    }
    if max_qty <= 0.0 {
        return grid;
    }
    let span = (hi - lo).max(f64::EPSILON);
    let last = HEATMAP_SIZE - 1;
    for l in all {
        let col = (((l.price - lo) / span) * last as f64).round() as usize;
        let qty_norm = l.quantity / max_qty;
        let row = (qty_norm * last as f64).round() as usize;
        grid.splat(row.min(last), col.min(last), qty_norm);
    }
    grid
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(price: f64, qty: f64, side: Side) -> PriceLevel {
        PriceLevel {
            price,
            quantity: qty,
            side,
            venue: None,
            observed_at: 0,
            color: None,
        }
    }

    #[test]
    fn vwap_empty_is_zero() {
        assert_eq!(calculate_vwap(&[]), 0.0);
        let zero_vol = [level(100.0, 0.0, Side::Bid)];
        assert_eq!(calculate_vwap(&zero_vol), 0.0);
    }

    #[test]
    fn vwap_is_order_invariant() {
        let a = [level(100.0, 2.0, Side::Bid), level(110.0, 1.0, Side::Bid)];
        let b = [level(110.0, 1.0, Side::Bid), level(100.0, 2.0, Side::Bid)];
        let va = calculate_vwap(&a);
        assert!((va - calculate_vwap(&b)).abs() < 1e-12);
        assert!((va - (100.0 * 2.0 + 110.0) / 3.0).abs() < 1e-9);
    }

    #[test]
    fn grouping_splits_on_anchor_band() {
        // 0.1% around anchor 100 admits 100.05 and 100.09; 105 is its own group
        let asks: Vec<PriceLevel> = [100.0, 100.05, 100.09, 105.0]
            .into_iter()
            .map(|p| level(p, 1.0, Side::Ask))
            .collect();
        let cfg = ZoneConfig { min_volume: 0.0, ..ZoneConfig::default() };
        let zones = analyze_pressure_zones(&[], &asks, &cfg);
        assert_eq!(zones.len(), 2);
        assert_eq!(zones[0].levels.len(), 3);
        assert_eq!(zones[0].price_start, 100.0);
        assert_eq!(zones[0].price_end, 100.09);
        assert_eq!(zones[1].levels.len(), 1);
        assert_eq!(zones[1].vw_price, 105.0);
    }

    #[test]
    fn zone_intensity_normalized_and_critical_flagged() {
        // one heavy bid cluster vs a light ask: intensity saturates at 1
        let bids = [level(100.0, 8.0, Side::Bid)];
        let asks = [level(101.0, 2.0, Side::Ask)];
        let cfg = ZoneConfig { min_volume: 0.0, ..ZoneConfig::default() };
        let zones = analyze_pressure_zones(&bids, &asks, &cfg);
        let bid_zone = zones.iter().find(|z| z.side == Side::Bid).unwrap();
        // 8 / (10 * 0.1) = 8, clamped to 1
        assert_eq!(bid_zone.intensity, 1.0);
        assert!(bid_zone.critical);
        assert!(zones.iter().all(|z| z.price_start <= z.price_end));
    }

    #[test]
    fn min_volume_filters_dust_zones() {
        let bids = [level(100.0, 0.1, Side::Bid), level(90.0, 5.0, Side::Bid)];
        let cfg = ZoneConfig { min_volume: 1.0, ..ZoneConfig::default() };
        let zones = analyze_pressure_zones(&bids, &[], &cfg);
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].total_volume, 5.0);
        assert_eq!(zones[0].id, 0); // ids reassigned after filtering
    }

    #[test]
    fn support_resistance_keeps_top_three_per_side() {
        let bids: Vec<PriceLevel> = (0..5)
            .map(|i| level(100.0 - i as f64, 1.0 + i as f64, Side::Bid))
            .collect();
        let asks: Vec<PriceLevel> = (0..2)
            .map(|i| level(101.0 + i as f64, 1.0, Side::Ask))
            .collect();
        let sr = detect_support_resistance(&bids, &asks, &ZoneConfig::default());
        assert_eq!(sr.support.len(), 3);
        assert_eq!(sr.resistance.len(), 2);
        // strongest bid cluster is the deepest-priced, heaviest one
        assert_eq!(sr.support[0], 96.0);
    }

    #[test]
    fn imbalance_eighty_twenty() {
        let bids = [level(100.0, 80.0, Side::Bid)];
        let asks = [level(101.0, 20.0, Side::Ask)];
        let imb = calculate_imbalance(&bids, &asks);
        assert_eq!(imb.ratio, 4.0);
        assert_eq!(imb.dominant, Dominance::Bid);
        assert_eq!(imb.imbalance_pct, 60.0);
    }

    #[test]
    fn imbalance_degenerate_inputs_stay_finite() {
        let empty = calculate_imbalance(&[], &[]);
        assert_eq!(empty.ratio, 1.0);
        assert_eq!(empty.dominant, Dominance::Balanced);
        assert_eq!(empty.imbalance_pct, 0.0);

        let one_sided = calculate_imbalance(&[level(100.0, 5.0, Side::Bid)], &[]);
        assert!(one_sided.ratio.is_finite());
        assert_eq!(one_sided.dominant, Dominance::Bid);
        assert_eq!(one_sided.imbalance_pct, 100.0);
    }

    #[test]
    fn imbalance_uses_only_top_ten_levels() {
        // 12 bid levels of qty 1: only the 10 best count
        let bids: Vec<PriceLevel> = (0..12)
            .map(|i| level(100.0 - i as f64, 1.0, Side::Bid))
            .collect();
        let asks = [level(101.0, 10.0, Side::Ask)];
        let imb = calculate_imbalance(&bids, &asks);
        assert_eq!(imb.bid_volume, 10.0);
        assert_eq!(imb.dominant, Dominance::Balanced);
    }

    #[test]
    fn heatmap_overlap_takes_max_not_sum() {
        let mut grid = DepthHeatmap::new(HEATMAP_SIZE);
        grid.splat(5, 5, 0.3);
        grid.splat(5, 5, 0.8);
        assert_eq!(grid.get(5, 5), 0.8);
        // neighbour one cell away: 0.8 * (1 - 1/3)
        assert!((grid.get(5, 6) - 0.8 * (2.0 / 3.0)).abs() < 1e-12);
        // outside the radius stays untouched
        assert_eq!(grid.get(5, 8), 0.0);
    }

    #[test]
    fn heatmap_empty_input_is_all_zero() {
        let grid = depth_heatmap(&[], &[]);
        for r in 0..HEATMAP_SIZE {
            for c in 0..HEATMAP_SIZE {
                assert_eq!(grid.get(r, c), 0.0);
            }
        }
    }

    #[test]
    fn heatmap_peaks_at_heaviest_level() {
        let bids = [level(100.0, 1.0, Side::Bid), level(99.0, 4.0, Side::Bid)];
        let grid = depth_heatmap(&bids, &[]);
        // heaviest level normalizes to 1.0 somewhere in the grid
        let peak = (0..HEATMAP_SIZE)
            .flat_map(|r| (0..HEATMAP_SIZE).map(move |c| (r, c)))
            .map(|(r, c)| grid.get(r, c))
            .fold(0.0f64, f64::max);
        assert_eq!(peak, 1.0);
    }
}
