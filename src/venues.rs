// ===============================
// src/venues.rs
// ===============================
//
// Venue Adapter Registry:
// - static per-venue data (endpoint, display color, placeholder offset)
// - symbol formatting from the canonical lowercase pair (e.g. "btcusdt")
// - subscribe-frame builder (None for URL-subscribed venues)
// - pure wire parsers: raw text frame -> ParsedBook | None
//
// Parsers never throw on junk: acks, heartbeats and unknown shapes yield
// None, and any level with a non-positive or non-numeric quantity is
// filtered before it can reach the aggregator.

use serde::Serialize;
use serde_json::{json, Value};

/// Supported venues. Adding one means adding a variant here and covering
/// the exhaustive matches below; there is no stringly-typed dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Venue {
    Binance,
    Coinbase,
    Kraken,
    Okx,
}

/// Static per-venue configuration.
#[derive(Debug, Clone, Copy)]
pub struct VenueAdapter {
    pub name: &'static str,
    pub endpoint: &'static str,
    pub color: &'static str,
    /// Seed offset for the synthetic placeholder book, so placeholder
    /// feeds from different venues do not sit on identical prices.
    pub price_offset: f64,
}

static ADAPTERS: [(Venue, VenueAdapter); 4] = [
    (Venue::Binance, VenueAdapter {
        name: "binance",
        endpoint: "wss://stream.binance.com:9443/ws",
        color: "#f0b90b",
        price_offset: 0.0,
    }),
    (Venue::Coinbase, VenueAdapter {
        name: "coinbase",
        endpoint: "wss://ws-feed.exchange.coinbase.com",
        color: "#0052ff",
        price_offset: 12.0,
    }),
    (Venue::Kraken, VenueAdapter {
        name: "kraken",
        endpoint: "wss://ws.kraken.com",
        color: "#5741d9",
        price_offset: -8.0,
    }),
    (Venue::Okx, VenueAdapter {
        name: "okx",
        endpoint: "wss://ws.okx.com:8443/ws/v5/public",
        color: "#00b386",
        price_offset: 5.0,
    }),
];

/// Whether a frame carries the venue's full book or only changed levels.
/// Delta entries with quantity 0 are removals and must be applied to the
/// previously known book, not displayed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ParseKind {
    #[default]
    Snapshot,
    Delta,
}

/// Normalized parse result: raw (price, qty) pairs per side.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedBook {
    pub kind: ParseKind,
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
}

impl ParsedBook {
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

impl Venue {
    pub const ALL: [Venue; 4] = [Venue::Binance, Venue::Coinbase, Venue::Kraken, Venue::Okx];

    pub fn parse_id(s: &str) -> Option<Venue> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binance" => Some(Venue::Binance),
            "coinbase" => Some(Venue::Coinbase),
            "kraken" => Some(Venue::Kraken),
            "okx" => Some(Venue::Okx),
            _ => None,
        }
    }

    pub fn adapter(&self) -> &'static VenueAdapter {
        let idx = match self {
            Venue::Binance => 0,
            Venue::Coinbase => 1,
            Venue::Kraken => 2,
            Venue::Okx => 3,
        };
        &ADAPTERS[idx].1
    }

    pub fn name(&self) -> &'static str { self.adapter().name }
    pub fn color(&self) -> &'static str { self.adapter().color }
    pub fn price_offset(&self) -> f64 { self.adapter().price_offset }

    /// Map the canonical lowercase pair (e.g. "btcusdt") to the venue's
    /// wire symbol syntax.
    pub fn format_symbol(&self, pair: &str) -> String {
        let (base, quote) = split_pair(pair);
        match self {
            Venue::Binance => format!("{base}{quote}"),
            // Coinbase quotes spot pairs in USD, not USDT
            Venue::Coinbase => {
                let q = if quote == "usdt" { "usd" } else { quote };
                format!("{}-{}", base.to_ascii_uppercase(), q.to_ascii_uppercase())
            }
            Venue::Kraken => {
                let b = if base == "btc" { "xbt" } else { base };
                format!("{}/{}", b.to_ascii_uppercase(), quote.to_ascii_uppercase())
            }
            Venue::Okx => format!("{}-{}", base.to_ascii_uppercase(), quote.to_ascii_uppercase()),
        }
    }

    /// Connection URL. Binance subscribes via the URL path; the rest use a
    /// fixed endpoint plus a subscribe frame.
    pub fn ws_url(&self, pair: &str) -> String {
        match self {
            Venue::Binance => format!(
                "{}/{}@depth20@100ms",
                self.adapter().endpoint,
                self.format_symbol(pair)
            ),
            _ => self.adapter().endpoint.to_string(),
        }
    }

    /// JSON subscribe frame sent after the socket opens; None for venues
    /// whose subscription is embedded in the URL.
    pub fn subscribe_frame(&self, pair: &str) -> Option<String> {
        let sym = self.format_symbol(pair);
        let frame = match self {
            Venue::Binance => return None,
            Venue::Coinbase => json!({
                "type": "subscribe",
                "product_ids": [sym],
                "channels": ["level2_batch"],
            }),
            Venue::Kraken => json!({
                "event": "subscribe",
                "pair": [sym],
                "subscription": { "name": "book", "depth": 25 },
            }),
            Venue::Okx => json!({
                "op": "subscribe",
                "args": [{ "channel": "books5", "instId": sym }],
            }),
        };
        Some(frame.to_string())
    }

    /// Venue-specific answer to an application-level ping carried as a
    /// text frame. Protocol-level WS pings are answered by the transport
    /// loop, not here.
    pub fn pong_for(&self, msg: &str) -> Option<&'static str> {
        match self {
            Venue::Okx if msg.trim() == "ping" => Some("pong"),
            _ => None,
        }
    }

    /// Pure wire parser: returns None for anything that is not an
    /// orderbook frame (acks, heartbeats, errors, pings).
    pub fn parse(&self, raw: &str) -> Option<ParsedBook> {
        let v: Value = serde_json::from_str(raw).ok()?;
        let parsed = match self {
            Venue::Binance => parse_binance(&v),
            Venue::Coinbase => parse_coinbase(&v),
            Venue::Kraken => parse_kraken(&v),
            Venue::Okx => parse_okx(&v),
        }?;
        if parsed.is_empty() { None } else { Some(parsed) }
    }
}

/// Split a canonical lowercase pair into (base, quote) by known quote
/// suffix. Falls back to a 3-char quote when nothing matches.
fn split_pair(pair: &str) -> (&str, &str) {
    for quote in ["usdt", "usdc", "usd", "btc", "eth", "eur"] {
        if pair.len() > quote.len() && pair.ends_with(quote) {
            return (&pair[..pair.len() - quote.len()], quote);
        }
    }
    let cut = pair.len().saturating_sub(3);
    (&pair[..cut], &pair[cut..])
}

/// Pull (price, qty) pairs out of an array of `["price","qty",...]`
/// entries, tolerating numbers as well as strings. Drops any entry whose
/// price or quantity is missing, non-numeric or non-finite. With
/// `keep_removals` (delta frames), quantity 0 survives as a removal
/// marker; otherwise only positive quantities pass.
fn levels_from(v: &Value, keep_removals: bool) -> Vec<(f64, f64)> {
    let Some(arr) = v.as_array() else { return Vec::new() };
    arr.iter()
        .filter_map(|entry| {
            let e = entry.as_array()?;
            let price = num_at(e, 0)?;
            let qty = num_at(e, 1)?;
            let qty_ok = if keep_removals { qty >= 0.0 } else { qty > 0.0 };
            (price.is_finite() && price > 0.0 && qty.is_finite() && qty_ok)
                .then_some((price, qty))
        })
        .collect()
}

fn num_at(e: &[Value], idx: usize) -> Option<f64> {
    match e.get(idx)? {
        Value::String(s) => s.parse::<f64>().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

// Binance partial depth stream; every frame is a full top-20 snapshot:
// {"lastUpdateId":123,"bids":[["p","q"],...],"asks":[["p","q"],...]}
fn parse_binance(v: &Value) -> Option<ParsedBook> {
    let bids = v.get("bids")?;
    let asks = v.get("asks")?;
    Some(ParsedBook {
        kind: ParseKind::Snapshot,
        bids: levels_from(bids, false),
        asks: levels_from(asks, false),
    })
}

// Coinbase level2: full "snapshot" frames plus "l2update" deltas with
// [side, price, size] change triplets, where size 0 removes the level.
// Everything else (subscriptions, heartbeats, errors) is type-tagged and
// skipped.
fn parse_coinbase(v: &Value) -> Option<ParsedBook> {
    match v.get("type").and_then(Value::as_str)? {
        "snapshot" => Some(ParsedBook {
            kind: ParseKind::Snapshot,
            bids: levels_from(v.get("bids")?, false),
            asks: levels_from(v.get("asks")?, false),
        }),
        "l2update" => {
            let changes = v.get("changes")?.as_array()?;
            let mut book = ParsedBook { kind: ParseKind::Delta, ..ParsedBook::default() };
            for ch in changes {
                let Some(c) = ch.as_array() else { continue };
                let Some(side) = c.first().and_then(Value::as_str) else { continue };
                let (Some(price), Some(qty)) = (num_at(c, 1), num_at(c, 2)) else { continue };
                if !(price.is_finite() && price > 0.0 && qty.is_finite() && qty >= 0.0) {
                    continue;
                }
                match side {
                    "buy" => book.bids.push((price, qty)),
                    "sell" => book.asks.push((price, qty)),
                    _ => {}
                }
            }
            Some(book)
        }
        _ => None,
    }
}

// Kraken book channel frames are arrays:
//   [chanId, {"as":[...], "bs":[...]}, "book-25", "XBT/USDT"]  (snapshot)
//   [chanId, {"a":[...]}, {"b":[...]}, "book-25", pair]        (update)
// where entries are ["price","volume","timestamp"]. Object frames carry
// "event" (heartbeat, systemStatus, subscriptionStatus) and are skipped.
fn parse_kraken(v: &Value) -> Option<ParsedBook> {
    let arr = v.as_array()?;
    let mut book = ParsedBook { kind: ParseKind::Delta, ..ParsedBook::default() };
    for part in arr {
        let Some(obj) = part.as_object() else { continue };
        for (key, side, snapshot) in [
            ("as", true, true),
            ("bs", false, true),
            ("a", true, false),
            ("b", false, false),
        ] {
            if let Some(levels) = obj.get(key) {
                if snapshot {
                    book.kind = ParseKind::Snapshot;
                }
                // update frames keep volume 0 as a removal marker
                let parsed = levels_from(levels, !snapshot);
                if side {
                    book.asks.extend(parsed);
                } else {
                    book.bids.extend(parsed);
                }
            }
        }
    }
    Some(book)
}

// OKX books5: {"arg":{...},"data":[{"bids":[["p","q","liq","cnt"],...],...}]}
// Event frames ({"event":"subscribe"}) have no "data" and are skipped.
fn parse_okx(v: &Value) -> Option<ParsedBook> {
    let data = v.get("data")?.as_array()?;
    let mut book = ParsedBook::default();
    for frame in data {
        if let Some(bids) = frame.get("bids") {
            book.bids.extend(levels_from(bids, false));
        }
        if let Some(asks) = frame.get("asks") {
            book.asks.extend(levels_from(asks, false));
        }
    }
    Some(book)
}
