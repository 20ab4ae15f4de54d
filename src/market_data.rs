//! Live market data: the in-memory quote book, tick → midpoint conversion with its write
//! throttles, and the subscription reconciliation that keeps exactly the needed streams open.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, error};

use crate::broker::{BrokerGateway, TickKind};
use crate::contract::{ContractKey, SecType};
use crate::error::Result;
use crate::message::MessageCode;
use crate::sheet::{columns, Color, SheetGateway};
use crate::store::{PriceRecord, Store};

/// A quote is usable only while both sides are younger than this.
pub const QUOTE_VALIDITY: Duration = Duration::seconds(30);
/// Minimum spacing between midpoint computations per contract.
const RAW_THROTTLE: Duration = Duration::seconds(1);
/// Minimum spacing between store writes per contract.
const WRITE_THROTTLE: Duration = Duration::seconds(10);
/// Price rows are dropped once they age past this.
pub const PRICE_RETENTION: Duration = Duration::minutes(20);
/// A subscription with no ticks for this long flags its trades.
const SILENT_SUBSCRIPTION: Duration = Duration::minutes(30);

/// Round to cents, the precision every sheet price carries.
#[must_use]
#[inline]
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, Default)]
struct Quote {
    bid: Option<(f64, DateTime<Utc>)>,
    ask: Option<(f64, DateTime<Utc>)>,
}

impl Quote {
    /// Both sides, when both are fresh enough to trust.
    fn valid_sides(&self, now: DateTime<Utc>) -> Option<(f64, f64)> {
        let (bid, bid_t) = self.bid?;
        let (ask, ask_t) = self.ask?;
        if now - bid_t < QUOTE_VALIDITY && now - ask_t < QUOTE_VALIDITY {
            Some((bid, ask))
        } else {
            None
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    quotes: HashMap<String, Quote>,
    last_mid: HashMap<String, DateTime<Utc>>,
    last_write: HashMap<String, DateTime<Utc>>,
}

#[derive(Debug, Default)]
/// The shared quote book. Ticks flow in from the broker consumer task; the evaluator and the
/// peg chasers read midpoints out. Persistence into the store happens here too, throttled so
/// the price log stays a log and not a firehose.
pub struct MarketData {
    inner: Mutex<Inner>,
}

impl MarketData {
    #[must_use]
    /// An empty quote book.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one tick. Updates the quote book and, when both sides are fresh and the throttles
    /// allow, records a midpoint into the store's price log.
    pub fn on_tick(
        &self,
        store: &mut Store,
        key: &ContractKey,
        kind: TickKind,
        price: f64,
        now: DateTime<Utc>,
    ) {
        // Negative prices are the broker's "no quote" marker.
        if price < 0.0 {
            return;
        }
        if let Some(sub) = store.subscription_mut(key) {
            sub.last_tick_at = Some(now);
        }

        let sec_type = store
            .contract(key)
            .map(|c| c.contract.sec_type())
            .unwrap_or(SecType::Stock);

        let mut inner = self.inner.lock().expect("quote book lock poisoned");
        let inner = &mut *inner;
        let quote = inner.quotes.entry(key.as_str().to_owned()).or_default();
        match kind {
            TickKind::Bid => quote.bid = Some((price, now)),
            TickKind::Ask => quote.ask = Some((price, now)),
            // Session close prices never feed midpoints.
            TickKind::Close => return,
        }

        let Some((bid, ask)) = quote.valid_sides(now) else {
            return;
        };

        if let Some(last) = inner.last_mid.get(key.as_str()) {
            if now - *last < RAW_THROTTLE {
                return;
            }
        }
        inner.last_mid.insert(key.as_str().to_owned(), now);

        let mid = compute_mid(bid, ask, sec_type);
        let due = inner
            .last_write
            .get(key.as_str())
            .is_none_or(|last| now - *last >= WRITE_THROTTLE);
        if due {
            inner.last_write.insert(key.as_str().to_owned(), now);
            store.record_price(
                key,
                PriceRecord {
                    t: now,
                    bid,
                    ask,
                    mid,
                    mid_t: now,
                },
            );
        }
    }

    #[must_use]
    /// The current midpoint for `key`, straight from the quote book, or `None` when either
    /// side is missing or stale.
    pub fn midpoint(&self, key: &ContractKey, sec_type: SecType, now: DateTime<Utc>) -> Option<f64> {
        let inner = self.inner.lock().expect("quote book lock poisoned");
        let (bid, ask) = inner.quotes.get(key.as_str())?.valid_sides(now)?;
        Some(compute_mid(bid, ask, sec_type))
    }

    #[must_use]
    /// The current validated bid and ask for `key`.
    pub fn bid_ask(&self, key: &ContractKey, now: DateTime<Utc>) -> Option<(f64, f64)> {
        let inner = self.inner.lock().expect("quote book lock poisoned");
        inner.quotes.get(key.as_str())?.valid_sides(now)
    }
}

fn compute_mid(bid: f64, ask: f64, sec_type: SecType) -> f64 {
    let mid = (bid + ask) / 2.0;
    match sec_type {
        // Forex mids keep their pips.
        SecType::Cash => mid,
        SecType::Stock | SecType::SecOption | SecType::Combo => round2(mid),
    }
}

// =================================
// === Subscription Reconciliation ===
// =================================

/// Keys every active trade needs priced: the tradable shape, the underlying, and for combos
/// each leg's own option (leg mids price the spread when the combined stream is quiet).
#[must_use]
pub fn referenced_keys(store: &Store) -> Vec<ContractKey> {
    let mut keys = Vec::new();
    let mut push = |key: &ContractKey| {
        if !keys.contains(key) {
            keys.push(key.clone());
        }
    };
    let uids: Vec<_> = store
        .trades()
        .filter(|t| t.is_active())
        .map(|t| t.uid.clone())
        .collect();
    for uid in uids {
        let Some(trade) = store.trade(&uid) else {
            continue;
        };
        push(&trade.underlying_key);
        push(&trade.contract_key);
        for leg in store.legs_for_trade(&uid) {
            push(&leg.contract_key);
        }
    }
    keys
}

/// Bring the live subscription set in line with the referenced keys: subscribe what is
/// missing, cancel what is no longer needed. The final remaining subscription is never
/// canceled, so the stream of ticks (and the evaluation it drives) cannot go completely
/// silent between sheet edits.
///
/// # Errors
/// Propagates gateway send failures; the next cycle retries.
pub fn sync_subscriptions(
    store: &mut Store,
    gateway: &dyn BrokerGateway,
    now: DateTime<Utc>,
) -> Result<()> {
    let needed = referenced_keys(store);

    for key in &needed {
        let active = store.subscription(key).is_some_and(|s| s.active);
        if active {
            continue;
        }
        let Some(record) = store.contract(key) else {
            continue;
        };
        // Combos wait for every leg id before the broker will accept the stream request.
        if record.contract.sec_type() == SecType::Combo {
            let trades = store.trades_by_contract_key(key);
            let ready = trades.iter().any(|uid| store.legs_resolved(uid));
            if !ready {
                continue;
            }
        }
        let contract = record.contract.clone();
        let req_id = gateway.next_id();
        gateway.req_market_data(req_id, &contract)?;
        store.upsert_subscription(key, req_id, now);
        debug!(%key, req_id, "requested market data");
    }

    let active: Vec<ContractKey> = store
        .subscriptions()
        .filter(|s| s.active)
        .map(|s| s.contract_key.clone())
        .collect();
    let mut active_count = active.len();
    for key in active {
        if needed.contains(&key) {
            continue;
        }
        if active_count <= 1 {
            break;
        }
        if let Some(req_id) = store.subscription(&key).and_then(|s| s.broker_req_id) {
            if let Err(e) = gateway.cancel_market_data(req_id) {
                error!(%key, %e, "failed to cancel market data");
                continue;
            }
        }
        store.deactivate_subscription(&key);
        active_count -= 1;
        debug!(%key, "cancelled market data");
    }
    Ok(())
}

/// Flag trades whose subscription has been silent for half an hour: raise the pricing-failure
/// message and paint the entry-price cell so the data-entry team sees it.
pub fn flag_silent_subscriptions(store: &mut Store, sheet: &dyn SheetGateway, now: DateTime<Utc>) {
    let silent: Vec<ContractKey> = store
        .subscriptions()
        .filter(|s| {
            s.active && s.last_tick_at.is_none() && now - s.date_requested > SILENT_SUBSCRIPTION
        })
        .map(|s| s.contract_key.clone())
        .collect();

    for key in silent {
        for uid in store.trades_by_contract_key(&key) {
            let row = store.trade(&uid).and_then(|t| t.row_idx);
            store.raise_message(
                Some(uid.clone()),
                MessageCode::Pricing,
                &format!("no market data received for {key} after 30 minutes"),
                now,
            );
            if let Some(row) = row {
                if let Err(e) = sheet.highlight_cell(row, columns::ENTRY_PRICE, Color::Red) {
                    error!(%uid, %e, "failed to highlight pricing failure");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::Contract;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 1, 16, 15, 0, 0).unwrap()
    }

    fn seeded_store(key: &ContractKey) -> Store {
        let mut store = Store::new();
        store.register_contract(&Contract::stock("SYM"));
        store.upsert_subscription(key, 1, now());
        store
    }

    #[test]
    fn mid_needs_both_sides_fresh() {
        let md = MarketData::new();
        let key = ContractKey::from("SYM");
        let mut store = seeded_store(&key);

        md.on_tick(&mut store, &key, TickKind::Bid, 150.0, now());
        assert_eq!(md.midpoint(&key, SecType::Stock, now()), None);

        md.on_tick(&mut store, &key, TickKind::Ask, 150.2, now());
        assert_eq!(md.midpoint(&key, SecType::Stock, now()), Some(150.1));

        // Staleness on either side kills the quote.
        let later = now() + Duration::seconds(31);
        assert_eq!(md.midpoint(&key, SecType::Stock, later), None);
    }

    #[test]
    fn negative_prices_are_dropped() {
        let md = MarketData::new();
        let key = ContractKey::from("SYM");
        let mut store = seeded_store(&key);
        md.on_tick(&mut store, &key, TickKind::Bid, -1.0, now());
        md.on_tick(&mut store, &key, TickKind::Ask, 150.2, now());
        assert_eq!(md.midpoint(&key, SecType::Stock, now()), None);
    }

    #[test]
    fn writes_are_throttled() {
        let md = MarketData::new();
        let key = ContractKey::from("SYM");
        let mut store = seeded_store(&key);

        md.on_tick(&mut store, &key, TickKind::Bid, 150.0, now());
        md.on_tick(&mut store, &key, TickKind::Ask, 150.2, now());
        assert!(store.latest_price(&key).is_some());

        // Two seconds later: mid recomputes but the write throttle holds.
        let t2 = now() + Duration::seconds(2);
        md.on_tick(&mut store, &key, TickKind::Bid, 151.0, t2);
        assert_eq!(store.latest_price(&key).unwrap().bid, 150.0);

        // Eleven seconds later the write goes through.
        let t3 = now() + Duration::seconds(11);
        md.on_tick(&mut store, &key, TickKind::Bid, 152.0, t3);
        assert_eq!(store.latest_price(&key).unwrap().bid, 152.0);
    }

    #[test]
    fn tick_marks_subscription() {
        let md = MarketData::new();
        let key = ContractKey::from("SYM");
        let mut store = seeded_store(&key);
        assert!(store.subscription(&key).unwrap().last_tick_at.is_none());
        md.on_tick(&mut store, &key, TickKind::Bid, 150.0, now());
        assert_eq!(store.subscription(&key).unwrap().last_tick_at, Some(now()));
    }
}
