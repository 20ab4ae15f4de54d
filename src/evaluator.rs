//! The per-cycle decision core: the pre-open gate that turns ingested intents live, and the
//! evaluation pass that decides per trade whether to open, trim, stop, or emergency-close.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info};

use crate::config::Config;
use crate::contract::{ContractKey, SecType};
use crate::market_data::{round2, MarketData};
use crate::message::MessageCode;
use crate::order::{Action, Method};
use crate::sheet::{columns, Color, SheetGateway};
use crate::store::Store;
use crate::trade::{Trade, TradeStatus, Uid};

/// The underlying price driving an evaluation may be at most this old.
const UNDERLYING_FRESHNESS: Duration = Duration::minutes(3);
/// Intents older than this without a fill are dead; nobody wants a five-day-late entry.
const STALE_INTENT: Duration = Duration::days(5);
/// The sheet's entry price must sit within this fraction of the live market to go live.
const ENTRY_PRICE_BAND: f64 = 0.05;
/// A debit combo whose mid decays to this is force-closed before it flips to a credit.
const COMBO_EMERGENCY_MID: f64 = 0.02;

// ======================
// === Pre-open Check ===
// ======================

/// The validation gate for trades still in `PreOpenCheck`: every leg resolved, a usable
/// underlying price, and (when the sheet carried one) an entry price within 5% of the live
/// market. Also applies the size correction, writing a corrected size back to the sheet.
pub fn pre_open_check(
    store: &mut Store,
    md: &MarketData,
    sheet: &dyn SheetGateway,
    cfg: &Config,
    now: DateTime<Utc>,
) {
    for uid in store.active_trade_uids() {
        let Some(trade) = store.trade(&uid) else {
            continue;
        };
        if trade.status != TradeStatus::PreOpenCheck {
            continue;
        }

        if !store.legs_resolved(&uid) {
            continue;
        }

        let underlying_key = trade.underlying_key.clone();
        let contract_key = trade.contract_key.clone();
        let sec_type = trade.sec_type;
        if md
            .midpoint(&underlying_key, SecType::Stock, now)
            .or_else(|| store.fresh_price(&underlying_key, now, UNDERLYING_FRESHNESS).map(|p| p.mid))
            .is_none()
        {
            continue;
        }

        // The band check guards against stale sheet entries racing a moving market. It only
        // applies before the position exists; a trade re-adopted with a live entry price is
        // past validation.
        let not_yet_entered = store.trade(&uid).is_some_and(|t| t.entry_price.is_none());
        let contract_mid = md
            .midpoint(&contract_key, sec_type, now)
            .or_else(|| store.fresh_price(&contract_key, now, UNDERLYING_FRESHNESS).map(|p| p.mid));
        if let (true, Some(original), Some(mid)) = (
            not_yet_entered,
            store.trade(&uid).and_then(|t| t.original_entry_price),
            contract_mid,
        ) {
            let original = original.abs();
            if original > 0.0 && mid > 0.0 && (mid - original).abs() / original > ENTRY_PRICE_BAND {
                let row = store.trade(&uid).and_then(|t| t.row_idx);
                store.demote_trade(
                    &uid,
                    MessageCode::EntryOutOfBand,
                    &format!(
                        "entry price {original} is more than 5% away from the market ({mid})"
                    ),
                    now,
                );
                if let Some(row) = row {
                    let _ = sheet.highlight_cell(row, columns::ENTRY_PRICE, Color::Red);
                }
                continue;
            }
        }

        apply_size_correction(store, sheet, cfg, &uid, now);

        if let Some(t) = store.trade_mut(&uid) {
            t.status = TradeStatus::Open;
            info!(%uid, symbol = %t.symbol, "trade passed pre-open check");
        }
    }
}

/// When the live price implies a portion size below one unit, the trade still trades one unit;
/// the sheet's size column is corrected to match and the operator told.
fn apply_size_correction(
    store: &mut Store,
    sheet: &dyn SheetGateway,
    cfg: &Config,
    uid: &Uid,
    now: DateTime<Utc>,
) {
    let Some(trade) = store.trade(uid) else {
        return;
    };
    let Some(qty) = store.total_qty(trade, cfg.capital_factor) else {
        return;
    };
    if qty >= 1.0 {
        return;
    }

    let entry = trade
        .entry_price
        .or(trade.original_entry_price.map(f64::abs))
        .or_else(|| store.latest_price(&trade.contract_key).map(|p| p.mid));
    let Some(entry) = entry else {
        return;
    };
    let multiplier = f64::from(trade.sec_type.multiplier());
    let corrected = round2(entry.abs() * multiplier / cfg.capital_factor);
    let old = trade.size;
    let row = trade.row_idx;

    if let Some(t) = store.trade_mut(uid) {
        t.size = if t.size < 0.0 { -corrected } else { corrected };
    }
    store.raise_message(
        Some(uid.clone()),
        MessageCode::SizeMismatch,
        &format!("position size corrected from {old} to {corrected} after pricing"),
        now,
    );
    if let Some(row) = row {
        if let Err(e) = sheet.update_cell(row, columns::POSITION_SIZE, &corrected.to_string()) {
            error!(%uid, %e, "failed to write corrected size to sheet");
        }
    }
}

// ==================
// === Evaluation ===
// ==================

#[derive(Debug, Clone, Copy, PartialEq)]
/// What the evaluator decided for one trade. Exposed for tests; the supervisor only cares
/// that orders landed in the store.
pub enum Decision {
    /// Emit the opening order.
    Open {
        /// Order quantity.
        qty: f64,
    },
    /// Close a portion at the indexed target.
    Target {
        /// Which target fired.
        idx: usize,
        /// Order quantity.
        qty: f64,
    },
    /// Close a portion at the indexed stop.
    Stop {
        /// Which stop fired.
        idx: usize,
        /// Order quantity.
        qty: f64,
    },
    /// Force-close a decaying debit combo at market.
    EmergencyClose {
        /// Order quantity (everything left).
        qty: f64,
    },
}

/// Evaluate every open, unlocked trade against fresh underlying prices, creating `Ready`
/// orders for whatever fired. Returns the decisions taken this pass.
pub fn evaluate_trades(
    store: &mut Store,
    md: &MarketData,
    cfg: &Config,
    now: DateTime<Utc>,
) -> Vec<(Uid, Decision)> {
    let mut decisions = Vec::new();

    for uid in store.active_trade_uids() {
        let Some(trade) = store.trade(&uid) else {
            continue;
        };
        if trade.status != TradeStatus::Open {
            continue;
        }
        if store.trade_is_locked(&uid) {
            continue;
        }
        // Cooldown: no new order within a minute of the last request on this trade.
        if trade
            .last_order_at
            .is_some_and(|at| now - at < Duration::seconds(cfg.cooldown_secs))
        {
            continue;
        }

        let Some(underlying) = md
            .midpoint(&trade.underlying_key, SecType::Stock, now)
            .or_else(|| {
                store
                    .fresh_price(&trade.underlying_key, now, UNDERLYING_FRESHNESS)
                    .map(|p| p.mid)
            })
        else {
            continue;
        };

        if let Some(decision) = evaluate_one(store, md, cfg, &uid, underlying, now) {
            apply_decision(store, md, cfg, &uid, &decision, now);
            decisions.push((uid, decision));
        }
    }

    decisions
}

fn evaluate_one(
    store: &mut Store,
    md: &MarketData,
    cfg: &Config,
    uid: &Uid,
    underlying: f64,
    now: DateTime<Utc>,
) -> Option<Decision> {
    let trade = store.trade(uid)?.clone();

    // A trade with no entry price yet wants its opening order, provided the intent is recent.
    if trade.entry_price.is_none() {
        match trade.date_entered {
            Some(entered) if now - entered <= STALE_INTENT => {
                let qty = store.open_size(&trade, cfg.capital_factor)?;
                return Some(Decision::Open { qty });
            }
            _ => {
                debug!(%uid, "ignoring trade with old or missing entry date");
                store.demote_trade(
                    uid,
                    MessageCode::EntryOutOfBand,
                    "intent has an old or missing entry date",
                    now,
                );
                return None;
            }
        }
    }

    // Debit combos that decay to nothing get flattened before they flip into a credit.
    if trade.sec_type == SecType::Combo && trade.original_entry_price.unwrap_or(0.0) > 0.0 {
        if let Some(mid) = combo_mid(store, md, &trade, now) {
            if mid <= COMBO_EMERGENCY_MID {
                let qty = store.left_qty(&trade, cfg.capital_factor)?;
                if qty > 0.0 {
                    return Some(Decision::EmergencyClose { qty });
                }
            }
        }
    }

    let up = trade.profits_up()?;
    let entry_underlying = trade.underlying_entry_price?;
    let emitted = store.closing_orders_emitted(&trade);
    let target = trade.next_target(emitted);
    let stop = trade.next_stop(emitted);

    let target_hit = target.is_some_and(|(_, tp)| {
        if up {
            underlying >= tp && underlying > entry_underlying
        } else {
            underlying <= tp && underlying < entry_underlying
        }
    });
    let stop_hit = stop.is_some_and(|(_, sp)| {
        if up {
            underlying <= sp && underlying < entry_underlying
        } else {
            underlying >= sp && underlying > entry_underlying
        }
    });

    if target_hit {
        let (idx, _) = target.expect("target_hit implies target");
        let qty = store.closing_qty(&trade, idx, trade.number_of_targets(), cfg.capital_factor)?;
        if qty > 0.0 {
            return Some(Decision::Target { idx, qty });
        }
    } else if stop_hit {
        let (idx, _) = stop.expect("stop_hit implies stop");
        let qty = store.closing_qty(&trade, idx, trade.number_of_stops(), cfg.capital_factor)?;
        if qty > 0.0 {
            return Some(Decision::Stop { idx, qty });
        }
    }
    None
}

fn apply_decision(
    store: &mut Store,
    md: &MarketData,
    cfg: &Config,
    uid: &Uid,
    decision: &Decision,
    now: DateTime<Utc>,
) {
    let Some(trade) = store.trade(uid).cloned() else {
        return;
    };
    let (action, qty, forced_market) = match *decision {
        Decision::Open { qty } => (trade.opening_action(), qty, false),
        Decision::Target { qty, .. } | Decision::Stop { qty, .. } => {
            (trade.closing_action(), qty, false)
        }
        Decision::EmergencyClose { qty } => (trade.closing_action(), qty, true),
    };

    let method = if forced_market {
        Method::Market
    } else {
        order_method(store, md, cfg, &trade, action, now)
    };

    info!(
        %uid,
        symbol = %trade.symbol,
        action = action.code(),
        qty,
        ?method,
        "evaluator emitting order"
    );
    store.create_order(
        Some(uid.clone()),
        trade.contract_key.clone(),
        action,
        qty,
        method,
        false,
        now,
    );
}

/// The execution style for an evaluator order under the current configuration: plain market
/// by default; with limit orders on, options and combos take a limit at the side-appropriate
/// quote and stocks peg to the midpoint.
fn order_method(
    store: &Store,
    md: &MarketData,
    cfg: &Config,
    trade: &Trade,
    action: Action,
    now: DateTime<Utc>,
) -> Method {
    if !cfg.use_limit_orders {
        return Method::Market;
    }

    match trade.sec_type {
        SecType::Stock | SecType::Cash => {
            match md.midpoint(&trade.contract_key, trade.sec_type, now) {
                Some(mid) => Method::PegMid {
                    price: mid,
                    offset: cfg.nbbo_offset,
                },
                None => Method::Market,
            }
        }
        SecType::SecOption => match close_quote(md, &trade.contract_key, action, now) {
            Some(price) => Method::Limit {
                price: offset_limit(price, action, cfg.limit_offset_pct),
            },
            None => Method::Market,
        },
        SecType::Combo => match combo_mid(store, md, trade, now) {
            Some(mid) => Method::Limit {
                price: offset_limit(mid, action, cfg.limit_offset_pct),
            },
            None => Method::Market,
        },
    }
}

/// Buys add the offset (more aggressive), sells subtract it (more concessive).
fn offset_limit(price: f64, action: Action, offset_pct: f64) -> f64 {
    let factor = match action {
        Action::Buy => 1.0 + offset_pct,
        Action::Sell => 1.0 - offset_pct,
    };
    round2(price * factor)
}

/// The quote an option order should cross: the bid when selling, the ask when buying.
fn close_quote(
    md: &MarketData,
    key: &ContractKey,
    action: Action,
    now: DateTime<Utc>,
) -> Option<f64> {
    let (bid, ask) = md.bid_ask(key, now)?;
    Some(round2(match action {
        Action::Sell => bid,
        Action::Buy => ask,
    }))
}

/// A combo's mid: the combined stream's midpoint when the broker quotes the spread directly,
/// otherwise the signed sum of its leg mids (bought legs add, sold legs subtract).
pub(crate) fn combo_mid(
    store: &Store,
    md: &MarketData,
    trade: &Trade,
    now: DateTime<Utc>,
) -> Option<f64> {
    if let Some(mid) = md.midpoint(&trade.contract_key, SecType::Combo, now) {
        return Some(mid);
    }
    let legs = store.legs_for_trade(&trade.uid);
    if legs.is_empty() {
        return None;
    }
    let mut total = 0.0;
    for leg in legs {
        let mid = md.midpoint(&leg.contract_key, SecType::SecOption, now)?;
        let signed = match leg.action {
            Action::Buy => mid,
            Action::Sell => -mid,
        } * f64::from(leg.ratio.max(1));
        total += signed;
    }
    Some(round2(total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::TickKind;
    use crate::contract::{Contract, ContractKey};
    use crate::order::OrderStatus;
    use crate::trade::Trade;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 1, 16, 15, 0, 0).unwrap()
    }

    fn cfg() -> Config {
        Config::default()
    }

    fn opt_trade() -> Trade {
        Trade {
            uid: Uid::from("1"),
            symbol: "SYM".to_owned(),
            alert_category: String::new(),
            size: 1.0,
            tactic: "JUN 20 $151C".to_owned(),
            sec_type: SecType::SecOption,
            contract_key: ContractKey::from("SYM-20190620-151.0-C"),
            underlying_key: ContractKey::from("SYM"),
            underlying_entry_price: Some(150.0),
            original_entry_price: None,
            entry_price: Some(1.0),
            exit_price: None,
            target_prices: [Some(152.2), Some(153.5), Some(154.5)],
            stop_prices: [Some(149.98), Some(149.0)],
            date_entered: Some(now()),
            date_exited: None,
            pct_sold: 0,
            status: TradeStatus::Open,
            parent: None,
            row_idx: Some(2),
            last_order_at: None,
            fail_count: 0,
            resolution_attempts: 0,
        }
    }

    fn seed(store: &mut Store, md: &MarketData, underlying_mid: f64) {
        store.register_contract(&Contract::stock("SYM"));
        let key = ContractKey::from("SYM");
        store.upsert_subscription(&key, 1, now());
        md.on_tick(store, &key, TickKind::Bid, underlying_mid - 0.1, now());
        md.on_tick(store, &key, TickKind::Ask, underlying_mid + 0.1, now());
    }

    #[test]
    fn opening_order_for_fresh_intent() {
        let mut store = Store::new();
        let md = MarketData::new();
        let mut t = opt_trade();
        t.entry_price = None;
        t.original_entry_price = Some(1.0);
        store.insert_trade(t).unwrap();
        seed(&mut store, &md, 150.0);

        let decisions = evaluate_trades(&mut store, &md, &cfg(), now());
        assert_eq!(decisions.len(), 1);
        // $1000 at $1.00 x 100 = 10 contracts.
        assert_eq!(decisions[0].1, Decision::Open { qty: 10.0 });
        let orders = store.orders_with_status(OrderStatus::Ready);
        assert_eq!(orders.len(), 1);
        assert_eq!(store.order(orders[0]).unwrap().action, Action::Buy);
    }

    #[test]
    fn stale_intent_is_demoted() {
        let mut store = Store::new();
        let md = MarketData::new();
        let mut t = opt_trade();
        t.entry_price = None;
        t.date_entered = Some(now() - Duration::days(6));
        let uid = t.uid.clone();
        store.insert_trade(t).unwrap();
        seed(&mut store, &md, 150.0);

        let decisions = evaluate_trades(&mut store, &md, &cfg(), now());
        assert!(decisions.is_empty());
        assert_eq!(store.trade(&uid).unwrap().status, TradeStatus::Error);
    }

    #[test]
    fn first_target_fires_a_third() {
        let mut store = Store::new();
        let md = MarketData::new();
        store.insert_trade(opt_trade()).unwrap();
        seed(&mut store, &md, 152.3);

        let decisions = evaluate_trades(&mut store, &md, &cfg(), now());
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].1, Decision::Target { idx: 0, qty: 3.0 });
        let orders = store.orders_with_status(OrderStatus::Ready);
        assert_eq!(store.order(orders[0]).unwrap().action, Action::Sell);
    }

    #[test]
    fn target_requires_profit_over_entry() {
        let mut store = Store::new();
        let md = MarketData::new();
        let mut t = opt_trade();
        // Underlying entry above the first target: crossing the target is not yet profit.
        t.underlying_entry_price = Some(153.0);
        t.target_prices = [Some(152.2), None, None];
        store.insert_trade(t).unwrap();
        seed(&mut store, &md, 152.3);

        assert!(evaluate_trades(&mut store, &md, &cfg(), now()).is_empty());
    }

    #[test]
    fn stop_fires_below_entry() {
        let mut store = Store::new();
        let md = MarketData::new();
        store.insert_trade(opt_trade()).unwrap();
        seed(&mut store, &md, 149.5);

        let decisions = evaluate_trades(&mut store, &md, &cfg(), now());
        assert_eq!(decisions.len(), 1);
        // Two stops configured: the first takes round(10/2) = 5.
        assert_eq!(decisions[0].1, Decision::Stop { idx: 0, qty: 5.0 });
    }

    #[test]
    fn decayed_debit_spread_is_force_closed_at_market() {
        let mut store = Store::new();
        let md = MarketData::new();
        let mut t = opt_trade();
        t.sec_type = SecType::Combo;
        t.contract_key = ContractKey::from("SYM/BAG/BUY/1-SELL/1");
        t.original_entry_price = Some(0.50);
        t.entry_price = Some(0.50);
        store.insert_trade(t.clone()).unwrap();
        seed(&mut store, &md, 150.0);

        // The spread itself quotes at 0.02: one tick from flipping into a credit.
        md.on_tick(&mut store, &t.contract_key, TickKind::Bid, 0.01, now());
        md.on_tick(&mut store, &t.contract_key, TickKind::Ask, 0.03, now());

        let decisions = evaluate_trades(&mut store, &md, &cfg(), now());
        assert_eq!(decisions.len(), 1);
        // Everything left goes: round(1000 / (0.50 * 100)) = 20.
        assert_eq!(decisions[0].1, Decision::EmergencyClose { qty: 20.0 });
        let orders = store.orders_with_status(OrderStatus::Ready);
        let order = store.order(orders[0]).unwrap();
        assert_eq!(order.action, Action::Sell);
        assert!(matches!(order.method, Method::Market));
    }

    #[test]
    fn locked_trades_sit_out() {
        let mut store = Store::new();
        let md = MarketData::new();
        let t = opt_trade();
        store.insert_trade(t.clone()).unwrap();
        store.create_order(
            Some(t.uid.clone()),
            t.contract_key.clone(),
            Action::Sell,
            3.0,
            Method::Market,
            false,
            now(),
        );
        seed(&mut store, &md, 152.3);

        assert!(evaluate_trades(&mut store, &md, &cfg(), now()).is_empty());
    }

    #[test]
    fn cooldown_suppresses_back_to_back_orders() {
        let mut store = Store::new();
        let md = MarketData::new();
        let mut t = opt_trade();
        t.last_order_at = Some(now() - Duration::seconds(30));
        store.insert_trade(t).unwrap();
        seed(&mut store, &md, 152.3);

        assert!(evaluate_trades(&mut store, &md, &cfg(), now()).is_empty());

        // Once the minute passes the same trigger fires.
        let later = now() + Duration::seconds(40);
        let key = ContractKey::from("SYM");
        md.on_tick(&mut store, &key, TickKind::Bid, 152.2, later);
        md.on_tick(&mut store, &key, TickKind::Ask, 152.4, later);
        assert_eq!(evaluate_trades(&mut store, &md, &cfg(), later).len(), 1);
    }

    #[test]
    fn limit_style_pegs_stocks_and_limits_options() {
        let mut store = Store::new();
        let md = MarketData::new();
        let mut config = cfg();
        config.use_limit_orders = true;

        let mut t = opt_trade();
        t.sec_type = SecType::Stock;
        t.contract_key = ContractKey::from("SYM");
        store.insert_trade(t).unwrap();
        seed(&mut store, &md, 152.3);

        let decisions = evaluate_trades(&mut store, &md, &config, now());
        assert_eq!(decisions.len(), 1);
        let orders = store.orders_with_status(OrderStatus::Ready);
        let order = store.order(orders[0]).unwrap();
        assert!(matches!(
            order.method,
            Method::PegMid { offset, .. } if offset == 0.02
        ));
    }
}
