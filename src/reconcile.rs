//! Reconciliation: turning accepted executions into completed orders, trade state, and sheet
//! rows, plus the orphan- and drift-checks that keep the broker's book and the sheet telling
//! the same story.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::message::{MessageCode, Notifier};
use crate::order::{Action, Method, Order, OrderStatus};
use crate::sheet::{columns, format_sheet_datetime, Color, SheetGateway};
use crate::store::Store;
use crate::trade::{Trade, TradeStatus, Uid, STOP_LOSS, TARGET_REACHED};

/// Positions older than this are not trusted for orphan decisions.
const POSITION_FRESHNESS: Duration = Duration::minutes(1);

// ==========================
// === Fill Reconciliation ===
// ==========================

/// Walk every placed order, complete the ones whose accepted executions cover the full
/// quantity, and propagate the fill into trade state and the sheet. The sheet writes are
/// best-effort: a failure leaves the order complete and the next cycle retries the row.
pub fn reconcile_fills(
    store: &mut Store,
    sheet: &dyn SheetGateway,
    notifier: &dyn Notifier,
    cfg: &Config,
    now: DateTime<Utc>,
) {
    for id in store.orders_with_status(OrderStatus::Placed) {
        let Some(order) = store.order(id).cloned() else {
            continue;
        };
        let executed = store.executed_qty(&order);
        if executed < order.qty {
            continue;
        }

        let fill_time = latest_fill_time(store, &order).unwrap_or(now);
        if let Err(e) = store.mark_order_complete(id, fill_time) {
            error!(order = %id, %e, "could not complete order");
            continue;
        }
        info!(order = %id, executed, "order filled");

        match order.trade.clone() {
            None => reconcile_orphan_fill(store, notifier, &order, now),
            Some(uid) => {
                if order.exclude {
                    // Drift-correction orders adjust the broker book only.
                    continue;
                }
                reconcile_trade_fill(store, sheet, notifier, cfg, &uid, &order, fill_time, now);
            }
        }
    }
}

fn latest_fill_time(store: &Store, order: &Order) -> Option<DateTime<Utc>> {
    let request_id = order.request_id?;
    store
        .executions_for_request(request_id)
        .iter()
        .map(|e| e.utc_time)
        .max()
}

/// An orphan flatten filled: tell the operator and drop the position row.
fn reconcile_orphan_fill(store: &mut Store, notifier: &dyn Notifier, order: &Order, now: DateTime<Utc>) {
    let key = &order.contract_key;
    notifier.notify(
        &format!("Orphaned position closed: {key}"),
        &format!(
            "A broker position in {key} had no matching trade and was flattened \
             ({} {} at market).",
            order.action.code(),
            order.qty
        ),
    );
    let accounts: Vec<String> = store
        .positions()
        .filter(|p| &p.contract_key == key)
        .map(|p| p.account.clone())
        .collect();
    for account in accounts {
        store.remove_position(&account, key);
    }
    store.raise_message(
        None,
        MessageCode::SizeMismatch,
        &format!("orphaned broker position in {key} flattened"),
        now,
    );
}

#[allow(clippy::too_many_arguments)]
fn reconcile_trade_fill(
    store: &mut Store,
    sheet: &dyn SheetGateway,
    notifier: &dyn Notifier,
    cfg: &Config,
    uid: &Uid,
    order: &Order,
    fill_time: DateTime<Utc>,
    now: DateTime<Utc>,
) {
    let Some(trade) = store.trade(uid).cloned() else {
        warn!(%uid, "filled order references a missing trade");
        return;
    };
    let price = store
        .avg_fill_price(order)
        .or(order.method.limit_price())
        .unwrap_or(0.0);

    if trade.entry_price.is_none() && order.action == trade.opening_action() {
        register_entry_price(store, sheet, uid, price, fill_time);
        return;
    }

    if order.action != trade.closing_action() {
        // An opening fill on a trade that already has an entry price: position added to an
        // existing trade. The quantities absorb it; nothing to write.
        debug!(%uid, "additional opening fill on an entered trade");
        return;
    }

    let Some(total) = store.total_qty(&trade, cfg.capital_factor) else {
        warn!(%uid, "cannot size a close without a total quantity");
        return;
    };
    let closed_cum = if trade.is_short() {
        store.bought_qty(&trade)
    } else {
        store.sold_qty(&trade)
    };
    let partial = closed_cum < total;
    let notes = close_notes(&trade, price);
    // A partial close records its share of the planned portions (a third of a three-target
    // trade is 33%, whatever rounding did to the contract count); the final close takes
    // whatever percentage is left.
    let portions = if notes == TARGET_REACHED {
        trade.number_of_targets()
    } else {
        trade.number_of_stops()
    }
    .max(1);
    let pct = if partial {
        (100.0 / portions as f64).round() as i64
    } else {
        (100 - trade.pct_sold).max(0)
    };
    let close = SheetClose {
        pct,
        price: signed_sheet_price(&trade, price),
        partial,
        notes,
        when: fill_time,
    };

    if let Err(e) = write_close_to_sheet(store, sheet, uid, &close, now) {
        error!(%uid, %e, "sheet close failed; will retry next cycle");
        notifier.notify(
            &format!("{}: sheet update needed", trade.symbol),
            &format!(
                "A close filled but the sheet write failed.\nUID: {uid}\nPct: {}%\nPrice: {}\nNotes: {}",
                close.pct, close.price, close.notes
            ),
        );
    }

    let Some(t) = store.trade_mut(uid) else {
        return;
    };
    t.exit_price = Some(price.abs());
    if partial {
        t.pct_sold = (t.pct_sold + pct).min(100);
        info!(%uid, pct, notes, "trade partially closed");
    } else {
        t.pct_sold = 100;
        t.date_exited = Some(fill_time);
        t.status = TradeStatus::Closed;
        info!(%uid, notes, "trade fully closed");
    }
}

/// The first fill on a trade sets its entry price, on the sheet and in the store. Shorts are
/// written negative, the way the sheet has always marked them.
fn register_entry_price(
    store: &mut Store,
    sheet: &dyn SheetGateway,
    uid: &Uid,
    price: f64,
    fill_time: DateTime<Utc>,
) {
    let Some(trade) = store.trade(uid).cloned() else {
        return;
    };
    let sheet_price = signed_sheet_price(&trade, price);
    let row = match sheet.find_row_by_uid(uid) {
        Ok(Some(row)) => Some(row),
        Ok(None) => trade.row_idx,
        Err(e) => {
            error!(%uid, %e, "sheet lookup failed while registering entry");
            trade.row_idx
        }
    };
    if let Some(row) = row {
        if let Err(e) = sheet.update_cell(row, columns::ENTRY_PRICE, &sheet_price.to_string()) {
            error!(%uid, %e, "failed to write entry price");
        }
        let _ = sheet.highlight_cell(row, columns::TYPE, Color::White);
        let _ = sheet.highlight_cell(row, columns::ENTRY_PRICE, Color::White);
    }
    if let Some(t) = store.trade_mut(uid) {
        t.entry_price = Some(price.abs());
        if t.date_entered.is_none() {
            t.date_entered = Some(fill_time);
        }
        info!(%uid, price, "entry price registered");
    }
}

/// Whether a close at `price` counts as a win. Longs win above entry, shorts below, and
/// credit combos invert the comparison (the position was sold into, profit is a decay).
fn close_notes(trade: &Trade, price: f64) -> &'static str {
    // Credit combos are judged against the credit collected, not the post-fill mark.
    let entry = if trade.is_credit() {
        trade
            .original_entry_price
            .map(f64::abs)
            .or(trade.entry_price)
    } else {
        trade
            .entry_price
            .or(trade.original_entry_price.map(f64::abs))
    }
    .unwrap_or(0.0);
    let price = price.abs();
    let favorable = if trade.is_credit() || trade.is_short() {
        price < entry
    } else {
        price > entry
    };
    if favorable {
        TARGET_REACHED
    } else {
        STOP_LOSS
    }
}

fn signed_sheet_price(trade: &Trade, price: f64) -> f64 {
    if trade.is_short() && price > 0.0 {
        -price
    } else if trade.is_credit() {
        // Credit combos keep the sign the broker reported.
        price
    } else {
        price.abs()
    }
}

// ========================
// === Sheet Close Path ===
// ========================

#[derive(Debug, Clone, PartialEq)]
/// One close, ready to be written to the sheet.
pub struct SheetClose {
    /// Percent of the position this close represents.
    pub pct: i64,
    /// The (sheet-signed) closing price.
    pub price: f64,
    /// Partial closes copy the row; full closes update it in place.
    pub partial: bool,
    /// "Target reached" or "Stop loss".
    pub notes: &'static str,
    /// When the close happened.
    pub when: DateTime<Utc>,
}

/// Record a close on the sheet: partials insert a formula-preserving copy of the trade's row
/// with the exit cells overridden, full closes update the original row.
///
/// # Errors
/// Returns the sheet error; the caller treats it as transient.
pub fn write_close_to_sheet(
    store: &mut Store,
    sheet: &dyn SheetGateway,
    uid: &Uid,
    close: &SheetClose,
    now: DateTime<Utc>,
) -> crate::error::Result<()> {
    let row = sheet
        .find_row_by_uid(uid)
        .map_err(|e| crate::error::Error::SheetWrite(e.to_string()))?
        .or_else(|| store.trade(uid).and_then(|t| t.row_idx))
        .ok_or_else(|| crate::error::Error::SheetWrite(format!("uid {uid} not on sheet")))?;

    let when = format_sheet_datetime(close.when);
    if close.partial {
        let overrides = [
            (columns::PCT_SOLD, format!("{}%", close.pct)),
            (columns::EXIT_PRICE, format!("${}", close.price)),
            (columns::DATE_EXITED, when),
            (columns::NOTES, close.notes.to_owned()),
            (columns::UID, Uid::at(now).0),
        ];
        sheet
            .insert_row_preserving_formulas(row, &overrides)
            .map_err(|e| crate::error::Error::SheetWrite(e.to_string()))?;
    } else {
        let updates = [
            (columns::PCT_SOLD, format!("{}%", close.pct)),
            (columns::EXIT_PRICE, close.price.to_string()),
            (columns::DATE_EXITED, when),
            (columns::NOTES, close.notes.to_owned()),
        ];
        for (col, value) in updates {
            sheet
                .update_cell(row, col, &value)
                .map_err(|e| crate::error::Error::SheetWrite(e.to_string()))?;
        }
    }
    Ok(())
}

/// Close a trade on the sheet without a broker fill (the cannot-sell path): the position was
/// not ours to sell, but the sheet must still stop advertising it.
pub fn force_sheet_close(
    store: &mut Store,
    sheet: &dyn SheetGateway,
    notifier: &dyn Notifier,
    uid: &Uid,
    price: f64,
    now: DateTime<Utc>,
) {
    let Some(trade) = store.trade(uid).cloned() else {
        return;
    };
    let close = SheetClose {
        pct: (100 - trade.pct_sold).max(0),
        price: signed_sheet_price(&trade, price),
        partial: false,
        notes: close_notes(&trade, price),
        when: now,
    };
    if let Err(e) = write_close_to_sheet(store, sheet, uid, &close, now) {
        error!(%uid, %e, "forced sheet close failed");
    }
    notifier.notify(
        &format!("{}: could not close position at the broker", trade.symbol),
        &format!(
            "The position behind this trade could not be sold (not held at the broker). \
             The sheet row was closed anyway.\nUID: {uid}\nPrice: {price}"
        ),
    );
    if let Some(t) = store.trade_mut(uid) {
        t.date_exited = Some(now);
        t.exit_price = Some(price.abs());
        t.status = TradeStatus::Closed;
    }
}

// ======================
// === Orphan / Drift ===
// ======================

/// Emit a flattening market order (excluded from trade accounting) for every fresh broker
/// position with no matching open trade. The operator hears about it when the flatten fills.
pub fn check_orphans(store: &mut Store, now: DateTime<Utc>) {
    let orphans: Vec<(String, crate::contract::ContractKey, f64)> = store
        .positions()
        .filter(|p| {
            p.quantity != 0.0
                && !p.checked
                && p.valid
                && now - p.observed_at <= POSITION_FRESHNESS
        })
        .filter(|p| {
            store
                .trades_by_contract_key(&p.contract_key)
                .is_empty()
        })
        .map(|p| (p.account.clone(), p.contract_key.clone(), p.quantity))
        .collect();

    for (account, key, quantity) in orphans {
        // Only flatten once per observation.
        if let Some(p) = store.position_mut(&account, &key) {
            p.checked = true;
        }
        let already_flattening = store.orders().any(|o| {
            o.exclude && o.trade.is_none() && o.contract_key == key && o.is_pending()
        });
        if already_flattening {
            continue;
        }
        let action = if quantity > 0.0 {
            Action::Sell
        } else {
            Action::Buy
        };
        warn!(%key, quantity, "orphaned broker position; flattening");
        store.create_order(None, key, action, quantity.abs(), Method::Market, true, now);
    }
}

/// Compare completed order quantities against each trade's total; a trade that bought or sold
/// more than its size gets a corrective excluded order and a size-mismatch message.
pub fn sync_position_drift(store: &mut Store, cfg: &Config, now: DateTime<Utc>) {
    for uid in store.active_trade_uids() {
        let Some(trade) = store.trade(&uid).cloned() else {
            continue;
        };
        if trade.entry_price.is_none() {
            continue;
        }
        let Some(total) = store.total_qty(&trade, cfg.capital_factor) else {
            continue;
        };
        let bought = store.bought_qty(&trade);
        let sold = store.sold_qty(&trade);

        let (action, excess) = if bought > total {
            (Action::Sell, bought - total)
        } else if sold > total {
            (Action::Buy, sold - total)
        } else {
            continue;
        };
        if excess <= 0.0 {
            continue;
        }
        let correcting = store.orders_for_trade(&uid).iter().any(|o| o.exclude && o.is_pending());
        if correcting {
            continue;
        }
        warn!(%uid, excess, "trade quantity drift against broker book");
        store.raise_message(
            Some(uid.clone()),
            MessageCode::SizeMismatch,
            &format!("executed quantity exceeds the trade total by {excess}"),
            now,
        );
        store.create_order(
            Some(uid.clone()),
            trade.contract_key.clone(),
            action,
            excess,
            Method::Market,
            true,
            now,
        );
    }
}
