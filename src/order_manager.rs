//! Order placement and supervision: pushing `Ready` orders through the gateway, the
//! cannot-sell guard, timing out stuck orders, and chasing pegged limits along the midpoint.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerGateway, BrokerOrder, ExecutionFilter};
use crate::calendar::{Clock, MarketCalendar};
use crate::config::Config;
use crate::contract::SecType;
use crate::evaluator::combo_mid;
use crate::market_data::MarketData;
use crate::message::{MessageCode, Notifier};
use crate::order::{Action, Method, OrderId, OrderStatus};
use crate::reconcile::force_sheet_close;
use crate::sheet::SheetGateway;
use crate::store::{Store, StoreHandle};
use crate::trade::{Trade, TradeStatus};

/// Consecutive placement failures tolerated before a trade is abandoned.
const MAX_PLACEMENT_FAILURES: u32 = 3;

// =================
// === Placement ===
// =================

/// Send every `Ready` order to the broker. Closing orders are first checked against the
/// broker-side portfolio; a position we cannot actually sell closes on the sheet only, with an
/// operator notification.
#[allow(clippy::too_many_arguments)]
pub fn place_ready_orders(
    store: &mut Store,
    gateway: &dyn BrokerGateway,
    sheet: &dyn SheetGateway,
    notifier: &dyn Notifier,
    md: &MarketData,
    cfg: &Config,
    rth: bool,
    now: DateTime<Utc>,
) {
    let ready = store.orders_with_status(OrderStatus::Ready);
    if ready.is_empty() {
        return;
    }

    for id in ready {
        if let Err(e) = place_one(store, gateway, sheet, notifier, md, cfg, rth, id, now) {
            error!(order = %id, %e, "order placement failed");
        }
    }

    // Nudge the broker for execution reports so the reconciler sees fills promptly.
    if let Err(e) = gateway.req_executions(
        gateway.next_id(),
        &ExecutionFilter {
            account: (!cfg.account_id.is_empty()).then(|| cfg.account_id.clone()),
            since: None,
        },
    ) {
        error!(%e, "post-placement execution request failed");
    }
}

#[allow(clippy::too_many_arguments)]
fn place_one(
    store: &mut Store,
    gateway: &dyn BrokerGateway,
    sheet: &dyn SheetGateway,
    notifier: &dyn Notifier,
    md: &MarketData,
    cfg: &Config,
    rth: bool,
    id: OrderId,
    now: DateTime<Utc>,
) -> crate::error::Result<()> {
    let Some(order) = store.order(id).cloned() else {
        return Ok(());
    };

    let Some(record) = store.contract(&order.contract_key).cloned() else {
        store.advance_order(id, OrderStatus::Error)?;
        return Err(crate::error::Error::Placement(format!(
            "no contract registered for {}",
            order.contract_key
        )));
    };

    // Combo orders need every leg id before the broker will take them; wait for resolution.
    if record.contract.sec_type() == SecType::Combo {
        let resolved = match order.trade.as_ref() {
            Some(uid) => store.legs_resolved(uid),
            None => false,
        };
        if !resolved {
            debug!(order = %id, "combo order waiting on leg resolution");
            return Ok(());
        }
    }

    if let Some(uid) = order.trade.clone() {
        let Some(trade) = store.trade(&uid).cloned() else {
            store.advance_order(id, OrderStatus::Error)?;
            return Ok(());
        };
        if trade.status == TradeStatus::Error || trade.status == TradeStatus::Closed {
            store.advance_order(id, OrderStatus::Error)?;
            return Ok(());
        }

        // The reachability check: can the broker-side book actually cover this close?
        if order.action == trade.closing_action() && !order.exclude {
            match checked_close_qty(store, cfg, &trade, order.qty, order.action) {
                CheckedQty::Full => {}
                CheckedQty::Trimmed(qty) => {
                    warn!(order = %id, from = order.qty, to = qty, "trimming close to held quantity");
                    if let Some(o) = store.order_mut(id) {
                        o.qty = qty;
                    }
                }
                CheckedQty::Unsellable => {
                    store.advance_order(id, OrderStatus::Error)?;
                    let price = md
                        .midpoint(&trade.contract_key, trade.sec_type, now)
                        .or_else(|| combo_mid(store, md, &trade, now))
                        .or(trade.entry_price)
                        .unwrap_or(0.0);
                    force_sheet_close(store, sheet, notifier, &uid, price, now);
                    return Ok(());
                }
            }
        }
    }

    let order = store.order(id).cloned().expect("order still present");
    let request_id = gateway.next_id();
    let outside_rth = cfg.trade_after_hours && !rth;
    let wire = BrokerOrder::from_order(&order, outside_rth);

    // Mark placed before the send, the same ordering the production system settled on: a
    // double placement is worse than a lost send that times out.
    store.mark_order_placed(id, request_id, now)?;
    match gateway.place_order(request_id, &record.contract, &wire) {
        Ok(()) => {
            info!(
                order = %id,
                request_id,
                action = wire.action.code(),
                qty = wire.qty,
                key = %order.contract_key,
                "order placed"
            );
            Ok(())
        }
        Err(e) => {
            store.advance_order(id, OrderStatus::Error)?;
            if let Some(uid) = order.trade {
                bump_fail_count(store, &uid, now);
            }
            Err(e)
        }
    }
}

enum CheckedQty {
    Full,
    Trimmed(f64),
    Unsellable,
}

/// The portfolio check behind every closing sell on a long trade: absent position means
/// unsellable; a smaller position trims the order.
fn checked_close_qty(
    store: &Store,
    cfg: &Config,
    trade: &Trade,
    qty: f64,
    action: Action,
) -> CheckedQty {
    if action != Action::Sell || trade.is_short() {
        return CheckedQty::Full;
    }
    let Some(position) = store.position(&cfg.account_id, &trade.contract_key) else {
        return CheckedQty::Unsellable;
    };
    let held = position.quantity;
    if held <= 0.0 {
        return CheckedQty::Unsellable;
    }
    if held >= qty {
        CheckedQty::Full
    } else {
        CheckedQty::Trimmed(held)
    }
}

fn bump_fail_count(store: &mut Store, uid: &crate::trade::Uid, now: DateTime<Utc>) {
    let exhausted = {
        let Some(t) = store.trade_mut(uid) else {
            return;
        };
        t.fail_count += 1;
        t.fail_count > MAX_PLACEMENT_FAILURES
    };
    if exhausted {
        store.demote_trade(
            uid,
            MessageCode::PegTimeout,
            "repeated order placement failures",
            now,
        );
    }
}

// ================
// === Timeouts ===
// ================

/// Fail placed orders that have sat unfilled past the window during market hours, raising the
/// failure-to-execute message on their trades.
pub fn timeout_pending_orders(
    store: &mut Store,
    gateway: &dyn BrokerGateway,
    cfg: &Config,
    rth: bool,
    now: DateTime<Utc>,
) {
    if !rth {
        return;
    }
    let window = Duration::seconds(cfg.pending_order_timeout_secs);
    for id in store.orders_with_status(OrderStatus::Placed) {
        let Some(order) = store.order(id).cloned() else {
            continue;
        };
        let placed_at = order.date_placed.unwrap_or(order.date_added);
        if now - placed_at <= window {
            continue;
        }
        warn!(order = %id, "placed order timed out");
        if let Some(request_id) = order.request_id {
            if let Err(e) = gateway.cancel_order(request_id) {
                error!(order = %id, %e, "cancel of timed-out order failed");
            }
        }
        if store.advance_order(id, OrderStatus::Error).is_ok() {
            store.raise_message(
                order.trade.clone(),
                MessageCode::PegTimeout,
                &format!(
                    "order {} ({} {}) failed to execute within {} minutes",
                    id,
                    order.action.code(),
                    order.qty,
                    window.num_minutes()
                ),
                now,
            );
        }
    }
}

// =====================
// === The Peg Chase ===
// =====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What one chase step decided.
pub enum PegOutcome {
    /// The order is filled (or no longer pending); the chaser exits.
    Filled,
    /// The mid moved beyond the offset; the order was re-priced.
    Repriced,
    /// Nothing to do this step.
    Working,
    /// The chase hit its hard timeout; the order was canceled and failed.
    TimedOut,
    /// The market closed under the order; the order was canceled and failed.
    MarketClosed,
}

/// One step of the peg-to-mid chase: exit on fill, cancel on timeout or market close, and
/// cancel-replace toward the midpoint when it has drifted beyond the NBBO offset.
pub fn peg_step(
    store: &mut Store,
    md: &MarketData,
    gateway: &dyn BrokerGateway,
    cfg: &Config,
    id: OrderId,
    rth: bool,
    now: DateTime<Utc>,
) -> PegOutcome {
    let Some(order) = store.order(id).cloned() else {
        return PegOutcome::Filled;
    };
    if order.status != OrderStatus::Placed {
        return PegOutcome::Filled;
    }
    let Method::PegMid { price, offset } = order.method else {
        return PegOutcome::Filled;
    };
    let Some(request_id) = order.request_id else {
        return PegOutcome::Filled;
    };

    if store.executed_qty(&order) >= order.qty {
        return PegOutcome::Filled;
    }

    let placed_at = order.date_placed.unwrap_or(order.date_added);
    if now - placed_at >= Duration::seconds(cfg.peg_timeout_secs) {
        if let Err(e) = gateway.cancel_order(request_id) {
            error!(order = %id, %e, "cancel on peg timeout failed");
        }
        let _ = store.advance_order(id, OrderStatus::Error);
        store.raise_message(
            order.trade.clone(),
            MessageCode::PegTimeout,
            &format!(
                "peg-to-mid order {id} timed out after {}s without a fill",
                cfg.peg_timeout_secs
            ),
            now,
        );
        return PegOutcome::TimedOut;
    }

    if !rth && !cfg.trade_after_hours {
        if let Err(e) = gateway.cancel_order(request_id) {
            error!(order = %id, %e, "cancel on market close failed");
        }
        let _ = store.advance_order(id, OrderStatus::Error);
        store.raise_message(
            order.trade.clone(),
            MessageCode::PegTimeout,
            &format!("peg-to-mid order {id} canceled at the close"),
            now,
        );
        return PegOutcome::MarketClosed;
    }

    let sec_type = store
        .contract(&order.contract_key)
        .map(|c| c.contract.sec_type())
        .unwrap_or(SecType::Stock);
    let Some(mid) = md.midpoint(&order.contract_key, sec_type, now) else {
        return PegOutcome::Working;
    };
    if (mid - price).abs() <= offset {
        return PegOutcome::Working;
    }

    // Cancel-replace: same request id, new limit. The broker treats a re-send of a working
    // order id as a modification.
    if let Some(o) = store.order_mut(id) {
        o.reprice(mid);
    }
    let order = store.order(id).cloned().expect("order still present");
    let record = store.contract(&order.contract_key).cloned();
    let Some(record) = record else {
        return PegOutcome::Working;
    };
    let wire = BrokerOrder::from_order(&order, !rth && cfg.trade_after_hours);
    match gateway.place_order(request_id, &record.contract, &wire) {
        Ok(()) => {
            debug!(order = %id, mid, "peg order chased to new mid");
            PegOutcome::Repriced
        }
        Err(e) => {
            error!(order = %id, %e, "peg cancel-replace failed");
            PegOutcome::Working
        }
    }
}

/// The long-running side of the chase: one task per live pegged order, stepping every few
/// seconds until the step function says stop or the supervisor shuts the engine down.
#[allow(clippy::too_many_arguments)]
pub async fn run_peg_chaser(
    store: StoreHandle,
    md: Arc<MarketData>,
    gateway: Arc<dyn BrokerGateway>,
    clock: Arc<dyn Clock>,
    calendar: Arc<dyn MarketCalendar>,
    cfg: Config,
    id: OrderId,
    shutdown: CancellationToken,
) {
    let step = std::time::Duration::from_secs(cfg.peg_step_secs.max(1));
    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            () = tokio::time::sleep(step) => {}
        }
        let now = clock.now();
        let rth = calendar.is_rth(now);
        let outcome = store.transact(|s| peg_step(s, &md, gateway.as_ref(), &cfg, id, rth, now));
        match outcome {
            PegOutcome::Working | PegOutcome::Repriced => {}
            PegOutcome::Filled | PegOutcome::TimedOut | PegOutcome::MarketClosed => return,
        }
    }
}
