//! The durable model of trades, contracts, orders, executions, positions, prices,
//! subscriptions, and operator messages.
//!
//! The store is an arena keyed by stable ids: trades by [`Uid`], orders by [`OrderId`],
//! executions by their `exec_id`, contracts by [`ContractKey`]. Cross-references are looked up
//! at use sites; nothing owns a back-pointer. There is a single writer (the supervisor and the
//! callback consumer, serialized through [`StoreHandle::transact`]), and durability is a JSON
//! snapshot written at the end of each cycle.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::contract::{BrokerContractId, Combo, Contract, ContractKey, SecType};
use crate::error::{Error, Result};
use crate::execution::{valid_executions, Execution};
use crate::message::{MessageCode, MessageId, MessageStatus, TradeMessage};
use crate::order::{Action, Method, Order, OrderId, OrderStatus};
use crate::trade::{Trade, TradeStatus, Uid};

// ======================
// === Table Records ===
// ======================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// One registered contract shape. All trades sharing the shape share this record.
pub struct ContractRecord {
    /// The canonical key.
    pub key: ContractKey,
    /// The full typed shape.
    pub contract: Contract,
    /// The broker's id, once resolved.
    pub broker_contract_id: Option<BrokerContractId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// One leg of a combo trade, tracked separately so leg ids can be resolved (and retried)
/// independently of the trade.
pub struct TradeLeg {
    /// The owning trade.
    pub trade: Uid,
    /// Position within the combo, starting at 1.
    pub sequence: u32,
    /// Buy or sell when the combo is bought.
    pub action: Action,
    /// Smallest-terms quantity ratio.
    pub ratio: u32,
    /// The leg's own option contract key.
    pub contract_key: ContractKey,
    /// The broker's id for the leg contract, once resolved.
    pub broker_contract_id: Option<BrokerContractId>,
    /// When the last resolution request went out.
    pub date_requested: Option<DateTime<Utc>>,
    /// Resolution requests issued so far.
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
/// A mid-price observation. Kept as a short-horizon append-only log per contract.
pub struct PriceRecord {
    /// When the bid was observed.
    pub t: DateTime<Utc>,
    /// Best bid.
    pub bid: f64,
    /// Best ask.
    pub ask: f64,
    /// The rounded midpoint.
    pub mid: f64,
    /// When the midpoint was computed.
    pub mid_t: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A broker-side position, as last reported by the portfolio stream.
pub struct PositionRecord {
    /// The shape held.
    pub contract_key: ContractKey,
    /// The holding account.
    pub account: String,
    /// Signed quantity.
    pub quantity: f64,
    /// The broker's mark.
    pub market_price: f64,
    /// Cleared when the row has not been re-reported recently.
    pub valid: bool,
    /// Set once the orphan check has handled the row.
    pub checked: bool,
    /// Last report time.
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A market-data subscription: `inactive → requested → active`, back to inactive on cancel or
/// staleness.
pub struct Subscription {
    /// The subscribed shape.
    pub contract_key: ContractKey,
    /// The broker request id carrying the stream.
    pub broker_req_id: Option<i64>,
    /// When the subscription was requested.
    pub date_requested: DateTime<Utc>,
    /// Whether the stream is (believed) live.
    pub active: bool,
    /// When the last tick arrived.
    pub last_tick_at: Option<DateTime<Utc>>,
}

// =================
// === The Store ===
// =================

#[derive(Debug, Default, Serialize, Deserialize)]
/// All engine state. See the module docs for the ownership model.
pub struct Store {
    trades: BTreeMap<Uid, Trade>,
    legs: Vec<TradeLeg>,
    contracts: BTreeMap<ContractKey, ContractRecord>,
    prices: BTreeMap<ContractKey, Vec<PriceRecord>>,
    orders: BTreeMap<OrderId, Order>,
    executions: BTreeMap<String, Execution>,
    positions: Vec<PositionRecord>,
    subscriptions: BTreeMap<ContractKey, Subscription>,
    messages: BTreeMap<MessageId, TradeMessage>,
    next_order_id: i64,
    next_message_id: i64,
}

impl Store {
    #[must_use]
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    // ==============
    // === Trades ===
    // ==============

    /// Insert a new trade. Overwrites nothing: a uid collision is a bookkeeping fault.
    pub fn insert_trade(&mut self, trade: Trade) -> Result<()> {
        let uid = trade.uid.clone();
        if self.trades.insert(uid.clone(), trade).is_some() {
            return Err(Error::Bookkeeping(format!("duplicate trade uid {uid}")));
        }
        Ok(())
    }

    #[must_use]
    /// Look up a trade.
    pub fn trade(&self, uid: &Uid) -> Option<&Trade> {
        self.trades.get(uid)
    }

    #[must_use]
    /// Mutable access to a trade.
    pub fn trade_mut(&mut self, uid: &Uid) -> Option<&mut Trade> {
        self.trades.get_mut(uid)
    }

    /// Iterate all trades.
    pub fn trades(&self) -> impl Iterator<Item = &Trade> {
        self.trades.values()
    }

    #[must_use]
    /// Uids of trades still participating in the lifecycle (pre-open or open), in uid order.
    pub fn active_trade_uids(&self) -> Vec<Uid> {
        self.trades
            .values()
            .filter(|t| t.is_active())
            .map(|t| t.uid.clone())
            .collect()
    }

    #[must_use]
    /// Open trades whose tradable or underlying key matches `key`.
    pub fn trades_by_contract_key(&self, key: &ContractKey) -> Vec<Uid> {
        self.trades
            .values()
            .filter(|t| t.is_active() && (&t.contract_key == key || &t.underlying_key == key))
            .map(|t| t.uid.clone())
            .collect()
    }

    /// Demote a trade to the error state and record why.
    pub fn demote_trade(&mut self, uid: &Uid, code: MessageCode, text: &str, now: DateTime<Utc>) {
        if let Some(t) = self.trades.get_mut(uid) {
            t.status = TradeStatus::Error;
        }
        self.raise_message(Some(uid.clone()), code, text, now);
    }

    // =================
    // === Contracts ===
    // =================

    /// Upsert a contract shape (and, for combos, each leg's option shape). Returns the key.
    pub fn register_contract(&mut self, contract: &Contract) -> ContractKey {
        if let Contract::Combo(combo) = contract {
            for leg in &combo.legs {
                let opt = Contract::SecOption(leg.option.clone());
                self.register_contract(&opt);
            }
        }
        let key = contract.key();
        self.contracts
            .entry(key.clone())
            .or_insert_with(|| ContractRecord {
                key: key.clone(),
                contract: contract.clone(),
                broker_contract_id: None,
            });
        key
    }

    #[must_use]
    /// Look up a contract record.
    pub fn contract(&self, key: &ContractKey) -> Option<&ContractRecord> {
        self.contracts.get(key)
    }

    /// Back-fill a broker contract id onto the contract record and every leg that references
    /// the shape.
    pub fn set_broker_contract_id(&mut self, key: &ContractKey, id: BrokerContractId) {
        if let Some(rec) = self.contracts.get_mut(key) {
            rec.broker_contract_id = Some(id);
        }
        for leg in self.legs.iter_mut().filter(|l| &l.contract_key == key) {
            leg.broker_contract_id = Some(id);
        }
    }

    // ============
    // === Legs ===
    // ============

    /// Register the legs of a combo trade, once.
    pub fn register_trade_legs(&mut self, uid: &Uid, combo: &Combo) {
        for leg in &combo.legs {
            let key = leg.option_key();
            let exists = self
                .legs
                .iter()
                .any(|l| &l.trade == uid && l.sequence == leg.sequence);
            if exists {
                continue;
            }
            // Inherit an already-resolved id when another trade shares the leg shape.
            let known_id = self
                .contracts
                .get(&key)
                .and_then(|c| c.broker_contract_id);
            self.legs.push(TradeLeg {
                trade: uid.clone(),
                sequence: leg.sequence,
                action: leg.action,
                ratio: leg.ratio,
                contract_key: key,
                broker_contract_id: known_id,
                date_requested: None,
                attempts: 0,
            });
        }
    }

    #[must_use]
    /// The legs of a trade, in sequence order.
    pub fn legs_for_trade(&self, uid: &Uid) -> Vec<&TradeLeg> {
        let mut legs: Vec<&TradeLeg> = self.legs.iter().filter(|l| &l.trade == uid).collect();
        legs.sort_by_key(|l| l.sequence);
        legs
    }

    #[must_use]
    /// Whether every leg of the trade carries a broker id. Vacuously true for non-combos.
    pub fn legs_resolved(&self, uid: &Uid) -> bool {
        self.legs
            .iter()
            .filter(|l| &l.trade == uid)
            .all(|l| l.broker_contract_id.is_some())
    }

    #[must_use]
    /// Legs still lacking a broker id with retry budget remaining, deduplicated by contract
    /// key. Legs past the budget are reported separately by [`Store::exhausted_legs`].
    pub fn unresolved_leg_keys(&self, max_attempts: u32) -> Vec<ContractKey> {
        let mut keys = Vec::new();
        for leg in self
            .legs
            .iter()
            .filter(|l| l.broker_contract_id.is_none() && l.attempts < max_attempts)
        {
            if self
                .trades
                .get(&leg.trade)
                .is_some_and(|t| t.is_active())
                && !keys.contains(&leg.contract_key)
            {
                keys.push(leg.contract_key.clone());
            }
        }
        keys
    }

    #[must_use]
    /// Trades with a leg that has exhausted its resolution attempts.
    pub fn exhausted_legs(&self, max_attempts: u32) -> Vec<(Uid, ContractKey, u32)> {
        self.legs
            .iter()
            .filter(|l| l.broker_contract_id.is_none() && l.attempts >= max_attempts)
            .filter(|l| self.trades.get(&l.trade).is_some_and(|t| t.is_active()))
            .map(|l| (l.trade.clone(), l.contract_key.clone(), l.attempts))
            .collect()
    }

    /// Count a resolution request against every unresolved leg sharing `key`.
    pub fn note_leg_requested(&mut self, key: &ContractKey, now: DateTime<Utc>) {
        for leg in self
            .legs
            .iter_mut()
            .filter(|l| &l.contract_key == key && l.broker_contract_id.is_none())
        {
            leg.date_requested = Some(now);
            leg.attempts += 1;
        }
    }

    // ==============
    // === Prices ===
    // ==============

    /// Append a price observation for `key`.
    pub fn record_price(&mut self, key: &ContractKey, record: PriceRecord) {
        self.prices.entry(key.clone()).or_default().push(record);
    }

    #[must_use]
    /// The newest price for `key`, if any.
    pub fn latest_price(&self, key: &ContractKey) -> Option<&PriceRecord> {
        self.prices.get(key).and_then(|v| v.last())
    }

    #[must_use]
    /// The newest price for `key` whose midpoint is at most `max_age` old.
    pub fn fresh_price(
        &self,
        key: &ContractKey,
        now: DateTime<Utc>,
        max_age: Duration,
    ) -> Option<&PriceRecord> {
        self.latest_price(key)
            .filter(|p| now - p.mid_t <= max_age)
    }

    /// Drop price rows older than `horizon` (the 20-minute retention window).
    pub fn expire_prices(&mut self, now: DateTime<Utc>, horizon: Duration) {
        for log in self.prices.values_mut() {
            log.retain(|p| now - p.t <= horizon);
        }
        self.prices.retain(|_, log| !log.is_empty());
    }

    // ==============
    // === Orders ===
    // ==============

    /// Create a `Ready` order and return its id.
    pub fn create_order(
        &mut self,
        trade: Option<Uid>,
        contract_key: ContractKey,
        action: Action,
        qty: f64,
        method: Method,
        exclude: bool,
        now: DateTime<Utc>,
    ) -> OrderId {
        self.next_order_id += 1;
        let id = OrderId(self.next_order_id);
        let mut order = Order::new(id, trade.clone(), contract_key, action, qty, method, now);
        order.exclude = exclude;
        self.orders.insert(id, order);
        if let Some(uid) = trade {
            if let Some(t) = self.trades.get_mut(&uid) {
                t.last_order_at = Some(now);
            }
        }
        id
    }

    #[must_use]
    /// Look up an order.
    pub fn order(&self, id: OrderId) -> Option<&Order> {
        self.orders.get(&id)
    }

    #[must_use]
    /// Mutable access to an order.
    pub fn order_mut(&mut self, id: OrderId) -> Option<&mut Order> {
        self.orders.get_mut(&id)
    }

    /// Iterate all orders.
    pub fn orders(&self) -> impl Iterator<Item = &Order> {
        self.orders.values()
    }

    #[must_use]
    /// The order carrying a broker request id.
    pub fn order_by_request_id(&self, request_id: i64) -> Option<&Order> {
        self.orders
            .values()
            .find(|o| o.request_id == Some(request_id))
    }

    #[must_use]
    /// Ids of orders in a given status, in creation order.
    pub fn orders_with_status(&self, status: OrderStatus) -> Vec<OrderId> {
        self.orders
            .values()
            .filter(|o| o.status == status)
            .map(|o| o.id)
            .collect()
    }

    /// Advance an order's status, enforcing `ready → placed → {complete | error}`.
    pub fn advance_order(&mut self, id: OrderId, next: OrderStatus) -> Result<()> {
        let order = self
            .orders
            .get_mut(&id)
            .ok_or_else(|| Error::Bookkeeping(format!("no such order {id}")))?;
        if !order.status.can_advance_to(next) {
            return Err(Error::Bookkeeping(format!(
                "order {id} cannot move {:?} -> {next:?}",
                order.status
            )));
        }
        order.status = next;
        Ok(())
    }

    /// Mark an order placed under `request_id`.
    pub fn mark_order_placed(
        &mut self,
        id: OrderId,
        request_id: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.advance_order(id, OrderStatus::Placed)?;
        let order = self.orders.get_mut(&id).expect("checked above");
        order.request_id = Some(request_id);
        order.date_placed = Some(now);
        Ok(())
    }

    /// Mark an order complete.
    pub fn mark_order_complete(&mut self, id: OrderId, now: DateTime<Utc>) -> Result<()> {
        self.advance_order(id, OrderStatus::Complete)?;
        let order = self.orders.get_mut(&id).expect("checked above");
        order.date_filled = Some(now);
        Ok(())
    }

    #[must_use]
    /// The orders belonging to a trade, in creation order.
    pub fn orders_for_trade(&self, uid: &Uid) -> Vec<&Order> {
        self.orders
            .values()
            .filter(|o| o.trade.as_ref() == Some(uid))
            .collect()
    }

    #[must_use]
    /// A trade is locked while any of its orders is in flight; locked trades are not evaluated.
    pub fn trade_is_locked(&self, uid: &Uid) -> bool {
        self.orders
            .values()
            .any(|o| o.trade.as_ref() == Some(uid) && o.is_pending())
    }

    #[must_use]
    /// Whether the trade has a (non-excluded, non-error) order on its opening side.
    pub fn has_opening_order(&self, trade: &Trade) -> bool {
        let action = trade.opening_action();
        self.orders_for_trade(&trade.uid)
            .iter()
            .any(|o| o.action == action && !o.exclude && o.status != OrderStatus::Error)
    }

    #[must_use]
    /// Count of closing-side orders already emitted (any status but error, excluded orders
    /// aside). Indexes the next target/stop.
    pub fn closing_orders_emitted(&self, trade: &Trade) -> usize {
        let action = trade.closing_action();
        self.orders_for_trade(&trade.uid)
            .iter()
            .filter(|o| o.action == action && !o.exclude && o.status != OrderStatus::Error)
            .count()
    }

    #[must_use]
    /// Completed bought quantity for the trade (excluded orders never count).
    pub fn bought_qty(&self, trade: &Trade) -> f64 {
        self.completed_qty(trade, Action::Buy)
    }

    #[must_use]
    /// Completed sold quantity for the trade.
    pub fn sold_qty(&self, trade: &Trade) -> f64 {
        self.completed_qty(trade, Action::Sell)
    }

    fn completed_qty(&self, trade: &Trade, action: Action) -> f64 {
        self.orders_for_trade(&trade.uid)
            .iter()
            .filter(|o| o.action == action && !o.exclude && o.status == OrderStatus::Complete)
            .map(|o| o.qty.abs())
            .sum()
    }

    // ==========================
    // === Derived Quantities ===
    // ==========================

    #[must_use]
    /// The trade's total quantity: the qty sum of its opening orders when any exist, otherwise
    /// `round(|size| * capital_factor / (entry * multiplier))`. The entry price falls back from
    /// the live fill to the sheet's original entry to the current mid.
    pub fn total_qty(&self, trade: &Trade, capital_factor: f64) -> Option<f64> {
        let opening: f64 = {
            let action = trade.opening_action();
            self.orders_for_trade(&trade.uid)
                .iter()
                .filter(|o| o.action == action && !o.exclude && o.status != OrderStatus::Error)
                .map(|o| o.qty.abs())
                .sum()
        };
        if opening > 0.0 {
            return Some(opening);
        }

        let entry = trade
            .entry_price
            .or(trade.original_entry_price.map(f64::abs))
            .or_else(|| self.latest_price(&trade.contract_key).map(|p| p.mid))?;
        if entry == 0.0 || trade.size == 0.0 {
            return None;
        }
        let multiplier = f64::from(trade.sec_type.multiplier());
        Some((trade.size.abs() * capital_factor / (entry.abs() * multiplier)).round())
    }

    #[must_use]
    /// Quantity still open: total minus the executed closing side.
    pub fn left_qty(&self, trade: &Trade, capital_factor: f64) -> Option<f64> {
        let total = self.total_qty(trade, capital_factor)?;
        let closed = if trade.is_short() {
            self.bought_qty(trade)
        } else {
            self.sold_qty(trade)
        };
        Some((total - closed).max(0.0))
    }

    #[must_use]
    /// The quantity for the closing order at `idx`: the remainder when it is the final
    /// expected order of its kind, otherwise an even portion of the total.
    pub fn closing_qty(
        &self,
        trade: &Trade,
        idx: usize,
        of: usize,
        capital_factor: f64,
    ) -> Option<f64> {
        let total = self.total_qty(trade, capital_factor)?;
        let left = self.left_qty(trade, capital_factor)?;
        let portions = of.max(1);
        let qty = if idx + 1 >= portions {
            left
        } else {
            (total / portions as f64).round()
        };
        Some(qty.min(left))
    }

    #[must_use]
    /// The opening order size implied by capital allocation at the live price; never below one
    /// unit once a price exists.
    pub fn open_size(&self, trade: &Trade, capital_factor: f64) -> Option<f64> {
        self.total_qty(trade, capital_factor).map(|q| q.max(1.0))
    }

    // ==================
    // === Executions ===
    // ==================

    /// Store an execution. Duplicate deliveries are idempotent: an already-present `exec_id`
    /// is left untouched and reported as `false`.
    pub fn insert_execution(&mut self, exec: Execution) -> bool {
        match self.executions.entry(exec.exec_id.clone()) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(v) => {
                v.insert(exec);
                true
            }
        }
    }

    #[must_use]
    /// Count of stored execution rows.
    pub fn execution_count(&self) -> usize {
        self.executions.len()
    }

    #[must_use]
    /// All executions belonging to an order's broker request id.
    pub fn executions_for_request(&self, request_id: i64) -> Vec<&Execution> {
        self.executions
            .values()
            .filter(|e| e.order_request_id == request_id)
            .collect()
    }

    #[must_use]
    /// The executed quantity of an order, after correction superseding. For combos the
    /// quantity is the minimum across legs of `executed_shares / ratio`; combos complete only
    /// when every leg covers the order.
    pub fn executed_qty(&self, order: &Order) -> f64 {
        let Some(request_id) = order.request_id else {
            return 0.0;
        };
        let execs = self.executions_for_request(request_id);
        let valid = valid_executions(execs.iter().copied());
        if valid.is_empty() {
            return 0.0;
        }

        let is_combo = self
            .contracts
            .get(&order.contract_key)
            .map(|c| c.contract.sec_type() == SecType::Combo)
            .unwrap_or(false);

        if !is_combo {
            return valid.iter().map(|e| e.cum_qty).fold(0.0, f64::max);
        }

        let legs = match order.trade.as_ref() {
            Some(uid) => self.legs_for_trade(uid),
            None => Vec::new(),
        };
        if legs.is_empty() {
            // A combo with no leg rows can only be sized by the worst-reported leg.
            return valid.iter().map(|e| e.cum_qty).fold(f64::INFINITY, f64::min);
        }
        legs.iter()
            .map(|leg| {
                let leg_qty = valid
                    .iter()
                    .filter(|e| e.contract_key == leg.contract_key)
                    .map(|e| e.cum_qty)
                    .fold(0.0, f64::max);
                leg_qty / f64::from(leg.ratio.max(1))
            })
            .fold(f64::INFINITY, f64::min)
    }

    #[must_use]
    /// The average fill price for an order. Single contracts take the average price of the
    /// deepest (max cum-qty) valid execution. Combos take the signed, ratio-weighted sum of
    /// the per-leg averages: bought legs add, sold legs subtract, which is the value of one
    /// unit of the spread regardless of which way the order traded it.
    pub fn avg_fill_price(&self, order: &Order) -> Option<f64> {
        let request_id = order.request_id?;
        let execs = self.executions_for_request(request_id);
        let valid = valid_executions(execs.iter().copied());
        if valid.is_empty() {
            return None;
        }

        let legs = match order.trade.as_ref() {
            Some(uid) => self.legs_for_trade(uid),
            None => Vec::new(),
        };
        let is_combo = self
            .contracts
            .get(&order.contract_key)
            .map(|c| c.contract.sec_type() == SecType::Combo)
            .unwrap_or(false);

        if !is_combo || legs.is_empty() {
            return valid
                .iter()
                .max_by(|a, b| a.cum_qty.total_cmp(&b.cum_qty))
                .map(|e| e.avg_price);
        }

        let mut total = 0.0;
        for leg in legs {
            let avg = valid
                .iter()
                .filter(|e| e.contract_key == leg.contract_key)
                .max_by(|a, b| a.cum_qty.total_cmp(&b.cum_qty))
                .map(|e| e.avg_price)?;
            let signed = match leg.action {
                Action::Buy => avg,
                Action::Sell => -avg,
            } * f64::from(leg.ratio.max(1));
            total += signed;
        }
        Some(crate::market_data::round2(total))
    }

    // =================
    // === Positions ===
    // =================

    /// Upsert a broker-reported position row.
    pub fn upsert_position(
        &mut self,
        account: &str,
        key: &ContractKey,
        quantity: f64,
        market_price: f64,
        now: DateTime<Utc>,
    ) {
        if let Some(p) = self.position_mut(account, key) {
            p.quantity = quantity;
            p.market_price = market_price;
            p.valid = true;
            p.observed_at = now;
            return;
        }
        self.positions.push(PositionRecord {
            contract_key: key.clone(),
            account: account.to_owned(),
            quantity,
            market_price,
            valid: true,
            checked: false,
            observed_at: now,
        });
    }

    #[must_use]
    /// Look up a position row.
    pub fn position(&self, account: &str, key: &ContractKey) -> Option<&PositionRecord> {
        self.positions
            .iter()
            .find(|p| p.account == account && &p.contract_key == key)
    }

    /// Mutable access to a position row.
    pub fn position_mut(&mut self, account: &str, key: &ContractKey) -> Option<&mut PositionRecord> {
        self.positions
            .iter_mut()
            .find(|p| p.account == account && &p.contract_key == key)
    }

    /// Iterate all position rows.
    pub fn positions(&self) -> impl Iterator<Item = &PositionRecord> {
        self.positions.iter()
    }

    /// Remove a position row (after an orphan flatten completes, or on zero-qty cleanup).
    pub fn remove_position(&mut self, account: &str, key: &ContractKey) {
        self.positions
            .retain(|p| !(p.account == account && &p.contract_key == key));
    }

    /// Drop flat positions that have not been re-reported within `horizon`.
    pub fn cleanup_flat_positions(&mut self, now: DateTime<Utc>, horizon: Duration) {
        self.positions
            .retain(|p| p.quantity != 0.0 || now - p.observed_at <= horizon);
    }

    // =====================
    // === Subscriptions ===
    // =====================

    /// Record that a market-data stream was requested for `key`.
    pub fn upsert_subscription(&mut self, key: &ContractKey, req_id: i64, now: DateTime<Utc>) {
        let sub = self
            .subscriptions
            .entry(key.clone())
            .or_insert_with(|| Subscription {
                contract_key: key.clone(),
                broker_req_id: None,
                date_requested: now,
                active: false,
                last_tick_at: None,
            });
        sub.broker_req_id = Some(req_id);
        sub.date_requested = now;
        sub.active = true;
    }

    #[must_use]
    /// Look up a subscription.
    pub fn subscription(&self, key: &ContractKey) -> Option<&Subscription> {
        self.subscriptions.get(key)
    }

    /// Mutable access to a subscription.
    pub fn subscription_mut(&mut self, key: &ContractKey) -> Option<&mut Subscription> {
        self.subscriptions.get_mut(key)
    }

    /// Iterate all subscriptions.
    pub fn subscriptions(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.values()
    }

    #[must_use]
    /// The subscription (key and request id) carrying broker request `req_id`.
    pub fn subscription_by_req_id(&self, req_id: i64) -> Option<&Subscription> {
        self.subscriptions
            .values()
            .find(|s| s.broker_req_id == Some(req_id))
    }

    /// Deactivate a subscription (canceled or stale).
    pub fn deactivate_subscription(&mut self, key: &ContractKey) {
        if let Some(sub) = self.subscriptions.get_mut(key) {
            sub.active = false;
            sub.broker_req_id = None;
        }
    }

    // ================
    // === Messages ===
    // ================

    /// Raise (or re-raise) an operator message. An open message for the same trade and code
    /// has its count bumped instead of inserting a new row.
    pub fn raise_message(
        &mut self,
        trade: Option<Uid>,
        code: MessageCode,
        text: &str,
        now: DateTime<Utc>,
    ) -> MessageId {
        let existing = self
            .messages
            .values_mut()
            .find(|m| m.trade == trade && m.code == code && m.status == MessageStatus::Open);
        if let Some(m) = existing {
            m.count += 1;
            m.last_at = now;
            m.text = text.to_owned();
            return m.id;
        }
        self.next_message_id += 1;
        let id = MessageId(self.next_message_id);
        self.messages.insert(
            id,
            TradeMessage {
                id,
                trade,
                text: text.to_owned(),
                code,
                count: 1,
                status: MessageStatus::Open,
                first_at: now,
                last_at: now,
                resolved_at: None,
            },
        );
        id
    }

    #[must_use]
    /// Look up a message.
    pub fn message(&self, id: MessageId) -> Option<&TradeMessage> {
        self.messages.get(&id)
    }

    #[must_use]
    /// Ids of messages still open, in raise order.
    pub fn open_messages(&self) -> Vec<MessageId> {
        self.messages
            .values()
            .filter(|m| m.status == MessageStatus::Open)
            .map(|m| m.id)
            .collect()
    }

    /// Move a message out of the open state.
    pub fn resolve_message(&mut self, id: MessageId, status: MessageStatus, now: DateTime<Utc>) {
        if let Some(m) = self.messages.get_mut(&id) {
            m.status = status;
            m.resolved_at = Some(now);
        }
    }

    // ================
    // === Snapshot ===
    // ================

    /// Write the whole store as a JSON snapshot.
    ///
    /// # Errors
    /// Returns [`Error::Bookkeeping`] when serialization or the write fails.
    pub fn save_snapshot(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string(self)
            .map_err(|e| Error::Bookkeeping(format!("snapshot serialize: {e}")))?;
        std::fs::write(path, json)
            .map_err(|e| Error::Bookkeeping(format!("snapshot write: {e}")))
    }

    /// Load a snapshot written by [`Store::save_snapshot`].
    ///
    /// # Errors
    /// Returns [`Error::Bookkeeping`] when the file is missing or unreadable.
    pub fn load_snapshot(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::Bookkeeping(format!("snapshot read: {e}")))?;
        serde_json::from_str(&json)
            .map_err(|e| Error::Bookkeeping(format!("snapshot parse: {e}")))
    }
}

// ========================
// === The Store Handle ===
// ========================

#[derive(Clone)]
/// Shared access to the store. Every mutation happens inside [`StoreHandle::transact`], which
/// is the engine's transaction boundary: phase code takes one per cycle step, broker callbacks
/// take their own brief ones, and nothing holds it across an await point.
pub struct StoreHandle(Arc<Mutex<Store>>);

impl StoreHandle {
    #[must_use]
    /// Wrap a store for sharing.
    pub fn new(store: Store) -> Self {
        Self(Arc::new(Mutex::new(store)))
    }

    /// Run `f` against the store under the write lock.
    pub fn transact<T>(&self, f: impl FnOnce(&mut Store) -> T) -> T {
        let mut store = self.0.lock().expect("store lock poisoned");
        f(&mut store)
    }
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StoreHandle(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{Exchange, Right, SecOption};
    use crate::execution::Side;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 1, 16, 15, 0, 0).unwrap()
    }

    fn opt_trade(uid: &str) -> Trade {
        Trade {
            uid: Uid::from(uid),
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

    #[test]
    fn total_qty_from_capital() {
        let mut store = Store::new();
        let t = opt_trade("1");
        store.insert_trade(t.clone()).unwrap();
        // $1000 of capital at $1.00 * 100 multiplier = 10 contracts.
        assert_eq!(store.total_qty(&t, 1000.0), Some(10.0));
        // A third of the position, rounded.
        assert_eq!(store.closing_qty(&t, 0, 3, 1000.0), Some(3.0));
        // The final portion takes whatever is left.
        assert_eq!(store.closing_qty(&t, 2, 3, 1000.0), Some(10.0));
    }

    #[test]
    fn total_qty_prefers_opening_orders() {
        let mut store = Store::new();
        let t = opt_trade("1");
        store.insert_trade(t.clone()).unwrap();
        store.create_order(
            Some(t.uid.clone()),
            t.contract_key.clone(),
            Action::Buy,
            7.0,
            Method::Market,
            false,
            now(),
        );
        assert_eq!(store.total_qty(&t, 1000.0), Some(7.0));
    }

    #[test]
    fn left_qty_subtracts_completed_closes() {
        let mut store = Store::new();
        let t = opt_trade("1");
        store.insert_trade(t.clone()).unwrap();
        let id = store.create_order(
            Some(t.uid.clone()),
            t.contract_key.clone(),
            Action::Sell,
            3.0,
            Method::Market,
            false,
            now(),
        );
        store.mark_order_placed(id, 42, now()).unwrap();
        store.mark_order_complete(id, now()).unwrap();
        // 10 total (capital) - 3 sold.
        assert_eq!(store.left_qty(&t, 1000.0), Some(7.0));
    }

    #[test]
    fn order_state_machine_is_enforced() {
        let mut store = Store::new();
        let t = opt_trade("1");
        store.insert_trade(t.clone()).unwrap();
        let id = store.create_order(
            Some(t.uid.clone()),
            t.contract_key.clone(),
            Action::Buy,
            1.0,
            Method::Market,
            false,
            now(),
        );
        assert!(store.advance_order(id, OrderStatus::Complete).is_err());
        store.mark_order_placed(id, 1, now()).unwrap();
        assert!(store.advance_order(id, OrderStatus::Placed).is_err());
        store.mark_order_complete(id, now()).unwrap();
        assert!(store.advance_order(id, OrderStatus::Error).is_err());
    }

    #[test]
    fn locked_while_order_in_flight() {
        let mut store = Store::new();
        let t = opt_trade("1");
        store.insert_trade(t.clone()).unwrap();
        assert!(!store.trade_is_locked(&t.uid));
        let id = store.create_order(
            Some(t.uid.clone()),
            t.contract_key.clone(),
            Action::Buy,
            1.0,
            Method::Market,
            false,
            now(),
        );
        assert!(store.trade_is_locked(&t.uid));
        store.mark_order_placed(id, 1, now()).unwrap();
        assert!(store.trade_is_locked(&t.uid));
        store.mark_order_complete(id, now()).unwrap();
        assert!(!store.trade_is_locked(&t.uid));
    }

    #[test]
    fn duplicate_executions_store_once() {
        let mut store = Store::new();
        let e = Execution::from_report(
            "00018037.1",
            42,
            ContractKey::from("SYM-20190620-151.0-C"),
            Side::Bought,
            10.0,
            1.05,
            1.05,
            10.0,
            now(),
        );
        assert!(store.insert_execution(e.clone()));
        assert!(!store.insert_execution(e));
        assert_eq!(store.execution_count(), 1);
    }

    #[test]
    fn combo_execution_min_across_legs() {
        let mut store = Store::new();
        let combo = Combo {
            symbol: "XYZ".to_owned(),
            exchange: Exchange::Smart,
            legs: vec![
                crate::contract::ComboLeg {
                    sequence: 1,
                    action: Action::Buy,
                    ratio: 1,
                    option: SecOption {
                        symbol: "XYZ".to_owned(),
                        strike: 100.0,
                        right: Right::Put,
                        expiry: chrono::NaiveDate::from_ymd_opt(2018, 12, 31).unwrap(),
                        exchange: Exchange::Smart,
                    },
                },
                crate::contract::ComboLeg {
                    sequence: 2,
                    action: Action::Sell,
                    ratio: 1,
                    option: SecOption {
                        symbol: "XYZ".to_owned(),
                        strike: 100.0,
                        right: Right::Put,
                        expiry: chrono::NaiveDate::from_ymd_opt(2019, 1, 15).unwrap(),
                        exchange: Exchange::Smart,
                    },
                },
            ],
        };
        let contract = Contract::Combo(combo.clone());
        let key = store.register_contract(&contract);

        let mut t = opt_trade("1");
        t.sec_type = SecType::Combo;
        t.contract_key = key.clone();
        store.insert_trade(t.clone()).unwrap();
        store.register_trade_legs(&t.uid, &combo);

        let id = store.create_order(
            Some(t.uid.clone()),
            key,
            Action::Buy,
            5.0,
            Method::Market,
            false,
            now(),
        );
        store.mark_order_placed(id, 42, now()).unwrap();

        let leg1 = combo.legs[0].option_key();
        let leg2 = combo.legs[1].option_key();
        store.insert_execution(Execution::from_report(
            "a1", 42, leg1, Side::Bought, 5.0, 0.5, 0.5, 5.0, now(),
        ));
        // Second leg only partially filled.
        store.insert_execution(Execution::from_report(
            "a2", 42, leg2, Side::Sold, 2.0, 0.3, 0.3, 2.0, now(),
        ));

        let order = store.order(id).unwrap().clone();
        assert_eq!(store.executed_qty(&order), 2.0);
    }

    #[test]
    fn messages_dedupe_by_code() {
        let mut store = Store::new();
        let uid = Uid::from("1");
        let a = store.raise_message(Some(uid.clone()), MessageCode::Pricing, "no ticks", now());
        let b = store.raise_message(Some(uid.clone()), MessageCode::Pricing, "still none", now());
        assert_eq!(a, b);
        assert_eq!(store.message(a).unwrap().count, 2);
        let c = store.raise_message(Some(uid), MessageCode::PegTimeout, "peg", now());
        assert_ne!(a, c);
    }

    #[test]
    fn snapshot_round_trips() {
        let mut store = Store::new();
        store.insert_trade(opt_trade("1")).unwrap();
        store.register_contract(&Contract::stock("SYM"));
        let dir = std::env::temp_dir().join("tradeloop-snapshot-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("store.json");
        store.save_snapshot(&path).unwrap();
        let loaded = Store::load_snapshot(&path).unwrap();
        assert!(loaded.trade(&Uid::from("1")).is_some());
        assert!(loaded.contract(&ContractKey::from("SYM")).is_some());
    }
}
