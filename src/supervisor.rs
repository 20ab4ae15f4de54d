//! The supervisor: one periodic control loop that runs every phase in strict order during
//! market hours (plus a grace tail after the close), a long-lived consumer task that drains
//! broker callbacks into the store, and the sheet-ingest phase that turns rows into trades.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerEvent, BrokerGateway, ExecutionFilter};
use crate::calendar::{Clock, MarketCalendar};
use crate::config::Config;
use crate::contract::{Contract, ContractKey, SecType};
use crate::error::{Error, Result};
use crate::evaluator;
use crate::execution::Execution;
use crate::market_data::{self, MarketData, PRICE_RETENTION};
use crate::message::{MessageCode, MessageStatus, Notifier};
use crate::order::{Method, OrderId, OrderStatus};
use crate::order_manager;
use crate::reconcile;
use crate::sheet::{columns, Color, IntentRow, SheetGateway};
use crate::store::{Store, StoreHandle};
use crate::tactic;
use crate::trade::{Trade, TradeStatus, Uid};

/// Rows without a uid whose entered date is older than this are dead intents, never picked up.
const UNREGISTERED_INTENT_HORIZON: Duration = Duration::days(2);
/// Contract-resolution attempts per leg before the trade is flagged unresolvable.
const MAX_RESOLUTION_ATTEMPTS: u32 = 3;
/// Flat position rows are dropped after this long without a re-report.
const FLAT_POSITION_HORIZON: Duration = Duration::minutes(10);

// ==========================
// === Injected Context ===
// ==========================

#[derive(Clone)]
/// Every handle the engine's components need, owned by the supervisor and passed explicitly.
/// Nothing in the engine reaches for a global.
pub struct Context {
    /// Engine configuration.
    pub cfg: Config,
    /// The shared store.
    pub store: StoreHandle,
    /// The shared quote book.
    pub md: Arc<MarketData>,
    /// The single broker connection.
    pub gateway: Arc<dyn BrokerGateway>,
    /// The intent sheet.
    pub sheet: Arc<dyn SheetGateway>,
    /// The operator channel.
    pub notifier: Arc<dyn Notifier>,
    /// The (possibly virtual) wall clock.
    pub clock: Arc<dyn Clock>,
    /// The market session calendar.
    pub calendar: Arc<dyn MarketCalendar>,
}

#[derive(Debug, Default)]
/// Transient routing state shared between the supervisor (which issues requests) and the
/// callback consumer (which resolves them): contract-details request ids and the one-shot
/// flatten-on-start flag.
pub struct CallbackState {
    details: Mutex<HashMap<i64, ContractKey>>,
    first_download_done: AtomicBool,
}

impl CallbackState {
    fn note_details_request(&self, req_id: i64, key: ContractKey) {
        self.details
            .lock()
            .expect("callback state lock poisoned")
            .insert(req_id, key);
    }

    fn details_key(&self, req_id: i64) -> Option<ContractKey> {
        self.details
            .lock()
            .expect("callback state lock poisoned")
            .get(&req_id)
            .cloned()
    }

    fn finish_details_request(&self, req_id: i64) {
        self.details
            .lock()
            .expect("callback state lock poisoned")
            .remove(&req_id);
    }
}

// ==========================
// === Callback Consumer ===
// ==========================

/// Apply a single broker event to engine state, in its own brief transaction. The consumer
/// task calls this in arrival order; tests call it directly.
pub fn apply_event(ctx: &Context, state: &CallbackState, event: BrokerEvent) {
    let now = ctx.clock.now();
    match event {
        BrokerEvent::NextValidId { order_id } => {
            debug!(order_id, "broker connection live");
            if let Err(e) = ctx.gateway.req_account_updates(&ctx.cfg.account_id) {
                error!(%e, "account-updates subscription failed");
            }
            let _ = ctx.gateway.req_executions(
                ctx.gateway.next_id(),
                &ExecutionFilter::default(),
            );
        }
        BrokerEvent::TickPrice { req_id, kind, price } => {
            ctx.store.transact(|s| {
                let Some(key) = s.subscription_by_req_id(req_id).map(|sub| sub.contract_key.clone())
                else {
                    return;
                };
                ctx.md.on_tick(s, &key, kind, price, now);
            });
        }
        BrokerEvent::ContractDetails { req_id, contract_id } => {
            if let Some(key) = state.details_key(req_id) {
                ctx.store.transact(|s| s.set_broker_contract_id(&key, contract_id));
                debug!(%key, id = contract_id.0, "contract resolved");
            }
        }
        BrokerEvent::ContractDetailsEnd { req_id } => {
            state.finish_details_request(req_id);
        }
        BrokerEvent::ExecDetails { report, .. } => {
            ctx.store.transact(|s| {
                let exec = Execution::from_report(
                    &report.exec_id,
                    report.order_request_id,
                    report.contract_key.clone(),
                    report.side,
                    report.shares,
                    report.price,
                    report.avg_price,
                    report.cum_qty,
                    report.time,
                );
                if s.insert_execution(exec) {
                    debug!(exec_id = %report.exec_id, "execution stored");
                }
            });
        }
        BrokerEvent::ExecDetailsEnd { .. } => {}
        BrokerEvent::UpdatePortfolio {
            contract_key,
            position,
            market_price,
            account,
        } => {
            ctx.store.transact(|s| {
                s.upsert_position(&account, &contract_key, position, market_price, now);
            });
        }
        BrokerEvent::Position {
            contract_key,
            position,
            account,
        } => {
            ctx.store.transact(|s| {
                s.upsert_position(&account, &contract_key, position, 0.0, now);
            });
        }
        BrokerEvent::AccountDownloadEnd { account } => {
            debug!(%account, "portfolio snapshot complete");
            if ctx.cfg.close_open_positions_on_start
                && !state.first_download_done.swap(true, Ordering::SeqCst)
            {
                flatten_everything(ctx, &account, now);
            }
        }
        BrokerEvent::Error { req_id, code, message } => {
            warn!(req_id, code, %message, "broker error");
            ctx.store.transact(|s| {
                let Some(order_id) = s.order_by_request_id(req_id).map(|o| o.id) else {
                    return;
                };
                let trade = s.order(order_id).and_then(|o| o.trade.clone());
                if s.advance_order(order_id, OrderStatus::Error).is_ok() {
                    s.raise_message(
                        trade,
                        MessageCode::PegTimeout,
                        &format!("broker rejected order (code {code}): {message}"),
                        now,
                    );
                }
            });
        }
    }
}

/// Flatten every nonzero broker position with excluded market orders. A deliberate,
/// configuration-gated cold-start behavior.
fn flatten_everything(ctx: &Context, account: &str, now: DateTime<Utc>) {
    warn!(%account, "flattening all broker positions on start");
    ctx.store.transact(|s| {
        let rows: Vec<(ContractKey, f64)> = s
            .positions()
            .filter(|p| p.account == account && p.quantity != 0.0)
            .map(|p| (p.contract_key.clone(), p.quantity))
            .collect();
        for (key, qty) in rows {
            let action = if qty > 0.0 {
                crate::order::Action::Sell
            } else {
                crate::order::Action::Buy
            };
            s.create_order(None, key, action, qty.abs(), Method::Market, true, now);
        }
    });
}

/// Spawn the long-lived consumer that drains the broker event channel until shutdown.
pub fn spawn_event_consumer(
    ctx: Context,
    state: Arc<CallbackState>,
    mut events: tokio::sync::mpsc::UnboundedReceiver<BrokerEvent>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => return,
                event = events.recv() => {
                    match event {
                        Some(event) => apply_event(&ctx, &state, event),
                        None => return,
                    }
                }
            }
        }
    })
}

// ======================
// === The Supervisor ===
// ======================

/// The ordered control loop. Owns the broker connection, the chaser tasks, and the cycle
/// failure budget.
pub struct Supervisor {
    ctx: Context,
    state: Arc<CallbackState>,
    shutdown: CancellationToken,
    chasers: HashMap<OrderId, JoinHandle<()>>,
    consecutive_failures: u32,
}

impl Supervisor {
    #[must_use]
    /// Build a supervisor over an assembled context.
    pub fn new(ctx: Context, state: Arc<CallbackState>, shutdown: CancellationToken) -> Self {
        Self {
            ctx,
            state,
            shutdown,
            chasers: HashMap::new(),
            consecutive_failures: 0,
        }
    }

    /// Connect to the broker and run cycles until the market closes (plus the grace tail) or
    /// the failure budget is spent.
    ///
    /// # Errors
    /// Returns the connect error if the broker cannot be reached at startup.
    pub async fn run(&mut self) -> Result<()> {
        self.ctx.gateway.connect()?;
        let interval = std::time::Duration::from_secs(self.ctx.cfg.eval_interval_secs.max(1));
        loop {
            let now = self.ctx.clock.now();
            let in_session = self
                .ctx
                .calendar
                .is_rth_or_tail(now, Duration::seconds(self.ctx.cfg.after_close_grace_secs));
            if !in_session && !self.ctx.cfg.trade_after_hours {
                info!("market closed; supervisor exiting");
                break;
            }

            match self.cycle() {
                Ok(()) => self.consecutive_failures = 0,
                Err(e) => {
                    self.consecutive_failures += 1;
                    error!(
                        failures = self.consecutive_failures,
                        %e,
                        "supervisor cycle failed"
                    );
                    if self.consecutive_failures >= self.ctx.cfg.max_cycle_failures {
                        self.ctx.notifier.notify(
                            "Trade engine stopped",
                            &format!(
                                "The supervisor terminated after {} consecutive cycle failures. \
                                 Last error: {e}",
                                self.consecutive_failures
                            ),
                        );
                        self.shutdown.cancel();
                        return Err(e);
                    }
                }
            }

            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = tokio::time::sleep(interval) => {}
            }
        }
        self.shutdown.cancel();
        Ok(())
    }

    /// One pass over every phase, in the order the data flows. Effects of phase *k* are
    /// visible to phase *k+1*; the first failing phase aborts the cycle.
    ///
    /// # Errors
    /// Propagates the first phase failure; the run loop counts it.
    pub fn cycle(&mut self) -> Result<()> {
        let now = self.ctx.clock.now();
        let rth = self.ctx.calendar.is_rth(now);

        self.ingest_sheet(now)?;
        self.resolve_leg_ids(now)?;
        self.ctx.store.transact(|s| {
            market_data::sync_subscriptions(s, self.ctx.gateway.as_ref(), now)
        })?;
        self.ctx.store.transact(|s| {
            evaluator::pre_open_check(s, &self.ctx.md, self.ctx.sheet.as_ref(), &self.ctx.cfg, now);
        });
        self.ensure_peg_chasers();
        if rth || self.ctx.cfg.trade_after_hours {
            self.ctx.store.transact(|s| {
                evaluator::evaluate_trades(s, &self.ctx.md, &self.ctx.cfg, now);
            });
            self.ctx.store.transact(|s| {
                order_manager::place_ready_orders(
                    s,
                    self.ctx.gateway.as_ref(),
                    self.ctx.sheet.as_ref(),
                    self.ctx.notifier.as_ref(),
                    &self.ctx.md,
                    &self.ctx.cfg,
                    rth,
                    now,
                );
            });
        }
        self.request_executions()?;
        self.ctx.store.transact(|s| {
            reconcile::reconcile_fills(
                s,
                self.ctx.sheet.as_ref(),
                self.ctx.notifier.as_ref(),
                &self.ctx.cfg,
                now,
            );
        });
        self.process_messages(now);
        self.housekeeping(rth, now);

        if let Some(path) = self.ctx.cfg.store_path.clone() {
            if let Err(e) = self.ctx.store.transact(|s| s.save_snapshot(&path)) {
                warn!(%e, "store snapshot failed");
            }
        }
        Ok(())
    }

    // =====================
    // === Sheet Ingest ===
    // =====================

    fn ingest_sheet(&self, now: DateTime<Utc>) -> Result<()> {
        let rows = self
            .ctx
            .sheet
            .rows()
            .map_err(|e| Error::SheetWrite(e.to_string()))?;
        let mut minted: HashSet<String> = HashSet::new();

        for (i, cells) in rows.iter().enumerate() {
            let row_idx = i + 2;
            let intent = IntentRow::from_cells(row_idx, cells);
            if !intent.is_live_intent() {
                continue;
            }
            match intent.uid.clone() {
                None => self.ingest_new_intent(&intent, &mut minted, now),
                Some(uid) => self.ingest_known_intent(&uid, &intent, now),
            }
        }
        Ok(())
    }

    fn ingest_new_intent(&self, intent: &IntentRow, minted: &mut HashSet<String>, now: DateTime<Utc>) {
        if intent
            .date_entered
            .is_some_and(|d| now - d > UNREGISTERED_INTENT_HORIZON)
        {
            debug!(row = intent.row_idx, "ignoring old unregistered intent");
            return;
        }

        // Mint a unique uid; two rows landing in the same millisecond still diverge.
        let mut uid = Uid::at(now);
        while minted.contains(uid.as_str())
            || self.ctx.store.transact(|s| s.trade(&uid).is_some())
        {
            uid = Uid(format!("{}{}", uid.as_str(), minted.len() + 1));
        }
        minted.insert(uid.as_str().to_owned());

        // Claim the row immediately: clear the entry price, write the uid. Later writes find
        // the row by uid even if the sheet shifts underneath us.
        if let Err(e) = self
            .ctx
            .sheet
            .update_cell(intent.row_idx, columns::ENTRY_PRICE, "")
            .and_then(|()| {
                self.ctx
                    .sheet
                    .update_cell(intent.row_idx, columns::UID, uid.as_str())
            })
        {
            error!(row = intent.row_idx, %e, "could not claim intent row");
            return;
        }

        match tactic::parse(&intent.symbol, &intent.tactic, now.date_naive()) {
            Ok(contract) => {
                let trade = self.build_trade(&uid, intent, &contract, true);
                self.ctx.store.transact(|s| {
                    register_trade_contracts(s, &trade.uid, &contract);
                    if let Err(e) = s.insert_trade(trade) {
                        error!(%uid, %e, "trade insert failed");
                    }
                });
                info!(%uid, symbol = %intent.symbol, "new trade ingested");
            }
            Err(parse_err) => {
                warn!(%uid, tactic = %intent.tactic, %parse_err, "tactic unreadable");
                let _ = self
                    .ctx
                    .sheet
                    .highlight_cell(intent.row_idx, columns::TACTIC, Color::Red);
                self.ctx.store.transact(|s| {
                    let mut trade = self.build_trade(
                        &uid,
                        intent,
                        &Contract::stock(&intent.symbol),
                        true,
                    );
                    trade.status = TradeStatus::Error;
                    if let Err(e) = s.insert_trade(trade) {
                        error!(%uid, %e, "trade insert failed");
                    }
                    s.raise_message(
                        Some(uid.clone()),
                        MessageCode::TacticParse,
                        &format!("tactic unreadable: {parse_err}"),
                        now,
                    );
                });
            }
        }
    }

    fn ingest_known_intent(&self, uid: &Uid, intent: &IntentRow, now: DateTime<Utc>) {
        let known = self.ctx.store.transact(|s| s.trade(uid).cloned());
        match known {
            Some(existing) => {
                // Locked trades are not updated from the sheet mid-flight.
                if self.ctx.store.transact(|s| s.trade_is_locked(uid)) {
                    return;
                }
                let fixed_tactic = existing.status == TradeStatus::Error
                    && existing.tactic != intent.tactic;
                self.ctx.store.transact(|s| {
                    let Some(t) = s.trade_mut(uid) else { return };
                    t.alert_category = intent.alert_category.clone();
                    t.underlying_entry_price = intent.underlying_entry;
                    t.target_prices = intent.targets;
                    t.stop_prices = intent.stops;
                    t.row_idx = Some(intent.row_idx);
                    if intent.pct_sold > t.pct_sold {
                        t.pct_sold = intent.pct_sold;
                    }
                    if let Some(exited) = intent.date_exited {
                        // The data-entry team closed it by hand.
                        t.date_exited = Some(exited);
                        t.status = TradeStatus::Closed;
                    }
                });
                if fixed_tactic {
                    self.retry_fixed_tactic(uid, intent, now);
                }
            }
            None => {
                // A uid we do not know: a fresh process without its snapshot. Re-adopt.
                match tactic::parse(&intent.symbol, &intent.tactic, now.date_naive()) {
                    Ok(contract) => {
                        let trade = self.build_trade(uid, intent, &contract, false);
                        self.ctx.store.transact(|s| {
                            register_trade_contracts(s, &trade.uid, &contract);
                            if let Err(e) = s.insert_trade(trade) {
                                error!(%uid, %e, "trade re-adopt failed");
                            }
                        });
                        info!(%uid, symbol = %intent.symbol, "existing trade re-adopted");
                    }
                    Err(parse_err) => {
                        warn!(%uid, %parse_err, "unreadable tactic on known row");
                    }
                }
            }
        }
    }

    /// A previously unreadable tactic was edited: re-parse, and on success bring the trade
    /// back to life.
    fn retry_fixed_tactic(&self, uid: &Uid, intent: &IntentRow, now: DateTime<Utc>) {
        match tactic::parse(&intent.symbol, &intent.tactic, now.date_naive()) {
            Ok(contract) => {
                let _ = self
                    .ctx
                    .sheet
                    .highlight_cell(intent.row_idx, columns::TACTIC, Color::White);
                self.ctx.store.transact(|s| {
                    register_trade_contracts(s, uid, &contract);
                    if let Some(t) = s.trade_mut(uid) {
                        t.tactic = intent.tactic.clone();
                        t.sec_type = contract.sec_type();
                        t.contract_key = contract.key();
                        t.underlying_key = underlying_key_for(&contract);
                        t.status = TradeStatus::PreOpenCheck;
                        t.fail_count = 0;
                    }
                    for id in s.open_messages() {
                        let matches = s
                            .message(id)
                            .is_some_and(|m| {
                                m.trade.as_ref() == Some(uid)
                                    && m.code == MessageCode::TacticParse
                            });
                        if matches {
                            s.resolve_message(id, MessageStatus::Resolved, now);
                        }
                    }
                });
                info!(%uid, "tactic fixed; trade revalidated");
            }
            Err(e) => {
                debug!(%uid, %e, "edited tactic still unreadable");
                self.ctx.store.transact(|s| {
                    if let Some(t) = s.trade_mut(uid) {
                        t.tactic = intent.tactic.clone();
                    }
                    s.raise_message(
                        Some(uid.clone()),
                        MessageCode::TacticParse,
                        &format!("tactic unreadable: {e}"),
                        now,
                    );
                });
            }
        }
    }

    fn build_trade(
        &self,
        uid: &Uid,
        intent: &IntentRow,
        contract: &Contract,
        fresh: bool,
    ) -> Trade {
        let mut size = intent.size.unwrap_or(1.0);
        if size == 0.0 {
            size = 1.0;
        }
        // Shorts are entered on the sheet as a negative entry price. A negative entry on a
        // combo means a credit, not a short: the broker always holds combos long.
        if intent.entry_price.unwrap_or(0.0) < 0.0 && contract.sec_type() != SecType::Combo {
            size = -size.abs();
        }
        Trade {
            uid: uid.clone(),
            symbol: intent.symbol.clone(),
            alert_category: intent.alert_category.clone(),
            size,
            tactic: intent.tactic.clone(),
            sec_type: contract.sec_type(),
            contract_key: contract.key(),
            underlying_key: underlying_key_for(contract),
            underlying_entry_price: intent.underlying_entry,
            original_entry_price: intent.entry_price,
            entry_price: if fresh {
                None
            } else {
                intent.entry_price.map(f64::abs)
            },
            exit_price: intent.exit_price,
            target_prices: intent.targets,
            stop_prices: intent.stops,
            date_entered: intent.date_entered,
            date_exited: intent.date_exited,
            pct_sold: intent.pct_sold,
            status: TradeStatus::PreOpenCheck,
            parent: None,
            row_idx: Some(intent.row_idx),
            last_order_at: None,
            fail_count: 0,
            resolution_attempts: 0,
        }
    }

    // ==========================
    // === Contract Resolution ===
    // ==========================

    fn resolve_leg_ids(&self, now: DateTime<Utc>) -> Result<()> {
        let keys = self
            .ctx
            .store
            .transact(|s| s.unresolved_leg_keys(MAX_RESOLUTION_ATTEMPTS));
        for key in keys {
            let Some(contract) = self
                .ctx
                .store
                .transact(|s| s.contract(&key).map(|c| c.contract.clone()))
            else {
                continue;
            };
            let req_id = self.ctx.gateway.next_id();
            self.state.note_details_request(req_id, key.clone());
            self.ctx.gateway.req_contract_details(req_id, &contract)?;
            self.ctx.store.transact(|s| s.note_leg_requested(&key, now));
            debug!(%key, req_id, "requested contract details");
        }

        let exhausted = self
            .ctx
            .store
            .transact(|s| s.exhausted_legs(MAX_RESOLUTION_ATTEMPTS));
        for (uid, key, attempts) in exhausted {
            warn!(%uid, %key, attempts, "leg unresolvable; demoting trade");
            self.ctx.store.transact(|s| {
                s.demote_trade(
                    &uid,
                    MessageCode::EntryOutOfBand,
                    &format!("contract {key} unresolved after {attempts} attempts"),
                    now,
                );
            });
        }
        Ok(())
    }

    // ====================
    // === Peg Chasers ===
    // ====================

    /// Make sure every live pegged order has its chaser task (restarts included). A step
    /// interval of zero disables background chasing; tests drive the step function directly.
    fn ensure_peg_chasers(&mut self) {
        self.chasers.retain(|_, handle| !handle.is_finished());
        if self.ctx.cfg.peg_step_secs == 0 {
            return;
        }
        let pegged: Vec<OrderId> = self.ctx.store.transact(|s| {
            s.orders_with_status(OrderStatus::Placed)
                .into_iter()
                .filter(|id| {
                    s.order(*id)
                        .is_some_and(|o| matches!(o.method, Method::PegMid { .. }))
                })
                .collect()
        });
        for id in pegged {
            if self.chasers.contains_key(&id) {
                continue;
            }
            debug!(order = %id, "starting peg chaser");
            let handle = tokio::spawn(order_manager::run_peg_chaser(
                self.ctx.store.clone(),
                self.ctx.md.clone(),
                self.ctx.gateway.clone(),
                self.ctx.clock.clone(),
                self.ctx.calendar.clone(),
                self.ctx.cfg.clone(),
                id,
                self.shutdown.clone(),
            ));
            self.chasers.insert(id, handle);
        }
    }

    // ===========================
    // === Executions / Messages ===
    // ===========================

    fn request_executions(&self) -> Result<()> {
        self.ctx.gateway.req_executions(
            self.ctx.gateway.next_id(),
            &ExecutionFilter {
                account: (!self.ctx.cfg.account_id.is_empty())
                    .then(|| self.ctx.cfg.account_id.clone()),
                since: None,
            },
        )?;
        // Keep the portfolio picture current for the reachability and orphan checks.
        self.ctx.gateway.req_account_updates(&self.ctx.cfg.account_id)?;
        Ok(())
    }

    /// Elevate open messages to the operator and mark them resolved. Re-raised conditions
    /// come back as fresh messages with a bumped count.
    fn process_messages(&self, now: DateTime<Utc>) {
        let open = self.ctx.store.transact(|s| {
            s.open_messages()
                .into_iter()
                .filter_map(|id| s.message(id).cloned())
                .collect::<Vec<_>>()
        });
        for message in open {
            if message.code.notifies() {
                let subject = match &message.trade {
                    Some(uid) => format!(
                        "Trade engine {}: {}",
                        message.code.number(),
                        self.ctx
                            .store
                            .transact(|s| s.trade(uid).map(|t| t.symbol.clone()))
                            .unwrap_or_else(|| uid.to_string())
                    ),
                    None => format!("Trade engine {}", message.code.number()),
                };
                let body = if message.count > 1 {
                    format!("{} (seen {} times)", message.text, message.count)
                } else {
                    message.text.clone()
                };
                self.ctx.notifier.notify(&subject, &body);
            }
            self.ctx
                .store
                .transact(|s| s.resolve_message(message.id, MessageStatus::Resolved, now));
        }
    }

    // ====================
    // === Housekeeping ===
    // ====================

    fn housekeeping(&self, rth: bool, now: DateTime<Utc>) {
        self.ctx.store.transact(|s| {
            s.expire_prices(now, PRICE_RETENTION);
            s.cleanup_flat_positions(now, FLAT_POSITION_HORIZON);
            reconcile::check_orphans(s, now);
            reconcile::sync_position_drift(s, &self.ctx.cfg, now);
            order_manager::timeout_pending_orders(
                s,
                self.ctx.gateway.as_ref(),
                &self.ctx.cfg,
                rth,
                now,
            );
            market_data::flag_silent_subscriptions(s, self.ctx.sheet.as_ref(), now);
        });
        self.close_expired_contracts(now);
    }

    /// Open option/combo trades whose (earliest) expiry has passed can no longer be traded
    /// out; close their sheet rows at the last known price.
    fn close_expired_contracts(&self, now: DateTime<Utc>) {
        let today = now.date_naive();
        let expired: Vec<(Uid, f64)> = self.ctx.store.transact(|s| {
            s.active_trade_uids()
                .into_iter()
                .filter_map(|uid| {
                    let t = s.trade(&uid)?;
                    if t.status != TradeStatus::Open || t.entry_price.is_none() {
                        return None;
                    }
                    let expiry = s.contract(&t.contract_key)?.contract.earliest_expiry()?;
                    if expiry >= today {
                        return None;
                    }
                    let price = s.latest_price(&t.contract_key).map_or(0.0, |p| p.mid);
                    Some((uid, price))
                })
                .collect()
        });
        for (uid, price) in expired {
            warn!(%uid, "contract expired; closing out");
            self.ctx.store.transact(|s| {
                reconcile::force_sheet_close(
                    s,
                    self.ctx.sheet.as_ref(),
                    self.ctx.notifier.as_ref(),
                    &uid,
                    price,
                    now,
                );
            });
        }
    }
}

// ===============
// === Helpers ===
// ===============

fn underlying_key_for(contract: &Contract) -> ContractKey {
    match contract.sec_type() {
        SecType::Stock | SecType::Cash => contract.key(),
        SecType::SecOption | SecType::Combo => Contract::stock(contract.symbol()).key(),
    }
}

/// Register the tradable shape, the underlying stock (for derivatives), and combo legs.
fn register_trade_contracts(store: &mut Store, uid: &Uid, contract: &Contract) {
    store.register_contract(contract);
    if matches!(contract.sec_type(), SecType::SecOption | SecType::Combo) {
        store.register_contract(&Contract::stock(contract.symbol()));
    }
    if let Contract::Combo(combo) = contract {
        store.register_trade_legs(uid, combo);
    }
}
