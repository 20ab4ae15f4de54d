//! End-to-end scenarios: a full engine (supervisor cycles, simulated gateway, in-memory
//! sheet, hand-cranked clock) driven through the lifecycles that matter — entry fills, tiered
//! targets, credit-spread stops, duplicate executions, and orphaned broker positions.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use tradeloop::broker::{BrokerEvent, BrokerGateway};
use tradeloop::calendar::{AlwaysOpen, Clock, ManualClock};
use tradeloop::config::Config;
use tradeloop::contract::ContractKey;
use tradeloop::execution::Side;
use tradeloop::market_data::MarketData;
use tradeloop::message::{MessageCode, Notifier};
use tradeloop::order::OrderStatus;
use tradeloop::sheet::{columns, MemorySheet, SheetGateway};
use tradeloop::sim::SimGateway;
use tradeloop::store::{Store, StoreHandle};
use tradeloop::supervisor::{apply_event, CallbackState, Context, Supervisor};
use tradeloop::trade::{TradeStatus, Uid, STOP_LOSS, TARGET_REACHED};

/// A notifier that remembers what it sent.
#[derive(Debug, Default)]
struct RecordingNotifier(std::sync::Mutex<Vec<(String, String)>>);

impl Notifier for RecordingNotifier {
    fn notify(&self, subject: &str, body: &str) {
        self.0
            .lock()
            .expect("notifier lock")
            .push((subject.to_owned(), body.to_owned()));
    }
}

impl RecordingNotifier {
    fn subjects(&self) -> Vec<String> {
        self.0
            .lock()
            .expect("notifier lock")
            .iter()
            .map(|(s, _)| s.clone())
            .collect()
    }
}

struct Harness {
    ctx: Context,
    state: Arc<CallbackState>,
    supervisor: Supervisor,
    gateway: Arc<SimGateway>,
    sheet: Arc<MemorySheet>,
    clock: Arc<ManualClock>,
    notifier: Arc<RecordingNotifier>,
    events: tokio::sync::mpsc::UnboundedReceiver<BrokerEvent>,
}

fn start_time() -> DateTime<Utc> {
    // Monday 2019-06-03, 11:00 ET.
    Utc.with_ymd_and_hms(2019, 6, 3, 15, 0, 0).unwrap()
}

impl Harness {
    fn new() -> Self {
        let cfg = Config {
            account_id: "DU1".to_owned(),
            // Background chasing off: tests drive peg steps directly.
            peg_step_secs: 0,
            ..Config::default()
        };
        let (gateway, events) = SimGateway::new();
        let sheet = Arc::new(MemorySheet::new());
        let clock = Arc::new(ManualClock::new(start_time()));
        let notifier = Arc::new(RecordingNotifier::default());
        let ctx = Context {
            cfg,
            store: StoreHandle::new(Store::new()),
            md: Arc::new(MarketData::new()),
            gateway: gateway.clone(),
            sheet: sheet.clone(),
            notifier: notifier.clone(),
            clock: clock.clone(),
            calendar: Arc::new(AlwaysOpen),
        };
        let state = Arc::new(CallbackState::default());
        let supervisor = Supervisor::new(ctx.clone(), state.clone(), CancellationToken::new());
        Self {
            ctx,
            state,
            supervisor,
            gateway,
            sheet,
            clock,
            notifier,
            events,
        }
    }

    /// Apply everything the gateway pushed back, in arrival order.
    fn drain(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            apply_event(&self.ctx, &self.state, event);
        }
    }

    fn cycle(&mut self) {
        self.supervisor.cycle().expect("cycle should not fail");
        self.drain();
    }

    fn tick(&mut self, key: &ContractKey, bid: f64, ask: f64) {
        self.gateway.tick(key, bid, ask);
        self.drain();
    }

    fn advance(&self, secs: i64) {
        self.clock.advance(Duration::seconds(secs));
    }

    /// Refresh the scripted broker position and push the portfolio snapshot through.
    fn report_position(&mut self, key: &ContractKey, qty: f64, price: f64) {
        self.gateway.set_position("DU1", key, qty, price);
        self.gateway
            .req_account_updates("DU1")
            .expect("sim account updates");
        self.drain();
    }

    fn seed_option_intent(&self) {
        self.sheet.push_row(&[
            (columns::TYPE, "Swing"),
            (columns::SYMBOL, "SYM"),
            (columns::POSITION_SIZE, "1"),
            (columns::TACTIC, "JUN 20 $151C"),
            (columns::UNDERLYING_ENTRY, "150"),
            (columns::STOP, "149.98, 149.00"),
            (columns::TARGET, "152.20, 153.50, 154.50"),
            (columns::DATE_ENTERED, "06/03/2019 09:45"),
            (columns::FORMULA_FIRST, "=I2*J2"),
        ]);
    }

    fn the_uid(&self) -> Uid {
        let cell = self.sheet.cell(2, columns::UID);
        assert!(!cell.is_empty(), "uid should have been assigned on ingest");
        Uid(cell)
    }

    fn trade_status(&self, uid: &Uid) -> TradeStatus {
        self.ctx
            .store
            .transact(|s| s.trade(uid).map(|t| t.status))
            .expect("trade exists")
    }

    fn request_id_of_last_placed(&self) -> i64 {
        self.gateway
            .placed_orders()
            .last()
            .expect("an order was placed")
            .req_id
    }
}

fn opt_key() -> ContractKey {
    ContractKey::from("SYM-20190620-151.0-C")
}

fn und_key() -> ContractKey {
    ContractKey::from("SYM")
}

#[test]
fn new_long_option_entry_fill_lands_on_sheet() {
    let mut h = Harness::new();
    h.seed_option_intent();

    // Cycle 1: the row is claimed (uid assigned, entry price cleared) and both the option and
    // its underlying get market-data subscriptions.
    h.cycle();
    let uid = h.the_uid();
    assert_eq!(h.sheet.cell(2, columns::ENTRY_PRICE), "");
    assert_eq!(h.trade_status(&uid), TradeStatus::PreOpenCheck);
    assert!(h.gateway.subscription_for(&und_key()).is_some());
    assert!(h.gateway.subscription_for(&opt_key()).is_some());

    // Prices arrive: underlying at entry, option mid at 1.00.
    h.tick(&und_key(), 149.9, 150.1);
    h.tick(&opt_key(), 0.95, 1.05);

    // Cycle 2: pre-open passes, the opening order goes out for round(1000/100) = 10.
    h.advance(5);
    h.cycle();
    assert_eq!(h.trade_status(&uid), TradeStatus::Open);
    let placed = h.gateway.placed_orders();
    assert_eq!(placed.len(), 1);
    assert_eq!(placed[0].order.qty, 10.0);
    assert_eq!(placed[0].order.order_type, "MKT");
    let req_id = placed[0].req_id;

    // The buy fills at 1.05.
    h.gateway
        .fill("00018037.1", req_id, &opt_key(), Side::Bought, 10.0, 1.05, 10.0, h.clock.now());
    h.drain();

    // Cycle 3: the reconciler completes the order and registers the entry price on the sheet.
    h.advance(5);
    h.cycle();
    assert_eq!(h.sheet.cell(2, columns::ENTRY_PRICE), "1.05");
    let entry = h
        .ctx
        .store
        .transact(|s| s.trade(&uid).and_then(|t| t.entry_price));
    assert_eq!(entry, Some(1.05));
    let complete = h.ctx.store.transact(|s| s.orders_with_status(OrderStatus::Complete));
    assert_eq!(complete.len(), 1);
}

#[test]
fn three_targets_split_the_position_and_percentages_sum_to_100() {
    let mut h = Harness::new();
    h.seed_option_intent();
    h.cycle();
    let uid = h.the_uid();

    // Enter: mid 1.00, fill 10 at 1.05.
    h.tick(&und_key(), 149.9, 150.1);
    h.tick(&opt_key(), 0.95, 1.05);
    h.advance(5);
    h.cycle();
    let open_req = h.request_id_of_last_placed();
    h.gateway
        .fill("open.1", open_req, &opt_key(), Side::Bought, 10.0, 1.05, 10.0, h.clock.now());
    h.drain();
    h.advance(5);
    h.cycle();

    // Target 1 (152.20): SELL round(10/3) = 3, partial row at 33%.
    h.advance(70);
    h.report_position(&opt_key(), 10.0, 1.30);
    h.tick(&und_key(), 152.20, 152.30);
    h.tick(&opt_key(), 1.25, 1.35);
    h.cycle();
    let req1 = h.request_id_of_last_placed();
    let placed = h.gateway.placed_orders();
    assert_eq!(placed.last().unwrap().order.qty, 3.0);
    h.gateway
        .fill("t1.1", req1, &opt_key(), Side::Sold, 3.0, 1.30, 3.0, h.clock.now());
    h.drain();
    h.advance(5);
    h.cycle();
    assert_eq!(h.sheet.len(), 3, "partial close inserts a sibling row");
    assert_eq!(h.sheet.cell(3, columns::PCT_SOLD), "33%");
    assert_eq!(h.sheet.cell(3, columns::NOTES), TARGET_REACHED);
    assert_eq!(h.sheet.cell(3, columns::FORMULA_FIRST), "=I3*J3");

    // Target 2 (153.50): another 3 at 33%.
    h.advance(70);
    h.report_position(&opt_key(), 7.0, 1.60);
    h.tick(&und_key(), 153.55, 153.65);
    h.tick(&opt_key(), 1.55, 1.65);
    h.cycle();
    let req2 = h.request_id_of_last_placed();
    assert_eq!(h.gateway.placed_orders().last().unwrap().order.qty, 3.0);
    h.gateway
        .fill("t2.1", req2, &opt_key(), Side::Sold, 3.0, 1.60, 3.0, h.clock.now());
    h.drain();
    h.advance(5);
    h.cycle();

    // Target 3 (154.50): the final order takes what is left (4) and the original row records
    // the remaining percentage.
    h.advance(70);
    h.report_position(&opt_key(), 4.0, 1.90);
    h.tick(&und_key(), 154.55, 154.65);
    h.tick(&opt_key(), 1.85, 1.95);
    h.cycle();
    let req3 = h.request_id_of_last_placed();
    assert_eq!(h.gateway.placed_orders().last().unwrap().order.qty, 4.0);
    h.gateway
        .fill("t3.1", req3, &opt_key(), Side::Sold, 4.0, 1.90, 4.0, h.clock.now());
    h.drain();
    h.advance(5);
    h.cycle();

    assert_eq!(h.trade_status(&uid), TradeStatus::Closed);
    // Sibling percentages: 33 + 33 + 34 = 100.
    let mut pcts = 0i64;
    for row in 2..=4 {
        let cell = h.sheet.cell(row, columns::PCT_SOLD);
        pcts += cell.trim_end_matches('%').parse::<i64>().unwrap_or(0);
    }
    assert!((99..=101).contains(&pcts), "sibling percentages sum to ~100, got {pcts}");
}

#[test]
fn credit_spread_stop_sells_what_is_left_as_a_loss() {
    let mut h = Harness::new();
    // A two-legged put spread entered for a 0.50 credit; profits as the underlying falls.
    h.sheet.push_row(&[
        (columns::TYPE, "Spread"),
        (columns::SYMBOL, "XYZ"),
        (columns::POSITION_SIZE, "1"),
        (columns::TACTIC, "BOT DEC31 2019 $100P x1/SLD JAN15 2020 $100P x1"),
        (columns::UNDERLYING_ENTRY, "150"),
        (columns::STOP, "155"),
        (columns::TARGET, "140"),
        (columns::ENTRY_PRICE, "-0.50"),
        (columns::DATE_ENTERED, "06/03/2019 09:45"),
    ]);
    let bag_key = ContractKey::from("XYZ/BAG/BUY/1-SELL/1");
    let leg1 = ContractKey::from("XYZ-20191231-100.0-P");
    let leg2 = ContractKey::from("XYZ-20200115-100.0-P");
    let und = ContractKey::from("XYZ");

    // Cycle 1 ingests and resolves the legs (the sim hands out ids immediately); cycle 2
    // brings up the spread and leg subscriptions.
    h.cycle();
    let uid = h.the_uid();
    // The combo is long to the broker even though it was entered for a credit.
    let size = h.ctx.store.transact(|s| s.trade(&uid).map(|t| t.size));
    assert_eq!(size, Some(1.0));
    h.cycle();
    assert!(h.gateway.subscription_for(&bag_key).is_some());
    assert!(h.gateway.subscription_for(&leg1).is_some());

    // Prices arrive; the engine opens the spread (BUY, total = round(1000/(0.50*100)) = 20).
    h.tick(&und, 149.9, 150.1);
    h.tick(&leg1, 1.18, 1.22);
    h.tick(&leg2, 0.70, 0.74);
    h.advance(5);
    h.cycle();
    assert_eq!(h.trade_status(&uid), TradeStatus::Open);
    let open = h.gateway.placed_orders();
    let open = open.last().expect("opening order placed");
    assert_eq!(open.order.action.code(), "BUY");
    assert_eq!(open.order.qty, 20.0);
    h.gateway
        .fill("o1.1", open.req_id, &leg1, Side::Bought, 20.0, 1.20, 20.0, h.clock.now());
    h.gateway
        .fill("o1.2", open.req_id, &leg2, Side::Sold, 20.0, 0.72, 20.0, h.clock.now());
    h.drain();
    h.advance(5);
    h.cycle();
    // Entry is the signed sum of the legs: 1.20 - 0.72.
    assert_eq!(
        h.ctx.store.transact(|s| s.trade(&uid).and_then(|t| t.entry_price)),
        Some(0.48)
    );

    // Underlying rips through the stop; the spread now marks at 1.00 - 0.20 = 0.80.
    h.advance(70);
    h.report_position(&bag_key, 20.0, 0.80);
    h.tick(&und, 155.45, 155.55);
    h.tick(&leg1, 0.98, 1.02);
    h.tick(&leg2, 0.18, 0.22);
    h.cycle();

    let placed = h.gateway.placed_orders();
    let last = placed.last().expect("stop order placed");
    assert_eq!(last.order.action.code(), "SELL");
    // One stop configured, so everything left goes.
    assert_eq!(last.order.qty, 20.0);

    // Both legs fill.
    let req = last.req_id;
    h.gateway
        .fill("s1.1", req, &leg1, Side::Sold, 20.0, 1.00, 20.0, h.clock.now());
    h.gateway
        .fill("s1.2", req, &leg2, Side::Bought, 20.0, 0.20, 20.0, h.clock.now());
    h.drain();
    h.advance(5);
    h.cycle();

    assert_eq!(h.trade_status(&uid), TradeStatus::Closed);
    // Buying the spread back above the credit collected is the losing direction.
    assert_eq!(h.sheet.cell(2, columns::NOTES), STOP_LOSS);
}

#[test]
fn duplicate_execution_deliveries_change_nothing() {
    let mut h = Harness::new();
    h.seed_option_intent();
    h.cycle();
    let uid = h.the_uid();
    h.tick(&und_key(), 149.9, 150.1);
    h.tick(&opt_key(), 0.95, 1.05);
    h.advance(5);
    h.cycle();
    let req = h.request_id_of_last_placed();

    // The same execution arrives three times (a replay after reconnect).
    for _ in 0..3 {
        h.gateway
            .fill("dup.1", req, &opt_key(), Side::Bought, 10.0, 1.05, 10.0, h.clock.now());
    }
    h.drain();
    h.advance(5);
    h.cycle();

    let execs = h.ctx.store.transact(|s| s.execution_count());
    assert_eq!(execs, 1, "duplicate exec_ids store once");
    assert_eq!(
        h.ctx.store.transact(|s| s.trade(&uid).and_then(|t| t.entry_price)),
        Some(1.05)
    );
    // Still exactly one completed order; the replays did not re-open or re-close anything.
    assert_eq!(
        h.ctx.store.transact(|s| s.orders_with_status(OrderStatus::Complete).len()),
        1
    );
}

#[test]
fn orphan_position_is_flattened_and_reported() {
    let mut h = Harness::new();

    // The broker says we hold 100 AAPL; the sheet knows nothing about it.
    h.ctx.store.transact(|s| {
        s.register_contract(&tradeloop::contract::Contract::stock("AAPL"));
    });
    let aapl = ContractKey::from("AAPL");
    h.report_position(&aapl, 100.0, 170.0);

    // Cycle 1: housekeeping emits the excluded flatten; cycle 2 places it.
    h.cycle();
    h.cycle();
    let placed = h.gateway.placed_orders();
    let flatten = placed.last().expect("flatten order placed");
    assert_eq!(flatten.order.action.code(), "SELL");
    assert_eq!(flatten.order.qty, 100.0);
    let is_excluded = h.ctx.store.transact(|s| {
        s.order_by_request_id(flatten.req_id).map(|o| o.exclude)
    });
    assert_eq!(is_excluded, Some(true));

    // It fills; the broker book goes flat, the operator hears about it, and no further
    // flattens go out.
    h.gateway.set_position("DU1", &aapl, 0.0, 170.0);
    h.gateway
        .fill("orph.1", flatten.req_id, &aapl, Side::Sold, 100.0, 170.0, 100.0, h.clock.now());
    h.drain();
    h.advance(5);
    h.cycle();
    h.cycle();

    let remaining = h
        .ctx
        .store
        .transact(|s| s.position("DU1", &aapl).map(|p| p.quantity));
    assert!(matches!(remaining, None | Some(0.0)));
    assert!(h
        .notifier
        .subjects()
        .iter()
        .any(|s| s.contains("Orphaned position")));
    assert_eq!(h.gateway.placed_orders().len(), placed.len(), "no re-flatten");
}

#[test]
fn unreadable_tactic_flags_the_row_and_recovers_after_an_edit() {
    let mut h = Harness::new();
    h.sheet.push_row(&[
        (columns::TYPE, "Swing"),
        (columns::SYMBOL, "SYM"),
        (columns::POSITION_SIZE, "1"),
        (columns::TACTIC, "NOT A TACTIC"),
        (columns::UNDERLYING_ENTRY, "150"),
        (columns::TARGET, "152.20"),
        (columns::DATE_ENTERED, "06/03/2019 09:45"),
    ]);

    h.cycle();
    let uid = h.the_uid();
    assert_eq!(h.trade_status(&uid), TradeStatus::Error);
    // The tactic cell was painted red and the parse message raised.
    assert!(h
        .sheet
        .highlights()
        .iter()
        .any(|(r, c, _)| *r == 2 && *c == columns::TACTIC));
    let raised = h.ctx.store.transact(|s| {
        s.open_messages()
            .iter()
            .filter_map(|id| s.message(*id))
            .any(|m| m.code == MessageCode::TacticParse)
    });
    // The supervisor's message phase resolves and notifies within the same cycle.
    let notified = h
        .notifier
        .subjects()
        .iter()
        .any(|s| s.contains("99995"));
    assert!(raised || notified);

    // The data-entry team fixes the cell; the next cycle revives the trade.
    h.sheet
        .update_cell(2, columns::TACTIC, "JUN 20 $151C")
        .unwrap();
    h.advance(30);
    h.cycle();
    assert_eq!(h.trade_status(&uid), TradeStatus::PreOpenCheck);
}
