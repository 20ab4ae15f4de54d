//! The brokerage gateway boundary.
//!
//! The engine never speaks the broker's wire protocol; it consumes this trait and a stream of
//! [`BrokerEvent`]s. Requests are fire-and-forget sends (the shape of the upstream EClient
//! surface) and every response arrives on the event channel, which a long-lived consumer task
//! drains into the store.

use chrono::{DateTime, Utc};

use crate::contract::{BrokerContractId, Contract, ContractKey};
use crate::error::Error;
use crate::execution::Side;
use crate::order::{Action, Order, TimeInForce};

// ========================
// === Request Surface ===
// ========================

#[derive(Debug, Clone, PartialEq)]
/// The wire form of an order: what actually leaves for the broker. Built from a store
/// [`Order`]; pegged orders leave as plain limits.
pub struct BrokerOrder {
    /// Buy or sell.
    pub action: Action,
    /// Total (positive) quantity.
    pub qty: f64,
    /// `"MKT"` or `"LMT"`.
    pub order_type: &'static str,
    /// The limit price, for limit orders.
    pub limit_price: Option<f64>,
    /// How long the order stays working.
    pub time_in_force: TimeInForce,
    /// Whether the order may trigger or fill outside regular trading hours.
    pub outside_rth: bool,
}

impl BrokerOrder {
    #[must_use]
    /// The wire form of a store order.
    pub fn from_order(order: &Order, outside_rth: bool) -> Self {
        Self {
            action: order.action,
            qty: order.qty.abs(),
            order_type: order.method.code(),
            limit_price: order.method.limit_price(),
            time_in_force: order.time_in_force,
            outside_rth,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
/// Criteria for an execution-report request. An empty filter returns everything the broker
/// still has for the session.
pub struct ExecutionFilter {
    /// Restrict to one account.
    pub account: Option<String>,
    /// Restrict to executions at or after this instant.
    pub since: Option<DateTime<Utc>>,
}

/// The operations the engine performs against the brokerage. One connection, owned by the
/// supervisor; all methods are cheap sends and must never block on the market.
pub trait BrokerGateway: Send + Sync {
    /// Establish (or re-establish) the connection.
    ///
    /// # Errors
    /// Returns [`Error::Broker`] when the transport cannot be brought up.
    fn connect(&self) -> Result<(), Error>;

    /// The next request id. Ids are engine-global: market data, contract details, and orders
    /// all draw from the same sequence.
    fn next_id(&self) -> i64;

    /// Start streaming market data for `contract` under `req_id`.
    ///
    /// # Errors
    /// Returns [`Error::Broker`] when the request cannot be sent.
    fn req_market_data(&self, req_id: i64, contract: &Contract) -> Result<(), Error>;

    /// Stop a market-data stream.
    ///
    /// # Errors
    /// Returns [`Error::Broker`] when the request cannot be sent.
    fn cancel_market_data(&self, req_id: i64) -> Result<(), Error>;

    /// Ask for contract details (the engine only consumes the broker contract id).
    ///
    /// # Errors
    /// Returns [`Error::Broker`] when the request cannot be sent.
    fn req_contract_details(&self, req_id: i64, contract: &Contract) -> Result<(), Error>;

    /// Place an order.
    ///
    /// # Errors
    /// Returns [`Error::Broker`] when the request cannot be sent.
    fn place_order(
        &self,
        req_id: i64,
        contract: &Contract,
        order: &BrokerOrder,
    ) -> Result<(), Error>;

    /// Cancel a working order.
    ///
    /// # Errors
    /// Returns [`Error::Broker`] when the request cannot be sent.
    fn cancel_order(&self, req_id: i64) -> Result<(), Error>;

    /// Request execution reports matching `filter`.
    ///
    /// # Errors
    /// Returns [`Error::Broker`] when the request cannot be sent.
    fn req_executions(&self, req_id: i64, filter: &ExecutionFilter) -> Result<(), Error>;

    /// Subscribe to account value and portfolio updates for `account`.
    ///
    /// # Errors
    /// Returns [`Error::Broker`] when the request cannot be sent.
    fn req_account_updates(&self, account: &str) -> Result<(), Error>;

    /// Request a one-shot position snapshot across accounts.
    ///
    /// # Errors
    /// Returns [`Error::Broker`] when the request cannot be sent.
    fn req_positions(&self) -> Result<(), Error>;
}

// ======================
// === Event Surface ===
// ======================

#[derive(Debug, Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
/// The price tick kinds the engine consumes.
pub enum TickKind {
    /// Best bid.
    Bid,
    /// Best ask.
    Ask,
    /// Previous session's close.
    Close,
}

#[derive(Debug, Clone, PartialEq)]
/// A raw execution report as delivered by the broker, before the store normalizes it.
pub struct ExecReport {
    /// The execution id, possibly carrying a correction suffix.
    pub exec_id: String,
    /// The request id of the order that produced it.
    pub order_request_id: i64,
    /// The shape that traded. For combo orders the broker reports per leg.
    pub contract_key: ContractKey,
    /// Bought or sold.
    pub side: Side,
    /// Contracts traded in this report.
    pub shares: f64,
    /// This report's price.
    pub price: f64,
    /// Average price for the order so far.
    pub avg_price: f64,
    /// Cumulative quantity for the order so far.
    pub cum_qty: f64,
    /// When the execution occurred.
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
/// Everything the broker pushes back at the engine. Delivered on a single channel in arrival
/// order; the consumer task applies each in its own short store transaction.
pub enum BrokerEvent {
    /// The first usable order id after connect.
    NextValidId {
        /// The id.
        order_id: i64,
    },
    /// A price tick on a market-data subscription.
    TickPrice {
        /// The subscription's request id.
        req_id: i64,
        /// Bid, ask, or close.
        kind: TickKind,
        /// The price. Negative values mean "no quote" upstream and are dropped.
        price: f64,
    },
    /// Contract details for a details request; the engine keeps only the broker id.
    ContractDetails {
        /// The originating request id.
        req_id: i64,
        /// The broker's contract id.
        contract_id: BrokerContractId,
    },
    /// All details for a request were delivered.
    ContractDetailsEnd {
        /// The originating request id.
        req_id: i64,
    },
    /// One execution report.
    ExecDetails {
        /// The originating request id (or the order's own id for unsolicited reports).
        req_id: i64,
        /// The report.
        report: ExecReport,
    },
    /// All execution reports for a request were delivered.
    ExecDetailsEnd {
        /// The originating request id.
        req_id: i64,
    },
    /// A portfolio row from the account-update stream.
    UpdatePortfolio {
        /// The shape held.
        contract_key: ContractKey,
        /// Signed position quantity.
        position: f64,
        /// The broker's mark for the contract.
        market_price: f64,
        /// The holding account.
        account: String,
    },
    /// A row from a one-shot position snapshot.
    Position {
        /// The shape held.
        contract_key: ContractKey,
        /// Signed position quantity.
        position: f64,
        /// The holding account.
        account: String,
    },
    /// The account-update snapshot is complete; positions are consistent as of now.
    AccountDownloadEnd {
        /// The account whose download finished.
        account: String,
    },
    /// An error surfaced by the broker, tied to a request when `req_id >= 0`.
    Error {
        /// The offending request, or -1 for connection-level faults.
        req_id: i64,
        /// The broker's numeric code.
        code: i64,
        /// Human-readable description.
        message: String,
    },
}
